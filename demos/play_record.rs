//! Play a stream and record it to FLV
//!
//! Run with: cargo run --example play_record -- rtmp://localhost/live test_key output.flv
//!
//! Stops on Ctrl+C or when the server ends the stream.

use std::sync::Arc;

use rtmp_client::{ClientConfig, FlvRecorder, RtmpConnection, StreamEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtmp_client=info".parse()?)
                .add_directive("play_record=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 4 {
        eprintln!("Usage: play_record <rtmp_url> <stream_name> <output.flv>");
        eprintln!("Example: play_record rtmp://localhost/live test_key recording.flv");
        std::process::exit(1);
    }

    let (connection, mut status) = RtmpConnection::connect(ClientConfig::new(&args[1])).await?;
    tokio::spawn(async move {
        while let Some(event) = status.recv().await {
            println!("[{}] {} {}", event.level, event.code, event.description);
        }
    });

    let recorder = Arc::new(FlvRecorder::open(&args[3])?);
    let mut stream = connection.create_stream().await?;
    stream.record_to(&recorder)?;
    stream.play(&args[2]).await?;
    println!("Playing {} into {}", args[2], recorder.path().display());

    let mut video_frames = 0u64;
    let mut audio_frames = 0u64;
    loop {
        tokio::select! {
            event = stream.next_event() => match event {
                Some(StreamEvent::Media(frame)) => {
                    match frame.kind() {
                        rtmp_client::MediaKind::Audio => audio_frames += 1,
                        rtmp_client::MediaKind::Video => video_frames += 1,
                    }
                    if frame.keyframe && !frame.sequence_header {
                        println!("  Keyframe at {} ms", frame.timestamp);
                    }
                }
                Some(StreamEvent::Data(data)) => {
                    // onMetaData carries an ECMA array of stream properties
                    if let Some(props) = data.values.iter().find(|v| v.as_object().is_some()) {
                        println!(
                            "{}: {:?}x{:?} @ {:?} fps",
                            data.name,
                            props.get_number("width"),
                            props.get_number("height"),
                            props.get_number("framerate"),
                        );
                    }
                }
                Some(StreamEvent::Status(status)) => println!("Stream: {}", status.code),
                Some(StreamEvent::Eof) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted");
                break;
            }
        }
    }

    stream.close().await;
    connection.close().await;
    recorder.close()?;

    println!(
        "Recorded {} tags ({} video, {} audio frames)",
        recorder.tags_written(),
        video_frames,
        audio_frames
    );
    Ok(())
}
