//! Publish synthetic frames
//!
//! Run with: cargo run --example publish_test -- rtmp://localhost/live test_key
//!
//! Sends an AAC and an AVC sequence header followed by ten seconds of
//! placeholder frames at 25 fps video and ~43 fps audio. The payloads are
//! not decodable; the point is exercising the publish path.

use std::time::Duration;

use bytes::Bytes;
use rtmp_client::amf::AmfObject;
use rtmp_client::{ClientConfig, Codec, MediaFrame, PublishType, RtmpConnection};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtmp_client=debug".parse()?)
                .add_directive("publish_test=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: publish_test <rtmp_url> <stream_name>");
        eprintln!("Example: publish_test rtmp://localhost/live test_key");
        std::process::exit(1);
    }

    let (connection, _status) = RtmpConnection::connect(ClientConfig::new(&args[1])).await?;
    let stream = connection.create_stream().await?;
    stream.publish(&args[2], PublishType::Live).await?;
    println!("Publishing {}", args[2]);

    stream.send_metadata(AmfObject::from([
        ("width", 1280.0),
        ("height", 720.0),
        ("framerate", 25.0),
        ("videocodecid", 7.0),
        ("audiocodecid", 10.0),
    ]))?;

    let frames = stream.frame_sender();
    // AudioSpecificConfig: AAC LC, 44.1 kHz, stereo
    frames.send_frame(MediaFrame::sequence_header(Codec::Aac, Bytes::from_static(&[0x12, 0x10])))?;
    frames.send_frame(MediaFrame::sequence_header(
        Codec::Avc,
        Bytes::from_static(&[0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x00, 0x01, 0x00, 0x00]),
    ))?;

    // Encoder callbacks run on their own thread
    let encoder = std::thread::spawn(move || {
        let start = std::time::Instant::now();
        let mut next_audio = 0u32;
        let mut next_video = 0u32;
        // A full queue drops the frame; the dropped count shows up in the stats
        let send = |frame| match frames.send_frame(frame) {
            Err(rtmp_client::Error::QueueFull) => Ok(()),
            other => other,
        };
        while next_video < 10_000 {
            if next_audio <= next_video {
                send(MediaFrame::audio(Codec::Aac, next_audio, Bytes::from_static(&[0u8; 32])))?;
                next_audio += 23;
            } else {
                let keyframe = next_video % 2000 == 0;
                send(MediaFrame::video(
                    Codec::Avc,
                    next_video,
                    Bytes::from(vec![0u8; if keyframe { 4096 } else { 512 }]),
                    keyframe,
                ))?;
                next_video += 40;
            }
            let due = Duration::from_millis(next_audio.min(next_video) as u64);
            if let Some(wait) = due.checked_sub(start.elapsed()) {
                std::thread::sleep(wait);
            }
        }
        Ok::<_, rtmp_client::Error>(())
    });

    let result = tokio::task::spawn_blocking(move || encoder.join()).await?;
    if let Ok(Err(e)) = result {
        eprintln!("Encoder stopped: {e}");
    }

    let stats = connection.stats();
    println!(
        "Sent {} video and {} audio frames, {} bytes, {} dropped",
        stats.video_frames_sent, stats.audio_frames_sent, stats.bytes_sent, stats.dropped_frames
    );

    stream.close().await;
    connection.close().await;
    Ok(())
}
