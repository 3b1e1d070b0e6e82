//! rtmp-client: RTMP publish and play client
//!
//! This library provides the client side of RTMP:
//! - Simple handshake, chunk stream multiplexing, AMF0 commands
//! - Publishing encoded audio/video frames with per-media timestamps
//! - Playing a remote stream, with pause/resume and FLV recording
//! - Adobe `authmod=adobe` authentication
//!
//! # Example: Publish
//!
//! ```no_run
//! use bytes::Bytes;
//! use rtmp_client::{ClientConfig, Codec, MediaFrame, PublishType, RtmpConnection};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("rtmp://localhost/live");
//!     let (connection, _events) = RtmpConnection::connect(config).await?;
//!
//!     let stream = connection.create_stream().await?;
//!     stream.publish("test", PublishType::Live).await?;
//!
//!     let frames = stream.frame_sender();
//!     frames.send_frame(MediaFrame::video(Codec::Avc, 0, Bytes::from_static(&[0x65]), true))?;
//!
//!     stream.close().await;
//!     connection.close().await;
//!     Ok(())
//! }
//! ```

pub mod amf;
pub mod client;
pub mod cursor;
pub mod error;
pub mod media;
pub mod protocol;
pub mod stats;

// Re-export main types for convenience
pub use client::{
    ClientConfig, FrameSender, PublishType, RtmpConnection, RtmpStream, StatusEvent, StreamEvent,
};
pub use error::{Error, Result};
pub use media::{Codec, FlvRecorder, MediaFrame, MediaKind};
pub use stats::SessionStats;
