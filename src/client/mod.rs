//! RTMP client
//!
//! [`RtmpConnection`] owns one NetConnection; [`RtmpStream`] is a NetStream
//! on it, used either to publish or to play.

pub mod auth;
pub mod config;
pub mod connection;
pub mod event;
pub mod session;
pub mod stream;
pub mod transaction;

#[cfg(test)]
mod test_server;

pub use auth::{AdobeAuth, AuthDecision};
pub use config::{ClientConfig, ParsedUrl};
pub use connection::RtmpConnection;
pub use event::{StatusEvent, StreamEvent};
pub use session::ConnectionState;
pub use stream::{FrameSender, PublishType, RtmpStream, StreamMode};
