//! Media handling for RTMP
//!
//! This module provides:
//! - Codec capability lookup and FLV audio/video tag headers
//! - FLV file layout
//! - An FLV recorder that streams can write to

pub mod codec;
pub mod flv;
pub mod recorder;

pub use codec::{Codec, CodecCapability, MediaFrame, MediaKind, VideoFrameType};
pub use flv::{FlvTag, FlvTagType};
pub use recorder::FlvRecorder;
