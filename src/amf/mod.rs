//! AMF (Action Message Format) implementation
//!
//! AMF0 is Adobe's binary serialization format used in RTMP for encoding
//! command parameters and metadata. The client speaks AMF0 only and
//! advertises `objectEncoding = 0` when connecting.

pub mod amf0;
pub mod value;

pub use amf0::{Amf0Decoder, Amf0Encoder};
pub use value::{AmfObject, AmfValue};
