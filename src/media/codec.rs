//! Codec capability lookup and FLV audio/video tag headers
//!
//! Every RTMP audio or video message starts with the FLV tag header of its
//! codec:
//!
//! ```text
//! Audio: SoundFormat(4) SoundRate(2) SoundSize(1) SoundType(1) [AACPacketType(8)]
//! Video: FrameType(4) CodecID(4) [AVCPacketType(8) CompositionTime(24)]
//! ```
//!
//! The encoder hands over bare codec payloads; [`MediaFrame::to_tag_body`]
//! prepends the header and [`MediaFrame::from_tag_body`] strips it again on
//! the way in. What each codec needs is looked up in one table via
//! [`Codec::capability`] instead of being spread across per-codec types.

use bytes::{BufMut, Bytes, BytesMut};

use crate::cursor::{BufMutExt, ByteReader};
use crate::error::{Error, ProtocolError, Result};

/// Audio or video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Codecs that can appear in RTMP audio/video messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// Linear PCM, platform endian
    LinearPcm,
    Adpcm,
    Mp3,
    /// Linear PCM, little endian
    LinearPcmLe,
    Nellymoser16kMono,
    Nellymoser8kMono,
    Nellymoser,
    G711ALaw,
    G711MuLaw,
    Aac,
    Speex,
    Mp38k,
    SorensonH263,
    ScreenVideo,
    Vp6,
    Vp6Alpha,
    ScreenVideoV2,
    /// H.264
    Avc,
}

/// What the client needs to know to put a codec on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecCapability {
    /// The client can publish and unpack this codec
    pub supported: bool,
    /// Bytes of FLV tag header in front of the codec payload
    pub header_size: usize,
    /// Leading byte of the tag header. For video only the codec id nibble
    /// is fixed; the frame type is OR-ed in per frame.
    pub prefix: u8,
}

const fn cap(supported: bool, header_size: usize, prefix: u8) -> CodecCapability {
    CodecCapability {
        supported,
        header_size,
        prefix,
    }
}

impl Codec {
    /// Look a codec up by its FLV codec id
    pub fn from_id(kind: MediaKind, id: u8) -> Option<Self> {
        let codec = match (kind, id) {
            (MediaKind::Audio, 0) => Codec::LinearPcm,
            (MediaKind::Audio, 1) => Codec::Adpcm,
            (MediaKind::Audio, 2) => Codec::Mp3,
            (MediaKind::Audio, 3) => Codec::LinearPcmLe,
            (MediaKind::Audio, 4) => Codec::Nellymoser16kMono,
            (MediaKind::Audio, 5) => Codec::Nellymoser8kMono,
            (MediaKind::Audio, 6) => Codec::Nellymoser,
            (MediaKind::Audio, 7) => Codec::G711ALaw,
            (MediaKind::Audio, 8) => Codec::G711MuLaw,
            (MediaKind::Audio, 10) => Codec::Aac,
            (MediaKind::Audio, 11) => Codec::Speex,
            (MediaKind::Audio, 14) => Codec::Mp38k,
            (MediaKind::Video, 2) => Codec::SorensonH263,
            (MediaKind::Video, 3) => Codec::ScreenVideo,
            (MediaKind::Video, 4) => Codec::Vp6,
            (MediaKind::Video, 5) => Codec::Vp6Alpha,
            (MediaKind::Video, 6) => Codec::ScreenVideoV2,
            (MediaKind::Video, 7) => Codec::Avc,
            _ => return None,
        };
        Some(codec)
    }

    /// Codec id of an audio (upper nibble) or video (lower nibble) tag byte
    pub fn from_tag_byte(kind: MediaKind, byte: u8) -> Option<Self> {
        match kind {
            MediaKind::Audio => Self::from_id(kind, byte >> 4),
            MediaKind::Video => Self::from_id(kind, byte & 0x0F),
        }
    }

    /// FLV codec id
    pub fn id(self) -> u8 {
        match self {
            Codec::LinearPcm => 0,
            Codec::Adpcm => 1,
            Codec::Mp3 => 2,
            Codec::LinearPcmLe => 3,
            Codec::Nellymoser16kMono => 4,
            Codec::Nellymoser8kMono => 5,
            Codec::Nellymoser => 6,
            Codec::G711ALaw => 7,
            Codec::G711MuLaw => 8,
            Codec::Aac => 10,
            Codec::Speex => 11,
            Codec::Mp38k => 14,
            Codec::SorensonH263 => 2,
            Codec::ScreenVideo => 3,
            Codec::Vp6 => 4,
            Codec::Vp6Alpha => 5,
            Codec::ScreenVideoV2 => 6,
            Codec::Avc => 7,
        }
    }

    pub fn kind(self) -> MediaKind {
        match self {
            Codec::SorensonH263
            | Codec::ScreenVideo
            | Codec::Vp6
            | Codec::Vp6Alpha
            | Codec::ScreenVideoV2
            | Codec::Avc => MediaKind::Video,
            _ => MediaKind::Audio,
        }
    }

    /// Capability record for this codec
    ///
    /// Audio prefixes carry the rate/size/channel bits the format mandates or,
    /// where it does not, 44.1 kHz 16-bit stereo.
    pub fn capability(self) -> CodecCapability {
        match self {
            Codec::LinearPcm => cap(true, 1, 0x0F),
            Codec::Adpcm => cap(false, 1, 0x1F),
            Codec::Mp3 => cap(true, 1, 0x2F),
            Codec::LinearPcmLe => cap(true, 1, 0x3F),
            Codec::Nellymoser16kMono => cap(true, 1, 0x42),
            Codec::Nellymoser8kMono => cap(true, 1, 0x52),
            Codec::Nellymoser => cap(true, 1, 0x6E),
            Codec::G711ALaw => cap(true, 1, 0x72),
            Codec::G711MuLaw => cap(true, 1, 0x82),
            Codec::Aac => cap(true, 2, 0xAF),
            Codec::Speex => cap(true, 1, 0xB2),
            Codec::Mp38k => cap(true, 1, 0xE2),
            Codec::SorensonH263 => cap(true, 1, 0x02),
            Codec::ScreenVideo => cap(true, 1, 0x03),
            // VP6 carries a one byte size adjustment after the prefix
            Codec::Vp6 => cap(true, 2, 0x04),
            Codec::Vp6Alpha => cap(false, 5, 0x05),
            Codec::ScreenVideoV2 => cap(false, 1, 0x06),
            Codec::Avc => cap(true, 5, 0x07),
        }
    }
}

/// Video frame type (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    /// Keyframe (for AVC, a seekable frame)
    Keyframe = 1,
    /// Inter frame (for AVC, a non-seekable frame)
    InterFrame = 2,
    /// Disposable inter frame (H.263 only)
    DisposableInterFrame = 3,
    /// Generated keyframe (reserved for server use)
    GeneratedKeyframe = 4,
    /// Video info/command frame
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            3 => Some(VideoFrameType::DisposableInterFrame),
            4 => Some(VideoFrameType::GeneratedKeyframe),
            5 => Some(VideoFrameType::VideoInfoFrame),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, VideoFrameType::Keyframe | VideoFrameType::GeneratedKeyframe)
    }
}

/// One encoded audio or video frame, without its FLV tag header
///
/// This is the unit exchanged with the encoder when publishing and with the
/// consumer when playing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub codec: Codec,
    /// Presentation timestamp in milliseconds
    pub timestamp: u32,
    /// Encoded payload
    pub payload: Bytes,
    pub keyframe: bool,
    /// Decoder configuration (AVCDecoderConfigurationRecord,
    /// AudioSpecificConfig) rather than a frame
    pub sequence_header: bool,
    /// AVC composition time offset in milliseconds
    pub composition_time: i32,
}

impl MediaFrame {
    /// An audio frame
    pub fn audio(codec: Codec, timestamp: u32, payload: Bytes) -> Self {
        Self {
            codec,
            timestamp,
            payload,
            keyframe: false,
            sequence_header: false,
            composition_time: 0,
        }
    }

    /// A video frame
    pub fn video(codec: Codec, timestamp: u32, payload: Bytes, keyframe: bool) -> Self {
        Self {
            codec,
            timestamp,
            payload,
            keyframe,
            sequence_header: false,
            composition_time: 0,
        }
    }

    /// Decoder configuration for AAC or AVC
    pub fn sequence_header(codec: Codec, payload: Bytes) -> Self {
        Self {
            codec,
            timestamp: 0,
            payload,
            keyframe: codec.kind() == MediaKind::Video,
            sequence_header: true,
            composition_time: 0,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.codec.kind()
    }

    /// Prepend the FLV tag header for this frame's codec
    pub fn to_tag_body(&self) -> Result<Bytes> {
        let capability = self.codec.capability();
        if !capability.supported {
            return Err(Error::UnsupportedCodec(format!("{:?}", self.codec)));
        }

        let mut buf = BytesMut::with_capacity(capability.header_size + self.payload.len());
        match self.kind() {
            MediaKind::Audio => {
                buf.put_u8(capability.prefix);
                if self.codec == Codec::Aac {
                    buf.put_u8(if self.sequence_header { 0 } else { 1 });
                }
            }
            MediaKind::Video => {
                let frame_type = if self.keyframe {
                    VideoFrameType::Keyframe
                } else {
                    VideoFrameType::InterFrame
                };
                buf.put_u8(((frame_type as u8) << 4) | capability.prefix);
                match self.codec {
                    Codec::Avc => {
                        buf.put_u8(if self.sequence_header { 0 } else { 1 });
                        buf.put_u24(self.composition_time as u32);
                    }
                    // No size adjustment
                    Codec::Vp6 => buf.put_u8(0),
                    _ => {}
                }
            }
        }
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Strip the FLV tag header from an inbound audio/video message
    pub fn from_tag_body(kind: MediaKind, timestamp: u32, body: Bytes) -> Result<Self> {
        let what = match kind {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        };
        let mut reader = ByteReader::new(&body);
        let first = reader.read_u8().ok_or(ProtocolError::Truncated(what))?;
        let codec = Codec::from_tag_byte(kind, first)
            .ok_or_else(|| Error::UnsupportedCodec(format!("{what} codec byte 0x{first:02x}")))?;
        let capability = codec.capability();
        if !capability.supported {
            return Err(Error::UnsupportedCodec(format!("{codec:?}")));
        }

        let mut frame = MediaFrame {
            codec,
            timestamp,
            payload: Bytes::new(),
            keyframe: kind == MediaKind::Video
                && VideoFrameType::from_byte(first).is_some_and(|t| t.is_keyframe()),
            sequence_header: false,
            composition_time: 0,
        };

        match codec {
            Codec::Aac => {
                let packet_type = reader.read_u8().ok_or(ProtocolError::Truncated(what))?;
                frame.sequence_header = packet_type == 0;
            }
            Codec::Avc => {
                let packet_type = reader.read_u8().ok_or(ProtocolError::Truncated(what))?;
                let cts = reader.read_u24().ok_or(ProtocolError::Truncated(what))?;
                frame.sequence_header = packet_type == 0;
                // Sign-extend the 24-bit offset
                frame.composition_time = ((cts << 8) as i32) >> 8;
            }
            Codec::Vp6 => {
                reader.read_u8().ok_or(ProtocolError::Truncated(what))?;
            }
            _ => {}
        }

        frame.payload = body.slice(reader.position()..);
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_lookup() {
        let aac = Codec::from_id(MediaKind::Audio, 10).unwrap();
        assert_eq!(aac, Codec::Aac);
        assert_eq!(aac.capability(), cap(true, 2, 0xAF));

        let avc = Codec::from_id(MediaKind::Video, 7).unwrap();
        assert_eq!(avc.capability().header_size, 5);
        assert_eq!(avc.kind(), MediaKind::Video);

        assert!(!Codec::Vp6Alpha.capability().supported);
        assert_eq!(Codec::from_id(MediaKind::Audio, 9), None);
        assert_eq!(Codec::from_id(MediaKind::Video, 12), None);
    }

    #[test]
    fn test_ids_round_trip_through_lookup() {
        for kind in [MediaKind::Audio, MediaKind::Video] {
            for id in 0..16 {
                if let Some(codec) = Codec::from_id(kind, id) {
                    assert_eq!(codec.id(), id);
                    assert_eq!(codec.kind(), kind);
                    // The codec id is part of the fixed prefix
                    let prefix = codec.capability().prefix;
                    let prefix_id = match kind {
                        MediaKind::Audio => prefix >> 4,
                        MediaKind::Video => prefix & 0x0F,
                    };
                    assert_eq!(prefix_id, id);
                }
            }
        }
    }

    #[test]
    fn test_video_frame_type() {
        // Keyframe + AVC
        assert_eq!(VideoFrameType::from_byte(0x17), Some(VideoFrameType::Keyframe));
        assert_eq!(Codec::from_tag_byte(MediaKind::Video, 0x17), Some(Codec::Avc));

        // Inter frame + AVC
        assert_eq!(VideoFrameType::from_byte(0x27), Some(VideoFrameType::InterFrame));
    }

    #[test]
    fn test_avc_tag_header() {
        let config = MediaFrame::sequence_header(Codec::Avc, Bytes::from_static(&[1, 2, 3]));
        assert_eq!(&config.to_tag_body().unwrap()[..], &[0x17, 0x00, 0, 0, 0, 1, 2, 3]);

        let mut frame = MediaFrame::video(Codec::Avc, 40, Bytes::from_static(&[9]), false);
        frame.composition_time = 80;
        assert_eq!(&frame.to_tag_body().unwrap()[..], &[0x27, 0x01, 0, 0, 80, 9]);
    }

    #[test]
    fn test_aac_tag_header() {
        let config = MediaFrame::sequence_header(Codec::Aac, Bytes::from_static(&[0x12, 0x10]));
        assert_eq!(&config.to_tag_body().unwrap()[..], &[0xAF, 0x00, 0x12, 0x10]);

        let frame = MediaFrame::audio(Codec::Aac, 23, Bytes::from_static(&[0x21]));
        assert_eq!(&frame.to_tag_body().unwrap()[..], &[0xAF, 0x01, 0x21]);

        let mp3 = MediaFrame::audio(Codec::Mp3, 0, Bytes::from_static(&[0xFF]));
        assert_eq!(&mp3.to_tag_body().unwrap()[..], &[0x2F, 0xFF]);
    }

    #[test]
    fn test_unpack_inbound() {
        let body = Bytes::from_static(&[0x17, 0x01, 0xFF, 0xFF, 0xF6, 0xAA, 0xBB]);
        let frame = MediaFrame::from_tag_body(MediaKind::Video, 100, body).unwrap();
        assert_eq!(frame.codec, Codec::Avc);
        assert!(frame.keyframe);
        assert!(!frame.sequence_header);
        assert_eq!(frame.composition_time, -10);
        assert_eq!(&frame.payload[..], &[0xAA, 0xBB]);
        assert_eq!(frame.timestamp, 100);

        let body = Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]);
        let frame = MediaFrame::from_tag_body(MediaKind::Audio, 0, body).unwrap();
        assert!(frame.sequence_header);
        assert_eq!(&frame.payload[..], &[0x12, 0x10]);
    }

    #[test]
    fn test_unsupported_and_truncated() {
        let frame = MediaFrame::video(Codec::ScreenVideoV2, 0, Bytes::new(), true);
        assert!(matches!(frame.to_tag_body(), Err(Error::UnsupportedCodec(_))));

        assert!(MediaFrame::from_tag_body(MediaKind::Video, 0, Bytes::from_static(&[0x1C])).is_err());
        assert!(MediaFrame::from_tag_body(MediaKind::Video, 0, Bytes::from_static(&[0x17, 0x01])).is_err());
        assert!(MediaFrame::from_tag_body(MediaKind::Audio, 0, Bytes::new()).is_err());
    }
}
