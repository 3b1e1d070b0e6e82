//! FLV file layout
//!
//! FLV (Flash Video) is the container format used by RTMP for audio/video data.
//! Each RTMP audio/video message is essentially an FLV tag without the tag header.
//!
//! ```text
//! File header (13 bytes):
//! +-----------+---------+----------+---------------+--------------------+
//! | "FLV" (3) | Ver (1) | Flags(1) | DataOffset(4) | PrevTagSize0 (4)=0 |
//! +-----------+---------+----------+---------------+--------------------+
//!
//! Tag:
//! +--------+-------------+-------+---------+-------------+---------+-------------+
//! | Type(1)| DataSize(3) | TS(3) | TSExt(1)| StreamID(3) | Data(N) | PrevSize(4) |
//! +--------+-------------+-------+---------+-------------+---------+-------------+
//! ```
//!
//! PrevSize is always 11 + DataSize so a reader can walk the file backwards.

use bytes::{BufMut, Bytes, BytesMut};

use crate::cursor::{BufMutExt, ByteReader};
use crate::media::codec::MediaKind;
use crate::protocol::constants::{MSG_AUDIO, MSG_DATA_AMF0, MSG_VIDEO};

/// FLV header flag: file contains audio
pub const FLAG_AUDIO: u8 = 0x04;
/// FLV header flag: file contains video
pub const FLAG_VIDEO: u8 = 0x01;

/// Size of the file header including PreviousTagSize0
pub const FILE_HEADER_SIZE: usize = 13;

/// First bytes of every FLV file
pub const SIGNATURE: &[u8; 3] = b"FLV";

/// Size of a tag header
pub const TAG_HEADER_SIZE: usize = 11;

/// FLV tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlvTagType {
    Audio,
    Video,
    Script,
}

impl FlvTagType {
    /// Tag type byte, which matches the RTMP message type id
    pub fn type_id(self) -> u8 {
        match self {
            FlvTagType::Audio => MSG_AUDIO,
            FlvTagType::Video => MSG_VIDEO,
            FlvTagType::Script => MSG_DATA_AMF0,
        }
    }

    pub fn from_type_id(id: u8) -> Option<Self> {
        match id {
            MSG_AUDIO => Some(FlvTagType::Audio),
            MSG_VIDEO => Some(FlvTagType::Video),
            MSG_DATA_AMF0 => Some(FlvTagType::Script),
            _ => None,
        }
    }
}

impl From<MediaKind> for FlvTagType {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => FlvTagType::Audio,
            MediaKind::Video => FlvTagType::Video,
        }
    }
}

/// One FLV tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlvTag {
    /// Tag type
    pub tag_type: FlvTagType,
    /// Timestamp in milliseconds
    pub timestamp: u32,
    /// Raw tag data (including codec headers)
    pub data: Bytes,
}

impl FlvTag {
    /// Create a new video tag
    pub fn video(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Video,
            timestamp,
            data,
        }
    }

    /// Create a new audio tag
    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Audio,
            timestamp,
            data,
        }
    }

    /// Get the size of the tag data
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Bytes this tag occupies on disk, trailing size field included
    pub fn encoded_len(&self) -> usize {
        TAG_HEADER_SIZE + self.data.len() + 4
    }

    /// Write the tag followed by its PreviousTagSize field
    pub fn write_to(&self, out: &mut BytesMut) {
        out.reserve(self.encoded_len());
        out.put_u8(self.tag_type.type_id());
        out.put_u24(self.data.len() as u32);
        // Lower 24 bits, then the extension byte with bits 24-31
        out.put_u24(self.timestamp & 0x00FF_FFFF);
        out.put_u8((self.timestamp >> 24) as u8);
        out.put_u24(0);
        out.put_slice(&self.data);
        out.put_u32((TAG_HEADER_SIZE + self.data.len()) as u32);
    }

    /// Parse one tag and its PreviousTagSize field
    ///
    /// Returns the tag and the bytes consumed, or `None` when `data` does not
    /// hold a complete, well-formed tag.
    pub fn parse(data: &[u8]) -> Option<(Self, usize)> {
        let mut reader = ByteReader::new(data);
        let tag_type = FlvTagType::from_type_id(reader.read_u8()?)?;
        let size = reader.read_u24()? as usize;
        let low = reader.read_u24()?;
        let ext = reader.read_u8()? as u32;
        let _stream_id = reader.read_u24()?;
        let body = Bytes::copy_from_slice(reader.read_bytes(size)?);
        let prev_size = reader.read_u32()? as usize;
        if prev_size != TAG_HEADER_SIZE + size {
            return None;
        }

        let tag = FlvTag {
            tag_type,
            timestamp: (ext << 24) | low,
            data: body,
        };
        Some((tag, reader.position()))
    }
}

/// The 13-byte file header
pub fn file_header(flags: u8) -> [u8; FILE_HEADER_SIZE] {
    let mut header = [0u8; FILE_HEADER_SIZE];
    header[0..3].copy_from_slice(SIGNATURE);
    header[3] = 1;
    header[4] = flags;
    header[5..9].copy_from_slice(&9u32.to_be_bytes());
    // PreviousTagSize0 stays zero
    header
}
