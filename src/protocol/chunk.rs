//! RTMP chunk stream codec
//!
//! RTMP messages are split into chunks for multiplexing. Each chunk has a header
//! that identifies the chunk stream and message being sent.
//!
//! ```text
//! Chunk Format:
//! +-------------+----------------+-------------------+
//! | Basic Header| Message Header | Chunk Data        |
//! | (1-3 bytes) | (0,3,7,11 bytes)| (variable)       |
//! +-------------+----------------+-------------------+
//!
//! Basic Header formats:
//! - 1 byte:  fmt(2) + csid(6)        for csid 2-63
//! - 2 bytes: fmt(2) + 0 + csid(8)    for csid 64-319
//! - 3 bytes: fmt(2) + 1 + csid(16)   for csid 64-65599
//!
//! Message Header formats (based on fmt):
//! - Type 0 (11 bytes): timestamp(3) + length(3) + type(1) + stream_id(4)
//! - Type 1 (7 bytes):  timestamp_delta(3) + length(3) + type(1)
//! - Type 2 (3 bytes):  timestamp_delta(3)
//! - Type 3 (0 bytes):  (use previous chunk's values)
//!
//! Extended timestamp (4 bytes) is appended when the 24-bit field is 0xFFFFFF,
//! and repeated on every type 3 chunk that follows such a header.
//! ```
//!
//! Reference: RTMP Specification Section 5.3

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use crate::cursor::{BufMutExt, ByteReader};
use crate::error::{ProtocolError, Result};
use crate::protocol::constants::*;

/// A complete RTMP message (reassembled from chunks)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpChunk {
    /// Chunk stream ID (for multiplexing)
    pub csid: u32,
    /// Message timestamp (milliseconds)
    pub timestamp: u32,
    /// Message type ID
    pub message_type: u8,
    /// Message stream ID
    pub stream_id: u32,
    /// Message payload
    pub payload: Bytes,
}

/// Last header seen on an inbound chunk stream, plus the message being reassembled
#[derive(Debug, Default)]
struct InboundState {
    /// Absolute timestamp of the current (or last) message
    timestamp: u32,
    /// Delta inherited by a type 3 header that starts a new message
    timestamp_delta: u32,
    message_length: u32,
    message_type: u8,
    stream_id: u32,
    /// Last type 0-2 header carried an extended timestamp
    extended: bool,
    /// A message has started and not yet completed
    in_progress: bool,
    partial: BytesMut,
}

/// Chunk stream decoder
///
/// Handles chunk demultiplexing and message reassembly. Nothing is consumed
/// from the input until a whole chunk (header and data) is buffered.
#[derive(Debug)]
pub struct ChunkDecoder {
    /// Maximum incoming chunk size
    chunk_size: u32,
    /// Per-chunk-stream state
    streams: HashMap<u32, InboundState>,
    /// Maximum message size (sanity limit)
    max_message_size: u32,
}

impl ChunkDecoder {
    /// Create a new decoder with default chunk size
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Set the chunk size (called when receiving SetChunkSize message)
    pub fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::InvalidChunkSize(size).into());
        }
        self.chunk_size = size;
        Ok(())
    }

    /// Get current chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Decode chunks from the buffer until a message completes
    ///
    /// Returns Ok(Some(chunk)) if a complete message was decoded,
    /// Ok(None) if more data is needed, or Err on protocol error.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RtmpChunk>> {
        loop {
            match self.decode_chunk(buf)? {
                ChunkOutcome::NeedMore => return Ok(None),
                ChunkOutcome::Partial => continue,
                ChunkOutcome::Message(msg) => return Ok(Some(msg)),
            }
        }
    }

    /// Consume at most one chunk from the buffer
    fn decode_chunk(&mut self, buf: &mut BytesMut) -> Result<ChunkOutcome> {
        let mut reader = ByteReader::new(&buf[..]);

        let Some((fmt, csid)) = read_basic_header(&mut reader) else {
            return Ok(ChunkOutcome::NeedMore);
        };

        let state = match self.streams.entry(csid) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(_) if fmt != CHUNK_FMT_0 => {
                return Err(ProtocolError::UnknownChunkStream { csid, fmt }.into());
            }
            Entry::Vacant(entry) => entry.insert(InboundState::default()),
        };

        let Some(header) = read_message_header(&mut reader, fmt, state) else {
            return Ok(ChunkOutcome::NeedMore);
        };

        if header.length > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: header.length,
                max: self.max_message_size,
            }
            .into());
        }

        // Only type 3 continues a message; any other header starts a new one
        let continuing = state.in_progress && fmt == CHUNK_FMT_3;
        let remaining = if continuing {
            header.length - state.partial.len() as u32
        } else {
            header.length
        };
        let data_len = remaining.min(self.chunk_size) as usize;
        if reader.remaining() < data_len {
            return Ok(ChunkOutcome::NeedMore);
        }
        let header_len = reader.position();

        // The whole chunk is buffered: commit header state and consume.
        if fmt != CHUNK_FMT_3 {
            state.extended = header.extended;
            state.message_length = header.length;
            state.message_type = header.message_type;
            state.stream_id = header.stream_id;
        }
        if state.in_progress && !continuing {
            tracing::debug!(
                csid,
                discarded = state.partial.len(),
                "New message header mid-message, dropping partial payload"
            );
            state.partial.clear();
            state.in_progress = false;
        }
        if !state.in_progress {
            // Timestamps advance once per message, never on continuations.
            match fmt {
                CHUNK_FMT_0 => {
                    state.timestamp = header.timestamp;
                    state.timestamp_delta = 0;
                }
                CHUNK_FMT_1 | CHUNK_FMT_2 => {
                    state.timestamp = state.timestamp.wrapping_add(header.timestamp);
                    state.timestamp_delta = header.timestamp;
                }
                _ => {
                    state.timestamp = state.timestamp.wrapping_add(state.timestamp_delta);
                }
            }
            state.in_progress = true;
            state.partial.reserve(header.length as usize);
        }

        buf.advance(header_len);
        state.partial.put_slice(&buf[..data_len]);
        buf.advance(data_len);

        if (state.partial.len() as u32) < state.message_length {
            return Ok(ChunkOutcome::Partial);
        }

        state.in_progress = false;
        Ok(ChunkOutcome::Message(RtmpChunk {
            csid,
            timestamp: state.timestamp,
            message_type: state.message_type,
            stream_id: state.stream_id,
            payload: state.partial.split().freeze(),
        }))
    }

    /// Abort a message on a chunk stream (when receiving Abort message)
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.streams.get_mut(&csid) {
            state.partial.clear();
            state.in_progress = false;
        }
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

enum ChunkOutcome {
    NeedMore,
    Partial,
    Message(RtmpChunk),
}

/// Fields resolved from a message header, explicit or inherited
struct MessageHeader {
    /// Absolute for type 0, delta for types 1 and 2, unused for type 3
    timestamp: u32,
    length: u32,
    message_type: u8,
    stream_id: u32,
    extended: bool,
}

/// Parse basic header and return (fmt, csid)
fn read_basic_header(reader: &mut ByteReader<'_>) -> Option<(u8, u32)> {
    let first = reader.read_u8()?;
    let fmt = (first >> 6) & 0x03;

    let csid = match first & 0x3F {
        // 2-byte header: csid = 64 + second byte
        0 => 64 + reader.read_u8()? as u32,
        // 3-byte header: csid = 64 + second + third*256
        1 => {
            let low = reader.read_u8()? as u32;
            let high = reader.read_u8()? as u32;
            64 + low + high * 256
        }
        // 1-byte header: csid = 2-63
        id => id as u32,
    };

    Some((fmt, csid))
}

fn read_message_header(
    reader: &mut ByteReader<'_>,
    fmt: u8,
    prev: &InboundState,
) -> Option<MessageHeader> {
    let mut header = MessageHeader {
        timestamp: 0,
        length: prev.message_length,
        message_type: prev.message_type,
        stream_id: prev.stream_id,
        extended: prev.extended,
    };

    if fmt != CHUNK_FMT_3 {
        header.timestamp = reader.read_u24()?;
        if fmt <= CHUNK_FMT_1 {
            header.length = reader.read_u24()?;
            header.message_type = reader.read_u8()?;
        }
        if fmt == CHUNK_FMT_0 {
            // Stream ID is little-endian!
            header.stream_id = reader.read_u32_le()?;
        }
        header.extended = header.timestamp >= EXTENDED_TIMESTAMP_THRESHOLD;
    }

    if header.extended {
        let value = reader.read_u32()?;
        if fmt != CHUNK_FMT_3 {
            header.timestamp = value;
        }
    }

    Some(header)
}

/// Last header sent on an outbound chunk stream
#[derive(Debug, Clone, Copy)]
struct OutboundState {
    timestamp: u32,
    /// Delta a type 3 header would imply; `None` after a type 0 header
    timestamp_delta: Option<u32>,
    message_length: u32,
    message_type: u8,
    stream_id: u32,
    /// Extended field value repeated on type 3 chunks
    extended: Option<u32>,
}

/// Chunk stream encoder
///
/// Encodes messages into chunks for transmission. Chunks are queued per
/// chunk stream and [`flush`](Self::flush) interleaves the queues one chunk at
/// a time, so a large video message cannot hold back audio sent after it.
#[derive(Debug)]
pub struct ChunkEncoder {
    /// Outgoing chunk size
    chunk_size: u32,
    /// Per-chunk-stream state for compression
    streams: HashMap<u32, OutboundState>,
    /// Pending chunks per csid, in first-use order
    queues: Vec<(u32, VecDeque<Bytes>)>,
    /// Chunks whose wire order is already fixed
    committed: BytesMut,
}

impl ChunkEncoder {
    /// Create a new encoder with default chunk size
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            queues: Vec::new(),
            committed: BytesMut::new(),
        }
    }

    /// Change the outgoing chunk size
    ///
    /// Chunks already queued were cut at the old size, so they are committed
    /// to the wire first, followed by the SetChunkSize control message that
    /// tells the peer about the change.
    pub fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::InvalidChunkSize(size).into());
        }

        let mut committed = std::mem::take(&mut self.committed);
        self.drain_queues(&mut committed);

        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(size);
        self.encode(&RtmpChunk {
            csid: CSID_PROTOCOL_CONTROL,
            timestamp: 0,
            message_type: MSG_SET_CHUNK_SIZE,
            stream_id: 0,
            payload: payload.freeze(),
        });
        self.drain_queues(&mut committed);

        self.committed = committed;
        self.chunk_size = size;
        Ok(())
    }

    /// Get current chunk size
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Whether any encoded bytes are waiting for [`flush`](Self::flush)
    pub fn has_pending(&self) -> bool {
        !self.committed.is_empty() || !self.queues.is_empty()
    }

    /// Move all encoded chunks into `out`, interleaving chunk streams
    pub fn flush(&mut self, out: &mut BytesMut) {
        out.put(self.committed.split());
        self.drain_queues(out);
    }

    fn drain_queues(&mut self, out: &mut BytesMut) {
        while !self.queues.is_empty() {
            for (_, queue) in self.queues.iter_mut() {
                if let Some(chunk) = queue.pop_front() {
                    out.put_slice(&chunk);
                }
            }
            self.queues.retain(|(_, queue)| !queue.is_empty());
        }
    }

    /// Split a message into chunks and queue them on its chunk stream
    pub fn encode(&mut self, msg: &RtmpChunk) {
        let csid = msg.csid;
        let chunk_size = self.chunk_size as usize;
        let payload_len = msg.payload.len();
        let prev = self.streams.get(&csid).copied();

        let fmt = select_format(msg, prev.as_ref());
        let delta = prev.map(|p| msg.timestamp.wrapping_sub(p.timestamp));

        // Value carried by the header's timestamp field
        let field_value = match fmt {
            CHUNK_FMT_0 => msg.timestamp,
            _ => delta.unwrap_or(0),
        };
        let extended = match fmt {
            CHUNK_FMT_3 => prev.and_then(|p| p.extended),
            _ => (field_value >= EXTENDED_TIMESTAMP_THRESHOLD).then_some(field_value),
        };
        let field = if extended.is_some() {
            EXTENDED_TIMESTAMP_THRESHOLD
        } else {
            field_value
        };

        self.streams.insert(
            csid,
            OutboundState {
                timestamp: msg.timestamp,
                timestamp_delta: if fmt == CHUNK_FMT_0 { None } else { delta },
                message_length: payload_len as u32,
                message_type: msg.message_type,
                stream_id: msg.stream_id,
                extended,
            },
        );

        let queue = match self.queues.iter().position(|(id, _)| *id == csid) {
            Some(idx) => &mut self.queues[idx].1,
            None => {
                self.queues.push((csid, VecDeque::new()));
                let last = self.queues.len() - 1;
                &mut self.queues[last].1
            }
        };

        // An empty payload still needs one chunk to carry the header
        let mut offset = 0;
        let mut first_chunk = true;
        while first_chunk || offset < payload_len {
            let data_len = (payload_len - offset).min(chunk_size);
            let mut chunk = BytesMut::with_capacity(18 + data_len);

            write_basic_header(csid, if first_chunk { fmt } else { CHUNK_FMT_3 }, &mut chunk);

            if first_chunk {
                match fmt {
                    CHUNK_FMT_0 => {
                        chunk.put_u24(field);
                        chunk.put_u24(payload_len as u32);
                        chunk.put_u8(msg.message_type);
                        chunk.put_u32_le(msg.stream_id);
                    }
                    CHUNK_FMT_1 => {
                        chunk.put_u24(field);
                        chunk.put_u24(payload_len as u32);
                        chunk.put_u8(msg.message_type);
                    }
                    CHUNK_FMT_2 => chunk.put_u24(field),
                    _ => {}
                }
            }

            // Repeated on continuations as well as the first chunk
            if let Some(value) = extended {
                chunk.put_u32(value);
            }

            chunk.put_slice(&msg.payload[offset..offset + data_len]);
            queue.push_back(chunk.freeze());

            offset += data_len;
            first_chunk = false;
        }
    }

    /// Encode a message and flush everything queued into `out`
    pub fn encode_to(&mut self, msg: &RtmpChunk, out: &mut BytesMut) {
        self.encode(msg);
        self.flush(out);
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Select the best header format for compression
fn select_format(msg: &RtmpChunk, prev: Option<&OutboundState>) -> u8 {
    // First message on this stream must use format 0
    let Some(prev) = prev else {
        return CHUNK_FMT_0;
    };

    // Stream change or a timestamp going backwards cannot be expressed as a delta
    if msg.stream_id != prev.stream_id || msg.timestamp < prev.timestamp {
        return CHUNK_FMT_0;
    }

    // If message type or length differs, use format 1
    if msg.message_type != prev.message_type || msg.payload.len() as u32 != prev.message_length {
        return CHUNK_FMT_1;
    }

    // If timestamp delta matches previous, use format 3
    let delta = msg.timestamp - prev.timestamp;
    if prev.timestamp_delta == Some(delta) {
        return CHUNK_FMT_3;
    }

    // Otherwise use format 2 (timestamp delta only)
    CHUNK_FMT_2
}

/// Write basic header
fn write_basic_header(csid: u32, fmt: u8, buf: &mut BytesMut) {
    if csid >= 64 + 256 {
        // 3-byte header
        buf.put_u8((fmt << 6) | 1);
        let csid_offset = csid - 64;
        buf.put_u8((csid_offset & 0xFF) as u8);
        buf.put_u8(((csid_offset >> 8) & 0xFF) as u8);
    } else if csid >= 64 {
        // 2-byte header
        buf.put_u8(fmt << 6);
        buf.put_u8((csid - 64) as u8);
    } else {
        // 1-byte header
        buf.put_u8((fmt << 6) | (csid as u8));
    }
}
