//! RTMP message types and parsing
//!
//! RTMP messages are classified into:
//! - Protocol Control Messages (types 1-6): Chunk/flow control
//! - Command Messages (type 20): AMF0-encoded commands
//! - Data Messages (type 18): Metadata
//! - Shared Object Messages (type 19): passed through undecoded
//! - Audio/Video Messages (types 8, 9): Media data
//!
//! Reference: RTMP Specification Section 5.4

use bytes::{BufMut, Bytes, BytesMut};

use crate::amf::{Amf0Decoder, Amf0Encoder, AmfObject, AmfValue};
use crate::cursor::ByteReader;
use crate::error::{ProtocolError, Result};
use crate::protocol::chunk::RtmpChunk;
use crate::protocol::constants::*;

/// Parsed RTMP message
#[derive(Debug, Clone, PartialEq)]
pub enum RtmpMessage {
    /// Set Chunk Size (type 1)
    SetChunkSize(u32),

    /// Abort Message (type 2)
    Abort { csid: u32 },

    /// Acknowledgement (type 3)
    Acknowledgement { sequence: u32 },

    /// User Control Message (type 4)
    UserControl(UserControlEvent),

    /// Window Acknowledgement Size (type 5)
    WindowAckSize(u32),

    /// Set Peer Bandwidth (type 6)
    SetPeerBandwidth { size: u32, limit_type: u8 },

    /// Audio data (type 8)
    Audio { timestamp: u32, data: Bytes },

    /// Video data (type 9)
    Video { timestamp: u32, data: Bytes },

    /// AMF0 Command (type 20)
    Command(Command),

    /// AMF0 Data message (type 18) - metadata, etc.
    Data(DataMessage),

    /// AMF0 Shared Object (type 19)
    SharedObject { data: Bytes },

    /// Unknown message type
    Unknown { type_id: u8, data: Bytes },
}

/// User Control Event
#[derive(Debug, Clone, PartialEq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    Unknown { event_type: u16, data: Bytes },
}

/// RTMP command (connect, publish, play, etc.)
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Command name
    pub name: String,
    /// Transaction ID (0 when no reply is expected)
    pub transaction_id: u32,
    /// Command object (often null for responses)
    pub command_object: AmfValue,
    /// Additional arguments
    pub arguments: Vec<AmfValue>,
    /// Message stream ID (from chunk)
    pub stream_id: u32,
}

/// Data message (@setDataFrame, onMetaData, etc.)
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    /// Handler name (e.g., "@setDataFrame", "onMetaData")
    pub name: String,
    /// Data values
    pub values: Vec<AmfValue>,
    /// Message stream ID
    pub stream_id: u32,
}

fn read_u32_field(reader: &mut ByteReader<'_>, what: &'static str) -> Result<u32> {
    reader
        .read_u32()
        .ok_or_else(|| ProtocolError::Truncated(what).into())
}

impl RtmpMessage {
    /// Parse a message from a chunk
    pub fn from_chunk(chunk: &RtmpChunk) -> Result<Self> {
        let mut reader = ByteReader::new(&chunk.payload);

        match chunk.message_type {
            MSG_SET_CHUNK_SIZE => {
                // The MSB is reserved
                let size = read_u32_field(&mut reader, "set chunk size")? & 0x7FFF_FFFF;
                Ok(RtmpMessage::SetChunkSize(size))
            }

            MSG_ABORT => Ok(RtmpMessage::Abort {
                csid: read_u32_field(&mut reader, "abort")?,
            }),

            MSG_ACKNOWLEDGEMENT => Ok(RtmpMessage::Acknowledgement {
                sequence: read_u32_field(&mut reader, "acknowledgement")?,
            }),

            MSG_USER_CONTROL => Self::parse_user_control(&mut reader, &chunk.payload),

            MSG_WINDOW_ACK_SIZE => Ok(RtmpMessage::WindowAckSize(read_u32_field(
                &mut reader,
                "window acknowledgement size",
            )?)),

            MSG_SET_PEER_BANDWIDTH => {
                let size = read_u32_field(&mut reader, "set peer bandwidth")?;
                let limit_type = reader
                    .read_u8()
                    .ok_or(ProtocolError::Truncated("set peer bandwidth"))?;
                Ok(RtmpMessage::SetPeerBandwidth { size, limit_type })
            }

            MSG_AUDIO => Ok(RtmpMessage::Audio {
                timestamp: chunk.timestamp,
                data: chunk.payload.clone(),
            }),

            MSG_VIDEO => Ok(RtmpMessage::Video {
                timestamp: chunk.timestamp,
                data: chunk.payload.clone(),
            }),

            MSG_COMMAND_AMF0 => {
                let cmd = Self::parse_command(&mut reader, chunk.stream_id)?;
                Ok(RtmpMessage::Command(cmd))
            }

            MSG_DATA_AMF0 => {
                let data = Self::parse_data(&mut reader, chunk.stream_id)?;
                Ok(RtmpMessage::Data(data))
            }

            MSG_SHARED_OBJECT_AMF0 => Ok(RtmpMessage::SharedObject {
                data: chunk.payload.clone(),
            }),

            _ => Ok(RtmpMessage::Unknown {
                type_id: chunk.message_type,
                data: chunk.payload.clone(),
            }),
        }
    }

    /// Parse User Control message
    fn parse_user_control(reader: &mut ByteReader<'_>, payload: &Bytes) -> Result<Self> {
        let event_type = reader
            .read_u16()
            .ok_or(ProtocolError::Truncated("user control"))?;

        let event = match event_type {
            UC_STREAM_BEGIN => UserControlEvent::StreamBegin(read_u32_field(reader, "stream begin")?),
            UC_STREAM_EOF => UserControlEvent::StreamEof(read_u32_field(reader, "stream eof")?),
            UC_STREAM_DRY => UserControlEvent::StreamDry(read_u32_field(reader, "stream dry")?),
            UC_SET_BUFFER_LENGTH => {
                let stream_id = read_u32_field(reader, "set buffer length")?;
                let buffer_ms = read_u32_field(reader, "set buffer length")?;
                UserControlEvent::SetBufferLength { stream_id, buffer_ms }
            }
            UC_STREAM_IS_RECORDED => {
                UserControlEvent::StreamIsRecorded(read_u32_field(reader, "stream is recorded")?)
            }
            UC_PING_REQUEST => UserControlEvent::PingRequest(read_u32_field(reader, "ping request")?),
            UC_PING_RESPONSE => {
                UserControlEvent::PingResponse(read_u32_field(reader, "ping response")?)
            }
            _ => UserControlEvent::Unknown {
                event_type,
                data: payload.slice(reader.position()..),
            },
        };

        Ok(RtmpMessage::UserControl(event))
    }

    /// Parse AMF0 command
    fn parse_command(reader: &mut ByteReader<'_>, stream_id: u32) -> Result<Command> {
        let mut decoder = Amf0Decoder::new();

        // Command name
        let name = match decoder.decode(reader)? {
            AmfValue::String(s) => s,
            _ => return Err(ProtocolError::InvalidCommand("Expected command name".into()).into()),
        };

        // Transaction ID; anything that is not a usable integer counts as 0
        let transaction_id = match decoder.decode(reader)? {
            AmfValue::Number(n) if n.is_finite() && n >= 0.0 && n <= u32::MAX as f64 => n as u32,
            _ => 0,
        };

        // Command object (can be null)
        let command_object = if reader.is_empty() {
            AmfValue::Null
        } else {
            decoder.decode(reader)?
        };

        // Additional arguments
        let arguments = decoder.decode_all(reader)?;

        Ok(Command {
            name,
            transaction_id,
            command_object,
            arguments,
            stream_id,
        })
    }

    /// Parse AMF0 data message
    fn parse_data(reader: &mut ByteReader<'_>, stream_id: u32) -> Result<DataMessage> {
        let mut decoder = Amf0Decoder::new();

        // Handler name
        let name = match decoder.decode(reader)? {
            AmfValue::String(s) => s,
            _ => String::new(), // Lenient
        };

        let values = decoder.decode_all(reader)?;

        Ok(DataMessage { name, values, stream_id })
    }

    /// Encode message to chunk payload
    pub fn encode(&self) -> (u8, Bytes) {
        match self {
            RtmpMessage::SetChunkSize(size) => (MSG_SET_CHUNK_SIZE, u32_payload(*size)),

            RtmpMessage::Abort { csid } => (MSG_ABORT, u32_payload(*csid)),

            RtmpMessage::Acknowledgement { sequence } => {
                (MSG_ACKNOWLEDGEMENT, u32_payload(*sequence))
            }

            RtmpMessage::WindowAckSize(size) => (MSG_WINDOW_ACK_SIZE, u32_payload(*size)),

            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u32(*size);
                buf.put_u8(*limit_type);
                (MSG_SET_PEER_BANDWIDTH, buf.freeze())
            }

            RtmpMessage::UserControl(event) => {
                let mut buf = BytesMut::with_capacity(10);
                match event {
                    UserControlEvent::StreamBegin(id) => {
                        buf.put_u16(UC_STREAM_BEGIN);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::StreamEof(id) => {
                        buf.put_u16(UC_STREAM_EOF);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::StreamDry(id) => {
                        buf.put_u16(UC_STREAM_DRY);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::SetBufferLength { stream_id, buffer_ms } => {
                        buf.put_u16(UC_SET_BUFFER_LENGTH);
                        buf.put_u32(*stream_id);
                        buf.put_u32(*buffer_ms);
                    }
                    UserControlEvent::StreamIsRecorded(id) => {
                        buf.put_u16(UC_STREAM_IS_RECORDED);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::PingRequest(ts) => {
                        buf.put_u16(UC_PING_REQUEST);
                        buf.put_u32(*ts);
                    }
                    UserControlEvent::PingResponse(ts) => {
                        buf.put_u16(UC_PING_RESPONSE);
                        buf.put_u32(*ts);
                    }
                    UserControlEvent::Unknown { event_type, data } => {
                        buf.put_u16(*event_type);
                        buf.put_slice(data);
                    }
                }
                (MSG_USER_CONTROL, buf.freeze())
            }

            RtmpMessage::Audio { data, .. } => (MSG_AUDIO, data.clone()),

            RtmpMessage::Video { data, .. } => (MSG_VIDEO, data.clone()),

            RtmpMessage::Command(cmd) => (MSG_COMMAND_AMF0, cmd.encode()),

            RtmpMessage::Data(data) => (MSG_DATA_AMF0, data.encode()),

            RtmpMessage::SharedObject { data } => (MSG_SHARED_OBJECT_AMF0, data.clone()),

            RtmpMessage::Unknown { type_id, data } => (*type_id, data.clone()),
        }
    }

    /// Encode into a chunk-layer message ready for the chunk encoder
    pub fn to_chunk(&self, csid: u32, timestamp: u32, stream_id: u32) -> RtmpChunk {
        let (message_type, payload) = self.encode();
        RtmpChunk {
            csid,
            timestamp,
            message_type,
            stream_id,
            payload,
        }
    }
}

fn u32_payload(value: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(value);
    buf.freeze()
}

impl Command {
    /// Build a command with a null command object
    pub fn new(name: impl Into<String>, transaction_id: u32, arguments: Vec<AmfValue>) -> Self {
        Command {
            name: name.into(),
            transaction_id,
            command_object: AmfValue::Null,
            arguments,
            stream_id: 0,
        }
    }

    /// Set the command object
    pub fn with_object(mut self, command_object: AmfValue) -> Self {
        self.command_object = command_object;
        self
    }

    /// Target a message stream
    pub fn on_stream(mut self, stream_id: u32) -> Self {
        self.stream_id = stream_id;
        self
    }

    /// Encode a command to AMF0 bytes
    pub fn encode(&self) -> Bytes {
        let mut encoder = Amf0Encoder::new();
        encoder.encode(&AmfValue::String(self.name.clone()));
        encoder.encode(&AmfValue::Number(self.transaction_id as f64));
        encoder.encode(&self.command_object);
        encoder.encode_all(&self.arguments);
        encoder.finish()
    }

    /// The info object of a `_result`, `_error` or `onStatus` reply
    ///
    /// Servers put it in the first argument; a few put it in the command
    /// object instead.
    pub fn info(&self) -> Option<&AmfObject> {
        self.arguments
            .first()
            .and_then(AmfValue::as_object)
            .or_else(|| self.command_object.as_object())
    }

    /// Status code from the info object
    pub fn status_code(&self) -> Option<&str> {
        self.info()?.get("code")?.as_str()
    }

    /// Status description from the info object
    pub fn status_description(&self) -> Option<&str> {
        self.info()?.get("description")?.as_str()
    }

    /// Status level ("status", "warning" or "error")
    pub fn status_level(&self) -> Option<&str> {
        self.info()?.get("level")?.as_str()
    }
}

impl DataMessage {
    /// `@setDataFrame onMetaData <metadata>`, as publishers send it
    pub fn set_data_frame(metadata: AmfObject, stream_id: u32) -> Self {
        DataMessage {
            name: CMD_SET_DATA_FRAME.to_string(),
            values: vec![
                AmfValue::String(CMD_ON_METADATA.to_string()),
                AmfValue::EcmaArray(metadata),
            ],
            stream_id,
        }
    }

    /// Encode a data message to AMF0 bytes
    pub fn encode(&self) -> Bytes {
        let mut encoder = Amf0Encoder::new();
        encoder.encode(&AmfValue::String(self.name.clone()));
        encoder.encode_all(&self.values);
        encoder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(message_type: u8, payload: Bytes) -> RtmpChunk {
        RtmpChunk {
            csid: CSID_COMMAND,
            timestamp: 0,
            message_type,
            stream_id: 0,
            payload,
        }
    }

    #[test]
    fn test_command_roundtrip() {
        let cmd = Command::new(CMD_CONNECT, 1, vec![AmfValue::String("test".into())])
            .with_object(AmfValue::Object(AmfObject::from([("app", "live")])));

        let parsed = RtmpMessage::from_chunk(&chunk(MSG_COMMAND_AMF0, cmd.encode())).unwrap();
        if let RtmpMessage::Command(parsed_cmd) = parsed {
            assert_eq!(parsed_cmd, cmd);
        } else {
            panic!("Expected Command message");
        }
    }

    #[test]
    fn test_odd_transaction_ids() {
        let mut encoder = Amf0Encoder::new();
        encoder.encode(&AmfValue::String(CMD_ON_STATUS.into()));
        encoder.encode(&AmfValue::Number(-3.0));
        let parsed = RtmpMessage::from_chunk(&chunk(MSG_COMMAND_AMF0, encoder.finish())).unwrap();
        match parsed {
            RtmpMessage::Command(cmd) => {
                assert_eq!(cmd.transaction_id, 0);
                assert_eq!(cmd.command_object, AmfValue::Null);
                assert!(cmd.arguments.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_status_accessors() {
        let info = AmfObject::from([
            ("level", "error"),
            ("code", NC_CONNECT_REJECTED),
            ("description", "bad app"),
        ]);
        let cmd = Command::new(CMD_ERROR, 1, vec![AmfValue::Object(info)]);
        assert_eq!(cmd.status_code(), Some(NC_CONNECT_REJECTED));
        assert_eq!(cmd.status_description(), Some("bad app"));
        assert_eq!(cmd.status_level(), Some("error"));

        let bare = Command::new(CMD_RESULT, 2, vec![AmfValue::Number(1.0)]);
        assert_eq!(bare.status_code(), None);
    }

    #[test]
    fn test_control_messages() {
        let msg = RtmpMessage::SetPeerBandwidth {
            size: 2_500_000,
            limit_type: 2,
        };
        let (ty, payload) = msg.encode();
        assert_eq!(ty, MSG_SET_PEER_BANDWIDTH);
        assert_eq!(RtmpMessage::from_chunk(&chunk(ty, payload)).unwrap(), msg);

        let ping = RtmpMessage::UserControl(UserControlEvent::PingRequest(1234));
        let parsed = RtmpMessage::from_chunk(&ping.to_chunk(CSID_PROTOCOL_CONTROL, 0, 0)).unwrap();
        assert_eq!(parsed, ping);

        let buffer = RtmpMessage::UserControl(UserControlEvent::SetBufferLength {
            stream_id: 1,
            buffer_ms: 3000,
        });
        let (ty, payload) = buffer.encode();
        assert_eq!(payload.len(), 10);
        assert_eq!(RtmpMessage::from_chunk(&chunk(ty, payload)).unwrap(), buffer);
    }

    #[test]
    fn test_set_chunk_size_ignores_reserved_bit() {
        let payload = Bytes::from_static(&[0x80, 0x00, 0x10, 0x00]);
        assert_eq!(
            RtmpMessage::from_chunk(&chunk(MSG_SET_CHUNK_SIZE, payload)).unwrap(),
            RtmpMessage::SetChunkSize(4096)
        );
    }

    #[test]
    fn test_truncated_control_message() {
        let err = RtmpMessage::from_chunk(&chunk(MSG_WINDOW_ACK_SIZE, Bytes::from_static(&[0, 1])))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Protocol(ProtocolError::Truncated(_))
        ));
    }

    #[test]
    fn test_set_data_frame() {
        let meta = AmfObject::from([("width", 1280.0), ("height", 720.0)]);
        let data = DataMessage::set_data_frame(meta.clone(), 1);
        let (ty, payload) = RtmpMessage::Data(data).encode();
        assert_eq!(ty, MSG_DATA_AMF0);

        let mut c = chunk(ty, payload);
        c.stream_id = 1;
        match RtmpMessage::from_chunk(&c).unwrap() {
            RtmpMessage::Data(parsed) => {
                assert_eq!(parsed.name, CMD_SET_DATA_FRAME);
                assert_eq!(parsed.values[0].as_str(), Some(CMD_ON_METADATA));
                assert_eq!(parsed.values[1], AmfValue::EcmaArray(meta));
                assert_eq!(parsed.stream_id, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_amf_is_error() {
        let payload = Bytes::from_static(&[0x11, 0x00]);
        assert!(RtmpMessage::from_chunk(&chunk(MSG_COMMAND_AMF0, payload)).is_err());
    }
}
