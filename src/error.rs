//! Unified error types for rtmp-client

use std::io;

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all RTMP client operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the socket or the recording file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Chunk or message level protocol violation
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// AMF encoding/decoding error
    #[error("AMF error: {0}")]
    Amf(#[from] AmfError),

    /// Handshake failure
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// `_error` reply or rejected status from the server
    #[error("Command rejected: {code}: {description}")]
    Command { code: String, description: String },

    /// Authentication challenge could not be satisfied
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Operation timed out
    #[error("connect timed out")]
    Timeout,

    /// Connection was closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// The worker's request queue is full; the request was not sent
    #[error("Request queue full")]
    QueueFull,

    /// Operation not valid in the current connection or stream state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Recorder was closed before the write
    #[error("Recorder closed")]
    RecorderClosed,

    /// Codec the client cannot put on (or take off) the wire
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error leaves the connection unusable.
    ///
    /// Handshake, decode and socket failures mean the byte stream can no
    /// longer be trusted. Command, auth and recorder errors are reported to the
    /// caller that triggered them and the connection carries on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Protocol(_)
                | Error::Amf(_)
                | Error::Handshake(_)
                | Error::Timeout
                | Error::ConnectionClosed
        )
    }
}

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid chunk header")]
    InvalidChunkHeader,
    #[error("Chunk stream {csid} first seen with header type {fmt}")]
    UnknownChunkStream { csid: u32, fmt: u8 },
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(u32),
    #[error("Truncated {0} message")]
    Truncated(&'static str),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

/// AMF encoding/decoding errors
#[derive(Debug, Error)]
pub enum AmfError {
    #[error("Unknown AMF marker: 0x{0:02x}")]
    UnknownMarker(u8),
    #[error("Unexpected end of AMF data")]
    UnexpectedEof,
    #[error("Invalid UTF-8 in AMF string")]
    InvalidUtf8,
    #[error("Invalid AMF reference: {0}")]
    InvalidReference(u16),
    #[error("AMF nesting too deep")]
    NestingTooDeep,
    #[error("Invalid object end marker")]
    InvalidObjectEnd,
}

/// Handshake-specific errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Invalid RTMP version: {0}")]
    InvalidVersion(u8),
    #[error("Handshake echo mismatch in S2")]
    EchoMismatch,
    #[error("Invalid handshake state")]
    InvalidState,
    #[error("Connection closed during handshake")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn test_error_display() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        let err = Error::Io(io_err);
        assert!(err.to_string().contains("I/O error"));

        let err = Error::Protocol(ProtocolError::InvalidChunkHeader);
        assert!(err.to_string().contains("Protocol error"));
        assert!(err.to_string().contains("Invalid chunk header"));

        let err = Error::Amf(AmfError::UnknownMarker(0xFF));
        assert!(err.to_string().contains("0xff"));

        let err = Error::Handshake(HandshakeError::InvalidVersion(5));
        assert!(err.to_string().contains("5"));

        let err = Error::Command {
            code: "NetConnection.Connect.Rejected".into(),
            description: "bad app".into(),
        };
        assert!(err.to_string().contains("Connect.Rejected"));
        assert!(err.to_string().contains("bad app"));

        assert_eq!(Error::Timeout.to_string(), "connect timed out");
        assert!(Error::ConnectionClosed.to_string().contains("closed"));
    }

    #[test]
    fn test_error_source() {
        let err = Error::Io(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        assert!(StdError::source(&err).is_some());

        let err = Error::Timeout;
        assert!(StdError::source(&err).is_none());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Protocol(ProtocolError::InvalidChunkHeader).is_fatal());
        assert!(Error::Amf(AmfError::UnexpectedEof).is_fatal());
        assert!(Error::Handshake(HandshakeError::EchoMismatch).is_fatal());
        assert!(Error::ConnectionClosed.is_fatal());

        let err = Error::Command {
            code: "NetStream.Publish.BadName".into(),
            description: String::new(),
        };
        assert!(!err.is_fatal());
        assert!(!Error::RecorderClosed.is_fatal());
        assert!(!Error::QueueFull.is_fatal());
        assert!(!Error::Auth("authfailed".into()).is_fatal());
    }

    #[test]
    fn test_from_conversions() {
        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "timeout").into();
        assert!(matches!(err, Error::Io(_)));

        let err: Error = ProtocolError::MessageTooLarge { size: 100, max: 50 }.into();
        assert!(matches!(err, Error::Protocol(_)));

        let err: Error = AmfError::UnexpectedEof.into();
        assert!(matches!(err, Error::Amf(_)));

        let err: Error = HandshakeError::EchoMismatch.into();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnknownChunkStream { csid: 7, fmt: 1 };
        assert!(err.to_string().contains("7"));

        let err = ProtocolError::MessageTooLarge { size: 300, max: 200 };
        assert!(err.to_string().contains("300"));
        assert!(err.to_string().contains("200"));

        assert!(ProtocolError::InvalidChunkSize(0).to_string().contains("0"));
    }
}
