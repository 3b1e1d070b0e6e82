//! RTMP handshake implementation (client side)
//!
//! The RTMP handshake consists of three phases:
//!
//! ```text
//! Client                                   Server
//!   |                                        |
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: time+random) ->|
//!   |                                        |
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes: time+random) --|
//!   |<------ S2 (1536 bytes: echo C1) ------|
//!   |                                        |
//!   |------- C2 (1536 bytes: echo S1) ----->|
//!   |                                        |
//!   |          [Handshake Complete]          |
//! ```
//!
//! This is the "simple" handshake (no HMAC digest). The state machine does no
//! I/O: the connection feeds it whatever bytes have arrived and writes out
//! what it returns.
//!
//! Reference: RTMP Specification Section 5.2

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Offset of the random payload inside C1/S1/C2/S2
const RANDOM_OFFSET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Need to send C0C1
    Initial,
    /// Waiting for S0S1S2
    WaitingForServer,
    /// C2 produced, handshake complete
    Done,
}

/// Client handshake state machine
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    /// Our C1 packet, kept to verify the S2 echo
    c1: Box<[u8; HANDSHAKE_SIZE]>,
    /// Fail when S2 does not echo C1's random payload
    strict: bool,
}

impl Handshake {
    /// Create a handshake that verifies the server's echo
    pub fn new() -> Self {
        Self::with_strict(true)
    }

    pub fn with_strict(strict: bool) -> Self {
        Self {
            state: HandshakeState::Initial,
            c1: Box::new([0u8; HANDSHAKE_SIZE]),
            strict,
        }
    }

    /// Check if handshake is complete
    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Bytes that must be buffered before [`process`](Self::process) can progress
    pub fn bytes_needed(&self) -> usize {
        match self.state {
            HandshakeState::WaitingForServer => 1 + HANDSHAKE_SIZE * 2,
            HandshakeState::Initial | HandshakeState::Done => 0,
        }
    }

    /// Generate C0+C1 (1 + 1536 bytes)
    pub fn generate_initial(&mut self) -> Result<Bytes> {
        if self.state != HandshakeState::Initial {
            return Err(HandshakeError::InvalidState.into());
        }

        let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);

        // C0: Version
        buf.put_u8(RTMP_VERSION);

        // C1: Time + Zero + Random
        generate_packet(&mut self.c1[..]);
        buf.put_slice(&self.c1[..]);

        self.state = HandshakeState::WaitingForServer;
        Ok(buf.freeze())
    }

    /// Consume S0S1S2 from `data` and return C2
    ///
    /// Returns `Ok(None)` and consumes nothing while fewer than
    /// [`bytes_needed`](Self::bytes_needed) bytes are buffered. Bytes after S2
    /// are left in `data`: servers may pipeline their first chunks behind it.
    pub fn process(&mut self, data: &mut BytesMut) -> Result<Option<Bytes>> {
        if self.state != HandshakeState::WaitingForServer {
            return Err(HandshakeError::InvalidState.into());
        }
        if data.len() < self.bytes_needed() {
            return Ok(None);
        }

        // S0: Version check
        let version = data.get_u8();
        if version != RTMP_VERSION {
            return Err(HandshakeError::InvalidVersion(version).into());
        }

        // S1: the packet C2 echoes
        let s1 = data.split_to(HANDSHAKE_SIZE);

        // S2: must echo C1's random payload byte for byte
        let s2 = data.split_to(HANDSHAKE_SIZE);
        if s2[RANDOM_OFFSET..] != self.c1[RANDOM_OFFSET..] {
            if self.strict {
                return Err(HandshakeError::EchoMismatch.into());
            }
            tracing::warn!("S2 does not echo C1, continuing (lenient handshake)");
        }

        let c2 = generate_echo(&s1);

        self.state = HandshakeState::Done;
        Ok(Some(c2))
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// Fill a C1 packet
///
/// Format (1536 bytes):
/// - Bytes 0-3: Timestamp (32-bit, big-endian)
/// - Bytes 4-7: Zero
/// - Bytes 8-1535: Random data
fn generate_packet(packet: &mut [u8]) {
    packet[0..4].copy_from_slice(&now_millis().to_be_bytes());
    packet[4..RANDOM_OFFSET].fill(0);
    rand::rng().fill(&mut packet[RANDOM_OFFSET..]);
}

/// Generate C2 from S1
///
/// Format:
/// - Bytes 0-3: Peer's timestamp (from S1)
/// - Bytes 4-7: Our timestamp
/// - Bytes 8-1535: Copy of peer's random data
fn generate_echo(peer_packet: &[u8]) -> Bytes {
    let mut echo = BytesMut::from(peer_packet);
    echo[4..RANDOM_OFFSET].copy_from_slice(&now_millis().to_be_bytes());
    echo.freeze()
}
