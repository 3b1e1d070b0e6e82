//! NetConnection state machine
//!
//! `ClientSession` holds everything the connection worker owns apart from the
//! socket: handshake, chunk codecs, pending transactions and stream states.
//! It takes inbound bytes through [`ClientSession::receive`] and requests
//! from handles through [`ClientSession::handle_request`], and leaves the
//! resulting outbound bytes for [`ClientSession::flush`]. No I/O happens
//! here, which keeps the protocol logic testable without a socket.
//!
//! ```text
//! Uninitialized ─▶ Handshaking ─▶ Connecting ─▶ Connected ─▶ Closed
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use tokio::sync::{mpsc, oneshot};

use crate::amf::{AmfObject, AmfValue};
use crate::client::config::{ClientConfig, ParsedUrl};
use crate::client::event::{StatusEvent, StreamEvent};
use crate::client::stream::{PublishType, StreamState};
use crate::client::transaction::TransactionTable;
use crate::error::{Error, ProtocolError, Result};
use crate::media::{FlvRecorder, MediaFrame, MediaKind};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, RtmpChunk};
use crate::protocol::constants::*;
use crate::protocol::handshake::Handshake;
use crate::protocol::message::{Command, RtmpMessage, UserControlEvent};
use crate::stats::ConnectionStats;

/// Reply channel for a request
pub(crate) type Responder<T> = oneshot::Sender<Result<T>>;

/// What handles ask the connection worker to do
pub(crate) enum Request {
    CreateStream {
        events: mpsc::UnboundedSender<StreamEvent>,
        reply: Responder<u32>,
    },
    Call {
        name: String,
        arguments: Vec<AmfValue>,
        reply: Responder<Command>,
    },
    Publish {
        stream_id: u32,
        name: String,
        kind: PublishType,
        reply: Responder<()>,
    },
    Play {
        stream_id: u32,
        name: String,
        reply: Responder<()>,
    },
    Pause {
        stream_id: u32,
        paused: bool,
        reply: Responder<()>,
    },
    Frame {
        stream_id: u32,
        frame: MediaFrame,
    },
    Metadata {
        stream_id: u32,
        metadata: AmfObject,
    },
    Record {
        stream_id: u32,
        recorder: Option<Weak<FlvRecorder>>,
    },
    CloseStream {
        stream_id: u32,
        reply: Option<oneshot::Sender<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Connection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Handshaking,
    Connecting,
    Connected,
    Closed,
}

/// Whatever is waiting on a transaction id
enum Pending {
    Connect,
    CreateStream {
        events: mpsc::UnboundedSender<StreamEvent>,
        reply: Responder<u32>,
    },
    Call(Responder<Command>),
}

pub(crate) struct ClientSession {
    state: ConnectionState,
    handshake: Handshake,
    connect_object: AmfObject,
    chunk_size: u32,
    buffer_length: u32,

    decoder: ChunkDecoder,
    encoder: ChunkEncoder,
    /// Handshake bytes, written ahead of any chunk
    raw_out: BytesMut,

    transactions: TransactionTable<Pending>,
    connect_outcome: Option<Result<()>>,
    streams: HashMap<u32, StreamState>,

    window_ack_size: u32,
    bytes_received: u64,
    last_ack: u64,

    closing: bool,
    close_replies: Vec<oneshot::Sender<()>>,

    stats: Arc<ConnectionStats>,
    events: mpsc::UnboundedSender<StatusEvent>,
}

impl ClientSession {
    pub fn new(
        config: &ClientConfig,
        url: &ParsedUrl,
        stats: Arc<ConnectionStats>,
        events: mpsc::UnboundedSender<StatusEvent>,
    ) -> Self {
        Self {
            state: ConnectionState::Uninitialized,
            handshake: Handshake::with_strict(config.strict_handshake),
            connect_object: connect_object(config, url),
            chunk_size: config.chunk_size,
            buffer_length: config.buffer_length,
            decoder: ChunkDecoder::new(),
            encoder: ChunkEncoder::new(),
            raw_out: BytesMut::new(),
            transactions: TransactionTable::new(),
            connect_outcome: None,
            streams: HashMap::new(),
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            bytes_received: 0,
            last_ack: 0,
            closing: false,
            close_replies: Vec::new(),
            stats,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Queue C0+C1
    pub fn start(&mut self) -> Result<()> {
        if self.state != ConnectionState::Uninitialized {
            return Err(Error::InvalidState(format!("cannot start in state {:?}", self.state)));
        }
        let c0c1 = self.handshake.generate_initial()?;
        self.raw_out.extend_from_slice(&c0c1);
        self.state = ConnectionState::Handshaking;
        Ok(())
    }

    /// Result of the connect command, once known
    pub fn take_connect_outcome(&mut self) -> Option<Result<()>> {
        self.connect_outcome.take()
    }

    /// Any stream the server should currently be feeding; paused streams
    /// go quiet
    pub fn expects_data(&self) -> bool {
        self.streams.values().any(StreamState::expects_data)
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Move queued output into `out`
    pub fn flush(&mut self, out: &mut BytesMut) {
        let before = out.len();
        if !self.raw_out.is_empty() {
            out.extend_from_slice(&self.raw_out.split());
        }
        self.encoder.flush(out);
        self.stats.record_bytes_sent((out.len() - before) as u64);
    }

    /// Process inbound bytes
    ///
    /// `new_bytes` is how much of `buf` arrived since the last call; complete
    /// messages are consumed from `buf`, a partial one stays for later.
    pub fn receive(&mut self, buf: &mut BytesMut, new_bytes: usize) -> Result<()> {
        self.stats.record_bytes_received(new_bytes as u64);
        self.bytes_received += new_bytes as u64;

        if self.state == ConnectionState::Handshaking {
            let Some(c2) = self.handshake.process(buf)? else {
                return Ok(());
            };
            self.raw_out.extend_from_slice(&c2);
            tracing::debug!("Handshake complete");
            self.send_connect();
        }

        if self.state == ConnectionState::Closed || self.state == ConnectionState::Uninitialized {
            return Ok(());
        }

        while let Some(chunk) = self.decoder.decode(buf)? {
            self.dispatch(chunk)?;
        }

        if self.window_ack_size > 0
            && self.bytes_received - self.last_ack >= self.window_ack_size as u64
        {
            self.send_control(RtmpMessage::Acknowledgement {
                sequence: self.bytes_received as u32,
            });
            self.last_ack = self.bytes_received;
        }

        Ok(())
    }

    fn send_connect(&mut self) {
        let id = self.transactions.register(Pending::Connect);
        let cmd = Command::new(CMD_CONNECT, id, vec![])
            .with_object(AmfValue::Object(self.connect_object.clone()));
        self.send_command(cmd);
        self.state = ConnectionState::Connecting;
    }

    // === Inbound ===

    fn dispatch(&mut self, chunk: RtmpChunk) -> Result<()> {
        let stream_id = chunk.stream_id;
        let message = RtmpMessage::from_chunk(&chunk)?;

        match message {
            RtmpMessage::SetChunkSize(size) => {
                tracing::debug!(size = size, "Peer set chunk size");
                self.decoder.set_chunk_size(size)?;
            }

            RtmpMessage::Abort { csid } => {
                self.decoder.abort(csid);
            }

            RtmpMessage::Acknowledgement { sequence } => {
                tracing::trace!(sequence = sequence, "Peer acknowledged");
            }

            RtmpMessage::WindowAckSize(size) => {
                tracing::debug!(size = size, "Window ack size");
                self.window_ack_size = size;
            }

            RtmpMessage::SetPeerBandwidth { size, .. } => {
                self.send_control(RtmpMessage::WindowAckSize(size));
            }

            RtmpMessage::UserControl(event) => self.handle_user_control(event),

            RtmpMessage::Command(cmd) => self.handle_command(cmd),

            RtmpMessage::Data(data) => match self.streams.get_mut(&data.stream_id) {
                Some(stream) => stream.on_data(data),
                None => tracing::trace!(stream_id = data.stream_id, name = %data.name, "Data for unknown stream"),
            },

            RtmpMessage::Audio { timestamp, data } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.on_media(MediaKind::Audio, timestamp, data);
                }
            }

            RtmpMessage::Video { timestamp, data } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.on_media(MediaKind::Video, timestamp, data);
                }
            }

            _ => {
                tracing::trace!(message = ?message, "Unhandled message");
            }
        }

        Ok(())
    }

    fn handle_user_control(&mut self, event: UserControlEvent) {
        match event {
            UserControlEvent::PingRequest(timestamp) => {
                tracing::debug!(timestamp = timestamp, "Ping");
                self.send_control(RtmpMessage::UserControl(UserControlEvent::PingResponse(
                    timestamp,
                )));
            }
            UserControlEvent::StreamBegin(id) => {
                if let Some(stream) = self.streams.get(&id).filter(|s| s.is_playing()) {
                    let chunk = stream.buffer_length_message();
                    self.encoder.encode(&chunk);
                }
            }
            UserControlEvent::StreamEof(id) => {
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.on_eof();
                }
            }
            other => {
                tracing::trace!(event = ?other, "User control");
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd.name.as_str() {
            CMD_RESULT | CMD_ERROR => self.handle_reply(cmd),

            CMD_ON_STATUS => match self.streams.get_mut(&cmd.stream_id) {
                Some(stream) => stream.on_status(&cmd),
                None => {
                    let _ = self.events.send(StatusEvent::from_command(&cmd));
                }
            },

            CMD_ON_BW_DONE | CMD_ON_FC_PUBLISH | CMD_ON_FC_UNPUBLISH => {
                tracing::debug!(command = %cmd.name, "Server notification");
            }

            _ => {
                tracing::trace!(command = %cmd.name, "Unhandled command");
            }
        }
    }

    fn handle_reply(&mut self, cmd: Command) {
        if cmd.transaction_id == 0 {
            tracing::debug!(command = %cmd.name, "Reply without a transaction id, discarding");
            return;
        }
        let Some(pending) = self.transactions.complete(cmd.transaction_id) else {
            tracing::warn!(
                transaction_id = cmd.transaction_id,
                command = %cmd.name,
                "Reply for unknown transaction, discarding"
            );
            return;
        };
        let success = cmd.name == CMD_RESULT;

        match pending {
            Pending::Connect => {
                if success && cmd.status_code() == Some(NC_CONNECT_SUCCESS) {
                    self.on_connected(&cmd);
                } else {
                    self.connect_outcome = Some(Err(command_error(&cmd, NC_CONNECT_FAILED)));
                }
            }

            Pending::CreateStream { events, reply } => {
                let _ = reply.send(if success {
                    self.register_stream(&cmd, events)
                } else {
                    Err(command_error(&cmd, ""))
                });
            }

            Pending::Call(reply) => {
                let _ = reply.send(if success {
                    Ok(cmd)
                } else {
                    Err(command_error(&cmd, ""))
                });
            }
        }
    }

    fn on_connected(&mut self, cmd: &Command) {
        self.state = ConnectionState::Connected;
        tracing::info!(chunk_size = self.chunk_size, "Connected");

        if let Err(e) = self.encoder.set_chunk_size(self.chunk_size) {
            tracing::warn!(error = %e, "Keeping default chunk size");
        }

        let _ = self.events.send(StatusEvent::from_command(cmd));
        self.connect_outcome = Some(Ok(()));
    }

    fn register_stream(&mut self, cmd: &Command, events: mpsc::UnboundedSender<StreamEvent>) -> Result<u32> {
        let id = cmd
            .arguments
            .first()
            .and_then(AmfValue::as_number)
            .filter(|n| n.is_finite() && *n >= 1.0 && *n <= u32::MAX as f64)
            .ok_or_else(|| ProtocolError::InvalidCommand("createStream result without a stream id".into()))?
            as u32;

        if self.streams.contains_key(&id) {
            return Err(Error::InvalidState(format!("stream id {id} already in use")));
        }

        self.streams.insert(id, StreamState::new(id, events, self.stats.clone()));
        tracing::debug!(stream_id = id, "Stream created");
        Ok(id)
    }

    // === Requests ===

    pub fn handle_request(&mut self, request: Request) {
        match request {
            Request::CreateStream { events, reply } => {
                let id = self.transactions.register(Pending::CreateStream { events, reply });
                self.send_command(Command::new(CMD_CREATE_STREAM, id, vec![]));
            }

            Request::Call {
                name,
                arguments,
                reply,
            } => {
                let id = self.transactions.register(Pending::Call(reply));
                self.send_command(Command::new(name, id, arguments));
            }

            Request::Publish {
                stream_id,
                name,
                kind,
                reply,
            } => match self.streams.get_mut(&stream_id) {
                Some(stream) => {
                    let chunks = stream.publish(&name, kind, reply);
                    self.encode_all(&chunks);
                }
                None => {
                    let _ = reply.send(Err(unknown_stream(stream_id)));
                }
            },

            Request::Play {
                stream_id,
                name,
                reply,
            } => match self.streams.get_mut(&stream_id) {
                Some(stream) => {
                    let chunks = stream.play(&name, self.buffer_length, reply);
                    self.encode_all(&chunks);
                }
                None => {
                    let _ = reply.send(Err(unknown_stream(stream_id)));
                }
            },

            Request::Pause {
                stream_id,
                paused,
                reply,
            } => {
                let result = self
                    .streams
                    .get_mut(&stream_id)
                    .ok_or_else(|| unknown_stream(stream_id))
                    .and_then(|stream| stream.pause(paused));
                let _ = reply.send(result.map(|chunk| self.encoder.encode(&chunk)));
            }

            Request::Frame { stream_id, frame } => {
                let result = self
                    .streams
                    .get_mut(&stream_id)
                    .ok_or_else(|| unknown_stream(stream_id))
                    .and_then(|stream| stream.frame_message(&frame));
                match result {
                    Ok(chunk) => self.encoder.encode(&chunk),
                    Err(e) => {
                        self.stats.record_dropped_frame();
                        tracing::debug!(stream_id = stream_id, error = %e, "Dropping frame");
                    }
                }
            }

            Request::Metadata { stream_id, metadata } => {
                let result = self
                    .streams
                    .get_mut(&stream_id)
                    .ok_or_else(|| unknown_stream(stream_id))
                    .and_then(|stream| stream.metadata_message(metadata));
                match result {
                    Ok(chunk) => self.encoder.encode(&chunk),
                    Err(e) => tracing::warn!(stream_id = stream_id, error = %e, "Dropping metadata"),
                }
            }

            Request::Record { stream_id, recorder } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    match recorder {
                        Some(recorder) => stream.attach_recorder(recorder),
                        None => stream.detach_recorder(),
                    }
                }
            }

            Request::CloseStream { stream_id, reply } => {
                if let Some(mut stream) = self.streams.remove(&stream_id) {
                    let chunks = stream.close();
                    self.encode_all(&chunks);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }

            Request::Close { reply } => self.begin_close(Some(reply)),
        }
    }

    /// Queue teardown for every stream; the worker stops after the next flush
    pub fn begin_close(&mut self, reply: Option<oneshot::Sender<()>>) {
        self.close_replies.extend(reply);
        if self.closing {
            return;
        }
        self.closing = true;

        let mut ids: Vec<u32> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(mut stream) = self.streams.remove(&id) {
                let chunks = stream.close();
                self.encode_all(&chunks);
            }
        }
    }

    /// Terminal transition, after the socket is gone
    ///
    /// Emits one `NetConnection.Connect.Closed` and rejects everything still
    /// waiting for the server.
    pub fn finish(&mut self, error: Option<&Error>) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;

        for stream in self.streams.values_mut() {
            stream.abandon();
        }
        self.streams.clear();

        let event = match error {
            None => StatusEvent::local("status", NC_CONNECT_CLOSED, "Connection closed"),
            Some(e) => StatusEvent::local("error", NC_CONNECT_CLOSED, e.to_string()),
        };
        let _ = self.events.send(event);

        for (_, pending) in self.transactions.drain() {
            match pending {
                Pending::Connect => {}
                Pending::CreateStream { reply, .. } => {
                    let _ = reply.send(Err(Error::ConnectionClosed));
                }
                Pending::Call(reply) => {
                    let _ = reply.send(Err(Error::ConnectionClosed));
                }
            }
        }
        if self.connect_outcome.is_none() && self.closing {
            self.connect_outcome = Some(Err(Error::ConnectionClosed));
        }

        for reply in self.close_replies.drain(..) {
            let _ = reply.send(());
        }
        tracing::info!("Connection closed");
    }

    // === Outbound ===

    fn send_command(&mut self, cmd: Command) {
        let stream_id = cmd.stream_id;
        let chunk = RtmpMessage::Command(cmd).to_chunk(CSID_COMMAND, 0, stream_id);
        self.encoder.encode(&chunk);
    }

    fn send_control(&mut self, msg: RtmpMessage) {
        self.encoder.encode(&msg.to_chunk(CSID_PROTOCOL_CONTROL, 0, 0));
    }

    fn encode_all(&mut self, chunks: &[RtmpChunk]) {
        for chunk in chunks {
            self.encoder.encode(chunk);
        }
    }
}

/// The connect command object
fn connect_object(config: &ClientConfig, url: &ParsedUrl) -> AmfObject {
    let mut obj = AmfObject::new();
    obj.insert("app", url.app.as_str());
    obj.insert("type", "nonprivate");
    obj.insert("flashVer", config.flash_ver.as_str());
    if let Some(swf_url) = &config.swf_url {
        obj.insert("swfUrl", swf_url.as_str());
    }
    obj.insert("tcUrl", url.tc_url.as_str());
    obj.insert("fpad", false);
    obj.insert("capabilities", 15.0);
    obj.insert("audioCodecs", 3191.0);
    obj.insert("videoCodecs", 252.0);
    obj.insert("videoFunction", 1.0);
    if let Some(page_url) = &config.page_url {
        obj.insert("pageUrl", page_url.as_str());
    }
    obj.insert("objectEncoding", 0.0);
    obj
}

fn command_error(cmd: &Command, default_code: &str) -> Error {
    Error::Command {
        code: cmd.status_code().unwrap_or(default_code).to_string(),
        description: cmd.status_description().unwrap_or_default().to_string(),
    }
}

fn unknown_stream(stream_id: u32) -> Error {
    Error::InvalidState(format!("no stream with id {stream_id}"))
}

/// Jump straight to sending connect, for tests without a handshake
#[cfg(test)]
pub(crate) fn skip_handshake(session: &mut ClientSession) {
    session.send_connect();
}
