//! NetStream state and handles
//!
//! [`StreamState`] is the worker-owned half: mode, per-media clocks and the
//! optional recorder. [`RtmpStream`] and [`FrameSender`] are the handles the
//! application holds; they only ever send requests to the worker.
//!
//! ```text
//! Idle ──publish──▶ Publishing ──close──▶ Closed
//!   └───play────▶ Playing ◀──pause/resume──▶ Paused
//! ```

use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::amf::{AmfObject, AmfValue};
use crate::client::event::{StatusEvent, StreamEvent};
use crate::client::session::{Request, Responder};
use crate::error::{Error, Result};
use crate::media::{FlvRecorder, FlvTagType, MediaFrame, MediaKind};
use crate::protocol::chunk::RtmpChunk;
use crate::protocol::constants::*;
use crate::protocol::message::{Command, DataMessage, RtmpMessage, UserControlEvent};
use crate::stats::ConnectionStats;

/// How a published stream is kept by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishType {
    #[default]
    Live,
    Record,
    Append,
}

impl PublishType {
    pub fn as_str(self) -> &'static str {
        match self {
            PublishType::Live => "live",
            PublishType::Record => "record",
            PublishType::Append => "append",
        }
    }
}

/// Stream mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Idle,
    Publishing,
    Playing,
    /// Playing, with forwarding suspended
    Paused,
    Closed,
}

/// Stream-relative clock for one media type
///
/// Each input timestamp only contributes its delta from the previous input,
/// so the output starts at zero and never goes backwards: an input that
/// jumps back (encoder restart, `Play.Reset`) adds nothing.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MediaClock {
    last_input: Option<u32>,
    current: u32,
}

impl MediaClock {
    /// Feed the next input timestamp; returns the stream timestamp and the
    /// delta it added
    pub fn advance(&mut self, input: u32) -> (u32, u32) {
        let delta = match self.last_input {
            Some(last) => input.saturating_sub(last),
            None => 0,
        };
        self.last_input = Some(input);
        self.current = self.current.wrapping_add(delta);
        (self.current, delta)
    }

    pub fn current(&self) -> u32 {
        self.current
    }
}

/// Worker-side state of one stream
pub(crate) struct StreamState {
    id: u32,
    mode: StreamMode,
    name: Option<String>,
    buffer_length: u32,
    audio_clock: MediaClock,
    video_clock: MediaClock,
    recorder: Option<Weak<FlvRecorder>>,
    pending_start: Option<Responder<()>>,
    events: mpsc::UnboundedSender<StreamEvent>,
    stats: Arc<ConnectionStats>,
}

impl StreamState {
    pub fn new(id: u32, events: mpsc::UnboundedSender<StreamEvent>, stats: Arc<ConnectionStats>) -> Self {
        Self {
            id,
            mode: StreamMode::Idle,
            name: None,
            buffer_length: DEFAULT_BUFFER_LENGTH,
            audio_clock: MediaClock::default(),
            video_clock: MediaClock::default(),
            recorder: None,
            pending_start: None,
            events,
            stats,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn is_playing(&self) -> bool {
        matches!(self.mode, StreamMode::Playing | StreamMode::Paused)
    }

    pub fn expects_data(&self) -> bool {
        self.mode == StreamMode::Playing
    }

    pub fn buffer_length(&self) -> u32 {
        self.buffer_length
    }

    /// `releaseStream`, `FCPublish`, `publish`; `reply` resolves on
    /// `NetStream.Publish.Start`
    pub fn publish(&mut self, name: &str, kind: PublishType, reply: Responder<()>) -> Vec<RtmpChunk> {
        if self.mode != StreamMode::Idle {
            let _ = reply.send(Err(self.wrong_mode("publish")));
            return Vec::new();
        }

        self.mode = StreamMode::Publishing;
        self.name = Some(name.to_string());
        self.pending_start = Some(reply);
        tracing::info!(stream_id = self.id, name = %name, "Publishing");

        vec![
            command(Command::new(CMD_RELEASE_STREAM, 0, vec![name.into()])),
            command(Command::new(CMD_FC_PUBLISH, 0, vec![name.into()])),
            command(
                Command::new(CMD_PUBLISH, 0, vec![name.into(), kind.as_str().into()]).on_stream(self.id),
            ),
        ]
    }

    /// Buffer length, then `play`; `reply` resolves on `NetStream.Play.Start`
    pub fn play(&mut self, name: &str, buffer_length: u32, reply: Responder<()>) -> Vec<RtmpChunk> {
        if self.mode != StreamMode::Idle {
            let _ = reply.send(Err(self.wrong_mode("play")));
            return Vec::new();
        }

        self.mode = StreamMode::Playing;
        self.name = Some(name.to_string());
        self.buffer_length = buffer_length;
        self.pending_start = Some(reply);
        tracing::info!(stream_id = self.id, name = %name, "Playing");

        vec![
            self.buffer_length_message(),
            command(
                Command::new(
                    CMD_PLAY,
                    0,
                    vec![
                        name.into(),
                        AmfValue::Number(-2.0), // Start: live or recorded
                        AmfValue::Number(-1.0), // Duration: play until end
                        AmfValue::Boolean(true), // Reset
                    ],
                )
                .on_stream(self.id),
            ),
        ]
    }

    /// `SetBufferLength` for this stream
    pub fn buffer_length_message(&self) -> RtmpChunk {
        RtmpMessage::UserControl(UserControlEvent::SetBufferLength {
            stream_id: self.id,
            buffer_ms: self.buffer_length,
        })
        .to_chunk(CSID_PROTOCOL_CONTROL, 0, 0)
    }

    /// Suspend or resume forwarding; the clocks keep running
    pub fn pause(&mut self, paused: bool) -> Result<RtmpChunk> {
        self.mode = match (self.mode, paused) {
            (StreamMode::Playing, true) => StreamMode::Paused,
            (StreamMode::Paused, false) => StreamMode::Playing,
            _ => return Err(self.wrong_mode(if paused { "pause" } else { "resume" })),
        };
        tracing::debug!(stream_id = self.id, paused, "Pause toggled");

        let position = self.audio_clock.current().max(self.video_clock.current());
        Ok(command(
            Command::new(
                CMD_PAUSE,
                0,
                vec![AmfValue::Boolean(paused), AmfValue::Number(position as f64)],
            )
            .on_stream(self.id),
        ))
    }

    /// Wrap an encoded frame for the wire
    pub fn frame_message(&mut self, frame: &MediaFrame) -> Result<RtmpChunk> {
        if self.mode != StreamMode::Publishing {
            return Err(self.wrong_mode("send media"));
        }

        let body = frame.to_tag_body()?;
        let kind = frame.kind();
        let clock = self.clock_mut(kind);
        // Decoder configuration is stamped but does not move the clock
        let (timestamp, delta) = if frame.sequence_header {
            (clock.current(), 0)
        } else {
            clock.advance(frame.timestamp)
        };

        self.record(kind.into(), delta, body.clone());
        self.stats.record_frame_sent(kind);

        let (csid, message_type) = match kind {
            MediaKind::Audio => (CSID_AUDIO, MSG_AUDIO),
            MediaKind::Video => (CSID_VIDEO, MSG_VIDEO),
        };
        Ok(RtmpChunk {
            csid,
            timestamp,
            message_type,
            stream_id: self.id,
            payload: body,
        })
    }

    /// `@setDataFrame onMetaData`, stamped with the video clock
    pub fn metadata_message(&mut self, metadata: AmfObject) -> Result<RtmpChunk> {
        if self.mode != StreamMode::Publishing {
            return Err(self.wrong_mode("send metadata"));
        }

        let on_disk = DataMessage {
            name: CMD_ON_METADATA.to_string(),
            values: vec![AmfValue::EcmaArray(metadata.clone())],
            stream_id: self.id,
        };
        self.record(FlvTagType::Script, 0, on_disk.encode());

        Ok(RtmpMessage::Data(DataMessage::set_data_frame(metadata, self.id)).to_chunk(
            CSID_DATA,
            self.video_clock.current(),
            self.id,
        ))
    }

    pub fn on_status(&mut self, cmd: &Command) {
        let event = StatusEvent::from_command(cmd);
        tracing::debug!(stream_id = self.id, code = %event.code, "Stream status");

        match event.code.as_str() {
            NS_PUBLISH_START | NS_PLAY_START => {
                if let Some(reply) = self.pending_start.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            NS_PLAY_STOP => {
                tracing::info!(stream_id = self.id, "Server stopped playback");
            }
            _ if event.is_error() => {
                if let Some(reply) = self.pending_start.take() {
                    self.mode = StreamMode::Idle;
                    self.name = None;
                    let _ = reply.send(Err(Error::Command {
                        code: event.code.clone(),
                        description: event.description.clone(),
                    }));
                }
            }
            _ => {}
        }

        self.emit(StreamEvent::Status(event));
    }

    /// Inbound audio/video message
    pub fn on_media(&mut self, kind: MediaKind, timestamp: u32, body: Bytes) {
        if !self.is_playing() {
            tracing::trace!(stream_id = self.id, "Media on a stream that is not playing");
            return;
        }
        if body.is_empty() {
            return;
        }

        let (timestamp, delta) = self.clock_mut(kind).advance(timestamp);
        if self.mode == StreamMode::Paused {
            return;
        }

        self.record(kind.into(), delta, body.clone());

        match MediaFrame::from_tag_body(kind, timestamp, body) {
            Ok(frame) => {
                self.stats.record_frame_received(kind, frame.keyframe);
                self.emit(StreamEvent::Media(frame));
            }
            Err(e) => {
                tracing::debug!(stream_id = self.id, error = %e, "Skipping undecodable media message");
            }
        }
    }

    /// Inbound data message
    pub fn on_data(&mut self, data: DataMessage) {
        if self.mode != StreamMode::Playing {
            return;
        }
        self.record(FlvTagType::Script, 0, data.encode());
        self.emit(StreamEvent::Data(data));
    }

    pub fn on_eof(&mut self) {
        tracing::debug!(stream_id = self.id, "Stream EOF");
        self.emit(StreamEvent::Eof);
    }

    pub fn attach_recorder(&mut self, recorder: Weak<FlvRecorder>) {
        let Some(path) = recorder.upgrade().map(|r| r.path().display().to_string()) else {
            return;
        };
        self.detach_recorder();
        self.recorder = Some(recorder);
        self.emit(StreamEvent::Status(StatusEvent::local("status", NS_RECORD_START, path)));
    }

    pub fn detach_recorder(&mut self) {
        if self.recorder.take().is_some() {
            self.emit(StreamEvent::Status(StatusEvent::local("status", NS_RECORD_STOP, "")));
        }
    }

    /// Teardown commands for an orderly close
    pub fn close(&mut self) -> Vec<RtmpChunk> {
        let mut chunks = Vec::new();
        let name: AmfValue = self.name.clone().unwrap_or_default().into();

        if self.mode == StreamMode::Publishing {
            chunks.push(command(Command::new(CMD_FC_UNPUBLISH, 0, vec![name])));
        }
        if matches!(
            self.mode,
            StreamMode::Publishing | StreamMode::Playing | StreamMode::Paused
        ) {
            chunks.push(command(Command::new(CMD_CLOSE_STREAM, 0, vec![]).on_stream(self.id)));
        }
        if self.mode != StreamMode::Closed {
            chunks.push(command(Command::new(
                CMD_DELETE_STREAM,
                0,
                vec![AmfValue::Number(self.id as f64)],
            )));
        }

        self.shut_down(Error::InvalidState("stream closed".into()));
        tracing::debug!(stream_id = self.id, "Stream closed");
        chunks
    }

    /// Connection went away under the stream
    pub fn abandon(&mut self) {
        self.shut_down(Error::ConnectionClosed);
    }

    fn shut_down(&mut self, pending_error: Error) {
        self.detach_recorder();
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(pending_error));
        }
        self.mode = StreamMode::Closed;
    }

    fn record(&mut self, tag_type: FlvTagType, delta: u32, body: Bytes) {
        let Some(weak) = &self.recorder else {
            return;
        };
        let Some(recorder) = weak.upgrade() else {
            tracing::debug!(stream_id = self.id, "Recorder dropped, detaching");
            self.detach_recorder();
            return;
        };

        match recorder.append(tag_type, delta, body) {
            Ok(()) => {}
            Err(Error::RecorderClosed) => self.detach_recorder(),
            Err(e) => {
                tracing::warn!(stream_id = self.id, error = %e, "Recording failed");
                self.recorder = None;
                self.emit(StreamEvent::Status(StatusEvent::local(
                    "error",
                    NS_RECORD_FAILED,
                    e.to_string(),
                )));
            }
        }
    }

    fn clock_mut(&mut self, kind: MediaKind) -> &mut MediaClock {
        match kind {
            MediaKind::Audio => &mut self.audio_clock,
            MediaKind::Video => &mut self.video_clock,
        }
    }

    fn emit(&self, event: StreamEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn wrong_mode(&self, what: &str) -> Error {
        Error::InvalidState(format!("cannot {what} on stream {} in mode {:?}", self.id, self.mode))
    }
}

fn command(cmd: Command) -> RtmpChunk {
    let stream_id = cmd.stream_id;
    RtmpMessage::Command(cmd).to_chunk(CSID_COMMAND, 0, stream_id)
}

/// Handle to one stream of a connection
///
/// Dropping the handle closes the stream.
pub struct RtmpStream {
    id: u32,
    requests: mpsc::Sender<Request>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    stats: Arc<ConnectionStats>,
    closed: bool,
}

impl RtmpStream {
    pub(crate) fn new(
        id: u32,
        requests: mpsc::Sender<Request>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self {
            id,
            requests,
            events,
            stats,
            closed: false,
        }
    }

    /// Message stream id assigned by the server
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Start publishing `name`; resolves once the server confirms
    pub async fn publish(&self, name: &str, kind: PublishType) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Publish {
            stream_id: self.id,
            name: name.to_string(),
            kind,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Start playing `name`; resolves once the server confirms
    pub async fn play(&self, name: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Play {
            stream_id: self.id,
            name: name.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Stop forwarding inbound media without losing timestamp continuity
    pub async fn pause(&self) -> Result<()> {
        self.set_paused(true).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.set_paused(false).await
    }

    async fn set_paused(&self, paused: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Pause {
            stream_id: self.id,
            paused,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// A cloneable, thread-safe frame sink for encoder callbacks
    pub fn frame_sender(&self) -> FrameSender {
        FrameSender {
            stream_id: self.id,
            requests: self.requests.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Queue one encoded frame
    pub fn send_frame(&self, frame: MediaFrame) -> Result<()> {
        self.frame_sender().send_frame(frame)
    }

    /// Queue `@setDataFrame onMetaData` with the given properties
    pub fn send_metadata(&self, metadata: AmfObject) -> Result<()> {
        self.try_request(Request::Metadata {
            stream_id: self.id,
            metadata,
        })
    }

    /// Write this stream's audio, video and data messages to `recorder`
    ///
    /// The stream only keeps a weak reference; dropping the recorder stops
    /// the recording.
    pub fn record_to(&self, recorder: &Arc<FlvRecorder>) -> Result<()> {
        self.try_request(Request::Record {
            stream_id: self.id,
            recorder: Some(Arc::downgrade(recorder)),
        })
    }

    pub fn stop_recording(&self) -> Result<()> {
        self.try_request(Request::Record {
            stream_id: self.id,
            recorder: None,
        })
    }

    /// Next status, media or data event; `None` once the stream is gone
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Send the teardown commands and unregister the stream
    ///
    /// Failures are logged; the stream is gone either way.
    pub async fn close(mut self) {
        self.closed = true;
        let (reply, rx) = oneshot::channel();
        let sent = self
            .request(Request::CloseStream {
                stream_id: self.id,
                reply: Some(reply),
            })
            .await;
        if sent.is_err() || rx.await.is_err() {
            tracing::debug!(stream_id = self.id, "Connection already closed, stream dropped");
        }
    }

    async fn request(&self, request: Request) -> Result<()> {
        self.requests.send(request).await.map_err(|_| Error::ConnectionClosed)
    }

    fn try_request(&self, request: Request) -> Result<()> {
        self.requests.try_send(request).map_err(queue_error)
    }
}

impl Drop for RtmpStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let request = Request::CloseStream {
            stream_id: self.id,
            reply: None,
        };
        match self.requests.try_send(request) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            // Wait for room off the dropping thread
            Err(TrySendError::Full(request)) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let requests = self.requests.clone();
                    handle.spawn(async move {
                        let _ = requests.send(request).await;
                    });
                }
                Err(_) => {
                    tracing::warn!(stream_id = self.id, "Request queue full, stream left open until the connection closes");
                }
            },
        }
    }
}

impl std::fmt::Debug for RtmpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmpStream").field("id", &self.id).finish()
    }
}

/// Hands encoded frames to the connection worker from any thread
#[derive(Debug, Clone)]
pub struct FrameSender {
    stream_id: u32,
    requests: mpsc::Sender<Request>,
    stats: Arc<ConnectionStats>,
}

impl FrameSender {
    /// Queue one encoded frame; never blocks
    ///
    /// When the socket falls behind and the queue fills up, the frame is
    /// dropped, counted, and [`Error::QueueFull`] is returned.
    pub fn send_frame(&self, frame: MediaFrame) -> Result<()> {
        self.requests
            .try_send(Request::Frame {
                stream_id: self.stream_id,
                frame,
            })
            .map_err(|e| {
                self.stats.record_dropped_frame();
                queue_error(e)
            })
    }
}

fn queue_error<T>(err: TrySendError<T>) -> Error {
    match err {
        TrySendError::Full(_) => Error::QueueFull,
        TrySendError::Closed(_) => Error::ConnectionClosed,
    }
}
