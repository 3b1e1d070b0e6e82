//! Client connection
//!
//! [`RtmpConnection::connect`] runs the handshake and `connect` command on a
//! fresh socket, retrying with Adobe authentication when the server asks for
//! it, and then hands the socket to a worker task. The worker owns the
//! [`ClientSession`] and is the only place the socket is read or written;
//! handles talk to it over a channel.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};

use crate::amf::AmfValue;
use crate::client::auth::{AdobeAuth, AuthDecision};
use crate::client::config::{ClientConfig, ParsedUrl};
use crate::client::event::StatusEvent;
use crate::client::session::{ClientSession, ConnectionState, Request};
use crate::client::stream::RtmpStream;
use crate::error::{Error, HandshakeError, Result};
use crate::protocol::constants::NC_CONNECT_REJECTED;
use crate::protocol::message::Command;
use crate::stats::{ConnectionStats, SessionStats};

const BUFFER_SIZE: usize = 64 * 1024;

/// Handle to a connected RTMP session
///
/// Cheap to clone. The connection closes when [`close`](Self::close) is
/// called or when every handle, stream and frame sender is dropped.
#[derive(Clone)]
pub struct RtmpConnection {
    requests: mpsc::Sender<Request>,
    stats: Arc<ConnectionStats>,
}

impl RtmpConnection {
    /// Connect to `config.url`
    ///
    /// Returns the handle and the receiver for connection status events. The
    /// first event is `NetConnection.Connect.Success`, the last is always
    /// `NetConnection.Connect.Closed`.
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StatusEvent>)> {
        let parsed = config.parse_url()?;
        let auth = match (&parsed.user, &parsed.password) {
            (Some(user), Some(password)) => Some(AdobeAuth::new(user.as_str(), password.as_str())),
            _ => None,
        };

        let mut url = parsed.clone();
        let mut auth_attempts = 0;

        loop {
            let attempt = timeout(config.connect_timeout, establish(&config, &url))
                .await
                .map_err(|_| Error::Timeout)?;

            let (code, description) = match attempt {
                Ok(connected) => return Ok(connected),
                Err(Error::Command { code, description }) if code == NC_CONNECT_REJECTED => {
                    (code, description)
                }
                Err(e) => return Err(e),
            };

            let Some(auth) = &auth else {
                return Err(Error::Command { code, description });
            };

            match auth.on_rejected(&description) {
                AuthDecision::Retry(query) => {
                    if auth_attempts >= config.max_auth_attempts {
                        return Err(Error::Auth(format!(
                            "still rejected after {auth_attempts} attempts"
                        )));
                    }
                    auth_attempts += 1;
                    tracing::debug!(attempt = auth_attempts, "Server requested authentication, reconnecting");
                    url = parsed.with_query(&query);
                }
                AuthDecision::Failed(reason) => return Err(Error::Auth(reason)),
                AuthDecision::NotAuth => return Err(Error::Command { code, description }),
            }
        }
    }

    /// Ask the server for a new message stream
    pub async fn create_stream(&self) -> Result<RtmpStream> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (reply, rx) = oneshot::channel();
        self.request(Request::CreateStream { events, reply }).await?;
        let id = rx.await.map_err(|_| Error::ConnectionClosed)??;

        Ok(RtmpStream::new(id, self.requests.clone(), events_rx, self.stats.clone()))
    }

    /// Invoke an arbitrary server method and wait for its `_result`
    ///
    /// An `_error` reply becomes [`Error::Command`].
    pub async fn call(&self, name: &str, arguments: Vec<AmfValue>) -> Result<Command> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Call {
            name: name.to_string(),
            arguments,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    /// Tear down every stream, then the socket
    ///
    /// Resolves once the connection is gone. Closing twice is a no-op.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.request(Request::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn request(&self, request: Request) -> Result<()> {
        self.requests.send(request).await.map_err(|_| Error::ConnectionClosed)
    }
}

impl std::fmt::Debug for RtmpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmpConnection")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One connection attempt: socket, handshake, `connect`
async fn establish(
    config: &ClientConfig,
    url: &ParsedUrl,
) -> Result<(RtmpConnection, mpsc::UnboundedReceiver<StatusEvent>)> {
    let addr = url.addr();
    tracing::debug!(addr = %addr, app = %url.app, "Connecting");

    let socket = TcpStream::connect(&addr).await?;
    if config.tcp_nodelay {
        socket.set_nodelay(true)?;
    }
    let (read_half, write_half) = tokio::io::split(socket);

    let stats = Arc::new(ConnectionStats::new());
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let mut worker = Worker {
        session: ClientSession::new(config, url, stats.clone(), events_tx),
        reader: BufReader::with_capacity(BUFFER_SIZE, read_half),
        writer: BufWriter::with_capacity(BUFFER_SIZE, write_half),
        read_buf: BytesMut::with_capacity(BUFFER_SIZE),
        write_buf: BytesMut::with_capacity(BUFFER_SIZE),
        read_timeout: config.read_timeout,
    };

    worker.session.start()?;
    loop {
        worker.flush().await?;
        if let Some(outcome) = worker.session.take_connect_outcome() {
            outcome?;
            break;
        }
        worker.read().await?;
    }

    let (requests, requests_rx) = mpsc::channel(config.request_capacity.max(1));
    tokio::spawn(worker.run(requests_rx));

    Ok((RtmpConnection { requests, stats }, events_rx))
}

enum Wake {
    Request(Option<Request>),
    Read(io::Result<usize>),
    ReadTimeout,
}

/// Owner of the socket and the session
struct Worker {
    session: ClientSession,
    reader: BufReader<ReadHalf<TcpStream>>,
    writer: BufWriter<WriteHalf<TcpStream>>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    read_timeout: Duration,
}

impl Worker {
    async fn run(mut self, requests: mpsc::Receiver<Request>) {
        let result = self.process(requests).await;

        match &result {
            Err(e) if e.is_fatal() => tracing::warn!(error = %e, "Connection lost"),
            Err(e) => tracing::debug!(error = %e, "Connection worker stopped"),
            Ok(()) => {}
        }
        if let Err(e) = self.writer.shutdown().await {
            tracing::trace!(error = %e, "Socket shutdown failed");
        }

        self.session.finish(result.err().as_ref());
    }

    async fn process(&mut self, mut requests: mpsc::Receiver<Request>) -> Result<()> {
        let mut last_read = Instant::now();

        loop {
            self.flush().await?;
            if self.session.is_closing() {
                return Ok(());
            }

            let expecting = self.session.expects_data();
            if !expecting {
                last_read = Instant::now();
            }
            let deadline = last_read + self.read_timeout;

            let wake = tokio::select! {
                request = requests.recv() => Wake::Request(request),
                read = self.reader.read_buf(&mut self.read_buf) => Wake::Read(read),
                _ = tokio::time::sleep_until(deadline), if expecting => Wake::ReadTimeout,
            };

            match wake {
                Wake::Request(Some(request)) => self.session.handle_request(request),
                Wake::Request(None) => {
                    tracing::debug!("All handles dropped, closing");
                    self.session.begin_close(None);
                }
                Wake::Read(read) => {
                    let n = read?;
                    if n == 0 {
                        return Err(Error::ConnectionClosed);
                    }
                    last_read = Instant::now();
                    self.session.receive(&mut self.read_buf, n)?;
                }
                Wake::ReadTimeout => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data from server").into());
                }
            }
        }
    }

    async fn read(&mut self) -> Result<()> {
        let n = self.reader.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Err(match self.session.state() {
                ConnectionState::Handshaking => HandshakeError::ConnectionClosed.into(),
                _ => Error::ConnectionClosed,
            });
        }
        self.session.receive(&mut self.read_buf, n)
    }

    async fn flush(&mut self) -> Result<()> {
        self.session.flush(&mut self.write_buf);
        if !self.write_buf.is_empty() {
            self.writer.write_all(&self.write_buf).await?;
            self.writer.flush().await?;
            self.write_buf.clear();
        }
        Ok(())
    }
}
