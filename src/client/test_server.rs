//! In-process server for exercising the connection worker over real sockets

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::amf::{AmfObject, AmfValue};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, RtmpChunk};
use crate::protocol::constants::*;
use crate::protocol::message::{Command, RtmpMessage, UserControlEvent};

pub(crate) struct TestServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TestServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    /// `rtmp://127.0.0.1:<port>/<path>`, with optional credentials
    pub fn url(&self, userinfo: Option<&str>, path: &str) -> String {
        match userinfo {
            Some(userinfo) => format!("rtmp://{userinfo}@{}/{path}", self.addr),
            None => format!("rtmp://{}/{path}", self.addr),
        }
    }

    pub async fn accept(&self) -> ServerConn {
        let (socket, _) = self.listener.accept().await.unwrap();
        ServerConn {
            socket,
            decoder: ChunkDecoder::new(),
            encoder: ChunkEncoder::new(),
            buf: BytesMut::new(),
        }
    }
}

pub(crate) struct ServerConn {
    socket: TcpStream,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,
    buf: BytesMut,
}

impl ServerConn {
    /// Answer C0C1 with S0S1S2; a corrupted echo makes S2 differ from C1
    pub async fn handshake(&mut self, corrupt_echo: bool) {
        let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
        self.socket.read_exact(&mut c0c1).await.unwrap();
        assert_eq!(c0c1[0], RTMP_VERSION);

        let mut reply = BytesMut::with_capacity(1 + 2 * HANDSHAKE_SIZE);
        reply.put_u8(RTMP_VERSION);
        reply.put_slice(&[0u8; 8]);
        reply.extend((8..HANDSHAKE_SIZE).map(|i| (i * 7 % 256) as u8));
        let mut s2 = c0c1[1..].to_vec();
        if corrupt_echo {
            s2[HANDSHAKE_SIZE - 1] ^= 0xFF;
        }
        reply.put_slice(&s2);
        self.socket.write_all(&reply).await.unwrap();

        if !corrupt_echo {
            let mut c2 = vec![0u8; HANDSHAKE_SIZE];
            self.socket.read_exact(&mut c2).await.unwrap();
            // C2 echoes S1's random bytes
            assert_eq!(&c2[8..], &reply[9..1 + HANDSHAKE_SIZE]);
        }
    }

    /// Next message from the client; `None` once the client hung up
    pub async fn recv_chunk(&mut self) -> Option<RtmpChunk> {
        loop {
            if let Some(chunk) = self.decoder.decode(&mut self.buf).unwrap() {
                if chunk.message_type == MSG_SET_CHUNK_SIZE {
                    let size = u32::from_be_bytes(chunk.payload[..4].try_into().unwrap());
                    self.decoder.set_chunk_size(size).unwrap();
                }
                return Some(chunk);
            }
            match self.socket.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    pub async fn recv(&mut self) -> Option<RtmpMessage> {
        let chunk = self.recv_chunk().await?;
        Some(RtmpMessage::from_chunk(&chunk).unwrap())
    }

    /// Next command, skipping protocol control
    pub async fn recv_command(&mut self) -> Command {
        loop {
            match self.recv().await {
                Some(RtmpMessage::Command(cmd)) => return cmd,
                Some(_) => continue,
                None => panic!("client hung up while a command was expected"),
            }
        }
    }

    /// Every command name until the client hangs up
    pub async fn drain_commands(&mut self) -> Vec<String> {
        let mut names = Vec::new();
        while let Some(msg) = self.recv().await {
            if let RtmpMessage::Command(cmd) = msg {
                names.push(cmd.name);
            }
        }
        names
    }

    pub async fn send(&mut self, msg: RtmpMessage, csid: u32, timestamp: u32, stream_id: u32) {
        let mut out = BytesMut::new();
        self.encoder
            .encode_to(&msg.to_chunk(csid, timestamp, stream_id), &mut out);
        self.socket.write_all(&out).await.unwrap();
    }

    pub async fn send_command(&mut self, cmd: Command) {
        let stream_id = cmd.stream_id;
        self.send(RtmpMessage::Command(cmd), CSID_COMMAND, 0, stream_id).await;
    }

    pub async fn send_status(&mut self, stream_id: u32, level: &str, code: &str) {
        self.send_command(Command::new(CMD_ON_STATUS, 0, vec![info(level, code, "")]).on_stream(stream_id))
            .await;
    }

    pub async fn send_video(&mut self, stream_id: u32, timestamp: u32, body: Bytes) {
        self.send(
            RtmpMessage::Video { timestamp, data: body },
            CSID_VIDEO,
            timestamp,
            stream_id,
        )
        .await;
    }

    pub async fn send_user_control(&mut self, event: UserControlEvent) {
        self.send(RtmpMessage::UserControl(event), CSID_PROTOCOL_CONTROL, 0, 0)
            .await;
    }

    /// Expect `connect` and accept it
    pub async fn accept_connect(&mut self) -> Command {
        let connect = self.recv_command().await;
        assert_eq!(connect.name, CMD_CONNECT);
        self.send(RtmpMessage::WindowAckSize(DEFAULT_WINDOW_ACK_SIZE), CSID_PROTOCOL_CONTROL, 0, 0)
            .await;
        self.send_command(
            Command::new(
                CMD_RESULT,
                connect.transaction_id,
                vec![info("status", NC_CONNECT_SUCCESS, "Connection succeeded.")],
            )
            .with_object(AmfValue::Object(AmfObject::from([("fmsVer", "FMS/3,5,7,7009")]))),
        )
        .await;
        connect
    }

    /// Expect `connect` and reject it with `description`
    pub async fn reject_connect(&mut self, description: &str) -> Command {
        let connect = self.recv_command().await;
        assert_eq!(connect.name, CMD_CONNECT);
        self.send_command(Command::new(
            CMD_ERROR,
            connect.transaction_id,
            vec![info("error", NC_CONNECT_REJECTED, description)],
        ))
        .await;
        connect
    }

    /// Expect `createStream` and answer with `stream_id`
    pub async fn accept_create_stream(&mut self, stream_id: u32) {
        let cmd = self.recv_command().await;
        assert_eq!(cmd.name, CMD_CREATE_STREAM);
        self.send_command(Command::new(
            CMD_RESULT,
            cmd.transaction_id,
            vec![AmfValue::Number(stream_id as f64)],
        ))
        .await;
    }
}

pub(crate) fn info(level: &str, code: &str, description: &str) -> AmfValue {
    AmfValue::Object(AmfObject::from([
        ("level", level),
        ("code", code),
        ("description", description),
    ]))
}

/// `app` from a connect command object
pub(crate) fn connect_app(connect: &Command) -> String {
    connect
        .command_object
        .as_object()
        .and_then(|obj| obj.get("app"))
        .and_then(AmfValue::as_str)
        .unwrap_or_default()
        .to_string()
}
