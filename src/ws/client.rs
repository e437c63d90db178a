//! WebSocket client over a registry socket: upgrade handshake, framed
//! send/receive and control-frame handling.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::frame::{read_frame, write_frame, Frame, FrameIo, Opcode};
use crate::error::{AppError, AppResult};
use crate::net::http::parse_head;
use crate::net::{AddressFamily, SocketKind, SocketRegistry};

/// Registry name of the WebSocket connection.
pub const WEBSOCKET_SOCKET: &str = "websocket";

const MAX_HANDSHAKE_HEAD: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WsState {
    Disconnected,
    Connecting,
    HandshakeSent,
    Established,
    Closed,
}

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete text message.
    Text(String),
    /// A frame was consumed but there is nothing to deliver (ping, pong, binary).
    Empty,
    /// The server closed the connection; the socket is gone.
    Closed,
}

/// Target of a WebSocket connection.
#[derive(Debug, Clone)]
pub struct WsEndpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub use_tls: bool,
    /// Sent verbatim after the standard upgrade headers.
    pub extra_headers: Vec<(String, String)>,
}

impl WsEndpoint {
    pub fn new(host: &str, port: u16, path: &str, use_tls: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
            use_tls,
            extra_headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.extra_headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Upgrade request text for the given `Sec-WebSocket-Key`.
    pub fn upgrade_request(&self, key: &str) -> String {
        let host = match (self.use_tls, self.port) {
            (true, 443) | (false, 80) => self.host.clone(),
            _ => format!("{}:{}", self.host, self.port),
        };
        let mut request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n",
            self.path, host, key
        );
        for (name, value) in &self.extra_headers {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
        request.push_str("\r\n");
        request
    }
}

/// Fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    BASE64.encode(nonce)
}

/// Check a handshake response head: status 101 and a `Sec-WebSocket-Accept` header.
pub fn validate_handshake(head: &[u8]) -> AppResult<()> {
    let (status, reason, headers) =
        parse_head(head).map_err(|e| AppError::Handshake(e.to_string()))?;
    if status != 101 {
        return Err(AppError::Handshake(format!(
            "expected 101 Switching Protocols, got {} {}",
            status, reason
        )));
    }
    if !headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("Sec-WebSocket-Accept"))
    {
        return Err(AppError::Handshake("missing Sec-WebSocket-Accept header".to_string()));
    }
    Ok(())
}

struct RegistryIo<'a> {
    registry: &'a SocketRegistry,
    socket: &'a str,
    use_tls: bool,
}

#[async_trait]
impl<'a> FrameIo for RegistryIo<'a> {
    async fn read_exact(&mut self, len: usize) -> AppResult<Vec<u8>> {
        self.registry
            .receive_exact(self.socket.into(), len, self.use_tls)
            .await
    }

    async fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        self.registry
            .send(self.socket.into(), data, self.use_tls)
            .await
            .map(|_| ())
    }
}

#[derive(Debug)]
struct Connection {
    state: WsState,
    use_tls: bool,
}

/// Client side of one WebSocket connection. Clones share the connection and its state.
#[derive(Clone)]
pub struct WsClient {
    registry: SocketRegistry,
    socket: String,
    connection: Arc<RwLock<Connection>>,
}

impl WsClient {
    pub fn new(registry: SocketRegistry) -> Self {
        Self::with_socket_name(registry, WEBSOCKET_SOCKET)
    }

    pub fn with_socket_name(registry: SocketRegistry, socket: &str) -> Self {
        Self {
            registry,
            socket: socket.to_string(),
            connection: Arc::new(RwLock::new(Connection {
                state: WsState::Disconnected,
                use_tls: false,
            })),
        }
    }

    pub async fn state(&self) -> WsState {
        self.connection.read().await.state
    }

    pub fn socket_name(&self) -> &str {
        &self.socket
    }

    async fn set_state(&self, state: WsState) {
        self.connection.write().await.state = state;
    }

    /// Connect and complete the upgrade handshake. On any failure the socket is
    /// removed and the state is `Closed`.
    #[instrument(skip(self, endpoint), fields(host = %endpoint.host, port = endpoint.port, path = %endpoint.path))]
    pub async fn connect(&self, endpoint: &WsEndpoint) -> AppResult<()> {
        {
            let mut conn = self.connection.write().await;
            conn.state = WsState::Connecting;
            conn.use_tls = endpoint.use_tls;
        }
        match self.handshake(endpoint).await {
            Ok(()) => {
                self.set_state(WsState::Established).await;
                info!(socket = %self.socket, host = %endpoint.host, "websocket established");
                Ok(())
            }
            Err(e) => {
                warn!(socket = %self.socket, error = %e, "websocket connect failed");
                self.discard().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, endpoint: &WsEndpoint) -> AppResult<()> {
        if self.registry.contains(&self.socket).await {
            self.registry.remove(self.socket.as_str().into()).await?;
        }
        self.registry
            .create(&self.socket, SocketKind::Stream, AddressFamily::Ipv4)
            .await?;
        self.registry
            .connect(self.socket.as_str().into(), &endpoint.host, endpoint.port, endpoint.use_tls)
            .await?;

        let request = endpoint.upgrade_request(&generate_key());
        self.registry
            .send(self.socket.as_str().into(), request.as_bytes(), endpoint.use_tls)
            .await?;
        self.set_state(WsState::HandshakeSent).await;

        let head = self.read_head(endpoint.use_tls).await?;
        validate_handshake(&head)
    }

    /// Read the response head one byte at a time so no frame bytes are consumed.
    async fn read_head(&self, use_tls: bool) -> AppResult<Vec<u8>> {
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() >= MAX_HANDSHAKE_HEAD {
                return Err(AppError::Handshake("response head too large".to_string()));
            }
            let read = self
                .registry
                .receive(self.socket.as_str().into(), &mut byte, use_tls)
                .await?;
            if read == 0 {
                return Err(AppError::Handshake(
                    "connection closed during handshake".to_string(),
                ));
            }
            head.push(byte[0]);
        }
        debug!(socket = %self.socket, bytes = head.len(), "handshake response received");
        Ok(head)
    }

    async fn established_tls(&self) -> AppResult<bool> {
        let conn = self.connection.read().await;
        if conn.state != WsState::Established {
            return Err(AppError::Protocol(format!(
                "websocket is {:?}, not established",
                conn.state
            )));
        }
        Ok(conn.use_tls)
    }

    /// Send one masked frame.
    pub async fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> AppResult<()> {
        let use_tls = self.established_tls().await?;
        let mut io = RegistryIo {
            registry: &self.registry,
            socket: &self.socket,
            use_tls,
        };
        write_frame(&mut io, &Frame::client(opcode, payload.to_vec())).await
    }

    pub async fn send_text(&self, text: &str) -> AppResult<()> {
        self.send_frame(Opcode::Text, text.as_bytes()).await
    }

    /// Read and handle one frame. Pings are answered here; a close frame tears
    /// the connection down, and so does a protocol violation.
    pub async fn receive(&self) -> AppResult<Inbound> {
        let use_tls = self.established_tls().await?;
        let read = {
            let mut io = RegistryIo {
                registry: &self.registry,
                socket: &self.socket,
                use_tls,
            };
            read_frame(&mut io).await
        };
        let frame = match read {
            Ok(frame) => frame,
            Err(e) => return Err(self.abort_on_protocol_error(e).await),
        };

        match frame.opcode {
            Opcode::Continuation => Err(self
                .abort_on_protocol_error(AppError::Protocol(
                    "continuation frames are not supported".to_string(),
                ))
                .await),
            Opcode::Text | Opcode::Binary if !frame.fin => Err(self
                .abort_on_protocol_error(AppError::Protocol(format!(
                    "fragmented {:?} messages are not supported",
                    frame.opcode
                )))
                .await),
            Opcode::Text => Ok(Inbound::Text(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            )),
            Opcode::Binary => {
                warn!(socket = %self.socket, bytes = frame.payload.len(), "dropping binary frame");
                Ok(Inbound::Empty)
            }
            Opcode::Ping => {
                debug!(socket = %self.socket, bytes = frame.payload.len(), "ping, sending pong");
                self.send_frame(Opcode::Pong, &frame.payload).await?;
                Ok(Inbound::Empty)
            }
            Opcode::Pong => Ok(Inbound::Empty),
            Opcode::Close => {
                info!(socket = %self.socket, code = ?frame.close_code(), "server closed websocket");
                self.discard().await;
                Ok(Inbound::Closed)
            }
        }
    }

    async fn abort_on_protocol_error(&self, err: AppError) -> AppError {
        if matches!(err, AppError::Protocol(_)) {
            warn!(socket = %self.socket, error = %err, "protocol violation, dropping connection");
            self.discard().await;
        }
        err
    }

    /// Send a close frame (best effort), then close and remove the socket.
    pub async fn close(&self) {
        if self.state().await == WsState::Established {
            if let Err(e) = self.send_frame(Opcode::Close, &1000u16.to_be_bytes()).await {
                debug!(socket = %self.socket, error = %e, "close frame not sent");
            }
        }
        self.discard().await;
    }

    /// Remove the socket without a closing handshake and mark the connection `Closed`.
    pub async fn discard(&self) {
        if self.registry.contains(&self.socket).await {
            if let Err(e) = self.registry.remove(self.socket.as_str().into()).await {
                warn!(socket = %self.socket, error = %e, "failed to remove websocket socket");
            }
        }
        self.set_state(WsState::Closed).await;
    }
}
