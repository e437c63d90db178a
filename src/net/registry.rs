//! Named socket table over tokio TCP/UDP sockets, with optional TLS on streams.
//!
//! Sockets are addressed by unique name or by integer id. Each entry keeps its
//! read half, write half, listener and metadata behind separate locks, so a
//! pending receive never blocks a send on the same socket, and the table lock
//! is only taken for lookup, insert and remove. Closing an entry cancels its
//! pending accept and receive calls before the transport is torn down.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::sync::{Mutex, RwLock};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::tls;
use crate::error::{AppError, AppResult};

/// Name under which `accept` registers the connection it accepted.
pub const ACCEPTED_CONNECTION: &str = "accepted-connection";

pub const DEFAULT_CAPACITY: usize = 16;

pub type SocketId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketKind {
    Stream,
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        }
    }

    fn unspecified(&self) -> SocketAddr {
        match self {
            AddressFamily::Ipv4 => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            AddressFamily::Ipv6 => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        }
    }

    fn tcp_socket(&self) -> std::io::Result<TcpSocket> {
        match self {
            AddressFamily::Ipv4 => TcpSocket::new_v4(),
            AddressFamily::Ipv6 => TcpSocket::new_v6(),
        }
    }

    fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() {
            AddressFamily::Ipv4
        } else {
            AddressFamily::Ipv6
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketStatus {
    Unbound,
    Bound,
    Listening,
    Connected,
    Closed,
}

/// Registry lookup key.
#[derive(Debug, Clone, Copy)]
pub enum SocketRef<'a> {
    Name(&'a str),
    Id(SocketId),
}

impl<'a> From<&'a str> for SocketRef<'a> {
    fn from(name: &'a str) -> Self {
        SocketRef::Name(name)
    }
}

impl From<SocketId> for SocketRef<'_> {
    fn from(id: SocketId) -> Self {
        SocketRef::Id(id)
    }
}

impl fmt::Display for SocketRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketRef::Name(name) => write!(f, "'{}'", name),
            SocketRef::Id(id) => write!(f, "#{}", id),
        }
    }
}

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug)]
struct Meta {
    status: SocketStatus,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    host: Option<String>,
    tls: bool,
}

impl Meta {
    fn new(status: SocketStatus) -> Self {
        Self {
            status,
            local: None,
            peer: None,
            host: None,
            tls: false,
        }
    }
}

struct Entry {
    id: SocketId,
    name: String,
    kind: SocketKind,
    family: AddressFamily,
    meta: Mutex<Meta>,
    /// Stream socket before it is connected or turned into a listener.
    unconnected: Mutex<Option<TcpSocket>>,
    listener: Mutex<Option<TcpListener>>,
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<Writer>>,
    datagram: Mutex<Option<Arc<UdpSocket>>>,
    closing: CancellationToken,
}

impl Entry {
    fn new(id: SocketId, name: &str, kind: SocketKind, family: AddressFamily, meta: Meta) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            family,
            meta: Mutex::new(meta),
            unconnected: Mutex::new(None),
            listener: Mutex::new(None),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            datagram: Mutex::new(None),
            closing: CancellationToken::new(),
        }
    }

    fn with_unconnected(mut self, socket: Option<TcpSocket>) -> Self {
        self.unconnected = Mutex::new(socket);
        self
    }

    fn with_stream(mut self, reader: Reader, writer: Writer) -> Self {
        self.reader = Mutex::new(Some(reader));
        self.writer = Mutex::new(Some(writer));
        self
    }

    async fn status(&self) -> SocketStatus {
        self.meta.lock().await.status
    }

    fn invalid(&self, op: &str, detail: impl fmt::Display) -> AppError {
        warn!(socket = %self.name, id = self.id, op, "{}", detail);
        AppError::Socket(format!("{} on '{}': {}", op, self.name, detail))
    }

    fn io_failure(&self, op: &str, err: std::io::Error) -> AppError {
        warn!(socket = %self.name, id = self.id, op, error = %err, "socket operation failed");
        AppError::Io(err)
    }

    /// Run one I/O future, giving up as soon as the entry starts closing.
    async fn until_closed<T>(
        &self,
        op: &str,
        io: impl Future<Output = std::io::Result<T>>,
    ) -> AppResult<T> {
        tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(self.invalid(op, "socket closed while waiting")),
            result = io => result.map_err(|e| self.io_failure(op, e)),
        }
    }

    /// Status must be `Connected` and the TLS mode must match how it was established.
    async fn check_connected(&self, op: &str, use_tls: bool) -> AppResult<()> {
        let meta = self.meta.lock().await;
        if self.closing.is_cancelled() {
            return Err(self.invalid(op, "socket is closing"));
        }
        if meta.status != SocketStatus::Connected {
            return Err(self.invalid(op, format!("socket is {:?}, not connected", meta.status)));
        }
        if meta.tls != use_tls {
            warn!(socket = %self.name, op, established = meta.tls, requested = use_tls, "TLS mode mismatch");
            return Err(AppError::TlsMismatch {
                socket: self.name.clone(),
                established: meta.tls,
                requested: use_tls,
            });
        }
        Ok(())
    }

    async fn udp(&self, op: &str) -> AppResult<Arc<UdpSocket>> {
        self.datagram
            .lock()
            .await
            .clone()
            .ok_or_else(|| self.invalid(op, "datagram socket has no transport"))
    }

    /// Cancel waiters first so the I/O locks are free, then tear down. The
    /// status only becomes `Closed` once nothing is left open.
    async fn close(&self) -> AppResult<()> {
        {
            let meta = self.meta.lock().await;
            if meta.status == SocketStatus::Closed || self.closing.is_cancelled() {
                return Err(self.invalid("close", "socket is not open"));
            }
            self.closing.cancel();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(socket = %self.name, error = %e, "shutdown during close failed");
            }
        }
        self.reader.lock().await.take();
        self.listener.lock().await.take();
        self.unconnected.lock().await.take();
        self.datagram.lock().await.take();
        self.meta.lock().await.status = SocketStatus::Closed;
        info!(socket = %self.name, id = self.id, "socket closed");
        Ok(())
    }
}

struct Table {
    names: HashMap<String, SocketId>,
    entries: HashMap<SocketId, Arc<Entry>>,
    free: BTreeSet<SocketId>,
    next: SocketId,
    capacity: usize,
}

impl Table {
    fn lookup(&self, socket: SocketRef<'_>) -> AppResult<Arc<Entry>> {
        let id = match socket {
            SocketRef::Name(name) => *self
                .names
                .get(name)
                .ok_or_else(|| AppError::Socket(format!("no socket named '{}'", name)))?,
            SocketRef::Id(id) => id,
        };
        self.entries
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::Socket(format!("no socket {}", socket)))
    }

    fn insert(&mut self, name: &str, build: impl FnOnce(SocketId) -> Entry) -> AppResult<Arc<Entry>> {
        if self.names.contains_key(name) {
            return Err(AppError::Socket(format!("socket '{}' already exists", name)));
        }
        if self.entries.len() >= self.capacity {
            return Err(AppError::Socket(format!(
                "socket limit reached ({}), cannot create '{}'",
                self.capacity, name
            )));
        }
        let id = match self.free.pop_first() {
            Some(id) => id,
            None => {
                self.next += 1;
                self.next - 1
            }
        };
        let entry = Arc::new(build(id));
        self.names.insert(name.to_string(), id);
        self.entries.insert(id, entry.clone());
        Ok(entry)
    }

    fn remove(&mut self, socket: SocketRef<'_>) -> AppResult<Arc<Entry>> {
        let entry = self.lookup(socket)?;
        self.names.remove(&entry.name);
        self.entries.remove(&entry.id);
        self.free.insert(entry.id);
        Ok(entry)
    }
}

/// Shared socket table. Cloning shares the same sockets.
#[derive(Clone)]
pub struct SocketRegistry {
    table: Arc<RwLock<Table>>,
    tls: TlsConnector,
}

impl SocketRegistry {
    pub fn new(capacity: usize) -> AppResult<Self> {
        Ok(Self {
            table: Arc::new(RwLock::new(Table {
                names: HashMap::new(),
                entries: HashMap::new(),
                free: BTreeSet::new(),
                next: 0,
                capacity,
            })),
            tls: tls::connector()?,
        })
    }

    async fn entry(&self, socket: SocketRef<'_>) -> AppResult<Arc<Entry>> {
        let result = self.table.read().await.lookup(socket);
        if let Err(e) = &result {
            warn!(socket = %socket, error = %e, "socket lookup failed");
        }
        result
    }

    /// Register a new socket. Fails if the name is taken or the registry is full.
    #[instrument(skip(self))]
    pub async fn create(&self, name: &str, kind: SocketKind, family: AddressFamily) -> AppResult<SocketId> {
        let unconnected = match kind {
            SocketKind::Stream => Some(family.tcp_socket().map_err(|e| {
                warn!(socket = %name, error = %e, "failed to create stream socket");
                AppError::Io(e)
            })?),
            SocketKind::Datagram => None,
        };
        let entry = {
            let mut table = self.table.write().await;
            table.insert(name, |id| {
                Entry::new(id, name, kind, family, Meta::new(SocketStatus::Unbound))
                    .with_unconnected(unconnected)
            })
        }
        .map_err(|e| {
            warn!(socket = %name, error = %e, "socket create failed");
            e
        })?;
        info!(socket = %name, id = entry.id, ?kind, ?family, "socket created");
        Ok(entry.id)
    }

    pub async fn bind(&self, socket: SocketRef<'_>, addr: SocketAddr) -> AppResult<()> {
        let entry = self.entry(socket).await?;
        let mut meta = entry.meta.lock().await;
        if meta.status != SocketStatus::Unbound {
            return Err(entry.invalid("bind", format!("socket is {:?}", meta.status)));
        }
        if !entry.family.matches(&addr) {
            return Err(entry.invalid("bind", format!("{} is not {:?}", addr, entry.family)));
        }
        match entry.kind {
            SocketKind::Stream => {
                let guard = entry.unconnected.lock().await;
                let tcp = guard
                    .as_ref()
                    .ok_or_else(|| entry.invalid("bind", "stream socket has no transport"))?;
                tcp.set_reuseaddr(true).map_err(|e| entry.io_failure("bind", e))?;
                tcp.bind(addr).map_err(|e| entry.io_failure("bind", e))?;
                meta.local = tcp.local_addr().ok();
            }
            SocketKind::Datagram => {
                let udp = UdpSocket::bind(addr).await.map_err(|e| entry.io_failure("bind", e))?;
                meta.local = udp.local_addr().ok();
                *entry.datagram.lock().await = Some(Arc::new(udp));
            }
        }
        meta.status = SocketStatus::Bound;
        info!(socket = %entry.name, addr = ?meta.local, "socket bound");
        Ok(())
    }

    pub async fn listen(&self, socket: SocketRef<'_>, backlog: u32) -> AppResult<()> {
        let entry = self.entry(socket).await?;
        if entry.kind != SocketKind::Stream {
            return Err(entry.invalid("listen", "datagram sockets cannot listen"));
        }
        let mut meta = entry.meta.lock().await;
        if meta.status != SocketStatus::Bound {
            return Err(entry.invalid("listen", format!("socket is {:?}, not bound", meta.status)));
        }
        let tcp = entry
            .unconnected
            .lock()
            .await
            .take()
            .ok_or_else(|| entry.invalid("listen", "stream socket has no transport"))?;
        let listener = tcp.listen(backlog).map_err(|e| entry.io_failure("listen", e))?;
        *entry.listener.lock().await = Some(listener);
        meta.status = SocketStatus::Listening;
        info!(socket = %entry.name, addr = ?meta.local, backlog, "socket listening");
        Ok(())
    }

    /// Wait for one connection on a listening socket and register it as
    /// [`ACCEPTED_CONNECTION`].
    pub async fn accept(&self, socket: SocketRef<'_>) -> AppResult<SocketId> {
        let entry = self.entry(socket).await?;
        if entry.kind != SocketKind::Stream {
            return Err(entry.invalid("accept", "datagram sockets cannot accept"));
        }
        let status = entry.status().await;
        if status != SocketStatus::Listening {
            return Err(entry.invalid("accept", format!("socket is {:?}, not listening", status)));
        }
        if self.contains(ACCEPTED_CONNECTION).await {
            return Err(entry.invalid("accept", "a previously accepted connection is still registered"));
        }

        let (stream, peer) = {
            let guard = entry.listener.lock().await;
            let listener = guard
                .as_ref()
                .ok_or_else(|| entry.invalid("accept", "listener is gone"))?;
            entry.until_closed("accept", listener.accept()).await?
        };
        let local = stream.local_addr().ok();
        let (reader, writer) = tokio::io::split(stream);

        let accepted = {
            let mut table = self.table.write().await;
            table.insert(ACCEPTED_CONNECTION, |id| {
                let mut meta = Meta::new(SocketStatus::Connected);
                meta.local = local;
                meta.peer = Some(peer);
                Entry::new(id, ACCEPTED_CONNECTION, SocketKind::Stream, AddressFamily::of(&peer), meta)
                    .with_stream(Box::new(reader), Box::new(writer))
            })
        }
        .map_err(|e| {
            warn!(socket = %entry.name, error = %e, "failed to register accepted connection");
            e
        })?;
        info!(socket = %entry.name, id = accepted.id, peer = %peer, "connection accepted");
        Ok(accepted.id)
    }

    /// Resolve `host` and connect, wrapping the stream in TLS when `use_tls` is set.
    #[instrument(skip(self))]
    pub async fn connect(&self, socket: SocketRef<'_>, host: &str, port: u16, use_tls: bool) -> AppResult<()> {
        let entry = self.entry(socket).await?;
        let status = entry.status().await;
        if !matches!(status, SocketStatus::Unbound | SocketStatus::Bound) {
            return Err(entry.invalid("connect", format!("socket is {:?}", status)));
        }

        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| entry.io_failure("resolve", e))?
            .filter(|addr| entry.family.matches(addr))
            .collect();
        if addrs.is_empty() {
            return Err(entry.invalid(
                "connect",
                format!("no {:?} address for {}:{}", entry.family, host, port),
            ));
        }

        let (peer, local) = match entry.kind {
            SocketKind::Stream => {
                let (stream, peer) = self.connect_stream(&entry, &addrs).await?;
                let local = stream.local_addr().ok();
                let (reader, writer): (Reader, Writer) = if use_tls {
                    let tls_stream = tls::handshake(&self.tls, host, stream).await.map_err(|e| {
                        warn!(socket = %entry.name, host, error = %e, "TLS handshake failed");
                        e
                    })?;
                    let (r, w) = tokio::io::split(tls_stream);
                    (Box::new(r), Box::new(w))
                } else {
                    let (r, w) = tokio::io::split(stream);
                    (Box::new(r), Box::new(w))
                };
                *entry.reader.lock().await = Some(reader);
                *entry.writer.lock().await = Some(writer);
                (peer, local)
            }
            SocketKind::Datagram => {
                if use_tls {
                    return Err(AppError::Tls(format!(
                        "datagram socket '{}' cannot use TLS",
                        entry.name
                    )));
                }
                let udp = {
                    let mut guard = entry.datagram.lock().await;
                    match guard.as_ref() {
                        Some(udp) => udp.clone(),
                        None => {
                            let udp = UdpSocket::bind(entry.family.unspecified())
                                .await
                                .map_err(|e| entry.io_failure("bind", e))?;
                            let udp = Arc::new(udp);
                            *guard = Some(udp.clone());
                            udp
                        }
                    }
                };
                let peer = addrs[0];
                udp.connect(peer).await.map_err(|e| entry.io_failure("connect", e))?;
                (peer, udp.local_addr().ok())
            }
        };

        let mut meta = entry.meta.lock().await;
        meta.status = SocketStatus::Connected;
        meta.peer = Some(peer);
        meta.local = local;
        meta.host = Some(host.to_string());
        meta.tls = use_tls;
        info!(socket = %entry.name, host, peer = %peer, tls = use_tls, "socket connected");
        Ok(())
    }

    /// Try each resolved address in turn. A bound socket is used for the first
    /// attempt; later attempts get a fresh socket.
    async fn connect_stream(&self, entry: &Entry, addrs: &[SocketAddr]) -> AppResult<(TcpStream, SocketAddr)> {
        let mut bound = entry.unconnected.lock().await.take();
        let mut last_error = None;
        for addr in addrs.iter().copied() {
            let tcp = match bound.take() {
                Some(tcp) => tcp,
                None => entry.family.tcp_socket().map_err(|e| entry.io_failure("connect", e))?,
            };
            match tcp.connect(addr).await {
                Ok(stream) => return Ok((stream, addr)),
                Err(e) => {
                    debug!(socket = %entry.name, addr = %addr, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(match last_error {
            Some(e) => entry.io_failure("connect", e),
            None => entry.invalid("connect", "no address to connect to"),
        })
    }

    /// Write all of `data`. Returns the number of bytes sent.
    pub async fn send(&self, socket: SocketRef<'_>, data: &[u8], use_tls: bool) -> AppResult<usize> {
        let entry = self.entry(socket).await?;
        entry.check_connected("send", use_tls).await?;
        match entry.kind {
            SocketKind::Stream => {
                let mut guard = entry.writer.lock().await;
                let writer = guard
                    .as_mut()
                    .ok_or_else(|| entry.invalid("send", "socket has no writer"))?;
                entry
                    .until_closed("send", async {
                        writer.write_all(data).await?;
                        writer.flush().await
                    })
                    .await?;
            }
            SocketKind::Datagram => {
                let udp = entry.udp("send").await?;
                entry.until_closed("send", udp.send(data)).await?;
            }
        }
        debug!(socket = %entry.name, bytes = data.len(), "sent");
        Ok(data.len())
    }

    /// One read into `buf`. `Ok(0)` means the peer shut down.
    pub async fn receive(&self, socket: SocketRef<'_>, buf: &mut [u8], use_tls: bool) -> AppResult<usize> {
        let entry = self.entry(socket).await?;
        entry.check_connected("receive", use_tls).await?;
        let read = match entry.kind {
            SocketKind::Stream => {
                let mut guard = entry.reader.lock().await;
                let reader = guard
                    .as_mut()
                    .ok_or_else(|| entry.invalid("receive", "socket has no reader"))?;
                entry.until_closed("receive", reader.read(buf)).await?
            }
            SocketKind::Datagram => {
                let udp = entry.udp("receive").await?;
                entry.until_closed("receive", udp.recv(buf)).await?
            }
        };
        if read == 0 && !buf.is_empty() {
            info!(socket = %entry.name, "peer closed connection");
        } else {
            debug!(socket = %entry.name, bytes = read, "received");
        }
        Ok(read)
    }

    /// Read exactly `len` bytes, accumulating partial reads. EOF first is an error.
    pub async fn receive_exact(&self, socket: SocketRef<'_>, len: usize, use_tls: bool) -> AppResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let read = self.receive(socket, &mut buf[filled..], use_tls).await?;
            if read == 0 {
                return Err(AppError::Socket(format!(
                    "connection {} closed after {} of {} bytes",
                    socket, filled, len
                )));
            }
            filled += read;
        }
        Ok(buf)
    }

    /// Read until the peer shuts down its side.
    pub async fn receive_to_end(&self, socket: SocketRef<'_>, use_tls: bool) -> AppResult<Vec<u8>> {
        let entry = self.entry(socket).await?;
        if entry.kind != SocketKind::Stream {
            return Err(entry.invalid("receive_to_end", "datagram sockets have no end of stream"));
        }
        entry.check_connected("receive_to_end", use_tls).await?;
        let mut guard = entry.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| entry.invalid("receive_to_end", "socket has no reader"))?;
        let mut out = Vec::new();
        entry
            .until_closed("receive_to_end", reader.read_to_end(&mut out))
            .await?;
        debug!(socket = %entry.name, bytes = out.len(), "received to end");
        Ok(out)
    }

    /// Tear down TLS and transport; the entry stays registered as `Closed`.
    pub async fn close(&self, socket: SocketRef<'_>) -> AppResult<()> {
        self.entry(socket).await?.close().await
    }

    /// Close if still open and drop the entry. Its id becomes reusable.
    pub async fn remove(&self, socket: SocketRef<'_>) -> AppResult<()> {
        let entry = {
            let mut table = self.table.write().await;
            table.remove(socket)
        }
        .map_err(|e| {
            warn!(socket = %socket, error = %e, "socket remove failed");
            e
        })?;
        if entry.status().await != SocketStatus::Closed {
            entry.close().await?;
        }
        info!(socket = %entry.name, id = entry.id, "socket removed");
        Ok(())
    }

    /// Close every open socket. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let entries: Vec<Arc<Entry>> = self.table.read().await.entries.values().cloned().collect();
        let mut closed = 0;
        for entry in entries {
            if entry.status().await == SocketStatus::Closed {
                continue;
            }
            match entry.close().await {
                Ok(()) => closed += 1,
                Err(e) => warn!(socket = %entry.name, error = %e, "close failed"),
            }
        }
        closed
    }

    pub async fn status(&self, socket: SocketRef<'_>) -> AppResult<SocketStatus> {
        Ok(self.entry(socket).await?.status().await)
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.table.read().await.names.contains_key(name)
    }

    pub async fn id_of(&self, name: &str) -> Option<SocketId> {
        self.table.read().await.names.get(name).copied()
    }

    pub async fn local_addr(&self, socket: SocketRef<'_>) -> AppResult<Option<SocketAddr>> {
        Ok(self.entry(socket).await?.meta.lock().await.local)
    }

    pub async fn peer_addr(&self, socket: SocketRef<'_>) -> AppResult<Option<SocketAddr>> {
        Ok(self.entry(socket).await?.meta.lock().await.peer)
    }

    /// Host name given to `connect` (the TLS server name).
    pub async fn remote_host(&self, socket: SocketRef<'_>) -> AppResult<Option<String>> {
        Ok(self.entry(socket).await?.meta.lock().await.host.clone())
    }

    /// Number of registered sockets.
    pub async fn len(&self) -> usize {
        self.table.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
