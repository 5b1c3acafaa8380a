//! Length-framed binary RPC over TCP: one accept loop, one channel per
//! peer in each direction, auto-reconnect for dialed channels, and a
//! write-stall watchdog over everything.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use hashbrown::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use zerocopy::{AsBytes, FromZeroes};

pub mod connection;
pub mod frame;

pub use connection::{ChannelHandler, ChannelPolicy, PeerChannel};
pub use frame::{Command, ConnectHeader, ConnectionType, Opcode, WriteFrame};

use crate::config::Config;
use crate::error::{Error, Result};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Inbound non-control streams (join, snapshot) are handed off whole.
pub type AcceptedStream = (TcpStream, ConnectHeader);

pub struct ChannelManager {
    config: Config,
    handler: OnceLock<Arc<dyn ChannelHandler>>,
    /// Channels this node dialed; they reconnect on loss.
    clients: parking_lot::Mutex<HashMap<u64, Arc<PeerChannel>>>,
    /// Channels installed from inbound connections; they do not.
    servers: parking_lot::Mutex<HashMap<u64, Arc<PeerChannel>>>,
    acceptors: parking_lot::Mutex<HashMap<u32, mpsc::Sender<AcceptedStream>>>,
    partitioned: AtomicBool,
    shutdown: watch::Sender<bool>,
    local_addr: OnceLock<SocketAddr>,
}

impl ChannelManager {
    pub fn new(config: Config) -> Arc<ChannelManager> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(ChannelManager {
            config,
            handler: OnceLock::new(),
            clients: parking_lot::Mutex::new(HashMap::new()),
            servers: parking_lot::Mutex::new(HashMap::new()),
            acceptors: parking_lot::Mutex::new(HashMap::new()),
            partitioned: AtomicBool::new(false),
            shutdown,
            local_addr: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_member_id(&self) -> u64 {
        self.config.local_member_id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Binds the listener and starts the accept loop and the watchdog.
    /// Returns the bound address (useful with an ephemeral port).
    pub async fn start(
        self: &Arc<Self>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<SocketAddr> {
        self.handler
            .set(handler)
            .map_err(|_| Error::InvalidState("channel manager already started"))?;
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);

        tokio::spawn(accept_loop(self.clone(), listener));
        tokio::spawn(watchdog_loop(self.clone()));
        tracing::debug!(%addr, member = self.config.local_member_id, "channel manager listening");
        Ok(addr)
    }

    /// Returns the shared client channel for a peer immediately; the TCP
    /// connect happens in the background with exponential backoff.
    pub fn connect(self: &Arc<Self>, peer_id: u64, addr: SocketAddr) -> Arc<PeerChannel> {
        let mut clients = self.clients.lock();
        if let Some(ch) = clients.get(&peer_id) {
            if !ch.is_closed() {
                ch.set_addr(addr);
                return ch.clone();
            }
        }
        let ch = PeerChannel::new(
            peer_id,
            addr,
            ChannelPolicy::client(self.config.client_stall_ticks),
        );
        clients.insert(peer_id, ch.clone());
        tokio::spawn(maintain_client(self.clone(), ch.clone()));
        ch
    }

    /// The dialed channel for `peer_id`, if one exists.
    pub fn client_channel(&self, peer_id: u64) -> Option<Arc<PeerChannel>> {
        self.clients.lock().get(&peer_id).cloned()
    }

    /// Registers the acceptor for a non-control connection kind and
    /// returns the stream of accepted connections.
    pub fn register_acceptor(&self, kind: ConnectionType) -> mpsc::Receiver<AcceptedStream> {
        let (tx, rx) = mpsc::channel(4);
        self.acceptors.lock().insert(kind.kind().bits(), tx);
        rx
    }

    /// Permanently drops every channel whose member id matches.
    pub fn disconnect(&self, mut filter: impl FnMut(u64) -> bool) {
        let doomed: Vec<Arc<PeerChannel>> = {
            let clients = self.clients.lock();
            let servers = self.servers.lock();
            clients
                .values()
                .chain(servers.values())
                .filter(|ch| filter(ch.peer_id()))
                .cloned()
                .collect()
        };
        for ch in doomed {
            ch.close();
        }
        self.clients.lock().retain(|_, ch| !ch.is_closed());
        self.servers.lock().retain(|_, ch| !ch.is_closed());
    }

    /// Test hook: a partitioned manager rejects inbound connections,
    /// stops dialing, and drops every live socket.
    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::Release);
        if partitioned {
            for ch in self.all_channels() {
                ch.force_close();
            }
        }
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        for ch in self.all_channels() {
            ch.close();
        }
        self.clients.lock().clear();
        self.servers.lock().clear();
    }

    fn all_channels(&self) -> Vec<Arc<PeerChannel>> {
        let clients = self.clients.lock();
        let servers = self.servers.lock();
        clients.values().chain(servers.values()).cloned().collect()
    }

    fn handler(&self) -> Arc<dyn ChannelHandler> {
        self.handler
            .get()
            .expect("channel manager not started")
            .clone()
    }

    fn local_header(&self, connection_type: ConnectionType) -> ConnectHeader {
        let mut ct = connection_type;
        if self.config.checksums {
            ct |= ConnectionType::CRC;
        }
        ConnectHeader::new(
            self.config.group_id,
            self.config.local_member_id,
            ct,
            self.config.group_token_1,
            self.config.group_token_2,
        )
    }

    async fn dial(self: &Arc<Self>, ch: &Arc<PeerChannel>) -> Result<()> {
        let addr = ch.addr();
        let mut stream =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ))
                })??;

        let hdr = self.local_header(ConnectionType::empty());
        stream.write_all(hdr.as_bytes()).await?;

        let mut echo = ConnectHeader::new_zeroed();
        tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(echo.as_bytes_mut()))
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "handshake timed out",
                ))
            })??;

        if echo.magic.get() != frame::MAGIC {
            return Err(Error::Protocol("bad magic in handshake echo"));
        }
        if echo.is_rejection() {
            return Err(Error::JoinRejected { addr });
        }
        ch.set_peer_id(echo.member_id.get());
        let crc = echo.connection_type().contains(ConnectionType::CRC);

        let mgr = self.clone();
        ch.install(stream, crc, move |channel, read_half| {
            connection::read_loop(channel, read_half, crc, mgr.handler())
        });
        tracing::debug!(peer = ch.peer_id(), %addr, "connected");
        Ok(())
    }
}

/// Keeps a client channel connected: dial, run until the socket dies,
/// back off exponentially, redial.
async fn maintain_client(mgr: Arc<ChannelManager>, ch: Arc<PeerChannel>) {
    let mut shutdown = mgr.shutdown.subscribe();
    let mut backoff = mgr.config.reconnect_min;
    loop {
        if ch.is_closed() || *shutdown.borrow() {
            return;
        }
        if mgr.is_partitioned() {
            tokio::time::sleep(mgr.config.reconnect_max).await;
            continue;
        }
        match mgr.dial(&ch).await {
            Ok(()) => {
                backoff = mgr.config.reconnect_min;
                let mut connected = ch.subscribe_connected();
                tokio::select! {
                    _ = connected.wait_for(|c| !*c) => {}
                    _ = shutdown.changed() => return,
                }
            }
            Err(e) => {
                tracing::trace!(peer = ch.peer_id(), %e, "dial failed");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => return,
                }
                backoff = (backoff * 2).min(mgr.config.reconnect_max);
            }
        }
    }
}

async fn accept_loop(mgr: Arc<ChannelManager>, listener: TcpListener) {
    let mut shutdown = mgr.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        if mgr.is_partitioned() {
                            drop(stream);
                            continue;
                        }
                        tokio::spawn(handle_inbound(mgr.clone(), stream, addr));
                    }
                    Err(e) => {
                        tracing::warn!(%e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }
    }
}

async fn handle_inbound(mgr: Arc<ChannelManager>, mut stream: TcpStream, addr: SocketAddr) {
    let mut hdr = ConnectHeader::new_zeroed();
    let read = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(hdr.as_bytes_mut())).await;
    match read {
        Ok(Ok(_)) => {}
        _ => return,
    }
    if hdr.magic.get() != frame::MAGIC {
        tracing::warn!(%addr, "bad magic on inbound connection");
        return;
    }

    let cfg = &mgr.config;
    let authorized = hdr.group_id.get() == cfg.group_id
        && hdr.group_token_1.get() == cfg.group_token_1
        && hdr.group_token_2.get() == cfg.group_token_2;
    let kind = hdr.connection_type().kind();
    // a joiner does not know the group id yet; the tokens still gate it
    let join_ok = kind == ConnectionType::JOIN
        && hdr.group_token_1.get() == cfg.group_token_1
        && hdr.group_token_2.get() == cfg.group_token_2;
    if !authorized && !join_ok {
        tracing::warn!(%addr, "rejecting inbound connection: token or group mismatch");
        let rejection = hdr.rejection();
        let _ = stream.write_all(rejection.as_bytes()).await;
        return;
    }

    let mut echo = hdr;
    echo.member_id = cfg.local_member_id.into();
    if stream.write_all(echo.as_bytes()).await.is_err() {
        return;
    }
    let crc = hdr.connection_type().contains(ConnectionType::CRC);

    if kind.is_empty() {
        let member = hdr.member_id.get();
        if member == 0 {
            tracing::warn!(%addr, "anonymous control connection refused");
            return;
        }
        install_server(&mgr, member, addr, stream, crc).await;
    } else {
        let acceptor = mgr.acceptors.lock().get(&kind.bits()).cloned();
        match acceptor {
            Some(tx) => {
                if tx.send((stream, hdr)).await.is_err() {
                    tracing::warn!(%addr, ?kind, "acceptor gone, dropping connection");
                }
            }
            None => {
                tracing::warn!(%addr, ?kind, "no acceptor registered, dropping connection");
            }
        }
    }
}

/// Installs an inbound control socket on the peer's server channel. A
/// newcomer for a still-connected peer parks until the old socket closes,
/// then force-closes it if it lingers past half the handshake timeout.
async fn install_server(
    mgr: &Arc<ChannelManager>,
    member: u64,
    addr: SocketAddr,
    stream: TcpStream,
    crc: bool,
) {
    let existing = mgr.servers.lock().get(&member).cloned();
    if let Some(existing) = existing {
        if existing.is_connected() {
            tracing::debug!(peer = member, "duplicate control connection, parking");
            let mut connected = existing.subscribe_connected();
            let waited =
                tokio::time::timeout(HANDSHAKE_TIMEOUT / 2, connected.wait_for(|c| !*c)).await;
            if waited.is_err() {
                existing.force_close();
            }
        }
    }

    let ch = {
        let mut servers = mgr.servers.lock();
        servers
            .entry(member)
            .or_insert_with(|| {
                PeerChannel::new(
                    member,
                    addr,
                    ChannelPolicy::server(mgr.config.server_stall_ticks),
                )
            })
            .clone()
    };
    ch.set_addr(addr);
    let mgr2 = mgr.clone();
    ch.install(stream, crc, move |channel, read_half| {
        connection::read_loop(channel, read_half, crc, mgr2.handler())
    });
    tracing::debug!(peer = member, %addr, "inbound channel installed");
}

async fn watchdog_loop(mgr: Arc<ChannelManager>) {
    let mut shutdown = mgr.shutdown.subscribe();
    let mut interval = tokio::time::interval(mgr.config.watchdog_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = interval.tick() => {
                for ch in mgr.all_channels() {
                    ch.watchdog_tick();
                }
                mgr.servers.lock().retain(|_, ch| !ch.is_closed());
            }
        }
    }
}

/// Dials `addr` and performs the connect handshake for a non-control
/// stream (join or snapshot). Returns the raw stream on success; the
/// caller owns the protocol from there.
pub async fn connect_stream(
    addr: SocketAddr,
    header: ConnectHeader,
) -> Result<(TcpStream, ConnectHeader)> {
    let mut stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        })??;
    stream.write_all(header.as_bytes()).await?;
    let mut echo = ConnectHeader::new_zeroed();
    tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(echo.as_bytes_mut()))
        .await
        .map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "handshake timed out",
            ))
        })??;
    if echo.magic.get() != frame::MAGIC {
        return Err(Error::Protocol("bad magic in handshake echo"));
    }
    if echo.is_rejection() {
        return Err(Error::JoinRejected { addr });
    }
    Ok((stream, echo))
}
