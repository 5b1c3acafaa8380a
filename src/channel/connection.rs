use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::channel::frame::{
    command_crc, decode_command_header, Command, COMMAND_HEADER_LEN,
};
use crate::error::{Error, Result};

/// Outbound commands waiting for the socket writer; a stalled socket
/// fills this up and the send fails fast instead of blocking the caller.
const SEND_QUEUE_DEPTH: usize = 64;

/// What a channel does about its socket going away.
#[derive(Debug, Clone, Copy)]
pub struct ChannelPolicy {
    pub reconnect: bool,
    /// Watchdog ticks a nonzero write state is tolerated for.
    pub max_stall_ticks: u32,
}

impl ChannelPolicy {
    pub fn client(max_stall_ticks: u32) -> Self {
        Self {
            reconnect: true,
            max_stall_ticks,
        }
    }

    pub fn server(max_stall_ticks: u32) -> Self {
        Self {
            reconnect: false,
            max_stall_ticks,
        }
    }
}

struct Installed {
    tx: mpsc::Sender<Bytes>,
    writer_task: tokio::task::JoinHandle<()>,
    reader_task: tokio::task::JoinHandle<()>,
}

/// One stateful RPC endpoint bound to a peer. The socket behind it comes
/// and goes; senders observe a broken or missing socket as an error and
/// the owner decides whether to redial (client) or tear down (server).
pub struct PeerChannel {
    peer_id: AtomicU64,
    addr: parking_lot::Mutex<SocketAddr>,
    policy: ChannelPolicy,
    crc: AtomicBool,
    installed: parking_lot::Mutex<Option<Installed>>,
    /// Nonzero while a socket write is in flight; tagged with the opcode
    /// so a stall report names the command that wedged.
    write_state: Arc<AtomicU32>,
    stalled_ticks: AtomicU32,
    closed: AtomicBool,
    connected: watch::Sender<bool>,
}

impl PeerChannel {
    pub fn new(peer_id: u64, addr: SocketAddr, policy: ChannelPolicy) -> Arc<PeerChannel> {
        let (connected, _) = watch::channel(false);
        Arc::new(PeerChannel {
            peer_id: AtomicU64::new(peer_id),
            addr: parking_lot::Mutex::new(addr),
            policy,
            crc: AtomicBool::new(false),
            installed: parking_lot::Mutex::new(None),
            write_state: Arc::new(AtomicU32::new(0)),
            stalled_ticks: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            connected,
        })
    }

    pub fn peer_id(&self) -> u64 {
        self.peer_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_peer_id(&self, id: u64) {
        self.peer_id.store(id, Ordering::Release);
    }

    pub fn addr(&self) -> SocketAddr {
        *self.addr.lock()
    }

    pub(crate) fn set_addr(&self, addr: SocketAddr) {
        *self.addr.lock() = addr;
    }

    pub fn policy(&self) -> &ChannelPolicy {
        &self.policy
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Encodes and queues a command for the socket writer. Fails fast
    /// when the channel has no live socket or the socket is backed up.
    pub fn send(&self, cmd: &Command) -> Result<()> {
        let crc = self.crc.load(Ordering::Acquire);
        let mut buf = BytesMut::new();
        cmd.encode(crc, &mut buf);

        let installed = self.installed.lock();
        let Some(inst) = installed.as_ref() else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "channel has no socket",
            )));
        };
        inst.tx.try_send(buf.freeze()).map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "channel send queue full",
            ))
        })
    }

    /// Installs a fresh socket, replacing whatever was there. The reader
    /// half is handed to `dispatch`, which runs until the socket dies.
    pub(crate) fn install<F, Fut>(self: &Arc<Self>, stream: TcpStream, crc: bool, dispatch: F)
    where
        F: FnOnce(Arc<PeerChannel>, OwnedReadHalf) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        // retire the previous socket first so its reader cannot tear
        // down the one being installed
        if let Some(old) = self.installed.lock().take() {
            old.writer_task.abort();
            old.reader_task.abort();
        }

        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);

        let writer_task = tokio::spawn(write_loop(
            rx,
            write_half,
            self.write_state.clone(),
            self.connected.clone(),
        ));
        let reader_task = tokio::spawn(dispatch(self.clone(), read_half));

        {
            let mut installed = self.installed.lock();
            self.crc.store(crc, Ordering::Release);
            self.stalled_ticks.store(0, Ordering::Release);
            *installed = Some(Installed {
                tx,
                writer_task,
                reader_task,
            });
        }
        let _ = self.connected.send(true);
    }

    /// Drops the socket. A client channel's maintainer observes this and
    /// redials; a server channel is finished.
    pub fn force_close(&self) {
        let old = self.installed.lock().take();
        if let Some(old) = old {
            old.writer_task.abort();
            old.reader_task.abort();
            tracing::debug!(peer = self.peer_id(), "channel socket dropped");
        }
        self.write_state.store(0, Ordering::Release);
        self.stalled_ticks.store(0, Ordering::Release);
        let _ = self.connected.send(false);
    }

    /// Permanently closes the channel; no reconnect will follow.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.force_close();
    }

    /// The socket died underneath us (EOF, I/O or protocol error).
    pub(crate) fn socket_lost(&self) {
        self.force_close();
    }

    /// One watchdog tick: returns true when the channel exceeded its
    /// stall budget and was forcibly closed.
    pub(crate) fn watchdog_tick(&self) -> bool {
        if self.write_state.load(Ordering::Acquire) != 0 {
            let ticks = self.stalled_ticks.fetch_add(1, Ordering::AcqRel) + 1;
            if ticks >= self.policy.max_stall_ticks {
                tracing::warn!(
                    peer = self.peer_id(),
                    ticks,
                    opcode = self.write_state.load(Ordering::Acquire),
                    "write stalled, dropping socket"
                );
                self.force_close();
                return true;
            }
        } else {
            self.stalled_ticks.store(0, Ordering::Release);
        }
        false
    }
}

impl std::fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerChannel")
            .field("peer", &self.peer_id())
            .field("addr", &self.addr())
            .field("connected", &self.is_connected())
            .field("reconnect", &self.policy.reconnect)
            .finish()
    }
}

async fn write_loop(
    mut rx: mpsc::Receiver<Bytes>,
    mut write_half: OwnedWriteHalf,
    write_state: Arc<AtomicU32>,
    connected: watch::Sender<bool>,
) {
    while let Some(buf) = rx.recv().await {
        // the tag is the first opcode in the buffer, biased to nonzero
        let tag = buf
            .get(3)
            .map(|op| *op as u32 + 1)
            .unwrap_or(u32::MAX);
        write_state.store(tag, Ordering::Release);
        let res = write_half.write_all(&buf).await;
        write_state.store(0, Ordering::Release);
        if res.is_err() {
            break;
        }
    }
    let _ = connected.send(false);
}

/// Reads and dispatches commands until the socket dies. `crc` mirrors the
/// negotiated connection type.
pub(crate) async fn read_loop<H: ChannelHandler + ?Sized>(
    channel: Arc<PeerChannel>,
    mut read_half: OwnedReadHalf,
    crc: bool,
    handler: Arc<H>,
) {
    let mut hdr = [0u8; COMMAND_HEADER_LEN];
    loop {
        if read_half.read_exact(&mut hdr).await.is_err() {
            break;
        }
        let (len, opcode, sent_crc) = match decode_command_header(&hdr) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(peer = channel.peer_id(), %e, "bad command header");
                break;
            }
        };
        let mut body = vec![0u8; len];
        if read_half.read_exact(&mut body).await.is_err() {
            break;
        }
        if crc && sent_crc != command_crc(&hdr, &body) {
            tracing::warn!(peer = channel.peer_id(), ?opcode, "command crc mismatch");
            break;
        }
        let cmd = match Command::decode(opcode, body.into()) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!(peer = channel.peer_id(), ?opcode, %e, "undecodable command");
                break;
            }
        };
        if let Err(e) = handler.on_command(&channel, cmd).await {
            if !e.is_transient() {
                tracing::warn!(peer = channel.peer_id(), %e, "command handler failed");
            }
        }
    }
    channel.socket_lost();
    handler.on_disconnect(&channel);
}

/// Dispatch target for inbound commands. The controller is the one real
/// implementation; tests plug in small recorders.
#[async_trait::async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    async fn on_command(&self, from: &Arc<PeerChannel>, cmd: Command) -> Result<()>;

    fn on_disconnect(&self, _channel: &Arc<PeerChannel>) {}
}
