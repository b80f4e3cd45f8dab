//! Non-blocking TCP on top of the stage model.
//!
//! Three single-threaded reactor stages (read, write, listen) each own a
//! [`SelectSource`]. Applications talk to them through [`SocketHandle`] and
//! [`Connection`] and receive [`SocketEvent`]s on a sink of their choice.

pub mod events;
pub(crate) mod handlers;
pub mod select;
pub(crate) mod sock_state;

pub use events::{ConnId, ListenerId, SocketEvent};
pub use select::{Interest, Readiness, SelectSource, Token};

use crate::config::SocketConfig;
use crate::error::SinkError;
use crate::io::base::{EventSink, SinkRef};
use crate::io::queue::FiniteQueue;
use crate::stage::{PendingStage, Stage, StageControl};
use crate::utils::CancelToken;
use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use handlers::{
    ListenCommand, ListenHandler, ReadCommand, ReadHandler, WriteCommand, WriteHandler,
};
use sock_state::SockState;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub const READ_STAGE: &str = "socket-read";
pub const WRITE_STAGE: &str = "socket-write";
pub const LISTEN_STAGE: &str = "socket-listen";

/// Command queues of the read and write reactors.
pub(crate) struct Links {
    pub read: Arc<FiniteQueue<ReadCommand>>,
    pub write: Arc<FiniteQueue<WriteCommand>>,
    /// Raised when a write-side `Deregister` did not fit; the write reactor
    /// then sweeps closed connections on its next command batch.
    pub stale_writes: Arc<AtomicBool>,
    pub cancel: CancelToken,
}

impl Links {
    /// Waits out a full queue. Fails once the reactor is gone.
    pub fn send_read(&self, cmd: ReadCommand) -> Result<(), SinkError<ReadCommand>> {
        self.read.enqueue_blocking(cmd, &self.cancel, None)
    }

    /// Waits out a full queue. Never call from a reactor thread.
    pub fn send_write(&self, cmd: WriteCommand) -> Result<(), SinkError<WriteCommand>> {
        self.write.enqueue_blocking(cmd, &self.cancel, None)
    }
}

/// Handle on one established connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    sock: Arc<SockState>,
    links: Arc<Links>,
}

impl Connection {
    pub(crate) fn new(sock: Arc<SockState>, links: Arc<Links>) -> Self {
        Self { sock, links }
    }

    pub(crate) fn sock(&self) -> &Arc<SockState> {
        &self.sock
    }

    pub fn id(&self) -> ConnId {
        self.sock.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.sock.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.sock.local
    }

    /// Queue `bytes` for sending. Writes go out in call order.
    ///
    /// Fails with Full once `max_outstanding_writes` are queued and with
    /// Closed after `close` or a terminal event.
    pub fn write(&self, bytes: impl Into<Bytes>) -> Result<u64, SinkError<Bytes>> {
        let seq = self.sock.push_write(bytes.into(), false)?;
        self.arm();
        Ok(seq)
    }

    /// Like [`write`](Self::write), plus a `WriteDone` event once flushed.
    pub fn write_with_ack(&self, bytes: impl Into<Bytes>) -> Result<u64, SinkError<Bytes>> {
        let seq = self.sock.push_write(bytes.into(), true)?;
        self.arm();
        Ok(seq)
    }

    /// Close after every write queued so far is flushed.
    pub fn close(&self) {
        if self.sock.request_close() {
            self.arm();
        }
    }

    /// `true` once closing was requested or the connection ended.
    pub fn is_closed(&self) -> bool {
        self.sock.is_closing()
    }

    pub fn pending_writes(&self) -> usize {
        self.sock.pending_writes()
    }

    /// Notify the write reactor on the idle to armed transition only.
    fn arm(&self) {
        if !self.sock.try_arm() {
            return;
        }
        if let Err(e) = self.links.send_write(WriteCommand::Arm(self.id())) {
            // write reactor gone; nothing will flush this
            self.finish(Some(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("write reactor unavailable: {}", e.reason),
            )));
        }
    }

    /// Emit the terminal event unless someone already did, and release the
    /// reactor registrations.
    ///
    /// Runs on reactor threads too, so the deregistrations never block. The
    /// read side also drops a closed connection on its next readiness, which
    /// the shutdown below guarantees.
    pub(crate) fn finish(&self, error: Option<io::Error>) {
        let conn = self.clone();
        let closed = self.sock.close_with(move || match error {
            None => SocketEvent::Closed { conn },
            Some(error) => SocketEvent::Fault { conn, error },
        });
        if !closed {
            return;
        }
        let _ = self.sock.stream.shutdown(Shutdown::Both);
        tracing::debug!("[socket] {} finished", self.id());
        let _ = self.links.read.enqueue(ReadCommand::Deregister(self.id()));
        if let Err(e) = self.links.write.enqueue(WriteCommand::Deregister(self.id()))
            && e.is_full()
        {
            self.links.stale_writes.store(true, Ordering::Release);
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("peer", &self.sock.peer)
            .field("closed", &self.sock.is_closed())
            .finish()
    }
}

/// Entry point for listening and connecting. Cheap to clone.
#[derive(Clone)]
pub struct SocketHandle {
    listen: SinkRef<ListenCommand>,
    next_listener: Arc<AtomicU64>,
}

impl SocketHandle {
    /// Bind now and accept in the background. Returns the bound address,
    /// which resolves port `0`.
    pub fn listen(
        &self,
        addr: impl ToSocketAddrs,
        sink: SinkRef<SocketEvent>,
    ) -> Result<(ListenerId, SocketAddr)> {
        let listener = TcpListener::bind(addr).context("bind listener")?;
        listener
            .set_nonblocking(true)
            .context("set listener non-blocking")?;
        let local = listener.local_addr().context("listener local address")?;
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listen
            .enqueue(ListenCommand::Listen { id, listener, sink })
            .map_err(|e| anyhow!("socket layer unavailable: {}", e.reason))?;
        tracing::info!("[{}] {} on {}", LISTEN_STAGE, id, local);
        Ok((id, local))
    }

    /// Connect in the background; completion is `Connected` or
    /// `ConnectFailed` on `sink`.
    pub fn connect(&self, addr: SocketAddr, sink: SinkRef<SocketEvent>) -> Result<()> {
        self.listen
            .enqueue(ListenCommand::Connect { addr, sink })
            .map_err(|e| anyhow!("socket layer unavailable: {}", e.reason))
    }

    pub fn stop_listening(&self, id: ListenerId) -> Result<()> {
        self.listen
            .enqueue(ListenCommand::Stop(id))
            .map_err(|e| anyhow!("socket layer unavailable: {}", e.reason))
    }
}

/// The three reactor stages.
pub struct SocketLayer {
    listen: Stage<ListenHandler>,
    read: Stage<ReadHandler>,
    write: Stage<WriteHandler>,
    handle: SocketHandle,
}

impl SocketLayer {
    pub fn start(cfg: &SocketConfig, cancel: &CancelToken) -> Result<Self> {
        let stage_cfg = cfg.stage_config();

        let read_select = Arc::new(SelectSource::new(READ_STAGE).context("read selector")?);
        let write_select = Arc::new(SelectSource::new(WRITE_STAGE).context("write selector")?);
        let listen_select = Arc::new(SelectSource::new(LISTEN_STAGE).context("listen selector")?);

        let read = PendingStage::new(
            READ_STAGE,
            stage_cfg.clone(),
            ReadHandler::new(
                read_select.clone(),
                cfg.read_buffer_size,
                cfg.read_clog_limit(),
            ),
        )
        .with_select(read_select);
        let stale_writes = Arc::new(AtomicBool::new(false));
        let write = PendingStage::new(
            WRITE_STAGE,
            stage_cfg.clone(),
            WriteHandler::new(
                write_select.clone(),
                cfg.write_clog_threshold,
                stale_writes.clone(),
            ),
        )
        .with_select(write_select);

        let links = Arc::new(Links {
            read: read.queue().clone(),
            write: write.queue().clone(),
            stale_writes,
            cancel: cancel.clone(),
        });
        let listen = PendingStage::new(
            LISTEN_STAGE,
            stage_cfg,
            ListenHandler::new(
                listen_select.clone(),
                links,
                cfg.accept_batch,
                cfg.max_outstanding_writes,
            ),
        )
        .with_select(listen_select);

        let handle = SocketHandle {
            listen: listen.queue().clone(),
            next_listener: Arc::new(AtomicU64::new(1)),
        };

        // Started stages shut down on drop if a later one fails.
        let write = write.start(cancel)?;
        let read = read.start(cancel)?;
        let listen = listen.start(cancel)?;

        Ok(Self {
            listen,
            read,
            write,
            handle,
        })
    }

    pub fn handle(&self) -> SocketHandle {
        self.handle.clone()
    }

    pub fn stages(&self) -> [&dyn StageControl; 3] {
        [&self.listen, &self.read, &self.write]
    }

    /// Stop accepting, then close every connection (one terminal event each).
    pub fn shutdown(&mut self) {
        self.listen.shutdown();
        self.read.shutdown();
        self.write.shutdown();
    }
}
