//! Reactor handlers for the read, write and listen stages.
//!
//! Each runs on a single-threaded stage with a [`SelectSource`] attached:
//! commands arrive through the stage queue, readiness through
//! `handle_readiness`.

use crate::error_throttled;
use crate::io::base::SinkRef;
use crate::model::EventHandler;
use crate::socket::events::{ConnId, ListenerId, SocketEvent};
use crate::socket::select::{Interest, Readiness, SelectSource, Token};
use crate::socket::sock_state::{SockState, WriteOutcome, WriteProgress};
use crate::socket::{Connection, Links};
use crate::warn_throttled;
use ahash::AHashMap;
use anyhow::Result;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

const FAULT_LOG_INTERVAL: Duration = Duration::from_secs(5);

fn shutdown_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "socket layer shut down")
}

// ---------------------------------------------------------------- read side

pub(crate) enum ReadCommand {
    Register(Connection),
    Deregister(ConnId),
}

enum ReadStep {
    Continue,
    Finished,
}

pub(crate) struct ReadSide {
    conn: Connection,
    buf: BytesMut,
    seq: u64,
    held: Option<SocketEvent>,
    held_tries: u32,
}

impl ReadSide {
    fn new(conn: Connection) -> Self {
        Self {
            conn,
            buf: BytesMut::new(),
            seq: 0,
            held: None,
            held_tries: 0,
        }
    }

    /// Retry a packet the completion sink refused earlier. `false` while it
    /// is still held.
    fn flush_held(&mut self, clog_limit: Option<u32>) -> bool {
        let Some(event) = self.held.take() else {
            return true;
        };
        match self.conn.sock().try_emit(event) {
            Ok(()) => {
                self.held_tries = 0;
                true
            }
            Err(e) if e.is_full() => {
                self.held_tries += 1;
                if clog_limit.is_some_and(|limit| self.held_tries >= limit) {
                    warn_throttled!(
                        FAULT_LOG_INTERVAL,
                        "[socket-read] {} sink full after {} tries, packet dropped",
                        self.conn.id(),
                        self.held_tries
                    );
                    self.held_tries = 0;
                    true
                } else {
                    self.held = e.into_value();
                    false
                }
            }
            // Connection closed or nobody listens any more.
            Err(_) => {
                self.held_tries = 0;
                true
            }
        }
    }

    /// One non-blocking read attempt.
    fn read_once(&mut self, buf_size: usize, clog_limit: Option<u32>) -> ReadStep {
        let sock = self.conn.sock().clone();
        if sock.is_closed() {
            return ReadStep::Finished;
        }
        if !self.flush_held(clog_limit) {
            return ReadStep::Continue;
        }

        self.buf.resize(buf_size, 0);
        match (&sock.stream).read(&mut self.buf) {
            Ok(0) => {
                self.conn.finish(None);
                ReadStep::Finished
            }
            Ok(n) => {
                self.seq += 1;
                let event = SocketEvent::Data {
                    conn: self.conn.clone(),
                    seq: self.seq,
                    bytes: self.buf.split_to(n).freeze(),
                };
                match sock.try_emit(event) {
                    Ok(()) => ReadStep::Continue,
                    Err(e) if e.is_full() => {
                        self.held = e.into_value();
                        self.held_tries = 1;
                        ReadStep::Continue
                    }
                    // closed by the write side meanwhile
                    Err(_) if sock.is_closed() => ReadStep::Finished,
                    Err(_) => ReadStep::Continue,
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                ReadStep::Continue
            }
            Err(e) => {
                error_throttled!(
                    FAULT_LOG_INTERVAL,
                    "[socket-read] {} read failed: {}",
                    sock.id,
                    e
                );
                self.conn.finish(Some(e));
                ReadStep::Finished
            }
        }
    }
}

pub(crate) struct ReadHandler {
    select: Arc<SelectSource<ReadSide>>,
    tokens: Mutex<AHashMap<ConnId, Token>>,
    buf_size: usize,
    clog_limit: Option<u32>,
}

impl ReadHandler {
    pub fn new(select: Arc<SelectSource<ReadSide>>, buf_size: usize, clog_limit: Option<u32>) -> Self {
        Self {
            select,
            tokens: Mutex::new(AHashMap::new()),
            buf_size: buf_size.max(1),
            clog_limit,
        }
    }

    fn drop_token(&self, token: Token) {
        if let Some(side) = self.select.deregister(token) {
            self.tokens.lock().remove(&side.conn.id());
        }
    }
}

impl EventHandler for ReadHandler {
    type Event = ReadCommand;

    fn handle_events(&self, batch: Vec<ReadCommand>) -> Result<()> {
        for cmd in batch {
            match cmd {
                ReadCommand::Register(conn) => {
                    if conn.sock().is_closed() {
                        continue;
                    }
                    let id = conn.id();
                    let sock = conn.sock().clone();
                    match self
                        .select
                        .register(&sock.stream, Interest::READ, ReadSide::new(conn.clone()))
                    {
                        Ok(token) => {
                            self.tokens.lock().insert(id, token);
                        }
                        Err(e) => conn.finish(Some(e)),
                    }
                }
                ReadCommand::Deregister(id) => {
                    let token = self.tokens.lock().remove(&id);
                    if let Some(token) = token {
                        self.select.deregister(token);
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_readiness(&self, batch: Vec<Readiness>) -> Result<()> {
        for ready in batch {
            let step = self.select.with_attachment(ready.token, |side| {
                side.read_once(self.buf_size, self.clog_limit)
            });
            if let Some(ReadStep::Finished) = step {
                self.drop_token(ready.token);
            }
        }
        Ok(())
    }

    fn destroy(&self) {
        for (_, side) in self.select.drain_registrations() {
            side.conn.finish(None);
        }
        self.tokens.lock().clear();
    }
}

// --------------------------------------------------------------- write side

pub(crate) enum WriteCommand {
    Register(Connection),
    /// Writes were queued; enable write interest.
    Arm(ConnId),
    Deregister(ConnId),
}

pub(crate) struct WriteSide {
    conn: Connection,
    progress: WriteProgress,
}

impl WriteSide {
    fn flush(&mut self) -> WriteOutcome {
        let sock: &SockState = self.conn.sock();
        let conn = &self.conn;
        self.progress.pump(
            &mut &sock.stream,
            || sock.pop_write(),
            |seq, ack| {
                if ack {
                    sock.emit(SocketEvent::WriteDone {
                        conn: conn.clone(),
                        seq,
                    });
                }
            },
        )
    }
}

pub(crate) struct WriteHandler {
    select: Arc<SelectSource<WriteSide>>,
    tokens: Mutex<AHashMap<ConnId, Token>>,
    clog_threshold: u32,
    stale: Arc<AtomicBool>,
}

impl WriteHandler {
    pub fn new(
        select: Arc<SelectSource<WriteSide>>,
        clog_threshold: u32,
        stale: Arc<AtomicBool>,
    ) -> Self {
        Self {
            select,
            tokens: Mutex::new(AHashMap::new()),
            clog_threshold,
            stale,
        }
    }

    /// Drop registrations of connections closed while their `Deregister`
    /// could not be queued.
    fn sweep_closed(&self) {
        let tokens: Vec<Token> = self.tokens.lock().values().copied().collect();
        let mut swept = 0;
        for token in tokens {
            let closed = self
                .select
                .with_attachment(token, |side| side.conn.sock().is_closed());
            if closed == Some(true) {
                self.drop_token(token);
                swept += 1;
            }
        }
        tracing::debug!("[socket-write] swept {} closed connection(s)", swept);
    }

    fn arm(&self, token: Token) {
        if self.select.interest(token) == Some(Interest::WRITE) {
            return;
        }
        if let Err(e) = self.select.set_interest(token, Interest::WRITE) {
            tracing::debug!("[socket-write] arm token {}: {}", token, e);
        }
    }

    fn drop_token(&self, token: Token) {
        if let Some(side) = self.select.deregister(token) {
            self.tokens.lock().remove(&side.conn.id());
        }
    }
}

impl EventHandler for WriteHandler {
    type Event = WriteCommand;

    fn handle_events(&self, batch: Vec<WriteCommand>) -> Result<()> {
        if self.stale.swap(false, Ordering::AcqRel) {
            self.sweep_closed();
        }
        for cmd in batch {
            match cmd {
                WriteCommand::Register(conn) => {
                    if conn.sock().is_closed() {
                        continue;
                    }
                    let id = conn.id();
                    let sock = conn.sock().clone();
                    let side = WriteSide {
                        conn: conn.clone(),
                        progress: WriteProgress::new(self.clog_threshold),
                    };
                    match self.select.register(&sock.stream, Interest::NONE, side) {
                        Ok(token) => {
                            self.tokens.lock().insert(id, token);
                            // an Arm sent before this registration was ignored
                            if sock.pending_writes() > 0 {
                                sock.set_armed();
                                self.arm(token);
                            }
                        }
                        Err(e) => conn.finish(Some(e)),
                    }
                }
                WriteCommand::Arm(id) => {
                    let token = self.tokens.lock().get(&id).copied();
                    if let Some(token) = token {
                        self.arm(token);
                    }
                }
                WriteCommand::Deregister(id) => {
                    let token = self.tokens.lock().remove(&id);
                    if let Some(token) = token {
                        self.select.deregister(token);
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_readiness(&self, batch: Vec<Readiness>) -> Result<()> {
        for ready in batch {
            let Some((outcome, conn)) = self
                .select
                .with_attachment(ready.token, |side| (side.flush(), side.conn.clone()))
            else {
                continue;
            };

            match outcome {
                WriteOutcome::Drained => {
                    if let Err(e) = self.select.set_interest(ready.token, Interest::NONE) {
                        tracing::debug!("[socket-write] disarm {}: {}", conn.id(), e);
                    }
                    conn.sock().disarm();
                    // a write that landed before the disarm sent no Arm
                    if conn.sock().pending_writes() > 0 {
                        conn.sock().set_armed();
                        self.arm(ready.token);
                    }
                }
                WriteOutcome::Pending { clogged_now } => {
                    if clogged_now {
                        let pending = conn.sock().pending_writes() + 1;
                        tracing::debug!("[socket-write] {} clogged, {} pending", conn.id(), pending);
                        conn.sock().emit(SocketEvent::Clogged { conn: conn.clone(), pending });
                    }
                }
                WriteOutcome::Close => {
                    self.drop_token(ready.token);
                    conn.finish(None);
                }
                WriteOutcome::Fault(e) => {
                    error_throttled!(
                        FAULT_LOG_INTERVAL,
                        "[socket-write] {} write failed: {}",
                        conn.id(),
                        e
                    );
                    self.drop_token(ready.token);
                    conn.finish(Some(e));
                }
            }
        }
        Ok(())
    }

    fn destroy(&self) {
        for (_, side) in self.select.drain_registrations() {
            let dropped = side.conn.sock().clear_writes();
            if dropped > 0 {
                tracing::debug!(
                    "[socket-write] {} closed with {} unsent write(s)",
                    side.conn.id(),
                    dropped
                );
            }
            side.conn.finish(None);
        }
        self.tokens.lock().clear();
    }
}

// -------------------------------------------------------------- listen side

pub(crate) enum ListenCommand {
    Listen {
        id: ListenerId,
        listener: TcpListener,
        sink: SinkRef<SocketEvent>,
    },
    Connect {
        addr: SocketAddr,
        sink: SinkRef<SocketEvent>,
    },
    Stop(ListenerId),
}

pub(crate) enum ListenSide {
    Listener {
        id: ListenerId,
        listener: TcpListener,
        sink: SinkRef<SocketEvent>,
    },
    Connecting {
        addr: SocketAddr,
        stream: TcpStream,
        sink: SinkRef<SocketEvent>,
    },
}

enum Accepted {
    Streams(Vec<TcpStream>, SinkRef<SocketEvent>),
    ConnectReady,
}

pub(crate) struct ListenHandler {
    select: Arc<SelectSource<ListenSide>>,
    listeners: Mutex<AHashMap<ListenerId, Token>>,
    links: Arc<Links>,
    next_conn: AtomicU64,
    accept_batch: usize,
    max_outstanding: usize,
}

impl ListenHandler {
    pub fn new(
        select: Arc<SelectSource<ListenSide>>,
        links: Arc<Links>,
        accept_batch: usize,
        max_outstanding: usize,
    ) -> Self {
        Self {
            select,
            listeners: Mutex::new(AHashMap::new()),
            links,
            next_conn: AtomicU64::new(1),
            accept_batch: accept_batch.max(1),
            max_outstanding,
        }
    }

    /// Build the connection, announce it, then hand it to the read and write
    /// reactors. `Connected` goes first so it precedes any `Data`.
    fn establish(&self, stream: TcpStream, sink: SinkRef<SocketEvent>) -> io::Result<Connection> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let id = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        let sock = Arc::new(SockState::new(id, stream, sink, self.max_outstanding)?);
        let conn = Connection::new(sock, self.links.clone());

        if let Err(e) = conn.sock().try_emit(SocketEvent::Connected(conn.clone())) {
            warn_throttled!(
                FAULT_LOG_INTERVAL,
                "[socket-listen] {} not announced ({}), dropping",
                id,
                e.reason
            );
            conn.sock().mark_closed();
            let _ = conn.sock().stream.shutdown(std::net::Shutdown::Both);
            return Ok(conn);
        }

        tracing::debug!("[socket-listen] {} established with {}", id, conn.peer_addr());
        // Blocks while a reactor queue is full; the read and write reactors
        // never wait on this stage.
        if self.links.send_read(ReadCommand::Register(conn.clone())).is_err()
            || self.links.send_write(WriteCommand::Register(conn.clone())).is_err()
        {
            conn.finish(Some(shutdown_error()));
        }
        Ok(conn)
    }

    fn start_connect(&self, addr: SocketAddr, sink: SinkRef<SocketEvent>) {
        let connecting = nonblocking_connect(addr).and_then(|(stream, done)| {
            if done {
                self.establish(stream, sink.clone()).map(|_| ())
            } else {
                let fd = stream.as_raw_fd();
                let side = ListenSide::Connecting {
                    addr,
                    stream,
                    sink: sink.clone(),
                };
                self.select.register(&fd, Interest::WRITE, side).map(|_| ())
            }
        });
        if let Err(error) = connecting {
            tracing::debug!("[socket-listen] connect {} failed: {}", addr, error);
            let _ = sink.enqueue(SocketEvent::ConnectFailed { addr, error });
        }
    }

    fn finish_connect(&self, token: Token) {
        let Some(ListenSide::Connecting { addr, stream, sink }) = self.select.deregister(token)
        else {
            return;
        };
        let outcome = match stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => stream.peer_addr().map(|_| ()),
        };
        let outcome = outcome.and_then(|()| self.establish(stream, sink.clone()).map(|_| ()));
        if let Err(error) = outcome {
            tracing::debug!("[socket-listen] connect {} failed: {}", addr, error);
            let _ = sink.enqueue(SocketEvent::ConnectFailed { addr, error });
        }
    }

    fn accept_ready(&self, token: Token) -> Option<Accepted> {
        let batch = self.accept_batch;
        self.select.with_attachment(token, |side| match side {
            ListenSide::Connecting { .. } => Accepted::ConnectReady,
            ListenSide::Listener { id, listener, sink } => {
                let mut streams = Vec::new();
                while streams.len() < batch {
                    match listener.accept() {
                        Ok((stream, _)) => streams.push(stream),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(error) => {
                            error_throttled!(
                                FAULT_LOG_INTERVAL,
                                "[socket-listen] {} accept failed: {}",
                                id,
                                error
                            );
                            let _ = sink.enqueue(SocketEvent::AcceptFault { listener: *id, error });
                            break;
                        }
                    }
                }
                Accepted::Streams(streams, sink.clone())
            }
        })
    }
}

/// Start a non-blocking connect. The flag is `true` when it completed
/// immediately.
fn nonblocking_connect(addr: SocketAddr) -> io::Result<(TcpStream, bool)> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => Ok((socket.into(), true)),
        Err(e)
            if e.kind() == io::ErrorKind::WouldBlock
                || e.raw_os_error() == Some(libc::EINPROGRESS) =>
        {
            Ok((socket.into(), false))
        }
        Err(e) => Err(e),
    }
}

impl EventHandler for ListenHandler {
    type Event = ListenCommand;

    fn handle_events(&self, batch: Vec<ListenCommand>) -> Result<()> {
        for cmd in batch {
            match cmd {
                ListenCommand::Listen { id, listener, sink } => {
                    let fd = listener.as_raw_fd();
                    let registered = self.select.register(
                        &fd,
                        Interest::READ,
                        ListenSide::Listener { id, listener, sink: sink.clone() },
                    );
                    match registered {
                        Ok(token) => {
                            self.listeners.lock().insert(id, token);
                        }
                        Err(error) => {
                            let _ = sink.enqueue(SocketEvent::AcceptFault { listener: id, error });
                        }
                    }
                }
                ListenCommand::Connect { addr, sink } => self.start_connect(addr, sink),
                ListenCommand::Stop(id) => {
                    let token = self.listeners.lock().remove(&id);
                    if let Some(token) = token {
                        self.select.deregister(token);
                        tracing::info!("[socket-listen] {} stopped", id);
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_readiness(&self, batch: Vec<Readiness>) -> Result<()> {
        for ready in batch {
            match self.accept_ready(ready.token) {
                Some(Accepted::ConnectReady) => self.finish_connect(ready.token),
                Some(Accepted::Streams(streams, sink)) => {
                    for stream in streams {
                        if let Err(e) = self.establish(stream, sink.clone()) {
                            tracing::debug!("[socket-listen] accepted socket unusable: {}", e);
                        }
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    fn destroy(&self) {
        for (_, side) in self.select.drain_registrations() {
            if let ListenSide::Connecting { addr, sink, .. } = side {
                let _ = sink.enqueue(SocketEvent::ConnectFailed {
                    addr,
                    error: shutdown_error(),
                });
            }
        }
        self.listeners.lock().clear();
    }
}
