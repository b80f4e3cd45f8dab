//! Per-connection state.
//!
//! Only the write FIFO is shared with producer threads and it has its own
//! lock. Read buffers and write progress live in the reactor attachments
//! (`ReadSide`, `WriteSide`) and are touched by a single reactor thread.
//!
//! Both reactors emit onto the same completion sink. Emission goes through
//! `emit_lock`, and the terminal event sets `closed` under it, so nothing
//! for a connection is delivered after its `Closed` or `Fault`.

use crate::error::{SinkError, SinkFailReason};
use crate::io::base::SinkRef;
use crate::socket::events::{ConnId, SocketEvent};
use crate::warn_throttled;
use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

const DROP_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub(crate) enum WriteRequest {
    Data { bytes: Bytes, seq: u64, ack: bool },
    /// Close once everything queued before it is flushed.
    Close,
}

pub(crate) struct SockState {
    pub id: ConnId,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub stream: TcpStream,
    sink: SinkRef<SocketEvent>,
    writes: Mutex<VecDeque<WriteRequest>>,
    max_outstanding: usize,
    next_write_seq: AtomicU64,
    close_requested: AtomicBool,
    /// Write interest requested and not yet dropped by the write reactor.
    armed: AtomicBool,
    /// Set by whoever emits the terminal event, under `emit_lock`.
    closed: AtomicBool,
    emit_lock: Mutex<()>,
}

impl SockState {
    pub fn new(
        id: ConnId,
        stream: TcpStream,
        sink: SinkRef<SocketEvent>,
        max_outstanding: usize,
    ) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        Ok(Self {
            id,
            peer,
            local,
            stream,
            sink,
            writes: Mutex::new(VecDeque::new()),
            max_outstanding,
            next_write_seq: AtomicU64::new(1),
            close_requested: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            emit_lock: Mutex::new(()),
        })
    }

    /// Queue bytes for the write reactor. Returns the write sequence number.
    pub fn push_write(&self, bytes: Bytes, ack: bool) -> Result<u64, SinkError<Bytes>> {
        if self.is_closing() {
            return Err(SinkError::closed(Some(bytes)));
        }
        let mut writes = self.writes.lock();
        if self.max_outstanding > 0 && writes.len() >= self.max_outstanding {
            return Err(SinkError::full(Some(bytes)));
        }
        let seq = self.next_write_seq.fetch_add(1, Ordering::Relaxed);
        writes.push_back(WriteRequest::Data { bytes, seq, ack });
        Ok(seq)
    }

    /// Queue the close marker. `false` if a close was already requested.
    pub fn request_close(&self) -> bool {
        let mut writes = self.writes.lock();
        if self.close_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        writes.push_back(WriteRequest::Close);
        true
    }

    pub fn pop_write(&self) -> Option<WriteRequest> {
        self.writes.lock().pop_front()
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn clear_writes(&self) -> usize {
        let mut writes = self.writes.lock();
        let n = writes.len();
        writes.clear();
        n
    }

    pub fn is_closing(&self) -> bool {
        self.close_requested.load(Ordering::Acquire) || self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// `true` for the caller that moves the connection from idle to armed
    /// and therefore has to notify the write reactor.
    pub fn try_arm(&self) -> bool {
        !self.armed.swap(true, Ordering::AcqRel)
    }

    /// Mark armed without notifying; used by the write reactor itself.
    pub fn set_armed(&self) {
        self.armed.store(true, Ordering::Release);
    }

    /// Called by the write reactor after it drops write interest. The
    /// caller re-checks `pending_writes` afterwards.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Close without a terminal event, for connections never announced.
    pub fn mark_closed(&self) -> bool {
        let _emit = self.emit_lock.lock();
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Deliver a non-terminal event. Refused with Closed (and no value) once
    /// the terminal event went out; a Full error hands the event back.
    pub fn try_emit(&self, event: SocketEvent) -> Result<(), SinkError<SocketEvent>> {
        let _emit = self.emit_lock.lock();
        if self.is_closed() {
            return Err(SinkError::closed(None));
        }
        self.sink.enqueue(event)
    }

    /// Like `try_emit`, dropping the event with a warning if the sink refuses.
    pub fn emit(&self, event: SocketEvent) {
        let _emit = self.emit_lock.lock();
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.sink.enqueue(event) {
            self.dropped(e.reason);
        }
    }

    /// Close and emit the terminal event built by `terminal`. `true` exactly
    /// once, for the caller that closed the connection.
    pub fn close_with(&self, terminal: impl FnOnce() -> SocketEvent) -> bool {
        let _emit = self.emit_lock.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = self.sink.enqueue(terminal()) {
            self.dropped(e.reason);
        }
        true
    }

    fn dropped(&self, reason: SinkFailReason) {
        warn_throttled!(
            DROP_LOG_INTERVAL,
            "[socket] {} event dropped: {}",
            self.id,
            reason
        );
    }
}

struct InFlight {
    buf: Bytes,
    seq: u64,
    ack: bool,
}

#[derive(Debug)]
pub(crate) enum WriteOutcome {
    /// FIFO empty, nothing in flight.
    Drained,
    /// Socket would block with data still in flight.
    Pending { clogged_now: bool },
    /// Close marker reached; everything before it is flushed.
    Close,
    Fault(io::Error),
}

/// Write cursor plus clog detection for one connection.
pub(crate) struct WriteProgress {
    current: Option<InFlight>,
    unfinished: u32,
    clogged: bool,
    threshold: u32,
}

impl WriteProgress {
    pub fn new(threshold: u32) -> Self {
        Self {
            current: None,
            unfinished: 0,
            clogged: false,
            threshold: threshold.max(1),
        }
    }

    pub fn in_flight(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_clogged(&self) -> bool {
        self.clogged
    }

    /// Write as much as the socket takes. `next` pops the FIFO head, `done` is
    /// called with `(seq, ack)` for every fully written request.
    ///
    /// Each call that ends with data still in flight counts as one unfinished
    /// attempt; reaching the threshold reports `clogged_now` once, until a
    /// request completes again.
    pub fn pump<W: Write>(
        &mut self,
        out: &mut W,
        mut next: impl FnMut() -> Option<WriteRequest>,
        mut done: impl FnMut(u64, bool),
    ) -> WriteOutcome {
        loop {
            if self.current.is_none() {
                match next() {
                    None => {
                        self.unfinished = 0;
                        self.clogged = false;
                        return WriteOutcome::Drained;
                    }
                    Some(WriteRequest::Close) => return WriteOutcome::Close,
                    Some(WriteRequest::Data { bytes, seq, ack }) => {
                        self.current = Some(InFlight { buf: bytes, seq, ack });
                    }
                }
            }
            let Some(cur) = self.current.as_mut() else {
                continue;
            };

            if cur.buf.is_empty() {
                let (seq, ack) = (cur.seq, cur.ack);
                self.complete(&mut done, seq, ack);
                continue;
            }

            match out.write(&cur.buf) {
                Ok(0) => return WriteOutcome::Fault(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    cur.buf.advance(n);
                    if cur.buf.is_empty() {
                        let (seq, ack) = (cur.seq, cur.ack);
                        self.complete(&mut done, seq, ack);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.unfinished = self.unfinished.saturating_add(1);
                    let clogged_now = !self.clogged && self.unfinished >= self.threshold;
                    if clogged_now {
                        self.clogged = true;
                    }
                    return WriteOutcome::Pending { clogged_now };
                }
                Err(e) => return WriteOutcome::Fault(e),
            }
        }
    }

    fn complete(&mut self, done: &mut impl FnMut(u64, bool), seq: u64, ack: bool) {
        self.current = None;
        self.unfinished = 0;
        self.clogged = false;
        done(seq, ack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::base::{EventSink, EventSource};
    use crate::io::queue::FiniteQueue;
    use std::collections::VecDeque;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    struct StuckWriter;

    impl Write for StuckWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Accepts at most `chunk` bytes per call and `budget` bytes in total.
    struct Trickle {
        got: Vec<u8>,
        chunk: usize,
        budget: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.chunk).min(self.budget);
            self.budget -= n;
            self.got.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn data(bytes: &'static [u8], seq: u64, ack: bool) -> WriteRequest {
        WriteRequest::Data {
            bytes: Bytes::from_static(bytes),
            seq,
            ack,
        }
    }

    #[test]
    fn stuck_writer_clogs_exactly_once() {
        let mut fifo: VecDeque<WriteRequest> = VecDeque::from([data(b"payload", 1, false)]);
        let mut progress = WriteProgress::new(3);
        let mut clogs = 0;
        for _ in 0..20 {
            match progress.pump(&mut StuckWriter, || fifo.pop_front(), |_, _| {}) {
                WriteOutcome::Pending { clogged_now } => clogs += clogged_now as u32,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(clogs, 1);
        assert!(progress.is_clogged());
        assert!(progress.in_flight());
    }

    #[test]
    fn partial_writes_keep_order_and_ack() {
        let mut fifo: VecDeque<WriteRequest> =
            VecDeque::from([data(b"hello ", 1, false), data(b"world", 2, true)]);
        let mut out = Trickle {
            got: Vec::new(),
            chunk: 4,
            budget: 7,
        };
        let mut acked = Vec::new();
        let mut progress = WriteProgress::new(8);

        let first = progress.pump(&mut out, || fifo.pop_front(), |seq, ack| {
            if ack {
                acked.push(seq);
            }
        });
        assert!(matches!(first, WriteOutcome::Pending { clogged_now: false }));
        assert_eq!(out.got, b"hello w");

        out.budget = usize::MAX;
        let second = progress.pump(&mut out, || fifo.pop_front(), |seq, ack| {
            if ack {
                acked.push(seq);
            }
        });
        assert!(matches!(second, WriteOutcome::Drained));
        assert_eq!(out.got, b"hello world");
        assert_eq!(acked, vec![2]);
    }

    #[test]
    fn close_marker_waits_for_earlier_writes() {
        let mut fifo: VecDeque<WriteRequest> =
            VecDeque::from([data(b"bye", 1, false), WriteRequest::Close]);
        let mut out = Trickle {
            got: Vec::new(),
            chunk: 16,
            budget: usize::MAX,
        };
        let mut progress = WriteProgress::new(4);
        let outcome = progress.pump(&mut out, || fifo.pop_front(), |_, _| {});
        assert!(matches!(outcome, WriteOutcome::Close));
        assert_eq!(out.got, b"bye");
    }

    #[test]
    fn completion_resets_clog_episode() {
        let mut progress = WriteProgress::new(1);
        let mut fifo: VecDeque<WriteRequest> = VecDeque::from([data(b"a", 1, false)]);
        assert!(matches!(
            progress.pump(&mut StuckWriter, || fifo.pop_front(), |_, _| {}),
            WriteOutcome::Pending { clogged_now: true }
        ));
        let mut sink: Vec<u8> = Vec::new();
        assert!(matches!(
            progress.pump(&mut sink, || fifo.pop_front(), |_, _| {}),
            WriteOutcome::Drained
        ));
        assert!(!progress.is_clogged());
        fifo.push_back(data(b"b", 2, false));
        assert!(matches!(
            progress.pump(&mut StuckWriter, || fifo.pop_front(), |_, _| {}),
            WriteOutcome::Pending { clogged_now: true }
        ));
    }

    fn loopback_sock(capacity: Option<usize>) -> (Arc<SockState>, Arc<FiniteQueue<SocketEvent>>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let client = TcpStream::connect(listener.local_addr().expect("addr")).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        let events = Arc::new(FiniteQueue::new("events", capacity));
        let sock = SockState::new(ConnId(1), server, events.clone(), 0).expect("sock state");
        (Arc::new(sock), events, client)
    }

    /// Stand-in event tagged by port; carries no connection handle.
    fn tagged(tag: u16) -> SocketEvent {
        SocketEvent::ConnectFailed {
            addr: SocketAddr::from(([127, 0, 0, 1], tag)),
            error: io::ErrorKind::Other.into(),
        }
    }

    fn tags(events: Vec<SocketEvent>) -> Vec<u16> {
        events
            .into_iter()
            .map(|e| match e {
                SocketEvent::ConnectFailed { addr, .. } => addr.port(),
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn nothing_is_emitted_after_terminal_event() {
        let (sock, events, _client) = loopback_sock(None);
        sock.emit(tagged(1));
        sock.try_emit(tagged(2)).expect("open");
        assert!(sock.close_with(|| tagged(3)));
        assert!(!sock.close_with(|| tagged(4)));
        assert!(!sock.mark_closed());

        sock.emit(tagged(5));
        let err = sock.try_emit(tagged(6)).expect_err("closed");
        assert!(err.is_closed());
        assert!(err.into_value().is_none());
        assert_eq!(tags(events.dequeue_all().expect("events")), vec![1, 2, 3]);
    }

    #[test]
    fn full_sink_hands_event_back() {
        let (sock, events, _client) = loopback_sock(Some(1));
        sock.try_emit(tagged(1)).expect("room");
        let err = sock.try_emit(tagged(2)).expect_err("full");
        assert!(err.is_full());
        assert_eq!(tags(err.into_value().into_iter().collect()), vec![2]);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn terminal_event_is_last_under_concurrent_emitters() {
        for _ in 0..20 {
            let (sock, events, _client) = loopback_sock(None);
            let emitter = {
                let sock = sock.clone();
                thread::spawn(move || {
                    let mut tag = 1u16;
                    while sock.try_emit(tagged(tag)).is_ok() {
                        tag = tag % 60_000 + 1;
                    }
                })
            };
            thread::sleep(Duration::from_millis(2));
            assert!(sock.close_with(|| tagged(0)));
            emitter.join().expect("emitter");

            let seen = tags(events.dequeue_all().expect("events"));
            assert_eq!(seen.last(), Some(&0));
            assert_eq!(seen.iter().filter(|t| **t == 0).count(), 1);
        }
    }

    #[test]
    fn arm_notifies_once_per_idle_period() {
        let (sock, _events, _client) = loopback_sock(None);
        assert!(sock.try_arm());
        assert!(!sock.try_arm());
        sock.disarm();
        assert!(sock.try_arm());
        sock.disarm();
        sock.set_armed();
        assert!(!sock.try_arm());
    }
}
