use crate::socket::Connection;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) u64);

impl ConnId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl ListenerId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Completion events delivered to the sink a listener or connect was
/// started with.
///
/// Per connection the order is: `Connected`, then `Data`/`WriteDone`/
/// `Clogged` in byte-stream order, then exactly one of `Closed` or `Fault`.
#[derive(Debug)]
pub enum SocketEvent {
    Connected(Connection),
    ConnectFailed {
        addr: SocketAddr,
        error: io::Error,
    },
    Data {
        conn: Connection,
        /// Per-connection read sequence, starting at 1.
        seq: u64,
        bytes: Bytes,
    },
    /// A write issued with `write_with_ack` is fully flushed.
    WriteDone {
        conn: Connection,
        seq: u64,
    },
    /// Writes have not drained for the configured number of attempts.
    /// Emitted once per episode.
    Clogged {
        conn: Connection,
        pending: usize,
    },
    Closed {
        conn: Connection,
    },
    Fault {
        conn: Connection,
        error: io::Error,
    },
    AcceptFault {
        listener: ListenerId,
        error: io::Error,
    },
}

impl SocketEvent {
    /// The connection this event belongs to, if any.
    pub fn conn(&self) -> Option<&Connection> {
        match self {
            SocketEvent::Connected(conn)
            | SocketEvent::Data { conn, .. }
            | SocketEvent::WriteDone { conn, .. }
            | SocketEvent::Clogged { conn, .. }
            | SocketEvent::Closed { conn }
            | SocketEvent::Fault { conn, .. } => Some(conn),
            SocketEvent::ConnectFailed { .. } | SocketEvent::AcceptFault { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SocketEvent::Closed { .. } | SocketEvent::Fault { .. })
    }
}
