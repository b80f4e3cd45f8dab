//! Readiness multiplexer over the `polling` crate.
//!
//! Registrations are oneshot at the OS level; every delivered registration is
//! re-armed with its current interest before the batch is returned, so callers
//! see level-triggered behaviour.

use crate::stage::ReadinessSource;
use ahash::AHashMap;
use parking_lot::Mutex;
use polling::{Event, Poller};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub type Token = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        readable: false,
        writable: false,
    };
    pub const READ: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITE: Interest = Interest {
        readable: false,
        writable: true,
    };

    #[inline]
    pub fn is_none(&self) -> bool {
        !self.readable && !self.writable
    }

    #[inline]
    fn event(self, token: Token) -> Event {
        match (self.readable, self.writable) {
            (true, true) => Event::all(token),
            (true, false) => Event::readable(token),
            (false, true) => Event::writable(token),
            (false, false) => Event::none(token),
        }
    }
}

/// One observed readiness of a registered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

struct Registration<A> {
    fd: RawFd,
    interest: Interest,
    attachment: A,
}

struct Registry<A> {
    by_token: AHashMap<Token, Registration<A>>,
    by_fd: AHashMap<RawFd, Token>,
}

/// Set of channel-interest records with an opaque attachment each.
pub struct SelectSource<A> {
    name: String,
    poller: Poller,
    regs: Mutex<Registry<A>>,
    events: Mutex<Vec<Event>>,
    next_token: AtomicUsize,
}

impl<A: Send> SelectSource<A> {
    pub fn new(name: impl Into<String>) -> io::Result<Self> {
        Ok(Self {
            name: name.into(),
            poller: Poller::new()?,
            regs: Mutex::new(Registry {
                by_token: AHashMap::new(),
                by_fd: AHashMap::new(),
            }),
            events: Mutex::new(Vec::new()),
            next_token: AtomicUsize::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `source`. A channel may be registered once per source.
    ///
    /// The caller must keep the underlying descriptor open until
    /// [`deregister`](Self::deregister); storing its owner in the attachment
    /// does that.
    pub fn register(
        &self,
        source: &impl AsRawFd,
        interest: Interest,
        attachment: A,
    ) -> io::Result<Token> {
        let fd = source.as_raw_fd();
        let mut regs = self.regs.lock();
        if regs.by_fd.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {fd} already registered with {}", self.name),
            ));
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.poller.add(fd, interest.event(token))?;
        regs.by_fd.insert(fd, token);
        regs.by_token.insert(
            token,
            Registration {
                fd,
                interest,
                attachment,
            },
        );
        Ok(token)
    }

    /// Remove a registration and hand back its attachment.
    pub fn deregister(&self, token: Token) -> Option<A> {
        let mut regs = self.regs.lock();
        let reg = regs.by_token.remove(&token)?;
        regs.by_fd.remove(&reg.fd);
        if let Err(e) = self.poller.delete(reg.fd) {
            tracing::debug!("[{}] delete fd {}: {}", self.name, reg.fd, e);
        }
        Some(reg.attachment)
    }

    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.regs.lock().by_token.get(&token).map(|r| r.interest)
    }

    pub fn set_interest(&self, token: Token, interest: Interest) -> io::Result<()> {
        let mut regs = self.regs.lock();
        let Some(reg) = regs.by_token.get_mut(&token) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown token"));
        };
        reg.interest = interest;
        self.poller.modify(reg.fd, interest.event(token))
    }

    /// Run `f` on a registration's attachment. `f` must not call back into
    /// this source.
    pub fn with_attachment<R>(&self, token: Token, f: impl FnOnce(&mut A) -> R) -> Option<R> {
        let mut regs = self.regs.lock();
        regs.by_token.get_mut(&token).map(|r| f(&mut r.attachment))
    }

    /// Registrations with a non-empty interest.
    pub fn num_active(&self) -> usize {
        self.regs
            .lock()
            .by_token
            .values()
            .filter(|r| !r.interest.is_none())
            .count()
    }

    pub fn len(&self) -> usize {
        self.regs.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deregister everything, returning the attachments.
    pub fn drain_registrations(&self) -> Vec<(Token, A)> {
        let mut regs = self.regs.lock();
        regs.by_fd.clear();
        let drained: Vec<(Token, Registration<A>)> = regs.by_token.drain().collect();
        drained
            .into_iter()
            .map(|(token, reg)| {
                if let Err(e) = self.poller.delete(reg.fd) {
                    tracing::debug!("[{}] delete fd {}: {}", self.name, reg.fd, e);
                }
                (token, reg.attachment)
            })
            .collect()
    }

    /// Wake a thread blocked in [`blocking_dequeue`](Self::blocking_dequeue).
    pub fn wake(&self) -> io::Result<()> {
        self.poller.notify()
    }

    /// Wait up to `timeout` for readiness and return at most `max` results
    /// (all of them when `None`). Results beyond `max` are re-armed and show
    /// up again on the next call.
    pub fn blocking_dequeue(
        &self,
        timeout: Duration,
        max: Option<usize>,
    ) -> io::Result<Option<Vec<Readiness>>> {
        let mut events = self.events.lock();
        events.clear();
        match self.poller.wait(&mut events, Some(timeout)) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e),
        }
        if events.is_empty() {
            return Ok(None);
        }

        let limit = max.unwrap_or(usize::MAX);
        let regs = self.regs.lock();
        let mut ready = Vec::with_capacity(events.len().min(limit));
        for ev in events.drain(..) {
            // deregistered while we were waiting
            let Some(reg) = regs.by_token.get(&ev.key) else {
                continue;
            };
            if let Err(e) = self.poller.modify(reg.fd, reg.interest.event(ev.key)) {
                tracing::debug!("[{}] re-arm fd {}: {}", self.name, reg.fd, e);
            }
            if ready.len() < limit {
                ready.push(Readiness {
                    token: ev.key,
                    readable: ev.readable,
                    writable: ev.writable,
                });
            }
        }
        Ok(if ready.is_empty() { None } else { Some(ready) })
    }

    pub fn blocking_dequeue_all(&self, timeout: Duration) -> io::Result<Option<Vec<Readiness>>> {
        self.blocking_dequeue(timeout, None)
    }
}

impl<A: Send> ReadinessSource for SelectSource<A> {
    fn num_active(&self) -> usize {
        SelectSource::num_active(self)
    }

    fn blocking_dequeue(
        &self,
        timeout: Duration,
        max: Option<usize>,
    ) -> io::Result<Option<Vec<Readiness>>> {
        SelectSource::blocking_dequeue(self, timeout, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    #[test]
    fn double_registration_is_rejected() {
        let (_client, server) = pair();
        let select: SelectSource<()> = SelectSource::new("dup").unwrap();
        select.register(&server, Interest::READ, ()).unwrap();
        let err = select.register(&server, Interest::READ, ()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(select.len(), 1);
    }

    #[test]
    fn readable_channel_is_reported_and_rearmed() {
        let (mut client, server) = pair();
        let select = SelectSource::new("read").unwrap();
        let token = select.register(&server, Interest::READ, 7u32).unwrap();
        assert_eq!(select.num_active(), 1);

        assert!(
            select
                .blocking_dequeue(Duration::from_millis(20), None)
                .unwrap()
                .is_none()
        );

        client.write_all(b"ping").unwrap();
        let ready = select
            .blocking_dequeue(Duration::from_secs(2), None)
            .unwrap()
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].token, token);
        assert!(ready[0].readable);

        // data was not consumed, so the re-armed registration fires again
        let again = select
            .blocking_dequeue(Duration::from_secs(2), Some(1))
            .unwrap()
            .unwrap();
        assert_eq!(again[0].token, token);
        assert_eq!(select.with_attachment(token, |a| *a), Some(7));
    }

    #[test]
    fn none_interest_is_inactive_and_silent() {
        let (mut client, server) = pair();
        let select = SelectSource::new("idle").unwrap();
        let token = select.register(&server, Interest::NONE, ()).unwrap();
        assert_eq!(select.num_active(), 0);
        client.write_all(b"x").unwrap();
        assert!(
            select
                .blocking_dequeue(Duration::from_millis(30), None)
                .unwrap()
                .is_none()
        );
        select.set_interest(token, Interest::READ).unwrap();
        assert_eq!(select.num_active(), 1);
        assert!(
            select
                .blocking_dequeue(Duration::from_secs(2), None)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn deregister_returns_attachment() {
        let (_client, server) = pair();
        let select = SelectSource::new("dereg").unwrap();
        let token = select.register(&server, Interest::READ, "att").unwrap();
        assert_eq!(select.deregister(token), Some("att"));
        assert_eq!(select.deregister(token), None);
        assert!(select.is_empty());
        // the fd may be registered again once released
        select.register(&server, Interest::READ, "again").unwrap();
        assert_eq!(select.drain_registrations().len(), 1);
        assert!(select.is_empty());
    }
}
