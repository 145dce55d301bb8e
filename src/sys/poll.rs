//! POSIX `poll(2)` fallback selector, used when `MUDUO_USE_POLL` is set.
//!
//! Grounded in `examples/original_source/DefaultPoller.cc`'s note that an
//! alternate `PollPoller` implementation exists alongside `EPollPoller`, and
//! adapted from the teacher's legacy `poll.rs` to this crate's fd-keyed,
//! level-triggered model.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use indexmap::IndexMap;
use libc::{c_int, nfds_t, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, POLLPRI, POLLRDHUP};

use crate::ready::Ready;
use crate::token::Token;

/// A `poll(2)`-backed selector.
///
/// Unlike epoll, `poll` takes the full interest set on every call, so this
/// type keeps its own `fd -> (Token, Ready)` registry and rebuilds the
/// `pollfd` array each `wait`.
pub struct Poll {
    registry: IndexMap<RawFd, (Token, Ready)>,
    pollfds: Vec<libc::pollfd>,
}

impl Poll {
    pub fn new() -> io::Result<Poll> {
        Ok(Poll {
            registry: IndexMap::new(),
            pollfds: Vec::new(),
        })
    }

    pub fn add(&mut self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        self.registry.insert(fd, (token, interest));
        Ok(())
    }

    pub fn modify(&mut self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        self.registry.insert(fd, (token, interest));
        Ok(())
    }

    pub fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        self.registry.swap_remove(&fd);
        Ok(())
    }

    pub fn wait(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.pollfds.clear();
        self.pollfds.reserve(self.registry.len());

        for (&fd, (_, interest)) in &self.registry {
            self.pollfds.push(libc::pollfd {
                fd,
                events: to_poll_bits(*interest),
                revents: 0,
            });
        }

        let timeout_ms = timeout
            .map(|d| d.as_millis().min(c_int::MAX as u128) as c_int)
            .unwrap_or(-1);

        let n = loop {
            match syscall!(poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as nfds_t,
                timeout_ms
            )) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        events.inner.clear();
        if n > 0 {
            for pfd in &self.pollfds {
                if pfd.revents == 0 {
                    continue;
                }
                if let Some((token, _)) = self.registry.get(&pfd.fd) {
                    events.inner.push((*token, from_poll_bits(pfd.revents)));
                }
            }
        }

        Ok(())
    }
}

fn to_poll_bits(interest: Ready) -> libc::c_short {
    let mut bits = 0;
    if interest.is_readable() {
        bits |= POLLIN | POLLPRI;
    }
    if interest.is_writable() {
        bits |= POLLOUT;
    }
    bits as libc::c_short
}

fn from_poll_bits(revents: libc::c_short) -> Ready {
    let bits = revents as c_int;
    let mut ready = Ready::empty();
    if bits & POLLIN != 0 || bits & POLLPRI != 0 {
        ready.insert(Ready::readable());
    }
    if bits & POLLOUT != 0 {
        ready.insert(Ready::writable());
    }
    if bits & (POLLERR | POLLNVAL) != 0 {
        ready.insert(Ready::error());
    }
    if bits & (POLLHUP | POLLRDHUP) != 0 {
        ready.insert(Ready::hup());
    }
    ready
}

pub struct Events {
    inner: Vec<(Token, Ready)>,
}

impl Events {
    pub fn with_capacity(cap: usize) -> Events {
        Events {
            inner: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.inner.reserve(additional);
    }

    pub fn get(&self, idx: usize) -> Option<(Token, Ready)> {
        self.inner.get(idx).copied()
    }
}
