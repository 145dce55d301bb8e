//! Thin wrapper around `epoll_create1`/`epoll_ctl`/`epoll_wait`.
//!
//! Grounded in the teacher's `sys/epoll.rs`, trimmed to the level-triggered,
//! edge/oneshot-free subset this crate's `Poller` needs.

use std::cmp;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use libc::{c_int, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::ready::Ready;
use crate::token::Token;

use super::fd::FileDesc;

pub struct Epoll {
    fd: FileDesc,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll {
            fd: FileDesc::new(fd),
        })
    }

    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|d| cmp::min(d.as_millis(), c_int::MAX as u128) as c_int)
            .unwrap_or(-1);

        loop {
            match syscall!(epoll_wait(
                self.fd.raw(),
                events.inner.as_mut_ptr(),
                events.inner.capacity() as i32,
                timeout_ms
            )) {
                Ok(n) => {
                    unsafe { events.inner.set_len(n as usize) };
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn add(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: to_epoll_bits(interest),
            u64: token.0 as u64,
        };
        syscall!(epoll_ctl(self.fd.raw(), libc::EPOLL_CTL_ADD, fd, &mut event))?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: to_epoll_bits(interest),
            u64: token.0 as u64,
        };
        syscall!(epoll_ctl(self.fd.raw(), libc::EPOLL_CTL_MOD, fd, &mut event))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.fd.raw(), libc::EPOLL_CTL_DEL, fd, &mut event))?;
        Ok(())
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.raw()
    }
}

fn to_epoll_bits(interest: Ready) -> u32 {
    let mut bits = 0;
    if interest.is_readable() {
        bits |= EPOLLIN;
    }
    if interest.is_writable() {
        bits |= EPOLLOUT;
    }
    bits as u32
}

pub struct Events {
    inner: Vec<libc::epoll_event>,
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

    /// Returns `(token, readiness)` for the event at `idx`.
    pub fn get(&self, idx: usize) -> Option<(Token, Ready)> {
        self.inner.get(idx).map(|ev| {
            let bits = ev.events as c_int;
            let mut ready = Ready::empty();

            if bits & EPOLLIN != 0 || bits & EPOLLPRI != 0 {
                ready.insert(Ready::readable());
            }
            if bits & EPOLLOUT != 0 {
                ready.insert(Ready::writable());
            }
            if bits & EPOLLERR != 0 {
                ready.insert(Ready::error());
            }
            if bits & EPOLLRDHUP != 0 || bits & EPOLLHUP != 0 {
                ready.insert(Ready::hup());
            }

            (Token(ev.u64 as RawFd), ready)
        })
    }
}
