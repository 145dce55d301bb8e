//! `Poller`: the system-demultiplexer wrapper with its fd->Channel registry.
//!
//! Grounded in `examples/original_source/EPollPoller.cc`/`Poller.h`/
//! `DefaultPoller.cc`. The backend is chosen once, at construction, by
//! inspecting `MUDUO_USE_POLL` (spec's literal env var name).

use std::cell::RefCell;
use std::env;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::channel::{Channel, ChannelIndex};
use crate::ready::Ready;
use crate::sys::{epoll, poll};
use crate::token::Token;

const INIT_EVENT_CAPACITY: usize = 16;

enum Selector {
    Epoll(epoll::Epoll, epoll::Events),
    Poll(poll::Poll, poll::Events),
}

/// Owns the system selector and the set of `Channel`s currently registered
/// with it. Lives on a single `EventLoop`'s thread for its entire lifetime;
/// it is reachable as `Rc<RefCell<Poller>>` so `Channel`s can reach back into
/// it (weakly) to push interest changes.
pub struct Poller {
    selector: Selector,
    channels: IndexMap<RawFd, Rc<RefCell<Channel>>>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let use_poll = env::var_os("MUDUO_USE_POLL").is_some();

        let selector = if use_poll {
            Selector::Poll(poll::Poll::new()?, poll::Events::with_capacity(INIT_EVENT_CAPACITY))
        } else {
            Selector::Epoll(epoll::Epoll::new()?, epoll::Events::with_capacity(INIT_EVENT_CAPACITY))
        };

        Ok(Poller {
            selector,
            channels: IndexMap::new(),
        })
    }

    /// Polls for readiness, appending ready `Channel`s (with `revents`
    /// already recorded on them) into `active`. Returns the poll-return
    /// timestamp, matching `EPollPoller::poll`'s `Timestamp` return value.
    pub fn poll(&mut self, timeout: Duration, active: &mut Vec<Rc<RefCell<Channel>>>) -> io::Result<Instant> {
        active.clear();

        let mut ready_list: Vec<(Token, Ready)> = Vec::new();

        match &mut self.selector {
            Selector::Epoll(epoll, events) => {
                epoll.wait(events, Some(timeout))?;
                for i in 0..events.len() {
                    if let Some(event) = events.get(i) {
                        ready_list.push(event);
                    }
                }
                if events.len() == events.capacity() {
                    events.reserve(events.capacity());
                }
            }
            Selector::Poll(poll, events) => {
                poll.wait(events, Some(timeout))?;
                for i in 0..events.len() {
                    if let Some(event) = events.get(i) {
                        ready_list.push(event);
                    }
                }
                if events.len() == events.capacity() {
                    events.reserve(events.capacity());
                }
            }
        }

        let now = Instant::now();
        for (token, ready) in ready_list {
            if let Some(channel) = self.channels.get(&token.0) {
                channel.borrow_mut().set_revents(ready);
                active.push(channel.clone());
            }
        }

        Ok(now)
    }

    /// Adds, modifies, or removes a `Channel`'s registration depending on
    /// its current index and new interest set. Returns the new index.
    pub fn update_channel(
        &mut self,
        fd: RawFd,
        index: ChannelIndex,
        interest: Ready,
        channel: Rc<RefCell<Channel>>,
    ) -> io::Result<ChannelIndex> {
        match index {
            ChannelIndex::New | ChannelIndex::Deleted => {
                if interest.is_empty() {
                    return Ok(index);
                }
                self.selector_add(fd, interest)?;
                self.channels.insert(fd, channel);
                Ok(ChannelIndex::Added)
            }
            ChannelIndex::Added => {
                if interest.is_empty() {
                    if let Err(e) = self.selector_delete(fd) {
                        log::warn!("poller: delete({fd}) failed: {e}");
                    }
                    self.channels.swap_remove(&fd);
                    Ok(ChannelIndex::Deleted)
                } else {
                    self.selector_modify(fd, interest)?;
                    Ok(ChannelIndex::Added)
                }
            }
        }
    }

    /// Whether `fd` currently has a `Channel` registered with this poller.
    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    /// Fully deregisters a `Channel`. Delete errors are logged and swallowed
    /// (matching `Poller::removeChannel`'s invariants in spec.md §4.A).
    pub fn remove_channel(&mut self, fd: RawFd, index: ChannelIndex) -> io::Result<ChannelIndex> {
        if index == ChannelIndex::Added {
            if let Err(e) = self.selector_delete(fd) {
                log::warn!("poller: delete({fd}) on remove failed: {e}");
            }
        }
        self.channels.swap_remove(&fd);
        Ok(ChannelIndex::New)
    }

    fn selector_add(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        match &mut self.selector {
            Selector::Epoll(epoll, _) => epoll.add(fd, Token(fd), interest),
            Selector::Poll(poll, _) => poll.add(fd, Token(fd), interest),
        }
    }

    fn selector_modify(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        match &mut self.selector {
            Selector::Epoll(epoll, _) => epoll.modify(fd, Token(fd), interest),
            Selector::Poll(poll, _) => poll.modify(fd, Token(fd), interest),
        }
    }

    fn selector_delete(&mut self, fd: RawFd) -> io::Result<()> {
        match &mut self.selector {
            Selector::Epoll(epoll, _) => epoll.delete(fd),
            Selector::Poll(poll, _) => poll.delete(fd),
        }
    }
}
