//! `Channel`: the fd-plus-callbacks unit the `Poller` dispatches events to.
//!
//! Grounded in `examples/original_source/Channel.cc`/`.h`. A `Channel` is
//! always reached through an `Rc<RefCell<Channel>>` so that both its owner
//! (an `Acceptor` or `TcpConnection`) and the `Poller`'s registry can hold a
//! reference to the same instance; the `Poller` is referenced back only
//! weakly, to avoid a reference cycle (`Poller` -> `Channel` -> `Poller`).

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::poller::Poller;
use crate::ready::Ready;

/// Tracks whether a `Channel` is registered with its `Poller`.
///
/// Mirrors the original's `kNew`/`kAdded`/`kDeleted` constants.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelIndex {
    New,
    Added,
    Deleted,
}

type ReadCallback = Box<dyn FnMut(Instant)>;
type EventCallback = Box<dyn FnMut()>;

pub struct Channel {
    fd: RawFd,
    interest: Ready,
    revents: Ready,
    index: ChannelIndex,
    poller: Weak<RefCell<Poller>>,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

impl Channel {
    pub fn new(fd: RawFd, poller: Weak<RefCell<Poller>>) -> Rc<RefCell<Channel>> {
        Rc::new(RefCell::new(Channel {
            fd,
            interest: Ready::empty(),
            revents: Ready::empty(),
            index: ChannelIndex::New,
            poller,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Ready {
        self.interest
    }

    pub fn revents(&self) -> Ready {
        self.revents
    }

    pub fn index(&self) -> ChannelIndex {
        self.index
    }

    pub fn set_index(&mut self, index: ChannelIndex) {
        self.index = index;
    }

    pub fn set_revents(&mut self, revents: Ready) {
        self.revents = revents;
    }

    pub fn is_writing(&self) -> bool {
        self.interest.is_writable()
    }

    pub fn is_reading(&self) -> bool {
        self.interest.is_readable()
    }

    pub fn set_read_callback(&mut self, cb: impl FnMut(Instant) + 'static) {
        self.read_cb = Some(Box::new(cb));
    }

    pub fn set_write_callback(&mut self, cb: impl FnMut() + 'static) {
        self.write_cb = Some(Box::new(cb));
    }

    pub fn set_close_callback(&mut self, cb: impl FnMut() + 'static) {
        self.close_cb = Some(Box::new(cb));
    }

    pub fn set_error_callback(&mut self, cb: impl FnMut() + 'static) {
        self.error_cb = Some(Box::new(cb));
    }

    pub fn enable_reading(this: &Rc<RefCell<Channel>>) {
        this.borrow_mut().interest.insert(Ready::readable());
        Channel::update(this);
    }

    pub fn disable_reading(this: &Rc<RefCell<Channel>>) {
        this.borrow_mut().interest.remove(Ready::readable());
        Channel::update(this);
    }

    pub fn enable_writing(this: &Rc<RefCell<Channel>>) {
        this.borrow_mut().interest.insert(Ready::writable());
        Channel::update(this);
    }

    pub fn disable_writing(this: &Rc<RefCell<Channel>>) {
        this.borrow_mut().interest.remove(Ready::writable());
        Channel::update(this);
    }

    pub fn disable_all(this: &Rc<RefCell<Channel>>) {
        this.borrow_mut().interest = Ready::empty();
        Channel::update(this);
    }

    /// Pushes the current interest set to the owning `Poller`.
    fn update(this: &Rc<RefCell<Channel>>) {
        let (fd, index, interest, poller) = {
            let ch = this.borrow();
            (ch.fd, ch.index, ch.interest, ch.poller.clone())
        };

        let Some(poller) = poller.upgrade() else {
            return;
        };

        match poller.borrow_mut().update_channel(fd, index, interest, this.clone()) {
            Ok(new_index) => this.borrow_mut().index = new_index,
            Err(e) => log::error!("channel({fd}): poller registration failed: {e}"),
        }
    }

    /// Deregisters this channel from its `Poller` entirely. Called from
    /// `TcpConnection::connect_destroyed`/`Acceptor`'s drop path.
    pub fn remove(this: &Rc<RefCell<Channel>>) {
        let (fd, index, poller) = {
            let ch = this.borrow();
            (ch.fd, ch.index, ch.poller.clone())
        };

        let Some(poller) = poller.upgrade() else {
            return;
        };

        match poller.borrow_mut().remove_channel(fd, index) {
            Ok(new_index) => this.borrow_mut().index = new_index,
            Err(e) => log::error!("channel({fd}): poller removal failed: {e}"),
        }
    }

    /// Dispatches the currently recorded `revents` to the installed
    /// callbacks, in HUP/ERROR/READ/WRITE order (mirrors
    /// `Channel::handleEventWithGuard`).
    ///
    /// Callbacks are taken out of `self` before being invoked and restored
    /// afterwards, so a callback that itself calls `enable_writing` or
    /// similar on this same channel doesn't conflict with an outstanding
    /// `RefCell` borrow.
    pub fn handle_event(this: &Rc<RefCell<Channel>>, now: Instant) {
        let (revents, mut read_cb, mut write_cb, mut close_cb, mut error_cb) = {
            let mut ch = this.borrow_mut();
            (
                ch.revents,
                ch.read_cb.take(),
                ch.write_cb.take(),
                ch.close_cb.take(),
                ch.error_cb.take(),
            )
        };

        if revents.is_hup() && !revents.is_readable() {
            if let Some(cb) = close_cb.as_mut() {
                cb();
            }
        }
        if revents.is_error() {
            if let Some(cb) = error_cb.as_mut() {
                cb();
            }
        }
        if revents.is_readable() {
            if let Some(cb) = read_cb.as_mut() {
                cb(now);
            }
        }
        if revents.is_writable() {
            if let Some(cb) = write_cb.as_mut() {
                cb();
            }
        }

        let mut ch = this.borrow_mut();
        ch.read_cb = read_cb;
        ch.write_cb = write_cb;
        ch.close_cb = close_cb;
        ch.error_cb = error_cb;
    }
}
