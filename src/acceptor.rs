//! `Acceptor`: runs on the base loop, turns inbound connections into
//! `(fd, peer_addr)` pairs for `TcpServer` to hand off to a worker loop.
//!
//! Grounded in `examples/original_source/Acceptor.cc`/`.h`. The idle fd
//! trick for `EMFILE` is also from the original muduo `Acceptor`: keep one
//! spare fd open; when `accept4` fails with `EMFILE`, close the spare,
//! `accept` (and immediately drop) the pending connection to clear it from
//! the listen backlog, then reopen the spare.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::rc::{Rc, Weak};

use crate::channel::Channel;
use crate::net::tcp::TcpListener;
use crate::poller::Poller;
use crate::sys::fd::FileDesc;

pub type NewConnectionCallback = Box<dyn FnMut(RawFd, SocketAddr)>;

pub struct Acceptor {
    listener: TcpListener,
    channel: Rc<RefCell<Channel>>,
    listening: bool,
    /// A reserved, otherwise-unused fd; closed and reopened around an
    /// `EMFILE` to let `Acceptor` drain (and drop) one pending connection
    /// rather than spin hot on a listening socket it can no longer accept
    /// from.
    idle_fd: Option<FileDesc>,
    new_connection_cb: Option<NewConnectionCallback>,
}

impl Acceptor {
    pub fn new(poller: Weak<RefCell<Poller>>, addr: SocketAddr, reuse_port: bool) -> io::Result<Rc<RefCell<Acceptor>>> {
        let listener = TcpListener::bind(addr, reuse_port)?;
        let fd = listener.as_raw_fd();
        let channel = Channel::new(fd, poller);
        let idle_fd = FileDesc::new(open_dev_null()?);

        let acceptor = Rc::new(RefCell::new(Acceptor {
            listener,
            channel,
            listening: false,
            idle_fd: Some(idle_fd),
            new_connection_cb: None,
        }));

        {
            let weak = Rc::downgrade(&acceptor);
            let channel = acceptor.borrow().channel.clone();
            channel.borrow_mut().set_read_callback(move |_now| {
                if let Some(acceptor) = weak.upgrade() {
                    Acceptor::handle_read(&acceptor);
                }
            });
        }

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(this: &Rc<RefCell<Acceptor>>, cb: impl FnMut(RawFd, SocketAddr) + 'static) {
        this.borrow_mut().new_connection_cb = Some(Box::new(cb));
    }

    pub fn listening(&self) -> bool {
        self.listening
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn listen(this: &Rc<RefCell<Acceptor>>) {
        this.borrow_mut().listening = true;
        let channel = this.borrow().channel.clone();
        Channel::enable_reading(&channel);
    }

    fn handle_read(this: &Rc<RefCell<Acceptor>>) {
        loop {
            let accepted = this.borrow().listener.accept();
            match accepted {
                Ok((stream, addr)) => {
                    let mut inner = this.borrow_mut();
                    if let Some(cb) = inner.new_connection_cb.as_mut() {
                        // The stream wrapper is intentionally unwound back
                        // to a raw fd (not dropped) so `TcpConnection` can
                        // adopt the same fd on whichever worker loop is
                        // chosen for it.
                        let raw = stream.into_raw_fd();
                        cb(raw, addr);
                    } else {
                        log::warn!("acceptor: no new_connection_callback set, dropping connection");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("acceptor: accept failed: {e}");
                    if e.raw_os_error() == Some(libc::EMFILE) {
                        Acceptor::handle_emfile(this);
                    }
                    break;
                }
            }
        }
    }

    /// Frees the reserved idle fd, accepts (and immediately drops) one
    /// pending connection to relieve backlog pressure, then reopens the
    /// reserve.
    fn handle_emfile(this: &Rc<RefCell<Acceptor>>) {
        let mut inner = this.borrow_mut();
        inner.idle_fd = None;
        let _ = inner.listener.accept();
        match open_dev_null() {
            Ok(fd) => inner.idle_fd = Some(FileDesc::new(fd)),
            Err(e) => log::error!("acceptor: failed to reopen idle fd: {e}"),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        Channel::disable_all(&self.channel);
        Channel::remove(&self.channel);
    }
}

fn open_dev_null() -> io::Result<RawFd> {
    crate::sys::syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC
    ))
}
