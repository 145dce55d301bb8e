//! `TcpConnection`: one established connection, owned by exactly one
//! worker loop for its whole lifetime.
//!
//! Grounded in `examples/original_source/TcpConnection.cc`. Two of the
//! original's bugs are fixed here rather than carried forward (tracked in
//! `DESIGN.md`): `sendInLoop`'s guard used `state_ = kDisconnected`
//! (assignment, not comparison), and its "haven't started writing yet"
//! check (`!channel_->isWriteEvent() && outputBuffer_.readableBytes()`)
//! tested the wrong buffer state, causing it to skip the direct-write fast
//! path whenever any data was already queued.
//!
//! `TcpConnectionPtr` (`Rc<RefCell<TcpConnectionInner>>`) is the type
//! callbacks receive and is only ever touched on the owning loop's thread.
//! [`TcpConnectionSender`] is the `Send`-safe handle for triggering a send
//! or shutdown from a different thread; it carries no `Rc` at all, only an
//! id and an `EventLoopHandle`, and reaches the real connection again via
//! `EventLoop::connection` once its queued task runs on the right thread.

use std::cell::RefCell;
use std::io::Write as _;
use std::net::{Shutdown, SocketAddr};
use std::rc::{Rc, Weak};

use crate::buffer::Buffer;
use crate::callbacks::{CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback};
use crate::channel::Channel;
use crate::event_loop::EventLoopHandle;
use crate::net::tcp::TcpStream;
use crate::poller::Poller;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

pub type TcpConnectionPtr = Rc<RefCell<TcpConnectionInner>>;

pub struct TcpConnectionInner {
    id: u64,
    name: String,
    handle: EventLoopHandle,
    channel: Rc<RefCell<Channel>>,
    stream: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: State,
    input_buffer: Buffer,
    output_buffer: Buffer,
    high_water_mark: usize,
    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_mark_cb: Option<HighWaterMarkCallback>,
    /// Set by `TcpServer` after construction; invoked once the connection
    /// has fully transitioned to `Disconnected` so it can drop its own
    /// reference from its connection map.
    close_cb: Option<CloseCallback>,
}

impl TcpConnectionInner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        name: String,
        handle: EventLoopHandle,
        poller: Weak<RefCell<Poller>>,
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        connection_cb: ConnectionCallback,
        message_cb: MessageCallback,
    ) -> TcpConnectionPtr {
        use std::os::unix::io::AsRawFd;
        let fd = stream.as_raw_fd();
        let channel = Channel::new(fd, poller);

        let _ = stream.set_keepalive(true);

        log::info!("TcpConnection::new [{name}] at fd={fd}");

        Rc::new(RefCell::new(TcpConnectionInner {
            id,
            name,
            handle,
            channel,
            stream,
            local_addr,
            peer_addr,
            state: State::Connecting,
            input_buffer: Buffer::new(),
            output_buffer: Buffer::new(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            connection_cb,
            message_cb,
            write_complete_cb: None,
            high_water_mark_cb: None,
            close_cb: None,
        }))
    }

    pub fn set_write_complete_callback(&mut self, cb: WriteCompleteCallback) {
        self.write_complete_cb = Some(cb);
    }

    pub fn set_high_water_mark_callback(&mut self, cb: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark_cb = Some(cb);
        self.high_water_mark = mark;
    }

    pub fn set_close_callback(&mut self, cb: CloseCallback) {
        self.close_cb = Some(cb);
    }
}

/// Namespace of associated functions operating on a `TcpConnectionPtr`.
/// Mirrors `Channel`'s `this: &Rc<RefCell<..>>` convention: establishing
/// and tearing down a connection needs to hand the channel a weak clone of
/// the connection's own `Rc`, which an ordinary `&mut self` method can't do.
pub struct TcpConnection;

impl TcpConnection {
    pub fn name(this: &TcpConnectionPtr) -> String {
        this.borrow().name.clone()
    }

    pub fn id(this: &TcpConnectionPtr) -> u64 {
        this.borrow().id
    }

    pub fn connected(this: &TcpConnectionPtr) -> bool {
        this.borrow().state == State::Connected
    }

    pub fn local_addr(this: &TcpConnectionPtr) -> SocketAddr {
        this.borrow().local_addr
    }

    pub fn peer_addr(this: &TcpConnectionPtr) -> SocketAddr {
        this.borrow().peer_addr
    }

    pub fn handle(this: &TcpConnectionPtr) -> crate::event_loop::EventLoopHandle {
        this.borrow().handle.clone()
    }

    /// A `Send`-safe handle that can trigger a send/shutdown on this
    /// connection from any thread.
    pub fn sender(this: &TcpConnectionPtr) -> TcpConnectionSender {
        let inner = this.borrow();
        TcpConnectionSender {
            id: inner.id,
            handle: inner.handle.clone(),
        }
    }

    /// Called once, from within `Acceptor`'s `new_connection` handoff,
    /// after the connection has been inserted into its owning loop's
    /// connection table. Ties the channel's callbacks to a weak reference
    /// of `this` (mirrors `Channel::tie`) and starts reading.
    pub fn connect_established(this: &TcpConnectionPtr) {
        {
            let mut inner = this.borrow_mut();
            assert_eq!(inner.state, State::Connecting);
            inner.state = State::Connected;
        }

        let channel = this.borrow().channel.clone();

        let weak = Rc::downgrade(this);
        {
            let weak = weak.clone();
            channel.borrow_mut().set_read_callback(move |now| {
                if let Some(conn) = weak.upgrade() {
                    TcpConnection::handle_read(&conn, now);
                }
            });
        }
        {
            let weak = weak.clone();
            channel.borrow_mut().set_write_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    TcpConnection::handle_write(&conn);
                }
            });
        }
        {
            let weak = weak.clone();
            channel.borrow_mut().set_close_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    TcpConnection::handle_close(&conn);
                }
            });
        }
        {
            let weak = weak.clone();
            channel.borrow_mut().set_error_callback(move || {
                if let Some(conn) = weak.upgrade() {
                    TcpConnection::handle_error(&conn);
                }
            });
        }

        Channel::enable_reading(&channel);

        let cb = this.borrow().connection_cb.clone();
        cb(this);
    }

    /// Tears the connection down: disables and removes its channel from
    /// the poller. Called by `TcpServer::remove_connection_in_loop`.
    pub fn connect_destroyed(this: &TcpConnectionPtr) {
        let (channel, was_connected) = {
            let mut inner = this.borrow_mut();
            let was_connected = inner.state == State::Connected;
            if was_connected {
                inner.state = State::Disconnected;
                Channel::disable_all(&inner.channel);
            }
            (inner.channel.clone(), was_connected)
        };

        if was_connected {
            let cb = this.borrow().connection_cb.clone();
            cb(this);
        }

        Channel::remove(&channel);
    }

    fn handle_read(this: &TcpConnectionPtr, now: std::time::Instant) {
        let fd = this.borrow().channel.borrow().fd();
        let result = this.borrow_mut().input_buffer.read_from_fd(fd);

        match result {
            Ok(0) => TcpConnection::handle_close(this),
            Ok(_n) => {
                let (message_cb, mut buf) = {
                    let mut inner = this.borrow_mut();
                    (inner.message_cb.clone(), std::mem::replace(&mut inner.input_buffer, Buffer::new()))
                };
                message_cb(this, &mut buf, now);
                this.borrow_mut().input_buffer = buf;
            }
            Err(e) => {
                log::error!("TcpConnection::handle_read [{}]: {e}", this.borrow().name);
                TcpConnection::handle_error(this);
            }
        }
    }

    fn handle_write(this: &TcpConnectionPtr) {
        let is_writing = {
            let inner = this.borrow();
            inner.channel.borrow().is_writing()
        };
        if !is_writing {
            log::trace!("TcpConnection fd={} is down, no more writing", this.borrow().channel.borrow().fd());
            return;
        }

        let write_result = {
            let inner = this.borrow();
            let fd = inner.channel.borrow().fd();
            inner.output_buffer.write_to_fd(fd)
        };

        match write_result {
            Ok(n) => {
                this.borrow_mut().output_buffer.retrieve(n);
                let (readable, channel) = {
                    let inner = this.borrow();
                    (inner.output_buffer.readable_bytes(), inner.channel.clone())
                };
                if readable == 0 {
                    Channel::disable_writing(&channel);
                    TcpConnection::queue_write_complete(this);
                    let disconnecting = this.borrow().state == State::Disconnecting;
                    if disconnecting {
                        TcpConnection::shutdown_in_loop(this);
                    }
                }
            }
            Err(e) => {
                log::error!("TcpConnection::handle_write: {e}");
            }
        }
    }

    fn handle_close(this: &TcpConnectionPtr) {
        {
            let mut inner = this.borrow_mut();
            log::info!("TcpConnection::handle_close [{}] fd={} state={:?}", inner.name, inner.channel.borrow().fd(), inner.state);
            inner.state = State::Disconnected;
        }

        let connection_cb = this.borrow().connection_cb.clone();
        connection_cb(this);

        let close_cb = this.borrow().close_cb.clone();
        if let Some(cb) = close_cb {
            cb(this);
        }
    }

    fn handle_error(this: &TcpConnectionPtr) {
        let (name, err) = {
            let inner = this.borrow();
            let err = inner.stream.take_error().ok().flatten();
            (inner.name.clone(), err)
        };
        log::error!("TcpConnection::handle_error [{name}]: {err:?}");
    }

    /// Writes `data`, or queues it if the output buffer already has bytes
    /// pending. `TcpConnectionPtr` is `Rc`-based and so can never itself
    /// reach another thread; callers on a different thread go through
    /// [`TcpConnectionSender`] instead, which reaches this same method via
    /// an id lookup once its queued task lands back on the owning loop.
    pub fn send(this: &TcpConnectionPtr, data: &[u8]) {
        debug_assert!(this.borrow().handle.is_in_loop_thread());
        if TcpConnection::connected(this) {
            TcpConnection::send_in_loop(this, data);
        }
    }

    /// The actual write. Fixes two bugs present in the original: the state
    /// guard is a comparison (`==`), not an assignment, and the "can we
    /// attempt a direct write" check looks at whether the output buffer is
    /// currently empty, not whether any bytes happen to be readable.
    fn send_in_loop(this: &TcpConnectionPtr, data: &[u8]) {
        let state = this.borrow().state;
        if state == State::Disconnected {
            log::warn!("disconnected, give up writing");
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault_error = false;

        let (is_writing, output_empty) = {
            let inner = this.borrow();
            (inner.channel.borrow().is_writing(), inner.output_buffer.readable_bytes() == 0)
        };

        if !is_writing && output_empty {
            let result = {
                let inner = this.borrow();
                (&inner.stream).write(data)
            };
            match result {
                Ok(n) => {
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        TcpConnection::queue_write_complete(this);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    log::error!("TcpConnection::send_in_loop: {e}");
                    if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        fault_error = true;
                    }
                }
            }
        }

        if !fault_error && remaining > 0 {
            let (old_len, high_water_mark, high_water_mark_cb) = {
                let inner = this.borrow();
                (inner.output_buffer.readable_bytes(), inner.high_water_mark, inner.high_water_mark_cb.clone())
            };
            if old_len + remaining >= high_water_mark && old_len < high_water_mark {
                if high_water_mark_cb.is_some() {
                    TcpConnection::queue_high_water_mark(this, old_len + remaining);
                }
            }
            let channel = {
                let mut inner = this.borrow_mut();
                inner.output_buffer.append(&data[nwrote..]);
                inner.channel.clone()
            };
            if !channel.borrow().is_writing() {
                Channel::enable_writing(&channel);
            }
        }
    }

    /// Defers `write_complete_cb` to the next iteration of this loop,
    /// without capturing the non-`Send` `TcpConnectionPtr` itself: the
    /// queued task carries only the connection id and looks it up again
    /// in the owning `EventLoop`'s table once it runs.
    fn queue_write_complete(this: &TcpConnectionPtr) {
        let (id, handle, cb) = {
            let inner = this.borrow();
            (inner.id, inner.handle.clone(), inner.write_complete_cb.clone())
        };
        let Some(cb) = cb else { return };
        handle.queue_in_loop(move |event_loop| {
            if let Some(conn) = event_loop.connection(id) {
                cb(&conn);
            }
        });
    }

    fn queue_high_water_mark(this: &TcpConnectionPtr, total: usize) {
        let (id, handle, cb) = {
            let inner = this.borrow();
            (inner.id, inner.handle.clone(), inner.high_water_mark_cb.clone())
        };
        let Some(cb) = cb else { return };
        handle.queue_in_loop(move |event_loop| {
            if let Some(conn) = event_loop.connection(id) {
                cb(&conn, total);
            }
        });
    }

    pub fn shutdown(this: &TcpConnectionPtr) {
        debug_assert!(this.borrow().handle.is_in_loop_thread());
        if this.borrow().state == State::Connected {
            this.borrow_mut().state = State::Disconnecting;
            TcpConnection::shutdown_in_loop(this);
        }
    }

    fn shutdown_in_loop(this: &TcpConnectionPtr) {
        let inner = this.borrow();
        if !inner.channel.borrow().is_writing() {
            if let Err(e) = inner.stream.shutdown(Shutdown::Write) {
                log::warn!("TcpConnection::shutdown_in_loop [{}]: {e}", inner.name);
            }
        }
    }
}

/// A `Send + Sync` handle that can `send`/`shutdown` a connection from any
/// thread, reaching the real `Rc`-based connection by id lookup once its
/// queued task runs on the owning loop.
#[derive(Clone)]
pub struct TcpConnectionSender {
    id: u64,
    handle: EventLoopHandle,
}

impl TcpConnectionSender {
    pub fn send(&self, data: Vec<u8>) {
        let id = self.id;
        self.handle.queue_in_loop(move |event_loop| {
            if let Some(conn) = event_loop.connection(id) {
                TcpConnection::send_in_loop(&conn, &data);
            }
        });
    }

    pub fn shutdown(&self) {
        let id = self.id;
        self.handle.queue_in_loop(move |event_loop| {
            if let Some(conn) = event_loop.connection(id) {
                TcpConnection::shutdown(&conn);
            }
        });
    }
}
