//! `TcpServer`: owns the `Acceptor` on a base loop, a pool of worker
//! loops, and the set of currently-live connection names.
//!
//! Grounded in `examples/original_source/TcpServer.h`. The original keeps
//! its `ConnectionMap` (name -> `TcpConnectionPtr`) directly on the base
//! loop's thread, crossing back to it from a connection's own io-thread via
//! `loop_->queueInLoop` whenever a connection closes. In Rust that map
//! can't hold the connection's `Rc` (that's thread-confined to the worker
//! loop that owns it), so `TcpServer` only keeps `(id, EventLoopHandle)`
//! bookkeeping behind an `Arc<Mutex<_>>` shared with every connection's
//! close callback; the connection itself is torn down synchronously, on
//! its own thread, the moment `handle_close` fires — no round trip back to
//! the base loop is needed for that part.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::acceptor::Acceptor;
use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    ThreadInitCallback, WriteCompleteCallback,
};
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::net::tcp::TcpStream;
use crate::tcp_connection::{TcpConnection, TcpConnectionInner, TcpConnectionPtr};

/// Whether the listening socket sets `SO_REUSEPORT`. Mirrors the
/// original's `kNoReusePort`/`kReusePort` enum.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortOption {
    NoReusePort,
    ReusePort,
}

type ConnectionTable = Arc<Mutex<HashMap<String, (u64, EventLoopHandle)>>>;

pub struct TcpServer {
    name: String,
    ip_port: String,
    acceptor: Rc<std::cell::RefCell<Acceptor>>,
    thread_pool: EventLoopThreadPool,
    next_conn_id: AtomicU64,
    connections: ConnectionTable,
    started: bool,

    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_mark_cb: Option<(HighWaterMarkCallback, usize)>,
}

impl TcpServer {
    pub fn new(base_loop: &EventLoop, listen_addr: SocketAddr, name: String, option: PortOption) -> std::io::Result<Rc<std::cell::RefCell<TcpServer>>> {
        let ip_port = listen_addr.to_string();
        let reuse_port = option == PortOption::ReusePort;
        let acceptor = Acceptor::new(base_loop.poller_handle(), listen_addr, reuse_port)?;
        let thread_pool = EventLoopThreadPool::new(base_loop.handle(), name.clone());

        let server = Rc::new(std::cell::RefCell::new(TcpServer {
            name,
            ip_port,
            acceptor,
            thread_pool,
            next_conn_id: AtomicU64::new(1),
            connections: Arc::new(Mutex::new(HashMap::new())),
            started: false,
            connection_cb: Arc::new(default_connection_callback),
            message_cb: Arc::new(default_message_callback),
            write_complete_cb: None,
            high_water_mark_cb: None,
        }));

        TcpServer::bind_new_connection_handler(&server);
        Ok(server)
    }

    pub fn set_connection_callback(&mut self, cb: ConnectionCallback) {
        self.connection_cb = cb;
    }

    pub fn set_message_callback(&mut self, cb: MessageCallback) {
        self.message_cb = cb;
    }

    pub fn set_write_complete_callback(&mut self, cb: WriteCompleteCallback) {
        self.write_complete_cb = Some(cb);
    }

    pub fn set_high_water_mark_callback(&mut self, cb: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark_cb = Some((cb, mark));
    }

    /// Spawns `num_threads` worker loops. Must be called before `start()`;
    /// `num_threads == 0` keeps every connection on the base loop.
    pub fn set_thread_num(&mut self, num_threads: usize, thread_init_cb: Option<ThreadInitCallback>) {
        self.thread_pool.start(num_threads, thread_init_cb);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    pub fn num_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Starts listening. Idempotent, matching `TcpServer::start`'s
    /// `std::atomic_int started_` guard.
    pub fn start(this: &Rc<std::cell::RefCell<TcpServer>>) {
        let mut server = this.borrow_mut();
        if server.started {
            return;
        }
        server.started = true;
        Acceptor::listen(&server.acceptor);
    }

    fn bind_new_connection_handler(this: &Rc<std::cell::RefCell<TcpServer>>) {
        let weak = Rc::downgrade(this);
        let acceptor = this.borrow().acceptor.clone();
        Acceptor::set_new_connection_callback(&acceptor, move |fd, peer_addr| {
            if let Some(this) = weak.upgrade() {
                TcpServer::new_connection(&this, fd, peer_addr);
            } else {
                unsafe {
                    libc::close(fd);
                }
            }
        });
    }

    /// Picks the next worker loop round-robin and queues construction of
    /// the `TcpConnection` onto it. Always called on the base loop's
    /// thread (from `Acceptor`'s read callback), so borrowing `this`
    /// directly here is sound even though `Rc` can't itself cross threads.
    fn new_connection(this: &Rc<std::cell::RefCell<TcpServer>>, fd: RawFd, peer_addr: SocketAddr) {
        let conn_id;
        let name;
        let worker_handle;
        let connection_cb;
        let message_cb;
        let write_complete_cb;
        let high_water_mark_cb;
        let connections;
        {
            let server = this.borrow();
            conn_id = server.next_conn_id.fetch_add(1, Ordering::Relaxed);
            name = format!("{}-{}#{conn_id}", server.name, server.ip_port);
            worker_handle = server.thread_pool.next_loop();
            connection_cb = server.connection_cb.clone();
            message_cb = server.message_cb.clone();
            write_complete_cb = server.write_complete_cb.clone();
            high_water_mark_cb = server.high_water_mark_cb.clone();
            connections = server.connections.clone();
        }

        log::info!("TcpServer::new_connection [{}] - new connection [{name}] from {peer_addr}", this.borrow().name);

        connections.lock().unwrap().insert(name.clone(), (conn_id, worker_handle.clone()));

        let close_table = connections.clone();
        worker_handle.clone().queue_in_loop(move |event_loop| {
            let stream = unsafe { TcpStream::from_raw_fd(fd) };
            let local_addr = stream.local_addr().unwrap_or(peer_addr);

            let conn = TcpConnectionInner::new(
                conn_id,
                name.clone(),
                event_loop.handle(),
                event_loop.poller_handle(),
                stream,
                local_addr,
                peer_addr,
                connection_cb,
                message_cb,
            );

            {
                let mut inner = conn.borrow_mut();
                if let Some(cb) = write_complete_cb {
                    inner.set_write_complete_callback(cb);
                }
                if let Some((cb, mark)) = high_water_mark_cb {
                    inner.set_high_water_mark_callback(cb, mark);
                }
                let close_table = close_table.clone();
                inner.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
                    let conn_name = TcpConnection::name(conn);
                    let id = TcpConnection::id(conn);
                    close_table.lock().unwrap().remove(&conn_name);
                    TcpConnection::connect_destroyed(conn);

                    let handle = TcpConnection::handle(conn);
                    handle.queue_in_loop(move |event_loop| {
                        event_loop.unregister_connection(id);
                    });
                }));
            }

            event_loop.register_connection(conn_id, conn.clone());
            TcpConnection::connect_established(&conn);
        });
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        log::info!("TcpServer::drop [{}]", self.name);
    }
}
