//! A multi-reactor, non-blocking TCP server library built on the "one
//! loop per thread + thread pool" pattern: a base loop accepts
//! connections and hands each one off to a worker loop from a pool, where
//! it lives (and is driven) for the rest of its life.
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! use muduo_rs::{EventLoop, MessageCallback, PortOption, TcpConnection, TcpServer};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let addr: SocketAddr = "0.0.0.0:9981".parse().unwrap();
//! let server = TcpServer::new(&event_loop, addr, "echo".to_string(), PortOption::NoReusePort).unwrap();
//!
//! let echo: MessageCallback = Arc::new(|conn, buf, _when| {
//!     let data = buf.retrieve_all_as_vec();
//!     TcpConnection::send(conn, &data);
//! });
//! server.borrow_mut().set_message_callback(echo);
//! server.borrow_mut().set_thread_num(4, None);
//!
//! TcpServer::start(&server);
//! event_loop.run();
//! ```

mod acceptor;
mod buffer;
mod callbacks;
mod channel;
mod event_loop;
mod event_loop_thread;
mod event_loop_thread_pool;
mod net;
mod poller;
mod ready;
mod sys;
mod tcp_connection;
mod tcp_server;
mod token;

pub use buffer::Buffer;
pub use callbacks::{CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback, ThreadInitCallback, WriteCompleteCallback};
pub use event_loop::{EventLoop, EventLoopHandle};
pub use net::tcp::{TcpListener, TcpStream};
pub use ready::Ready;
pub use tcp_connection::{TcpConnection, TcpConnectionPtr, TcpConnectionSender};
pub use tcp_server::{PortOption, TcpServer};
pub use token::Token;
