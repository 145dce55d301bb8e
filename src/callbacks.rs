//! Callback type aliases, matching muduo's `Callbacks.h` convention.
//!
//! Embedder-supplied callbacks are set once on `TcpServer` and invoked from
//! whichever worker loop owns a given connection, so they're `Arc<dyn Fn(..)
//! + Send + Sync>`: the closure's captured environment must be shared safely
//! across threads even though the `&TcpConnectionPtr` parameter it receives
//! points at data that never itself leaves its own loop's thread.

use std::sync::Arc;
use std::time::Instant;

use crate::buffer::Buffer;
use crate::event_loop::EventLoop;
use crate::tcp_connection::TcpConnectionPtr;

pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;

/// Run once on each worker thread right after its `EventLoop` is created,
/// before it starts polling. Mirrors `EventLoopThreadPool`'s
/// `ThreadInitCallback`.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

pub(crate) fn default_connection_callback(conn: &TcpConnectionPtr) {
    log::trace!(
        "connection callback (default): {} -> {:?}",
        crate::tcp_connection::TcpConnection::name(conn),
        crate::tcp_connection::TcpConnection::connected(conn)
    );
}

pub(crate) fn default_message_callback(_conn: &TcpConnectionPtr, buf: &mut Buffer, _when: Instant) {
    buf.retrieve_all();
}
