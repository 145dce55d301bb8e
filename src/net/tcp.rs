//! Non-blocking TCP wrappers used by `Acceptor` and `TcpConnection`.
//!
//! Grounded in the teacher's `net/tcp.rs`; `TcpListener` is built on
//! `sys::socket::Socket` directly (rather than `std::net::TcpListener`) so
//! `Acceptor` can set `SO_REUSEADDR`/`SO_REUSEPORT` before `bind(2)`, which
//! `std` gives no hook for.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use crate::sys::socket::Socket;

#[derive(Debug)]
pub struct TcpStream {
    inner: std::net::TcpStream,
}

impl TcpStream {
    pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
        let inner = std::net::TcpStream::connect(addr)?;
        TcpStream::new(inner)
    }

    pub fn new(inner: std::net::TcpStream) -> io::Result<TcpStream> {
        inner.set_nonblocking(true)?;
        Ok(TcpStream { inner })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    pub fn set_keepalive(&self, on: bool) -> io::Result<()> {
        crate::sys::socket::setsockopt(
            self.inner.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            on as libc::c_int,
        )
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Read for &TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Write for &TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.inner).flush()
    }
}

impl FromRawFd for TcpStream {
    unsafe fn from_raw_fd(fd: RawFd) -> TcpStream {
        TcpStream {
            inner: std::net::TcpStream::from_raw_fd(fd),
        }
    }
}

impl IntoRawFd for TcpStream {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw_fd()
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// A non-blocking, `SO_REUSEADDR`/`SO_REUSEPORT`-aware listening socket.
pub struct TcpListener {
    inner: Socket,
}

impl TcpListener {
    /// Binds and starts listening, as `Acceptor`'s constructor does in the
    /// original (`Socket::bindAddress` + `Socket::listen`), with a fixed
    /// backlog of 1024 matching common production muduo deployments.
    pub fn bind(addr: SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
        let sock = Socket::new_stream(&addr)?;
        sock.set_reuseaddr(true)?;
        if reuse_port {
            sock.set_reuseport(true)?;
        }
        sock.bind(&addr)?;
        sock.set_nonblocking(true)?;
        sock.listen(1024)?;
        Ok(TcpListener { inner: sock })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts one pending connection, if any (`EAGAIN`/`EWOULDBLOCK`
    /// surfaces as a normal `io::Error` of that kind; `Acceptor` checks for
    /// it explicitly rather than treating it as fatal).
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (fd, addr) = self.inner.accept()?;
        let stream = unsafe { TcpStream::from_raw_fd(fd) };
        Ok((stream, addr))
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
