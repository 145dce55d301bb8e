//! Raw socket construction and option helpers.
//!
//! Grounded in the teacher's `setsockopt`/`getsockopt`/`sockaddr_to_addr`
//! helpers and the original `Socket.cc`'s `createNonblockingOrDie` /
//! `setReuseAddr` / `setReusePort` / `setKeepAlive` / `setTcpNoDelay`.

use std::io::{self, Error, ErrorKind};
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{c_int, c_void, sockaddr, sockaddr_storage, socklen_t};

use super::fd::FileDesc;

pub fn setsockopt<T>(fd: RawFd, level: c_int, opt: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        fd,
        level,
        opt,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(fd: RawFd, level: c_int, opt: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        fd,
        level,
        opt,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

fn sockaddr_to_addr(storage: &sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let addr: libc::sockaddr_in =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = u32::from_be(addr.sin_addr.s_addr);
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::new(
                std::net::Ipv4Addr::from(ip).into(),
                port,
            ))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let addr: libc::sockaddr_in6 =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::new(
                std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr).into(),
                port,
            ))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid address family")),
    }
}

fn addr_to_sockaddr(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    unsafe {
        let mut storage: sockaddr_storage = mem::zeroed();
        match addr {
            SocketAddr::V4(a) => {
                let sin = &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in);
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = a.port().to_be();
                sin.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
                (storage, mem::size_of::<libc::sockaddr_in>() as socklen_t)
            }
            SocketAddr::V6(a) => {
                let sin6 = &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6);
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = a.port().to_be();
                sin6.sin6_addr.s6_addr = a.ip().octets();
                (storage, mem::size_of::<libc::sockaddr_in6>() as socklen_t)
            }
        }
    }
}

/// An owned, non-blocking socket file descriptor.
///
/// This is the listening-socket type `Acceptor` builds directly (instead of
/// going through `std::net::TcpListener`), because `std`'s constructor gives
/// no hook to set `SO_REUSEPORT` before `bind(2)`.
#[derive(Debug)]
pub struct Socket(FileDesc);

impl Socket {
    pub fn new_stream(addr: &SocketAddr) -> io::Result<Socket> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };

        let fd = match syscall!(socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)) {
            Ok(fd) => fd,
            Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => {
                let fd = syscall!(socket(family, libc::SOCK_STREAM, 0))?;
                let fd = FileDesc::new(fd);
                fd.set_cloexec()?;
                return Ok(Socket(fd));
            }
            Err(e) => return Err(e),
        };

        Ok(Socket(FileDesc::new(fd)))
    }

    pub fn set_reuseaddr(&self, on: bool) -> io::Result<()> {
        setsockopt(self.0.raw(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on as c_int)
    }

    pub fn set_reuseport(&self, on: bool) -> io::Result<()> {
        setsockopt(self.0.raw(), libc::SOL_SOCKET, libc::SO_REUSEPORT, on as c_int)
    }

    pub fn set_keepalive(&self, on: bool) -> io::Result<()> {
        setsockopt(self.0.raw(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as c_int)
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        setsockopt(self.0.raw(), libc::IPPROTO_TCP, libc::TCP_NODELAY, on as c_int)
    }

    pub fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        let mut flag = on as c_int;
        syscall!(ioctl(self.0.raw(), libc::FIONBIO, &mut flag))?;
        Ok(())
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_sockaddr(addr);
        syscall!(bind(self.0.raw(), &storage as *const _ as *const sockaddr, len))?;
        Ok(())
    }

    pub fn listen(&self, backlog: c_int) -> io::Result<()> {
        syscall!(listen(self.0.raw(), backlog))?;
        Ok(())
    }

    /// Accepts a connection, returning the new fd and its peer address.
    ///
    /// The `sockaddr_storage`/`socklen_t` pair is always zero-initialized
    /// before the call, so there is no uninitialized-`len` hazard.
    pub fn accept(&self) -> io::Result<(RawFd, SocketAddr)> {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        let fd = loop {
            match syscall!(accept4(
                self.0.raw(),
                &mut storage as *mut _ as *mut sockaddr,
                &mut len,
                libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK
            )) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                other => break other?,
            }
        };

        let peer = sockaddr_to_addr(&storage, len as usize)?;
        Ok((fd, peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getsockname(
            self.0.raw(),
            &mut storage as *mut _ as *mut sockaddr,
            &mut len
        ))?;
        sockaddr_to_addr(&storage, len as usize)
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self.0.raw(), libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.raw()
    }
}
