use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use super::fd::FileDesc;

const EFD_CLOEXEC: i32 = libc::EFD_CLOEXEC;
const EFD_NONBLOCK: i32 = libc::EFD_NONBLOCK;

/// The `EventLoop`'s cross-thread wakeup descriptor.
///
/// Writing any non-zero `u64` bumps the kernel counter and makes the fd
/// readable; reading drains it back to zero. See eventfd(2).
#[derive(Debug)]
pub struct EventFd {
    inner: FileDesc,
}

impl EventFd {
    pub fn new() -> io::Result<EventFd> {
        let fd = syscall!(eventfd(0, EFD_CLOEXEC | EFD_NONBLOCK))?;
        Ok(EventFd {
            inner: FileDesc::new(fd),
        })
    }

    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.inner).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf = val.to_ne_bytes();
        (&self.inner).write_all(&buf)?;
        Ok(())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::EventFd;

    #[test]
    fn write_and_read() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(123).unwrap();
        let count = eventfd.read().unwrap();
        assert_eq!(123, count);
    }

    #[test]
    fn write_accumulates() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(1).unwrap();
        eventfd.write(2).unwrap();
        assert_eq!(3, eventfd.read().unwrap());
    }
}
