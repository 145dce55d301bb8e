//! `Buffer`: the growable read/write byte buffer used by `TcpConnection`.
//!
//! Grounded in `examples/original_source/Buffer.cc`/`.h`. Layout is
//! `| prependable | readable | writable |`, same as the original, so a
//! prefix (e.g. a length header) can be prepended without a copy as long as
//! room remains in the prependable region.

use std::io;
use std::os::unix::io::RawFd;

pub const CHEAP_PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;

/// A `read(2)`-oriented growable buffer, mirroring muduo's `Buffer`.
pub struct Buffer {
    buf: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0u8; CHEAP_PREPEND + initial_size],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_index..self.write_index]
    }

    /// Finds the first occurrence of `\r\n` in the readable region, used for
    /// line-oriented protocols layered on top of `TcpConnection`.
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    pub fn retrieve(&mut self, len: usize) {
        let len = len.min(self.readable_bytes());
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Consumes and returns the entire readable region as an owned `Vec`.
    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let result = self.peek().to_vec();
        self.retrieve_all();
        result
    }

    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let result = self.buf[self.read_index..self.read_index + len].to_vec();
        self.retrieve(len);
        result
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.write_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Prepends `data` into the reserved prependable region. Panics if there
    /// isn't enough room, matching the original's precondition (callers only
    /// ever prepend fixed-size headers smaller than `CHEAP_PREPEND`).
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.read_index -= data.len();
        let start = self.read_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.write_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = self.read_index + readable;
        }
    }

    /// Reads from `fd` directly into the buffer, using a secondary
    /// stack-allocated `extrabuf` plus `readv(2)` so a single read can fill
    /// the buffer's existing writable space and still drain the socket when
    /// there's more data than that, without over-allocating up front.
    ///
    /// Returns the number of bytes read (0 on a clean EOF), matching
    /// `read(2)`'s convention rather than muduo's out-parameter `savedErrno`.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.write_index..].as_mut_ptr().cast(),
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr().cast(),
                iov_len: extrabuf.len(),
            },
        ];

        let n = crate::sys::syscall!(readv(fd, iov.as_mut_ptr(), iov.len() as libc::c_int))? as usize;

        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }

        Ok(n)
    }

    /// Writes the readable region to `fd` with a single `write(2)`, without
    /// retrieving it — the caller is responsible for calling `retrieve` with
    /// however many bytes actually went out, matching `read_from_fd`'s
    /// symmetry (`TcpConnection` is the one that owns the retrieve policy).
    pub fn write_to_fd(&self, fd: RawFd) -> io::Result<usize> {
        let data = self.peek();
        let n = crate::sys::syscall!(write(fd, data.as_ptr().cast(), data.len()))? as usize;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_retrieve() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.peek(), b"hello");
        buf.retrieve(3);
        assert_eq!(buf.peek(), b"lo");
        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut buf = Buffer::with_capacity(4);
        let data = vec![7u8; 100];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), 100);
        assert_eq!(buf.peek(), data.as_slice());
    }

    #[test]
    fn prepend_header() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&4u32.to_be_bytes());
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(&buf.peek()[..4], &4u32.to_be_bytes());
    }

    #[test]
    fn reclaims_space_by_shifting_instead_of_growing() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(&[1u8; 16]);
        buf.retrieve(16);
        let cap_before = buf.buf.len();
        buf.append(&[2u8; 10]);
        assert_eq!(buf.buf.len(), cap_before);
        assert_eq!(buf.readable_bytes(), 10);
    }

    #[test]
    fn find_crlf_locates_delimiter() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        let pos = buf.find_crlf().unwrap();
        assert_eq!(&buf.peek()[..pos], b"GET / HTTP/1.1");
    }
}
