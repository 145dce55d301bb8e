use std::os::unix::io::RawFd;

/// Identifies a registered `Channel` to the `Poller`.
///
/// Unlike a generic slot-map token, a `Token` here is always the raw file
/// descriptor itself: a `Channel`'s identity is the pair (owner loop, fd),
/// and fds are never reused while a `Channel` is registered for them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub RawFd);

impl From<RawFd> for Token {
    #[inline]
    fn from(fd: RawFd) -> Token {
        Token(fd)
    }
}

impl From<Token> for RawFd {
    #[inline]
    fn from(token: Token) -> RawFd {
        token.0
    }
}
