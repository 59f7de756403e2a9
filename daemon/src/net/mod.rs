//! Clicker-facing networking: the wire codec and the TCP hub.

pub mod endpoint;
pub mod frame;

use std::io;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    /// Payload exceeds the one-byte length field. Programmer bug.
    Oversized,
    /// A read did not contain a complete frame.
    Framing,
    /// Unrecognized command byte.
    UnknownCommand(u8),
    /// The listening socket could not be opened.
    Bind(io::ErrorKind),
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(err: io::Error) -> Self {
        NetError::Io(err.kind())
    }
}
