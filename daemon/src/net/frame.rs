//! Wire codec. A frame is a command byte, optionally followed by a
//! one-byte payload length and exactly that many payload bytes:
//!
//! ```text
//! +--------+--------+---------------------+
//! | cmd: 1 | len: 1 | payload: len bytes  |
//! +--------+--------+---------------------+
//! ```
//!
//! Bare commands (KEEP_ALIVE and the highlight pair) are a single byte.

use crate::net::{NetError, NetResult};
use flint::ClickerId;

/// Largest payload the one-byte length field can carry.
pub const MAX_PAYLOAD: usize = 255;

/// Command byte values. Stable; the clicker firmware matches on them.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum Command {
    None = 0,
    EnableHighlight = 1,
    DisableHighlight = 2,
    KeepAlive = 3,
    Key = 4,
    DeviceServerConfig = 5,
    NetworkConfig = 6,
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Command> {
        Some(match byte {
            0 => Command::None,
            1 => Command::EnableHighlight,
            2 => Command::DisableHighlight,
            3 => Command::KeepAlive,
            4 => Command::Key,
            5 => Command::DeviceServerConfig,
            6 => Command::NetworkConfig,
            _ => return None,
        })
    }

    #[inline]
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Whether frames of this command carry a length byte and payload.
    #[inline]
    pub fn carries_data(self) -> bool {
        match self {
            Command::Key | Command::DeviceServerConfig | Command::NetworkConfig => true,
            _ => false,
        }
    }
}

/// One decoded frame bound to the clicker it belongs to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    pub clicker: ClickerId,
    pub command: Command,
    pub data: Vec<u8>,
}

impl Packet {
    #[inline]
    pub fn bare(clicker: ClickerId, command: Command) -> Packet {
        Packet {
            clicker,
            command,
            data: Vec::new(),
        }
    }

    #[inline]
    pub fn with_data(clicker: ClickerId, command: Command, data: Vec<u8>) -> Packet {
        Packet {
            clicker,
            command,
            data,
        }
    }
}

/// Serializes a packet into wire bytes.
pub fn encode(packet: &Packet) -> NetResult<Vec<u8>> {
    if !packet.command.carries_data() || packet.data.is_empty() {
        return Ok(vec![packet.command.byte()]);
    }

    if packet.data.len() > MAX_PAYLOAD {
        return Err(NetError::Oversized);
    }

    let mut out = Vec::with_capacity(packet.data.len() + 2);
    out.push(packet.command.byte());
    out.push(packet.data.len() as u8);
    out.extend_from_slice(&packet.data);
    Ok(out)
}

/// Parses the bytes of a single read into a packet.
///
/// One read is assumed to hold exactly one frame; partial frames are not
/// reassembled across reads. The length byte is validated against what
/// actually arrived, and trailing bytes beyond the declared length are
/// dropped.
pub fn parse(clicker: ClickerId, bytes: &[u8]) -> NetResult<Packet> {
    let command_byte = *bytes.first().ok_or(NetError::Framing)?;
    let command = Command::from_byte(command_byte).ok_or(NetError::UnknownCommand(command_byte))?;

    if !command.carries_data() {
        return Ok(Packet::bare(clicker, command));
    }

    if bytes.len() < 2 {
        return Err(NetError::Framing);
    }

    let len = bytes[1] as usize;
    if bytes.len() < 2 + len {
        return Err(NetError::Framing);
    }

    Ok(Packet::with_data(clicker, command, bytes[2..2 + len].to_vec()))
}
