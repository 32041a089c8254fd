//! Packet alterations
//!
//! An [`Alteration`] is a one-shot instruction bound to a direction and a
//! packet target. When the relay sees the matching packet it applies the
//! byte-level mutations in a fixed order (byte patch, block number, opcode,
//! mode/filename, size) and then the delivery effects (source override,
//! delay, drop, duplicate).

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tftp::{TftpOpcode, find_zero, get_block_number, get_tftp_opcode};

/// Largest payload a UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Which way a packet travels through the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientToServer => "c2s",
            Self::ServerToClient => "s2c",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToServer => write!(f, "client->server"),
            Self::ServerToClient => write!(f, "server->client"),
        }
    }
}

impl FromStr for Direction {
    type Err = ParseAlterationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c2s" | "client" => Ok(Self::ClientToServer),
            "s2c" | "server" => Ok(Self::ServerToClient),
            _ => Err(ParseAlterationError::Direction(s.to_string())),
        }
    }
}

/// The packet an alteration fires on
///
/// `Request` sorts before every block number, so request alterations are
/// always at the head of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PacketTarget {
    /// The initial RRQ/WRQ (written `req` or `-1`)
    Request,
    /// The DATA or ACK packet carrying this block number
    Block(u16),
}

impl PacketTarget {
    /// Target identity of a raw datagram
    ///
    /// ERROR packets and undecodable datagrams have no target and are never
    /// altered.
    pub fn of(packet: &[u8]) -> Option<Self> {
        let opcode = get_tftp_opcode(packet)?;
        if opcode.is_request() {
            return Some(Self::Request);
        }
        match opcode {
            TftpOpcode::Data | TftpOpcode::Acknowledgment => get_block_number(packet).map(Self::Block),
            _ => None,
        }
    }
}

impl fmt::Display for PacketTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "req"),
            Self::Block(block) => write!(f, "{}", block),
        }
    }
}

impl FromStr for PacketTarget {
    type Err = ParseAlterationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "req" | "request" | "-1" => Ok(Self::Request),
            _ => s
                .parse()
                .map(Self::Block)
                .map_err(|_| ParseAlterationError::Target(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseAlterationError {
    #[error("expected <direction>:<target>:<op>[,<op>...], got '{0}'")]
    Format(String),
    #[error("unknown direction '{0}' (use c2s or s2c)")]
    Direction(String),
    #[error("invalid target '{0}' (use req, -1 or a block number)")]
    Target(String),
    #[error("unknown operation '{0}'")]
    Operation(String),
    #[error("invalid value '{value}' for {op}")]
    Value { op: &'static str, value: String },
}

/// A scheduled, one-shot packet alteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alteration {
    pub direction: Direction,
    pub target: PacketTarget,
    /// Overwrite the byte at an index
    pub byte_patch: Option<(usize, u8)>,
    /// Rewrite bytes 2-3 (block number)
    pub block: Option<u16>,
    /// Rewrite bytes 0-1 (opcode)
    pub opcode: Option<u16>,
    pub mode: Option<String>,
    pub filename: Option<String>,
    /// Truncate or zero-extend to this length
    pub resize: Option<usize>,
    /// Send from a transient socket bound to this port
    pub tid: Option<u16>,
    /// Send from a transient socket bound to this address
    pub source_address: Option<IpAddr>,
    pub delay: Option<Duration>,
    /// Send a second copy after this gap
    pub duplicate: Option<Duration>,
    pub drop: bool,
}

impl Alteration {
    /// An alteration that matches but changes nothing yet
    pub fn new(direction: Direction, target: PacketTarget) -> Self {
        Self {
            direction,
            target,
            byte_patch: None,
            block: None,
            opcode: None,
            mode: None,
            filename: None,
            resize: None,
            tid: None,
            source_address: None,
            delay: None,
            duplicate: None,
            drop: false,
        }
    }

    pub fn patch_byte(mut self, index: usize, value: u8) -> Self {
        self.byte_patch = Some((index, value));
        self
    }

    pub fn rewrite_block(mut self, block: u16) -> Self {
        self.block = Some(block);
        self
    }

    pub fn rewrite_opcode(mut self, opcode: u16) -> Self {
        self.opcode = Some(opcode);
        self
    }

    pub fn rewrite_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn rewrite_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn resize(mut self, len: usize) -> Self {
        self.resize = Some(len);
        self
    }

    pub fn send_from_tid(mut self, port: u16) -> Self {
        self.tid = Some(port);
        self
    }

    pub fn send_from_address(mut self, address: IpAddr) -> Self {
        self.source_address = Some(address);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn duplicate(mut self, gap: Duration) -> Self {
        self.duplicate = Some(gap);
        self
    }

    pub fn drop_packet(mut self) -> Self {
        self.drop = true;
        self
    }

    /// Whether this alteration fires on a packet travelling `direction`
    pub fn matches(&self, direction: Direction, target: Option<PacketTarget>) -> bool {
        self.direction == direction && target == Some(self.target)
    }

    /// Apply the byte-level mutations to a copy of `packet`
    ///
    /// No validity checks: the result may well be an invalid TFTP packet.
    /// Writes past the end zero-extend the packet, but never beyond
    /// [`MAX_DATAGRAM_SIZE`]; a byte patch past that limit is skipped.
    pub fn apply(&self, packet: &[u8]) -> Vec<u8> {
        let mut bytes = packet.to_vec();

        if let Some((index, value)) = self.byte_patch {
            if index < MAX_DATAGRAM_SIZE {
                ensure_len(&mut bytes, index + 1);
                bytes[index] = value;
            }
        }
        if let Some(block) = self.block {
            ensure_len(&mut bytes, 4);
            bytes[2..4].copy_from_slice(&block.to_be_bytes());
        }
        if let Some(opcode) = self.opcode {
            ensure_len(&mut bytes, 2);
            bytes[0..2].copy_from_slice(&opcode.to_be_bytes());
        }
        if let Some(mode) = &self.mode {
            bytes = replace_mode(&bytes, mode.as_bytes());
        }
        if let Some(filename) = &self.filename {
            bytes = replace_filename(&bytes, filename.as_bytes());
        }
        if let Some(len) = self.resize {
            bytes.resize(len.min(MAX_DATAGRAM_SIZE), 0);
        }

        bytes
    }

    fn operations(&self) -> Vec<String> {
        let mut ops = Vec::new();
        if let Some((index, value)) = self.byte_patch {
            ops.push(format!("byte={}/{}", index, value));
        }
        if let Some(block) = self.block {
            ops.push(format!("block={}", block));
        }
        if let Some(opcode) = self.opcode {
            ops.push(format!("opcode={}", opcode));
        }
        if let Some(mode) = &self.mode {
            ops.push(format!("mode={}", mode));
        }
        if let Some(filename) = &self.filename {
            ops.push(format!("filename={}", filename));
        }
        if let Some(len) = self.resize {
            ops.push(format!("size={}", len));
        }
        if let Some(port) = self.tid {
            ops.push(format!("tid={}", port));
        }
        if let Some(address) = self.source_address {
            ops.push(format!("addr={}", address));
        }
        if let Some(delay) = self.delay {
            ops.push(format!("delay={}", delay.as_millis()));
        }
        if let Some(gap) = self.duplicate {
            ops.push(format!("duplicate={}", gap.as_millis()));
        }
        if self.drop {
            ops.push("drop".to_string());
        }
        ops
    }
}

impl fmt::Display for Alteration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.direction.as_str(),
            self.target,
            self.operations().join(",")
        )
    }
}

/// Parse `<direction>:<target>:<op>[,<op>...]`
///
/// ```
/// use std::time::Duration;
/// use errsim::{Alteration, Direction, PacketTarget};
///
/// let alteration: Alteration = "s2c:3:delay=500,duplicate=100".parse().unwrap();
/// assert_eq!(alteration.direction, Direction::ServerToClient);
/// assert_eq!(alteration.target, PacketTarget::Block(3));
/// assert_eq!(alteration.delay, Some(Duration::from_millis(500)));
/// assert_eq!(alteration.duplicate, Some(Duration::from_millis(100)));
/// ```
impl FromStr for Alteration {
    type Err = ParseAlterationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(direction), Some(target), Some(ops)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ParseAlterationError::Format(s.to_string()));
        };
        if ops.trim().is_empty() {
            return Err(ParseAlterationError::Format(s.to_string()));
        }

        let mut alteration = Alteration::new(direction.trim().parse()?, target.trim().parse()?);
        for op in ops.split(',').map(str::trim) {
            let (name, value) = op.split_once('=').unwrap_or((op, ""));
            alteration = match name {
                "drop" => alteration.drop_packet(),
                "delay" => alteration.delay(Duration::from_millis(parse_value("delay", value)?)),
                "duplicate" => alteration.duplicate(Duration::from_millis(parse_value("duplicate", value)?)),
                "block" => alteration.rewrite_block(parse_value("block", value)?),
                "opcode" => alteration.rewrite_opcode(parse_value("opcode", value)?),
                "size" => alteration.resize(parse_bounded("size", value)?),
                "tid" => alteration.send_from_tid(parse_value("tid", value)?),
                "addr" => alteration.send_from_address(parse_value("addr", value)?),
                "mode" => alteration.rewrite_mode(value),
                "filename" => alteration.rewrite_filename(value),
                "byte" => {
                    let invalid = || ParseAlterationError::Value {
                        op: "byte",
                        value: value.to_string(),
                    };
                    let (index, byte) = value.split_once('/').ok_or_else(invalid)?;
                    let index = index
                        .parse()
                        .ok()
                        .filter(|&index: &usize| index < MAX_DATAGRAM_SIZE)
                        .ok_or_else(invalid)?;
                    let byte = byte.parse().map_err(|_| invalid())?;
                    alteration.patch_byte(index, byte)
                }
                _ => return Err(ParseAlterationError::Operation(op.to_string())),
            };
        }

        Ok(alteration)
    }
}

fn parse_value<T: FromStr>(op: &'static str, value: &str) -> Result<T, ParseAlterationError> {
    value.parse().map_err(|_| ParseAlterationError::Value {
        op,
        value: value.to_string(),
    })
}

/// A length or offset that fits in one datagram
fn parse_bounded(op: &'static str, value: &str) -> Result<usize, ParseAlterationError> {
    let len: usize = parse_value(op, value)?;
    if len > MAX_DATAGRAM_SIZE {
        return Err(ParseAlterationError::Value {
            op,
            value: value.to_string(),
        });
    }
    Ok(len)
}

fn ensure_len(bytes: &mut Vec<u8>, len: usize) {
    if bytes.len() < len {
        bytes.resize(len, 0);
    }
}

/// Split a request body into (filename, rest after the filename terminator)
fn split_filename(bytes: &[u8]) -> (&[u8], Option<&[u8]>) {
    let body = bytes.get(2..).unwrap_or_default();
    match find_zero(bytes, 2) {
        Some(end) => (&bytes[2..end], Some(&bytes[end + 1..])),
        None => (body, None),
    }
}

/// Keep opcode and filename, replace the mode and drop anything after it
fn replace_mode(bytes: &[u8], mode: &[u8]) -> Vec<u8> {
    let (filename, _) = split_filename(bytes);
    let mut out = header(bytes);
    out.extend_from_slice(filename);
    out.push(0);
    out.extend_from_slice(mode);
    out.push(0);
    out
}

/// Replace the filename, keeping whatever followed its terminator
fn replace_filename(bytes: &[u8], filename: &[u8]) -> Vec<u8> {
    let (_, rest) = split_filename(bytes);
    let mut out = header(bytes);
    out.extend_from_slice(filename);
    out.push(0);
    if let Some(rest) = rest {
        out.extend_from_slice(rest);
    }
    out
}

fn header(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.get(..2).unwrap_or(bytes).to_vec();
    ensure_len(&mut out, 2);
    out
}
