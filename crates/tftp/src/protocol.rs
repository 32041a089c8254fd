//! TFTP Protocol Implementation
//!
//! This module contains the wire-level part of TFTP: opcodes, error codes,
//! transfer modes, the [`Packet`] type and its encoder/decoder.
//!
//! # TFTP Protocol Overview
//!
//! TFTP (Trivial File Transfer Protocol) is defined in RFC 1350. Every packet
//! starts with a two byte big-endian opcode:
//!
//! | Opcode | Packet | Fields |
//! |---|---|---|
//! | 1 | RRQ   | filename, 0, mode, 0 |
//! | 2 | WRQ   | filename, 0, mode, 0 |
//! | 3 | DATA  | block (2 bytes), payload (0-512 bytes) |
//! | 4 | ACK   | block (2 bytes) |
//! | 5 | ERROR | code (2 bytes), message, 0 |
//!
//! Encoding never fails. Decoding is strict: anything that does not match the
//! layout above is reported as a [`DecodeError`] so that the transfer session
//! can answer it with an "illegal TFTP operation" error.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Maximum payload carried by a single DATA packet.
pub const BLOCK_SIZE: usize = 512;

/// Size of the DATA/ACK header (opcode + block number).
pub const HEADER_SIZE: usize = 4;

/// Largest legal TFTP datagram (a full DATA packet).
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + BLOCK_SIZE;

/// TFTP Protocol Opcodes
///
/// These opcodes identify the type of TFTP packet being sent or received.
/// Each opcode corresponds to a specific packet format as defined in RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    ReadRequest = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    WriteRequest = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// Contains a 2-byte block number and up to 512 bytes of data. A payload
    /// shorter than 512 bytes marks the last packet of a transfer.
    ///
    /// Packet format: | Opcode | Block# | Data |
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// Acknowledges receipt of a data packet. ACK with block number 0
    /// acknowledges a write request.
    ///
    /// Packet format: | Opcode | Block# |
    Acknowledgment = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Packet format: | Opcode | ErrorCode | ErrMsg | 0 |
    Error = 5,
}

impl TftpOpcode {
    /// Convert a u16 value to a TftpOpcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::from_u16(1), Some(TftpOpcode::ReadRequest));
    /// assert_eq!(TftpOpcode::from_u16(6), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    /// Convert the opcode to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::WriteRequest.name(), "WRQ");
    /// assert_eq!(TftpOpcode::Acknowledgment.name(), "ACK");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
        }
    }

    /// Whether this opcode starts a transfer (RRQ or WRQ)
    pub fn is_request(self) -> bool {
        matches!(self, Self::ReadRequest | Self::WriteRequest)
    }
}

impl From<TftpOpcode> for u16 {
    fn from(opcode: TftpOpcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP Error Codes
///
/// Standard error codes as defined in RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpErrorCode {
    /// Error code 0: Not defined, see error message (if any)
    NotDefined = 0,

    /// Error code 1: File not found
    FileNotFound = 1,

    /// Error code 2: Access violation
    ///
    /// Permission denied on the server, or a filename resolving outside the
    /// server's root directory.
    AccessViolation = 2,

    /// Error code 3: Disk full or allocation exceeded
    DiskFull = 3,

    /// Error code 4: Illegal TFTP operation
    ///
    /// Malformed packets, unexpected opcodes and out-of-sequence blocks.
    IllegalOperation = 4,

    /// Error code 5: Unknown transfer ID
    ///
    /// Packet received from a port (or host) that is not the bound peer of
    /// the transfer. Does not terminate the transfer.
    UnknownTransferId = 5,

    /// Error code 6: File already exists
    FileAlreadyExists = 6,

    /// Error code 7: No such user
    NoSuchUser = 7,
}

impl TftpErrorCode {
    /// Convert a u16 value to a TftpErrorCode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::from_u16(5), Some(TftpErrorCode::UnknownTransferId));
    /// assert_eq!(TftpErrorCode::from_u16(8), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            _ => None,
        }
    }

    /// Convert the error code to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the default error message for this error code
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::FileNotFound.default_message(), "File not found");
    /// assert_eq!(TftpErrorCode::DiskFull.default_message(), "Disk full or allocation exceeded");
    /// ```
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
        }
    }
}

impl From<TftpErrorCode> for u16 {
    fn from(error_code: TftpErrorCode) -> Self {
        error_code.as_u16()
    }
}

impl fmt::Display for TftpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// TFTP Transfer Modes
///
/// Transfer modes define how data is processed during transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransferMode {
    /// Binary mode (octet)
    ///
    /// Data is transferred as-is without any character set conversion.
    ///
    /// Mode string: "octet"
    #[default]
    Octet,

    /// Text mode (netascii)
    ///
    /// Line feeds are sent as CR-LF and every carriage return as CR-NUL. See
    /// [`convert_to_netascii`] and [`NetasciiDecoder`].
    ///
    /// Mode string: "netascii"
    NetAscii,
}

impl TransferMode {
    /// Parse a transfer mode from a string
    ///
    /// The comparison is case-insensitive.
    ///
    /// # Examples
    /// ```
    /// use tftp::TransferMode;
    ///
    /// assert_eq!("octet".parse::<TransferMode>(), Ok(TransferMode::Octet));
    /// assert_eq!("NETASCII".parse::<TransferMode>(), Ok(TransferMode::NetAscii));
    /// assert!("mail".parse::<TransferMode>().is_err());
    /// ```
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Self::Octet),
            "netascii" => Some(Self::NetAscii),
            _ => None,
        }
    }

    /// Get the string representation of the transfer mode
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::NetAscii => "netascii",
        }
    }
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or_else(|| format!("Unsupported transfer mode: {}", s))
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// TFTP Request (RRQ/WRQ) body
///
/// The mode is kept as the raw string found on the wire: validation happens in
/// the server, which must answer a bad mode with ERROR(4) rather than fail to
/// decode it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpRequest {
    /// Requested filename
    pub filename: String,
    /// Transfer mode string
    pub mode: String,
}

impl TftpRequest {
    /// Create a new request body
    ///
    /// # Examples
    /// ```
    /// use tftp::{TftpRequest, TransferMode};
    ///
    /// let request = TftpRequest::new("boot.img", TransferMode::Octet);
    /// assert_eq!(request.filename, "boot.img");
    /// assert_eq!(request.transfer_mode(), Some(TransferMode::Octet));
    /// ```
    pub fn new(filename: impl Into<String>, mode: TransferMode) -> Self {
        Self {
            filename: filename.into(),
            mode: mode.as_str().to_string(),
        }
    }

    /// The parsed transfer mode, if the mode string is recognized
    pub fn transfer_mode(&self) -> Option<TransferMode> {
        TransferMode::from_str_opt(&self.mode)
    }
}

/// TFTP Data packet representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpData {
    /// Block number (1-indexed, wraps 65535 -> 0)
    pub block: u16,
    /// Data payload
    pub data: Vec<u8>,
}

impl TftpData {
    /// Create a new data packet
    pub fn new(block: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            block,
            data: data.into(),
        }
    }

    /// Check if this is the last block of a transfer
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpData;
    ///
    /// assert!(TftpData::new(3, vec![0; 276]).is_last_block());
    /// assert!(TftpData::new(4, Vec::new()).is_last_block());
    /// assert!(!TftpData::new(1, vec![0; 512]).is_last_block());
    /// ```
    pub fn is_last_block(&self) -> bool {
        self.data.len() < BLOCK_SIZE
    }
}

/// TFTP Error packet representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpError {
    /// Error code
    pub code: TftpErrorCode,
    /// Human-readable error message
    pub message: String,
}

impl TftpError {
    /// Create a new error packet with a custom message
    pub fn new(code: TftpErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create a new error packet with the default message for the error code
    pub fn with_default_message(code: TftpErrorCode) -> Self {
        Self::new(code, code.default_message())
    }
}

impl fmt::Display for TftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Errors produced while decoding a datagram
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

/// A decoded TFTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest(TftpRequest),
    WriteRequest(TftpRequest),
    Data(TftpData),
    Ack(u16),
    Error(TftpError),
}

impl Packet {
    /// The opcode of this packet
    pub fn opcode(&self) -> TftpOpcode {
        match self {
            Self::ReadRequest(_) => TftpOpcode::ReadRequest,
            Self::WriteRequest(_) => TftpOpcode::WriteRequest,
            Self::Data(_) => TftpOpcode::Data,
            Self::Ack(_) => TftpOpcode::Acknowledgment,
            Self::Error(_) => TftpOpcode::Error,
        }
    }

    /// Shorthand for an ERROR packet carrying the code's default message
    pub fn error(code: TftpErrorCode) -> Self {
        Self::Error(TftpError::with_default_message(code))
    }

    /// Encode the packet into its wire representation
    ///
    /// Payload length is not checked; callers keep DATA payloads within
    /// [`BLOCK_SIZE`].
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::ReadRequest(req) => build_request(TftpOpcode::ReadRequest, &req.filename, &req.mode),
            Self::WriteRequest(req) => build_request(TftpOpcode::WriteRequest, &req.filename, &req.mode),
            Self::Data(data) => build_data(data.block, &data.data),
            Self::Ack(block) => build_ack(*block),
            Self::Error(err) => build_error(err.code.as_u16(), &err.message),
        }
    }

    /// Decode a received datagram
    ///
    /// # Examples
    /// ```
    /// use tftp::{DecodeError, Packet};
    ///
    /// assert_eq!(Packet::decode(&[0, 4, 0, 7]), Ok(Packet::Ack(7)));
    /// assert_eq!(Packet::decode(&[0, 9, 0, 7]), Err(DecodeError::UnknownOpcode(9)));
    /// assert!(matches!(Packet::decode(&[0, 3, 0]), Err(DecodeError::Malformed(_))));
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let raw = get_opcode(buf).ok_or(DecodeError::Malformed("packet too short"))?;
        let opcode = TftpOpcode::from_u16(raw).ok_or(DecodeError::UnknownOpcode(raw))?;

        match opcode {
            TftpOpcode::ReadRequest => parse_request(buf).map(Self::ReadRequest),
            TftpOpcode::WriteRequest => parse_request(buf).map(Self::WriteRequest),
            TftpOpcode::Data => {
                let block = get_block_number(buf).ok_or(DecodeError::Malformed("DATA too short"))?;
                if buf.len() > MAX_PACKET_SIZE {
                    return Err(DecodeError::Malformed("DATA payload exceeds 512 bytes"));
                }
                Ok(Self::Data(TftpData::new(block, &buf[HEADER_SIZE..])))
            }
            TftpOpcode::Acknowledgment => {
                let block = get_block_number(buf).ok_or(DecodeError::Malformed("ACK too short"))?;
                if buf.len() != HEADER_SIZE {
                    return Err(DecodeError::Malformed("ACK has trailing bytes"));
                }
                Ok(Self::Ack(block))
            }
            TftpOpcode::Error => parse_error(buf).map(Self::Error),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadRequest(req) | Self::WriteRequest(req) => {
                write!(f, "{} '{}' ({})", self.opcode(), req.filename, req.mode)
            }
            Self::Data(data) => write!(f, "DATA #{} ({} bytes)", data.block, data.data.len()),
            Self::Ack(block) => write!(f, "ACK #{}", block),
            Self::Error(err) => write!(f, "ERROR {}", err),
        }
    }
}

/// Find the next null byte in a buffer starting from a given position
pub fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf.get(start..)?.iter().position(|&b| b == 0).map(|pos| start + pos)
}

fn parse_request(buf: &[u8]) -> Result<TftpRequest, DecodeError> {
    let fname_end = find_zero(buf, 2).ok_or(DecodeError::Malformed("filename not terminated"))?;
    let filename = std::str::from_utf8(&buf[2..fname_end])
        .map_err(|_| DecodeError::Malformed("filename is not valid UTF-8"))?
        .to_string();

    let mode_start = fname_end + 1;
    let mode_end = find_zero(buf, mode_start).ok_or(DecodeError::Malformed("mode not terminated"))?;
    let mode = std::str::from_utf8(&buf[mode_start..mode_end])
        .map_err(|_| DecodeError::Malformed("mode is not valid UTF-8"))?
        .to_string();

    if mode_end + 1 != buf.len() {
        return Err(DecodeError::Malformed("trailing bytes after mode"));
    }

    Ok(TftpRequest { filename, mode })
}

fn parse_error(buf: &[u8]) -> Result<TftpError, DecodeError> {
    if buf.len() < HEADER_SIZE {
        return Err(DecodeError::Malformed("ERROR too short"));
    }

    // Only the low byte of the code is significant.
    let code = TftpErrorCode::from_u16(u16::from(buf[3])).unwrap_or(TftpErrorCode::NotDefined);
    let msg_end = find_zero(buf, HEADER_SIZE).ok_or(DecodeError::Malformed("error message not terminated"))?;
    let message = String::from_utf8_lossy(&buf[HEADER_SIZE..msg_end]).into_owned();

    Ok(TftpError { code, message })
}

fn build_request(opcode: TftpOpcode, filename: &str, mode: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(2 + filename.len() + mode.len() + 2);
    v.extend_from_slice(&opcode.as_u16().to_be_bytes());
    v.extend_from_slice(filename.as_bytes());
    v.push(0);
    v.extend_from_slice(mode.as_bytes());
    v.push(0);
    v
}

/// Build a TFTP Data packet
pub fn build_data(block: u16, data: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(HEADER_SIZE + data.len());
    v.extend_from_slice(&TftpOpcode::Data.as_u16().to_be_bytes());
    v.extend_from_slice(&block.to_be_bytes());
    v.extend_from_slice(data);
    v
}

/// Build a TFTP ACK packet
pub fn build_ack(block: u16) -> Vec<u8> {
    let mut v = Vec::with_capacity(HEADER_SIZE);
    v.extend_from_slice(&TftpOpcode::Acknowledgment.as_u16().to_be_bytes());
    v.extend_from_slice(&block.to_be_bytes());
    v
}

/// Build a TFTP Error packet
pub fn build_error(code: u16, msg: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(HEADER_SIZE + msg.len() + 1);
    v.extend_from_slice(&TftpOpcode::Error.as_u16().to_be_bytes());
    v.extend_from_slice(&code.to_be_bytes());
    v.extend_from_slice(msg.as_bytes());
    v.push(0);
    v
}

/// Get the opcode from a TFTP packet
pub fn get_opcode(buf: &[u8]) -> Option<u16> {
    if buf.len() >= 2 {
        Some(u16::from_be_bytes([buf[0], buf[1]]))
    } else {
        None
    }
}

/// Get the TFTP opcode enum from a packet buffer
pub fn get_tftp_opcode(buf: &[u8]) -> Option<TftpOpcode> {
    get_opcode(buf).and_then(TftpOpcode::from_u16)
}

/// Read bytes 2-3 of a packet as a big-endian block number
pub fn get_block_number(buf: &[u8]) -> Option<u16> {
    if buf.len() >= HEADER_SIZE {
        Some(u16::from_be_bytes([buf[2], buf[3]]))
    } else {
        None
    }
}

/// Whether `received` lies behind `expected` in the wrapping block sequence
///
/// Uses half of the 16-bit space as the window, so block 65535 is behind
/// block 0 and block 0 is ahead of block 65535.
///
/// # Examples
/// ```
/// use tftp::is_stale_block;
///
/// assert!(is_stale_block(4, 5));
/// assert!(is_stale_block(65535, 0));
/// assert!(!is_stale_block(5, 5));
/// assert!(!is_stale_block(0, 65535));
/// ```
pub fn is_stale_block(received: u16, expected: u16) -> bool {
    let behind = expected.wrapping_sub(received);
    behind != 0 && behind < 0x8000
}

/// Convert file data from binary to netascii format
///
/// The local newline is LF, so every LF goes out as CR-LF and every CR in
/// the data, including one that precedes an LF, as CR-NUL.
pub fn convert_to_netascii(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len() + data.len() / 8);

    for &byte in data {
        match byte {
            b'\r' => result.extend_from_slice(b"\r\0"),
            b'\n' => result.extend_from_slice(b"\r\n"),
            byte => result.push(byte),
        }
    }

    result
}

/// Incremental netascii-to-binary decoder
///
/// DATA blocks split the stream at arbitrary points, so a CR that ends one
/// block is held back until the first byte of the next block is seen.
#[derive(Debug, Default)]
pub struct NetasciiDecoder {
    pending_cr: bool,
}

impl NetasciiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one chunk, returning the bytes that are final so far
    pub fn feed(&mut self, data: &[u8]) -> Vec<u8> {
        let mut result = Vec::with_capacity(data.len() + 1);

        for &byte in data {
            if self.pending_cr {
                self.pending_cr = false;
                match byte {
                    // CR-LF -> LF
                    b'\n' => result.push(b'\n'),
                    // CR-NULL -> CR
                    b'\0' => result.push(b'\r'),
                    b'\r' => {
                        result.push(b'\r');
                        self.pending_cr = true;
                    }
                    other => {
                        result.push(b'\r');
                        result.push(other);
                    }
                }
            } else if byte == b'\r' {
                self.pending_cr = true;
            } else {
                result.push(byte);
            }
        }

        result
    }

    /// Flush a trailing CR left at the very end of the stream
    pub fn finish(&mut self) -> Vec<u8> {
        if std::mem::take(&mut self.pending_cr) {
            vec![b'\r']
        } else {
            Vec::new()
        }
    }
}

/// Convert a complete netascii buffer to binary
pub fn convert_from_netascii(data: &[u8]) -> Vec<u8> {
    let mut decoder = NetasciiDecoder::new();
    let mut result = decoder.feed(data);
    result.extend(decoder.finish());
    result
}
