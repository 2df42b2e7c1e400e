//! TFTP wire codec.
//!
//! Encoding and decoding of the six TFTP packet types defined by RFC 1350
//! and RFC 2347 (OACK). These are pure functions over byte buffers; no I/O
//! happens here, and [`Packet::from_bytes`] is the only place untrusted wire
//! input is interpreted.
//!
//! Packet layouts:
//!
//! | Opcode | Name  | Layout                                             |
//! |-------:|-------|----------------------------------------------------|
//! | 1      | RRQ   | filename `0` mode `0` (option `0` value `0`)*      |
//! | 2      | WRQ   | same as RRQ                                        |
//! | 3      | DATA  | block# (2 bytes) payload                           |
//! | 4      | ACK   | block# (2 bytes)                                   |
//! | 5      | ERROR | code (2 bytes) message `0`                         |
//! | 6      | OACK  | (option `0` value `0`)*                            |
//!
//! All integers are big-endian. Mode and option names compare
//! case-insensitively.

use std::error;
use std::fmt;
use std::str::FromStr;

/// TFTP protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Read Request (RRQ) - Opcode 1
    ReadRequest = 1,
    /// Write Request (WRQ) - Opcode 2
    WriteRequest = 2,
    /// Data Packet (DATA) - Opcode 3
    Data = 3,
    /// Acknowledgment (ACK) - Opcode 4
    Acknowledgment = 4,
    /// Error Packet (ERROR) - Opcode 5
    Error = 5,
    /// Option Acknowledgment (OACK) - Opcode 6, RFC 2347
    OptionAck = 6,
}

impl Opcode {
    /// Convert a u16 value to an Opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::packet::Opcode;
    ///
    /// assert_eq!(Opcode::from_u16(1), Some(Opcode::ReadRequest));
    /// assert_eq!(Opcode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            6 => Some(Self::OptionAck),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
            Self::OptionAck => "OACK",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP error codes carried in ERROR packets.
///
/// Codes 0 through 7 are from RFC 1350; code 8 is the option negotiation
/// failure code from RFC 2347.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Error code 0: Not defined, see error message.
    NotDefined = 0,
    /// Error code 1: File not found.
    FileNotFound = 1,
    /// Error code 2: Access violation.
    AccessViolation = 2,
    /// Error code 3: Disk full or allocation exceeded.
    DiskFull = 3,
    /// Error code 4: Illegal TFTP operation.
    IllegalOperation = 4,
    /// Error code 5: Unknown transfer ID.
    ///
    /// Sent to a peer whose address does not match the locked transfer ID;
    /// the only error that does not terminate the transfer.
    UnknownTransferId = 5,
    /// Error code 6: File already exists.
    FileAlreadyExists = 6,
    /// Error code 7: No such user.
    NoSuchUser = 7,
    /// Error code 8: Option negotiation failed (RFC 2347).
    OptionNegotiation = 8,
}

impl ErrorCode {
    /// Convert a wire value to an ErrorCode. Codes outside the known range
    /// map to [`ErrorCode::NotDefined`]; the message carries the detail.
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::FileNotFound,
            2 => Self::AccessViolation,
            3 => Self::DiskFull,
            4 => Self::IllegalOperation,
            5 => Self::UnknownTransferId,
            6 => Self::FileAlreadyExists,
            7 => Self::NoSuchUser,
            8 => Self::OptionNegotiation,
            _ => Self::NotDefined,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the default error message for this error code
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
            Self::OptionNegotiation => "Option negotiation failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// TFTP transfer modes.
///
/// Both modes carry payload as opaque octets in this implementation; the
/// netascii line-ending translation of RFC 1350 is not performed. `mail`
/// is obsolete and rejected at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    /// Binary mode, mode string "octet".
    Octet,
    /// Text mode, mode string "netascii".
    Netascii,
}

impl TransferMode {
    /// Parse a transfer mode from a string, case-insensitively.
    ///
    /// # Examples
    /// ```
    /// use tftp::packet::TransferMode;
    ///
    /// assert_eq!(TransferMode::from_str_opt("octet"), Some(TransferMode::Octet));
    /// assert_eq!(TransferMode::from_str_opt("NETASCII"), Some(TransferMode::Netascii));
    /// assert_eq!(TransferMode::from_str_opt("mail"), None);
    /// ```
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Self::Octet),
            "netascii" => Some(Self::Netascii),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::Netascii => "netascii",
        }
    }
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or_else(|| format!("unsupported transfer mode: {}", s))
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Body shared by RRQ and WRQ packets.
///
/// Options are kept as the raw name/value string pairs in request order;
/// recognition and numeric parsing of the three negotiated options happens
/// in [`crate::options`]. Encoding preserves the pair order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub filename: String,
    pub mode: TransferMode,
    pub options: Vec<(String, String)>,
}

/// A decoded TFTP packet, one variant per opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq(Request),
    Wrq(Request),
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
    Oack { options: Vec<(String, String)> },
}

/// Reasons a byte buffer fails to decode as a TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Shorter than the minimum for its opcode (4 bytes, 2 for OACK).
    Truncated,
    /// Opcode outside 1..=6.
    UnknownOpcode(u16),
    /// A filename, mode, or option string is missing its NUL terminator.
    Unterminated,
    /// The option strings do not come in name/value pairs.
    MalformedOptions,
    /// The mode string is not "netascii" or "octet".
    InvalidMode(String),
    /// A string field is not valid UTF-8.
    BadString,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "packet too short"),
            Self::UnknownOpcode(op) => write!(f, "unknown opcode {}", op),
            Self::Unterminated => write!(f, "string field not NUL-terminated"),
            Self::MalformedOptions => write!(f, "odd number of option strings"),
            Self::InvalidMode(mode) => write!(f, "invalid transfer mode \"{}\"", mode),
            Self::BadString => write!(f, "string field is not valid UTF-8"),
        }
    }
}

impl error::Error for DecodeError {}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Rrq(_) => Opcode::ReadRequest,
            Self::Wrq(_) => Opcode::WriteRequest,
            Self::Data { .. } => Opcode::Data,
            Self::Ack { .. } => Opcode::Acknowledgment,
            Self::Error { .. } => Opcode::Error,
            Self::Oack { .. } => Opcode::OptionAck,
        }
    }

    /// Create an ERROR packet carrying the code's default message.
    pub fn error(code: ErrorCode) -> Self {
        Self::Error {
            code,
            message: code.default_message().to_string(),
        }
    }

    /// Encode the packet into its wire representation. Total; every packet
    /// value has a byte form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4);
        buf.extend_from_slice(&self.opcode().as_u16().to_be_bytes());

        match self {
            Self::Rrq(request) | Self::Wrq(request) => {
                buf.extend_from_slice(request.filename.as_bytes());
                buf.push(0);
                buf.extend_from_slice(request.mode.as_str().as_bytes());
                buf.push(0);
                push_options(&mut buf, &request.options);
            }
            Self::Data { block, payload } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(payload);
            }
            Self::Ack { block } => {
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Self::Error { code, message } => {
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
            }
            Self::Oack { options } => {
                push_options(&mut buf, options);
            }
        }

        buf
    }

    /// Decode a packet from untrusted wire input.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::Truncated);
        }

        let raw_opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode = Opcode::from_u16(raw_opcode).ok_or(DecodeError::UnknownOpcode(raw_opcode))?;

        // OACK may carry an empty option list; everything else needs at
        // least a block number, error code, or filename byte plus NUL.
        if opcode != Opcode::OptionAck && buf.len() < 4 {
            return Err(DecodeError::Truncated);
        }

        let body = &buf[2..];
        match opcode {
            Opcode::ReadRequest => Ok(Self::Rrq(parse_request(body)?)),
            Opcode::WriteRequest => Ok(Self::Wrq(parse_request(body)?)),
            Opcode::Data => Ok(Self::Data {
                block: u16::from_be_bytes([body[0], body[1]]),
                payload: body[2..].to_vec(),
            }),
            Opcode::Acknowledgment => Ok(Self::Ack {
                block: u16::from_be_bytes([body[0], body[1]]),
            }),
            Opcode::Error => {
                let code = ErrorCode::from_u16(u16::from_be_bytes([body[0], body[1]]));
                let rest = &body[2..];
                // The terminating NUL is customary but some stacks omit it.
                let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                let message = std::str::from_utf8(&rest[..end])
                    .map_err(|_| DecodeError::BadString)?
                    .to_string();
                Ok(Self::Error { code, message })
            }
            Opcode::OptionAck => Ok(Self::Oack {
                options: parse_options(body)?,
            }),
        }
    }
}

fn push_options(buf: &mut Vec<u8>, options: &[(String, String)]) {
    for (name, value) in options {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
    }
}

/// Split the body of an RRQ/WRQ/OACK into its NUL-terminated strings.
fn split_strings(body: &[u8]) -> Result<Vec<&str>, DecodeError> {
    let mut strings = Vec::new();
    let mut pos = 0;

    while pos < body.len() {
        let end = body[pos..]
            .iter()
            .position(|&b| b == 0)
            .map(|i| pos + i)
            .ok_or(DecodeError::Unterminated)?;
        let s = std::str::from_utf8(&body[pos..end]).map_err(|_| DecodeError::BadString)?;
        strings.push(s);
        pos = end + 1;
    }

    Ok(strings)
}

fn parse_request(body: &[u8]) -> Result<Request, DecodeError> {
    let strings = split_strings(body)?;
    if strings.len() < 2 {
        return Err(DecodeError::Unterminated);
    }

    let filename = strings[0].to_string();
    let mode = TransferMode::from_str_opt(strings[1])
        .ok_or_else(|| DecodeError::InvalidMode(strings[1].to_string()))?;
    let options = pair_up(&strings[2..])?;

    Ok(Request {
        filename,
        mode,
        options,
    })
}

fn parse_options(body: &[u8]) -> Result<Vec<(String, String)>, DecodeError> {
    pair_up(&split_strings(body)?)
}

fn pair_up(strings: &[&str]) -> Result<Vec<(String, String)>, DecodeError> {
    if strings.len() % 2 != 0 {
        return Err(DecodeError::MalformedOptions);
    }

    Ok(strings
        .chunks_exact(2)
        .map(|pair| (pair[0].to_string(), pair[1].to_string()))
        .collect())
}
