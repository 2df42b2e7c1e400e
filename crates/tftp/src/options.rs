//! TFTP option negotiation (RFC 2347/2348/2349).
//!
//! Three options are recognized: `blksize`, `timeout`, and `tsize`. The
//! responder side intersects a request's option list with what the server is
//! willing to honor and produces the OACK reply; the requester side verifies
//! a received OACK against what was asked for. Unrecognized option names are
//! ignored on both sides, as RFC 2347 requires.

use std::time::Duration;

use crate::packet::ErrorCode;

/// Default DATA payload size (RFC 1350).
pub const DEFAULT_BLOCK_SIZE: u16 = 512;
/// Smallest negotiable block size (RFC 2348).
pub const MIN_BLOCK_SIZE: u16 = 8;
/// Largest negotiable block size (RFC 2348).
pub const MAX_BLOCK_SIZE: u16 = 65464;
/// Default per-packet retransmission timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
/// Block size the server caps negotiation at. Keeps DATA packets inside a
/// 1500-byte MTU with UDP/IP headers to spare.
pub const SERVER_BLOCK_SIZE_CAP: u16 = 1428;

const BLKSIZE: &str = "blksize";
const TIMEOUT: &str = "timeout";
const TSIZE: &str = "tsize";

/// The options a client asks for in its RRQ/WRQ.
///
/// `timeout` is carried verbatim; the server is the validator and simply
/// omits out-of-range values from its OACK.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionRequest {
    pub block_size: Option<u16>,
    pub timeout_secs: Option<u64>,
    pub transfer_size: Option<u64>,
}

impl OptionRequest {
    pub fn is_empty(&self) -> bool {
        self.block_size.is_none() && self.timeout_secs.is_none() && self.transfer_size.is_none()
    }

    /// Wire form, in the order the request emits them.
    pub fn to_wire(&self) -> Vec<(String, String)> {
        let mut options = Vec::new();
        if let Some(size) = self.block_size {
            options.push((BLKSIZE.to_string(), size.to_string()));
        }
        if let Some(secs) = self.timeout_secs {
            options.push((TIMEOUT.to_string(), secs.to_string()));
        }
        if let Some(size) = self.transfer_size {
            options.push((TSIZE.to_string(), size.to_string()));
        }
        options
    }
}

/// The option values in effect for one session, after negotiation or by
/// default. The flags record whether a value was actually negotiated
/// (present in the OACK) or fell back to its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSet {
    pub block_size: u16,
    pub timeout: Duration,
    pub transfer_size: Option<u64>,
    pub block_size_negotiated: bool,
    pub timeout_negotiated: bool,
}

impl Default for OptionSet {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            transfer_size: None,
            block_size_negotiated: false,
            timeout_negotiated: false,
        }
    }
}

/// What the responder is negotiating for: serving a file of known size, or
/// accepting one whose announced size may be bounded.
#[derive(Debug, Clone, Copy)]
pub enum RequestKind {
    Read { file_size: u64 },
    Write,
}

/// Server-side negotiation bounds.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    pub block_size_cap: u16,
    /// Largest announced `tsize` accepted for a write; beyond it the request
    /// is refused with ERROR 3 (Disk full).
    pub max_write_size: Option<u64>,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            block_size_cap: SERVER_BLOCK_SIZE_CAP,
            max_write_size: None,
        }
    }
}

/// Result of responder-side negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiated {
    /// At least one option was accepted: reply with this OACK.
    Oack {
        reply: Vec<(String, String)>,
        set: OptionSet,
    },
    /// Nothing accepted: classic RFC 1350 handshake (ACK 0 or DATA 1).
    Classic(OptionSet),
}

impl Negotiated {
    pub fn into_parts(self) -> (Option<Vec<(String, String)>>, OptionSet) {
        match self {
            Self::Oack { reply, set } => (Some(reply), set),
            Self::Classic(set) => (None, set),
        }
    }
}

/// Apply the responder rules to a request's option list.
///
/// - `blksize` is clamped to the server cap, never refused for being large;
///   values below 8 or unparseable are omitted.
/// - `timeout` is echoed if within 1..=255 seconds, omitted otherwise.
/// - `tsize` in a read request with value 0 is answered with the real file
///   size; in a write request the announced value is echoed, unless it
///   exceeds `max_write_size`, which refuses the whole request.
pub fn negotiate(
    requested: &[(String, String)],
    kind: RequestKind,
    limits: &ServerLimits,
) -> Result<Negotiated, (ErrorCode, String)> {
    let mut reply = Vec::new();
    let mut set = OptionSet::default();

    for (name, value) in requested {
        match name.to_ascii_lowercase().as_str() {
            BLKSIZE => {
                let Ok(asked) = value.parse::<u64>() else {
                    continue;
                };
                if asked < u64::from(MIN_BLOCK_SIZE) {
                    continue;
                }
                let cap = limits.block_size_cap.min(MAX_BLOCK_SIZE);
                let chosen = asked.min(u64::from(cap)) as u16;
                set.block_size = chosen;
                set.block_size_negotiated = true;
                reply.push((BLKSIZE.to_string(), chosen.to_string()));
            }
            TIMEOUT => {
                let Ok(secs) = value.parse::<u64>() else {
                    continue;
                };
                if !(1..=255).contains(&secs) {
                    continue;
                }
                set.timeout = Duration::from_secs(secs);
                set.timeout_negotiated = true;
                reply.push((TIMEOUT.to_string(), secs.to_string()));
            }
            TSIZE => match kind {
                RequestKind::Read { file_size } => {
                    if value.parse::<u64>() != Ok(0) {
                        continue;
                    }
                    set.transfer_size = Some(file_size);
                    reply.push((TSIZE.to_string(), file_size.to_string()));
                }
                RequestKind::Write => {
                    let Ok(announced) = value.parse::<u64>() else {
                        continue;
                    };
                    if let Some(bound) = limits.max_write_size
                        && announced > bound
                    {
                        return Err((
                            ErrorCode::DiskFull,
                            format!("announced size {} exceeds limit {}", announced, bound),
                        ));
                    }
                    set.transfer_size = Some(announced);
                    reply.push((TSIZE.to_string(), announced.to_string()));
                }
            },
            _ => {
                // RFC 2347 §5: unrecognized options are ignored, not refused.
            }
        }
    }

    if reply.is_empty() {
        Ok(Negotiated::Classic(set))
    } else {
        Ok(Negotiated::Oack { reply, set })
    }
}

/// Apply the requester rules to a received OACK.
///
/// The server may lower `blksize` but never raise it, must echo `timeout`
/// exactly, and may only acknowledge options that were requested. `tsize`
/// is informational and adopted. A violation fails the session with
/// ERROR 8 (option negotiation).
pub fn accept_oack(
    requested: &OptionRequest,
    oack: &[(String, String)],
) -> Result<OptionSet, String> {
    let mut set = OptionSet::default();

    for (name, value) in oack {
        match name.to_ascii_lowercase().as_str() {
            BLKSIZE => {
                let Some(asked) = requested.block_size else {
                    return Err("server acknowledged blksize we never requested".to_string());
                };
                let granted: u16 = value
                    .parse()
                    .map_err(|_| format!("unparseable blksize \"{}\" in OACK", value))?;
                if granted < MIN_BLOCK_SIZE || granted > asked {
                    return Err(format!(
                        "server granted blksize {} outside 8..={}",
                        granted, asked
                    ));
                }
                set.block_size = granted;
                set.block_size_negotiated = true;
            }
            TIMEOUT => {
                let Some(asked) = requested.timeout_secs else {
                    return Err("server acknowledged timeout we never requested".to_string());
                };
                if value.parse::<u64>() != Ok(asked) {
                    return Err(format!(
                        "server granted timeout {} instead of the requested {}",
                        value, asked
                    ));
                }
                set.timeout = Duration::from_secs(asked);
                set.timeout_negotiated = true;
            }
            TSIZE => {
                if requested.transfer_size.is_none() {
                    return Err("server acknowledged tsize we never requested".to_string());
                }
                let size: u64 = value
                    .parse()
                    .map_err(|_| format!("unparseable tsize \"{}\" in OACK", value))?;
                set.transfer_size = Some(size);
            }
            other => {
                return Err(format!("server acknowledged unknown option \"{}\"", other));
            }
        }
    }

    Ok(set)
}
