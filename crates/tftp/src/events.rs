//! Protocol event log.
//!
//! Every observable protocol step is described by a [`TransferEvent`] whose
//! `Display` renders the stable one-line form; [`emit`] writes it to stderr.
//! These lines are an interface consumed by tooling, so they stay fixed and
//! independent of any `tracing` subscriber configuration. Ambient
//! diagnostics go through `tracing` instead.
//!
//! Line formats:
//!
//! ```text
//! RRQ   <peer-ip>:<peer-port> "<filename>" <mode> [<opt>=<val> ...]
//! WRQ   <peer-ip>:<peer-port> "<filename>" <mode> [<opt>=<val> ...]
//! DATA  <src-ip>:<src-port>:<dst-port> <block-num>
//! ACK   <peer-ip>:<peer-port> <block-num>
//! OACK  <peer-ip>:<peer-port> [<opt>=<val> ...]
//! ERROR <peer-ip>:<peer-port>[:<local-port>] <code> "<msg>"
//! ```

use std::fmt;
use std::net::SocketAddr;

use crate::packet::{Opcode, TransferMode};

/// One observable protocol event.
#[derive(Debug)]
pub enum TransferEvent<'a> {
    /// An RRQ or WRQ was sent (client) or received (server).
    Request {
        opcode: Opcode,
        peer: SocketAddr,
        filename: &'a str,
        mode: TransferMode,
        options: &'a [(String, String)],
    },
    /// A DATA packet arrived from `src` on our local port.
    Data {
        src: SocketAddr,
        local_port: u16,
        block: u16,
    },
    /// An ACK packet arrived from the peer.
    Ack { peer: SocketAddr, block: u16 },
    /// An OACK was sent (server) or received (client).
    Oack {
        peer: SocketAddr,
        options: &'a [(String, String)],
    },
    /// An ERROR packet was sent to `peer`.
    Error {
        peer: SocketAddr,
        local_port: Option<u16>,
        code: u16,
        message: &'a str,
    },
}

impl fmt::Display for TransferEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request {
                opcode,
                peer,
                filename,
                mode,
                options,
            } => {
                write!(f, "{} {} \"{}\" {}", opcode.name(), peer, filename, mode)?;
                write_options(f, options)
            }
            Self::Data {
                src,
                local_port,
                block,
            } => write!(f, "DATA {}:{} {}", src, local_port, block),
            Self::Ack { peer, block } => write!(f, "ACK {} {}", peer, block),
            Self::Oack { peer, options } => {
                write!(f, "OACK {}", peer)?;
                write_options(f, options)
            }
            Self::Error {
                peer,
                local_port,
                code,
                message,
            } => {
                write!(f, "ERROR {}", peer)?;
                if let Some(port) = local_port {
                    write!(f, ":{}", port)?;
                }
                write!(f, " {} \"{}\"", code, message)
            }
        }
    }
}

fn write_options(f: &mut fmt::Formatter<'_>, options: &[(String, String)]) -> fmt::Result {
    for (name, value) in options {
        write!(f, " {}={}", name, value)?;
    }
    Ok(())
}

/// Write one event line to stderr.
pub fn emit(event: TransferEvent<'_>) {
    eprintln!("{}", event);
}
