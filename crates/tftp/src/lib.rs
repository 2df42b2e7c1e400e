//! TFTP client and server.
//!
//! An implementation of the Trivial File Transfer Protocol — RFC 1350 plus
//! the option negotiation extensions of RFC 2347/2348/2349 (`blksize`,
//! `timeout`, `tsize`).
//!
//! The protocol is strict lock-step over UDP: one packet in flight at a
//! time, every DATA acknowledged before the next is sent, timeouts driving
//! retransmission of the last packet sent. A request arrives on the
//! server's well-known port and is answered from a fresh ephemeral port;
//! that port pair is the transfer ID, frozen for the rest of the session.
//!
//! Entry points:
//!
//! - [`client::download`] / [`client::upload`] — one transfer each, against
//!   a server address.
//! - [`TftpServer`] — bind a request port and [`TftpServer::serve`] until
//!   shut down.
//!
//! Payload bytes are opaque in both transfer modes; no netascii
//! line-ending translation is performed.

pub mod client;
pub mod error;
pub mod events;
pub mod options;
pub mod packet;
pub mod server;
mod session;
pub mod transport;

pub use client::{download, upload};
pub use error::TransferError;
pub use options::{OptionRequest, OptionSet, ServerLimits};
pub use packet::{ErrorCode, Packet, TransferMode};
pub use server::{ServerConfig, TftpServer};
pub use session::{MAX_RETRIES, Shutdown};
