//! Client-side transfer drivers.
//!
//! `download` performs an RRQ, `upload` a WRQ. Both send the request from a
//! fresh ephemeral port, wait for the server's first reply — retransmitting
//! the request itself on timeout — and lock the transfer ID to whichever
//! address answered, since the server replies from a port of its own
//! choosing rather than the well-known one.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransferError;
use crate::events::{self, TransferEvent};
use crate::options::{self, OptionRequest, OptionSet};
use crate::packet::{Opcode, Packet, Request, TransferMode};
use crate::session::{Exchange, Receiver, Sender, Shutdown};
use crate::transport::Endpoint;

/// Download `remote` from the server into `sink`.
///
/// Returns the option set in effect and the number of bytes written. An
/// OACK is validated against `requested` and answered with ACK 0; a server
/// that ignores options starts straight with DATA 1 and the session runs on
/// defaults.
pub async fn download<W>(
    server: SocketAddr,
    remote: &str,
    mode: TransferMode,
    requested: &OptionRequest,
    sink: W,
    shutdown: Shutdown,
) -> Result<(OptionSet, u64), TransferError>
where
    W: AsyncWrite + Unpin,
{
    let endpoint = Endpoint::bind_ephemeral(server).await?;
    let wire_options = requested.to_wire();
    events::emit(TransferEvent::Request {
        opcode: Opcode::ReadRequest,
        peer: server,
        filename: remote,
        mode,
        options: &wire_options,
    });

    let mut exchange = Exchange::new(endpoint, server, &OptionSet::default(), shutdown)?;
    exchange
        .transmit(&Packet::Rrq(Request {
            filename: remote.to_string(),
            mode,
            options: wire_options,
        }))
        .await?;

    let (first, from) = await_first_reply(&mut exchange, || TransferError::NoData).await?;
    exchange.lock_peer(from);

    match first {
        Packet::Oack { options: oack } => {
            events::emit(TransferEvent::Oack {
                peer: from,
                options: &oack,
            });
            let set = match options::accept_oack(requested, &oack) {
                Ok(set) => set,
                Err(reason) => {
                    return Err(exchange
                        .fail(TransferError::OptionNegotiation(reason))
                        .await);
                }
            };
            exchange.apply_options(&set);
            exchange.transmit(&Packet::Ack { block: 0 }).await?;

            let receiver = Receiver::new(exchange, &set, sink);
            let (_sink, written) = receiver.run(None).await?;
            Ok((set, written))
        }
        first @ Packet::Data { .. } => {
            // The server ignored our options; everything reverts to the
            // defaults for this session.
            let set = OptionSet::default();
            let receiver = Receiver::new(exchange, &set, sink);
            let (_sink, written) = receiver.run(Some(first)).await?;
            Ok((set, written))
        }
        Packet::Error { code, message } => Err(TransferError::Remote { code, message }),
        other => {
            let error = TransferError::Protocol(format!(
                "expected OACK or DATA in reply to RRQ, got {}",
                other.opcode().name()
            ));
            Err(exchange.fail(error).await)
        }
    }
}

/// Upload `source` to the server as `remote`.
///
/// In the upload direction the client never sends ACK 0: a validated OACK
/// substitutes for it and the first DATA block follows immediately.
pub async fn upload<R>(
    server: SocketAddr,
    remote: &str,
    mode: TransferMode,
    requested: &OptionRequest,
    source: R,
    shutdown: Shutdown,
) -> Result<(OptionSet, u64), TransferError>
where
    R: AsyncRead + Unpin,
{
    let endpoint = Endpoint::bind_ephemeral(server).await?;
    let wire_options = requested.to_wire();
    events::emit(TransferEvent::Request {
        opcode: Opcode::WriteRequest,
        peer: server,
        filename: remote,
        mode,
        options: &wire_options,
    });

    let mut exchange = Exchange::new(endpoint, server, &OptionSet::default(), shutdown)?;
    exchange
        .transmit(&Packet::Wrq(Request {
            filename: remote.to_string(),
            mode,
            options: wire_options,
        }))
        .await?;

    let (first, from) = await_first_reply(&mut exchange, || TransferError::NoAck).await?;
    exchange.lock_peer(from);

    match first {
        Packet::Oack { options: oack } => {
            events::emit(TransferEvent::Oack {
                peer: from,
                options: &oack,
            });
            let set = match options::accept_oack(requested, &oack) {
                Ok(set) => set,
                Err(reason) => {
                    return Err(exchange
                        .fail(TransferError::OptionNegotiation(reason))
                        .await);
                }
            };
            exchange.apply_options(&set);

            let sender = Sender::new(exchange, &set, source);
            let sent = sender.run().await?;
            Ok((set, sent))
        }
        Packet::Ack { block: 0 } => {
            events::emit(TransferEvent::Ack {
                peer: from,
                block: 0,
            });
            let set = OptionSet::default();
            let sender = Sender::new(exchange, &set, source);
            let sent = sender.run().await?;
            Ok((set, sent))
        }
        Packet::Ack { block } => {
            let error =
                TransferError::Protocol(format!("ACK {} before any data was sent", block));
            Err(exchange.fail(error).await)
        }
        Packet::Error { code, message } => Err(TransferError::Remote { code, message }),
        other => {
            let error = TransferError::Protocol(format!(
                "expected OACK or ACK 0 in reply to WRQ, got {}",
                other.opcode().name()
            ));
            Err(exchange.fail(error).await)
        }
    }
}

/// Wait for the first reply to a request, retransmitting the request on
/// each timeout until the retry budget runs out.
async fn await_first_reply(
    exchange: &mut Exchange,
    give_up: fn() -> TransferError,
) -> Result<(Packet, SocketAddr), TransferError> {
    loop {
        if let Some(reply) = exchange.first_reply().await? {
            return Ok(reply);
        }
        exchange.on_timeout(give_up()).await?;
    }
}
