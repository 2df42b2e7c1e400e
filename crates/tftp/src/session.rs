//! Transfer session state machines.
//!
//! One session moves one file in one direction, in strict lock-step: at any
//! instant at most one unacknowledged packet is in flight. Both roles share
//! the same exchange discipline — a locked peer transfer ID, a per-attempt
//! retransmission timer, and a cache of the last packet sent — and differ
//! only in which packet type advances them.
//!
//! The sender walks `AwaitAck(1) → AwaitAck(2) → … → Done`; the receiver
//! walks `AwaitData(1) → AwaitData(2) → … → Done`. The handshake that gets
//! a session into its first state (request, OACK, ACK 0) is driven by the
//! dispatcher or the client before the main loop starts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::TransferError;
use crate::events::{self, TransferEvent};
use crate::options::OptionSet;
use crate::packet::{ErrorCode, Packet};
use crate::transport::Endpoint;

/// Retransmissions allowed per packet before a session gives up; five
/// attempts in total.
pub const MAX_RETRIES: u32 = 4;

/// Cooperative cancellation flag, shared between a signal handler and any
/// number of sessions. Sessions poll it between iterations and answer the
/// peer with ERROR 0 "Shutting down" when it trips.
#[derive(Clone, Debug, Default)]
pub struct Shutdown(Arc<ShutdownInner>);

#[derive(Debug, Default)]
struct ShutdownInner {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.flag.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.0.flag.load(Ordering::SeqCst)
    }

    /// Resolves once [`Shutdown::trigger`] has been called.
    pub async fn triggered(&self) {
        let notified = self.0.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// Block-number comparison under 16-bit wraparound: `got` is stale when it
/// lies behind `expected` by less than half the number space. A stale block
/// is a retransmission the peer sent because it missed our reply; anything
/// ahead of `expected` breaks lock-step.
fn is_stale(got: u16, expected: u16) -> bool {
    let behind = expected.wrapping_sub(got);
    behind != 0 && behind < 0x8000
}

fn recv_buf_len(block_size: u16) -> usize {
    // Room for the negotiated payload plus the 4-byte header, and never
    // smaller than a classic 516-byte packet so handshake-phase OACK and
    // ERROR packets survive a tiny negotiated blksize.
    (usize::from(block_size) + 4).max(516)
}

/// Outcome of one receive attempt against the locked peer.
pub(crate) enum Incoming {
    Packet(Packet),
    TimedOut,
}

/// The half of a session both roles share: the endpoint, the locked peer
/// transfer ID, the retransmission cache, and the retry budget.
pub(crate) struct Exchange {
    endpoint: Endpoint,
    peer: SocketAddr,
    local_port: u16,
    timeout: Duration,
    last_sent: Vec<u8>,
    retries: u32,
    recv_buf: Vec<u8>,
    shutdown: Shutdown,
}

impl Exchange {
    pub(crate) fn new(
        endpoint: Endpoint,
        peer: SocketAddr,
        options: &OptionSet,
        shutdown: Shutdown,
    ) -> std::io::Result<Self> {
        let local_port = endpoint.local_addr()?.port();
        Ok(Self {
            endpoint,
            peer,
            local_port,
            timeout: options.timeout,
            last_sent: Vec::new(),
            retries: 0,
            recv_buf: vec![0u8; recv_buf_len(options.block_size)],
            shutdown,
        })
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Freeze the peer transfer ID. The client calls this once, on the
    /// first reply to its request; from then on every packet from another
    /// source is answered with ERROR 5.
    pub(crate) fn lock_peer(&mut self, peer: SocketAddr) {
        self.peer = peer;
    }

    /// Adopt negotiated option values: the retransmission timer and the
    /// receive buffer sized for the negotiated block size.
    pub(crate) fn apply_options(&mut self, options: &OptionSet) {
        self.timeout = options.timeout;
        self.recv_buf = vec![0u8; recv_buf_len(options.block_size)];
    }

    /// Encode, send, and cache a packet for retransmission.
    pub(crate) async fn transmit(&mut self, packet: &Packet) -> Result<(), TransferError> {
        let bytes = packet.to_bytes();
        self.endpoint.send_to(&bytes, self.peer).await?;
        self.last_sent = bytes;
        Ok(())
    }

    async fn retransmit(&self) -> Result<(), TransferError> {
        self.endpoint.send_to(&self.last_sent, self.peer).await?;
        Ok(())
    }

    pub(crate) fn reset_retries(&mut self) {
        self.retries = 0;
    }

    /// Handle an elapsed receive deadline: retransmit the cached packet, or
    /// return `give_up` once the retry budget is spent. Exhaustion is
    /// silent on the wire; the peer is presumed unreachable.
    pub(crate) async fn on_timeout(&mut self, give_up: TransferError) -> Result<(), TransferError> {
        if self.retries >= MAX_RETRIES {
            return Err(give_up);
        }
        self.retries += 1;
        tracing::debug!(
            peer = %self.peer,
            attempt = self.retries,
            "receive timed out, retransmitting"
        );
        self.retransmit().await
    }

    /// Wait one timeout interval for a packet from the locked peer.
    ///
    /// Datagrams from any other source are answered with ERROR 5 and do not
    /// consume the deadline; a stranger must not stall the real peer.
    pub(crate) async fn next_from_peer(&mut self) -> Result<Incoming, TransferError> {
        self.check_shutdown().await?;
        let deadline = Instant::now() + self.timeout;

        loop {
            let received = self
                .endpoint
                .recv_deadline(&mut self.recv_buf, deadline)
                .await?;
            let Some((len, from)) = received else {
                return Ok(Incoming::TimedOut);
            };

            if from != self.peer {
                self.send_error_to(
                    from,
                    ErrorCode::UnknownTransferId,
                    ErrorCode::UnknownTransferId.default_message(),
                )
                .await;
                continue;
            }

            return match Packet::from_bytes(&self.recv_buf[..len]) {
                Ok(packet) => Ok(Incoming::Packet(packet)),
                Err(err) => Err(self
                    .fail(TransferError::Protocol(format!("malformed packet: {}", err)))
                    .await),
            };
        }
    }

    /// Wait one timeout interval for the first reply to a request, from any
    /// source. Only the client uses this, before the transfer ID is locked.
    pub(crate) async fn first_reply(
        &mut self,
    ) -> Result<Option<(Packet, SocketAddr)>, TransferError> {
        self.check_shutdown().await?;
        let deadline = Instant::now() + self.timeout;

        let received = self
            .endpoint
            .recv_deadline(&mut self.recv_buf, deadline)
            .await?;
        let Some((len, from)) = received else {
            return Ok(None);
        };

        match Packet::from_bytes(&self.recv_buf[..len]) {
            Ok(packet) => Ok(Some((packet, from))),
            Err(err) => {
                self.peer = from;
                Err(self
                    .fail(TransferError::Protocol(format!("malformed reply: {}", err)))
                    .await)
            }
        }
    }

    /// Send the ERROR packet a failure owes the peer, then hand the failure
    /// back for the caller to return.
    pub(crate) async fn fail(&self, error: TransferError) -> TransferError {
        if let Some((code, message)) = error.wire_reply() {
            self.send_error_to(self.peer, code, &message).await;
        }
        error
    }

    async fn send_error_to(&self, to: SocketAddr, code: ErrorCode, message: &str) {
        let packet = Packet::Error {
            code,
            message: message.to_string(),
        };
        if let Err(err) = self.endpoint.send_to(&packet.to_bytes(), to).await {
            tracing::debug!(peer = %to, "failed to send ERROR packet: {}", err);
            return;
        }
        events::emit(TransferEvent::Error {
            peer: to,
            local_port: Some(self.local_port),
            code: code.as_u16(),
            message,
        });
    }

    async fn check_shutdown(&self) -> Result<(), TransferError> {
        if self.shutdown.is_triggered() {
            return Err(self.fail(TransferError::Cancelled).await);
        }
        Ok(())
    }
}

enum SenderState {
    AwaitAck(u16),
    Done,
}

/// Sending side of a transfer: serves an RRQ, or performs the client's WRQ
/// upload. Reads `blksize`-bounded chunks from the byte source and holds
/// each DATA packet until its ACK arrives.
pub(crate) struct Sender<R> {
    exchange: Exchange,
    source: R,
    block_size: usize,
}

impl<R: AsyncRead + Unpin> Sender<R> {
    pub(crate) fn new(exchange: Exchange, options: &OptionSet, source: R) -> Self {
        Self {
            exchange,
            source,
            block_size: usize::from(options.block_size),
        }
    }

    /// Serve with an OACK preamble: the option acknowledgment stands in the
    /// retransmission cache until ACK 0 confirms the client saw it.
    pub(crate) async fn run_with_oack(
        mut self,
        reply: Vec<(String, String)>,
    ) -> Result<u64, TransferError> {
        events::emit(TransferEvent::Oack {
            peer: self.exchange.peer(),
            options: &reply,
        });
        self.exchange
            .transmit(&Packet::Oack { options: reply })
            .await?;

        loop {
            match self.exchange.next_from_peer().await? {
                Incoming::TimedOut => self.exchange.on_timeout(TransferError::NoAck).await?,
                Incoming::Packet(Packet::Ack { block: 0 }) => {
                    events::emit(TransferEvent::Ack {
                        peer: self.exchange.peer(),
                        block: 0,
                    });
                    self.exchange.reset_retries();
                    break;
                }
                Incoming::Packet(Packet::Error { code, message }) => {
                    return Err(TransferError::Remote { code, message });
                }
                Incoming::Packet(other) => {
                    let error = TransferError::Protocol(format!(
                        "expected ACK 0 after OACK, got {}",
                        other.opcode().name()
                    ));
                    return Err(self.exchange.fail(error).await);
                }
            }
        }

        self.run().await
    }

    /// The main lock-step loop, starting at DATA block 1. Returns the
    /// number of payload bytes sent.
    pub(crate) async fn run(mut self) -> Result<u64, TransferError> {
        let mut sent = 0u64;
        let mut state = SenderState::AwaitAck(1);

        while let SenderState::AwaitAck(block) = state {
            self.exchange.check_shutdown().await?;
            let payload = match read_block(&mut self.source, self.block_size).await {
                Ok(payload) => payload,
                Err(err) => return Err(self.exchange.fail(err.into()).await),
            };
            // The block whose payload is short ends the transfer; a stream
            // that is an exact multiple of blksize ends with an empty DATA.
            let finishing = payload.len() < self.block_size;
            sent += payload.len() as u64;

            self.exchange
                .transmit(&Packet::Data { block, payload })
                .await?;
            self.await_ack(block).await?;

            state = if finishing {
                SenderState::Done
            } else {
                SenderState::AwaitAck(block.wrapping_add(1))
            };
        }

        tracing::debug!(peer = %self.exchange.peer(), bytes = sent, "send complete");
        Ok(sent)
    }

    async fn await_ack(&mut self, block: u16) -> Result<(), TransferError> {
        loop {
            match self.exchange.next_from_peer().await? {
                Incoming::TimedOut => self.exchange.on_timeout(TransferError::NoAck).await?,
                Incoming::Packet(Packet::Ack { block: acked }) => {
                    events::emit(TransferEvent::Ack {
                        peer: self.exchange.peer(),
                        block: acked,
                    });
                    if acked == block {
                        self.exchange.reset_retries();
                        return Ok(());
                    }
                    if is_stale(acked, block) {
                        // A duplicate of an older ACK; keep waiting.
                        continue;
                    }
                    let error = TransferError::Protocol(format!(
                        "ACK for future block {} while sending block {}",
                        acked, block
                    ));
                    return Err(self.exchange.fail(error).await);
                }
                Incoming::Packet(Packet::Error { code, message }) => {
                    return Err(TransferError::Remote { code, message });
                }
                Incoming::Packet(other) => {
                    let error = TransferError::Protocol(format!(
                        "expected ACK, got {}",
                        other.opcode().name()
                    ));
                    return Err(self.exchange.fail(error).await);
                }
            }
        }
    }
}

enum ReceiverState {
    AwaitData(u16),
    Done,
}

/// Receiving side of a transfer: the client's RRQ download, or the server
/// serving a WRQ. Each in-order DATA block is appended to the byte sink and
/// acknowledged; the ACK stays cached for retransmission.
pub(crate) struct Receiver<W> {
    exchange: Exchange,
    sink: W,
    block_size: usize,
}

impl<W: AsyncWrite + Unpin> Receiver<W> {
    pub(crate) fn new(exchange: Exchange, options: &OptionSet, sink: W) -> Self {
        Self {
            exchange,
            sink,
            block_size: usize::from(options.block_size),
        }
    }

    /// Prime the handshake reply (the server's OACK or ACK 0), then
    /// receive. The reply is what gets retransmitted until DATA 1 arrives.
    pub(crate) async fn run_with_reply(mut self, reply: Packet) -> Result<(W, u64), TransferError> {
        self.exchange.transmit(&reply).await?;
        self.run(None).await
    }

    /// The main lock-step loop, expecting DATA block 1 first. `pending`
    /// carries a packet that arrived during the handshake (the client's
    /// direct-DATA start). Returns the sink and the bytes written to it.
    pub(crate) async fn run(
        mut self,
        mut pending: Option<Packet>,
    ) -> Result<(W, u64), TransferError> {
        let mut written = 0u64;
        let mut state = ReceiverState::AwaitData(1);

        while let ReceiverState::AwaitData(expected) = state {
            self.exchange.check_shutdown().await?;
            let incoming = match pending.take() {
                Some(packet) => Incoming::Packet(packet),
                None => self.exchange.next_from_peer().await?,
            };

            match incoming {
                Incoming::TimedOut => self.exchange.on_timeout(TransferError::NoData).await?,
                Incoming::Packet(Packet::Data { block, payload }) => {
                    events::emit(TransferEvent::Data {
                        src: self.exchange.peer(),
                        local_port: self.exchange.local_port(),
                        block,
                    });

                    if block == expected {
                        if let Err(err) = self.sink.write_all(&payload).await {
                            return Err(self.exchange.fail(err.into()).await);
                        }
                        written += payload.len() as u64;
                        self.exchange.transmit(&Packet::Ack { block }).await?;
                        self.exchange.reset_retries();

                        state = if payload.len() < self.block_size {
                            ReceiverState::Done
                        } else {
                            ReceiverState::AwaitData(expected.wrapping_add(1))
                        };
                    } else if is_stale(block, expected) {
                        // The peer missed our ACK; repeat it, write nothing.
                        self.exchange.transmit(&Packet::Ack { block }).await?;
                    } else {
                        let error = TransferError::Protocol(format!(
                            "DATA for future block {} while expecting block {}",
                            block, expected
                        ));
                        return Err(self.exchange.fail(error).await);
                    }
                }
                Incoming::Packet(Packet::Error { code, message }) => {
                    return Err(TransferError::Remote { code, message });
                }
                Incoming::Packet(other) => {
                    let error = TransferError::Protocol(format!(
                        "expected DATA, got {}",
                        other.opcode().name()
                    ));
                    return Err(self.exchange.fail(error).await);
                }
            }
        }

        if let Err(err) = self.sink.flush().await {
            return Err(self.exchange.fail(err.into()).await);
        }
        tracing::debug!(peer = %self.exchange.peer(), bytes = written, "receive complete");
        Ok((self.sink, written))
    }
}

/// Read the next block-sized chunk from the byte source, short only at end
/// of stream.
async fn read_block<R: AsyncRead + Unpin>(source: &mut R, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;

    while filled < size {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    buf.truncate(filled);
    Ok(buf)
}
