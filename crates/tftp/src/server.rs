//! Request dispatcher.
//!
//! The server listens on its well-known port for RRQ/WRQ packets only.
//! Each accepted request gets a fresh ephemeral endpoint — the transfer-ID
//! handoff — and its session runs to completion before the next request is
//! read; overlapping clients queue in the kernel's UDP buffer. Anything
//! else arriving on the request port is answered with ERROR 4.

use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

use tokio::fs::{File, OpenOptions};

use crate::error::{self, TransferError};
use crate::events::{self, TransferEvent};
use crate::options::{self, RequestKind, ServerLimits};
use crate::packet::{ErrorCode, Opcode, Packet, Request};
use crate::session::{Exchange, Receiver, Sender, Shutdown};
use crate::transport::Endpoint;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Directory all request filenames are resolved under.
    pub root_dir: PathBuf,
    pub limits: ServerLimits,
    /// Truncate existing files on WRQ. When false, a write request for an
    /// existing file is refused with ERROR 6.
    pub overwrite: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:69".to_string(),
            root_dir: PathBuf::from("."),
            limits: ServerLimits::default(),
            overwrite: true,
        }
    }
}

pub struct TftpServer {
    config: ServerConfig,
    socket: Endpoint,
}

impl TftpServer {
    /// Bind the well-known request port.
    pub async fn bind(config: ServerConfig) -> io::Result<Self> {
        let socket = Endpoint::bind(config.bind_address.as_str()).await?;
        tracing::info!(
            "TFTP server listening on {}, serving files from {}",
            socket.local_addr()?,
            config.root_dir.display()
        );
        Ok(Self { config, socket })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The dispatcher loop. Returns cleanly once `shutdown` is triggered;
    /// a request already being served answers its peer with ERROR 0 first.
    pub async fn serve(&self, shutdown: Shutdown) -> io::Result<()> {
        let mut buf = vec![0u8; 2048];

        loop {
            let (len, peer) = tokio::select! {
                received = self.socket.recv_from(&mut buf) => received?,
                _ = shutdown.triggered() => return Ok(()),
            };

            match Packet::from_bytes(&buf[..len]) {
                Ok(Packet::Rrq(request)) => {
                    let filename = request.filename.clone();
                    if let Err(err) = self.handle_read(request, peer, &shutdown).await {
                        tracing::warn!(%peer, "read of \"{}\" failed: {}", filename, err);
                    }
                }
                Ok(Packet::Wrq(request)) => {
                    let filename = request.filename.clone();
                    if let Err(err) = self.handle_write(request, peer, &shutdown).await {
                        tracing::warn!(%peer, "write of \"{}\" failed: {}", filename, err);
                    }
                }
                Ok(other) => {
                    self.reject(
                        peer,
                        ErrorCode::IllegalOperation,
                        &format!("unexpected {} on the request port", other.opcode().name()),
                    )
                    .await;
                }
                Err(err) => {
                    self.reject(
                        peer,
                        ErrorCode::IllegalOperation,
                        &format!("malformed request: {}", err),
                    )
                    .await;
                }
            }
        }
    }

    async fn handle_read(
        &self,
        request: Request,
        peer: SocketAddr,
        shutdown: &Shutdown,
    ) -> Result<(), TransferError> {
        events::emit(TransferEvent::Request {
            opcode: Opcode::ReadRequest,
            peer,
            filename: &request.filename,
            mode: request.mode,
            options: &request.options,
        });

        let path = match resolve_path(&self.config.root_dir, &request.filename) {
            Ok(path) => path,
            Err(reason) => {
                self.reject(peer, ErrorCode::AccessViolation, &reason).await;
                return Ok(());
            }
        };

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                let code = error::io_error_code(&err);
                self.reject(peer, code, code.default_message()).await;
                return Ok(());
            }
        };
        let file_size = file.metadata().await?.len();

        let negotiated = match options::negotiate(
            &request.options,
            RequestKind::Read { file_size },
            &self.config.limits,
        ) {
            Ok(negotiated) => negotiated,
            Err((code, reason)) => {
                self.reject(peer, code, &reason).await;
                return Ok(());
            }
        };
        let (reply, set) = negotiated.into_parts();

        let endpoint = Endpoint::bind_ephemeral(peer).await?;
        let exchange = Exchange::new(endpoint, peer, &set, shutdown.clone())?;
        let sender = Sender::new(exchange, &set, file);

        let sent = match reply {
            Some(reply) => sender.run_with_oack(reply).await?,
            None => sender.run().await?,
        };
        tracing::info!(%peer, bytes = sent, "served \"{}\"", request.filename);
        Ok(())
    }

    async fn handle_write(
        &self,
        request: Request,
        peer: SocketAddr,
        shutdown: &Shutdown,
    ) -> Result<(), TransferError> {
        events::emit(TransferEvent::Request {
            opcode: Opcode::WriteRequest,
            peer,
            filename: &request.filename,
            mode: request.mode,
            options: &request.options,
        });

        let path = match resolve_path(&self.config.root_dir, &request.filename) {
            Ok(path) => path,
            Err(reason) => {
                self.reject(peer, ErrorCode::AccessViolation, &reason).await;
                return Ok(());
            }
        };

        let negotiated = match options::negotiate(
            &request.options,
            RequestKind::Write,
            &self.config.limits,
        ) {
            Ok(negotiated) => negotiated,
            Err((code, reason)) => {
                self.reject(peer, code, &reason).await;
                return Ok(());
            }
        };

        if !self.config.overwrite && tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let code = ErrorCode::FileAlreadyExists;
            self.reject(peer, code, code.default_message()).await;
            return Ok(());
        }

        let file = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(err) => {
                let code = error::io_error_code(&err);
                self.reject(peer, code, code.default_message()).await;
                return Ok(());
            }
        };

        let (reply, set) = negotiated.into_parts();
        let endpoint = Endpoint::bind_ephemeral(peer).await?;
        let exchange = Exchange::new(endpoint, peer, &set, shutdown.clone())?;

        let handshake = match reply {
            Some(reply) => {
                events::emit(TransferEvent::Oack {
                    peer,
                    options: &reply,
                });
                Packet::Oack { options: reply }
            }
            None => Packet::Ack { block: 0 },
        };

        let receiver = Receiver::new(exchange, &set, file);
        let (_file, written) = receiver.run_with_reply(handshake).await?;
        tracing::info!(%peer, bytes = written, "accepted \"{}\"", request.filename);
        Ok(())
    }

    /// Refuse a request with an ERROR sent from the well-known port.
    async fn reject(&self, peer: SocketAddr, code: ErrorCode, message: &str) {
        let packet = Packet::Error {
            code,
            message: message.to_string(),
        };
        if let Err(err) = self.socket.send_to(&packet.to_bytes(), peer).await {
            tracing::debug!(%peer, "failed to send ERROR packet: {}", err);
            return;
        }
        let local_port = self.socket.local_addr().map(|addr| addr.port()).ok();
        events::emit(TransferEvent::Error {
            peer,
            local_port,
            code: code.as_u16(),
            message,
        });
    }
}

/// Resolve a requested filename under the server root.
///
/// Absolute paths and any path with a non-plain component (`..`, `.`) are
/// refused. The check is purely syntactic so it also covers write targets
/// that do not exist on disk yet.
fn resolve_path(root: &Path, filename: &str) -> Result<PathBuf, String> {
    let requested = Path::new(filename);
    if requested.is_absolute() {
        return Err(format!("absolute path \"{}\" refused", filename));
    }
    if requested
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(format!("path \"{}\" escapes the served directory", filename));
    }
    Ok(root.join(requested))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0:69");
        assert_eq!(config.root_dir, PathBuf::from("."));
        assert!(config.overwrite);
    }

    #[test]
    fn resolve_path_joins_under_root() {
        let root = Path::new("/srv/tftp");
        assert_eq!(
            resolve_path(root, "boot.img").unwrap(),
            PathBuf::from("/srv/tftp/boot.img")
        );
        assert_eq!(
            resolve_path(root, "images/boot.img").unwrap(),
            PathBuf::from("/srv/tftp/images/boot.img")
        );
    }

    #[test]
    fn resolve_path_refuses_escapes() {
        let root = Path::new("/srv/tftp");
        assert!(resolve_path(root, "/etc/passwd").is_err());
        assert!(resolve_path(root, "../secret").is_err());
        assert!(resolve_path(root, "a/../../secret").is_err());
        assert!(resolve_path(root, "..").is_err());
        assert!(resolve_path(root, "./sneaky").is_err());
    }
}
