//! Command-line TFTP server.

use std::path::PathBuf;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp::{ServerConfig, ServerLimits, Shutdown, TftpServer};

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP server (RFC 1350 with blksize/timeout/tsize negotiation)",
    example = "Serve /srv/tftp on the standard port:\n  {command_name} /srv/tftp",
    example = "Unprivileged test instance that never replaces files:\n  {command_name} -p 6969 --no-overwrite ./tftp_root"
)]
struct Cli {
    #[argh(option, short = 'p', default = "69", description = "port to listen on")]
    port: u16,

    #[argh(switch, description = "refuse write requests for existing files")]
    no_overwrite: bool,

    #[argh(
        option,
        description = "refuse write requests announcing more than this many bytes"
    )]
    max_write_size: Option<u64>,

    #[argh(positional, description = "directory served as the TFTP root")]
    root_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli: Cli = argh::from_env();

    // Every request filename resolves relative to the root from here on.
    std::env::set_current_dir(&cli.root_dir)
        .with_context(|| format!("cannot enter root directory {}", cli.root_dir.display()))?;

    let config = ServerConfig {
        bind_address: format!("0.0.0.0:{}", cli.port),
        root_dir: PathBuf::from("."),
        limits: ServerLimits {
            max_write_size: cli.max_write_size,
            ..Default::default()
        },
        overwrite: !cli.no_overwrite,
    };
    let server = TftpServer::bind(config)
        .await
        .context("cannot bind the request port")?;

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("SIGINT received, shutting down");
                shutdown.trigger();
            }
        });
    }

    server.serve(shutdown).await.context("request loop failed")?;
    Ok(())
}
