//! Command-line TFTP client.
//!
//! Omitting `-f` uploads the local file to the server (WRQ); giving both
//! `-f` and `-t` downloads the remote file into the local path (RRQ).

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use argh::FromArgs;
use tftp::options::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use tftp::{OptionRequest, Shutdown, TransferMode};

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP client (RFC 1350 with blksize/timeout/tsize negotiation)",
    example = "Download a file:\n  {command_name} -h 10.0.0.1 -f remote.txt -t local.txt",
    example = "Upload with a negotiated block size:\n  {command_name} -h 10.0.0.1 -t firmware.bin --option \"blksize 1428\"",
    example = "Ask the server to report the transfer size:\n  {command_name} -h 10.0.0.1 -f big.img -t big.img --option \"tsize 0\""
)]
struct Cli {
    #[argh(option, short = 'h', description = "server host name or address")]
    host: String,

    #[argh(option, short = 'p', default = "69", description = "server port")]
    port: u16,

    #[argh(
        option,
        short = 'f',
        description = "remote file to download; omit to upload instead"
    )]
    file: Option<String>,

    #[argh(option, short = 't', description = "local file path")]
    to: String,

    #[argh(option, description = "transfer option as \"name value\"; may repeat")]
    option: Vec<TransferOption>,
}

/// One `--option` argument, the `"name value"` form.
#[derive(Debug)]
struct TransferOption {
    name: String,
    value: u64,
}

impl FromStr for TransferOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let (Some(name), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err("expected \"NAME VALUE\"".to_string());
        };
        let value = value
            .parse()
            .map_err(|_| format!("option value \"{}\" is not a decimal number", value))?;
        Ok(Self {
            name: name.to_ascii_lowercase(),
            value,
        })
    }
}

fn build_request(options: &[TransferOption]) -> Result<OptionRequest> {
    let mut request = OptionRequest::default();
    for option in options {
        match option.name.as_str() {
            "blksize" => {
                let range = u64::from(MIN_BLOCK_SIZE)..=u64::from(MAX_BLOCK_SIZE);
                if !range.contains(&option.value) {
                    bail!(
                        "blksize {} outside {}..={}",
                        option.value,
                        MIN_BLOCK_SIZE,
                        MAX_BLOCK_SIZE
                    );
                }
                request.block_size = Some(option.value as u16);
            }
            "timeout" => request.timeout_secs = Some(option.value),
            "tsize" => request.transfer_size = Some(option.value),
            other => bail!("unknown transfer option \"{}\"", other),
        }
    }
    Ok(request)
}

/// Pick the transfer mode from the filename extension: text-looking files
/// go as netascii, everything else as octet. Payload bytes are identical
/// either way; the mode is advisory.
fn mode_for_path(path: &str) -> TransferMode {
    let extension = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("txt" | "html" | "xml") => TransferMode::Netascii,
        _ => TransferMode::Octet,
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("cannot resolve {}", host))?
        .next()
        .with_context(|| format!("no address found for {}", host))
}

fn report_completion(verb: &str, bytes: u64, total: Option<u64>) {
    match total {
        Some(total) if total > 0 => {
            let percent = (bytes as f64 / total as f64 * 100.0).min(100.0);
            println!("{} {} bytes ({:.0}% of {})", verb, bytes, percent, total);
        }
        _ => println!("{} {} bytes", verb, bytes),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli: Cli = argh::from_env();
    let mut request = build_request(&cli.option)?;
    let server = resolve(&cli.host, cli.port).await?;
    tracing::debug!("resolved {} to {}", cli.host, server);

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.trigger();
            }
        });
    }

    match &cli.file {
        Some(remote) => {
            // Downloads ask the server to fill the size in.
            if request.transfer_size.is_some() {
                request.transfer_size = Some(0);
            }
            let mode = mode_for_path(remote);
            let sink = tokio::fs::File::create(&cli.to)
                .await
                .with_context(|| format!("cannot create {}", cli.to))?;

            match tftp::download(server, remote, mode, &request, sink, shutdown).await {
                Ok((set, bytes)) => {
                    report_completion("downloaded", bytes, set.transfer_size);
                    Ok(())
                }
                Err(err) => {
                    // Leave no partial file behind.
                    let _ = tokio::fs::remove_file(&cli.to).await;
                    Err(err.into())
                }
            }
        }
        None => {
            let mode = mode_for_path(&cli.to);
            let source = tokio::fs::File::open(&cli.to)
                .await
                .with_context(|| format!("cannot open {}", cli.to))?;
            // Uploads announce the real size.
            if request.transfer_size.is_some() {
                request.transfer_size = Some(source.metadata().await?.len());
            }

            let (set, bytes) =
                tftp::upload(server, &cli.to, mode, &request, source, shutdown).await?;
            report_completion("uploaded", bytes, set.transfer_size);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_argument_parses_name_value() {
        let option: TransferOption = "blksize 1428".parse().unwrap();
        assert_eq!(option.name, "blksize");
        assert_eq!(option.value, 1428);

        assert!("blksize".parse::<TransferOption>().is_err());
        assert!("blksize eight".parse::<TransferOption>().is_err());
        assert!("blksize 8 extra".parse::<TransferOption>().is_err());
    }

    #[test]
    fn blksize_is_range_checked_at_the_cli() {
        let ok = build_request(&["blksize 8".parse().unwrap()]).unwrap();
        assert_eq!(ok.block_size, Some(8));

        assert!(build_request(&["blksize 4".parse().unwrap()]).is_err());
        assert!(build_request(&["blksize 65465".parse().unwrap()]).is_err());
        assert!(build_request(&["windowsize 4".parse().unwrap()]).is_err());

        // timeout 0 is sent as asked; the server is the validator.
        let zero = build_request(&["timeout 0".parse().unwrap()]).unwrap();
        assert_eq!(zero.timeout_secs, Some(0));
    }

    #[test]
    fn mode_follows_the_extension() {
        assert_eq!(mode_for_path("notes.txt"), TransferMode::Netascii);
        assert_eq!(mode_for_path("page.HTML"), TransferMode::Netascii);
        assert_eq!(mode_for_path("firmware.bin"), TransferMode::Octet);
        assert_eq!(mode_for_path("no_extension"), TransferMode::Octet);
    }
}
