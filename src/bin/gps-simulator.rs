use std::{path::PathBuf, time::Duration};

use clap::Parser;
use color_eyre::Result;
use serial_fanout::{logging, provision::remove_stale, supervisor, virtual_port::VirtualPort};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

/// Pretends to be a GPS receiver.
///
/// Creates a virtual serial port and alternates between two canned payloads,
/// one phase of each, until interrupted.
/// The payloads are written as-is.
#[derive(Parser, Debug)]
struct Args {
    /// Where to link the virtual port.
    #[arg(short, long, default_value = "/dev/gps0")]
    link: PathBuf,

    /// Time between writes, in milliseconds.
    #[arg(short, long, default_value_t = 1000)]
    interval_ms: u64,

    /// Writes per phase.
    #[arg(short, long, default_value_t = 10)]
    writes: usize,

    /// Payload of the first phase.
    #[arg(long, default_value = "$GNVTG,,T,,M,10.8,N,20.0,K,D*1D\r\n")]
    first: String,

    /// Payload of the second phase.
    #[arg(long, default_value = "$GNVTG,,T,,M,0.0,N,0.0,K,D*26\r\n")]
    second: String,
}

async fn run(args: &Args, port: &mut VirtualPort) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_millis(args.interval_ms));

    for (phase, payload) in [(1, &args.first), (2, &args.second)].into_iter().cycle() {
        info!(%phase, "Next phase");

        for _ in 0..args.writes {
            interval.tick().await;
            port.write_all(payload.as_bytes()).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    logging::init(tracing::Level::INFO, None).await;

    let args = Args::parse();

    remove_stale(&args.link)?;
    let mut port = VirtualPort::allocate(&args.link)?;
    info!(link = ?port.link(), slave = ?port.slave_path(), "Simulated port up");

    tokio::select! {
        _ = supervisor::shutdown_signal() => {}
        result = run(&args, &mut port) => {
            if let Err(e) = result {
                error!(?e, "Writing failed");
            }
        }
    }

    port.remove_link()?;
    info!(link = ?args.link, "Removed");

    logging::shutdown();

    Ok(())
}
