use std::{collections::BTreeMap, io, path::PathBuf};

use clap::Parser;
use color_eyre::Result;
use serial_fanout::{
    endpoint::{describe, EndpointSpec, Numbering},
    error::Error,
    logging,
    virtual_port::AsyncTty,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Attaches to every expected virtual port and drains it.
/// Reports which ports were available and how much each delivered.
#[derive(Parser, Debug)]
struct Args {
    /// Endpoint path prefix.
    #[arg(short, long, default_value = "/dev/gps")]
    prefix: PathBuf,

    /// How many endpoints to expect.
    #[arg(short, long, default_value_t = 20)]
    count: u32,

    /// Expect ids starting at 1 instead of 0.
    #[arg(long)]
    one_based: bool,

    /// Print what is read to stdout instead of discarding it.
    #[arg(short, long)]
    echo: bool,
}

/// Read until end of stream or until cancelled, returning how many bytes came through either way.
async fn drain<R>(mut reader: R, cancel: CancellationToken, echo: bool) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut total = 0;
    let mut buf = vec![0; 4096];

    loop {
        let len = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(%total, "Stopped");
                return Ok(total);
            }
            len = reader.read(&mut buf) => len?,
        };

        if len == 0 {
            info!(%total, "Endpoint closed");
            return Ok(total);
        }

        total += len as u64;

        if echo {
            print!("{}", String::from_utf8_lossy(&buf[..len]));
        }
    }
}

async fn attach(endpoint: EndpointSpec, cancel: CancellationToken, echo: bool) -> Result<u64, Error> {
    let tty = AsyncTty::open(&endpoint.path)?;
    info!("Attached");

    Ok(drain(tty, cancel, echo).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    logging::init(tracing::Level::INFO, None).await;

    let args = Args::parse();

    let numbering = if args.one_based {
        Numbering::OneBased
    } else {
        Numbering::ZeroBased
    };

    let echo = args.echo;
    let cancel = CancellationToken::new();
    let mut readers = JoinSet::new();
    let mut availability = BTreeMap::new();

    for endpoint in describe(&args.prefix, numbering, args.count) {
        if !endpoint.path.exists() {
            warn!(%endpoint, "{}", Error::EndpointUnavailable(endpoint.path.clone()));
            availability.insert(endpoint.id, None);
            continue;
        }

        availability.insert(endpoint.id, Some(0));

        let span = info_span!("drain", path = %endpoint);
        let id = endpoint.id;
        let cancel = cancel.child_token();
        readers.spawn(async move { (id, attach(endpoint, cancel, echo).await) }.instrument(span));
    }

    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                info!("Ctrl-C, stopping all readers");
                cancel.cancel();
                interrupted = true;
            }
            joined = readers.join_next() => match joined {
                Some(Ok((id, Ok(total)))) => { availability.insert(id, Some(total)); }
                Some(Ok((id, Err(e)))) => {
                    error!(%id, %e, "Reader failed");
                    availability.insert(id, None);
                }
                Some(Err(e)) => error!(?e, "Reader task failed"),
                None => break,
            }
        }
    }

    for (id, state) in availability {
        match state {
            Some(total) => println!("{id}: available ({total} bytes)"),
            None => println!("{id}: unavailable"),
        }
    }

    logging::shutdown();

    Ok(())
}
