use std::time::Duration;

use amt_gateway::config::{AmtConfig, DEFAULT_RELAY};
use amt_gateway::gateway::open_amt_source;
use amt_gateway::gateway::payload::Payload;
use clap::Parser;
use clap_derive::Parser;
use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};

/// Receives a multicast stream, through an AMT relay if it does not arrive natively, and
///  writes the payload to stdout.
#[derive(Parser)]
struct Args {
    /// amt://[source@]group[:port]
    url: String,

    #[clap(long, default_value = DEFAULT_RELAY)]
    relay: String,

    /// seconds to wait for native multicast, and for relay data once tunneled
    #[clap(long, default_value_t = 5)]
    timeout: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    // stdout carries the payload
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let config = AmtConfig {
        relay: args.relay,
        native_timeout: Duration::from_secs(args.timeout),
        ..AmtConfig::default_config()
    };

    let mut receiver = open_amt_source(config, &args.url)?;
    let close_handle = receiver.close_handle();

    let (send, recv) = mpsc::channel::<Payload>(1024);
    let writer = tokio::spawn(write_to_stdout(recv));

    select! {
        result = receiver.pump(&send) => {
            result?;
            info!("end of stream");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            close_handle.close().await;
        }
    }

    drop(send);
    writer.await??;
    Ok(())
}

async fn write_to_stdout(mut recv: mpsc::Receiver<Payload>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut num_corrupted = 0usize;

    while let Some(payload) = recv.recv().await {
        if payload.corrupted {
            num_corrupted += 1;
            warn!("writing corrupted chunk of {} bytes ({} so far)", payload.data.len(), num_corrupted);
        }
        stdout.write_all(&payload.data).await?;
    }
    stdout.flush().await?;
    Ok(())
}
