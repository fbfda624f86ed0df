//! Mizuchi Spool - buffer records locally and ship them to S3
//!
//! Reads newline-delimited records from stdin.

use clap::Parser;
use mizuchi_spool::config::Config;
use mizuchi_spool::metrics::server::MetricsServer;
use mizuchi_spool::spool::Spooler;
use mizuchi_spool::store::S3Store;
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Mizuchi Spool - partitioned local spool with rotation and S3 upload
#[derive(Parser, Debug)]
#[command(name = "mizuchi-spool")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Treat each line as `<key>\t<record>` and spool it under `<key>`
    #[arg(long)]
    keyed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting Mizuchi Spool v{}", mizuchi_spool::VERSION);

    let config = Config::load(&args.config)?;
    info!("Loaded configuration from {:?}", args.config);

    let mut metrics_server = if config.metrics.enabled {
        let mut server = MetricsServer::new(&config.metrics);
        server.start().await?;
        Some(server)
    } else {
        None
    };

    let store = Arc::new(S3Store::connect(&config.s3).await);
    let spooler = Spooler::start(&config, store).await?;

    let result = tokio::select! {
        result = pump_stdin(&spooler, &config.buffer.prefix, args.keyed) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            Ok(())
        }
    };

    spooler.close().await?;
    if let Some(server) = metrics_server.as_mut() {
        server.shutdown().await;
    }
    result
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

async fn pump_stdin(spooler: &Spooler, default_key: &str, keyed: bool) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).split(b'\n');

    // Records are opaque bytes; only a keyed prefix is decoded.
    while let Some(line) = lines.next_segment().await? {
        let (key, record) = split_record(&line, default_key, keyed);
        let mut data = Vec::with_capacity(record.len() + 1);
        data.extend_from_slice(record);
        data.push(b'\n');
        spooler.write_batch([(key, data)]).await?;
    }
    info!("Reached end of input");
    Ok(())
}

fn split_record<'a>(line: &'a [u8], default_key: &'a str, keyed: bool) -> (Cow<'a, str>, &'a [u8]) {
    if keyed {
        if let Some(tab) = line.iter().position(|&b| b == b'\t') {
            return (String::from_utf8_lossy(&line[..tab]), &line[tab + 1..]);
        }
    }
    (Cow::Borrowed(default_key), line)
}
