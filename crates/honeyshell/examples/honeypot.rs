//! SSH honeypot example.
//!
//! Accepts every password, hands out a pseudo-shell and logs everything
//! the client types.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example honeypot -- --address 127.0.0.1:2222 --record-dir ./casts
//! ```
//!
//! Then connect with:
//!
//! ```bash
//! ssh -p 2222 -o StrictHostKeyChecking=no root@localhost
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use honeyshell::ServerBuilder;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "honeypot")]
#[command(version, about = "Low-interaction SSH honeypot", long_about = None)]
struct Cli {
    /// Listen address
    #[arg(short, long, env = "HONEYPOT_ADDRESS", default_value = "127.0.0.1:2222")]
    address: String,

    /// Host key file (an ephemeral key is generated otherwise)
    #[arg(long, value_name = "FILE")]
    host_key: Option<PathBuf>,

    /// Directory for asciicast recordings
    #[arg(long, value_name = "DIR")]
    record_dir: Option<PathBuf>,

    /// Host name reported by the shell
    #[arg(long, default_value = "ubuntu")]
    hostname: String,

    /// Seconds of silence before a connection is dropped
    #[arg(long, default_value = "120")]
    idle_timeout: u64,

    /// Maximum concurrent sessions
    #[arg(long, default_value = "64")]
    max_sessions: usize,

    /// Emit JSON log lines
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), honeyshell::Error> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            "honeyshell=debug,honeypot=debug".into()
        } else {
            "honeyshell=info,honeypot=info".into()
        }
    });
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut builder = ServerBuilder::new()
        .address(cli.address)
        .hostname(cli.hostname)
        .idle_timeout(Duration::from_secs(cli.idle_timeout))
        .max_sessions(cli.max_sessions);
    if let Some(path) = cli.host_key {
        builder = builder.host_key_file(path);
    }
    if let Some(dir) = cli.record_dir {
        std::fs::create_dir_all(&dir)?;
        builder = builder.record_to(dir);
    }
    let server = builder.build()?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received");
            on_signal.cancel();
        }
    });

    tracing::info!("Connect with: ssh -p <port> -o StrictHostKeyChecking=no root@localhost");
    server.listen_until(shutdown).await
}
