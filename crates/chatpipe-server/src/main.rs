//! chatpipe server peer: run this at the egress.
//!
//! # Usage
//!
//! ```bash
//! export SERVER_BOT_TOKEN=123456:abcdef
//! chatpipe-server
//! chatpipe-server --profile document   # ship payloads as attachments
//! ```
//!
//! The server polls the chat channel for `CONNECT` frames, dials the
//! requested origins, and relays bytes until either end closes. It answers
//! into whichever chat each request arrived from, so no chat id is
//! configured here.
//!
//! The `CHATPIPE_LOG` environment variable controls the log level
//! (default: info).

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use chatpipe_core::config::{ServerConfig, TransportProfile};
use chatpipe_core::poll::run_poll_loop;
use chatpipe_core::transport::BotApi;
use chatpipe_server::engine::TunnelServer;

/// chatpipe server peer: the egress end of the chat tunnel.
#[derive(Parser, Debug)]
#[command(name = "chatpipe-server", about = "Egress end of the chat tunnel")]
struct Cli {
    /// Bot API base URL (overrides BASE_URL).
    #[arg(long)]
    base_url: Option<String>,

    /// Transport profile: text or document (overrides TRANSPORT_PROFILE).
    #[arg(long)]
    profile: Option<TransportProfile>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = ServerConfig::from_env().context("server configuration")?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }
    if let Some(profile) = cli.profile {
        config.profile = profile;
    }

    let channel = Arc::new(
        BotApi::new(&config.base_url, &config.bot_token).context("failed to build bot client")?,
    );
    let tunnel = Arc::new(TunnelServer::new(
        channel.clone(),
        config.profile,
        config.tuning.clone(),
    ));

    info!("server peer polling for tunnel requests");
    let poll = tokio::spawn(run_poll_loop(channel, tunnel, config.tuning.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
            Ok(())
        }
        result = poll => {
            result
                .context("poll loop panicked")?
                .context("polling halted")
        }
    }
}

/// Log level comes from `CHATPIPE_LOG` (default: info), output on stderr.
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_env("CHATPIPE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
