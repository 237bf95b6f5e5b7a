//! chatpipe client peer: run this next to the browser.
//!
//! # Usage
//!
//! ```bash
//! export CLIENT_BOT_TOKEN=123456:abcdef
//! export CHAT_ID=-1001234567890
//! chatpipe-client                      # proxy on 127.0.0.1:8888
//! chatpipe-client --bind 0.0.0.0:3128  # custom bind
//! chatpipe-client --profile document   # ship payloads as attachments
//! ```
//!
//! Point the browser at the printed proxy address. Each browser connection
//! becomes a virtual stream through the chat channel; the server peer at
//! the egress dials the real origin.
//!
//! The `CHATPIPE_LOG` environment variable controls the log level
//! (default: info).

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use chatpipe_client::engine::TunnelClient;
use chatpipe_client::proxy::ProxyServer;
use chatpipe_core::config::{ClientConfig, TransportProfile};
use chatpipe_core::poll::run_poll_loop;
use chatpipe_core::transport::BotApi;

/// chatpipe client peer: a local HTTP/CONNECT proxy over a chat tunnel.
#[derive(Parser, Debug)]
#[command(name = "chatpipe-client", about = "Local HTTP/CONNECT proxy tunneling through a chat channel")]
struct Cli {
    /// Bind address for the local HTTP proxy (overrides PROXY_BIND).
    #[arg(short, long)]
    bind: Option<String>,

    /// Bot API base URL (overrides BASE_URL).
    #[arg(long)]
    base_url: Option<String>,

    /// Chat id carrying tunnel frames (overrides CHAT_ID).
    #[arg(long)]
    chat_id: Option<String>,

    /// Transport profile: text or document (overrides TRANSPORT_PROFILE).
    #[arg(long)]
    profile: Option<TransportProfile>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = ClientConfig::from_env().context("client configuration")?;
    if let Some(bind) = cli.bind {
        config.proxy_bind = bind;
    }
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }
    if let Some(chat_id) = cli.chat_id {
        config.chat_id = chat_id;
    }
    if let Some(profile) = cli.profile {
        config.profile = profile;
    }

    let channel = Arc::new(
        BotApi::new(&config.base_url, &config.bot_token).context("failed to build bot client")?,
    );
    let tunnel = Arc::new(TunnelClient::new(
        channel.clone(),
        config.chat_id.clone(),
        config.profile,
        config.tuning.clone(),
    ));

    let proxy = ProxyServer::bind(&config.proxy_bind, tunnel.clone())
        .await
        .context("failed to bind the proxy listener")?;
    info!(
        addr = %proxy.local_addr(),
        "configure the browser to use this HTTP proxy"
    );

    let poll = tokio::spawn(run_poll_loop(channel, tunnel, config.tuning.clone()));
    tokio::spawn(proxy.accept_loop());

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
