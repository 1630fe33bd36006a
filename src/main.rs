//! Tether CLI - serve a local directory to remote editors through a relay.
//!
//! This is the binary entry point. See the `tether` library for the
//! protocol and runtime pieces.

use anyhow::{Context, Result};
use clap::Parser;

use tether::client::{run_agent, AgentConfig};
use tether::server::{run_relay, RelayConfig};
use tether::{ws, Config};

#[derive(Parser, Debug)]
#[command(
    name = "tether",
    version,
    about = "Serve a local directory to remote editors through a relay"
)]
struct Cli {
    /// Run as the relay instead of an agent.
    #[arg(long)]
    serve: bool,

    /// Relay URL the agent connects to.
    #[arg(long)]
    url: Option<String>,

    /// Shared key correlating this agent with editor sessions.
    #[arg(long)]
    key: Option<String>,

    /// Listen address for the relay (with --serve).
    #[arg(long)]
    bind: Option<String>,

    /// Public base URL editors use to reach the relay; defaults to the
    /// bind address (with --serve).
    #[arg(long)]
    public_url: Option<String>,

    /// Directory to serve.
    #[arg(default_value = ".")]
    root: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(url) = cli.url {
        config.url = url;
    }
    if let Some(key) = cli.key {
        config.user_key = key;
    }
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    if cli.serve {
        let public_url = cli
            .public_url
            .unwrap_or_else(|| format!("http://{}", config.bind));
        let relay = RelayConfig {
            bind: config.bind.clone(),
            public_url,
        };
        tokio::select! {
            result = run_relay(relay) => result,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                Ok(())
            }
        }
    } else {
        let root = shellexpand::tilde(&cli.root).into_owned();
        let root = std::fs::canonicalize(&root)
            .with_context(|| format!("Cannot serve {root}"))?;
        anyhow::ensure!(root.is_dir(), "{} is not a directory", root.display());

        let agent = AgentConfig {
            url: ws::http_to_ws_scheme(&config.url),
            user_key: config.user_key.clone(),
            root,
        };
        tokio::select! {
            result = run_agent(agent) => result,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                Ok(())
            }
        }
    }
}
