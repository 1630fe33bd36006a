//! Agent runtime: serve a local directory through the relay.
//!
//! The agent dials the relay's agent endpoint, introduces itself with a
//! handshake message, then hands the socket to the multiplexer with a
//! [`ResourceHandler`] bound to the served root. Dropped connections are
//! retried with capped exponential backoff and jitter; the relay's
//! `no-client` refusal is terminal and stops the agent instead of
//! hammering the relay with retries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use uuid::Uuid;

use crate::handler::ResourceHandler;
use crate::locks::WriteLockRegistry;
use crate::mux::{ExchangeHandler, Multiplexer, MuxError};
use crate::wire::HelloMessage;
use crate::ws;
use crate::PROTOCOL_VERSION;

const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_SECS: u64 = 30;

/// Settings for one agent process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay base URL (`ws://` or `wss://`).
    pub url: String,
    /// Shared key correlating this agent with editor sessions ("" = none).
    pub user_key: String,
    /// Absolute path of the directory to serve.
    pub root: PathBuf,
}

/// How a connection that got past the handshake ended. Connection
/// attempts that fail before the handshake surface as plain errors.
enum ConnectionEnd {
    /// Clean close or remote shutdown; reconnect.
    Closed,
    /// Established session dropped with a multiplexer failure; reconnect.
    Failed(MuxError),
    /// The relay refused: no editor session for this key. Terminal.
    NoClient,
}

/// Reconnect policy for one finished connection attempt: a session that
/// got past the handshake starts the retry schedule over; a failed
/// attempt keeps it growing.
fn update_backoff(backoff: &mut Backoff, outcome: &anyhow::Result<ConnectionEnd>) {
    if matches!(
        outcome,
        Ok(ConnectionEnd::Closed) | Ok(ConnectionEnd::Failed(_))
    ) {
        backoff.reset();
    }
}

/// Exponential backoff, doubling up to a cap, with jitter on each delay.
#[derive(Debug)]
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    fn reset(&mut self) {
        self.current = Duration::from_millis(INITIAL_BACKOFF_MS);
    }

    /// The next delay to sleep: current interval with ±50% jitter.
    /// Doubles the interval for the call after, up to the cap.
    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(Duration::from_secs(MAX_BACKOFF_SECS));
        base.mul_f64(rand::rng().random_range(0.5..1.5))
    }
}

/// The editor-facing URL for attaching to an agent session.
fn attach_url(relay_url: &str, id: &str) -> String {
    format!(
        "{}/fs/{}",
        ws::ws_to_http_scheme(relay_url.trim_end_matches('/')),
        id
    )
}

/// Run the agent until the relay reports `no-client` or the task is
/// cancelled. Reconnects on transport failures.
pub async fn run_agent(config: AgentConfig) -> anyhow::Result<()> {
    let id = Uuid::new_v4().to_string();
    let locks = Arc::new(WriteLockRegistry::new());
    let handler: Arc<dyn ExchangeHandler> =
        Arc::new(ResourceHandler::new(config.root.clone(), locks));

    log::info!(
        "[Agent] Serving {} via {} (session {})",
        config.root.display(),
        config.url,
        id
    );

    let mut backoff = Backoff::new();
    loop {
        let outcome = serve_connection(&config, &id, Arc::clone(&handler)).await;
        update_backoff(&mut backoff, &outcome);
        match outcome {
            Ok(ConnectionEnd::Closed) => {
                log::info!("[Agent] Connection closed, reconnecting");
            }
            Ok(ConnectionEnd::Failed(err)) => {
                log::warn!("[Agent] Session dropped: {err}");
            }
            Ok(ConnectionEnd::NoClient) => {
                println!(
                    "The relay has no editor session for this key. \
                     Open the editor session first, then start the agent again."
                );
                return Ok(());
            }
            Err(err) => {
                log::warn!("[Agent] Connection failed: {err:#}");
            }
        }
        let delay = backoff.next_delay();
        log::info!("[Agent] Reconnecting in {}ms", delay.as_millis());
        tokio::time::sleep(delay).await;
    }
}

async fn serve_connection(
    config: &AgentConfig,
    id: &str,
    handler: Arc<dyn ExchangeHandler>,
) -> anyhow::Result<ConnectionEnd> {
    let base = config.url.trim_end_matches('/');
    let mut socket = ws::connect(&format!("{base}/clientsocket")).await?;

    let hello = HelloMessage {
        version: PROTOCOL_VERSION.to_string(),
        id: id.to_string(),
        user_key: config.user_key.clone(),
    };
    ws::send_json(&mut socket, &hello).await?;
    log::info!("[Agent] Connected to relay");

    if config.user_key.is_empty() {
        // No key means nothing will announce this session; print the
        // attach URL for the operator to open by hand.
        println!("Attach at: {}", attach_url(&config.url, id));
    }

    let (sink, source) = ws::split_frames(socket);
    let (mux, _handle) = Multiplexer::new();
    match mux.run(sink, source, handler).await {
        Ok(()) => Ok(ConnectionEnd::Closed),
        Err(MuxError::NoClient) => Ok(ConnectionEnd::NoClient),
        Err(err) => Ok(ConnectionEnd::Failed(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.current, Duration::from_millis(500));
        backoff.next_delay();
        assert_eq!(backoff.current, Duration::from_millis(1000));
        backoff.next_delay();
        assert_eq!(backoff.current, Duration::from_millis(2000));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current, Duration::from_secs(MAX_BACKOFF_SECS));
    }

    #[test]
    fn test_backoff_delay_is_jittered_around_base() {
        let mut backoff = Backoff::new();
        for _ in 0..50 {
            let base = backoff.current;
            let delay = backoff.next_delay();
            assert!(delay >= base / 2, "{delay:?} below jitter floor of {base:?}");
            assert!(delay <= base * 3 / 2, "{delay:?} above jitter ceiling of {base:?}");
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.current, Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_resets_after_established_session_drops() {
        let mut backoff = Backoff::new();
        for _ in 0..4 {
            backoff.next_delay();
        }
        assert!(backoff.current > Duration::from_millis(500));

        // A transport failure on a session that got past the handshake
        // starts the schedule over.
        let dropped = Ok(ConnectionEnd::Failed(MuxError::Transport(
            "reset by peer".to_string(),
        )));
        update_backoff(&mut backoff, &dropped);
        assert_eq!(backoff.current, Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_keeps_growing_when_connect_fails() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        let grown = backoff.current;

        let refused: anyhow::Result<ConnectionEnd> =
            Err(anyhow::anyhow!("connection refused"));
        update_backoff(&mut backoff, &refused);
        assert_eq!(backoff.current, grown);
    }

    #[test]
    fn test_attach_url() {
        assert_eq!(
            attach_url("ws://relay:7337", "abc"),
            "http://relay:7337/fs/abc"
        );
        assert_eq!(
            attach_url("wss://relay/", "abc"),
            "https://relay/fs/abc"
        );
    }
}
