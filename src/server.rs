//! Relay: accepts agents and editors and wires them together.
//!
//! Three WebSocket endpoints:
//!
//! - `/clientsocket` — agents. After the handshake the agent's session
//!   is announced on the notification bus (when it carries a key) and
//!   its multiplexer handle is registered for bridging.
//! - `/editsocket` — editor subscribers. Receive `open` notifications
//!   for their identity as JSON text messages; ping is answered with
//!   pong.
//! - `/fs/<id>` — editor data connections. Each exchange opened by the
//!   editor is re-initiated on the agent's multiplexer and its units are
//!   pumped in both directions.
//!
//! The bus runs the strict policy: an agent announcing a key with no
//! live editor session is refused with a `no-client` error frame rather
//! than queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::bus::{DeliveryPolicy, NotificationBus};
use crate::mux::{
    ExchangeHandler, FrameSink, Multiplexer, MuxHandle, RejectHandler, ServerExchange, Unit,
};
use crate::wire::{Frame, HelloMessage, NotifyMessage, NO_CLIENT_REASON};
use crate::ws::{self, ServerStream};
use crate::PROTOCOL_VERSION;

/// Settings for one relay process.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address, e.g. `0.0.0.0:7337`.
    pub bind: String,
    /// Base URL under which editors reach this relay; used to build the
    /// resource locators sent in open notifications.
    pub public_url: String,
}

/// Shared relay state: the bus and the table of connected agents.
pub struct RelayState {
    bus: Arc<NotificationBus>,
    agents: Mutex<HashMap<String, MuxHandle>>,
    public_url: String,
}

impl RelayState {
    fn new(public_url: String) -> Self {
        Self {
            bus: Arc::new(NotificationBus::new(DeliveryPolicy::Strict)),
            agents: Mutex::new(HashMap::new()),
            public_url,
        }
    }

    fn register_agent(&self, id: &str, handle: MuxHandle) {
        self.agents
            .lock()
            .expect("agent table poisoned")
            .insert(id.to_string(), handle);
    }

    fn deregister_agent(&self, id: &str) {
        self.agents
            .lock()
            .expect("agent table poisoned")
            .remove(id);
    }

    fn agent_handle(&self, id: &str) -> Option<MuxHandle> {
        self.agents
            .lock()
            .expect("agent table poisoned")
            .get(id)
            .cloned()
    }

    /// Locator editors use to attach to the agent session `id`.
    fn resource_ref(&self, id: &str) -> String {
        format!("{}/fs/{}", self.public_url.trim_end_matches('/'), id)
    }
}

/// The identity an editor connection subscribes under: its key when it
/// has one, otherwise its own session id.
fn editor_identity(hello: &HelloMessage) -> &str {
    if hello.user_key.is_empty() {
        &hello.id
    } else {
        &hello.user_key
    }
}

/// Run the relay until the task is cancelled.
pub async fn run_relay(config: RelayConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    log::info!("[Relay] Listening on {}", config.bind);

    let state = Arc::new(RelayState::new(config.public_url));
    loop {
        let (stream, addr) = listener.accept().await.context("Accept failed")?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(state, stream).await {
                log::warn!("[Relay] Connection from {addr} failed: {err:#}");
            }
        });
    }
}

async fn handle_connection(state: Arc<RelayState>, stream: TcpStream) -> anyhow::Result<()> {
    let (socket, path) = ws::accept(stream).await?;
    if path == "/clientsocket" {
        handle_agent(state, socket).await
    } else if path == "/editsocket" {
        handle_editor(state, socket).await
    } else if let Some(id) = path.strip_prefix("/fs/") {
        handle_bridge(state, socket, id).await
    } else {
        anyhow::bail!("Unknown endpoint: {path}")
    }
}

async fn handle_agent(state: Arc<RelayState>, mut socket: ServerStream) -> anyhow::Result<()> {
    let hello: HelloMessage = ws::recv_json(&mut socket).await?;
    if hello.version != PROTOCOL_VERSION {
        log::warn!(
            "[Relay] Agent {} speaks version {} (relay: {})",
            hello.id,
            hello.version,
            PROTOCOL_VERSION
        );
    }

    if !hello.user_key.is_empty() {
        let resource_ref = state.resource_ref(&hello.id);
        if state.bus.publish(&hello.user_key, &resource_ref).is_err() {
            // Strict policy: nobody to announce to. Refuse the agent so
            // it stops retrying instead of serving into the void.
            log::info!("[Relay] Refusing agent {}: no editor session", hello.id);
            let (mut sink, _source) = ws::split_frames(socket);
            let _ = sink.send(Frame::error(NO_CLIENT_REASON)).await;
            return Ok(());
        }
    }

    let (mux, handle) = Multiplexer::new();
    state.register_agent(&hello.id, handle);
    log::info!("[Relay] Agent {} connected", hello.id);

    let (sink, source) = ws::split_frames(socket);
    // The relay never opens commands toward an agent on its own.
    let result = mux.run(sink, source, Arc::new(RejectHandler)).await;
    state.deregister_agent(&hello.id);
    log::info!("[Relay] Agent {} disconnected", hello.id);
    result.map_err(Into::into)
}

async fn handle_editor(state: Arc<RelayState>, mut socket: ServerStream) -> anyhow::Result<()> {
    let hello: HelloMessage = ws::recv_json(&mut socket).await?;
    let identity = editor_identity(&hello).to_string();
    let mut subscription = state.bus.subscribe(&identity);
    log::info!("[Relay] Editor subscribed under {identity}");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(resource_ref) = event else { break };
                ws::send_json(&mut socket, &NotifyMessage::open(&resource_ref)).await?;
            }
            message = socket.next() => {
                match message {
                    None | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(msg) = serde_json::from_str::<NotifyMessage>(&text) {
                            if msg.message_type == "ping" {
                                ws::send_json(&mut socket, &NotifyMessage::pong()).await?;
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                }
            }
        }
    }
    log::info!("[Relay] Editor under {identity} disconnected");
    Ok(())
}

async fn handle_bridge(
    state: Arc<RelayState>,
    socket: ServerStream,
    id: &str,
) -> anyhow::Result<()> {
    let (mut sink, source) = ws::split_frames(socket);
    let Some(agent) = state.agent_handle(id) else {
        log::info!("[Relay] No agent for session {id}");
        let _ = sink.send(Frame::error(NO_CLIENT_REASON)).await;
        return Ok(());
    };

    log::info!("[Relay] Editor attached to agent {id}");
    let (mux, _handle) = Multiplexer::new();
    let result = mux.run(sink, source, Arc::new(BridgeHandler { agent })).await;
    log::info!("[Relay] Editor detached from agent {id}");
    result.map_err(Into::into)
}

/// Forwards each exchange an editor opens onto the agent's multiplexer,
/// pumping request units up and response units back.
struct BridgeHandler {
    agent: MuxHandle,
}

#[async_trait]
impl ExchangeHandler for BridgeHandler {
    async fn handle(&self, mut exchange: ServerExchange) {
        let sender = exchange.sender().clone();
        let Ok(mut upstream) = self.agent.open_exchange(&exchange.command).await else {
            // Agent went away between lookup and open.
            let _ = sender.send_status(502).await;
            let _ = sender.send_header("Content-Length: 0").await;
            let _ = sender.finish().await;
            return;
        };

        let mut request_done = false;
        loop {
            tokio::select! {
                unit = exchange.recv_unit(), if !request_done => {
                    let forwarded = match unit {
                        Some(Unit::Header(block)) => upstream.send_header(&block).await,
                        Some(Unit::Body(data)) => upstream.send_body(data).await,
                        Some(Unit::End) => {
                            request_done = true;
                            upstream.finish().await
                        }
                        // Editor side dropped mid-request; stop pumping
                        // upward, keep draining the response.
                        None => {
                            request_done = true;
                            Ok(())
                        }
                        Some(_) => Ok(()),
                    };
                    if forwarded.is_err() {
                        break;
                    }
                }
                unit = upstream.recv() => {
                    let relayed = match unit {
                        Some(Unit::Status(code)) => sender.send_status(code).await,
                        Some(Unit::Header(block)) => sender.send_header(&block).await,
                        Some(Unit::Body(data)) => sender.send_body(data).await,
                        Some(Unit::End) | None => break,
                        Some(_) => Ok(()),
                    };
                    if relayed.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = sender.finish().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::testing::pair;
    use bytes::Bytes;

    #[test]
    fn test_editor_identity_prefers_key() {
        let keyed = HelloMessage {
            version: "0.1".to_string(),
            id: "session-1".to_string(),
            user_key: "secret".to_string(),
        };
        assert_eq!(editor_identity(&keyed), "secret");

        let keyless = HelloMessage {
            version: "0.1".to_string(),
            id: "session-1".to_string(),
            user_key: String::new(),
        };
        assert_eq!(editor_identity(&keyless), "session-1");
    }

    #[test]
    fn test_resource_ref_format() {
        let state = RelayState::new("http://relay:7337".to_string());
        assert_eq!(state.resource_ref("abc"), "http://relay:7337/fs/abc");
        let state = RelayState::new("http://relay:7337/".to_string());
        assert_eq!(state.resource_ref("abc"), "http://relay:7337/fs/abc");
    }

    #[test]
    fn test_agent_registry() {
        let state = RelayState::new("http://relay".to_string());
        let (_mux, handle) = Multiplexer::new();
        state.register_agent("a1", handle);
        assert!(state.agent_handle("a1").is_some());
        assert!(state.agent_handle("a2").is_none());
        state.deregister_agent("a1");
        assert!(state.agent_handle("a1").is_none());
    }

    /// Answers every exchange with 200 and the request body, uppercased.
    struct UppercaseHandler;

    #[async_trait]
    impl ExchangeHandler for UppercaseHandler {
        async fn handle(&self, mut exchange: ServerExchange) {
            let body = exchange.read_body().await;
            let sender = exchange.sender().clone();
            sender.send_status(200).await.unwrap();
            sender.send_body(Bytes::from(body.to_ascii_uppercase())).await.unwrap();
            sender.finish().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_bridge_pumps_both_directions() {
        // "Agent" link: a multiplexer pair with an uppercasing handler.
        let ((agent_sink, agent_source), (relay_sink, relay_source)) = pair();
        let (agent_mux, _) = Multiplexer::new();
        let (relay_mux, agent_handle) = Multiplexer::new();
        tokio::spawn(agent_mux.run(agent_sink, agent_source, Arc::new(UppercaseHandler)));
        tokio::spawn(relay_mux.run(relay_sink, relay_source, Arc::new(RejectHandler)));

        // "Editor" link: a second pair driven by the bridge handler.
        let ((editor_sink, editor_source), (bridge_sink, bridge_source)) = pair();
        let (editor_mux, editor_handle) = Multiplexer::new();
        let (bridge_mux, _) = Multiplexer::new();
        tokio::spawn(editor_mux.run(editor_sink, editor_source, Arc::new(RejectHandler)));
        tokio::spawn(bridge_mux.run(
            bridge_sink,
            bridge_source,
            Arc::new(BridgeHandler { agent: agent_handle }),
        ));

        let mut exchange = editor_handle.open_exchange("POST /x").await.unwrap();
        exchange.send_body(Bytes::from_static(b"hello")).await.unwrap();
        exchange.finish().await.unwrap();

        assert_eq!(exchange.recv().await, Some(Unit::Status(200)));
        assert_eq!(
            exchange.recv().await,
            Some(Unit::Body(Bytes::from_static(b"HELLO")))
        );
        assert_eq!(exchange.recv().await, Some(Unit::End));
    }
}
