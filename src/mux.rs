//! Frame multiplexer: many concurrent exchanges over one connection.
//!
//! The multiplexer owns one frame transport (split into sink and source
//! halves) and turns it into any number of concurrent logical exchanges,
//! each with its own ordered inbound queue and a shared, bounded outbound
//! queue:
//!
//! ```text
//!                  ┌────────────────────────────┐
//!   FrameSource ──►│ read loop: route by        │──► per-exchange mpsc ──► handler task
//!                  │ exchange id, spawn handler │──► per-exchange mpsc ──► handler task
//!                  │ on new Command frames      │
//!                  └────────────────────────────┘
//!                  ┌────────────────────────────┐
//!   FrameSink  ◄───│ write loop: drain shared   │◄── ExchangeSender (handlers,
//!                  │ bounded outbound queue     │    initiated exchanges)
//!                  └────────────────────────────┘
//! ```
//!
//! Units within one exchange stay strictly ordered; units of different
//! exchanges interleave freely. The outbound queue is bounded so a
//! handler streaming a large body backpressures instead of starving
//! unrelated exchanges' access to the wire.
//!
//! A new exchange begins when a `Command` frame arrives for an id the
//! read loop does not know. An exchange's routing entry is dropped when
//! its inbound `End` arrives (request body end on the accepting side,
//! response end on the initiating side). Connection close aborts every
//! open exchange; a control `Error` frame with reason `no-client` is
//! surfaced as [`MuxError::NoClient`], distinct from transport errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::wire::{ExchangeId, Frame, FrameKind, CONTROL_EXCHANGE, NO_CLIENT_REASON};

/// Bound of the shared outbound queue. Keeps one flooding exchange from
/// monopolizing the wire while others wait to enqueue.
const OUTBOUND_CHANNEL_BOUND: usize = 64;

/// Outgoing half of a frame transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame.
    async fn send(&mut self, frame: Frame) -> anyhow::Result<()>;
}

/// Incoming half of a frame transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame, or `None` when the connection closed.
    async fn recv(&mut self) -> anyhow::Result<Option<Frame>>;
}

/// Connection-level multiplexer failure.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The far end refused to route: no attached handler peer.
    #[error("no-client")]
    NoClient,
    /// Transport read or write failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// The far end reported a protocol-level error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// The connection is gone; the exchange cannot make progress.
#[derive(Debug, Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// One message unit within an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// Command line, e.g. `"GET /a/b.txt"`.
    Command(String),
    /// Numeric status code.
    Status(u16),
    /// Header block.
    Header(String),
    /// Body payload.
    Body(Bytes),
    /// Terminator.
    End,
}

impl Unit {
    fn from_frame(frame: Frame) -> Result<Self, MuxError> {
        match frame.kind {
            FrameKind::Command => Ok(Unit::Command(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            )),
            FrameKind::Status => {
                let code = frame
                    .status_code()
                    .map_err(|e| MuxError::Protocol(e.to_string()))?;
                Ok(Unit::Status(code))
            }
            FrameKind::Header => Ok(Unit::Header(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            )),
            FrameKind::Body => Ok(Unit::Body(frame.payload)),
            FrameKind::End => Ok(Unit::End),
            FrameKind::Error => Err(MuxError::Protocol("error frame on exchange".to_string())),
        }
    }
}

type ExchangeMap = Arc<Mutex<HashMap<ExchangeId, mpsc::UnboundedSender<Unit>>>>;

/// Sends response/request units for one exchange into the shared
/// outbound queue.
#[derive(Debug, Clone)]
pub struct ExchangeSender {
    id: ExchangeId,
    out_tx: mpsc::Sender<Frame>,
    status_sent: Arc<AtomicBool>,
}

impl ExchangeSender {
    async fn send(&self, frame: Frame) -> Result<(), ConnectionClosed> {
        self.out_tx.send(frame).await.map_err(|_| ConnectionClosed)
    }

    /// Emit a status code unit.
    pub async fn send_status(&self, code: u16) -> Result<(), ConnectionClosed> {
        self.status_sent.store(true, Ordering::Relaxed);
        self.send(Frame::status(self.id, code)).await
    }

    /// Whether a status unit was already emitted on this exchange.
    ///
    /// A response carries exactly one status; callers that fail after
    /// emitting it must terminate the exchange instead of sending a
    /// second one.
    pub fn status_sent(&self) -> bool {
        self.status_sent.load(Ordering::Relaxed)
    }

    /// Emit a header block unit.
    pub async fn send_header(&self, block: &str) -> Result<(), ConnectionClosed> {
        self.send(Frame::header(self.id, block)).await
    }

    /// Emit a body unit.
    pub async fn send_body(&self, data: Bytes) -> Result<(), ConnectionClosed> {
        self.send(Frame::body(self.id, data)).await
    }

    /// Emit the terminator, completing this side of the exchange.
    pub async fn finish(&self) -> Result<(), ConnectionClosed> {
        self.send(Frame::end(self.id)).await
    }
}

/// An inbound exchange handed to an [`ExchangeHandler`].
///
/// Exactly one handler invocation owns it: the command line, the ordered
/// inbound queue (headers/body/terminator), and the outbound sender.
#[derive(Debug)]
pub struct ServerExchange {
    id: ExchangeId,
    /// The command line that opened this exchange.
    pub command: String,
    inbound: mpsc::UnboundedReceiver<Unit>,
    sender: ExchangeSender,
}

impl ServerExchange {
    /// Exchange id, for logging.
    pub fn id(&self) -> ExchangeId {
        self.id
    }

    /// Outbound sender for this exchange.
    pub fn sender(&self) -> &ExchangeSender {
        &self.sender
    }

    /// Receive the next inbound unit; `None` when the connection dropped.
    pub async fn recv_unit(&mut self) -> Option<Unit> {
        self.inbound.recv().await
    }

    /// Consume and discard inbound units up to and including the
    /// terminator.
    pub async fn drain_request(&mut self) {
        while let Some(unit) = self.inbound.recv().await {
            if unit == Unit::End {
                break;
            }
        }
    }

    /// Collect the inbound body into one buffer, discarding header
    /// units, up to the terminator.
    pub async fn read_body(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        while let Some(unit) = self.inbound.recv().await {
            match unit {
                Unit::Body(data) => body.extend_from_slice(&data),
                Unit::End => break,
                _ => {}
            }
        }
        body
    }
}

/// Handles one inbound exchange. Implementations are shared across all
/// concurrent exchanges of a connection.
#[async_trait]
pub trait ExchangeHandler: Send + Sync {
    /// Run one exchange to completion. The implementation must emit the
    /// terminator on every exit path.
    async fn handle(&self, exchange: ServerExchange);
}

/// Handler that refuses every inbound exchange with 501.
///
/// Used on connection sides that never accept commands (an initiator
/// peer, or the relay side of an agent link).
#[derive(Debug, Default)]
pub struct RejectHandler;

#[async_trait]
impl ExchangeHandler for RejectHandler {
    async fn handle(&self, mut exchange: ServerExchange) {
        log::warn!(
            "[Mux] Rejecting unexpected command on exchange {}: {}",
            exchange.id(),
            exchange.command
        );
        exchange.drain_request().await;
        let sender = exchange.sender().clone();
        let _ = sender.send_status(501).await;
        let _ = sender.send_header("Content-Length: 0").await;
        let _ = sender.finish().await;
    }
}

/// An exchange initiated locally via [`MuxHandle::open_exchange`].
#[derive(Debug)]
pub struct ClientExchange {
    sender: ExchangeSender,
    inbound: mpsc::UnboundedReceiver<Unit>,
}

impl ClientExchange {
    /// Exchange id, for logging.
    pub fn id(&self) -> ExchangeId {
        self.sender.id
    }

    /// Send a request header block.
    pub async fn send_header(&self, block: &str) -> Result<(), ConnectionClosed> {
        self.sender.send_header(block).await
    }

    /// Send a chunk of the request body.
    pub async fn send_body(&self, data: Bytes) -> Result<(), ConnectionClosed> {
        self.sender.send_body(data).await
    }

    /// Terminate the request body.
    pub async fn finish(&self) -> Result<(), ConnectionClosed> {
        self.sender.finish().await
    }

    /// Receive the next response unit; `None` when the connection
    /// dropped before the response completed.
    pub async fn recv(&mut self) -> Option<Unit> {
        self.inbound.recv().await
    }
}

/// Cloneable handle for initiating exchanges on a running multiplexer.
#[derive(Debug, Clone)]
pub struct MuxHandle {
    out_tx: mpsc::Sender<Frame>,
    exchanges: ExchangeMap,
    next_id: Arc<AtomicU32>,
}

impl MuxHandle {
    /// Open a new exchange with the given command line.
    pub async fn open_exchange(&self, command: &str) -> Result<ClientExchange, ConnectionClosed> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.exchanges
            .lock()
            .expect("exchange table poisoned")
            .insert(id, tx);

        let sender = ExchangeSender {
            id,
            out_tx: self.out_tx.clone(),
            status_sent: Arc::new(AtomicBool::new(false)),
        };
        if self.out_tx.send(Frame::command(id, command)).await.is_err() {
            self.exchanges
                .lock()
                .expect("exchange table poisoned")
                .remove(&id);
            return Err(ConnectionClosed);
        }
        Ok(ClientExchange { sender, inbound: rx })
    }

    /// Send a connection-level error frame (e.g. the relay's
    /// `no-client` refusal).
    pub async fn send_error(&self, reason: &str) -> Result<(), ConnectionClosed> {
        self.out_tx
            .send(Frame::error(reason))
            .await
            .map_err(|_| ConnectionClosed)
    }
}

/// The multiplexer driving one connection.
#[derive(Debug)]
pub struct Multiplexer {
    out_rx: mpsc::Receiver<Frame>,
    handle: MuxHandle,
}

impl Multiplexer {
    /// Create a multiplexer and its initiator handle.
    pub fn new() -> (Self, MuxHandle) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CHANNEL_BOUND);
        let handle = MuxHandle {
            out_tx,
            exchanges: Arc::new(Mutex::new(HashMap::new())),
            // Exchange 0 is reserved for control frames.
            next_id: Arc::new(AtomicU32::new(1)),
        };
        let initiator = handle.clone();
        (Self { out_rx, handle }, initiator)
    }

    /// Drive the connection until it closes or fails.
    ///
    /// Spawns the write loop, then runs the read loop inline: frames are
    /// attributed to their exchange's inbound queue, and unknown-id
    /// `Command` frames spawn a `handler` task. On return every open
    /// exchange has been aborted.
    pub async fn run<Si, So>(
        self,
        mut sink: Si,
        mut source: So,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<(), MuxError>
    where
        Si: FrameSink + 'static,
        So: FrameSource,
    {
        let Multiplexer { mut out_rx, handle } = self;
        let exchanges = Arc::clone(&handle.exchanges);

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    return Err(MuxError::Transport(e.to_string()));
                }
            }
            Ok(())
        });

        let result = Self::read_loop(&mut source, &handle, handler).await;

        // Abort every open exchange: dropping the inbound senders makes
        // handlers observe end-of-stream.
        exchanges.lock().expect("exchange table poisoned").clear();
        writer.abort();
        result
    }

    async fn read_loop<So: FrameSource>(
        source: &mut So,
        handle: &MuxHandle,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<(), MuxError> {
        loop {
            let frame = match source.recv().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => return Err(MuxError::Transport(e.to_string())),
            };

            if frame.exchange == CONTROL_EXCHANGE {
                if frame.kind == FrameKind::Error {
                    let reason = String::from_utf8_lossy(&frame.payload).into_owned();
                    if reason == NO_CLIENT_REASON {
                        return Err(MuxError::NoClient);
                    }
                    return Err(MuxError::Protocol(reason));
                }
                log::warn!("[Mux] Ignoring {:?} frame on control exchange", frame.kind);
                continue;
            }

            let id = frame.exchange;
            let unit = Unit::from_frame(frame)?;
            let is_end = unit == Unit::End;

            let routed = {
                let table = handle.exchanges.lock().expect("exchange table poisoned");
                table.get(&id).cloned()
            };

            match routed {
                Some(tx) => {
                    let delivered = tx.send(unit).is_ok();
                    if is_end || !delivered {
                        // Inbound side of this exchange is done (or its
                        // consumer went away); forget the id.
                        handle
                            .exchanges
                            .lock()
                            .expect("exchange table poisoned")
                            .remove(&id);
                    }
                }
                None => match unit {
                    Unit::Command(command) => {
                        let (tx, rx) = mpsc::unbounded_channel();
                        handle
                            .exchanges
                            .lock()
                            .expect("exchange table poisoned")
                            .insert(id, tx);
                        let exchange = ServerExchange {
                            id,
                            command,
                            inbound: rx,
                            sender: ExchangeSender {
                                id,
                                out_tx: handle.out_tx.clone(),
                                status_sent: Arc::new(AtomicBool::new(false)),
                            },
                        };
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            handler.handle(exchange).await;
                        });
                    }
                    _ => {
                        log::debug!("[Mux] Dropping unit for unknown exchange {}", id);
                    }
                },
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::pair;
    use super::*;

    /// Echoes the request body back with status 200.
    struct EchoHandler;

    #[async_trait]
    impl ExchangeHandler for EchoHandler {
        async fn handle(&self, mut exchange: ServerExchange) {
            let body = exchange.read_body().await;
            let sender = exchange.sender().clone();
            sender.send_status(200).await.unwrap();
            sender.send_header("Content-Type: text/plain").await.unwrap();
            sender.send_body(Bytes::from(body)).await.unwrap();
            sender.finish().await.unwrap();
        }
    }

    /// Spawn two multiplexers wired back to back; returns the initiator
    /// handle of side A (side B runs `handler`).
    fn spawn_pair(handler: Arc<dyn ExchangeHandler>) -> MuxHandle {
        let ((a_sink, a_source), (b_sink, b_source)) = pair();
        let (a_mux, a_handle) = Multiplexer::new();
        let (b_mux, _) = Multiplexer::new();
        tokio::spawn(a_mux.run(a_sink, a_source, Arc::new(RejectHandler)));
        tokio::spawn(b_mux.run(b_sink, b_source, handler));
        a_handle
    }

    #[tokio::test]
    async fn test_echo_exchange() {
        let handle = spawn_pair(Arc::new(EchoHandler));

        let mut exchange = handle.open_exchange("POST /echo").await.unwrap();
        exchange.send_body(Bytes::from_static(b"hello")).await.unwrap();
        exchange.finish().await.unwrap();

        assert_eq!(exchange.recv().await, Some(Unit::Status(200)));
        assert_eq!(
            exchange.recv().await,
            Some(Unit::Header("Content-Type: text/plain".to_string()))
        );
        assert_eq!(exchange.recv().await, Some(Unit::Body(Bytes::from_static(b"hello"))));
        assert_eq!(exchange.recv().await, Some(Unit::End));
    }

    #[tokio::test]
    async fn test_status_sent_is_shared_across_clones() {
        let (out_tx, _out_rx) = mpsc::channel(4);
        let sender = ExchangeSender {
            id: 1,
            out_tx,
            status_sent: Arc::new(AtomicBool::new(false)),
        };
        let clone = sender.clone();
        assert!(!sender.status_sent());
        sender.send_status(200).await.unwrap();
        assert!(clone.status_sent());
    }

    #[tokio::test]
    async fn test_concurrent_exchanges_are_isolated() {
        let handle = spawn_pair(Arc::new(EchoHandler));

        let mut first = handle.open_exchange("POST /one").await.unwrap();
        let mut second = handle.open_exchange("POST /two").await.unwrap();

        // Bodies sent out of order across the two exchanges.
        second.send_body(Bytes::from_static(b"2")).await.unwrap();
        first.send_body(Bytes::from_static(b"1")).await.unwrap();
        second.finish().await.unwrap();
        first.finish().await.unwrap();

        let mut got_first = Vec::new();
        while let Some(unit) = first.recv().await {
            if let Unit::Body(b) = &unit {
                got_first.extend_from_slice(b);
            }
            if unit == Unit::End {
                break;
            }
        }
        let mut got_second = Vec::new();
        while let Some(unit) = second.recv().await {
            if let Unit::Body(b) = &unit {
                got_second.extend_from_slice(b);
            }
            if unit == Unit::End {
                break;
            }
        }
        assert_eq!(got_first, b"1");
        assert_eq!(got_second, b"2");
    }

    #[tokio::test]
    async fn test_no_client_error_surfaces_distinctly() {
        let ((a_sink, a_source), (mut b_sink, _b_source)) = pair();
        let (a_mux, _) = Multiplexer::new();

        b_sink.send(Frame::error(NO_CLIENT_REASON)).await.unwrap();
        let result = a_mux.run(a_sink, a_source, Arc::new(RejectHandler)).await;
        assert!(matches!(result, Err(MuxError::NoClient)));
    }

    #[tokio::test]
    async fn test_clean_close_aborts_open_exchange() {
        let ((a_sink, a_source), (b_sink, _b_source)) = pair();
        let (a_mux, handle) = Multiplexer::new();
        let driver = tokio::spawn(a_mux.run(a_sink, a_source, Arc::new(RejectHandler)));

        let mut exchange = handle.open_exchange("GET /x").await.unwrap();
        // Dropping the peer's sink closes the connection.
        drop(b_sink);

        assert_eq!(exchange.recv().await, None);
        assert!(driver.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unit_for_unknown_exchange_is_dropped() {
        let ((a_sink, a_source), (mut b_sink, mut b_source)) = pair();
        let (a_mux, _) = Multiplexer::new();
        tokio::spawn(a_mux.run(a_sink, a_source, Arc::new(EchoHandler)));

        // Body for an exchange that was never opened: ignored.
        b_sink.send(Frame::body(42, Bytes::from_static(b"stray"))).await.unwrap();
        // A real exchange still works afterwards.
        b_sink.send(Frame::command(1, "POST /echo")).await.unwrap();
        b_sink.send(Frame::body(1, Bytes::from_static(b"ok"))).await.unwrap();
        b_sink.send(Frame::end(1)).await.unwrap();

        let mut units = Vec::new();
        while let Some(frame) = b_source.recv().await.unwrap() {
            let unit = Unit::from_frame(frame).unwrap();
            let done = unit == Unit::End;
            units.push(unit);
            if done {
                break;
            }
        }
        assert_eq!(units[0], Unit::Status(200));
        assert!(units.contains(&Unit::Body(Bytes::from_static(b"ok"))));
    }
}
