//! WebSocket transport: connection setup and frame adapters.
//!
//! Both connection roles speak the same framing: JSON text messages for
//! the handshake and subscriber notifications, one binary message per
//! protocol frame afterwards. [`WsFrameSink`] / [`WsFrameSource`] adapt
//! the split halves of a socket to the multiplexer's transport traits.

use anyhow::Context;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};

use crate::mux::{FrameSink, FrameSource};
use crate::wire::Frame;

/// Outbound-connected socket (agent and editor side).
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Accepted socket (relay side).
pub type ServerStream = WebSocketStream<TcpStream>;

/// Dial a WebSocket URL.
pub async fn connect(url: &str) -> anyhow::Result<ClientStream> {
    let (stream, _response) = connect_async(url)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    Ok(stream)
}

/// Accept a WebSocket upgrade on an inbound TCP connection, capturing
/// the request path so the caller can route it.
pub async fn accept(stream: TcpStream) -> anyhow::Result<(ServerStream, String)> {
    let mut path = String::new();
    let stream = accept_hdr_async(stream, |request: &Request, response: Response| {
        path = request.uri().path().to_string();
        Ok(response)
    })
    .await
    .context("WebSocket handshake failed")?;
    Ok((stream, path))
}

/// Send a value as a JSON text message.
pub async fn send_json<S, T>(socket: &mut WebSocketStream<S>, value: &T) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(value).context("Failed to serialize message")?;
    socket
        .send(Message::Text(json))
        .await
        .context("Failed to send message")?;
    Ok(())
}

/// Receive the next JSON text message, skipping keep-alive frames.
///
/// Errors if the socket closes or delivers a non-text data message
/// before any text arrives.
pub async fn recv_json<S, T>(socket: &mut WebSocketStream<S>) -> anyhow::Result<T>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    loop {
        let message = socket
            .next()
            .await
            .context("Connection closed before message arrived")?
            .context("Failed to read message")?;
        match message {
            Message::Text(text) => {
                return serde_json::from_str(&text).context("Failed to parse message")
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => anyhow::bail!("Expected a text message, got {other:?}"),
        }
    }
}

/// Split a socket into the multiplexer's sink/source halves.
pub fn split_frames<S>(socket: WebSocketStream<S>) -> (WsFrameSink<S>, WsFrameSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, source) = socket.split();
    (WsFrameSink(sink), WsFrameSource(source))
}

/// Write half: one binary message per frame.
pub struct WsFrameSink<S>(SplitSink<WebSocketStream<S>, Message>);

/// Read half: decodes binary messages, skips keep-alives, treats close
/// as end-of-stream.
pub struct WsFrameSource<S>(SplitStream<WebSocketStream<S>>);

#[async_trait]
impl<S> FrameSink for WsFrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Frame) -> anyhow::Result<()> {
        self.0
            .send(Message::Binary(frame.encode()))
            .await
            .context("Failed to send frame")?;
        Ok(())
    }
}

#[async_trait]
impl<S> FrameSource for WsFrameSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> anyhow::Result<Option<Frame>> {
        loop {
            let Some(message) = self.0.next().await else {
                return Ok(None);
            };
            match message.context("Failed to read frame")? {
                Message::Binary(data) => {
                    let frame = Frame::decode(&data).context("Malformed frame")?;
                    return Ok(Some(frame));
                }
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Text(text) => {
                    log::debug!("[Ws] Ignoring unexpected text message: {text}");
                }
                Message::Frame(_) => continue,
            }
        }
    }
}

/// Rewrite an `http(s)://` URL to its `ws(s)://` equivalent.
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// Rewrite a `ws(s)://` URL to its `http(s)://` equivalent.
pub fn ws_to_http_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        url.to_string()
    }
}
