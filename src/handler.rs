//! Resource handler: the fixed operation set served inside exchanges.
//!
//! One handler instance is bound to a sandbox root and shared by every
//! exchange of a connection. Operations:
//!
//! - `GET path` — directory listing or file bytes
//! - `HEAD path` — metadata only (ETag, type indicator)
//! - `PUT path` — create/replace from the request body
//! - `DELETE path` — remove a file
//! - `POST path` — control actions (`action=filelist`, `action=version`)
//!
//! Every path is resolved lexically against the root before any
//! filesystem access; a resolution escaping the root is a security
//! violation, not a not-found. Writes are serialized per path through
//! the [`WriteLockRegistry`]: readers and deleters wait for an in-flight
//! write, a second concurrent writer fails fast with a conflict.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::locks::WriteLockRegistry;
use crate::mux::{ConnectionClosed, ExchangeHandler, ExchangeSender, ServerExchange, Unit};
use crate::PROTOCOL_VERSION;

/// File read chunk size for streaming GET bodies.
const CHUNK_SIZE: usize = 64 * 1024;

/// A failed operation, mapped to a status code by the exchange wrapper.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Path resolution escaped the sandbox root.
    #[error("path escapes the served root")]
    Security,
    /// Target does not exist.
    #[error("Not found")]
    NotFound,
    /// A write is already in flight for this path.
    #[error("write already in progress")]
    WriteConflict,
    /// Request body is not a parseable URL-encoded form.
    #[error("could not parse body as a form")]
    BadForm,
    /// Unknown method or action.
    #[error("not implemented")]
    NotImplemented,
    /// Underlying I/O failure.
    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    /// Numeric status code for the wire.
    pub fn status(&self) -> u16 {
        match self {
            HandlerError::Security => 403,
            HandlerError::NotFound => 404,
            HandlerError::WriteConflict => 409,
            HandlerError::BadForm => 400,
            HandlerError::NotImplemented => 501,
            HandlerError::Internal(_) => 500,
        }
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        HandlerError::Internal(err.to_string())
    }
}

impl From<ConnectionClosed> for HandlerError {
    fn from(_: ConnectionClosed) -> Self {
        HandlerError::Internal("connection closed".to_string())
    }
}

/// Serves the operation set against one sandbox root.
#[derive(Debug)]
pub struct ResourceHandler {
    root: PathBuf,
    locks: Arc<WriteLockRegistry>,
}

#[async_trait]
impl ExchangeHandler for ResourceHandler {
    async fn handle(&self, mut exchange: ServerExchange) {
        let command = exchange.command.clone();
        let (method, path) = parse_command(&command);
        log::debug!("[Handler] {} /{} (exchange {})", method, path, exchange.id());

        let result = match method {
            "GET" => self.get(&path, &mut exchange).await,
            "HEAD" => self.head(&path, &mut exchange).await,
            "PUT" => self.put(&path, &mut exchange).await,
            "DELETE" => self.delete(&path, &mut exchange).await,
            "POST" => self.post(&path, &mut exchange).await,
            _ => {
                exchange.drain_request().await;
                Err(HandlerError::NotImplemented)
            }
        };

        let sender = exchange.sender().clone();
        if let Err(err) = result {
            if sender.status_sent() {
                // A response carries exactly one status unit; a failure
                // this late can only terminate the exchange.
                log::warn!("[Handler] {} /{} failed mid-response: {}", method, path, err);
            } else {
                log::debug!("[Handler] {} /{} failed: {}", method, path, err);
                // HEAD responses never carry a body, even for errors.
                send_error(&sender, &err, method != "HEAD").await;
            }
        }
        let _ = sender.finish().await;
    }
}

/// Translate a failure into status + headers (+ message body).
async fn send_error(sender: &ExchangeSender, err: &HandlerError, with_body: bool) {
    if sender.send_status(err.status()).await.is_err() {
        return;
    }
    if with_body {
        let _ = sender.send_header("Content-Type: text/plain").await;
        let _ = sender.send_body(Bytes::from(err.to_string())).await;
    } else {
        let _ = sender.send_header("Content-Length: 0").await;
    }
}

/// Split a command line into method and root-relative path.
fn parse_command(line: &str) -> (&str, String) {
    let (method, rest) = line.split_once(' ').unwrap_or((line, ""));
    (method, rest.trim_start_matches('/').to_string())
}

impl ResourceHandler {
    /// Bind a handler to `root` (already absolute) and a lock registry.
    pub fn new(root: PathBuf, locks: Arc<WriteLockRegistry>) -> Self {
        Self { root, locks }
    }

    /// Resolve a logical path to an absolute path under the root.
    ///
    /// Resolution is purely lexical — no filesystem access — so escapes
    /// are rejected before anything touches the disk.
    fn safe_path(&self, logical: &str) -> Result<PathBuf, HandlerError> {
        let mut resolved = self.root.clone();
        for component in Path::new(logical).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir => {
                    if !resolved.pop() || !resolved.starts_with(&self.root) {
                        return Err(HandlerError::Security);
                    }
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
        if !resolved.starts_with(&self.root) {
            return Err(HandlerError::Security);
        }
        Ok(resolved)
    }

    async fn get(&self, path: &str, exchange: &mut ServerExchange) -> Result<(), HandlerError> {
        let resolved = self.safe_path(path);
        exchange.drain_request().await;
        let abs = resolved?;
        self.locks.wait_if_locked(&abs).await;

        let meta = fs::metadata(&abs)
            .await
            .map_err(|_| HandlerError::NotFound)?;
        let sender = exchange.sender().clone();

        if meta.is_dir() {
            let mut entries = fs::read_dir(&abs).await?;
            sender.send_status(200).await?;
            sender.send_header("Content-Type: text/plain").await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let line = if entry.file_type().await?.is_dir() {
                    format!("{name}/\n")
                } else {
                    format!("{name}\n")
                };
                sender.send_body(Bytes::from(line)).await?;
            }
        } else {
            let mut file = fs::File::open(&abs)
                .await
                .map_err(|_| HandlerError::Internal("could not open file".to_string()))?;
            sender.send_status(200).await?;
            sender
                .send_header(&format!(
                    "Content-Type: {}\nETag: {}",
                    mime_for_path(&abs),
                    etag(&meta)
                ))
                .await?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                sender.send_body(Bytes::copy_from_slice(&buf[..n])).await?;
            }
        }
        Ok(())
    }

    async fn head(&self, path: &str, exchange: &mut ServerExchange) -> Result<(), HandlerError> {
        let resolved = self.safe_path(path);
        exchange.drain_request().await;
        let abs = resolved?;
        self.locks.wait_if_locked(&abs).await;

        let meta = fs::metadata(&abs)
            .await
            .map_err(|_| HandlerError::NotFound)?;
        let file_type = if meta.is_dir() { "directory" } else { "file" };
        let sender = exchange.sender().clone();
        sender.send_status(200).await?;
        sender
            .send_header(&format!(
                "ETag: {}\nContent-Length: 0\nX-Type: {}",
                etag(&meta),
                file_type
            ))
            .await?;
        Ok(())
    }

    async fn put(&self, path: &str, exchange: &mut ServerExchange) -> Result<(), HandlerError> {
        let abs = match self.safe_path(path) {
            Ok(abs) => abs,
            Err(err) => {
                exchange.drain_request().await;
                return Err(err);
            }
        };

        // The root itself is never a writable target; its temp sibling
        // would land outside the sandbox.
        if abs == self.root {
            exchange.drain_request().await;
            return Err(HandlerError::Security);
        }

        // Fail fast on a concurrent writer; only readers wait.
        let Some(_guard) = self.locks.acquire(abs.clone()) else {
            exchange.drain_request().await;
            return Err(HandlerError::WriteConflict);
        };

        let parent = abs.parent().ok_or(HandlerError::Security)?.to_path_buf();
        let file_name = abs
            .file_name()
            .ok_or(HandlerError::Security)?
            .to_string_lossy()
            .into_owned();
        if fs::metadata(&abs).await.is_ok_and(|m| m.is_dir()) {
            exchange.drain_request().await;
            return Err(HandlerError::Internal("target is a directory".to_string()));
        }
        fs::create_dir_all(&parent).await?;

        // Stream the body to a same-directory temp file, then atomically
        // rename it over the target so readers see either the old or the
        // new content, never a truncated one.
        let temp = parent.join(format!(".{file_name}.tmp.{}", Uuid::new_v4()));
        if let Err(err) = self.write_body(exchange, &temp, &abs).await {
            let _ = fs::remove_file(&temp).await;
            exchange.drain_request().await;
            return Err(err);
        }

        let meta = fs::metadata(&abs).await?;
        let sender = exchange.sender().clone();
        sender.send_status(200).await?;
        sender
            .send_header(&format!("Content-Type: text/plain\nETag: {}", etag(&meta)))
            .await?;
        sender.send_body(Bytes::from_static(b"OK")).await?;
        Ok(())
    }

    async fn write_body(
        &self,
        exchange: &mut ServerExchange,
        temp: &Path,
        target: &Path,
    ) -> Result<(), HandlerError> {
        let mut file = fs::File::create(temp)
            .await
            .map_err(|_| HandlerError::Internal(format!("could not create {}", temp.display())))?;
        loop {
            match exchange.recv_unit().await {
                Some(Unit::Body(data)) => file
                    .write_all(&data)
                    .await
                    .map_err(|_| HandlerError::Internal("could not write to file".to_string()))?,
                Some(Unit::End) => break,
                Some(_) => {}
                None => {
                    return Err(HandlerError::Internal(
                        "connection dropped mid-write".to_string(),
                    ))
                }
            }
        }
        file.sync_all().await?;
        drop(file);

        // Keep the permission bits of a pre-existing target.
        if let Ok(meta) = fs::metadata(target).await {
            fs::set_permissions(temp, meta.permissions()).await?;
        }
        fs::rename(temp, target)
            .await
            .map_err(|e| HandlerError::Internal(format!("could not replace target: {e}")))?;
        Ok(())
    }

    async fn delete(&self, path: &str, exchange: &mut ServerExchange) -> Result<(), HandlerError> {
        let resolved = self.safe_path(path);
        exchange.drain_request().await;
        let abs = resolved?;
        self.locks.wait_if_locked(&abs).await;

        let meta = fs::metadata(&abs)
            .await
            .map_err(|_| HandlerError::NotFound)?;
        // Files and empty directories; a populated directory is an error.
        let removed = if meta.is_dir() {
            fs::remove_dir(&abs).await
        } else {
            fs::remove_file(&abs).await
        };
        removed.map_err(|_| HandlerError::Internal("could not delete".to_string()))?;

        let sender = exchange.sender().clone();
        sender.send_status(200).await?;
        sender.send_header("Content-Type: text/plain").await?;
        sender.send_body(Bytes::from_static(b"OK")).await?;
        Ok(())
    }

    async fn post(&self, path: &str, exchange: &mut ServerExchange) -> Result<(), HandlerError> {
        let resolved = self.safe_path(path);
        let body = exchange.read_body().await;
        let abs = resolved?;
        fs::metadata(&abs)
            .await
            .map_err(|_| HandlerError::NotFound)?;

        let body = std::str::from_utf8(&body).map_err(|_| HandlerError::BadForm)?;
        let form = parse_form(body)?;
        let action = form
            .iter()
            .find(|(key, _)| key == "action")
            .map(|(_, value)| value.as_str())
            .ok_or(HandlerError::BadForm)?;

        let sender = exchange.sender().clone();
        match action {
            "filelist" => {
                // Walk before emitting the status so a failing walk
                // cannot corrupt an already-started response.
                let listing = collect_file_list(&abs).await;
                sender.send_status(200).await?;
                sender.send_header("Content-Type: text/plain").await?;
                for line in listing {
                    sender.send_body(Bytes::from(line)).await?;
                }
            }
            "version" => {
                sender.send_status(200).await?;
                sender.send_header("Content-Type: text/plain").await?;
                sender.send_body(Bytes::from_static(PROTOCOL_VERSION.as_bytes())).await?;
            }
            _ => return Err(HandlerError::NotImplemented),
        }
        Ok(())
    }

}

/// Every file under `base`, depth first, one `/<relative path>` line per
/// file. Unreadable entries are skipped rather than aborting the walk,
/// so a bad target yields an empty listing.
async fn collect_file_list(base: &Path) -> Vec<String> {
    let mut lines = Vec::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let Ok(mut entries) = fs::read_dir(base.join(&rel)).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let child = rel.join(entry.file_name());
            match entry.file_type().await {
                Ok(file_type) if file_type.is_dir() => stack.push(child),
                Ok(_) => lines.push(format!("/{}\n", child.display())),
                Err(_) => {}
            }
        }
    }
    lines
}

/// ETag derived from the modification time (milliseconds since epoch).
fn etag(meta: &std::fs::Metadata) -> String {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis().to_string())
        .unwrap_or_else(|| "0".to_string())
}

/// Content type by file extension, `application/octet-stream` otherwise.
fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    match ext {
        "txt" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Parse a URL-encoded form body into key/value pairs.
fn parse_form(body: &str) -> Result<Vec<(String, String)>, HandlerError> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Ok((url_decode(key)?, url_decode(value)?))
        })
        .collect()
}

fn url_decode(input: &str) -> Result<String, HandlerError> {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.bytes();
    while let Some(byte) = bytes.next() {
        match byte {
            b'+' => out.push(b' '),
            b'%' => {
                let hi = bytes.next().ok_or(HandlerError::BadForm)?;
                let lo = bytes.next().ok_or(HandlerError::BadForm)?;
                let hex = [hi, lo];
                let hex = std::str::from_utf8(&hex).map_err(|_| HandlerError::BadForm)?;
                out.push(u8::from_str_radix(hex, 16).map_err(|_| HandlerError::BadForm)?);
            }
            other => out.push(other),
        }
    }
    String::from_utf8(out).map_err(|_| HandlerError::BadForm)
}
