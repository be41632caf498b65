//! In-memory remote filesystem speaking the [`ProtocolClient`] contract.
//!
//! Used to exercise sessions, queues and the registry without a network.
//! Supports fault injection (login refusal, failed connects and listings,
//! per-chunk latency) and records how many protocol operations ever ran at
//! the same instant against one server.

use crate::ftp::client::{Connector, ProtocolClient};
use crate::ftp::config::RetryConfig;
use crate::ftp::control::TransferControl;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{join_remote, DirectoryEntry, ServerIdentity};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ─── Server state ────────────────────────────────────────────────────

struct ServerState {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    password: Option<String>,
    fail_connects: u32,
    fail_lists: u32,
    chunk_delay: Duration,
    op_delay: Duration,
    connects: usize,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            dirs: BTreeSet::from(["/".to_string()]),
            files: BTreeMap::new(),
            password: None,
            fail_connects: 0,
            fail_lists: 0,
            chunk_delay: Duration::ZERO,
            op_delay: Duration::ZERO,
            connects: 0,
        }
    }
}

/// Shared remote filesystem; clones point at the same server.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
    in_flight: Arc<AtomicUsize>,
    max_overlap: Arc<AtomicUsize>,
    open_clients: Arc<AtomicUsize>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ServerState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Create a directory (and its parents).
    pub fn add_dir(&self, path: &str) {
        let path = resolve("/", path);
        self.with_state(|s| {
            let mut current = String::new();
            for part in path.split('/').filter(|p| !p.is_empty()) {
                current.push('/');
                current.push_str(part);
                s.dirs.insert(current.clone());
            }
        });
    }

    pub fn put_file(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        let path = resolve("/", path);
        let (parent, _) = split_parent(&path);
        self.add_dir(&parent);
        self.with_state(|s| s.files.insert(path, bytes.into()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        let path = resolve("/", path);
        self.with_state(|s| s.files.get(&path).cloned())
    }

    pub fn require_password(&self, password: &str) {
        self.with_state(|s| s.password = Some(password.to_string()));
    }

    /// The next `n` connects fail with a transient transport error.
    pub fn fail_next_connects(&self, n: u32) {
        self.with_state(|s| s.fail_connects = n);
    }

    /// The next `n` listings are rejected with 450.
    pub fn fail_next_lists(&self, n: u32) {
        self.with_state(|s| s.fail_lists = n);
    }

    /// Sleep between transferred chunks.
    pub fn set_chunk_delay(&self, delay: Duration) {
        self.with_state(|s| s.chunk_delay = delay);
    }

    /// Sleep at the start of every operation.
    pub fn set_op_delay(&self, delay: Duration) {
        self.with_state(|s| s.op_delay = delay);
    }

    /// Connection attempts seen, successful or not.
    pub fn connect_count(&self) -> usize {
        self.with_state(|s| s.connects)
    }

    /// Clients currently connected.
    pub fn open_clients(&self) -> usize {
        self.open_clients.load(Ordering::SeqCst)
    }

    /// Highest number of operations ever in flight at once.
    pub fn max_overlap(&self) -> usize {
        self.max_overlap.load(Ordering::SeqCst)
    }

    async fn begin_op(&self) -> OpGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_overlap.fetch_max(now, Ordering::SeqCst);
        let guard = OpGuard {
            in_flight: self.in_flight.clone(),
        };
        let delay = self.with_state(|s| s.op_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        guard
    }
}

struct OpGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// ─── Client ──────────────────────────────────────────────────────────

pub struct MemoryClient {
    server: MemoryServer,
    host: String,
    current_path: String,
    server_dir: String,
    closed: bool,
}

impl MemoryClient {
    /// Log in to `server`, retrying injected connect failures like the real client.
    pub async fn connect(
        server: MemoryServer,
        identity: &ServerIdentity,
        retry: &RetryConfig,
    ) -> FtpResult<Self> {
        let mut attempt = 0;
        loop {
            match Self::connect_once(&server, identity) {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < retry.max_retries => {
                    tokio::time::sleep(retry.backoff_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(FtpError::connection(format!(
                        "Could not connect to {} after {} attempt(s): {}",
                        identity.host,
                        attempt + 1,
                        e.message
                    ))
                    .with_host(identity.host.clone()))
                }
                Err(e) => return Err(e.with_host(identity.host.clone())),
            }
        }
        server.open_clients.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            server,
            host: identity.host.clone(),
            current_path: "/".into(),
            server_dir: "/".into(),
            closed: false,
        })
    }

    fn connect_once(server: &MemoryServer, identity: &ServerIdentity) -> FtpResult<()> {
        server.with_state(|s| {
            s.connects += 1;
            if s.fail_connects > 0 {
                s.fail_connects -= 1;
                return Err(FtpError::transport("Connection refused"));
            }
            match &s.password {
                Some(expected) if *expected != identity.password => {
                    Err(FtpError::connection("Login incorrect").with_code(530))
                }
                _ => Ok(()),
            }
        })
    }

    fn ensure_open(&self) -> FtpResult<()> {
        if self.closed {
            return Err(FtpError::transport("Connection closed"));
        }
        Ok(())
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        if !self.closed {
            self.server.open_clients.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ProtocolClient for MemoryClient {
    fn host(&self) -> &str {
        &self.host
    }

    fn current_path(&self) -> &str {
        &self.current_path
    }

    async fn enter_directory(&mut self, path: &str) -> FtpResult<String> {
        self.ensure_open()?;
        let _op = self.server.begin_op().await;
        let target = resolve(&self.server_dir, path);
        if self.server.with_state(|s| s.dirs.contains(&target)) {
            self.server_dir = target.clone();
            Ok(target)
        } else {
            Err(FtpError::from_reply(550, &format!("{}: No such directory", target)))
        }
    }

    fn commit_path(&mut self, path: String) {
        self.current_path = path;
    }

    async fn list(&mut self) -> FtpResult<Vec<DirectoryEntry>> {
        self.ensure_open()?;
        let _op = self.server.begin_op().await;
        let dir = self.server_dir.clone();
        self.server.with_state(|s| {
            if s.fail_lists > 0 {
                s.fail_lists -= 1;
                return Err(FtpError::from_reply(450, "Listing temporarily unavailable"));
            }
            let mut entries: Vec<DirectoryEntry> = s
                .dirs
                .iter()
                .filter(|d| d.as_str() != "/" && split_parent(d).0 == dir)
                .map(|d| DirectoryEntry::directory(split_parent(d).1, dir.clone()))
                .collect();
            entries.extend(
                s.files
                    .iter()
                    .filter(|(p, _)| split_parent(p).0 == dir)
                    .map(|(p, bytes)| DirectoryEntry::file(split_parent(p).1, bytes.len() as u64, dir.clone())),
            );
            Ok(entries)
        })
    }

    async fn fetch(
        &mut self,
        remote_path: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        ctl: &mut TransferControl,
    ) -> FtpResult<u64> {
        self.ensure_open()?;
        let _op = self.server.begin_op().await;
        let path = resolve(&self.server_dir, remote_path);
        let (bytes, delay) = self.server.with_state(|s| (s.files.get(&path).cloned(), s.chunk_delay));
        let bytes = bytes.ok_or_else(|| FtpError::from_reply(550, &format!("{}: No such file", path)))?;
        ctl.set_total(bytes.len() as u64);

        let mut written = 0u64;
        for chunk in bytes.chunks(ctl.chunk_size()) {
            if ctl.is_cancelled() {
                return Err(FtpError::cancelled("Download cancelled"));
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            sink.write_all(chunk)
                .await
                .map_err(|e| FtpError::local_io(format!("Writing download: {}", e)))?;
            written += chunk.len() as u64;
            ctl.advance(chunk.len());
        }
        sink.flush()
            .await
            .map_err(|e| FtpError::local_io(format!("Flushing download: {}", e)))?;
        ctl.finish();
        Ok(written)
    }

    async fn store(
        &mut self,
        remote_path: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
        ctl: &mut TransferControl,
    ) -> FtpResult<u64> {
        self.ensure_open()?;
        let _op = self.server.begin_op().await;
        let path = resolve(&self.server_dir, remote_path);
        let (parent, _) = split_parent(&path);
        let (parent_exists, delay) = self.server.with_state(|s| (s.dirs.contains(&parent), s.chunk_delay));
        if !parent_exists {
            return Err(FtpError::from_reply(553, &format!("{}: No such directory", parent)));
        }

        let mut received = Vec::new();
        let mut buf = vec![0u8; ctl.chunk_size()];
        loop {
            if ctl.is_cancelled() {
                return Err(FtpError::cancelled("Upload cancelled"));
            }
            let n = source
                .read(&mut buf)
                .await
                .map_err(|e| FtpError::local_io(format!("Reading upload source: {}", e)))?;
            if n == 0 {
                break;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            received.extend_from_slice(&buf[..n]);
            ctl.advance(n);
        }

        let len = received.len() as u64;
        self.server.with_state(|s| s.files.insert(path, received));
        ctl.finish();
        Ok(len)
    }

    async fn delete_file(&mut self, path: &str) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        let _op = self.server.begin_op().await;
        let path = resolve(&self.server_dir, path);
        self.server.with_state(|s| s.files.remove(&path).is_some())
    }

    async fn keepalive(&mut self) -> FtpResult<()> {
        self.ensure_open()?;
        let _op = self.server.begin_op().await;
        Ok(())
    }

    async fn quit(&mut self) {
        if !self.closed {
            self.closed = true;
            self.server.open_clients.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// ─── Connector ───────────────────────────────────────────────────────

/// Routes hosts to in-memory servers.
#[derive(Default)]
pub struct MemoryConnector {
    servers: Mutex<HashMap<String, MemoryServer>>,
    retry: RetryConfig,
}

impl MemoryConnector {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            retry,
        }
    }

    pub fn add_server(&self, host: &str, server: MemoryServer) {
        self.servers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(host.to_string(), server);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, identity: &ServerIdentity) -> FtpResult<Box<dyn ProtocolClient>> {
        let server = self
            .servers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&identity.host)
            .cloned()
            .ok_or_else(|| {
                FtpError::connection(format!("Unknown host {}", identity.host)).with_host(identity.host.clone())
            })?;
        let client = MemoryClient::connect(server, identity, &self.retry).await?;
        Ok(Box::new(client))
    }
}

// ─── Sink ────────────────────────────────────────────────────────────

/// Cloneable in-memory `AsyncWrite`; clones share the buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AsyncWrite for MemorySink {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        self.buf
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ─── Paths ───────────────────────────────────────────────────────────

/// Resolve `path` against `base`, folding `.` and `..`.
fn resolve(base: &str, path: &str) -> String {
    let joined = join_remote(base, path);
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

fn split_parent(path: &str) -> (String, &str) {
    match path.rfind('/') {
        Some(0) => ("/".to_string(), &path[1..]),
        Some(i) => (path[..i].to_string(), &path[i + 1..]),
        None => ("/".to_string(), path),
    }
}
