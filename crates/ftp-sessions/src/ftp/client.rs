//! Protocol client seam and the RFC 959 implementation behind it.
//!
//! Lifecycle of [`FtpClient`]: `connect()` → banner → USER/PASS →
//! FEAT query → PWD → `TYPE I`. Connect and list are retried with bounded
//! backoff on transient failures; fetch and store never are, since a partial
//! write must not be duplicated.

use crate::ftp::config::RetryConfig;
use crate::ftp::connection;
use crate::ftp::control::TransferControl;
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::parser;
use crate::ftp::protocol::FtpCodec;
use crate::ftp::transfer;
use crate::ftp::types::*;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

// ─── Seams ───────────────────────────────────────────────────────────

/// Primitive operations against one authenticated remote endpoint.
///
/// Implementations are driven by exactly one caller at a time; the owning
/// session serializes access.
#[async_trait]
pub trait ProtocolClient: Send {
    fn host(&self) -> &str;

    /// Path of the last successful navigation.
    fn current_path(&self) -> &str;

    /// Change the remote working directory and return the resolved path.
    /// Does not touch [`ProtocolClient::current_path`].
    async fn enter_directory(&mut self, path: &str) -> FtpResult<String>;

    fn commit_path(&mut self, path: String);

    /// List the remote working directory.
    async fn list(&mut self) -> FtpResult<Vec<DirectoryEntry>>;

    /// Stream a remote file into `sink`; returns bytes written.
    async fn fetch(
        &mut self,
        remote_path: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        ctl: &mut TransferControl,
    ) -> FtpResult<u64>;

    /// Stream `source` into a remote file; returns bytes read.
    async fn store(
        &mut self,
        remote_path: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
        ctl: &mut TransferControl,
    ) -> FtpResult<u64>;

    /// `false` on any rejection or transport failure; never errors.
    async fn delete_file(&mut self, path: &str) -> bool;

    async fn keepalive(&mut self) -> FtpResult<()>;

    async fn quit(&mut self);

    /// Change directory then list it. `current_path` moves only if both
    /// steps succeed; after a failed listing the wire directory is put back.
    async fn change_directory(&mut self, path: &str) -> FtpResult<Vec<DirectoryEntry>> {
        let previous = self.current_path().to_string();
        let resolved = self.enter_directory(path).await?;
        match self.list().await {
            Ok(entries) => {
                self.commit_path(resolved);
                Ok(entries)
            }
            Err(e) => {
                if resolved != previous {
                    if let Err(restore) = self.enter_directory(&previous).await {
                        log::warn!(
                            "{}: could not return to {} after failed listing: {}",
                            self.host(),
                            previous,
                            restore
                        );
                    }
                }
                Err(e)
            }
        }
    }
}

/// A client behind the per-session critical section.
pub type SharedClient = Arc<Mutex<Box<dyn ProtocolClient>>>;

/// Builds connected clients for the registry.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, identity: &ServerIdentity) -> FtpResult<Box<dyn ProtocolClient>>;
}

/// Connector for real FTP servers.
#[derive(Debug, Clone, Default)]
pub struct FtpConnector {
    pub retry: RetryConfig,
}

impl FtpConnector {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }
}

#[async_trait]
impl Connector for FtpConnector {
    async fn connect(&self, identity: &ServerIdentity) -> FtpResult<Box<dyn ProtocolClient>> {
        let client = FtpClient::connect(identity.clone(), self.retry.clone()).await?;
        Ok(Box::new(client))
    }
}

// ─── FtpClient ───────────────────────────────────────────────────────

/// A connected, logged-in FTP control channel.
pub struct FtpClient {
    codec: FtpCodec,
    identity: ServerIdentity,
    retry: RetryConfig,
    features: ServerFeatures,
    banner: String,
    current_path: String,
    /// Working directory on the wire; differs from `current_path` only
    /// while a navigation is in flight.
    server_dir: String,
}

impl FtpClient {
    /// Connect and log in, retrying transient failures.
    pub async fn connect(identity: ServerIdentity, retry: RetryConfig) -> FtpResult<Self> {
        identity.validate()?;
        let mut attempt = 0;
        loop {
            match Self::connect_once(&identity, &retry).await {
                Ok(client) => {
                    log::info!("Connected to {} as {}", identity.address(), identity.username);
                    return Ok(client);
                }
                Err(e) if e.is_transient() && attempt < retry.max_retries => {
                    let delay = retry.backoff_for(attempt);
                    attempt += 1;
                    log::warn!(
                        "Connect to {} failed ({}), retry {}/{} in {:?}",
                        identity.address(),
                        e,
                        attempt,
                        retry.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.kind == FtpErrorKind::Connection => {
                    return Err(e.with_host(identity.host.clone()))
                }
                Err(e) => {
                    return Err(FtpError::connection(format!(
                        "Could not connect to {} after {} attempt(s): {}",
                        identity.address(),
                        attempt + 1,
                        e.message
                    ))
                    .with_host(identity.host.clone()))
                }
            }
        }
    }

    async fn connect_once(identity: &ServerIdentity, retry: &RetryConfig) -> FtpResult<Self> {
        let (mut codec, banner) = connection::connect(identity).await?;

        // ── Authenticate ─────────────────────────────────────────
        let user = codec.execute(&format!("USER {}", identity.username)).await?;
        if user.code == 331 {
            let pass = codec.execute(&format!("PASS {}", identity.password)).await?;
            if !pass.is_completion() {
                return Err(FtpError::connection(format!("Login failed: {}", pass.text()))
                    .with_code(pass.code));
            }
        } else if !user.is_completion() {
            return Err(FtpError::connection(format!("USER rejected: {}", user.text()))
                .with_code(user.code));
        }

        let features = Self::query_features(&mut codec).await;
        if features.utf8 {
            let _ = codec.execute("OPTS UTF8 ON").await;
        }

        let pwd = codec.expect_ok("PWD").await?;
        let cwd = parse_pwd(&pwd.text()).unwrap_or_else(|_| "/".into());
        codec.expect_ok("TYPE I").await?;

        Ok(Self {
            codec,
            identity: identity.clone(),
            retry: retry.clone(),
            features,
            banner: banner.text(),
            current_path: cwd.clone(),
            server_dir: cwd,
        })
    }

    async fn query_features(codec: &mut FtpCodec) -> ServerFeatures {
        let resp = match codec.execute("FEAT").await {
            Ok(r) if r.is_completion() => r,
            _ => return ServerFeatures::default(),
        };

        let raw: Vec<String> = resp
            .lines
            .iter()
            .skip(1)
            .filter(|l| !l.starts_with("211"))
            .map(|l| l.trim().to_uppercase())
            .collect();
        let has = |feat: &str| raw.iter().any(|l| l.starts_with(feat));

        ServerFeatures {
            mlsd: has("MLSD"),
            size: has("SIZE"),
            epsv: has("EPSV"),
            utf8: has("UTF8"),
            raw_features: raw,
        }
    }

    pub fn features(&self) -> &ServerFeatures {
        &self.features
    }

    pub fn banner(&self) -> &str {
        &self.banner
    }

    async fn open_data_channel(&mut self) -> FtpResult<TcpStream> {
        let data_timeout = self.data_timeout();
        transfer::open_data_channel(
            &mut self.codec,
            self.identity.data_channel_mode,
            &self.identity.host,
            data_timeout,
        )
        .await
    }

    fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.identity.data_timeout_sec)
    }

    async fn list_once(&mut self) -> FtpResult<Vec<DirectoryEntry>> {
        let cmd = if self.features.mlsd { "MLSD" } else { "LIST" };
        let mut data = self.open_data_channel().await?;
        let resp = self.codec.execute(cmd).await?;
        if !resp.is_preliminary() && !resp.is_completion() {
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }

        let mut body = Vec::new();
        let read = match timeout(self.data_timeout(), data.read_to_end(&mut body)).await {
            Ok(r) => r.map(|_| ()).map_err(FtpError::from),
            Err(_) => Err(FtpError::timeout("Listing read")),
        };
        drop(data);
        if let Err(e) = read {
            // The listing's completion reply is still pending; consume it
            // before anyone (a retry included) issues the next command.
            if resp.is_preliminary() {
                self.abort_transfer().await;
            }
            return Err(e);
        }

        if resp.is_preliminary() {
            let done = self.codec.read_response().await?;
            if !done.is_completion() {
                return Err(FtpError::from_reply(done.code, &done.text()));
            }
        }

        let text = String::from_utf8_lossy(&body);
        Ok(parser::parse_listing(&text, &self.server_dir))
    }

    async fn size(&mut self, path: &str) -> FtpResult<u64> {
        let resp = self.codec.expect_ok(&format!("SIZE {}", path)).await?;
        let text = resp.text();
        text.split_whitespace()
            .nth(1)
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| FtpError::protocol(format!("Cannot parse SIZE: {}", text)))
    }

    /// Interrupt the running transfer and bring the control channel back
    /// in step.
    ///
    /// The server answers the transfer (426, or 226 if it already finished)
    /// and then the ABOR itself.
    async fn abort_transfer(&mut self) {
        if let Err(e) = self.codec.send_command("ABOR").await {
            log::warn!("{}: ABOR failed: {}", self.identity.host, e);
            return;
        }
        self.drain_abort().await;
    }

    /// Read the transfer's reply and the ABOR reply that follows it.
    async fn drain_abort(&mut self) {
        match self.codec.read_response().await {
            Ok(first) if first.is_completion() => {
                // Either the lone ABOR reply or the transfer's 226 with the
                // ABOR reply still to come.
                let _ = self.codec.read_response_within(Duration::from_millis(500)).await;
            }
            Ok(_) => {
                let _ = self.codec.read_response().await;
            }
            Err(e) => log::warn!("{}: no reply to ABOR: {}", self.identity.host, e),
        }
    }

    /// Remove what an interrupted STOR left behind.
    async fn discard_partial(&mut self, remote_path: &str) {
        if self.delete_file(remote_path).await {
            log::debug!("{}: removed partial upload {}", self.identity.host, remote_path);
        } else {
            log::warn!("{}: could not remove partial upload {}", self.identity.host, remote_path);
        }
    }

    async fn pump_download(
        data: &mut TcpStream,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        ctl: &mut TransferControl,
        data_timeout: Duration,
    ) -> FtpResult<u64> {
        let mut buf = vec![0u8; ctl.chunk_size()];
        let mut transferred = 0u64;
        loop {
            if ctl.is_cancelled() {
                return Err(FtpError::cancelled("Download cancelled"));
            }
            let n = timeout(data_timeout, data.read(&mut buf))
                .await
                .map_err(|_| FtpError::timeout("Data read"))??;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])
                .await
                .map_err(|e| FtpError::local_io(format!("Writing download: {}", e)))?;
            transferred += n as u64;
            ctl.advance(n);
        }
        sink.flush()
            .await
            .map_err(|e| FtpError::local_io(format!("Flushing download: {}", e)))?;
        Ok(transferred)
    }

    async fn pump_upload(
        data: &mut TcpStream,
        source: &mut (dyn AsyncRead + Unpin + Send),
        ctl: &mut TransferControl,
        data_timeout: Duration,
    ) -> FtpResult<u64> {
        let mut buf = vec![0u8; ctl.chunk_size()];
        let mut transferred = 0u64;
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
            timeout(data_timeout, data.write_all(&buf[..n]))
                .await
                .map_err(|_| FtpError::timeout("Data write"))??;
            transferred += n as u64;
            ctl.advance(n);
        }
        data.flush().await?;
        data.shutdown().await?;
        Ok(transferred)
    }
}

#[async_trait]
impl ProtocolClient for FtpClient {
    fn host(&self) -> &str {
        &self.identity.host
    }

    fn current_path(&self) -> &str {
        &self.current_path
    }

    async fn enter_directory(&mut self, path: &str) -> FtpResult<String> {
        self.codec.expect_ok(&format!("CWD {}", path)).await?;
        let pwd = self.codec.expect_ok("PWD").await?;
        let resolved = parse_pwd(&pwd.text())?;
        self.server_dir = resolved.clone();
        Ok(resolved)
    }

    fn commit_path(&mut self, path: String) {
        self.current_path = path;
    }

    async fn list(&mut self) -> FtpResult<Vec<DirectoryEntry>> {
        let mut attempt = 0;
        loop {
            match self.list_once().await {
                Ok(entries) => return Ok(entries),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff_for(attempt);
                    attempt += 1;
                    log::warn!(
                        "{}: listing {} failed ({}), retry {}/{}",
                        self.identity.host,
                        self.server_dir,
                        e,
                        attempt,
                        self.retry.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch(
        &mut self,
        remote_path: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        ctl: &mut TransferControl,
    ) -> FtpResult<u64> {
        if ctl.is_cancelled() {
            return Err(FtpError::cancelled("Download cancelled before start"));
        }
        if self.features.size {
            if let Ok(total) = self.size(remote_path).await {
                ctl.set_total(total);
            }
        }

        let mut data = self.open_data_channel().await?;
        let resp = self.codec.execute(&format!("RETR {}", remote_path)).await?;
        if !resp.is_preliminary() && !resp.is_completion() {
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }

        let data_timeout = self.data_timeout();
        let pumped = Self::pump_download(&mut data, sink, ctl, data_timeout).await;
        drop(data);
        let transferred = match pumped {
            Ok(n) => n,
            Err(e) => {
                self.abort_transfer().await;
                return Err(e);
            }
        };

        if resp.is_preliminary() {
            let done = self.codec.read_response().await?;
            if !done.is_completion() {
                return Err(FtpError::from_reply(done.code, &done.text()));
            }
        }
        ctl.finish();
        log::debug!("{}: fetched {} ({} bytes)", self.identity.host, remote_path, transferred);
        Ok(transferred)
    }

    async fn store(
        &mut self,
        remote_path: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
        ctl: &mut TransferControl,
    ) -> FtpResult<u64> {
        if ctl.is_cancelled() {
            return Err(FtpError::cancelled("Upload cancelled before start"));
        }

        let mut data = self.open_data_channel().await?;
        let resp = self.codec.execute(&format!("STOR {}", remote_path)).await?;
        if !resp.is_preliminary() && !resp.is_completion() {
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }

        let data_timeout = self.data_timeout();
        let pumped = Self::pump_upload(&mut data, source, ctl, data_timeout).await;
        let transferred = match pumped {
            Ok(n) => {
                drop(data);
                n
            }
            Err(e) => {
                // ABOR goes out while the data connection is still open, so
                // the server sees an aborted upload rather than a short one.
                match self.codec.send_command("ABOR").await {
                    Ok(()) => {
                        drop(data);
                        self.drain_abort().await;
                    }
                    Err(send) => {
                        log::warn!("{}: ABOR failed: {}", self.identity.host, send);
                        drop(data);
                    }
                }
                self.discard_partial(remote_path).await;
                return Err(e);
            }
        };

        if resp.is_preliminary() {
            let done = self.codec.read_response().await?;
            if !done.is_completion() {
                return Err(FtpError::from_reply(done.code, &done.text()));
            }
        }
        ctl.finish();
        log::debug!("{}: stored {} ({} bytes)", self.identity.host, remote_path, transferred);
        Ok(transferred)
    }

    async fn delete_file(&mut self, path: &str) -> bool {
        match self.codec.execute(&format!("DELE {}", path)).await {
            Ok(resp) if resp.is_completion() => true,
            Ok(resp) => {
                log::debug!("{}: DELE {} rejected: {}", self.identity.host, path, resp.text());
                false
            }
            Err(e) => {
                log::warn!("{}: DELE {} failed: {}", self.identity.host, path, e);
                false
            }
        }
    }

    async fn keepalive(&mut self) -> FtpResult<()> {
        self.codec.expect_ok("NOOP").await?;
        Ok(())
    }

    async fn quit(&mut self) {
        if let Err(e) = self.codec.execute("QUIT").await {
            log::debug!("{}: QUIT: {}", self.identity.host, e);
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

/// Parse `257 "/some/path"` into the path string.
fn parse_pwd(text: &str) -> FtpResult<String> {
    let start = text.find('"');
    let end = start.and_then(|s| text[s + 1..].find('"').map(|e| s + 1 + e));
    match (start, end) {
        (Some(s), Some(e)) => Ok(text[s + 1..e].to_string()),
        _ => Err(FtpError::protocol(format!("Cannot parse PWD: {}", text))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncBufReadExt, BufReader, ReadBuf};
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    type Files = Arc<Mutex<HashMap<String, Vec<u8>>>>;

    const DIRS: [&str; 4] = ["/", "/pub", "/broken", "/slow"];

    /// Serves one control connection with just enough RFC 959 for the client.
    /// `/broken` accepts CWD but refuses LIST. The first LIST in `/slow`
    /// holds its data connection silent for 1.5s before completing.
    async fn spawn_server(password: &'static str, files: Files) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = stream.into_split();
            let mut lines = BufReader::new(rd).lines();
            wr.write_all(b"220 test server ready\r\n").await.unwrap();

            let mut cwd = String::from("/");
            let mut passive: Option<TcpListener> = None;
            let mut slow_served = false;
            while let Ok(Some(line)) = lines.next_line().await {
                let (cmd, arg) = match line.split_once(' ') {
                    Some((c, a)) => (c.to_string(), a.to_string()),
                    None => (line.clone(), String::new()),
                };
                let target = join_remote(&cwd, &arg);
                let reply: String = match cmd.as_str() {
                    "USER" => "331 password please".into(),
                    "PASS" if arg == password => "230 logged in".into(),
                    "PASS" => "530 login incorrect".into(),
                    "FEAT" => "211-Features:\r\n SIZE\r\n UTF8\r\n211 End".into(),
                    "OPTS" | "TYPE" | "NOOP" => "200 ok".into(),
                    "ABOR" => "226 abort successful".into(),
                    "PWD" => format!("257 \"{}\" is the current directory", cwd),
                    "CWD" if DIRS.contains(&target.as_str()) => {
                        cwd = target;
                        "250 directory changed".into()
                    }
                    "CWD" => "550 no such directory".into(),
                    "SIZE" => {
                        let size = files.lock().unwrap().get(&target).map(Vec::len);
                        match size {
                            Some(n) => format!("213 {}", n),
                            None => "550 no such file".into(),
                        }
                    }
                    "PASV" => {
                        let data = TcpListener::bind("127.0.0.1:0").await.unwrap();
                        let p = data.local_addr().unwrap().port();
                        passive = Some(data);
                        format!("227 Entering Passive Mode (127,0,0,1,{},{})", p / 256, p % 256)
                    }
                    "LIST" if cwd == "/broken" => "450 listing unavailable".into(),
                    "LIST" if cwd == "/slow" && !slow_served => {
                        slow_served = true;
                        wr.write_all(b"150 here comes the listing\r\n").await.unwrap();
                        let (data, _) = passive.take().unwrap().accept().await.unwrap();
                        tokio::time::sleep(Duration::from_millis(1500)).await;
                        drop(data);
                        "226 transfer complete".into()
                    }
                    "LIST" => {
                        wr.write_all(b"150 here comes the listing\r\n").await.unwrap();
                        let (mut data, _) = passive.take().unwrap().accept().await.unwrap();
                        let mut body = String::new();
                        if cwd == "/" {
                            body.push_str("drwxr-xr-x 2 ftp ftp 4096 Jan 01 12:00 pub\r\n");
                        }
                        let dir = format!("{}/", cwd.trim_end_matches('/'));
                        let rows: Vec<(String, usize)> = files
                            .lock()
                            .unwrap()
                            .iter()
                            .filter_map(|(path, bytes)| {
                                let name = path.strip_prefix(&dir)?;
                                (!name.contains('/')).then(|| (name.to_string(), bytes.len()))
                            })
                            .collect();
                        for (name, size) in rows {
                            body.push_str(&format!(
                                "-rw-r--r-- 1 ftp ftp {} Jan 01 12:00 {}\r\n",
                                size, name
                            ));
                        }
                        data.write_all(body.as_bytes()).await.unwrap();
                        drop(data);
                        "226 transfer complete".into()
                    }
                    "RETR" => {
                        let bytes = files.lock().unwrap().get(&target).cloned();
                        match bytes {
                            Some(bytes) => {
                                wr.write_all(b"150 opening data connection\r\n").await.unwrap();
                                let (mut data, _) = passive.take().unwrap().accept().await.unwrap();
                                let sent = data.write_all(&bytes).await;
                                drop(data);
                                match sent {
                                    Ok(()) => "226 transfer complete".into(),
                                    Err(_) => "426 connection closed; transfer aborted".into(),
                                }
                            }
                            None => "550 no such file".into(),
                        }
                    }
                    "STOR" => {
                        wr.write_all(b"150 ok to send data\r\n").await.unwrap();
                        let (mut data, _) = passive.take().unwrap().accept().await.unwrap();
                        let mut bytes = Vec::new();
                        data.read_to_end(&mut bytes).await.unwrap();
                        files.lock().unwrap().insert(target, bytes);
                        "226 transfer complete".into()
                    }
                    "DELE" => {
                        let removed = files.lock().unwrap().remove(&target).is_some();
                        if removed {
                            "250 deleted".into()
                        } else {
                            "550 no such file".into()
                        }
                    }
                    "QUIT" => {
                        let _ = wr.write_all(b"221 bye\r\n").await;
                        break;
                    }
                    _ => "502 not implemented".into(),
                };
                wr.write_all(format!("{}\r\n", reply).as_bytes()).await.unwrap();
            }
        });
        port
    }

    fn identity(port: u16, password: &str) -> ServerIdentity {
        ServerIdentity {
            read_timeout_sec: 5,
            data_timeout_sec: 5,
            connect_timeout_sec: 5,
            ..ServerIdentity::new("127.0.0.1")
                .with_port(port)
                .with_credentials("tester", password)
        }
    }

    /// Download target that raises cancel after its first write.
    struct CancelAfterFirstWrite {
        cancel: watch::Sender<bool>,
        received: Vec<u8>,
    }

    impl AsyncWrite for CancelAfterFirstWrite {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            this.received.extend_from_slice(data);
            this.cancel.send_replace(true);
            Poll::Ready(Ok(data.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Upload source that raises cancel after its first read.
    struct CancelAfterFirstRead {
        cancel: watch::Sender<bool>,
        inner: std::io::Cursor<Vec<u8>>,
    }

    impl AsyncRead for CancelAfterFirstRead {
        fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
            this.cancel.send_replace(true);
            polled
        }
    }

    fn quick_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 10,
            backoff_multiplier: 2.0,
            max_backoff_ms: 50,
        }
    }

    #[test]
    fn pwd_reply() {
        assert_eq!(parse_pwd("257 \"/pub/incoming\" is cwd").unwrap(), "/pub/incoming");
        assert!(parse_pwd("257 no quotes").is_err());
    }

    #[tokio::test]
    async fn login_and_navigate() {
        let port = spawn_server("secret", Files::default()).await;
        let mut client = FtpClient::connect(identity(port, "secret"), quick_retry())
            .await
            .unwrap();
        assert_eq!(client.current_path(), "/");
        assert!(client.features().size);
        assert!(client.banner().contains("ready"));

        let root = client.change_directory("/").await.unwrap();
        assert_eq!(root.len(), 1);
        assert!(root[0].is_directory());

        let entries = client.change_directory("pub").await.unwrap();
        assert!(entries.is_empty());
        assert_eq!(client.current_path(), "/pub");
        client.quit().await;
    }

    #[tokio::test]
    async fn bad_password_is_a_connection_error() {
        let port = spawn_server("secret", Files::default()).await;
        let err = FtpClient::connect(identity(port, "wrong"), quick_retry())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, FtpErrorKind::Connection);
        assert_eq!(err.code, Some(530));
    }

    #[tokio::test]
    async fn unreachable_server_gives_up_after_retries() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let err = FtpClient::connect(identity(port, "x"), quick_retry())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, FtpErrorKind::Connection);
        assert!(err.message.contains("3 attempt"));
    }

    #[tokio::test]
    async fn store_then_fetch_round_trip() {
        let files = Files::default();
        let port = spawn_server("secret", files.clone()).await;
        let mut client = FtpClient::connect(identity(port, "secret"), quick_retry())
            .await
            .unwrap();
        client.change_directory("/pub").await.unwrap();

        let payload = b"0123456789".to_vec();
        let (mut up, _) = TransferControl::unobserved(TransferDirection::Upload, 4);
        let mut source = std::io::Cursor::new(payload.clone());
        let sent = client.store("/pub/a.txt", &mut source, &mut up).await.unwrap();
        assert_eq!(sent, 10);

        let listing = client.list().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "a.txt");
        assert_eq!(listing[0].size, 10);
        assert_eq!(listing[0].path_prefix, "/pub");

        let (mut down, _) = TransferControl::unobserved(TransferDirection::Download, 3);
        let mut sink: Vec<u8> = Vec::new();
        let got = client.fetch("/pub/a.txt", &mut sink, &mut down).await.unwrap();
        assert_eq!(got, 10);
        assert_eq!(sink, payload);

        // The control channel is still in step.
        client.keepalive().await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_a_protocol_error() {
        let port = spawn_server("secret", Files::default()).await;
        let mut client = FtpClient::connect(identity(port, "secret"), quick_retry())
            .await
            .unwrap();
        let (mut ctl, _) = TransferControl::unobserved(TransferDirection::Download, 8);
        let mut sink: Vec<u8> = Vec::new();
        let err = client.fetch("/nope.bin", &mut sink, &mut ctl).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::Protocol);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn delete_reports_outcome() {
        let files = Files::default();
        files.lock().unwrap().insert("/old.log".into(), b"x".to_vec());
        let port = spawn_server("secret", files.clone()).await;
        let mut client = FtpClient::connect(identity(port, "secret"), quick_retry())
            .await
            .unwrap();
        assert!(!client.delete_file("missing.txt").await);
        assert!(client.delete_file("/old.log").await);
        assert!(files.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_listing_keeps_current_path() {
        let port = spawn_server("secret", Files::default()).await;
        let mut client = FtpClient::connect(identity(port, "secret"), quick_retry())
            .await
            .unwrap();
        let err = client.change_directory("/broken").await.unwrap_err();
        assert_eq!(err.code, Some(450));
        assert_eq!(client.current_path(), "/");
        // The wire directory was restored too.
        let entries = client.list().await.unwrap();
        assert_eq!(entries[0].path_prefix, "/");
    }

    #[tokio::test]
    async fn cancelled_retrieve_keeps_control_channel_in_step() {
        let files = Files::default();
        files.lock().unwrap().insert("/big.bin".into(), vec![5u8; 1 << 20]);
        let port = spawn_server("secret", files.clone()).await;
        let mut client = FtpClient::connect(identity(port, "secret"), quick_retry())
            .await
            .unwrap();

        let (mut ctl, cancel) = TransferControl::unobserved(TransferDirection::Download, 4096);
        let mut sink = CancelAfterFirstWrite {
            cancel,
            received: Vec::new(),
        };
        let err = client.fetch("/big.bin", &mut sink, &mut ctl).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(!sink.received.is_empty());
        assert!(sink.received.len() < 1 << 20);

        // ABOR and both replies were consumed.
        client.keepalive().await.unwrap();
        let listing = client.list().await.unwrap();
        assert_eq!(listing.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_store_is_aborted_and_removed() {
        let files = Files::default();
        let port = spawn_server("secret", files.clone()).await;
        let mut client = FtpClient::connect(identity(port, "secret"), quick_retry())
            .await
            .unwrap();

        let (mut ctl, cancel) = TransferControl::unobserved(TransferDirection::Upload, 4);
        let mut source = CancelAfterFirstRead {
            cancel,
            inner: std::io::Cursor::new(b"0123456789".to_vec()),
        };
        let err = client.store("/up.bin", &mut source, &mut ctl).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(ctl.bytes(), 4);
        assert!(files.lock().unwrap().get("/up.bin").is_none());

        client.keepalive().await.unwrap();
    }

    #[tokio::test]
    async fn stalled_listing_is_drained_before_retry() {
        let port = spawn_server("secret", Files::default()).await;
        let id = ServerIdentity {
            data_timeout_sec: 1,
            ..identity(port, "secret")
        };
        let mut client = FtpClient::connect(id, quick_retry()).await.unwrap();

        let entries = client.change_directory("/slow").await.unwrap();
        assert!(entries.is_empty());
        assert_eq!(client.current_path(), "/slow");
        client.keepalive().await.unwrap();
    }
}
