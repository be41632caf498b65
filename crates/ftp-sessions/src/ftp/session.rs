//! # ConnectionSession
//!
//! One live server connection: the protocol client behind its critical
//! section, an upload queue, a download queue, navigation state and the
//! shared transfer history.
//!
//! • navigation and delete go straight to the client (through its lock)
//! • transfers go through the per-direction queues
//! • after `close()` every enqueue fails with `QueueClosed`

use crate::ftp::client::{ProtocolClient, SharedClient};
use crate::ftp::config::TransferQueueConfig;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::history::TransferHistory;
use crate::ftp::navigation::NavigationController;
use crate::ftp::queue::{JobHandle, TransferJob, TransferQueue};
use crate::ftp::types::*;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};

const NOTICE_CAPACITY: usize = 64;

pub struct ConnectionSession {
    identity: ServerIdentity,
    client: SharedClient,
    uploads: TransferQueue,
    downloads: TransferQueue,
    navigation: NavigationController,
    history: Arc<Mutex<TransferHistory>>,
    closed: AtomicBool,
    last_activity: Mutex<DateTime<Utc>>,
    notices: broadcast::Sender<SessionNotice>,
}

impl ConnectionSession {
    /// Wrap a connected client. Must be called inside a tokio runtime, since
    /// the queue workers are spawned here.
    pub fn new(identity: ServerIdentity, client: Box<dyn ProtocolClient>, config: TransferQueueConfig) -> Self {
        let initial_path = client.current_path().to_string();
        let client: SharedClient = Arc::new(tokio::sync::Mutex::new(client));
        let history = Arc::new(Mutex::new(TransferHistory::new(config.history_limit)));
        let uploads = TransferQueue::spawn(
            TransferDirection::Upload,
            identity.host.clone(),
            client.clone(),
            config.clone(),
            history.clone(),
        );
        let downloads = TransferQueue::spawn(
            TransferDirection::Download,
            identity.host.clone(),
            client.clone(),
            config,
            history.clone(),
        );
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        Self {
            identity,
            client,
            uploads,
            downloads,
            navigation: NavigationController::new(initial_path),
            history,
            closed: AtomicBool::new(false),
            last_activity: Mutex::new(Utc::now()),
            notices,
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn host(&self) -> &str {
        &self.identity.host
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> FtpResult<()> {
        if self.is_closed() {
            return Err(FtpError::queue_closed(format!("Session for {} is closed", self.identity.host))
                .with_host(self.identity.host.clone()));
        }
        Ok(())
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|p| p.into_inner()) = Utc::now();
    }

    fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }

    // ── Navigation ──────────────────────────────────────────────────

    /// Change to `path` and list it. On failure the previous path and
    /// listing stay in place.
    pub async fn navigate(&self, path: &str) -> FtpResult<Vec<DirectoryEntry>> {
        self.ensure_open()?;
        self.touch();
        let result = self.navigation.navigate(&self.client, path).await;
        if let Err(e) = &result {
            self.notify(SessionNotice::OperationFailed {
                operation: "navigate".into(),
                message: e.to_string(),
            });
        }
        result
    }

    /// Re-list the current path.
    pub async fn refresh(&self) -> FtpResult<Vec<DirectoryEntry>> {
        let path = self.current_path();
        self.navigate(&path).await
    }

    pub fn current_path(&self) -> String {
        self.navigation.current_path()
    }

    /// Entries of the most recent successful navigation.
    pub fn current_listing(&self) -> Vec<DirectoryEntry> {
        self.navigation.listing()
    }

    /// The current listing filtered and sorted for display.
    pub fn listing(&self, options: &ListOptions) -> FtpResult<Vec<DirectoryEntry>> {
        let mut entries = self.current_listing();

        if let Some(ref filter) = options.filter {
            let pattern = glob::Pattern::new(filter)
                .map_err(|e| FtpError::invalid_config(format!("Invalid filter '{}': {}", filter, e)))?;
            entries.retain(|e| pattern.matches(&e.name));
        }

        if !options.show_hidden {
            entries.retain(|e| !e.is_hidden());
        }

        if let Some(sort_by) = options.sort_by {
            match sort_by {
                SortField::Name => entries.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase())),
                SortField::Size => entries.sort_by(|a, b| a.size.cmp(&b.size)),
                SortField::Modified => entries.sort_by(|a, b| a.modified.cmp(&b.modified)),
            }
        }

        if options.sort_order == Some(SortOrder::Desc) {
            entries.reverse();
        }

        if options.directories_first {
            // Stable, so the order within each group is kept.
            entries.sort_by_key(|e| !e.is_directory());
        }

        Ok(entries)
    }

    pub fn navigation(&self) -> NavigationSnapshot {
        self.navigation.snapshot()
    }

    pub fn navigation_state(&self) -> NavigationState {
        self.navigation.state()
    }

    pub fn subscribe_navigation(&self) -> watch::Receiver<NavigationSnapshot> {
        self.navigation.subscribe()
    }

    // ── Transfers ───────────────────────────────────────────────────

    pub fn enqueue_upload(&self, job: TransferJob) -> FtpResult<JobHandle> {
        self.ensure_open()?;
        self.touch();
        self.uploads.enqueue(job)
    }

    pub fn enqueue_download(&self, job: TransferJob) -> FtpResult<JobHandle> {
        self.ensure_open()?;
        self.touch();
        self.downloads.enqueue(job)
    }

    /// Route `job` to the queue for its direction.
    pub fn enqueue(&self, job: TransferJob) -> FtpResult<JobHandle> {
        match job.direction {
            TransferDirection::Upload => self.enqueue_upload(job),
            TransferDirection::Download => self.enqueue_download(job),
        }
    }

    pub fn has_active_upload(&self) -> bool {
        self.uploads.is_active()
    }

    pub fn has_active_download(&self) -> bool {
        self.downloads.is_active()
    }

    pub fn is_busy(&self) -> bool {
        self.has_active_upload() || self.has_active_download()
    }

    pub fn queue(&self, direction: TransferDirection) -> &TransferQueue {
        match direction {
            TransferDirection::Upload => &self.uploads,
            TransferDirection::Download => &self.downloads,
        }
    }

    pub fn subscribe_jobs(&self, direction: TransferDirection) -> broadcast::Receiver<JobEvent> {
        self.queue(direction).subscribe()
    }

    /// Cancel a job on either queue.
    pub fn cancel(&self, job_id: &str) -> bool {
        self.uploads.cancel(job_id) || self.downloads.cancel(job_id)
    }

    pub fn cancel_all(&self) -> usize {
        self.uploads.cancel_all() + self.downloads.cancel_all()
    }

    // ── Remote file operations ──────────────────────────────────────

    /// Delete a remote file; relative paths resolve against the current
    /// path. Never fails: `false` means the server refused or the
    /// connection broke.
    pub async fn delete_file(&self, path: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        self.touch();
        let target = join_remote(&self.current_path(), path);
        let deleted = self.client.lock().await.delete_file(&target).await;
        if deleted {
            log::info!("{}: deleted {}", self.identity.host, target);
            self.notify(SessionNotice::Deleted { path: target });
        } else {
            log::warn!("{}: could not delete {}", self.identity.host, target);
            self.notify(SessionNotice::OperationFailed {
                operation: "delete".into(),
                message: format!("Could not delete {}", target),
            });
        }
        deleted
    }

    /// Ask the presentation layer to confirm deleting `path`. Nothing is
    /// deleted until `delete_file` is called.
    pub fn request_delete(&self, path: &str) {
        let target = join_remote(&self.current_path(), path);
        log::debug!("{}: delete confirmation requested for {}", self.identity.host, target);
        self.notify(SessionNotice::DeleteConfirmationRequested { path: target });
    }

    /// Withdraw a pending delete confirmation.
    pub fn dismiss_delete(&self) {
        self.notify(SessionNotice::DeleteConfirmationDismissed);
    }

    /// NOOP on the control channel; does not count as activity.
    pub async fn keepalive(&self) -> FtpResult<()> {
        self.ensure_open()?;
        self.client.lock().await.keepalive().await
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    // ── History ─────────────────────────────────────────────────────

    /// Finished transfers, newest first.
    pub fn history(&self, limit: Option<usize>) -> Vec<TransferRecord> {
        self.history.lock().unwrap_or_else(|p| p.into_inner()).recent(limit)
    }

    pub fn history_stats(&self) -> HistoryStats {
        self.history.lock().unwrap_or_else(|p| p.into_inner()).stats()
    }

    pub fn clear_history(&self) -> usize {
        self.history.lock().unwrap_or_else(|p| p.into_inner()).clear()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity()
    }

    /// Stop accepting transfers if neither queue has work. The emptiness
    /// check and the refusal are atomic; follow with [`Self::close`].
    pub fn retire_if_idle(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.uploads.close_pair_if_idle(&self.downloads)
    }

    /// Cancel all jobs, wait for running transfers to unwind, then QUIT.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("{}: closing session", self.identity.host);
        self.uploads.shutdown().await;
        self.downloads.shutdown().await;
        self.client.lock().await.quit().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::config::RetryConfig;
    use crate::ftp::error::FtpErrorKind;
    use crate::ftp::memory::{MemoryClient, MemoryServer, MemorySink};
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn session(server: &MemoryServer, host: &str) -> ConnectionSession {
        let identity = ServerIdentity::new(host);
        let client = MemoryClient::connect(server.clone(), &identity, &RetryConfig::none())
            .await
            .unwrap();
        let config = TransferQueueConfig {
            chunk_size: 4,
            progress_interval_ms: 0,
            ..TransferQueueConfig::default()
        };
        ConnectionSession::new(identity, Box::new(client), config)
    }

    async fn finish(handle: &JobHandle) -> JobSnapshot {
        timeout(Duration::from_secs(5), handle.wait()).await.unwrap()
    }

    #[tokio::test]
    async fn upload_appears_in_next_listing() {
        let server = MemoryServer::new();
        server.set_chunk_delay(Duration::from_millis(1));
        let s = session(&server, "ftp.example.com").await;

        assert!(s.navigate("/").await.unwrap().is_empty());
        assert_eq!(s.navigation_state(), NavigationState::Ready);

        let job = TransferJob::upload("a.txt", "/", Cursor::new(vec![b'x'; 10]), Some(10));
        let handle = s.enqueue_upload(job).unwrap();
        let mut rx = handle.subscribe();
        let mut seen = vec![rx.borrow_and_update().status];
        timeout(Duration::from_secs(5), async {
            while rx.changed().await.is_ok() {
                let status = rx.borrow_and_update().status;
                if seen.last() != Some(&status) {
                    seen.push(status);
                }
                if status.is_terminal() {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(
            seen,
            vec![TransferStatus::Queued, TransferStatus::InProgress, TransferStatus::Done]
        );

        let entries = s.navigate("/").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].size, 10);
        assert_eq!(s.current_listing(), entries);
    }

    #[tokio::test]
    async fn deleting_a_missing_file_returns_false() {
        let server = MemoryServer::new();
        let s = session(&server, "ftp.example.com").await;
        s.navigate("/").await.unwrap();
        let mut notices = s.subscribe_notices();

        assert!(!s.delete_file("missing.txt").await);
        assert_eq!(s.navigation_state(), NavigationState::Ready);
        assert!(matches!(
            notices.try_recv().unwrap(),
            SessionNotice::OperationFailed { ref operation, .. } if operation == "delete"
        ));
    }

    #[tokio::test]
    async fn successful_delete_reports_success() {
        let server = MemoryServer::new();
        server.put_file("/pub/old.log", b"x".to_vec());
        let s = session(&server, "h").await;
        s.navigate("/pub").await.unwrap();
        let mut notices = s.subscribe_notices();

        assert!(s.delete_file("old.log").await);
        assert_eq!(
            notices.try_recv().unwrap(),
            SessionNotice::Deleted {
                path: "/pub/old.log".into()
            }
        );
        assert!(server.file("/pub/old.log").is_none());
        assert!(s.refresh().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_confirmation_is_requested_and_dismissed() {
        let server = MemoryServer::new();
        server.put_file("/pub/keep.txt", b"k".to_vec());
        let s = session(&server, "h").await;
        s.navigate("/pub").await.unwrap();
        let mut notices = s.subscribe_notices();

        s.request_delete("keep.txt");
        assert_eq!(
            notices.try_recv().unwrap(),
            SessionNotice::DeleteConfirmationRequested {
                path: "/pub/keep.txt".into()
            }
        );
        s.dismiss_delete();
        assert_eq!(notices.try_recv().unwrap(), SessionNotice::DeleteConfirmationDismissed);

        // Requesting is not deleting.
        assert!(server.file("/pub/keep.txt").is_some());
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn busy_session_is_not_retired() {
        let server = MemoryServer::new();
        server.set_chunk_delay(Duration::from_millis(5));
        let s = session(&server, "h").await;

        let job = s
            .enqueue_upload(TransferJob::upload("a", "/", Cursor::new(vec![0u8; 16]), None))
            .unwrap();
        assert!(!s.retire_if_idle());
        assert_eq!(finish(&job).await.status, TransferStatus::Done);

        assert!(s.retire_if_idle());
        let err = s
            .enqueue_upload(TransferJob::upload("b", "/", Cursor::new(vec![1u8]), None))
            .err()
            .unwrap();
        assert_eq!(err.kind, FtpErrorKind::QueueClosed);
        s.close().await;
        assert_eq!(server.open_clients(), 0);
    }

    #[tokio::test]
    async fn listing_options_filter_and_sort() {
        let server = MemoryServer::new();
        server.add_dir("/zdir");
        server.put_file("/b.txt", vec![0u8; 30]);
        server.put_file("/a.txt", vec![0u8; 20]);
        server.put_file("/c.log", vec![0u8; 10]);
        server.put_file("/.hidden", vec![0u8; 1]);
        let s = session(&server, "h").await;
        s.navigate("/").await.unwrap();

        let names = |opts: &ListOptions| -> Vec<String> {
            s.listing(opts).unwrap().into_iter().map(|e| e.name).collect()
        };

        let by_size = ListOptions {
            sort_by: Some(SortField::Size),
            sort_order: Some(SortOrder::Desc),
            show_hidden: false,
            ..ListOptions::default()
        };
        assert_eq!(names(&by_size), vec!["zdir", "b.txt", "a.txt", "c.log"]);

        let txt = ListOptions {
            filter: Some("*.txt".into()),
            sort_by: Some(SortField::Name),
            ..ListOptions::default()
        };
        assert_eq!(names(&txt), vec!["a.txt", "b.txt"]);

        let bad = ListOptions {
            filter: Some("[".into()),
            ..ListOptions::default()
        };
        assert_eq!(s.listing(&bad).unwrap_err().kind, FtpErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn closed_session_rejects_work() {
        let server = MemoryServer::new();
        server.put_file("/f.bin", vec![1u8; 8]);
        let s = session(&server, "h").await;
        assert_eq!(server.open_clients(), 1);

        s.close().await;
        assert!(s.is_closed());
        assert_eq!(server.open_clients(), 0);

        let err = s
            .enqueue_download(TransferJob::download("f.bin", "/", MemorySink::new(), None))
            .err()
            .unwrap();
        assert_eq!(err.kind, FtpErrorKind::QueueClosed);
        assert_eq!(s.navigate("/").await.unwrap_err().kind, FtpErrorKind::QueueClosed);
        assert!(!s.delete_file("f.bin").await);
    }

    #[tokio::test]
    async fn navigation_and_transfers_never_overlap() {
        let server = MemoryServer::new();
        server.add_dir("/pub");
        server.put_file("/pub/down.bin", vec![5u8; 40]);
        server.set_chunk_delay(Duration::from_millis(2));
        server.set_op_delay(Duration::from_millis(2));
        let s = Arc::new(session(&server, "h").await);

        let up = s
            .enqueue_upload(TransferJob::upload("up.bin", "/pub", Cursor::new(vec![3u8; 40]), None))
            .unwrap();
        let down = s
            .enqueue_download(TransferJob::download("down.bin", "/pub", MemorySink::new(), None))
            .unwrap();
        let navs: Vec<_> = ["/pub", "/", "/pub"]
            .into_iter()
            .map(|p| {
                let s = s.clone();
                tokio::spawn(async move { s.navigate(p).await })
            })
            .collect();
        for n in navs {
            n.await.unwrap().unwrap();
        }
        assert_eq!(finish(&up).await.status, TransferStatus::Done);
        assert_eq!(finish(&down).await.status, TransferStatus::Done);

        assert_eq!(server.max_overlap(), 1);
        assert_eq!(s.history_stats().done, 2);
        assert_eq!(s.history(Some(1)).len(), 1);
    }
}
