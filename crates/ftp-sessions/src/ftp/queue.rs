//! Per-direction transfer queue.
//!
//! One `TransferQueue` exists per direction per session. Each owns a single
//! worker task that drains jobs strictly FIFO, so at most one job per
//! direction is ever InProgress. Both workers share the session's
//! [`SharedClient`] and take its lock for the whole protocol operation.
//!
//! Observation:
//! • every job has a `watch` snapshot reachable from its [`JobHandle`]
//! • the queue broadcasts [`JobEvent`]s for fan-out subscribers
//! • a `watch<bool>` reports whether the queue has pending or running work

use crate::ftp::client::SharedClient;
use crate::ftp::config::TransferQueueConfig;
use crate::ftp::control::{watch_for_stall, TransferControl};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::history::TransferHistory;
use crate::ftp::types::*;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

// ─── Jobs ────────────────────────────────────────────────────────────

/// Caller-supplied local end of a transfer.
pub enum LocalResource {
    /// Upload source.
    Reader(Box<dyn AsyncRead + Unpin + Send>),
    /// Download target.
    Writer(Box<dyn AsyncWrite + Unpin + Send>),
}

/// A requested transfer, owned by the queue until it reaches a terminal status.
pub struct TransferJob {
    pub remote_name: String,
    pub path_prefix: String,
    pub size_bytes: Option<u64>,
    pub direction: TransferDirection,
    resource: LocalResource,
}

impl TransferJob {
    pub fn upload(
        remote_name: impl Into<String>,
        path_prefix: impl Into<String>,
        source: impl AsyncRead + Unpin + Send + 'static,
        size_bytes: Option<u64>,
    ) -> Self {
        Self {
            remote_name: remote_name.into(),
            path_prefix: path_prefix.into(),
            size_bytes,
            direction: TransferDirection::Upload,
            resource: LocalResource::Reader(Box::new(source)),
        }
    }

    pub fn download(
        remote_name: impl Into<String>,
        path_prefix: impl Into<String>,
        sink: impl AsyncWrite + Unpin + Send + 'static,
        size_bytes: Option<u64>,
    ) -> Self {
        Self {
            remote_name: remote_name.into(),
            path_prefix: path_prefix.into(),
            size_bytes,
            direction: TransferDirection::Download,
            resource: LocalResource::Writer(Box::new(sink)),
        }
    }

    /// Download of a listed entry into `sink`.
    pub fn download_entry(entry: &DirectoryEntry, sink: impl AsyncWrite + Unpin + Send + 'static) -> Self {
        Self::download(entry.name.clone(), entry.path_prefix.clone(), sink, Some(entry.size))
    }

    pub fn remote_path(&self) -> String {
        join_remote(&self.path_prefix, &self.remote_name)
    }
}

/// Caller's view of one enqueued job.
#[derive(Clone)]
pub struct JobHandle {
    id: String,
    snapshot: watch::Receiver<JobSnapshot>,
    queue: Arc<Inner>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> TransferStatus {
        self.snapshot.borrow().status
    }

    /// A receiver of this job's snapshot; it keeps the last value after the
    /// job finishes.
    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.snapshot.clone()
    }

    /// Resolve once the job is terminal.
    pub async fn wait(&self) -> JobSnapshot {
        let mut rx = self.snapshot.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if current.status.is_terminal() {
                    return current.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    /// Queued jobs are removed at once; a running job is asked to stop and
    /// becomes Cancelled only after its I/O has halted. `false` if the job
    /// already finished.
    pub fn cancel(&self) -> bool {
        self.queue.cancel(&self.id)
    }
}

// ─── Queue ───────────────────────────────────────────────────────────

struct Pending {
    id: String,
    job: TransferJob,
    snapshot: Arc<watch::Sender<JobSnapshot>>,
}

struct Active {
    id: String,
    cancel_tx: watch::Sender<bool>,
    snapshot: Arc<watch::Sender<JobSnapshot>>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    active: Option<Active>,
    closed: bool,
}

struct Inner {
    direction: TransferDirection,
    host: String,
    config: TransferQueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    events: broadcast::Sender<JobEvent>,
    activity: watch::Sender<bool>,
    history: Arc<Mutex<TransferHistory>>,
}

/// FIFO queue of transfers for one direction of one session.
pub struct TransferQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransferQueue {
    /// Create the queue and start its worker against `client`.
    pub fn spawn(
        direction: TransferDirection,
        host: impl Into<String>,
        client: SharedClient,
        config: TransferQueueConfig,
        history: Arc<Mutex<TransferHistory>>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (activity, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            direction,
            host: host.into(),
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            events,
            activity,
            history,
        });
        let worker = tokio::spawn(run_worker(inner.clone(), client));
        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn direction(&self) -> TransferDirection {
        self.inner.direction
    }

    /// Append `job` with status Queued.
    pub fn enqueue(&self, job: TransferJob) -> FtpResult<JobHandle> {
        if job.direction != self.inner.direction {
            return Err(FtpError::invalid_config(format!(
                "{:?} job offered to the {:?} queue",
                job.direction, self.inner.direction
            )));
        }

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = watch::channel(JobSnapshot {
            id: id.clone(),
            name: job.remote_name.clone(),
            path_prefix: job.path_prefix.clone(),
            direction: job.direction,
            status: TransferStatus::Queued,
            bytes_transferred: 0,
            total_bytes: job.size_bytes,
            stalled: false,
            error: None,
        });

        {
            let mut st = self.inner.lock_state();
            if st.closed {
                return Err(FtpError::queue_closed(format!(
                    "{} queue for {} is closed",
                    direction_name(self.inner.direction),
                    self.inner.host
                ))
                .with_host(self.inner.host.clone()));
            }
            log::debug!(
                "{}: queued {} {} ({})",
                self.inner.host,
                direction_name(job.direction),
                job.remote_path(),
                id
            );
            st.pending.push_back(Pending {
                id: id.clone(),
                job,
                snapshot: Arc::new(tx),
            });
            self.inner.emit_status(&rx.borrow());
            self.inner.refresh_activity(&st);
        }
        self.inner.notify.notify_one();

        Ok(JobHandle {
            id,
            snapshot: rx,
            queue: self.inner.clone(),
        })
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.inner.cancel(id)
    }

    /// Cancel every pending job and the running one, leaving the queue open.
    pub fn cancel_all(&self) -> usize {
        let mut st = self.inner.lock_state();
        self.inner.cancel_everything(&mut st)
    }

    /// Snapshots of the running job followed by the pending ones, in order.
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let st = self.inner.lock_state();
        st.active
            .iter()
            .map(|a| a.snapshot.borrow().clone())
            .chain(st.pending.iter().map(|p| p.snapshot.borrow().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        let st = self.inner.lock_state();
        st.pending.len() + usize::from(st.active.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` while a job is pending or running.
    pub fn is_active(&self) -> bool {
        *self.inner.activity.borrow()
    }

    pub fn activity(&self) -> watch::Receiver<bool> {
        self.inner.activity.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Refuse new jobs and cancel the existing ones. The worker exits once
    /// the running job has unwound.
    pub fn close(&self) {
        {
            let mut st = self.inner.lock_state();
            if st.closed {
                return;
            }
            st.closed = true;
            let n = self.inner.cancel_everything(&mut st);
            log::debug!(
                "{}: {} queue closed ({} job(s) cancelled)",
                self.inner.host,
                direction_name(self.inner.direction),
                n
            );
        }
        self.inner.notify.notify_one();
    }

    /// Close this queue and `other` together, but only if neither has
    /// pending or running work. Locks `self` before `other`.
    pub(crate) fn close_pair_if_idle(&self, other: &TransferQueue) -> bool {
        {
            let mut mine = self.inner.lock_state();
            let mut theirs = other.inner.lock_state();
            let idle = |st: &QueueState| !st.closed && st.pending.is_empty() && st.active.is_none();
            if !idle(&*mine) || !idle(&*theirs) {
                return false;
            }
            mine.closed = true;
            theirs.closed = true;
        }
        log::debug!("{}: idle queues closed", self.inner.host);
        self.inner.notify.notify_one();
        other.inner.notify.notify_one();
        true
    }

    /// Close and wait for the worker to finish, so no job touches its
    /// local resource afterwards.
    pub async fn shutdown(&self) {
        self.close();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                log::warn!("{}: transfer worker ended abnormally: {}", self.inner.host, e);
            }
        }
    }
}

impl Drop for TransferQueue {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit_status(&self, snapshot: &JobSnapshot) {
        // No subscribers is fine.
        let _ = self.events.send(JobEvent::Status(snapshot.clone()));
    }

    fn refresh_activity(&self, st: &QueueState) {
        let busy = st.active.is_some() || !st.pending.is_empty();
        self.activity.send_if_modified(|v| {
            if *v == busy {
                return false;
            }
            *v = busy;
            true
        });
    }

    fn record(&self, snapshot: &JobSnapshot) {
        let record = TransferRecord {
            id: snapshot.id.clone(),
            name: snapshot.name.clone(),
            path_prefix: snapshot.path_prefix.clone(),
            size_bytes: snapshot.total_bytes,
            bytes_transferred: snapshot.bytes_transferred,
            direction: snapshot.direction,
            status: snapshot.status,
            error: snapshot.error.clone(),
            finished_at: Utc::now(),
        };
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record);
    }

    /// Move a job to a terminal status, publish it and demote it to history.
    fn finalize(
        &self,
        snapshot: &watch::Sender<JobSnapshot>,
        status: TransferStatus,
        bytes: u64,
        error: Option<String>,
    ) -> JobSnapshot {
        snapshot.send_modify(|s| {
            debug_assert!(s.status.can_transition_to(status));
            s.status = status;
            s.bytes_transferred = bytes;
            s.stalled = false;
            s.error = error;
        });
        let done = snapshot.borrow().clone();
        self.emit_status(&done);
        self.record(&done);
        done
    }

    fn cancel(&self, id: &str) -> bool {
        let mut st = self.lock_state();
        if let Some(pos) = st.pending.iter().position(|p| p.id == id) {
            if let Some(p) = st.pending.remove(pos) {
                self.finalize(&p.snapshot, TransferStatus::Cancelled, 0, None);
                log::info!("{}: cancelled queued job {}", self.host, id);
            }
            self.refresh_activity(&st);
            return true;
        }
        match &st.active {
            Some(active) if active.id == id => {
                log::info!("{}: cancellation requested for running job {}", self.host, id);
                let _ = active.cancel_tx.send(true);
                true
            }
            _ => false,
        }
    }

    fn cancel_everything(&self, st: &mut QueueState) -> usize {
        let mut n = 0;
        while let Some(p) = st.pending.pop_front() {
            self.finalize(&p.snapshot, TransferStatus::Cancelled, 0, None);
            n += 1;
        }
        if let Some(active) = &st.active {
            let _ = active.cancel_tx.send(true);
            n += 1;
        }
        self.refresh_activity(st);
        n
    }

    /// Pop the next job and mark it active.
    fn take_next(&self) -> Next {
        let mut st = self.lock_state();
        if st.closed && st.pending.is_empty() {
            return Next::Stop;
        }
        let Some(p) = st.pending.pop_front() else {
            return Next::Wait;
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        p.snapshot.send_modify(|s| s.status = TransferStatus::InProgress);
        self.emit_status(&p.snapshot.borrow());
        st.active = Some(Active {
            id: p.id.clone(),
            cancel_tx,
            snapshot: p.snapshot.clone(),
        });
        Next::Run(p, cancel_rx)
    }

    async fn process(&self, pending: Pending, cancel_rx: watch::Receiver<bool>, client: &SharedClient) {
        let Pending { id, mut job, snapshot } = pending;
        let remote = job.remote_path();
        let mut ctl = TransferControl::new(
            cancel_rx,
            snapshot.clone(),
            self.events.clone(),
            self.config.chunk_size,
            self.config.progress_interval(),
        );
        let outcome = {
            let mut guard = client.lock().await;
            if ctl.is_cancelled() {
                Err(FtpError::cancelled("Cancelled before start"))
            } else {
                // Waiting for the client is not a stall; watch only the I/O.
                let dog = tokio::spawn(watch_for_stall(
                    snapshot.clone(),
                    self.events.clone(),
                    self.config.watchdog_interval(),
                ));
                log::info!("{}: {} {} started", self.host, direction_name(job.direction), remote);
                let result = match &mut job.resource {
                    LocalResource::Reader(source) => guard.store(&remote, &mut **source, &mut ctl).await,
                    LocalResource::Writer(sink) => guard.fetch(&remote, &mut **sink, &mut ctl).await,
                };
                dog.abort();
                result
            }
        };

        // The local resource is released here, once, after all I/O stopped.
        let released = match job.resource {
            LocalResource::Writer(mut sink) => sink.shutdown().await,
            LocalResource::Reader(_) => Ok(()),
        };

        let bytes = ctl.bytes();
        let cancelled = ctl.is_cancelled();
        drop(ctl);

        let (status, bytes, error) = match (outcome, released) {
            (Ok(n), Ok(())) => (TransferStatus::Done, n, None),
            (Ok(n), Err(e)) => {
                let err = FtpError::local_io(format!("Closing local resource: {}", e));
                (TransferStatus::Failed, n, Some(err.to_string()))
            }
            (Err(e), _) if e.is_cancelled() || cancelled => (TransferStatus::Cancelled, bytes, None),
            (Err(e), _) => {
                let e = e.with_host(self.host.clone());
                (TransferStatus::Failed, bytes, Some(e.to_string()))
            }
        };

        // Terminal status and clearing `active` happen under one lock.
        let mut st = self.lock_state();
        if st.active.as_ref().map_or(false, |a| a.id == id) {
            st.active = None;
        }
        let done = self.finalize(&snapshot, status, bytes, error);
        log::info!(
            "{}: {} {} finished as {:?} ({} bytes)",
            self.host,
            direction_name(done.direction),
            remote,
            done.status,
            done.bytes_transferred
        );
        self.refresh_activity(&st);
    }
}

enum Next {
    Run(Pending, watch::Receiver<bool>),
    Wait,
    Stop,
}

async fn run_worker(inner: Arc<Inner>, client: SharedClient) {
    loop {
        match inner.take_next() {
            Next::Run(job, cancel_rx) => inner.process(job, cancel_rx, &client).await,
            Next::Wait => inner.notify.notified().await,
            Next::Stop => break,
        }
    }
    log::debug!("{}: {} worker stopped", inner.host, direction_name(inner.direction));
}

fn direction_name(direction: TransferDirection) -> &'static str {
    match direction {
        TransferDirection::Upload => "upload",
        TransferDirection::Download => "download",
    }
}
