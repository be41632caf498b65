//! Per-transfer control: cooperative cancellation, throttled progress and
//! the stall watchdog.
//!
//! The queue worker owns one `TransferControl` per running job and lends it
//! to the protocol client, which calls [`TransferControl::is_cancelled`]
//! between chunks and [`TransferControl::advance`] after each one.

use crate::ftp::types::{JobEvent, JobSnapshot, TransferDirection, TransferStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

pub struct TransferControl {
    cancel_rx: watch::Receiver<bool>,
    snapshot: Arc<watch::Sender<JobSnapshot>>,
    events: broadcast::Sender<JobEvent>,
    chunk_size: usize,
    interval: Duration,
    last_emit: Option<Instant>,
    bytes: u64,
}

impl TransferControl {
    pub(crate) fn new(
        cancel_rx: watch::Receiver<bool>,
        snapshot: Arc<watch::Sender<JobSnapshot>>,
        events: broadcast::Sender<JobEvent>,
        chunk_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            cancel_rx,
            snapshot,
            events,
            chunk_size: chunk_size.max(1),
            interval,
            last_emit: None,
            bytes: 0,
        }
    }

    /// A control nobody observes, for driving a client directly.
    ///
    /// Returns the cancel sender alongside so the caller can still abort.
    pub fn unobserved(direction: TransferDirection, chunk_size: usize) -> (Self, watch::Sender<bool>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (snapshot, _) = watch::channel(JobSnapshot {
            id: String::new(),
            name: String::new(),
            path_prefix: String::new(),
            direction,
            status: TransferStatus::InProgress,
            bytes_transferred: 0,
            total_bytes: None,
            stalled: false,
            error: None,
        });
        let (events, _) = broadcast::channel(1);
        let ctl = Self::new(
            cancel_rx,
            Arc::new(snapshot),
            events,
            chunk_size,
            Duration::ZERO,
        );
        (ctl, cancel_tx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Record the remote size once it is known.
    pub fn set_total(&mut self, total: u64) {
        self.snapshot.send_modify(|s| s.total_bytes = Some(total));
    }

    /// Account for `n` more bytes; publishes at most once per interval.
    pub fn advance(&mut self, n: usize) {
        self.bytes += n as u64;
        let due = self
            .last_emit
            .map_or(true, |at| at.elapsed() >= self.interval);
        if due {
            self.publish();
        }
    }

    /// Publish the final byte count regardless of cadence.
    pub fn finish(&mut self) {
        self.publish();
    }

    fn publish(&mut self) {
        self.last_emit = Some(Instant::now());
        let bytes = self.bytes;
        let mut total = None;
        self.snapshot.send_modify(|s| {
            s.bytes_transferred = bytes;
            s.stalled = false;
            total = s.total_bytes;
        });
        let id = self.snapshot.borrow().id.clone();
        // No subscribers is fine.
        let _ = self.events.send(JobEvent::Progress {
            id,
            bytes_transferred: bytes,
            total_bytes: total,
        });
    }
}

/// Flag the job as stalled whenever its snapshot stays silent for `interval`.
///
/// Only reports; failing the job is left to the protocol timeouts.
pub(crate) async fn watch_for_stall(
    snapshot: Arc<watch::Sender<JobSnapshot>>,
    events: broadcast::Sender<JobEvent>,
    interval: Duration,
) {
    let mut rx = snapshot.subscribe();
    loop {
        match tokio::time::timeout(interval, rx.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) => return,
            Err(_) => {
                let mut flagged = None;
                snapshot.send_if_modified(|s| {
                    if s.stalled || s.status != TransferStatus::InProgress {
                        return false;
                    }
                    s.stalled = true;
                    flagged = Some((s.id.clone(), s.bytes_transferred));
                    true
                });
                // Our own write is not progress.
                let _ = rx.borrow_and_update();
                if let Some((id, bytes_transferred)) = flagged {
                    log::warn!(
                        "Transfer {} stalled at {} bytes (no progress for {:?})",
                        id,
                        bytes_transferred,
                        interval
                    );
                    let _ = events.send(JobEvent::Stalled { id, bytes_transferred });
                }
            }
        }
    }
}
