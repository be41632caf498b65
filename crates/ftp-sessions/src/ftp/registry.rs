//! # ConnectionRegistry
//!
//! Table of live sessions keyed by host, with explicit construction and
//! teardown. At most one session (and so one protocol client) exists per
//! host.
//!
//! The set of active servers is published as a `watch` of [`ActiveServer`]
//! rows. It changes when a session is registered or removed, and when one
//! of a session's queues becomes busy or idle. Each session gets one
//! forwarding task for its queue activity, torn down on unregister.

use crate::ftp::client::{Connector, FtpConnector};
use crate::ftp::config::{FtpSessionsConfig, RegistryConfig, TransferQueueConfig};
use crate::ftp::error::{FtpErrorKind, FtpResult};
use crate::ftp::session::ConnectionSession;
use crate::ftp::types::{ActiveServer, ServerIdentity, TransferDirection};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_stream::wrappers::WatchStream;

// ─── Eviction policy ─────────────────────────────────────────────────

/// Decides which sessions the maintenance sweep tears down.
pub trait EvictionPolicy: Send + Sync {
    fn should_evict(&self, session: &ConnectionSession, now: DateTime<Utc>) -> bool;
}

/// Evict sessions with no activity and no queued work for `timeout`.
#[derive(Debug, Clone)]
pub struct IdleTimeout {
    pub timeout: Duration,
}

impl EvictionPolicy for IdleTimeout {
    fn should_evict(&self, session: &ConnectionSession, now: DateTime<Utc>) -> bool {
        if session.is_busy() {
            return false;
        }
        session
            .idle_for(now)
            .to_std()
            .map_or(false, |idle| idle >= self.timeout)
    }
}

/// Keep sessions until they are unregistered explicitly.
#[derive(Debug, Clone, Default)]
pub struct NeverEvict;

impl EvictionPolicy for NeverEvict {
    fn should_evict(&self, _session: &ConnectionSession, _now: DateTime<Utc>) -> bool {
        false
    }
}

// ─── Registry ────────────────────────────────────────────────────────

pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    config: RegistryConfig,
    queue_config: TransferQueueConfig,
    policy: Box<dyn EvictionPolicy>,
    sessions: Mutex<HashMap<String, Arc<ConnectionSession>>>,
    /// Serializes session creation so two callers never connect the same host.
    connecting: tokio::sync::Mutex<()>,
    active: Arc<watch::Sender<Vec<ActiveServer>>>,
    forwarders: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ConnectionRegistry {
    /// Registry over `connector`. The eviction policy follows
    /// `config.registry.idle_timeout_sec` (0 disables eviction).
    pub fn new(connector: Arc<dyn Connector>, config: FtpSessionsConfig) -> Self {
        let policy: Box<dyn EvictionPolicy> = match config.registry.idle_timeout_sec {
            0 => Box::new(NeverEvict),
            secs => Box::new(IdleTimeout {
                timeout: Duration::from_secs(secs),
            }),
        };
        let (active, _) = watch::channel(Vec::new());
        Self {
            connector,
            config: config.registry,
            queue_config: config.queue,
            policy,
            sessions: Mutex::new(HashMap::new()),
            connecting: tokio::sync::Mutex::new(()),
            active: Arc::new(active),
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    /// Registry that connects to real FTP servers.
    pub fn ftp(config: FtpSessionsConfig) -> Self {
        let connector = Arc::new(FtpConnector::new(config.retry.clone()));
        Self::new(connector, config)
    }

    pub fn with_policy(mut self, policy: Box<dyn EvictionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<ConnectionSession>>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_forwarders(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.forwarders.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Existing session for `identity.host`, or a freshly connected one.
    pub async fn register(&self, identity: ServerIdentity) -> FtpResult<Arc<ConnectionSession>> {
        identity.validate()?;
        if let Some(existing) = self.lookup(&identity.host) {
            return Ok(existing);
        }

        let _creating = self.connecting.lock().await;
        if let Some(existing) = self.lookup(&identity.host) {
            return Ok(existing);
        }

        let client = self
            .connector
            .connect(&identity)
            .await
            .map_err(|e| e.with_host(identity.host.clone()))?;
        let host = identity.host.clone();
        let session = Arc::new(ConnectionSession::new(identity, client, self.queue_config.clone()));

        // Subscribe to queue activity before the row becomes visible.
        self.spawn_forwarder(&session);
        {
            let mut sessions = self.lock_sessions();
            sessions.insert(host.clone(), session.clone());
            self.publish(&sessions);
        }
        log::info!("Registered FTP session for {}", host);
        Ok(session)
    }

    pub fn lookup(&self, host: &str) -> Option<Arc<ConnectionSession>> {
        self.lock_sessions().get(host).cloned()
    }

    /// Live view of the active servers; yields the current rows first.
    pub fn observe_sessions(&self) -> WatchStream<Vec<ActiveServer>> {
        WatchStream::new(self.active.subscribe())
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ActiveServer>> {
        self.active.subscribe()
    }

    pub fn active_servers(&self) -> Vec<ActiveServer> {
        self.active.borrow().clone()
    }

    pub fn sessions(&self) -> Vec<Arc<ConnectionSession>> {
        self.lock_sessions().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the session for `host`: its jobs are cancelled and its
    /// connection closed. `false` if no such session.
    pub async fn unregister(&self, host: &str) -> bool {
        // Held until the old client is closed, so no second client for
        // `host` can be opened meanwhile.
        let _gate = self.connecting.lock().await;
        let Some(session) = self.detach(host) else {
            return false;
        };
        session.close().await;
        log::info!("Unregistered FTP session for {}", host);
        true
    }

    /// Tear down every session the policy selects; returns their hosts.
    ///
    /// A selected session is only torn down if its queues are still empty
    /// when they are closed, so work enqueued after the policy looked is
    /// never cancelled by eviction.
    pub async fn evict_idle(&self) -> Vec<String> {
        let _gate = self.connecting.lock().await;
        let now = Utc::now();
        let candidates: Vec<(String, Arc<ConnectionSession>)> = self
            .lock_sessions()
            .iter()
            .filter(|(_, s)| self.policy.should_evict(s, now))
            .map(|(host, s)| (host.clone(), s.clone()))
            .collect();

        let mut evicted = Vec::new();
        for (host, session) in candidates {
            if !session.retire_if_idle() {
                log::debug!("FTP registry: {} picked up work, not evicting", host);
                continue;
            }
            self.detach(&host);
            session.close().await;
            evicted.push(host);
        }
        if !evicted.is_empty() {
            log::info!("FTP registry: evicted {} idle session(s)", evicted.len());
        }
        evicted
    }

    /// Remove `host` from the table and stop mirroring its activity.
    fn detach(&self, host: &str) -> Option<Arc<ConnectionSession>> {
        let removed = {
            let mut sessions = self.lock_sessions();
            let removed = sessions.remove(host);
            if removed.is_some() {
                self.publish(&sessions);
            }
            removed
        };
        if removed.is_some() {
            if let Some(forwarder) = self.lock_forwarders().remove(host) {
                forwarder.abort();
            }
        }
        removed
    }

    /// NOOP every session; sessions whose connection is gone are dropped.
    pub async fn keepalive_all(&self) {
        for session in self.sessions() {
            if session.is_busy() {
                continue;
            }
            if let Err(e) = session.keepalive().await {
                log::warn!("Keepalive to {} failed: {}", session.host(), e);
                if !e.is_cancelled() && e.kind != FtpErrorKind::Protocol {
                    self.unregister(session.host()).await;
                }
            }
        }
    }

    /// Periodically evict idle sessions and (if enabled) send keepalives.
    /// The task ends once the registry is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.sweep_interval_sec.max(1));
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.evict_idle().await;
                if registry.config.keepalive {
                    registry.keepalive_all().await;
                }
            }
        })
    }

    /// Unregister every session.
    pub async fn shutdown(&self) {
        let hosts: Vec<String> = self.lock_sessions().keys().cloned().collect();
        for host in hosts {
            self.unregister(&host).await;
        }
    }

    fn publish(&self, sessions: &HashMap<String, Arc<ConnectionSession>>) {
        let mut rows: Vec<ActiveServer> = sessions
            .values()
            .map(|s| ActiveServer {
                host: s.host().to_string(),
                label: s.identity().label.clone(),
                has_upload_node: s.has_active_upload(),
                has_download_node: s.has_active_download(),
            })
            .collect();
        rows.sort_by(|a, b| a.host.cmp(&b.host));
        self.active.send_if_modified(|current| {
            if *current == rows {
                return false;
            }
            *current = rows;
            true
        });
    }

    fn spawn_forwarder(&self, session: &ConnectionSession) {
        let host = session.host().to_string();
        let task = tokio::spawn(forward_activity(
            host.clone(),
            session.queue(TransferDirection::Upload).activity(),
            session.queue(TransferDirection::Download).activity(),
            self.active.clone(),
        ));
        if let Some(old) = self.lock_forwarders().insert(host, task) {
            old.abort();
        }
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        for (_, task) in self.lock_forwarders().drain() {
            task.abort();
        }
    }
}

/// Mirror one session's queue activity into its row.
async fn forward_activity(
    host: String,
    mut uploads: watch::Receiver<bool>,
    mut downloads: watch::Receiver<bool>,
    active: Arc<watch::Sender<Vec<ActiveServer>>>,
) {
    loop {
        tokio::select! {
            changed = uploads.changed() => if changed.is_err() { break },
            changed = downloads.changed() => if changed.is_err() { break },
        }
        let up = *uploads.borrow_and_update();
        let down = *downloads.borrow_and_update();
        active.send_if_modified(|rows| match rows.iter_mut().find(|r| r.host == host) {
            Some(row) if row.has_upload_node != up || row.has_download_node != down => {
                row.has_upload_node = up;
                row.has_download_node = down;
                true
            }
            _ => false,
        });
    }
}
