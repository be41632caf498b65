//! Navigation state machine: `Idle | Ready → Navigating → Ready | Error`.
//!
//! Navigations on one session run one at a time. The path and listing move
//! only when both the directory change and the listing succeed; on failure
//! the previous ones are kept and the error is recorded.

use crate::ftp::client::SharedClient;
use crate::ftp::error::FtpResult;
use crate::ftp::types::{DirectoryEntry, NavigationSnapshot, NavigationState};
use tokio::sync::{watch, Mutex};

pub struct NavigationController {
    gate: Mutex<()>,
    state: watch::Sender<NavigationSnapshot>,
}

impl NavigationController {
    pub fn new(initial_path: impl Into<String>) -> Self {
        let (state, _) = watch::channel(NavigationSnapshot {
            state: NavigationState::Idle,
            current_path: initial_path.into(),
            listing: Vec::new(),
            target: None,
            last_error: None,
        });
        Self {
            gate: Mutex::new(()),
            state,
        }
    }

    pub fn snapshot(&self) -> NavigationSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NavigationSnapshot> {
        self.state.subscribe()
    }

    pub fn state(&self) -> NavigationState {
        self.state.borrow().state
    }

    pub fn current_path(&self) -> String {
        self.state.borrow().current_path.clone()
    }

    pub fn listing(&self) -> Vec<DirectoryEntry> {
        self.state.borrow().listing.clone()
    }

    /// Change to `path` and list it through `client`.
    pub async fn navigate(&self, client: &SharedClient, path: &str) -> FtpResult<Vec<DirectoryEntry>> {
        let _turn = self.gate.lock().await;

        self.state.send_modify(|s| {
            s.state = NavigationState::Navigating;
            s.target = Some(path.to_string());
        });
        log::debug!("navigating to {}", path);

        let result = {
            let mut guard = client.lock().await;
            guard
                .change_directory(path)
                .await
                .map(|entries| (guard.current_path().to_string(), entries))
        };

        match result {
            Ok((resolved, entries)) => {
                self.state.send_modify(|s| {
                    s.state = NavigationState::Ready;
                    s.current_path = resolved;
                    s.listing = entries.clone();
                    s.last_error = None;
                });
                Ok(entries)
            }
            Err(e) => {
                log::debug!("navigation to {} failed: {}", path, e);
                self.state.send_modify(|s| {
                    s.state = NavigationState::Error;
                    s.last_error = Some(e.to_string());
                });
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::client::ProtocolClient;
    use crate::ftp::config::RetryConfig;
    use crate::ftp::memory::{MemoryClient, MemoryServer};
    use crate::ftp::types::ServerIdentity;
    use std::sync::Arc;
    use std::time::Duration;

    async fn shared(server: &MemoryServer) -> SharedClient {
        let c = MemoryClient::connect(server.clone(), &ServerIdentity::new("mem"), &RetryConfig::none())
            .await
            .unwrap();
        Arc::new(Mutex::new(Box::new(c) as Box<dyn ProtocolClient>))
    }

    #[tokio::test]
    async fn success_moves_to_ready() {
        let server = MemoryServer::new();
        server.put_file("/pub/a.txt", b"abc".to_vec());
        let client = shared(&server).await;
        let nav = NavigationController::new("/");
        assert_eq!(nav.state(), NavigationState::Idle);

        let entries = nav.navigate(&client, "pub").await.unwrap();
        assert_eq!(entries.len(), 1);
        let snap = nav.snapshot();
        assert_eq!(snap.state, NavigationState::Ready);
        assert_eq!(snap.current_path, "/pub");
        assert_eq!(snap.listing, entries);
        assert_eq!(snap.target.as_deref(), Some("pub"));
    }

    #[tokio::test]
    async fn failed_listing_keeps_path_and_listing() {
        let server = MemoryServer::new();
        server.add_dir("/pub");
        server.put_file("/root.txt", b"r".to_vec());
        let client = shared(&server).await;
        let nav = NavigationController::new("/");
        nav.navigate(&client, "/").await.unwrap();
        let before = nav.snapshot();

        server.fail_next_lists(1);
        assert!(nav.navigate(&client, "/pub").await.is_err());

        let after = nav.snapshot();
        assert_eq!(after.state, NavigationState::Error);
        assert_eq!(after.current_path, before.current_path);
        assert_eq!(after.listing, before.listing);
        assert!(after.last_error.unwrap().contains("450"));
        assert_eq!(client.lock().await.current_path(), "/");
    }

    #[tokio::test]
    async fn missing_directory_is_an_error_state() {
        let server = MemoryServer::new();
        let client = shared(&server).await;
        let nav = NavigationController::new("/");
        assert!(nav.navigate(&client, "/nope").await.is_err());
        assert_eq!(nav.state(), NavigationState::Error);
        assert_eq!(nav.current_path(), "/");

        // Recovers on the next good navigation.
        nav.navigate(&client, "/").await.unwrap();
        assert_eq!(nav.state(), NavigationState::Ready);
        assert!(nav.snapshot().last_error.is_none());
    }

    #[tokio::test]
    async fn observers_see_navigating_first() {
        let server = MemoryServer::new();
        server.set_op_delay(Duration::from_millis(20));
        let client = shared(&server).await;
        let nav = Arc::new(NavigationController::new("/"));
        let mut rx = nav.subscribe();

        let task = {
            let nav = nav.clone();
            let client = client.clone();
            tokio::spawn(async move { nav.navigate(&client, "/").await })
        };
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().state, NavigationState::Navigating);
        task.await.unwrap().unwrap();
        assert_eq!(nav.state(), NavigationState::Ready);
    }

    #[tokio::test]
    async fn concurrent_navigations_do_not_overlap() {
        let server = MemoryServer::new();
        server.add_dir("/a");
        server.add_dir("/b");
        server.set_op_delay(Duration::from_millis(5));
        let client = shared(&server).await;
        let nav = Arc::new(NavigationController::new("/"));

        let mut tasks = Vec::new();
        for path in ["/a", "/b", "/a", "/"] {
            let nav = nav.clone();
            let client = client.clone();
            tasks.push(tokio::spawn(async move { nav.navigate(&client, path).await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(server.max_overlap(), 1);
        assert_eq!(nav.state(), NavigationState::Ready);
    }
}
