//! Background sweepers: periodic upkeep wired into [ServicesManager] like any
//! other [Service](crate::services::Service), instead of a one-off
//! `tokio::spawn` in `main`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::content_store::ContentStore;
use crate::services::manager::{Service, ServiceHealth};
use crate::session::SessionManager;

/// Periodically runs [ContentStore::sweep] to evict expired or failed
/// content entries.
pub struct ContentSweeperService {
    content_store: Arc<ContentStore>,
    interval: Duration,
    cancel: CancellationToken,
    join_handle: parking_lot::RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl ContentSweeperService {
    pub fn new(content_store: Arc<ContentStore>, interval: Duration) -> Self {
        Self {
            content_store,
            interval,
            cancel: CancellationToken::new(),
            join_handle: parking_lot::RwLock::new(None),
        }
    }
}

#[async_trait]
impl Service for ContentSweeperService {
    fn name(&self) -> &str {
        "content-sweeper"
    }

    async fn start(&self) -> Result<()> {
        let content_store = self.content_store.clone();
        let interval = self.interval;
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = content_store.sweep().await;
                        debug!(evicted, "content sweeper tick");
                    }
                }
            }
        });
        *self.join_handle.write() = Some(handle);
        info!(service = self.name(), "content sweeper started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.write().take() {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        if self.join_handle.read().is_some() {
            Ok(ServiceHealth::healthy())
        } else {
            Ok(ServiceHealth::unhealthy("sweeper task not running"))
        }
    }
}

/// Periodically runs [SessionManager::cleanup_stale] to drop terminal
/// sessions old enough that no client will poll them again.
pub struct SessionReaperService {
    sessions: Arc<SessionManager>,
    interval: Duration,
    max_age: Duration,
    cancel: CancellationToken,
    join_handle: parking_lot::RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionReaperService {
    pub fn new(sessions: Arc<SessionManager>, interval: Duration, max_age: Duration) -> Self {
        Self {
            sessions,
            interval,
            max_age,
            cancel: CancellationToken::new(),
            join_handle: parking_lot::RwLock::new(None),
        }
    }
}

#[async_trait]
impl Service for SessionReaperService {
    fn name(&self) -> &str {
        "session-reaper"
    }

    async fn start(&self) -> Result<()> {
        let sessions = self.sessions.clone();
        let interval = self.interval;
        let max_age = self.max_age;
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let dropped = sessions.cleanup_stale(max_age).await;
                        debug!(dropped, "session reaper tick");
                    }
                }
            }
        });
        *self.join_handle.write() = Some(handle);
        info!(service = self.name(), "session reaper started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.write().take() {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        if self.join_handle.read().is_some() {
            Ok(ServiceHealth::healthy())
        } else {
            Ok(ServiceHealth::unhealthy("reaper task not running"))
        }
    }
}
