//! Config source contract.
//!
//! A source hands out full snapshots on request. Concrete integrations (files,
//! service discovery) live outside this crate; [`InMemoryConfigSource`] is the
//! in-process implementation used by embedders and tests.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;

use crate::config::schema::RawConfig;

/// Failure to reach the config source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("config source unavailable: {0}")]
    Unavailable(String),
}

/// Supplies raw config snapshots.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Return the current snapshot, or `None` when nothing changed.
    async fn get_config(&self) -> Result<Option<RawConfig>, SourceError>;

    /// Resolve once the source has new data. Sources without change
    /// notification never resolve and rely on the periodic pass.
    async fn changed(&self) {
        futures_util::future::pending::<()>().await
    }
}

/// A source backed by a snapshot held in memory.
#[derive(Debug)]
pub struct InMemoryConfigSource {
    snapshot: ArcSwap<RawConfig>,
    notify: Notify,
}

impl InMemoryConfigSource {
    pub fn new(config: RawConfig) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(config),
            notify: Notify::new(),
        }
    }

    /// Replace the snapshot and wake the reconciliation loop.
    pub fn update(&self, config: RawConfig) {
        self.snapshot.store(Arc::new(config));
        self.notify.notify_one();
    }

    pub fn current(&self) -> Arc<RawConfig> {
        self.snapshot.load_full()
    }
}

impl Default for InMemoryConfigSource {
    fn default() -> Self {
        Self::new(RawConfig::default())
    }
}

#[async_trait]
impl ConfigSource for InMemoryConfigSource {
    async fn get_config(&self) -> Result<Option<RawConfig>, SourceError> {
        Ok(Some(self.snapshot.load().as_ref().clone()))
    }

    async fn changed(&self) {
        self.notify.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ProxyRoute;
    use std::time::Duration;

    #[tokio::test]
    async fn test_update_replaces_snapshot_and_notifies() {
        let source = Arc::new(InMemoryConfigSource::default());
        assert!(source.get_config().await.unwrap().unwrap().routes.is_empty());

        let waiter = {
            let source = source.clone();
            tokio::spawn(async move { source.changed().await })
        };

        let mut config = RawConfig::default();
        config.routes.push(ProxyRoute {
            route_id: "r1".into(),
            ..Default::default()
        });
        source.update(config);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("change notification")
            .unwrap();
        assert_eq!(source.get_config().await.unwrap().unwrap().routes.len(), 1);
    }
}
