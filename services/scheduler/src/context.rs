//! Shared scheduler context.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::SharedClock;
use crate::config::Config;
use crate::connection::ClusterConnection;
use crate::driver::ClusterDriver;
use crate::notify::Notifier;
use crate::offer::OfferPool;
use crate::store::{LockManager, Store};

/// Everything a scheduler component needs, passed explicitly.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub driver: Arc<dyn ClusterDriver>,
    pub offers: Arc<OfferPool>,
    pub locks: Arc<LockManager>,
    pub notifier: Arc<Notifier>,
    pub connection: Arc<ClusterConnection>,
    pub clock: SharedClock,
}

impl Context {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        driver: Arc<dyn ClusterDriver>,
        notifier: Notifier,
        clock: SharedClock,
    ) -> Self {
        let connection = ClusterConnection::new(&config.heartbeat, clock.clone());
        Self {
            config: Arc::new(config),
            store,
            driver,
            offers: Arc::new(OfferPool::new()),
            locks: Arc::new(LockManager::new()),
            notifier: Arc::new(notifier),
            connection: Arc::new(connection),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn cluster_id(&self) -> &str {
        &self.config.cluster.cluster_id
    }
}
