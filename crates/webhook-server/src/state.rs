use std::sync::Arc;

use async_trait::async_trait;

use db_state::DbStateManager;
use live_engine::LiveEngine;
use redis_coordinator::RedisCoordinator;
use signal_validation::DuplicateDetector;

/// Leader gate seam so routes can be exercised without a live redis.
#[async_trait]
pub trait LeaderGate: Send + Sync {
    fn is_leader(&self) -> bool;
    fn instance_id(&self) -> &str;

    /// Per-signal lock closing the dispatch race window. Implementations
    /// without a shared store admit by default.
    async fn acquire_signal_lock(&self, _fingerprint: &str) -> bool {
        true
    }

    async fn release_signal_lock(&self, _fingerprint: &str) {}
}

#[async_trait]
impl LeaderGate for RedisCoordinator {
    fn is_leader(&self) -> bool {
        RedisCoordinator::is_leader(self)
    }

    fn instance_id(&self) -> &str {
        RedisCoordinator::instance_id(self)
    }

    async fn acquire_signal_lock(&self, fingerprint: &str) -> bool {
        RedisCoordinator::acquire_signal_lock(self, fingerprint).await
    }

    async fn release_signal_lock(&self, fingerprint: &str) {
        RedisCoordinator::release_signal_lock(self, fingerprint).await
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LiveEngine>,
    pub leader: Arc<dyn LeaderGate>,
    pub dedup: Arc<DuplicateDetector>,
    pub db: Option<Arc<DbStateManager>>,
    /// Coordinator metrics for the stats endpoint; absent in tests.
    pub coordinator: Option<RedisCoordinator>,
}
