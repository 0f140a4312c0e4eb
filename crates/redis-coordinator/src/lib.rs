pub mod coordinator;
pub mod instance;
pub mod metrics;

pub use coordinator::{
    CoordinatorConfig, DbLeader, HeartbeatHandle, LeaderStore, RedisCoordinator, SplitBrain,
    HEARTBEAT_PREFIX, LEADER_KEY, SIGNAL_LOCK_PREFIX,
};
pub use metrics::{AlertStatus, Alerts, CoordinatorMetrics, MetricsSnapshot};
