pub mod audit;
pub mod config;
pub mod instrument;
pub mod position;
pub mod signal;
pub mod symbols;

pub use audit::{AuditRecord, OrderAudit, RiskAudit, SignalOutcome, SizingAudit, ValidationAudit};
pub use config::ServiceConfig;
pub use instrument::{Exchange, Instrument, InstrumentConfig};
pub use position::{Position, PositionStatus, RolloverStatus};
pub use signal::{Signal, SignalError, SignalKind};
