pub mod monitor;
pub mod scheduler;

pub use monitor::{EodExecutionState, EodMonitor, EodSlot, PositionStatusView};
pub use scheduler::{
    market_offset, next_fire_instant, EodCallbacks, EodJobResult, EodPhase, EodScheduleConfig,
    EodScheduler,
};
