pub mod engine;
pub mod eod;
pub mod stats;

#[cfg(test)]
mod tests;

pub use engine::{LiveEngine, ProcessOutcome};
pub use eod::EngineEodHandler;
pub use stats::EngineStats;
