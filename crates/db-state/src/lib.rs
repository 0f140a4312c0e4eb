pub mod manager;
pub mod schema;

pub use manager::{
    DbStateManager, LeadershipSpan, PortfolioStateRecord, PyramidingStateRecord, StaleInstance,
};
