pub mod portfolio;
pub mod stops;

pub use portfolio::{Portfolio, PortfolioError, PortfolioSnapshot};
pub use stops::StopManager;
