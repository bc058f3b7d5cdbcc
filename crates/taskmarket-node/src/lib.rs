pub mod config;
pub mod logging;
pub mod node;

pub use config::{LoggingConfig, NodeConfig};
pub use logging::init_logging;
pub use node::{MarketNode, ShutdownReport};
