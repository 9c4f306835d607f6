pub mod cli;
pub mod config;
pub mod discoverer;
pub mod error;
pub mod k8s;
pub mod metrics;
pub mod probe;
pub mod queue;

pub use config::DiscoveryConfig;
pub use discoverer::Discoverer;
pub use error::{KubedoxError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
