pub mod config;
pub mod errors;
pub mod types;

pub use config::AppConfig;
pub use errors::ConfigError;
pub use types::*;
