pub mod config;
pub mod errors;
pub mod types;

pub use config::EngineConfig;
pub use errors::{JhviewError, TransportError};
pub use types::*;
