pub mod config;
pub mod error;
pub mod event;
pub mod expr;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::EngineConfig;
pub use error::{Result, TesseraError};
pub use event::EventBus;
pub use expr::Expression;
pub use types::*;
pub use workflow::*;
