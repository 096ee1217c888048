pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod interaction;
pub mod process;
pub mod run;
pub mod traits;
pub mod types;
pub mod vibe;

pub use config::AppConfig;
pub use context::ExecutionContext;
pub use error::{PhaseflowError, Result};
pub use event::EventBus;
pub use types::*;
