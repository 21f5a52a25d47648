pub mod chain;
pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use chain::{Chain, ChainMode, ChainStatus, Step, StepStatus, StepTodo, SubStep, TodoStatus};
pub use config::AppConfig;
pub use error::{Result, TasklaneError};
pub use event::EventBus;
pub use types::*;
