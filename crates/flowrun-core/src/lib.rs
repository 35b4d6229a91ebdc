pub mod config;
pub mod document;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use document::FlowDocument;
pub use error::{ErrorKind, FlowError, Result};
pub use event::{EventBus, FlowEvent};
pub use types::*;
