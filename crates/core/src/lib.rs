pub mod capability;
pub mod config;
pub mod error;
pub mod message;
pub mod paths;
pub mod types;

pub use capability::{BehaviorClass, CapabilityDefinition};
pub use config::Config;
pub use error::{Error, Result};
pub use message::Message;
pub use paths::Paths;
