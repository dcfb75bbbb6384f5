pub mod config;
pub mod error;
pub mod shutdown;
pub mod types;

pub use config::LockConfig;
pub use error::{LockError, TarnResult};
pub use types::{LockMode, LockerId, ResourceId, ResourceType};
