mod client;
pub mod error;
mod eviction;

pub use self::client::*;
pub use self::error::Error as NodeClientError;
pub use self::eviction::{EvictionDecision, EvictionPolicy};

#[cfg(feature = "mockall")]
pub use self::client::MockNodeClient;
