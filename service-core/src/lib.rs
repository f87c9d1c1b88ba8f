//! service-core: Shared infrastructure for the share workspace.
pub mod clock;
pub mod config;
pub mod error;
pub mod observability;
pub mod retry;

pub use async_trait;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;
