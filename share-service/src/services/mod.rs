pub mod client;
pub mod linking;
pub mod mapper;
pub mod metrics;
pub mod pin;
pub mod reconcile;
pub mod store;

pub use client::{FakeMediaServer, MediaServerApi, PlexClient, RetryingApi};
pub use linking::{ShareService, ShareServiceOptions};
pub use metrics::{get_metrics, init_metrics};
pub use pin::PinFlow;
pub use reconcile::{AccountResult, Action, Outcome, ReconcileEngine, ReconcileReport};
pub use store::{
    CredentialStore, InMemoryCredentialStore, InMemoryPolicySource, JsonFileCredentialStore,
    JsonFilePolicySource, PolicySource,
};
