//! External service client.
//!
//! [`MediaServerApi`] is the only seam through which the core talks to the
//! media server. Every credentialed call takes the caller's [`Credential`]
//! explicitly; nothing is cached between calls.

pub mod mock;
pub mod plex;
pub mod retrying;

use crate::error::ShareError;
use crate::models::{
    Credential, GrantId, Library, LinkedAccount, Mapped, PinId, PinSession, PinStatus,
    RemoteAccount, RemoteUser, ServerId, ShareGrant, ShareInvite, SharePatch,
};
use async_trait::async_trait;

pub use mock::{ApiCall, FakeMediaServer, Operation};
pub use plex::PlexClient;
pub use retrying::RetryingApi;

#[async_trait]
pub trait MediaServerApi: Send + Sync {
    /// Friends and home members of the linked account.
    async fn fetch_users(&self, credential: &Credential) -> Result<Mapped<RemoteUser>, ShareError>;

    /// Profile of the linked account.
    async fn fetch_account(&self, credential: &Credential) -> Result<RemoteAccount, ShareError>;

    async fn fetch_server_libraries(
        &self,
        credential: &Credential,
        server_id: &ServerId,
    ) -> Result<Vec<Library>, ShareError>;

    async fn fetch_shares(
        &self,
        credential: &Credential,
        server_id: &ServerId,
    ) -> Result<Mapped<ShareGrant>, ShareError>;

    async fn create_share(
        &self,
        credential: &Credential,
        invite: &ShareInvite,
    ) -> Result<ShareGrant, ShareError>;

    /// Apply `patch` to an existing grant. Only the fields present in the
    /// patch are sent.
    async fn update_share(
        &self,
        credential: &Credential,
        server_id: &ServerId,
        grant_id: &GrantId,
        patch: &SharePatch,
    ) -> Result<ShareGrant, ShareError>;

    /// Revoke a grant. A grant that no longer exists counts as revoked.
    async fn revoke_share(&self, credential: &Credential, grant_id: &GrantId)
        -> Result<(), ShareError>;

    /// Request a fresh device-authorization code.
    async fn create_pin(&self) -> Result<PinSession, ShareError>;

    async fn poll_pin(&self, pin_id: &PinId) -> Result<PinStatus, ShareError>;

    /// Validate a claimed token and resolve the account it belongs to.
    async fn exchange_token(&self, credential: Credential) -> Result<LinkedAccount, ShareError>;
}
