//! Retry decorator for any [`MediaServerApi`].

use super::MediaServerApi;
use crate::error::ShareError;
use crate::models::{
    Credential, GrantId, Library, LinkedAccount, Mapped, PinId, PinSession, PinStatus,
    RemoteAccount, RemoteUser, ServerId, ShareGrant, ShareInvite, SharePatch,
};
use async_trait::async_trait;
use service_core::clock::Clock;
use service_core::retry::{retry_call, RetryConfig};
use std::sync::Arc;

/// Retries `Transient` failures with backoff and `RateLimited` ones after the
/// mandated delay. Anything else is returned on the first attempt.
pub struct RetryingApi<A> {
    inner: A,
    config: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl<A: MediaServerApi> RetryingApi<A> {
    pub fn new(inner: A, config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            config,
            clock,
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}

#[async_trait]
impl<A: MediaServerApi> MediaServerApi for RetryingApi<A> {
    async fn fetch_users(&self, credential: &Credential) -> Result<Mapped<RemoteUser>, ShareError> {
        retry_call(&self.config, self.clock.as_ref(), "fetch_users", || {
            self.inner.fetch_users(credential)
        })
        .await
    }

    async fn fetch_account(&self, credential: &Credential) -> Result<RemoteAccount, ShareError> {
        retry_call(&self.config, self.clock.as_ref(), "fetch_account", || {
            self.inner.fetch_account(credential)
        })
        .await
    }

    async fn fetch_server_libraries(
        &self,
        credential: &Credential,
        server_id: &ServerId,
    ) -> Result<Vec<Library>, ShareError> {
        retry_call(&self.config, self.clock.as_ref(), "fetch_server_libraries", || {
            self.inner.fetch_server_libraries(credential, server_id)
        })
        .await
    }

    async fn fetch_shares(
        &self,
        credential: &Credential,
        server_id: &ServerId,
    ) -> Result<Mapped<ShareGrant>, ShareError> {
        retry_call(&self.config, self.clock.as_ref(), "fetch_shares", || {
            self.inner.fetch_shares(credential, server_id)
        })
        .await
    }

    async fn create_share(
        &self,
        credential: &Credential,
        invite: &ShareInvite,
    ) -> Result<ShareGrant, ShareError> {
        retry_call(&self.config, self.clock.as_ref(), "create_share", || {
            self.inner.create_share(credential, invite)
        })
        .await
    }

    async fn update_share(
        &self,
        credential: &Credential,
        server_id: &ServerId,
        grant_id: &GrantId,
        patch: &SharePatch,
    ) -> Result<ShareGrant, ShareError> {
        retry_call(&self.config, self.clock.as_ref(), "update_share", || {
            self.inner.update_share(credential, server_id, grant_id, patch)
        })
        .await
    }

    async fn revoke_share(&self, credential: &Credential, grant_id: &GrantId) -> Result<(), ShareError> {
        retry_call(&self.config, self.clock.as_ref(), "revoke_share", || {
            self.inner.revoke_share(credential, grant_id)
        })
        .await
    }

    async fn create_pin(&self) -> Result<PinSession, ShareError> {
        retry_call(&self.config, self.clock.as_ref(), "create_pin", || {
            self.inner.create_pin()
        })
        .await
    }

    /// Not retried here: the PIN flow already polls on a fixed cadence and
    /// treats transient failures as "still waiting".
    async fn poll_pin(&self, pin_id: &PinId) -> Result<PinStatus, ShareError> {
        self.inner.poll_pin(pin_id).await
    }

    async fn exchange_token(&self, credential: Credential) -> Result<LinkedAccount, ShareError> {
        retry_call(&self.config, self.clock.as_ref(), "exchange_token", || {
            self.inner.exchange_token(credential.clone())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::client::{FakeMediaServer, Operation};
    use service_core::clock::TokioClock;
    use std::time::Duration;

    fn retrying(fake: FakeMediaServer) -> RetryingApi<FakeMediaServer> {
        RetryingApi::new(fake, RetryConfig::default(), Arc::new(TokioClock))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let fake = FakeMediaServer::new();
        let credential = fake.link_owner("owner-token").await;
        fake.fail_next(Operation::FetchUsers, ShareError::Transient("502".into()))
            .await;
        fake.fail_next(Operation::FetchUsers, ShareError::Transient("503".into()))
            .await;

        let api = retrying(fake);
        let users = api.fetch_users(&credential).await.unwrap();
        assert!(users.items.is_empty());
        assert_eq!(api.inner().call_count(Operation::FetchUsers).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_for_mandated_delay() {
        let fake = FakeMediaServer::new();
        let credential = fake.link_owner("owner-token").await;
        fake.fail_next(
            Operation::FetchAccount,
            ShareError::RateLimited {
                retry_after: Duration::from_secs(4),
            },
        )
        .await;

        let api = retrying(fake);
        let start = tokio::time::Instant::now();
        api.fetch_account(&credential).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_is_not_retried() {
        let fake = FakeMediaServer::new();
        let api = retrying(fake);

        let err = api
            .fetch_users(&Credential::new("stale-token"))
            .await
            .unwrap_err();
        assert_eq!(err, ShareError::Unauthorized);
        assert_eq!(api.inner().call_count(Operation::FetchUsers).await, 1);
    }
}
