//! Common test utilities for share-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use service_core::clock::TokioClock;
use share_service::models::{
    Credential, DesiredShareState, GrantId, GrantStatus, Invitee, LibrarySelection, LinkedAccount,
    LocalUserId, MediaType, RemoteId, ServerId, ShareGrant,
};
use share_service::services::client::mock::remote_user;
use share_service::services::{
    CredentialStore, FakeMediaServer, InMemoryCredentialStore, InMemoryPolicySource,
    MediaServerApi, ShareService, ShareServiceOptions,
};
use share_service::ShareError;
use std::sync::Arc;
use std::time::Duration;

pub const SERVER: &str = "server-1";
pub const OWNER_TOKEN: &str = "owner-token";

/// A share service wired to an in-memory media server, with one local user
/// already linked to the owner account.
pub struct TestApp {
    pub fake: FakeMediaServer,
    pub service: Arc<ShareService>,
    pub credentials: Arc<InMemoryCredentialStore>,
    pub policy: Arc<InMemoryPolicySource>,
    pub user: LocalUserId,
    pub credential: Credential,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|credentials| credentials).await
    }

    /// Spawn with the credential store wrapped by `wrap`.
    pub async fn spawn_with<F>(wrap: F) -> Self
    where
        F: FnOnce(Arc<InMemoryCredentialStore>) -> Arc<dyn CredentialStore>,
    {
        let fake = FakeMediaServer::new();
        let credential = fake.link_owner(OWNER_TOKEN).await;
        fake.add_library(SERVER, "1", "Movies", MediaType::Movie).await;
        fake.add_library(SERVER, "2", "TV Shows", MediaType::Show).await;
        fake.add_library(SERVER, "3", "Music", MediaType::Music).await;
        fake.add_user(remote_user("101", "alice", Some("alice@example.com")))
            .await;
        fake.add_user(remote_user("102", "bob", Some("bob@example.com")))
            .await;
        fake.add_user(remote_user("103", "carol", Some("carol@example.com")))
            .await;
        fake.set_auto_accept(true).await;

        let user = LocalUserId::from("local-owner");
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let account = fake.fetch_account(&credential).await.unwrap();
        credentials
            .save(
                &user,
                &LinkedAccount {
                    account,
                    credential: credential.clone(),
                },
            )
            .await
            .unwrap();
        fake.clear_calls().await;

        let policy = Arc::new(InMemoryPolicySource::new());
        policy.set(&user, DesiredShareState::new(SERVER));

        let service = ShareService::new(
            Arc::new(fake.clone()),
            wrap(credentials.clone()),
            policy.clone(),
            Arc::new(TokioClock),
            ShareServiceOptions {
                poll_interval: Duration::from_secs(2),
                max_concurrency: 4,
            },
        );

        Self {
            fake,
            service: Arc::new(service),
            credentials,
            policy,
            user,
            credential,
        }
    }

    pub fn set_policy(&self, desired: DesiredShareState) {
        self.policy.set(&self.user, desired);
    }

    /// Seed an existing grant for a remote user on the test server.
    pub async fn seed_grant(
        &self,
        remote_id: &str,
        email: &str,
        libraries: LibrarySelection,
        status: GrantStatus,
    ) -> GrantId {
        self.fake
            .seed_grant(ShareGrant {
                grant_id: None,
                server_id: ServerId::from(SERVER),
                invitee: Invitee {
                    remote_id: Some(RemoteId::from(remote_id)),
                    email: Some(email.to_string()),
                    username: None,
                },
                libraries,
                filters: Default::default(),
                status,
                accepted_at: None,
            })
            .await
    }

    pub async fn mutations(&self) -> Vec<share_service::services::client::ApiCall> {
        self.fake
            .calls()
            .await
            .into_iter()
            .filter(|call| call.is_mutation())
            .collect()
    }
}

/// Credential store that takes `delay` to load, so a pass stays in flight.
pub struct SlowCredentialStore {
    pub inner: Arc<InMemoryCredentialStore>,
    pub delay: Duration,
}

#[async_trait]
impl CredentialStore for SlowCredentialStore {
    async fn load(&self, user: &LocalUserId) -> Result<Option<LinkedAccount>, ShareError> {
        tokio::time::sleep(self.delay).await;
        self.inner.load(user).await
    }

    async fn save(&self, user: &LocalUserId, linked: &LinkedAccount) -> Result<(), ShareError> {
        self.inner.save(user, linked).await
    }

    async fn remove(&self, user: &LocalUserId) -> Result<bool, ShareError> {
        self.inner.remove(user).await
    }
}
