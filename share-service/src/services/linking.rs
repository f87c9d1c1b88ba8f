//! `ShareService`: the operations exposed to callers.
//!
//! Ties the PIN flow, the reconciliation engine and the collaborator stores
//! together. All state is keyed by local user, so different users can link
//! and reconcile concurrently.

use crate::error::ShareError;
use crate::models::{LinkedAccount, LocalUserId, Mapped, PinId, PinSession, RemoteAccount, RemoteUser};
use crate::services::client::MediaServerApi;
use crate::services::pin::PinFlow;
use crate::services::reconcile::{ReconcileEngine, ReconcileReport};
use crate::services::store::{CredentialStore, PolicySource};
use dashmap::DashSet;
use service_core::clock::Clock;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Tuning knobs for [`ShareService`].
#[derive(Debug, Clone)]
pub struct ShareServiceOptions {
    pub poll_interval: Duration,
    pub max_concurrency: usize,
}

impl Default for ShareServiceOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_concurrency: 4,
        }
    }
}

/// Marks a local user's reconciliation as in flight until dropped.
struct InFlight<'a> {
    set: &'a DashSet<LocalUserId>,
    user: LocalUserId,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a DashSet<LocalUserId>, user: &LocalUserId) -> Result<Self, ShareError> {
        if !set.insert(user.clone()) {
            return Err(ShareError::Busy);
        }
        Ok(Self {
            set,
            user: user.clone(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.user);
    }
}

pub struct ShareService {
    api: Arc<dyn MediaServerApi>,
    credentials: Arc<dyn CredentialStore>,
    policy: Arc<dyn PolicySource>,
    pins: PinFlow,
    engine: ReconcileEngine,
    reconciling: DashSet<LocalUserId>,
}

impl ShareService {
    pub fn new(
        api: Arc<dyn MediaServerApi>,
        credentials: Arc<dyn CredentialStore>,
        policy: Arc<dyn PolicySource>,
        clock: Arc<dyn Clock>,
        options: ShareServiceOptions,
    ) -> Self {
        Self {
            pins: PinFlow::new(api.clone(), clock, options.poll_interval),
            engine: ReconcileEngine::new(api.clone(), options.max_concurrency),
            api,
            credentials,
            policy,
            reconciling: DashSet::new(),
        }
    }

    /// Start linking: returns the code the user must enter on the media
    /// server's link page.
    pub async fn begin_authorization(&self, user: &LocalUserId) -> Result<PinSession, ShareError> {
        self.pins.begin(user).await
    }

    /// Wait for the code to be claimed, then store the credential.
    #[instrument(skip_all, fields(user = %user, pin_id = %pin_id))]
    pub async fn await_authorization(
        &self,
        user: &LocalUserId,
        pin_id: &PinId,
        max_wait: Duration,
    ) -> Result<RemoteAccount, ShareError> {
        let linked = self.pins.wait(user, pin_id, max_wait).await?;
        self.credentials.save(user, &linked).await?;
        tracing::info!(remote_id = %linked.account.remote_id, "Media server account linked");
        Ok(linked.account)
    }

    pub fn cancel_authorization(&self, user: &LocalUserId) -> bool {
        self.pins.cancel(user)
    }

    /// The code `user` is currently asked to enter, if any.
    pub fn pending_authorization(&self, user: &LocalUserId) -> Option<PinSession> {
        self.pins.session(user)
    }

    /// Run one reconciliation pass. A second pass for the same user while one
    /// is running is rejected with `Busy`.
    #[instrument(skip_all, fields(user = %user))]
    pub async fn reconcile(&self, user: &LocalUserId) -> Result<ReconcileReport, ShareError> {
        let _in_flight = InFlight::acquire(&self.reconciling, user)?;

        let linked = self.linked(user).await?;
        let desired = self.policy.desired_share_state(user).await?;
        self.engine.run(&linked.credential, &desired).await
    }

    /// Friends and home members of the linked account.
    pub async fn remote_users(&self, user: &LocalUserId) -> Result<Mapped<RemoteUser>, ShareError> {
        let linked = self.linked(user).await?;
        self.api.fetch_users(&linked.credential).await
    }

    /// Re-read the linked account's profile and store the update.
    #[instrument(skip_all, fields(user = %user))]
    pub async fn refresh_account(&self, user: &LocalUserId) -> Result<RemoteAccount, ShareError> {
        let linked = self.linked(user).await?;
        let account = self.api.fetch_account(&linked.credential).await?;
        if account.remote_id != linked.account.remote_id {
            tracing::warn!(
                stored = %linked.account.remote_id,
                reported = %account.remote_id,
                "Credential now belongs to a different account"
            );
        }
        self.credentials
            .save(
                user,
                &LinkedAccount {
                    account: account.clone(),
                    credential: linked.credential,
                },
            )
            .await?;
        Ok(account)
    }

    /// Forget the stored link. Grants on the media server are left alone.
    #[instrument(skip_all, fields(user = %user))]
    pub async fn unlink(&self, user: &LocalUserId) -> Result<(), ShareError> {
        self.pins.cancel(user);
        if self.credentials.remove(user).await? {
            tracing::info!("Media server account unlinked");
            Ok(())
        } else {
            Err(ShareError::NotLinked)
        }
    }

    /// Whether `user` has a stored credential.
    pub async fn is_linked(&self, user: &LocalUserId) -> Result<bool, ShareError> {
        Ok(self.credentials.load(user).await?.is_some())
    }

    async fn linked(&self, user: &LocalUserId) -> Result<LinkedAccount, ShareError> {
        self.credentials
            .load(user)
            .await?
            .ok_or(ShareError::NotLinked)
    }
}
