//! Application startup and the reconciliation worker.
//!
//! The binary has no HTTP surface. It runs one task per configured local
//! user: link the account through the PIN flow when no credential is stored
//! or the stored one was rejected, otherwise reconcile on a fixed interval.

use crate::config::ShareConfig;
use crate::error::ShareError;
use crate::models::LocalUserId;
use crate::services::{
    JsonFileCredentialStore, JsonFilePolicySource, PlexClient, RetryingApi, ShareService,
    ShareServiceOptions,
};
use service_core::clock::{Clock, TokioClock};
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Pause before asking for a fresh code after one expired or failed.
const RELINK_DELAY: Duration = Duration::from_secs(5);

/// Where the user enters the code.
const LINK_URL: &str = "https://plex.tv/link";

/// Per-user worker settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub interval: Duration,
    pub max_wait: Duration,
}

/// Application container for managing the worker lifecycle.
pub struct Application {
    service: Arc<ShareService>,
    users: Vec<LocalUserId>,
    settings: WorkerSettings,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: ShareConfig) -> Result<Self, AppError> {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);

        let plex = PlexClient::new(config.plex.clone())
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to create media server client");
                AppError::ConfigError(anyhow::Error::new(e))
            })?
            .with_default_retry_after(config.retry.default_rate_limit());
        tracing::info!(
            api_base_url = %config.plex.api_base_url,
            client_identifier = %plex.client_identifier(),
            "Media server client initialized"
        );

        let api = Arc::new(RetryingApi::new(
            plex,
            config.retry.to_retry_config(),
            clock.clone(),
        ));
        let credentials = Arc::new(JsonFileCredentialStore::new(&config.store.credential_path));
        let policy = Arc::new(JsonFilePolicySource::new(&config.store.policy_path));

        let service = ShareService::new(
            api,
            credentials,
            policy,
            clock,
            ShareServiceOptions {
                poll_interval: config.pin.poll_interval(),
                max_concurrency: config.reconcile.max_concurrency,
            },
        );

        if config.reconcile.local_users.is_empty() {
            tracing::warn!("No local users configured - worker will idle");
        }

        Ok(Self::new(
            Arc::new(service),
            config.reconcile.local_users.clone(),
            WorkerSettings {
                interval: config.reconcile.interval(),
                max_wait: config.pin.max_wait(),
            },
        ))
    }

    /// Run workers for `users` over an already wired service.
    pub fn new(
        service: Arc<ShareService>,
        users: Vec<LocalUserId>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            service,
            users,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn service(&self) -> Arc<ShareService> {
        self.service.clone()
    }

    /// Token that stops every worker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the workers until the shutdown token is cancelled.
    pub async fn run_until_stopped(self) -> Result<(), AppError> {
        let mut workers = JoinSet::new();
        for user in self.users {
            let worker = UserWorker {
                service: self.service.clone(),
                user,
                settings: self.settings.clone(),
                shutdown: self.shutdown.clone(),
                reauthorize: false,
            };
            workers.spawn(worker.run());
        }

        tracing::info!(
            service = "share-service",
            version = env!("CARGO_PKG_VERSION"),
            workers = workers.len(),
            "Worker ready"
        );

        self.shutdown.cancelled().await;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        Ok(())
    }
}

struct UserWorker {
    service: Arc<ShareService>,
    user: LocalUserId,
    settings: WorkerSettings,
    shutdown: CancellationToken,
    /// The stored credential was rejected. It stays stored until a new code
    /// is claimed.
    reauthorize: bool,
}

impl UserWorker {
    async fn run(mut self) {
        tracing::info!(user = %self.user, "Worker started");
        let shutdown = self.shutdown.clone();

        loop {
            let pause = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                pause = self.step() => pause,
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.service.cancel_authorization(&self.user);
        tracing::info!(user = %self.user, "Worker stopped");
    }

    async fn step(&mut self) -> Duration {
        if self.reauthorize {
            return self.link().await;
        }
        match self.service.is_linked(&self.user).await {
            Ok(true) => self.reconcile().await,
            Ok(false) => self.link().await,
            Err(e) => {
                tracing::error!(user = %self.user, error = %e, "Credential store unavailable");
                self.settings.interval
            }
        }
    }

    /// One reconciliation pass. Returns how long to wait before the next step.
    async fn reconcile(&mut self) -> Duration {
        match self.service.reconcile(&self.user).await {
            Ok(report) => {
                for result in report.results.iter().filter(|r| !r.outcome.is_success()) {
                    tracing::warn!(
                        user = %self.user,
                        account = %result.account,
                        action = result.action.as_str(),
                        outcome = ?result.outcome,
                        "Account not converged"
                    );
                }
                self.settings.interval
            }
            Err(ShareError::Unauthorized) => {
                tracing::warn!(user = %self.user, "Credential rejected, re-authorization required");
                self.reauthorize = true;
                Duration::ZERO
            }
            Err(e) => {
                tracing::warn!(
                    user = %self.user,
                    error = %e,
                    kind = e.kind(),
                    guidance = e.guidance(),
                    "Reconciliation failed"
                );
                self.settings.interval
            }
        }
    }

    /// Run the PIN flow once. Returns how long to wait before the next step.
    async fn link(&mut self) -> Duration {
        let session = match self.service.begin_authorization(&self.user).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(
                    user = %self.user,
                    error = %e,
                    kind = e.kind(),
                    guidance = e.guidance(),
                    "Could not start authorization"
                );
                return RELINK_DELAY;
            }
        };

        tracing::info!(
            user = %self.user,
            code = %session.code,
            link_url = LINK_URL,
            expires_at = %session.expires_at,
            "Enter the code on the link page to connect your media server account"
        );

        let outcome = self
            .service
            .await_authorization(&self.user, &session.pin_id, self.settings.max_wait)
            .await;

        match outcome {
            Ok(account) => {
                tracing::info!(user = %self.user, remote_id = %account.remote_id, username = %account.username, "Account linked");
                self.reauthorize = false;
                Duration::ZERO
            }
            Err(e) => {
                tracing::warn!(
                    user = %self.user,
                    error = %e,
                    kind = e.kind(),
                    guidance = e.guidance(),
                    "Authorization did not complete"
                );
                RELINK_DELAY
            }
        }
    }
}
