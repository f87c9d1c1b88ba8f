//! PIN (device-authorization) flow.
//!
//! A local user asks for a code, enters it on the media server's link page,
//! and the flow polls until the code is claimed, expires, or the wait is
//! cancelled. At most one session is live per local user; starting a new one
//! supersedes the old one without touching it remotely.

use crate::error::ShareError;
use crate::models::{LinkedAccount, LocalUserId, PinFailure, PinId, PinSession, PinState, PinStatus};
use crate::services::client::MediaServerApi;
use crate::services::metrics;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use service_core::clock::Clock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Registry entry for the live session of one local user.
struct LiveSession {
    session: PinSession,
    cancel: CancellationToken,
    /// Why `cancel` fired. Set before the token is cancelled.
    reason: Arc<OnceLock<PinFailure>>,
    waiting: Arc<AtomicBool>,
}

impl LiveSession {
    fn new(session: PinSession) -> Self {
        Self {
            session,
            cancel: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
            waiting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop the session. Returns whether a waiter will observe the reason and
    /// record the terminal state itself.
    fn abort(&self, reason: PinFailure) -> bool {
        let _ = self.reason.set(reason);
        self.cancel.cancel();
        self.waiting.load(Ordering::SeqCst)
    }
}

/// Clears the waiter flag when the waiting future completes or is dropped.
struct WaiterGuard(Arc<AtomicBool>);

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// How a poll loop ended before it was mapped onto the session.
enum PollEnd {
    Linked(LinkedAccount),
    Expired,
    Failed(PinFailure, ShareError),
}

pub struct PinFlow {
    api: Arc<dyn MediaServerApi>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    sessions: DashMap<LocalUserId, LiveSession>,
}

impl PinFlow {
    pub fn new(api: Arc<dyn MediaServerApi>, clock: Arc<dyn Clock>, poll_interval: Duration) -> Self {
        Self {
            api,
            clock,
            poll_interval,
            sessions: DashMap::new(),
        }
    }

    /// Request a new code for `user`, superseding any live session.
    #[instrument(skip_all, fields(user = %user))]
    pub async fn begin(&self, user: &LocalUserId) -> Result<PinSession, ShareError> {
        let session = self.api.create_pin().await?;

        if let Some(previous) = self.sessions.insert(user.clone(), LiveSession::new(session.clone())) {
            let observed = previous.abort(PinFailure::Superseded);
            if !observed {
                let state = if previous.session.expires_at <= Utc::now() {
                    PinState::Expired
                } else {
                    PinState::Failed(PinFailure::Superseded)
                };
                metrics::record_pin_terminal(state.as_str());
            }
            tracing::info!(previous_pin = %previous.session.pin_id, "Superseded earlier authorization");
        }

        tracing::info!(pin_id = %session.pin_id, expires_at = %session.expires_at, "Authorization started");
        Ok(session)
    }

    /// Cancel the live session of `user`. Returns whether there was one.
    pub fn cancel(&self, user: &LocalUserId) -> bool {
        let Some((_, live)) = self.sessions.remove(user) else {
            return false;
        };
        if !live.abort(PinFailure::Cancelled) {
            metrics::record_pin_terminal(PinState::Failed(PinFailure::Cancelled).as_str());
        }
        tracing::info!(user = %user, pin_id = %live.session.pin_id, "Authorization cancelled");
        true
    }

    /// The live session of `user`, if any.
    pub fn session(&self, user: &LocalUserId) -> Option<PinSession> {
        self.sessions.get(user).map(|live| live.session.clone())
    }

    /// Poll `pin_id` until it is claimed, the deadline passes, or the session
    /// is cancelled or superseded. The deadline is the earlier of `max_wait`
    /// and the expiry the server reported.
    #[instrument(skip_all, fields(user = %user, pin_id = %pin_id))]
    pub async fn wait(
        &self,
        user: &LocalUserId,
        pin_id: &PinId,
        max_wait: Duration,
    ) -> Result<LinkedAccount, ShareError> {
        let (session, cancel, reason, waiting) = match self.sessions.get(user) {
            Some(live) if &live.session.pin_id == pin_id => (
                live.session.clone(),
                live.cancel.clone(),
                live.reason.clone(),
                live.waiting.clone(),
            ),
            _ => return Err(ShareError::UnknownPin(pin_id.to_string())),
        };

        if waiting.swap(true, Ordering::SeqCst) {
            return Err(ShareError::Busy);
        }
        let _guard = WaiterGuard(waiting);

        // The server reports expiry as a wall-clock time; the wait itself runs
        // on the injected clock.
        let server_remaining = (session.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let budget = max_wait.min(server_remaining);
        let started = self.clock.now();

        let end = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = self.clock.sleep(budget) => Some(PollEnd::Expired),
            end = self.poll_until_done(pin_id) => Some(end),
        };
        let waited = self.clock.now().duration_since(started);

        let Some(end) = end else {
            let failure = reason.get().copied().unwrap_or(PinFailure::Cancelled);
            let state = PinState::Failed(failure);
            metrics::record_pin_terminal(state.as_str());
            metrics::record_pin_wait(state.as_str(), waited);
            tracing::info!(
                state = state.as_str(),
                waited_ms = waited.as_millis() as u64,
                "Authorization wait interrupted"
            );
            return Err(match failure {
                PinFailure::Superseded => ShareError::Superseded,
                _ => ShareError::Cancelled,
            });
        };

        let (state, result) = match end {
            PollEnd::Linked(linked) => (PinState::Claimed, Ok(linked)),
            PollEnd::Expired => (PinState::Expired, Err(ShareError::PinExpired)),
            PollEnd::Failed(failure, err) => (PinState::Failed(failure), Err(err)),
        };
        self.finish(user, pin_id, state, waited);
        result
    }

    async fn poll_until_done(&self, pin_id: &PinId) -> PollEnd {
        loop {
            let delay = match self.api.poll_pin(pin_id).await {
                Ok(PinStatus::Claimed(credential)) => {
                    return match self.api.exchange_token(credential).await {
                        Ok(linked) => PollEnd::Linked(linked),
                        Err(err) => PollEnd::Failed(failure_for(&err), err),
                    };
                }
                Ok(PinStatus::Expired) => return PollEnd::Expired,
                Ok(PinStatus::Waiting) => self.poll_interval,
                Err(ShareError::RateLimited { retry_after }) => {
                    tracing::warn!(retry_after_ms = retry_after.as_millis() as u64, "PIN poll rate limited");
                    retry_after.max(self.poll_interval)
                }
                Err(ShareError::Transient(message)) => {
                    tracing::warn!(error = %message, "PIN poll failed, will poll again");
                    self.poll_interval
                }
                Err(err) => return PollEnd::Failed(failure_for(&err), err),
            };
            self.clock.sleep(delay).await;
        }
    }

    /// Record the terminal state and drop the session from the registry,
    /// unless a newer session already replaced it.
    fn finish(&self, user: &LocalUserId, pin_id: &PinId, state: PinState, waited: Duration) {
        let removed = match self.sessions.entry(user.clone()) {
            Entry::Occupied(mut occupied) if &occupied.get().session.pin_id == pin_id => {
                let transitioned = occupied.get_mut().session.transition(state);
                occupied.remove();
                transitioned
            }
            _ => false,
        };
        if removed {
            metrics::record_pin_terminal(state.as_str());
            metrics::record_pin_wait(state.as_str(), waited);
            tracing::info!(
                state = state.as_str(),
                waited_ms = waited.as_millis() as u64,
                "Authorization finished"
            );
        }
    }
}

fn failure_for(err: &ShareError) -> PinFailure {
    match err {
        ShareError::Unauthorized => PinFailure::Unauthorized,
        ShareError::Malformed(_) => PinFailure::Malformed,
        _ => PinFailure::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::client::{FakeMediaServer, Operation};
    use service_core::clock::TokioClock;

    fn flow(fake: &FakeMediaServer) -> PinFlow {
        PinFlow::new(
            Arc::new(fake.clone()),
            Arc::new(TokioClock),
            Duration::from_secs(2),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn claimed_pin_yields_linked_account() {
        let fake = FakeMediaServer::new();
        fake.link_owner("claimed-token").await;
        let flow = flow(&fake);
        let user = LocalUserId::from("alice");

        let session = flow.begin(&user).await.unwrap();
        fake.claim_pin(&session.pin_id, "claimed-token").await;

        let linked = flow
            .wait(&user, &session.pin_id, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(linked.credential.expose(), "claimed-token");
        assert!(flow.session(&user).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_pin_is_rejected() {
        let fake = FakeMediaServer::new();
        let flow = flow(&fake);
        let err = flow
            .wait(&LocalUserId::from("alice"), &PinId::from("nope"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, ShareError::UnknownPin("nope".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_poll_failures_keep_session_pending() {
        let fake = FakeMediaServer::new();
        fake.link_owner("claimed-token").await;
        fake.fail_next(Operation::PollPin, ShareError::Transient("502".into()))
            .await;
        let flow = flow(&fake);
        let user = LocalUserId::from("alice");

        let session = flow.begin(&user).await.unwrap();
        fake.claim_pin(&session.pin_id, "claimed-token").await;

        flow.wait(&user, &session.pin_id, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(fake.call_count(Operation::PollPin).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_exchange_fails_session() {
        let fake = FakeMediaServer::new();
        let flow = flow(&fake);
        let user = LocalUserId::from("alice");

        let session = flow.begin(&user).await.unwrap();
        // Claimed with a token the server does not recognise.
        fake.claim_pin(&session.pin_id, "bogus").await;

        let err = flow
            .wait(&user, &session.pin_id, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err, ShareError::Unauthorized);
        assert!(flow.session(&user).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_without_session_is_false() {
        let fake = FakeMediaServer::new();
        assert!(!flow(&fake).cancel(&LocalUserId::from("alice")));
    }
}
