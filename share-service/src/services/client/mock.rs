//! In-memory media server.
//!
//! Stateful stand-in for the real service: grants created through it show up
//! in later fetches, every call is logged, and failures can be scripted per
//! operation or per invited account.

use super::MediaServerApi;
use crate::error::ShareError;
use crate::models::{
    AccountRef, Credential, GrantId, GrantStatus, Invitee, Library, LibraryKey, LibrarySelection,
    LinkedAccount, Mapped, MediaType, PinId, PinSession, PinState, PinStatus, RemoteAccount,
    RemoteId, RemoteUser, SchemaMismatch, ServerId, ShareGrant, ShareInvite, SharePatch,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const FAKE_CLIENT_IDENTIFIER: &str = "fake-client";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FetchUsers,
    FetchAccount,
    FetchLibraries,
    FetchShares,
    CreateShare,
    UpdateShare,
    RevokeShare,
    CreatePin,
    PollPin,
    ExchangeToken,
}

/// One logged call with the arguments that matter for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    FetchUsers,
    FetchAccount,
    FetchLibraries(ServerId),
    FetchShares(ServerId),
    CreateShare(AccountRef),
    UpdateShare(GrantId, SharePatch),
    RevokeShare(GrantId),
    CreatePin,
    PollPin(PinId),
    ExchangeToken,
}

impl ApiCall {
    pub fn operation(&self) -> Operation {
        match self {
            Self::FetchUsers => Operation::FetchUsers,
            Self::FetchAccount => Operation::FetchAccount,
            Self::FetchLibraries(_) => Operation::FetchLibraries,
            Self::FetchShares(_) => Operation::FetchShares,
            Self::CreateShare(_) => Operation::CreateShare,
            Self::UpdateShare(..) => Operation::UpdateShare,
            Self::RevokeShare(_) => Operation::RevokeShare,
            Self::CreatePin => Operation::CreatePin,
            Self::PollPin(_) => Operation::PollPin,
            Self::ExchangeToken => Operation::ExchangeToken,
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::CreateShare(_) | Self::UpdateShare(..) | Self::RevokeShare(_)
        )
    }
}

#[derive(Debug, Clone)]
enum FakePin {
    Waiting { expires_at: DateTime<Utc> },
    Claimed { token: String },
    Expired,
}

#[derive(Default)]
struct FakeState {
    owners: HashMap<String, RemoteAccount>,
    users: Vec<RemoteUser>,
    user_warnings: Vec<SchemaMismatch>,
    libraries: HashMap<ServerId, Vec<Library>>,
    grants: Vec<ShareGrant>,
    pins: HashMap<PinId, FakePin>,
    failures: HashMap<Operation, VecDeque<ShareError>>,
    account_failures: Vec<(AccountRef, ShareError)>,
    calls: Vec<ApiCall>,
    next_id: u64,
    auto_accept: bool,
    pin_ttl: Duration,
    poll_latency: Duration,
}

impl FakeState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn begin(&mut self, call: ApiCall) -> Result<(), ShareError> {
        let operation = call.operation();
        self.calls.push(call);
        match self.failures.get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn authorize(&self, credential: &Credential) -> Result<&RemoteAccount, ShareError> {
        self.owners
            .get(credential.expose())
            .ok_or(ShareError::Unauthorized)
    }

    fn account_failure(&mut self, invitee: &Invitee) -> Option<ShareError> {
        let index = self
            .account_failures
            .iter()
            .position(|(account, _)| invitee.matches(account))?;
        Some(self.account_failures.remove(index).1)
    }

    fn resolve_invitee(&self, account: &AccountRef) -> Invitee {
        let user = self.users.iter().find(|user| match account {
            AccountRef::Id(id) => &user.remote_id == id,
            AccountRef::Email(email) => user
                .email
                .as_deref()
                .is_some_and(|own| own.eq_ignore_ascii_case(email)),
        });
        match (user, account) {
            (Some(user), _) => Invitee {
                remote_id: Some(user.remote_id.clone()),
                email: user.email.clone(),
                username: Some(user.username.clone()),
            },
            (None, AccountRef::Id(id)) => Invitee {
                remote_id: Some(id.clone()),
                ..Invitee::default()
            },
            (None, AccountRef::Email(email)) => Invitee {
                email: Some(email.clone()),
                ..Invitee::default()
            },
        }
    }

    fn check_libraries(&self, server_id: &ServerId, selection: &LibrarySelection) -> Result<(), ShareError> {
        let catalog = self.libraries.get(server_id).ok_or_else(|| ShareError::Rejected {
            status: 404,
            message: format!("unknown server {}", server_id),
        })?;
        if let LibrarySelection::Only(keys) = selection {
            if let Some(missing) = keys.iter().find(|key| !catalog.iter().any(|l| &l.key == *key)) {
                return Err(ShareError::Rejected {
                    status: 400,
                    message: format!("unknown library section {}", missing),
                });
            }
        }
        Ok(())
    }

    fn status_for(&self, accepted: bool, libraries: &LibrarySelection) -> GrantStatus {
        GrantStatus::from_flags(false, accepted, !libraries.is_empty())
    }
}

/// Cheap to clone; clones share one server state.
#[derive(Clone)]
pub struct FakeMediaServer {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeMediaServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMediaServer {
    pub fn new() -> Self {
        let state = FakeState {
            pin_ttl: Duration::from_secs(900),
            ..FakeState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Register `token` as a valid credential for a default owner account.
    pub async fn link_owner(&self, token: &str) -> Credential {
        self.add_owner(
            token,
            RemoteAccount {
                remote_id: RemoteId::from("1"),
                uuid: Some("owner-uuid".to_string()),
                username: "owner".to_string(),
                email: Some("owner@example.com".to_string()),
                display_name: "Owner".to_string(),
                thumb: None,
            },
        )
        .await;
        Credential::new(token)
    }

    pub async fn add_owner(&self, token: &str, account: RemoteAccount) {
        self.state.lock().await.owners.insert(token.to_string(), account);
    }

    /// Invalidate a credential, as if the owner signed out everywhere.
    pub async fn revoke_owner(&self, token: &str) {
        self.state.lock().await.owners.remove(token);
    }

    pub async fn add_user(&self, user: RemoteUser) {
        self.state.lock().await.users.push(user);
    }

    /// Report a dropped user record alongside the next user listings.
    pub async fn add_user_warning(&self, warning: SchemaMismatch) {
        self.state.lock().await.user_warnings.push(warning);
    }

    pub async fn add_library(&self, server_id: &str, key: &str, title: &str, media_type: MediaType) {
        self.state
            .lock()
            .await
            .libraries
            .entry(ServerId::from(server_id))
            .or_default()
            .push(Library {
                key: LibraryKey::from(key),
                title: title.to_string(),
                media_type,
            });
    }

    /// Insert an existing grant. A missing id is assigned.
    pub async fn seed_grant(&self, mut grant: ShareGrant) -> GrantId {
        let mut state = self.state.lock().await;
        let grant_id = match grant.grant_id.clone() {
            Some(id) => id,
            None => GrantId(state.next_id().to_string()),
        };
        grant.grant_id = Some(grant_id.clone());
        state.grants.push(grant);
        grant_id
    }

    pub async fn grants(&self, server_id: &str) -> Vec<ShareGrant> {
        let server_id = ServerId::from(server_id);
        self.state
            .lock()
            .await
            .grants
            .iter()
            .filter(|g| g.server_id == server_id)
            .cloned()
            .collect()
    }

    /// Whether newly created grants come back accepted.
    pub async fn set_auto_accept(&self, auto_accept: bool) {
        self.state.lock().await.auto_accept = auto_accept;
    }

    pub async fn set_pin_ttl(&self, ttl: Duration) {
        self.state.lock().await.pin_ttl = ttl;
    }

    /// Delay every PIN poll by `latency`.
    pub async fn set_poll_latency(&self, latency: Duration) {
        self.state.lock().await.poll_latency = latency;
    }

    /// Fail the next call of `operation` with `err`. Queued failures are
    /// consumed in order.
    pub async fn fail_next(&self, operation: Operation, err: ShareError) {
        self.state
            .lock()
            .await
            .failures
            .entry(operation)
            .or_default()
            .push_back(err);
    }

    /// Fail the next create, update or revoke aimed at `account`.
    pub async fn fail_account(&self, account: &str, err: ShareError) {
        self.state
            .lock()
            .await
            .account_failures
            .push((AccountRef::parse(account), err));
    }

    /// Simulate the user entering the code on the link page.
    pub async fn claim_pin(&self, pin_id: &PinId, token: &str) {
        self.state.lock().await.pins.insert(
            pin_id.clone(),
            FakePin::Claimed {
                token: token.to_string(),
            },
        );
    }

    pub async fn expire_pin(&self, pin_id: &PinId) {
        self.state
            .lock()
            .await
            .pins
            .insert(pin_id.clone(), FakePin::Expired);
    }

    pub async fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn call_count(&self, operation: Operation) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| call.operation() == operation)
            .count()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }
}

#[async_trait]
impl MediaServerApi for FakeMediaServer {
    async fn fetch_users(&self, credential: &Credential) -> Result<Mapped<RemoteUser>, ShareError> {
        let mut state = self.state.lock().await;
        state.begin(ApiCall::FetchUsers)?;
        state.authorize(credential)?;
        Ok(Mapped {
            items: state.users.clone(),
            warnings: state.user_warnings.clone(),
        })
    }

    async fn fetch_account(&self, credential: &Credential) -> Result<RemoteAccount, ShareError> {
        let mut state = self.state.lock().await;
        state.begin(ApiCall::FetchAccount)?;
        state.authorize(credential).cloned()
    }

    async fn fetch_server_libraries(
        &self,
        credential: &Credential,
        server_id: &ServerId,
    ) -> Result<Vec<Library>, ShareError> {
        let mut state = self.state.lock().await;
        state.begin(ApiCall::FetchLibraries(server_id.clone()))?;
        state.authorize(credential)?;
        state
            .libraries
            .get(server_id)
            .cloned()
            .ok_or_else(|| ShareError::Rejected {
                status: 404,
                message: format!("unknown server {}", server_id),
            })
    }

    async fn fetch_shares(
        &self,
        credential: &Credential,
        server_id: &ServerId,
    ) -> Result<Mapped<ShareGrant>, ShareError> {
        let mut state = self.state.lock().await;
        state.begin(ApiCall::FetchShares(server_id.clone()))?;
        state.authorize(credential)?;
        Ok(Mapped {
            items: state
                .grants
                .iter()
                .filter(|g| &g.server_id == server_id)
                .cloned()
                .collect(),
            warnings: Vec::new(),
        })
    }

    async fn create_share(
        &self,
        credential: &Credential,
        invite: &ShareInvite,
    ) -> Result<ShareGrant, ShareError> {
        let mut state = self.state.lock().await;
        state.begin(ApiCall::CreateShare(invite.invitee.clone()))?;
        state.authorize(credential)?;

        let invitee = state.resolve_invitee(&invite.invitee);
        if let Some(err) = state.account_failure(&invitee) {
            return Err(err);
        }
        state.check_libraries(&invite.server_id, &invite.libraries)?;

        let accepted = state.auto_accept;
        let grant = ShareGrant {
            grant_id: Some(GrantId(state.next_id().to_string())),
            server_id: invite.server_id.clone(),
            invitee,
            libraries: invite.libraries.clone(),
            filters: invite.filters.clone(),
            status: state.status_for(accepted, &invite.libraries),
            accepted_at: accepted.then(Utc::now),
        };
        state.grants.push(grant.clone());
        Ok(grant)
    }

    async fn update_share(
        &self,
        credential: &Credential,
        server_id: &ServerId,
        grant_id: &GrantId,
        patch: &SharePatch,
    ) -> Result<ShareGrant, ShareError> {
        let mut state = self.state.lock().await;
        state.begin(ApiCall::UpdateShare(grant_id.clone(), patch.clone()))?;
        state.authorize(credential)?;

        let index = state
            .grants
            .iter()
            .position(|g| g.grant_id.as_ref() == Some(grant_id) && g.is_live())
            .ok_or_else(|| ShareError::Rejected {
                status: 404,
                message: format!("no shared server {}", grant_id),
            })?;
        let invitee = state.grants[index].invitee.clone();
        if let Some(err) = state.account_failure(&invitee) {
            return Err(err);
        }
        if let Some(libraries) = &patch.libraries {
            state.check_libraries(server_id, libraries)?;
        }

        let mut grant = state.grants[index].clone();
        if let Some(libraries) = &patch.libraries {
            grant.libraries = libraries.clone();
        }
        grant.filters.apply(&patch.filters);
        if grant.status != GrantStatus::Pending {
            grant.status = state.status_for(true, &grant.libraries);
        }
        state.grants[index] = grant.clone();
        Ok(grant)
    }

    async fn revoke_share(&self, credential: &Credential, grant_id: &GrantId) -> Result<(), ShareError> {
        let mut state = self.state.lock().await;
        state.begin(ApiCall::RevokeShare(grant_id.clone()))?;
        state.authorize(credential)?;

        let Some(index) = state
            .grants
            .iter()
            .position(|g| g.grant_id.as_ref() == Some(grant_id))
        else {
            return Ok(());
        };
        let invitee = state.grants[index].invitee.clone();
        if let Some(err) = state.account_failure(&invitee) {
            return Err(err);
        }
        state.grants.remove(index);
        Ok(())
    }

    async fn create_pin(&self) -> Result<PinSession, ShareError> {
        let mut state = self.state.lock().await;
        state.begin(ApiCall::CreatePin)?;

        let n = state.next_id();
        let pin_id = PinId(n.to_string());
        let issued_at = Utc::now();
        let expires_at = issued_at
            + chrono::Duration::from_std(state.pin_ttl).unwrap_or_else(|_| chrono::Duration::minutes(15));
        state
            .pins
            .insert(pin_id.clone(), FakePin::Waiting { expires_at });

        Ok(PinSession {
            pin_id,
            code: format!("CODE{}", n),
            client_identifier: FAKE_CLIENT_IDENTIFIER.to_string(),
            issued_at,
            expires_at,
            state: PinState::Pending,
        })
    }

    async fn poll_pin(&self, pin_id: &PinId) -> Result<PinStatus, ShareError> {
        let latency = {
            let mut state = self.state.lock().await;
            state.begin(ApiCall::PollPin(pin_id.clone()))?;
            state.poll_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let state = self.state.lock().await;
        Ok(match state.pins.get(pin_id) {
            Some(FakePin::Claimed { token }) => PinStatus::Claimed(Credential::new(token.clone())),
            Some(FakePin::Waiting { expires_at }) if *expires_at > Utc::now() => PinStatus::Waiting,
            _ => PinStatus::Expired,
        })
    }

    async fn exchange_token(&self, credential: Credential) -> Result<LinkedAccount, ShareError> {
        let mut state = self.state.lock().await;
        state.begin(ApiCall::ExchangeToken)?;
        let account = state.authorize(&credential)?.clone();
        Ok(LinkedAccount {
            account,
            credential,
        })
    }
}

/// A plain friend record for seeding the fake.
pub fn remote_user(remote_id: &str, username: &str, email: Option<&str>) -> RemoteUser {
    RemoteUser {
        remote_id: RemoteId::from(remote_id),
        username: username.to_string(),
        email: email.map(str::to_string),
        display_name: username.to_string(),
        thumb: None,
        home: false,
        restricted: false,
        protected: false,
        permissions: Default::default(),
        filters: Default::default(),
        servers: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FilterRules;

    const SERVER: &str = "server-1";

    async fn seeded() -> (FakeMediaServer, Credential) {
        let fake = FakeMediaServer::new();
        let credential = fake.link_owner("token").await;
        fake.add_library(SERVER, "1", "Movies", MediaType::Movie).await;
        fake.add_user(remote_user("42", "alice", Some("alice@example.com")))
            .await;
        (fake, credential)
    }

    #[tokio::test]
    async fn created_grants_show_up_in_listing() {
        let (fake, credential) = seeded().await;
        let invite = ShareInvite {
            server_id: ServerId::from(SERVER),
            invitee: AccountRef::parse("alice@example.com"),
            libraries: LibrarySelection::only(["1"]),
            filters: FilterRules::new(),
        };

        let grant = fake.create_share(&credential, &invite).await.unwrap();
        assert_eq!(grant.status, GrantStatus::Pending);
        assert_eq!(grant.invitee.remote_id, Some(RemoteId::from("42")));

        let listed = fake
            .fetch_shares(&credential, &ServerId::from(SERVER))
            .await
            .unwrap();
        assert_eq!(listed.items, vec![grant]);
    }

    #[tokio::test]
    async fn unknown_library_is_rejected() {
        let (fake, credential) = seeded().await;
        let invite = ShareInvite {
            server_id: ServerId::from(SERVER),
            invitee: AccountRef::parse("42"),
            libraries: LibrarySelection::only(["9"]),
            filters: FilterRules::new(),
        };
        let err = fake.create_share(&credential, &invite).await.unwrap_err();
        assert!(matches!(err, ShareError::Rejected { status: 400, .. }));
    }

    #[tokio::test]
    async fn revoking_a_missing_grant_succeeds() {
        let (fake, credential) = seeded().await;
        fake.revoke_share(&credential, &GrantId::from("404"))
            .await
            .unwrap();
        assert_eq!(fake.calls().await, vec![ApiCall::RevokeShare(GrantId::from("404"))]);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let (fake, credential) = seeded().await;
        fake.fail_next(Operation::FetchAccount, ShareError::Transient("1".into()))
            .await;

        assert!(fake.fetch_account(&credential).await.is_err());
        assert!(fake.fetch_account(&credential).await.is_ok());
    }
}
