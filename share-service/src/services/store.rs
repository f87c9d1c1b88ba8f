//! Collaborator boundary: where credentials live and where sharing policy
//! comes from.
//!
//! The core only sees the two traits. The in-memory adapters back tests and
//! embedding; the JSON-file adapters back the worker binary.

use crate::error::ShareError;
use crate::models::{Credential, DesiredShareState, LinkedAccount, LocalUserId, RemoteAccount};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, user: &LocalUserId) -> Result<Option<LinkedAccount>, ShareError>;

    async fn save(&self, user: &LocalUserId, linked: &LinkedAccount) -> Result<(), ShareError>;

    /// Remove the link. Returns whether one existed.
    async fn remove(&self, user: &LocalUserId) -> Result<bool, ShareError>;
}

#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Desired sharing state for `user`. Read fresh on every pass.
    async fn desired_share_state(&self, user: &LocalUserId) -> Result<DesiredShareState, ShareError>;
}

// ============================================================================
// In-memory adapters
// ============================================================================

#[derive(Default)]
pub struct InMemoryCredentialStore {
    links: DashMap<LocalUserId, LinkedAccount>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self, user: &LocalUserId) -> Result<Option<LinkedAccount>, ShareError> {
        Ok(self.links.get(user).map(|entry| entry.value().clone()))
    }

    async fn save(&self, user: &LocalUserId, linked: &LinkedAccount) -> Result<(), ShareError> {
        self.links.insert(user.clone(), linked.clone());
        Ok(())
    }

    async fn remove(&self, user: &LocalUserId) -> Result<bool, ShareError> {
        Ok(self.links.remove(user).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryPolicySource {
    policies: DashMap<LocalUserId, DesiredShareState>,
}

impl InMemoryPolicySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user: &LocalUserId, desired: DesiredShareState) {
        self.policies.insert(user.clone(), desired);
    }
}

#[async_trait]
impl PolicySource for InMemoryPolicySource {
    async fn desired_share_state(&self, user: &LocalUserId) -> Result<DesiredShareState, ShareError> {
        self.policies
            .get(user)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ShareError::Config(format!("no sharing policy for {}", user)))
    }
}

// ============================================================================
// JSON-file adapters
// ============================================================================

/// Policy document on disk:
///
/// ```json
/// { "users": { "alice": { "server_id": "abc123", "grants": { "bob@example.com": { "libraries": ["Movies"] } } } } }
/// ```
pub struct JsonFilePolicySource {
    path: PathBuf,
}

#[derive(Deserialize)]
struct PolicyDocument {
    #[serde(default)]
    users: BTreeMap<LocalUserId, DesiredShareState>,
}

impl JsonFilePolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PolicySource for JsonFilePolicySource {
    async fn desired_share_state(&self, user: &LocalUserId) -> Result<DesiredShareState, ShareError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(AppError::from)?;
        let mut document: PolicyDocument = serde_json::from_str(&raw)
            .map_err(|e| ShareError::Config(format!("{}: {}", self.path.display(), e)))?;
        document
            .users
            .remove(user)
            .ok_or_else(|| ShareError::Config(format!("no sharing policy for {}", user)))
    }
}

/// Credentials persisted as a JSON map keyed by local user. The token is
/// written in the clear, so the file must be protected like any secret.
pub struct JsonFileCredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(Serialize, Deserialize)]
struct StoredLink {
    account: RemoteAccount,
    token: String,
}

impl JsonFileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<BTreeMap<LocalUserId, StoredLink>, ShareError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw).map_err(AppError::from)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(AppError::from(e).into()),
        }
    }

    async fn write_all(&self, links: &BTreeMap<LocalUserId, StoredLink>) -> Result<(), ShareError> {
        let raw = serde_json::to_string_pretty(links).map_err(AppError::from)?;
        let tmp = temp_path(&self.path);
        tokio::fs::write(&tmp, raw).await.map_err(AppError::from)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(AppError::from)?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl CredentialStore for JsonFileCredentialStore {
    async fn load(&self, user: &LocalUserId) -> Result<Option<LinkedAccount>, ShareError> {
        let mut links = self.read_all().await?;
        Ok(links.remove(user).map(|stored| LinkedAccount {
            account: stored.account,
            credential: Credential::new(stored.token),
        }))
    }

    async fn save(&self, user: &LocalUserId, linked: &LinkedAccount) -> Result<(), ShareError> {
        let _guard = self.write_lock.lock().await;
        let mut links = self.read_all().await?;
        links.insert(
            user.clone(),
            StoredLink {
                account: linked.account.clone(),
                token: linked.credential.expose().to_string(),
            },
        );
        self.write_all(&links).await?;
        tracing::debug!(user = %user, remote_id = %linked.account.remote_id, "Credential saved");
        Ok(())
    }

    async fn remove(&self, user: &LocalUserId) -> Result<bool, ShareError> {
        let _guard = self.write_lock.lock().await;
        let mut links = self.read_all().await?;
        let existed = links.remove(user).is_some();
        if existed {
            self.write_all(&links).await?;
        }
        Ok(existed)
    }
}
