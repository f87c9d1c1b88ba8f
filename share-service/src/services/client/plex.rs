//! Plex HTTP client.
//!
//! Talks to the legacy XML endpoints for users and shared servers and to the
//! `api/v2` JSON endpoints for everything else. Responses are handed to the
//! mapper together with their content type.

use super::MediaServerApi;
use crate::config::PlexConfig;
use crate::error::ShareError;
use crate::models::{
    AccountRef, Credential, FilterScope, GrantId, Library, LibrarySelection, LinkedAccount,
    Mapped, PinId, PinSession, PinStatus, RemoteAccount, RemoteUser, ServerId, ShareGrant,
    ShareInvite, SharePatch,
};
use crate::services::mapper::{self, WirePayload};
use crate::services::metrics;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

const TOKEN_HEADER: &str = "X-Plex-Token";

/// Plex client for the account, sharing and PIN endpoints.
#[derive(Clone)]
pub struct PlexClient {
    client: Client,
    config: PlexConfig,
    default_retry_after: Duration,
}

/// Body of `POST /api/v2/shared_servers`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateShareRequest {
    machine_identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    invited_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    invited_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    all_libraries: Option<bool>,
    library_section_ids: Vec<String>,
    settings: Map<String, Value>,
}

/// Body of `PUT /api/v2/shared_servers/{id}`. Absent fields are left alone.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateShareRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    all_libraries: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    library_section_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    settings: Map<String, Value>,
}

/// A successful response: content type plus body.
struct Reply {
    content_type: Option<String>,
    body: String,
}

impl Reply {
    fn payload(&self) -> WirePayload<'_> {
        WirePayload::detect(self.content_type.as_deref(), &self.body)
    }
}

impl PlexClient {
    /// Create a new client. Fails only if the configured identity headers are
    /// not valid header values.
    pub fn new(config: PlexConfig) -> Result<Self, ShareError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in [
            ("X-Plex-Product", &config.product),
            ("X-Plex-Client-Identifier", &config.client_identifier),
            ("X-Plex-Version", &config.version),
        ] {
            let value = HeaderValue::from_str(value)
                .map_err(|e| ShareError::Config(format!("invalid {} header: {}", name, e)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ShareError::Config(e.to_string()))?;

        Ok(Self {
            client,
            config,
            default_retry_after: Duration::from_secs(5),
        })
    }

    /// Delay assumed for a 429 that carries no `Retry-After`.
    pub fn with_default_retry_after(mut self, delay: Duration) -> Self {
        self.default_retry_after = delay;
        self
    }

    pub fn client_identifier(&self) -> &str {
        &self.config.client_identifier
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, request: RequestBuilder, credential: &Credential) -> RequestBuilder {
        request.header(TOKEN_HEADER, credential.expose())
    }

    /// Send a request and fold every failure into the error taxonomy.
    async fn send(&self, operation: &'static str, request: RequestBuilder) -> Result<Reply, ShareError> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let kind = if e.is_timeout() { "timeout" } else { "transport" };
                metrics::record_api_request(operation, kind);
                tracing::warn!(operation, error = %e, "Media server request failed");
                return Err(ShareError::from(e));
            }
        };

        let status = response.status();
        metrics::record_api_request(operation, status.as_str());

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await?;

        tracing::debug!(operation, status = %status, "Media server response");

        if status.is_success() {
            return Ok(Reply { content_type, body });
        }

        Err(self.status_error(status, retry_after, &body))
    }

    fn status_error(&self, status: StatusCode, retry_after: Option<Duration>, body: &str) -> ShareError {
        match status {
            StatusCode::UNAUTHORIZED => ShareError::Unauthorized,
            StatusCode::TOO_MANY_REQUESTS => ShareError::RateLimited {
                retry_after: retry_after.unwrap_or(self.default_retry_after),
            },
            s if s.is_server_error() => ShareError::Transient(format!("server returned {}", s)),
            s => ShareError::Rejected {
                status: s.as_u16(),
                message: mapper::error_message(body)
                    .unwrap_or_else(|| s.canonical_reason().unwrap_or("request rejected").to_string()),
            },
        }
    }

    fn report_warnings<T>(&self, mapped: &Mapped<T>) {
        for warning in &mapped.warnings {
            metrics::record_schema_mismatch(warning.record);
            tracing::warn!(warning = %warning, "Dropped record from media server response");
        }
    }
}

fn library_ids(selection: &LibrarySelection) -> (Option<bool>, Vec<String>) {
    match selection {
        LibrarySelection::All => (Some(true), Vec::new()),
        LibrarySelection::Only(keys) => (None, keys.iter().map(|k| k.to_string()).collect()),
    }
}

fn settings(filters: &BTreeMap<FilterScope, String>) -> Map<String, Value> {
    filters
        .iter()
        .map(|(scope, expression)| (scope.wire_name().to_string(), Value::String(expression.clone())))
        .collect()
}

#[async_trait]
impl MediaServerApi for PlexClient {
    async fn fetch_users(&self, credential: &Credential) -> Result<Mapped<RemoteUser>, ShareError> {
        let request = self.authed(self.client.get(self.url("/api/users")), credential);
        let reply = self.send("fetch_users", request).await?;
        let users = mapper::users(reply.payload())?;
        self.report_warnings(&users);
        Ok(users)
    }

    async fn fetch_account(&self, credential: &Credential) -> Result<RemoteAccount, ShareError> {
        let request = self.authed(self.client.get(self.url("/api/v2/user")), credential);
        let reply = self.send("fetch_account", request).await?;
        mapper::account(reply.payload())
    }

    async fn fetch_server_libraries(
        &self,
        credential: &Credential,
        server_id: &ServerId,
    ) -> Result<Vec<Library>, ShareError> {
        let url = self.url(&format!("/api/v2/servers/{}", server_id));
        let request = self.authed(self.client.get(url), credential);
        let reply = self.send("fetch_server_libraries", request).await?;
        let libraries = mapper::libraries(reply.payload())?;
        self.report_warnings(&libraries);
        Ok(libraries.items)
    }

    async fn fetch_shares(
        &self,
        credential: &Credential,
        server_id: &ServerId,
    ) -> Result<Mapped<ShareGrant>, ShareError> {
        let url = self.url(&format!("/api/servers/{}/shared_servers", server_id));
        let request = self.authed(self.client.get(url), credential);
        let reply = self.send("fetch_shares", request).await?;
        let shares = mapper::shares(reply.payload(), server_id)?;
        self.report_warnings(&shares);
        Ok(shares)
    }

    async fn create_share(
        &self,
        credential: &Credential,
        invite: &ShareInvite,
    ) -> Result<ShareGrant, ShareError> {
        let (all_libraries, library_section_ids) = library_ids(&invite.libraries);
        let (invited_id, invited_email) = match &invite.invitee {
            AccountRef::Id(id) => (Some(id.to_string()), None),
            AccountRef::Email(email) => (None, Some(email.clone())),
        };
        let filters: BTreeMap<FilterScope, String> = invite.filters.clone().into();
        let body = CreateShareRequest {
            machine_identifier: invite.server_id.to_string(),
            invited_id,
            invited_email,
            all_libraries,
            library_section_ids,
            settings: settings(&filters),
        };

        let request = self.authed(self.client.post(self.url("/api/v2/shared_servers")), credential);
        let reply = self.send("create_share", request.json(&body)).await?;
        let grant = mapper::share(reply.payload(), &invite.server_id)?;

        tracing::info!(
            server_id = %invite.server_id,
            invitee = %invite.invitee,
            grant_id = ?grant.grant_id,
            "Share created"
        );
        Ok(grant)
    }

    async fn update_share(
        &self,
        credential: &Credential,
        server_id: &ServerId,
        grant_id: &GrantId,
        patch: &SharePatch,
    ) -> Result<ShareGrant, ShareError> {
        let (all_libraries, library_section_ids) = match &patch.libraries {
            Some(selection) => {
                let (all, ids) = library_ids(selection);
                (all.or(Some(false)), Some(ids))
            }
            None => (None, None),
        };
        let body = UpdateShareRequest {
            all_libraries,
            library_section_ids,
            settings: settings(&patch.filters),
        };

        let url = self.url(&format!("/api/v2/shared_servers/{}", grant_id));
        let request = self.authed(self.client.put(url), credential);
        let reply = self.send("update_share", request.json(&body)).await?;
        let grant = mapper::share(reply.payload(), server_id)?;

        tracing::info!(%grant_id, "Share updated");
        Ok(grant)
    }

    async fn revoke_share(&self, credential: &Credential, grant_id: &GrantId) -> Result<(), ShareError> {
        let url = self.url(&format!("/api/v2/shared_servers/{}", grant_id));
        let request = self.authed(self.client.delete(url), credential);

        match self.send("revoke_share", request).await {
            Ok(_) => {
                tracing::info!(%grant_id, "Share revoked");
                Ok(())
            }
            Err(ShareError::Rejected { status: 404, .. }) => {
                tracing::info!(%grant_id, "Share already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn create_pin(&self) -> Result<PinSession, ShareError> {
        let request = self
            .client
            .post(self.url("/api/v2/pins"))
            .query(&[("strong", "true")]);
        let reply = self.send("create_pin", request).await?;
        let (session, _) = mapper::pin(reply.payload(), &self.config.client_identifier, Utc::now())?;

        tracing::info!(pin_id = %session.pin_id, expires_at = %session.expires_at, "PIN issued");
        Ok(session)
    }

    async fn poll_pin(&self, pin_id: &PinId) -> Result<PinStatus, ShareError> {
        let request = self.client.get(self.url(&format!("/api/v2/pins/{}", pin_id)));

        let reply = match self.send("poll_pin", request).await {
            Ok(reply) => reply,
            Err(ShareError::Rejected { status: 404, .. }) => return Ok(PinStatus::Expired),
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        let (session, token) = mapper::pin(reply.payload(), &self.config.client_identifier, now)?;
        Ok(match token {
            Some(credential) => PinStatus::Claimed(credential),
            None if session.expires_at <= now => PinStatus::Expired,
            None => PinStatus::Waiting,
        })
    }

    async fn exchange_token(&self, credential: Credential) -> Result<LinkedAccount, ShareError> {
        let account = self.fetch_account(&credential).await?;
        tracing::info!(remote_id = %account.remote_id, "Token exchanged for account");
        Ok(LinkedAccount { account, credential })
    }
}
