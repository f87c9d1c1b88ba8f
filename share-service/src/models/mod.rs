//! Canonical model for linked accounts, libraries and share grants.
//!
//! Every wire shape the media server produces is normalized into these types
//! by the mapper; nothing outside `services::mapper` sees the raw payloads.

use crate::error::ShareError;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Local application user on whose behalf the core acts.
    LocalUserId
);
string_id!(
    /// Stable account id on the media server.
    RemoteId
);
string_id!(
    /// Machine identifier of a media server.
    ServerId
);
string_id!(GrantId);
string_id!(PinId);
string_id!(LibraryKey);

// ============================================================================
// Accounts & credentials
// ============================================================================

/// Long-lived access token. Never printed, never logged.
#[derive(Clone)]
pub struct Credential(Secret<String>);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Secret::new(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// The media server account a local user linked through the PIN flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAccount {
    pub remote_id: RemoteId,
    pub uuid: Option<String>,
    pub username: String,
    pub email: Option<String>,
    pub display_name: String,
    pub thumb: Option<String>,
}

/// A remote account together with the credential that reaches it.
#[derive(Debug, Clone)]
pub struct LinkedAccount {
    pub account: RemoteAccount,
    pub credential: Credential,
}

// ============================================================================
// Remote users
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharePermissions {
    pub allow_sync: bool,
    pub allow_camera_upload: bool,
    pub allow_channels: bool,
    pub allow_tuners: bool,
    pub allow_subtitle_admin: bool,
}

/// A server the remote user has been given access to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMembership {
    pub grant_id: Option<GrantId>,
    pub server_id: ServerId,
    pub name: String,
    pub num_libraries: u32,
    pub all_libraries: bool,
    pub owned: bool,
    pub pending: bool,
}

/// A friend or home member of the linked account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUser {
    pub remote_id: RemoteId,
    pub username: String,
    pub email: Option<String>,
    pub display_name: String,
    pub thumb: Option<String>,
    pub home: bool,
    pub restricted: bool,
    pub protected: bool,
    pub permissions: SharePermissions,
    pub filters: FilterRules,
    pub servers: Vec<ServerMembership>,
}

// ============================================================================
// Libraries
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    Movie,
    Show,
    Music,
    Photo,
    Other(String),
}

impl MediaType {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "movie" => Self::Movie,
            "show" => Self::Show,
            "artist" | "music" => Self::Music,
            "photo" => Self::Photo,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    pub key: LibraryKey,
    pub title: String,
    pub media_type: MediaType,
}

/// Libraries covered by a grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibrarySelection {
    All,
    Only(BTreeSet<LibraryKey>),
}

impl LibrarySelection {
    pub fn only<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<LibraryKey>,
    {
        Self::Only(keys.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Only(keys) if keys.is_empty())
    }
}

/// Libraries named by policy, before they are resolved against the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawLibraries")]
pub enum DesiredLibraries {
    All,
    Named(BTreeSet<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLibraries {
    Keyword(String),
    Named(Vec<String>),
}

impl TryFrom<RawLibraries> for DesiredLibraries {
    type Error = String;

    fn try_from(raw: RawLibraries) -> Result<Self, Self::Error> {
        match raw {
            RawLibraries::Keyword(word) if word.eq_ignore_ascii_case("all") => Ok(Self::All),
            RawLibraries::Keyword(word) => Err(format!(
                "expected \"all\" or a list of libraries, got {:?}",
                word
            )),
            RawLibraries::Named(names) => Ok(Self::Named(names.into_iter().collect())),
        }
    }
}

impl DesiredLibraries {
    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Named(names.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Named(names) if names.is_empty())
    }

    /// Resolve names against the server catalog. A name matches a library by
    /// exact key or by case-insensitive title.
    pub fn resolve(&self, catalog: &[Library]) -> Result<LibrarySelection, ShareError> {
        let names = match self {
            Self::All => return Ok(LibrarySelection::All),
            Self::Named(names) => names,
        };

        let mut keys = BTreeSet::new();
        for name in names {
            let library = catalog
                .iter()
                .find(|l| l.key.as_str() == name)
                .or_else(|| catalog.iter().find(|l| l.title.eq_ignore_ascii_case(name)))
                .ok_or_else(|| ShareError::UnknownLibrary(name.clone()))?;
            keys.insert(library.key.clone());
        }
        Ok(LibrarySelection::Only(keys))
    }
}

// ============================================================================
// Filters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterScope {
    All,
    Movies,
    Television,
    Music,
    Photos,
}

impl FilterScope {
    pub const ALL: [FilterScope; 5] = [
        FilterScope::All,
        FilterScope::Movies,
        FilterScope::Television,
        FilterScope::Music,
        FilterScope::Photos,
    ];

    /// Field name used by the media server for this scope.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::All => "filterAll",
            Self::Movies => "filterMovies",
            Self::Television => "filterTelevision",
            Self::Music => "filterMusic",
            Self::Photos => "filterPhotos",
        }
    }
}

/// Per-scope filter expressions. Empty expressions are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<FilterScope, String>", into = "BTreeMap<FilterScope, String>")]
pub struct FilterRules(BTreeMap<FilterScope, String>);

impl FilterRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, scope: FilterScope, expression: impl Into<String>) -> Self {
        self.set(scope, expression);
        self
    }

    pub fn set(&mut self, scope: FilterScope, expression: impl Into<String>) {
        let expression = expression.into();
        if expression.trim().is_empty() {
            self.0.remove(&scope);
        } else {
            self.0.insert(scope, expression);
        }
    }

    pub fn get(&self, scope: FilterScope) -> Option<&str> {
        self.0.get(&scope).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Scopes whose expression differs in `target`. A scope present here but
    /// absent from `target` maps to the empty string, which clears it.
    pub fn changes_to(&self, target: &FilterRules) -> BTreeMap<FilterScope, String> {
        FilterScope::ALL
            .iter()
            .filter(|scope| self.get(**scope) != target.get(**scope))
            .map(|scope| (*scope, target.get(*scope).unwrap_or_default().to_string()))
            .collect()
    }

    /// Apply a change set produced by [`FilterRules::changes_to`].
    pub fn apply(&mut self, changes: &BTreeMap<FilterScope, String>) {
        for (scope, expression) in changes {
            self.set(*scope, expression.clone());
        }
    }
}

impl From<BTreeMap<FilterScope, String>> for FilterRules {
    fn from(map: BTreeMap<FilterScope, String>) -> Self {
        let mut rules = FilterRules::new();
        for (scope, expression) in map {
            rules.set(scope, expression);
        }
        rules
    }
}

impl From<FilterRules> for BTreeMap<FilterScope, String> {
    fn from(rules: FilterRules) -> Self {
        rules.0
    }
}

// ============================================================================
// Share grants
// ============================================================================

/// Invited account reference: a known remote id, or an email for accounts
/// that have not registered yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AccountRef {
    Id(RemoteId),
    Email(String),
}

impl AccountRef {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.contains('@') {
            Self::Email(value.to_ascii_lowercase())
        } else {
            Self::Id(RemoteId(value.to_string()))
        }
    }
}

impl From<String> for AccountRef {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<&str> for AccountRef {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<AccountRef> for String {
    fn from(account: AccountRef) -> Self {
        account.to_string()
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => f.write_str(id.as_str()),
            Self::Email(email) => f.write_str(email),
        }
    }
}

/// Who a grant was extended to, as far as the server tells us.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invitee {
    pub remote_id: Option<RemoteId>,
    pub email: Option<String>,
    pub username: Option<String>,
}

impl Invitee {
    pub fn matches(&self, account: &AccountRef) -> bool {
        match account {
            AccountRef::Id(id) => self.remote_id.as_ref() == Some(id),
            AccountRef::Email(email) => self
                .email
                .as_deref()
                .is_some_and(|own| own.eq_ignore_ascii_case(email)),
        }
    }

    /// Preferred reference: the remote id when known, else the email.
    pub fn primary_ref(&self) -> Option<AccountRef> {
        self.remote_id
            .clone()
            .map(AccountRef::Id)
            .or_else(|| self.email.as_deref().map(AccountRef::parse))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrantStatus {
    Pending,
    Accepted,
    Active,
    Revoked,
}

impl GrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Active => "active",
            Self::Revoked => "revoked",
        }
    }

    /// Status from the flags both wire shapes carry.
    pub fn from_flags(revoked: bool, accepted: bool, shares_libraries: bool) -> Self {
        if revoked {
            Self::Revoked
        } else if !accepted {
            Self::Pending
        } else if shares_libraries {
            Self::Active
        } else {
            Self::Accepted
        }
    }
}

/// Library access extended to one remote account on one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareGrant {
    /// Absent for a grant that is desired but not yet created.
    pub grant_id: Option<GrantId>,
    pub server_id: ServerId,
    pub invitee: Invitee,
    pub libraries: LibrarySelection,
    pub filters: FilterRules,
    pub status: GrantStatus,
    pub accepted_at: Option<DateTime<Utc>>,
}

impl ShareGrant {
    pub fn is_live(&self) -> bool {
        self.status != GrantStatus::Revoked
    }
}

/// Body of a create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareInvite {
    pub server_id: ServerId,
    pub invitee: AccountRef,
    pub libraries: LibrarySelection,
    pub filters: FilterRules,
}

/// Minimal update: only the fields that differ are present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharePatch {
    pub libraries: Option<LibrarySelection>,
    pub filters: BTreeMap<FilterScope, String>,
}

// ============================================================================
// Desired state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DesiredGrant {
    pub libraries: DesiredLibraries,
    #[serde(default)]
    pub filters: FilterRules,
}

/// Policy for one local user: who should see which libraries on one server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DesiredShareState {
    pub server_id: ServerId,
    #[serde(default)]
    pub grants: BTreeMap<AccountRef, DesiredGrant>,
}

impl DesiredShareState {
    pub fn new(server_id: impl Into<ServerId>) -> Self {
        Self {
            server_id: server_id.into(),
            grants: BTreeMap::new(),
        }
    }

    pub fn grant(mut self, account: &str, libraries: DesiredLibraries, filters: FilterRules) -> Self {
        self.grants
            .insert(AccountRef::parse(account), DesiredGrant { libraries, filters });
        self
    }
}

// ============================================================================
// PIN sessions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinFailure {
    Cancelled,
    Superseded,
    Unauthorized,
    Malformed,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    Pending,
    Claimed,
    Expired,
    Failed(PinFailure),
}

impl PinState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Expired => "expired",
            Self::Failed(PinFailure::Cancelled) => "cancelled",
            Self::Failed(PinFailure::Superseded) => "superseded",
            Self::Failed(_) => "failed",
        }
    }
}

/// A device-authorization code awaiting its claim on the media server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinSession {
    pub pin_id: PinId,
    /// User-facing code to enter on the media server's link page.
    pub code: String,
    pub client_identifier: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: PinState,
}

impl PinSession {
    /// Lifetime the server granted the code.
    pub fn ttl(&self) -> Duration {
        (self.expires_at - self.issued_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Move to `next`. Returns false if the session already reached a
    /// terminal state, leaving it untouched.
    pub fn transition(&mut self, next: PinState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = next;
        true
    }
}

/// Result of one poll of a PIN.
#[derive(Debug, Clone)]
pub enum PinStatus {
    Waiting,
    Claimed(Credential),
    Expired,
}

// ============================================================================
// Partial results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MismatchKind {
    /// An identity field is absent or empty.
    Missing(&'static str),
    /// The record is not an object or a field has the wrong type.
    Undecodable(String),
}

/// A record the mapper had to drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMismatch {
    pub record: &'static str,
    pub index: usize,
    pub kind: MismatchKind,
}

impl SchemaMismatch {
    pub fn missing(record: &'static str, index: usize, field: &'static str) -> Self {
        Self {
            record,
            index,
            kind: MismatchKind::Missing(field),
        }
    }

    pub fn undecodable(record: &'static str, index: usize, detail: impl Into<String>) -> Self {
        Self {
            record,
            index,
            kind: MismatchKind::Undecodable(detail.into()),
        }
    }

    /// The missing identity field, if that is why the record was dropped.
    pub fn field(&self) -> Option<&'static str> {
        match self.kind {
            MismatchKind::Missing(field) => Some(field),
            MismatchKind::Undecodable(_) => None,
        }
    }
}

impl fmt::Display for SchemaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            MismatchKind::Missing(field) => write!(
                f,
                "{} record {} is missing required field `{}`",
                self.record, self.index, field
            ),
            MismatchKind::Undecodable(detail) => write!(
                f,
                "{} record {} could not be decoded: {}",
                self.record, self.index, detail
            ),
        }
    }
}

/// Canonical records plus warnings for the ones that had to be dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapped<T> {
    pub items: Vec<T>,
    pub warnings: Vec<SchemaMismatch>,
}

impl<T> Default for Mapped<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn catalog() -> Vec<Library> {
        vec![
            Library {
                key: "1".into(),
                title: "Movies".to_string(),
                media_type: MediaType::Movie,
            },
            Library {
                key: "2".into(),
                title: "TV Shows".to_string(),
                media_type: MediaType::Show,
            },
        ]
    }

    #[test]
    fn account_ref_parses_emails_case_insensitively() {
        assert_eq!(
            AccountRef::parse(" Alice@Example.com "),
            AccountRef::Email("alice@example.com".to_string())
        );
        assert_eq!(AccountRef::parse("12345"), AccountRef::Id("12345".into()));
    }

    #[test]
    fn invitee_matches_by_id_or_email() {
        let invitee = Invitee {
            remote_id: Some("42".into()),
            email: Some("Bob@example.com".to_string()),
            username: None,
        };
        assert!(invitee.matches(&AccountRef::parse("42")));
        assert!(invitee.matches(&AccountRef::parse("bob@example.com")));
        assert!(!invitee.matches(&AccountRef::parse("43")));
    }

    #[test]
    fn desired_libraries_resolve_by_key_or_title() {
        let selection = DesiredLibraries::named(["movies", "2"])
            .resolve(&catalog())
            .unwrap();
        assert_eq!(selection, LibrarySelection::only(["1", "2"]));
    }

    #[test]
    fn unknown_library_is_reported() {
        let err = DesiredLibraries::named(["Anime"])
            .resolve(&catalog())
            .unwrap_err();
        assert_eq!(err, ShareError::UnknownLibrary("Anime".to_string()));
    }

    #[test]
    fn desired_state_deserializes_from_policy_document() {
        let json = r#"{
            "server_id": "abc123",
            "grants": {
                "alice@example.com": { "libraries": ["Movies"] },
                "42": { "libraries": "all", "filters": { "movies": "label=kids" } }
            }
        }"#;
        let desired: DesiredShareState = serde_json::from_str(json).unwrap();
        assert_eq!(desired.server_id, ServerId::from("abc123"));
        assert_eq!(
            desired.grants[&AccountRef::parse("alice@example.com")].libraries,
            DesiredLibraries::named(["Movies"])
        );
        let bob = &desired.grants[&AccountRef::parse("42")];
        assert_eq!(bob.libraries, DesiredLibraries::All);
        assert_eq!(bob.filters.get(FilterScope::Movies), Some("label=kids"));
    }

    #[test]
    fn bad_library_keyword_is_rejected() {
        let json = r#"{ "libraries": "some" }"#;
        assert!(serde_json::from_str::<DesiredGrant>(json).is_err());
    }

    #[test]
    fn filter_changes_only_cover_differing_scopes() {
        let current = FilterRules::new()
            .with(FilterScope::Movies, "label=kids")
            .with(FilterScope::Music, "genre=jazz");
        let target = FilterRules::new()
            .with(FilterScope::Movies, "label=kids")
            .with(FilterScope::Television, "contentRating=TV-Y");

        let changes = current.changes_to(&target);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[&FilterScope::Music], "");
        assert_eq!(changes[&FilterScope::Television], "contentRating=TV-Y");

        let mut applied = current.clone();
        applied.apply(&changes);
        assert_eq!(applied, target);
    }

    #[test]
    fn grant_status_from_flags() {
        assert_eq!(GrantStatus::from_flags(true, true, true), GrantStatus::Revoked);
        assert_eq!(GrantStatus::from_flags(false, false, true), GrantStatus::Pending);
        assert_eq!(GrantStatus::from_flags(false, true, true), GrantStatus::Active);
        assert_eq!(GrantStatus::from_flags(false, true, false), GrantStatus::Accepted);
    }

    #[test]
    fn terminal_pin_session_does_not_transition_again() {
        let issued = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut session = PinSession {
            pin_id: "1".into(),
            code: "ABCD".to_string(),
            client_identifier: "client".to_string(),
            issued_at: issued,
            expires_at: issued + chrono::Duration::minutes(15),
            state: PinState::Pending,
        };
        assert_eq!(session.ttl(), Duration::from_secs(900));
        assert!(session.transition(PinState::Expired));
        assert!(!session.transition(PinState::Claimed));
        assert_eq!(session.state, PinState::Expired);
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = Credential::new("super-secret-token");
        assert!(!format!("{:?}", credential).contains("super-secret"));
        assert_eq!(credential.expose(), "super-secret-token");
    }
}
