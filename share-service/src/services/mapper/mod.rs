//! Canonical model mapper.
//!
//! Pure translation from wire payloads to the canonical model. The decode
//! strategy is picked once, from the response content type; callers never
//! branch on the wire shape.

pub mod wire;

use crate::error::ShareError;
use crate::models::{
    Credential, FilterRules, FilterScope, GrantId, GrantStatus, Invitee, Library, LibraryKey,
    LibrarySelection, Mapped, MediaType, PinSession, PinState, RemoteAccount, RemoteId,
    RemoteUser, SchemaMismatch, ServerId, ServerMembership, ShareGrant, SharePermissions,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use wire::{
    non_empty, text_flag, JsonAccount, JsonErrorEnvelope, JsonLibrary, JsonPin, JsonServer,
    JsonShare, JsonUser, LooseFlag, LooseId, LooseTime, XmlSection, XmlServerContainer,
    XmlSharedServerContainer, XmlUserContainer,
};

/// Lifetime assumed for a PIN when the server does not state one.
const DEFAULT_PIN_TTL_SECS: i64 = 1800;

/// A response body tagged with the decode strategy for its content type.
#[derive(Debug, Clone, Copy)]
pub enum WirePayload<'a> {
    Xml(&'a str),
    Json(&'a str),
}

impl<'a> WirePayload<'a> {
    /// Select the strategy from the `Content-Type` header, sniffing the body
    /// when the header is missing or uninformative.
    pub fn detect(content_type: Option<&str>, body: &'a str) -> Self {
        match content_type.map(|ct| ct.to_ascii_lowercase()) {
            Some(ct) if ct.contains("xml") => Self::Xml(body),
            Some(ct) if ct.contains("json") => Self::Json(body),
            _ if body.trim_start().starts_with('<') => Self::Xml(body),
            _ => Self::Json(body),
        }
    }
}

// ============================================================================
// Users
// ============================================================================

pub fn users(payload: WirePayload<'_>) -> Result<Mapped<RemoteUser>, ShareError> {
    let mut mapped = Mapped::default();

    match payload {
        WirePayload::Xml(body) => {
            let container: XmlUserContainer = from_xml(body)?;
            for (index, user) in container.users.into_iter().enumerate() {
                let Some(remote_id) = non_empty(user.id) else {
                    mapped.warnings.push(mismatch("user", index, "id"));
                    continue;
                };
                let username = non_empty(user.username).unwrap_or_default();
                let filters = filters_from([
                    (FilterScope::All, user.filter_all),
                    (FilterScope::Movies, user.filter_movies),
                    (FilterScope::Television, user.filter_television),
                    (FilterScope::Music, user.filter_music),
                    (FilterScope::Photos, user.filter_photos),
                ]);
                let servers = user
                    .servers
                    .into_iter()
                    .filter_map(|server| {
                        Some(ServerMembership {
                            grant_id: non_empty(server.id).map(GrantId),
                            server_id: ServerId(non_empty(server.machine_identifier)?),
                            name: server.name.unwrap_or_default(),
                            num_libraries: server
                                .num_libraries
                                .and_then(|n| n.trim().parse().ok())
                                .unwrap_or(0),
                            all_libraries: xml_flag(&server.all_libraries),
                            owned: xml_flag(&server.owned),
                            pending: xml_flag(&server.pending),
                        })
                    })
                    .collect();

                mapped.items.push(RemoteUser {
                    remote_id: RemoteId(remote_id),
                    display_name: non_empty(user.title).unwrap_or_else(|| username.clone()),
                    username,
                    email: non_empty(user.email),
                    thumb: non_empty(user.thumb),
                    home: xml_flag(&user.home),
                    restricted: xml_flag(&user.restricted),
                    protected: xml_flag(&user.protected),
                    permissions: SharePermissions {
                        allow_sync: xml_flag(&user.allow_sync),
                        allow_camera_upload: xml_flag(&user.allow_camera_upload),
                        allow_channels: xml_flag(&user.allow_channels),
                        allow_tuners: xml_flag(&user.allow_tuners),
                        allow_subtitle_admin: xml_flag(&user.allow_subtitle_admin),
                    },
                    filters,
                    servers,
                });
            }
        }
        WirePayload::Json(body) => {
            for (index, record) in json_records(body, &["users", "friends"])?.into_iter().enumerate() {
                let user = match decode_record::<JsonUser>("user", index, record) {
                    Ok(user) => user,
                    Err(warning) => {
                        mapped.warnings.push(warning);
                        continue;
                    }
                };
                let Some(remote_id) = user.id.and_then(LooseId::into_string) else {
                    mapped.warnings.push(mismatch("user", index, "id"));
                    continue;
                };
                let username = non_empty(user.username).unwrap_or_default();
                let filters = filters_from([
                    (FilterScope::All, user.filter_all),
                    (FilterScope::Movies, user.filter_movies),
                    (FilterScope::Television, user.filter_television),
                    (FilterScope::Music, user.filter_music),
                    (FilterScope::Photos, user.filter_photos),
                ]);
                let servers = user
                    .servers
                    .into_iter()
                    .filter_map(|server| {
                        Some(ServerMembership {
                            grant_id: server.id.and_then(LooseId::into_string).map(GrantId),
                            server_id: ServerId(non_empty(server.machine_identifier)?),
                            name: server.name.unwrap_or_default(),
                            num_libraries: server
                                .num_libraries
                                .and_then(LooseId::into_string)
                                .and_then(|n| n.parse().ok())
                                .unwrap_or(0),
                            all_libraries: json_flag(&server.all_libraries),
                            owned: json_flag(&server.owned),
                            pending: json_flag(&server.pending),
                        })
                    })
                    .collect();

                mapped.items.push(RemoteUser {
                    remote_id: RemoteId(remote_id),
                    display_name: non_empty(user.title).unwrap_or_else(|| username.clone()),
                    username,
                    email: non_empty(user.email),
                    thumb: non_empty(user.thumb),
                    home: json_flag(&user.home),
                    restricted: json_flag(&user.restricted),
                    protected: json_flag(&user.protected),
                    permissions: SharePermissions {
                        allow_sync: json_flag(&user.allow_sync),
                        allow_camera_upload: json_flag(&user.allow_camera_upload),
                        allow_channels: json_flag(&user.allow_channels),
                        allow_tuners: json_flag(&user.allow_tuners),
                        allow_subtitle_admin: json_flag(&user.allow_subtitle_admin),
                    },
                    filters,
                    servers,
                });
            }
        }
    }

    Ok(mapped)
}

// ============================================================================
// Share grants
// ============================================================================

/// Current grants on `server_id`.
pub fn shares(
    payload: WirePayload<'_>,
    server_id: &ServerId,
) -> Result<Mapped<ShareGrant>, ShareError> {
    let mut mapped = Mapped::default();

    match payload {
        WirePayload::Xml(body) => {
            let container: XmlSharedServerContainer = from_xml(body)?;
            let container_server = non_empty(container.machine_identifier);
            for (index, shared) in container.shared_servers.into_iter().enumerate() {
                let Some(grant_id) = non_empty(shared.id) else {
                    mapped.warnings.push(mismatch("share", index, "id"));
                    continue;
                };
                let invitee = Invitee {
                    remote_id: non_empty(shared.user_id)
                        .filter(|id| id.trim() != "0")
                        .map(RemoteId),
                    email: non_empty(shared.email).or(non_empty(shared.invited_email)),
                    username: non_empty(shared.username),
                };
                if invitee.remote_id.is_none() && invitee.email.is_none() {
                    mapped.warnings.push(mismatch("share", index, "userID"));
                    continue;
                }

                let libraries = if xml_flag(&shared.all_libraries) {
                    LibrarySelection::All
                } else {
                    LibrarySelection::Only(
                        shared
                            .sections
                            .iter()
                            .filter(|section| xml_flag(&section.shared))
                            .filter_map(section_key)
                            .collect(),
                    )
                };
                let accepted_at = shared.accepted_at.as_deref().and_then(parse_time_text);
                let revoked = shared.deleted_at.as_deref().and_then(parse_time_text).is_some();
                let status = GrantStatus::from_flags(
                    revoked,
                    accepted_at.is_some(),
                    !libraries.is_empty(),
                );

                mapped.items.push(ShareGrant {
                    grant_id: Some(GrantId(grant_id)),
                    server_id: non_empty(shared.machine_identifier)
                        .or_else(|| container_server.clone())
                        .map(ServerId)
                        .unwrap_or_else(|| server_id.clone()),
                    invitee,
                    libraries,
                    filters: filters_from([
                        (FilterScope::All, shared.filter_all),
                        (FilterScope::Movies, shared.filter_movies),
                        (FilterScope::Television, shared.filter_television),
                        (FilterScope::Music, shared.filter_music),
                        (FilterScope::Photos, shared.filter_photos),
                    ]),
                    status,
                    accepted_at,
                });
            }
        }
        WirePayload::Json(body) => {
            for (index, record) in json_records(body, &["sharedServers", "shared_servers"])?
                .into_iter()
                .enumerate()
            {
                let share = match decode_record::<JsonShare>("share", index, record) {
                    Ok(share) => share,
                    Err(warning) => {
                        mapped.warnings.push(warning);
                        continue;
                    }
                };
                match json_share(share, server_id) {
                    Ok(grant) => mapped.items.push(grant),
                    Err(field) => mapped.warnings.push(mismatch("share", index, field)),
                }
            }
        }
    }

    Ok(mapped)
}

/// A single grant as returned by a create or update call.
pub fn share(payload: WirePayload<'_>, server_id: &ServerId) -> Result<ShareGrant, ShareError> {
    let WirePayload::Json(body) = payload else {
        return shares(payload, server_id)?
            .items
            .into_iter()
            .next()
            .ok_or_else(|| ShareError::Malformed("share response carried no grant".to_string()));
    };

    let record: JsonShare = from_json(body)?;
    json_share(record, server_id)
        .map_err(|field| ShareError::Malformed(format!("share response is missing `{}`", field)))
}

fn json_share(share: JsonShare, server_id: &ServerId) -> Result<ShareGrant, &'static str> {
    let grant_id = share
        .id
        .and_then(LooseId::into_string)
        .ok_or("id")?;
    let invited = share.invited.unwrap_or_default();
    let invitee = Invitee {
        remote_id: share
            .invited_id
            .and_then(LooseId::into_string)
            .or_else(|| invited.id.and_then(LooseId::into_string))
            .filter(|id| id != "0")
            .map(RemoteId),
        email: non_empty(share.invited_email).or(non_empty(invited.email)),
        username: non_empty(invited.username).or(non_empty(invited.title)),
    };
    if invitee.remote_id.is_none() && invitee.email.is_none() {
        return Err("invitedId");
    }

    let libraries = if json_flag(&share.all_libraries) {
        LibrarySelection::All
    } else {
        LibrarySelection::Only(share.libraries.into_iter().filter_map(json_library_key).collect())
    };
    let settings = share.sharing_settings.unwrap_or_default();
    let accepted_at = share.accepted_at.and_then(parse_loose_time);
    let revoked = share.deleted_at.and_then(parse_loose_time).is_some()
        || share.left_at.and_then(parse_loose_time).is_some();
    let accepted = share
        .accepted
        .map(|flag| flag.truthy())
        .unwrap_or(accepted_at.is_some());

    Ok(ShareGrant {
        grant_id: Some(GrantId(grant_id)),
        server_id: non_empty(share.machine_identifier)
            .map(ServerId)
            .unwrap_or_else(|| server_id.clone()),
        invitee,
        status: GrantStatus::from_flags(revoked, accepted, !libraries.is_empty()),
        libraries,
        filters: filters_from([
            (FilterScope::All, settings.filter_all),
            (FilterScope::Movies, settings.filter_movies),
            (FilterScope::Television, settings.filter_television),
            (FilterScope::Music, settings.filter_music),
            (FilterScope::Photos, settings.filter_photos),
        ]),
        accepted_at,
    })
}

// ============================================================================
// Libraries
// ============================================================================

pub fn libraries(payload: WirePayload<'_>) -> Result<Mapped<Library>, ShareError> {
    let mut mapped = Mapped::default();

    match payload {
        WirePayload::Xml(body) => {
            let container: XmlServerContainer = from_xml(body)?;
            let sections = container.servers.into_iter().flat_map(|s| s.sections);
            for (index, section) in sections.enumerate() {
                let Some(key) = section_key(&section) else {
                    mapped.warnings.push(mismatch("library", index, "key"));
                    continue;
                };
                mapped.items.push(Library {
                    title: section.title.unwrap_or_else(|| key.to_string()),
                    media_type: MediaType::from_wire(section.kind.as_deref().unwrap_or_default()),
                    key,
                });
            }
        }
        WirePayload::Json(body) => {
            let server: JsonServer = from_json(body)?;
            for (index, section) in server.library_sections.into_iter().enumerate() {
                let title = section.title.clone();
                let kind = section.kind.clone();
                let Some(key) = json_library_key(section) else {
                    mapped.warnings.push(mismatch("library", index, "key"));
                    continue;
                };
                mapped.items.push(Library {
                    title: title.unwrap_or_else(|| key.to_string()),
                    media_type: MediaType::from_wire(kind.as_deref().unwrap_or_default()),
                    key,
                });
            }
        }
    }

    Ok(mapped)
}

// ============================================================================
// Account & PIN
// ============================================================================

pub fn account(payload: WirePayload<'_>) -> Result<RemoteAccount, ShareError> {
    let account: JsonAccount = match payload {
        WirePayload::Json(body) => from_json(body)?,
        WirePayload::Xml(_) => {
            return Err(ShareError::Malformed(
                "account endpoint answered with XML".to_string(),
            ))
        }
    };

    let remote_id = account
        .id
        .and_then(LooseId::into_string)
        .ok_or_else(|| ShareError::Malformed("account is missing `id`".to_string()))?;
    let username = non_empty(account.username).unwrap_or_default();

    Ok(RemoteAccount {
        remote_id: RemoteId(remote_id),
        uuid: non_empty(account.uuid),
        display_name: non_empty(account.title).unwrap_or_else(|| username.clone()),
        username,
        email: non_empty(account.email),
        thumb: non_empty(account.thumb),
    })
}

/// A PIN together with the token it carries once claimed.
pub fn pin(
    payload: WirePayload<'_>,
    client_identifier: &str,
    now: DateTime<Utc>,
) -> Result<(PinSession, Option<Credential>), ShareError> {
    let pin: JsonPin = match payload {
        WirePayload::Json(body) => from_json(body)?,
        WirePayload::Xml(_) => {
            return Err(ShareError::Malformed("pin endpoint answered with XML".to_string()))
        }
    };

    let pin_id = pin
        .id
        .and_then(LooseId::into_string)
        .ok_or_else(|| ShareError::Malformed("pin is missing `id`".to_string()))?;
    let code = non_empty(pin.code)
        .ok_or_else(|| ShareError::Malformed("pin is missing `code`".to_string()))?;
    let issued_at = pin.created_at.and_then(parse_loose_time).unwrap_or(now);
    let expires_at = pin
        .expires_at
        .and_then(parse_loose_time)
        .unwrap_or_else(|| {
            issued_at + chrono::Duration::seconds(pin.expires_in.unwrap_or(DEFAULT_PIN_TTL_SECS))
        });

    let session = PinSession {
        pin_id: pin_id.into(),
        code,
        client_identifier: non_empty(pin.client_identifier)
            .unwrap_or_else(|| client_identifier.to_string()),
        issued_at,
        expires_at,
        state: PinState::Pending,
    };
    Ok((session, non_empty(pin.auth_token).map(Credential::new)))
}

/// Human-readable message from an error body, when the server sent one.
pub fn error_message(body: &str) -> Option<String> {
    let envelope: JsonErrorEnvelope = serde_json::from_str(body).ok()?;
    let messages: Vec<String> = envelope
        .errors
        .into_iter()
        .filter_map(|e| {
            let message = e.message?;
            Some(match e.code {
                Some(code) => format!("{} ({})", message, code),
                None => message,
            })
        })
        .collect();
    (!messages.is_empty()).then(|| messages.join("; "))
}

// ============================================================================
// Helpers
// ============================================================================

fn mismatch(record: &'static str, index: usize, field: &'static str) -> SchemaMismatch {
    SchemaMismatch::missing(record, index, field)
}

fn from_xml<T: DeserializeOwned>(body: &str) -> Result<T, ShareError> {
    quick_xml::de::from_str(body).map_err(|e| ShareError::Malformed(e.to_string()))
}

fn from_json<T: DeserializeOwned>(body: &str) -> Result<T, ShareError> {
    serde_json::from_str(body).map_err(|e| ShareError::Malformed(e.to_string()))
}

/// Records of a JSON list response: either a bare array or an object holding
/// the array under one of `keys`.
fn json_records(body: &str, keys: &[&str]) -> Result<Vec<Value>, ShareError> {
    let value: Value = from_json(body)?;
    match value {
        Value::Array(records) => Ok(records),
        Value::Object(mut object) => keys
            .iter()
            .find_map(|key| match object.remove(*key) {
                Some(Value::Array(records)) => Some(records),
                _ => None,
            })
            .ok_or_else(|| ShareError::Malformed("expected a list of records".to_string())),
        _ => Err(ShareError::Malformed("expected a list of records".to_string())),
    }
}

fn decode_record<T: DeserializeOwned>(
    kind: &'static str,
    index: usize,
    record: Value,
) -> Result<T, SchemaMismatch> {
    if !record.is_object() {
        return Err(SchemaMismatch::undecodable(kind, index, "expected an object"));
    }
    serde_json::from_value(record)
        .map_err(|e| SchemaMismatch::undecodable(kind, index, e.to_string()))
}

fn xml_flag(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(text_flag)
}

fn json_flag(value: &Option<LooseFlag>) -> bool {
    value.as_ref().is_some_and(LooseFlag::truthy)
}

fn filters_from(entries: [(FilterScope, Option<String>); 5]) -> FilterRules {
    let mut rules = FilterRules::new();
    for (scope, expression) in entries {
        if let Some(expression) = expression {
            rules.set(scope, expression);
        }
    }
    rules
}

fn section_key(section: &XmlSection) -> Option<LibraryKey> {
    non_empty(section.key.clone())
        .or_else(|| non_empty(section.id.clone()))
        .map(LibraryKey)
}

fn json_library_key(library: JsonLibrary) -> Option<LibraryKey> {
    library
        .key
        .and_then(LooseId::into_string)
        .or_else(|| library.id.and_then(LooseId::into_string))
        .map(LibraryKey)
}

fn parse_loose_time(value: LooseTime) -> Option<DateTime<Utc>> {
    match value {
        LooseTime::Epoch(secs) => epoch(secs),
        LooseTime::Text(text) => parse_time_text(&text),
    }
}

fn parse_time_text(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match text.parse::<i64>() {
        Ok(secs) => epoch(secs),
        Err(_) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
    }
}

fn epoch(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}
