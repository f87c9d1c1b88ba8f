//! Payload shapes as the media server sends them.
//!
//! The legacy endpoints answer with attribute-tagged XML where every value is
//! a string; the `api/v2` endpoints answer with JSON where ids are numbers and
//! flags are sometimes booleans, sometimes integers. Everything is optional
//! here; required fields are enforced by the mapper.

use serde::Deserialize;

// ============================================================================
// Loose scalars
// ============================================================================

/// Boolean that may arrive as `true`, `1` or `"1"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LooseFlag {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl LooseFlag {
    pub fn truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Text(s) => text_flag(s),
        }
    }
}

/// Identifier that may arrive as a number or a string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LooseId {
    Int(i64),
    Text(String),
}

impl LooseId {
    pub fn into_string(self) -> Option<String> {
        match self {
            Self::Int(i) => Some(i.to_string()),
            Self::Text(s) => non_empty(Some(s)),
        }
    }
}

/// Timestamp that may arrive as epoch seconds or RFC 3339 text.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LooseTime {
    Epoch(i64),
    Text(String),
}

pub fn text_flag(s: &str) -> bool {
    matches!(s.trim(), "1" | "true" | "True" | "TRUE" | "yes")
}

pub fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ============================================================================
// Attribute-tagged XML
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct XmlUserContainer {
    #[serde(rename = "User", default)]
    pub users: Vec<XmlUser>,
}

#[derive(Debug, Default, Deserialize)]
pub struct XmlUser {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@title")]
    pub title: Option<String>,
    #[serde(rename = "@username")]
    pub username: Option<String>,
    #[serde(rename = "@email")]
    pub email: Option<String>,
    #[serde(rename = "@thumb")]
    pub thumb: Option<String>,
    #[serde(rename = "@protected")]
    pub protected: Option<String>,
    #[serde(rename = "@home")]
    pub home: Option<String>,
    #[serde(rename = "@restricted")]
    pub restricted: Option<String>,
    #[serde(rename = "@allowTuners")]
    pub allow_tuners: Option<String>,
    #[serde(rename = "@allowSync")]
    pub allow_sync: Option<String>,
    #[serde(rename = "@allowCameraUpload")]
    pub allow_camera_upload: Option<String>,
    #[serde(rename = "@allowChannels")]
    pub allow_channels: Option<String>,
    #[serde(rename = "@allowSubtitleAdmin")]
    pub allow_subtitle_admin: Option<String>,
    #[serde(rename = "@filterAll")]
    pub filter_all: Option<String>,
    #[serde(rename = "@filterMovies")]
    pub filter_movies: Option<String>,
    #[serde(rename = "@filterMusic")]
    pub filter_music: Option<String>,
    #[serde(rename = "@filterPhotos")]
    pub filter_photos: Option<String>,
    #[serde(rename = "@filterTelevision")]
    pub filter_television: Option<String>,
    #[serde(rename = "Server", default)]
    pub servers: Vec<XmlServer>,
}

#[derive(Debug, Default, Deserialize)]
pub struct XmlServer {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@serverId")]
    pub server_id: Option<String>,
    #[serde(rename = "@machineIdentifier")]
    pub machine_identifier: Option<String>,
    #[serde(rename = "@name")]
    pub name: Option<String>,
    #[serde(rename = "@numLibraries")]
    pub num_libraries: Option<String>,
    #[serde(rename = "@allLibraries")]
    pub all_libraries: Option<String>,
    #[serde(rename = "@owned")]
    pub owned: Option<String>,
    #[serde(rename = "@pending")]
    pub pending: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct XmlSharedServerContainer {
    #[serde(rename = "@machineIdentifier")]
    pub machine_identifier: Option<String>,
    #[serde(rename = "SharedServer", default)]
    pub shared_servers: Vec<XmlSharedServer>,
}

#[derive(Debug, Default, Deserialize)]
pub struct XmlSharedServer {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@userID")]
    pub user_id: Option<String>,
    #[serde(rename = "@username")]
    pub username: Option<String>,
    #[serde(rename = "@email")]
    pub email: Option<String>,
    #[serde(rename = "@invitedEmail")]
    pub invited_email: Option<String>,
    #[serde(rename = "@machineIdentifier")]
    pub machine_identifier: Option<String>,
    #[serde(rename = "@acceptedAt")]
    pub accepted_at: Option<String>,
    #[serde(rename = "@deletedAt")]
    pub deleted_at: Option<String>,
    #[serde(rename = "@allLibraries")]
    pub all_libraries: Option<String>,
    #[serde(rename = "@filterAll")]
    pub filter_all: Option<String>,
    #[serde(rename = "@filterMovies")]
    pub filter_movies: Option<String>,
    #[serde(rename = "@filterMusic")]
    pub filter_music: Option<String>,
    #[serde(rename = "@filterPhotos")]
    pub filter_photos: Option<String>,
    #[serde(rename = "@filterTelevision")]
    pub filter_television: Option<String>,
    #[serde(rename = "Section", default)]
    pub sections: Vec<XmlSection>,
}

#[derive(Debug, Default, Deserialize)]
pub struct XmlSection {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@key")]
    pub key: Option<String>,
    #[serde(rename = "@title")]
    pub title: Option<String>,
    #[serde(rename = "@type")]
    pub kind: Option<String>,
    #[serde(rename = "@shared")]
    pub shared: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct XmlServerContainer {
    #[serde(rename = "Server", default)]
    pub servers: Vec<XmlLibraryServer>,
}

#[derive(Debug, Default, Deserialize)]
pub struct XmlLibraryServer {
    #[serde(rename = "@machineIdentifier")]
    pub machine_identifier: Option<String>,
    #[serde(rename = "Section", default)]
    pub sections: Vec<XmlSection>,
}

// ============================================================================
// Nested JSON
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonUser {
    pub id: Option<LooseId>,
    pub title: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub thumb: Option<String>,
    pub protected: Option<LooseFlag>,
    pub home: Option<LooseFlag>,
    pub restricted: Option<LooseFlag>,
    pub allow_tuners: Option<LooseFlag>,
    pub allow_sync: Option<LooseFlag>,
    pub allow_camera_upload: Option<LooseFlag>,
    pub allow_channels: Option<LooseFlag>,
    pub allow_subtitle_admin: Option<LooseFlag>,
    pub filter_all: Option<String>,
    pub filter_movies: Option<String>,
    pub filter_music: Option<String>,
    pub filter_photos: Option<String>,
    pub filter_television: Option<String>,
    #[serde(default)]
    pub servers: Vec<JsonServerMembership>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonServerMembership {
    pub id: Option<LooseId>,
    pub machine_identifier: Option<String>,
    pub name: Option<String>,
    pub num_libraries: Option<LooseId>,
    pub all_libraries: Option<LooseFlag>,
    pub owned: Option<LooseFlag>,
    pub pending: Option<LooseFlag>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonSharingSettings {
    pub filter_all: Option<String>,
    pub filter_movies: Option<String>,
    pub filter_music: Option<String>,
    pub filter_photos: Option<String>,
    pub filter_television: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonInvited {
    pub id: Option<LooseId>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonLibrary {
    pub id: Option<LooseId>,
    pub key: Option<LooseId>,
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonShare {
    pub id: Option<LooseId>,
    pub invited_id: Option<LooseId>,
    pub invited_email: Option<String>,
    pub invited: Option<JsonInvited>,
    pub accepted: Option<LooseFlag>,
    pub accepted_at: Option<LooseTime>,
    pub deleted_at: Option<LooseTime>,
    pub left_at: Option<LooseTime>,
    pub all_libraries: Option<LooseFlag>,
    #[serde(default)]
    pub libraries: Vec<JsonLibrary>,
    pub machine_identifier: Option<String>,
    pub sharing_settings: Option<JsonSharingSettings>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonServer {
    pub name: Option<String>,
    pub machine_identifier: Option<String>,
    #[serde(default)]
    pub library_sections: Vec<JsonLibrary>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonAccount {
    pub id: Option<LooseId>,
    pub uuid: Option<String>,
    pub username: Option<String>,
    pub title: Option<String>,
    pub email: Option<String>,
    pub thumb: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonPin {
    pub id: Option<LooseId>,
    pub code: Option<String>,
    pub client_identifier: Option<String>,
    pub created_at: Option<LooseTime>,
    pub expires_at: Option<LooseTime>,
    pub expires_in: Option<i64>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JsonErrorEnvelope {
    #[serde(default)]
    pub errors: Vec<JsonErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JsonErrorDetail {
    pub code: Option<i64>,
    pub message: Option<String>,
    pub status: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loose_flags_coerce_legacy_values() {
        let flags: Vec<LooseFlag> = serde_json::from_str(r#"[true, 1, "1", "true", false, 0, "0", ""]"#).unwrap();
        let truthy: Vec<bool> = flags.iter().map(LooseFlag::truthy).collect();
        assert_eq!(truthy, vec![true, true, true, true, false, false, false, false]);
    }

    #[test]
    fn loose_ids_accept_numbers_and_strings() {
        let ids: Vec<LooseId> = serde_json::from_str(r#"[42, "abc", ""]"#).unwrap();
        let ids: Vec<Option<String>> = ids.into_iter().map(LooseId::into_string).collect();
        assert_eq!(ids, vec![Some("42".to_string()), Some("abc".to_string()), None]);
    }
}
