//! Plex client against a mock HTTP server.

use service_core::clock::TokioClock;
use service_core::retry::RetryConfig;
use share_service::config::PlexConfig;
use share_service::models::{
    AccountRef, Credential, DesiredLibraries, DesiredShareState, FilterRules, GrantId,
    GrantStatus, LibrarySelection, PinId, PinStatus, ServerId, ShareInvite,
};
use share_service::services::{Action, MediaServerApi, Outcome, PlexClient, ReconcileEngine, RetryingApi};
use share_service::ShareError;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "owner-token";
const SERVER: &str = "abc123";

const USERS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MediaContainer friendlyName="myPlex" identifier="com.plexapp.plugins.myplex" totalSize="3" size="3">
  <User id="101" title="Alice" username="alice" email="alice@example.com" home="0" allowSync="1" restricted="0"/>
  <User title="Nameless" username="nameless" email="nameless@example.com" home="0"/>
  <User id="102" title="Bob" username="bob" email="bob@example.com" home="1" allowSync="0" restricted="1"/>
</MediaContainer>"#;

const LIBRARIES_JSON: &str = r#"{"name": "Home", "machineIdentifier": "abc123", "librarySections": [
    {"id": 11, "key": 1, "title": "Movies", "type": "movie"},
    {"id": 12, "key": 2, "title": "TV Shows", "type": "show"}
]}"#;

fn xml(status: u16, body: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_raw(body.as_bytes().to_vec(), "application/xml")
}

fn config(server: &MockServer) -> PlexConfig {
    PlexConfig {
        api_base_url: server.uri(),
        product: "Share Service Tests".to_string(),
        client_identifier: "test-client".to_string(),
        version: "0.1.0".to_string(),
        request_timeout_secs: 5,
    }
}

fn client(server: &MockServer) -> PlexClient {
    PlexClient::new(config(server)).unwrap()
}

fn credential() -> Credential {
    Credential::new(TOKEN)
}

#[tokio::test]
async fn users_are_fetched_with_identity_headers_and_normalized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/users"))
        .and(header("X-Plex-Token", TOKEN))
        .and(header("X-Plex-Client-Identifier", "test-client"))
        .and(header("X-Plex-Product", "Share Service Tests"))
        .respond_with(xml(200, USERS_XML))
        .expect(1)
        .mount(&server)
        .await;

    let users = client(&server).fetch_users(&credential()).await.unwrap();

    assert_eq!(users.items.len(), 2);
    assert_eq!(users.warnings.len(), 1);
    assert_eq!(users.warnings[0].field(), Some("id"));
    assert_eq!(users.items[0].username, "alice");
    assert!(users.items[0].permissions.allow_sync);
    assert!(users.items[1].home);
    assert!(users.items[1].restricted);
}

#[tokio::test]
async fn rejected_token_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/user"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "errors": [{"code": 1001, "message": "User could not be authenticated", "status": 401}]
        })))
        .mount(&server)
        .await;

    let err = client(&server).fetch_account(&credential()).await.unwrap_err();
    assert_eq!(err, ShareError::Unauthorized);
}

#[tokio::test]
async fn rate_limit_carries_server_delay_or_default() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/user"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let client = client(&server).with_default_retry_after(Duration::from_secs(3));

    assert_eq!(
        client.fetch_account(&credential()).await.unwrap_err(),
        ShareError::RateLimited {
            retry_after: Duration::from_secs(7)
        }
    );
    assert_eq!(
        client.fetch_users(&credential()).await.unwrap_err(),
        ShareError::RateLimited {
            retry_after: Duration::from_secs(3)
        }
    );
}

#[tokio::test]
async fn server_errors_are_transient_and_client_errors_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/api/v2/servers/{}", SERVER)))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v2/shared_servers"))
        .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
            "errors": [{"code": 1029, "message": "Invalid library section"}]
        })))
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client
        .fetch_server_libraries(&credential(), &ServerId::from(SERVER))
        .await
        .unwrap_err();
    assert!(matches!(err, ShareError::Transient(_)));

    let invite = ShareInvite {
        server_id: ServerId::from(SERVER),
        invitee: AccountRef::parse("alice@example.com"),
        libraries: LibrarySelection::only(["99"]),
        filters: FilterRules::new(),
    };
    let err = client.create_share(&credential(), &invite).await.unwrap_err();
    assert_eq!(
        err,
        ShareError::Rejected {
            status: 422,
            message: "Invalid library section (1029)".to_string()
        }
    );
}

#[tokio::test]
async fn unparseable_body_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/user"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("not valid json {{{", "application/json"))
        .mount(&server)
        .await;

    let err = client(&server).fetch_account(&credential()).await.unwrap_err();
    assert!(matches!(err, ShareError::Malformed(_)));
}

#[tokio::test]
async fn create_share_sends_invite_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/shared_servers"))
        .and(header("X-Plex-Token", TOKEN))
        .and(body_json(serde_json::json!({
            "machineIdentifier": SERVER,
            "invitedEmail": "alice@example.com",
            "librarySectionIds": ["1"],
            "settings": {"filterMovies": "label=kids"}
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": 9001,
            "accepted": false,
            "allLibraries": false,
            "invitedEmail": "alice@example.com",
            "machineIdentifier": SERVER,
            "libraries": [{"id": 11, "key": 1, "title": "Movies", "type": "movie"}],
            "sharingSettings": {"filterMovies": "label=kids"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let invite = ShareInvite {
        server_id: ServerId::from(SERVER),
        invitee: AccountRef::parse("alice@example.com"),
        libraries: LibrarySelection::only(["1"]),
        filters: FilterRules::new().with(share_service::models::FilterScope::Movies, "label=kids"),
    };
    let grant = client(&server).create_share(&credential(), &invite).await.unwrap();

    assert_eq!(grant.grant_id, Some(GrantId::from("9001")));
    assert_eq!(grant.status, GrantStatus::Pending);
    assert_eq!(grant.libraries, LibrarySelection::only(["1"]));
    assert_eq!(grant.invitee.email.as_deref(), Some("alice@example.com"));
}

#[tokio::test]
async fn revoking_a_missing_share_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/v2/shared_servers/77"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .revoke_share(&credential(), &GrantId::from("77"))
        .await
        .unwrap();
}

#[tokio::test]
async fn pin_is_created_then_polled_until_claimed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/pins"))
        .and(query_param("strong", "true"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": 4242,
            "code": "WXYZ",
            "clientIdentifier": "test-client",
            "expiresIn": 900,
            "authToken": null
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/pins/4242"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 4242,
            "code": "WXYZ",
            "expiresIn": 900,
            "authToken": "claimed-token"
        })))
        .mount(&server)
        .await;

    let client = client(&server);
    let session = client.create_pin().await.unwrap();
    assert_eq!(session.pin_id, PinId::from("4242"));
    assert_eq!(session.code, "WXYZ");
    assert_eq!(session.ttl(), Duration::from_secs(900));

    match client.poll_pin(&session.pin_id).await.unwrap() {
        PinStatus::Claimed(token) => assert_eq!(token.expose(), "claimed-token"),
        other => panic!("expected a claimed pin, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_pin_reads_as_expired() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/pins/1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let status = client(&server).poll_pin(&PinId::from("1")).await.unwrap();
    assert!(matches!(status, PinStatus::Expired));
}

#[tokio::test]
async fn retrying_client_recovers_from_one_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/user"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": 1, "uuid": "owner-uuid", "username": "owner", "title": "Owner"
        })))
        .mount(&server)
        .await;

    let api = RetryingApi::new(
        client(&server),
        RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            add_jitter: false,
            max_mandated_wait: Duration::from_secs(1),
        },
        Arc::new(TokioClock),
    );

    let account = api.fetch_account(&credential()).await.unwrap();
    assert_eq!(account.username, "owner");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn reconcile_over_http_proceeds_past_dropped_record() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/users"))
        .respond_with(xml(200, USERS_XML))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/api/v2/servers/{}", SERVER)))
        .respond_with(ResponseTemplate::new(200).set_body_raw(LIBRARIES_JSON, "application/json"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/api/servers/{}/shared_servers", SERVER)))
        .respond_with(xml(200, r#"<MediaContainer size="0"></MediaContainer>"#))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v2/shared_servers"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": 500,
            "accepted": true,
            "allLibraries": false,
            "invitedId": 101,
            "machineIdentifier": SERVER,
            "libraries": [{"id": 11, "key": 1, "title": "Movies", "type": "movie"}]
        })))
        .expect(2)
        .mount(&server)
        .await;

    let engine = ReconcileEngine::new(Arc::new(client(&server)), 2);
    let desired = DesiredShareState::new(SERVER)
        .grant("alice@example.com", DesiredLibraries::named(["Movies"]), FilterRules::new())
        .grant("102", DesiredLibraries::named(["Movies"]), FilterRules::new());

    let report = engine.run(&credential(), &desired).await.unwrap();

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.count(Action::Create), 2);
    assert!(report
        .results
        .iter()
        .all(|r| r.outcome == Outcome::Applied(GrantStatus::Active)));
}
