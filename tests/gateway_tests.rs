//! Connect, disconnect, status and picker flows

mod test_utils;

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use integrations::config::IntegrationConfig;
use integrations::error::IntegrationError;
use integrations::gateway::ConnectRequest;
use integrations::providers::Provider;
use serde_json::json;
use test_utils::Harness;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

fn request(code: &str) -> ConnectRequest {
    ConnectRequest {
        code: code.to_string(),
        redirect_uri: "https://app.example.com/oauth/callback".to_string(),
        code_verifier: None,
    }
}

async fn mock_google_exchange(h: &Harness, refresh_token: Option<&str>) {
    let mut body = json!({
        "access_token": "ya29.connected",
        "token_type": "Bearer",
        "expires_in": 3599
    });
    if let Some(refresh) = refresh_token {
        body["refresh_token"] = json!(refresh);
    }
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&h.server)
        .await;
}

#[tokio::test]
async fn status_lists_every_provider_as_disconnected_by_default() {
    let h = Harness::new().await;
    let status = h.gateway.status(&h.user_id).await.unwrap();

    assert_eq!(status.len(), 2);
    for provider in Provider::ALL {
        let entry = &status[&provider];
        assert!(!entry.connected);
        assert!(entry.email.is_none());
        assert!(entry.last_synced.is_none());
        assert!(entry.valid_upto.is_none());
    }
}

#[tokio::test]
async fn connect_stores_an_encrypted_credential() {
    let h = Harness::new().await;
    mock_google_exchange(&h, Some("1//refresh")).await;
    Mock::given(method("GET"))
        .and(path("/oauth2/v2/userinfo"))
        .and(header("authorization", "Bearer ya29.connected"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "email": "recruiter@gmail.com" })),
        )
        .mount(&h.server)
        .await;

    let email = h
        .gateway
        .connect(&h.user_id, Provider::Google, request("auth-code"))
        .await
        .unwrap();
    assert_eq!(email.as_deref(), Some("recruiter@gmail.com"));

    let record = h.credential(Provider::Google).await;
    assert!(record.connected);
    assert_eq!(record.version, 1);
    let ciphertext = record.access_token_ciphertext.clone().unwrap();
    assert!(
        !ciphertext
            .windows(b"ya29.connected".len())
            .any(|w| w == b"ya29.connected")
    );
    let tokens = h.credentials.decrypt_tokens(&record).unwrap().unwrap();
    assert_eq!(tokens.access_token, "ya29.connected");
    assert_eq!(tokens.refresh_token, "1//refresh");

    let status = h.gateway.status(&h.user_id).await.unwrap();
    let google = &status[&Provider::Google];
    assert!(google.connected);
    assert_eq!(google.email.as_deref(), Some("recruiter@gmail.com"));
    assert!(google.valid_upto.unwrap() > Utc::now() + ChronoDuration::minutes(55));
    assert!(!status[&Provider::Microsoft].connected);
}

#[tokio::test]
async fn connect_succeeds_when_the_email_lookup_fails() {
    let h = Harness::new().await;
    mock_google_exchange(&h, Some("1//refresh")).await;
    Mock::given(method("GET"))
        .and(path("/oauth2/v2/userinfo"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&h.server)
        .await;

    let email = h
        .gateway
        .connect(&h.user_id, Provider::Google, request("auth-code"))
        .await
        .unwrap();
    assert!(email.is_none());
    assert!(h.credential(Provider::Google).await.connected);
}

#[tokio::test]
async fn connect_without_refresh_token_needs_a_stored_one() {
    let h = Harness::new().await;
    mock_google_exchange(&h, None).await;
    Mock::given(method("GET"))
        .and(path("/oauth2/v2/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&h.server)
        .await;

    let err = h
        .gateway
        .connect(&h.user_id, Provider::Google, request("auth-code"))
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::Validation(_)));

    // A reconnect keeps the refresh token already on file
    h.seed_credential(Provider::Google, "old-access", "old-refresh", -10)
        .await;
    h.gateway
        .connect(&h.user_id, Provider::Google, request("auth-code"))
        .await
        .unwrap();
    let record = h.credential(Provider::Google).await;
    let tokens = h.credentials.decrypt_tokens(&record).unwrap().unwrap();
    assert_eq!(tokens.access_token, "ya29.connected");
    assert_eq!(tokens.refresh_token, "old-refresh");
    assert_eq!(record.version, 2);
}

#[tokio::test]
async fn connect_rejects_blank_codes_and_unknown_users() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.server)
        .await;

    let err = h
        .gateway
        .connect(&h.user_id, Provider::Google, request("  "))
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::Validation(_)));

    let stranger = Uuid::new_v4();
    let err = h
        .gateway
        .connect(&stranger, Provider::Google, request("auth-code"))
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::UserNotFound(id) if id == stranger));
}

#[tokio::test]
async fn rejected_code_is_an_invalid_authorization() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/common/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "AADSTS70008: The provided authorization code has expired."
        })))
        .mount(&h.server)
        .await;

    let err = h
        .gateway
        .connect(&h.user_id, Provider::Microsoft, request("expired-code"))
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::InvalidAuthorization { .. }));
    assert!(
        h.credentials
            .find(&h.user_id, Provider::Microsoft)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn disconnect_hides_mirrored_items_without_deleting_them() {
    let h = Harness::new().await;
    h.seed_credential(Provider::Google, "g", "g-refresh", 3600)
        .await;
    h.seed_credential(Provider::Microsoft, "m", "m-refresh", 3600)
        .await;
    let start = Utc::now() + ChronoDuration::days(1);
    h.seed_mirror(Provider::Google, "g-1", start, Utc::now())
        .await;
    h.seed_mirror(
        Provider::Microsoft,
        "m-1",
        start + ChronoDuration::hours(2),
        Utc::now(),
    )
    .await;

    let all = h
        .gateway
        .events(&h.user_id, None, "calendar")
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    h.gateway
        .disconnect(&h.user_id, Provider::Google)
        .await
        .unwrap();

    let visible = h
        .gateway
        .events(&h.user_id, None, "calendar")
        .await
        .unwrap();
    let ids: Vec<&str> = visible.iter().map(|e| e.external_id.as_str()).collect();
    assert_eq!(ids, vec!["m-1"]);
    assert!(
        h.mirror
            .find(&h.user_id, Provider::Google, "calendar", "g-1")
            .await
            .unwrap()
            .is_some()
    );

    let record = h.credential(Provider::Google).await;
    assert!(!record.connected);
    assert!(record.refresh_token_ciphertext.is_none());

    // Disconnecting again is harmless
    h.gateway
        .disconnect(&h.user_id, Provider::Google)
        .await
        .unwrap();
}

#[tokio::test]
async fn events_filter_by_provider_and_reject_unknown_item_types() {
    let h = Harness::new().await;
    h.seed_credential(Provider::Google, "g", "g-refresh", 3600)
        .await;
    h.seed_credential(Provider::Microsoft, "m", "m-refresh", 3600)
        .await;
    let start = Utc::now() + ChronoDuration::days(1);
    h.seed_mirror(Provider::Google, "g-1", start, Utc::now())
        .await;
    h.seed_mirror(Provider::Microsoft, "m-1", start, Utc::now())
        .await;

    let only_ms = h
        .gateway
        .events(&h.user_id, Some(Provider::Microsoft), "calendar")
        .await
        .unwrap();
    assert_eq!(only_ms.len(), 1);
    assert_eq!(only_ms[0].external_id, "m-1");

    let err = h
        .gateway
        .events(&h.user_id, None, "email")
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::Validation(_)));
}

#[tokio::test]
async fn picker_token_returns_a_valid_token() {
    let h = Harness::new().await;
    h.seed_credential(Provider::Google, "picker-access", "refresh", 3600)
        .await;

    let token = h
        .gateway
        .picker_token(&h.user_id, Provider::Google)
        .await
        .unwrap();
    assert_eq!(token.access_token, "picker-access");
    assert!(token.expires_at.is_some());
    assert!(!format!("{:?}", token).contains("picker-access"));
}

#[tokio::test]
async fn picked_file_is_downloaded() {
    let h = Harness::new().await;
    h.seed_credential(Provider::Google, "access", "refresh", 3600)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/file-1"))
        .and(query_param("fields", "id,name,mimeType,size"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "file-1",
            "name": "resume.pdf",
            "mimeType": "application/pdf",
            "size": "11"
        })))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/file-1"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7 ok".to_vec()))
        .mount(&h.server)
        .await;

    let file = h
        .gateway
        .picked_file(&h.user_id, Provider::Google, "file-1")
        .await
        .unwrap();
    assert_eq!(file.name, "resume.pdf");
    assert_eq!(file.mime_type, "application/pdf");
    assert_eq!(file.bytes, b"%PDF-1.7 ok".to_vec());
}

#[tokio::test]
async fn picked_file_over_the_cap_is_refused_while_streaming() {
    let settings = IntegrationConfig {
        picker_max_bytes: 16,
        ..IntegrationConfig::default()
    };
    let h = Harness::build(Duration::from_secs(5), settings).await;
    h.seed_credential(Provider::Microsoft, "graph", "refresh", 3600)
        .await;
    // Size is not declared; the cap is enforced on the body
    Mock::given(method("GET"))
        .and(path("/v1.0/me/drive/items/item-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "item-1",
            "name": "big.docx",
            "file": { "mimeType": "application/vnd.openxmlformats-officedocument.wordprocessingml.document" }
        })))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1.0/me/drive/items/item-1/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 64]))
        .mount(&h.server)
        .await;

    let err = h
        .gateway
        .picked_file(&h.user_id, Provider::Microsoft, "item-1")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IntegrationError::SizeLimitExceeded {
            limit_bytes: 16,
            ..
        }
    ));
}
