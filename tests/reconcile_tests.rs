//! Calendar reconciliation through the gateway

mod test_utils;

use chrono::{Duration, Utc};
use integrations::calendar::SyncResult;
use integrations::error::IntegrationError;
use integrations::models::mirrored_item::{STATUS_ACTIVE, STATUS_DELETED};
use integrations::providers::Provider;
use serde_json::json;
use test_utils::{Harness, google_event, graph_event, token_response};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

const GOOGLE_EVENTS: &str = "/calendar/v3/calendars/primary/events";

#[tokio::test]
async fn sync_upserts_fetched_and_sweeps_missing_after_one_refresh() {
    let h = Harness::new().await;
    // Expired token: the sync has to refresh exactly once
    h.seed_credential(Provider::Google, "expired", "refresh-1", -30)
        .await;

    let now = Utc::now();
    let e1_start = now + Duration::days(1);
    let e2_start = now + Duration::days(2);
    let e3_start = now + Duration::days(3);
    h.seed_mirror(Provider::Google, "E1", e1_start, now - Duration::hours(1))
        .await;
    h.seed_mirror(Provider::Google, "E2", e2_start, now - Duration::hours(1))
        .await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response("fresh", 3600)))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(GOOGLE_EVENTS))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                google_event("E3", "Final round", e3_start),
                google_event("E1", "Phone screen (moved)", e1_start),
            ]
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let result = h.gateway.sync(&h.user_id, Provider::Google).await.unwrap();
    assert_eq!(
        result,
        SyncResult {
            upserted: 2,
            deleted: 1
        }
    );

    let events = h
        .gateway
        .events(&h.user_id, None, "calendar")
        .await
        .unwrap();
    let ids: Vec<&str> = events.iter().map(|e| e.external_id.as_str()).collect();
    assert_eq!(ids, vec!["E1", "E3"]);
    assert_eq!(events[0].payload["summary"], "Phone screen (moved)");

    let e2 = h
        .mirror
        .find(&h.user_id, Provider::Google, "calendar", "E2")
        .await
        .unwrap()
        .expect("swept rows are kept");
    assert_eq!(e2.status, STATUS_DELETED);

    let status = h.gateway.status(&h.user_id).await.unwrap();
    assert!(status[&Provider::Google].last_synced.is_some());
}

#[tokio::test]
async fn repeated_sync_with_unchanged_data_is_stable() {
    let h = Harness::new().await;
    h.seed_credential(Provider::Google, "access", "refresh", 3600)
        .await;
    let start = Utc::now() + Duration::days(5);
    Mock::given(method("GET"))
        .and(path(GOOGLE_EVENTS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [google_event("A", "Onsite", start)]
        })))
        .mount(&h.server)
        .await;

    let first = h.gateway.sync(&h.user_id, Provider::Google).await.unwrap();
    let after_first = h
        .gateway
        .events(&h.user_id, None, "calendar")
        .await
        .unwrap();
    let second = h.gateway.sync(&h.user_id, Provider::Google).await.unwrap();
    let after_second = h
        .gateway
        .events(&h.user_id, None, "calendar")
        .await
        .unwrap();

    assert_eq!(first.deleted, 0);
    assert_eq!(second.deleted, 0);
    assert_eq!(after_first.len(), 1);
    assert_eq!(after_first[0].id, after_second[0].id);
    assert_eq!(after_first[0].payload, after_second[0].payload);
}

#[tokio::test]
async fn items_outside_the_window_are_never_swept() {
    let h = Harness::new().await;
    h.seed_credential(Provider::Google, "access", "refresh", 3600)
        .await;
    let now = Utc::now();
    let synced = now - Duration::hours(2);
    h.seed_mirror(Provider::Google, "past", now - Duration::days(3), synced)
        .await;
    h.seed_mirror(Provider::Google, "far", now + Duration::days(45), synced)
        .await;
    h.seed_mirror(Provider::Google, "near", now + Duration::days(1), synced)
        .await;

    Mock::given(method("GET"))
        .and(path(GOOGLE_EVENTS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
        .mount(&h.server)
        .await;

    let result = h.gateway.sync(&h.user_id, Provider::Google).await.unwrap();
    assert_eq!(result.deleted, 1);

    for (id, status) in [
        ("past", STATUS_ACTIVE),
        ("far", STATUS_ACTIVE),
        ("near", STATUS_DELETED),
    ] {
        let row = h
            .mirror
            .find(&h.user_id, Provider::Google, "calendar", id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, status, "item {id}");
    }
}

#[tokio::test]
async fn all_pages_are_drained_before_applying() {
    let h = Harness::new().await;
    h.seed_credential(Provider::Google, "access", "refresh", 3600)
        .await;
    let start = Utc::now() + Duration::days(1);

    Mock::given(method("GET"))
        .and(path(GOOGLE_EVENTS))
        .and(query_param("pageToken", "p2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [google_event("B", "Debrief", start + Duration::hours(4))]
        })))
        .with_priority(1)
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(GOOGLE_EVENTS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [google_event("A", "Intro", start)],
            "nextPageToken": "p2"
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let result = h.gateway.sync(&h.user_id, Provider::Google).await.unwrap();
    assert_eq!(result.upserted, 2);
}

#[tokio::test]
async fn failed_page_leaves_the_mirror_untouched() {
    let h = Harness::new().await;
    h.seed_credential(Provider::Google, "access", "refresh", 3600)
        .await;
    let now = Utc::now();
    h.seed_mirror(
        Provider::Google,
        "kept",
        now + Duration::days(2),
        now - Duration::hours(1),
    )
    .await;

    Mock::given(method("GET"))
        .and(path(GOOGLE_EVENTS))
        .and(query_param("pageToken", "p2"))
        .respond_with(ResponseTemplate::new(503))
        .with_priority(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(GOOGLE_EVENTS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [google_event("new", "Intro", now + Duration::days(1))],
            "nextPageToken": "p2"
        })))
        .mount(&h.server)
        .await;

    let err = h
        .gateway
        .sync(&h.user_id, Provider::Google)
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::ProviderUnavailable { .. }));

    let events = h
        .gateway
        .events(&h.user_id, Some(Provider::Google), "calendar")
        .await
        .unwrap();
    let ids: Vec<&str> = events.iter().map(|e| e.external_id.as_str()).collect();
    assert_eq!(ids, vec!["kept"]);
    assert!(
        h.credential(Provider::Google)
            .await
            .last_synced_at
            .is_none()
    );
}

#[tokio::test]
async fn unauthorized_listing_refreshes_and_retries_once() {
    let h = Harness::new().await;
    // Looks fresh locally but the provider has revoked it
    h.seed_credential(Provider::Google, "stale", "refresh", 3600)
        .await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response("fresh", 3600)))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(GOOGLE_EVENTS))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(GOOGLE_EVENTS))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [google_event("A", "Intro", Utc::now() + Duration::days(1))]
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let result = h.gateway.sync(&h.user_id, Provider::Google).await.unwrap();
    assert_eq!(result.upserted, 1);
}

#[tokio::test]
async fn second_unauthorized_is_not_retried_again() {
    let h = Harness::new().await;
    h.seed_credential(Provider::Google, "stale", "refresh", 3600)
        .await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_response("fresh", 3600)))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(GOOGLE_EVENTS))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&h.server)
        .await;

    let err = h
        .gateway
        .sync(&h.user_id, Provider::Google)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IntegrationError::ProviderRejected { status: 401, .. }
    ));
}

#[tokio::test]
async fn sync_requires_a_connected_credential() {
    let h = Harness::new().await;
    let err = h
        .gateway
        .sync(&h.user_id, Provider::Microsoft)
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::NotConnected { .. }));

    h.seed_credential(Provider::Microsoft, "access", "refresh", 3600)
        .await;
    h.gateway
        .disconnect(&h.user_id, Provider::Microsoft)
        .await
        .unwrap();
    let err = h
        .gateway
        .sync(&h.user_id, Provider::Microsoft)
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::NotConnected { .. }));
}

#[tokio::test]
async fn microsoft_calendar_view_is_mirrored() {
    let h = Harness::new().await;
    h.seed_credential(Provider::Microsoft, "graph-token", "refresh", 3600)
        .await;
    let start = Utc::now() + Duration::days(2);

    Mock::given(method("GET"))
        .and(path("/v1.0/me/calendarView"))
        .and(header("authorization", "Bearer graph-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                graph_event("AAMk-1", "Panel interview", start),
                {
                    "id": "AAMk-2",
                    "subject": "Cancelled sync",
                    "isCancelled": true,
                    "start": { "dateTime": "2030-01-01T10:00:00.0000000", "timeZone": "UTC" },
                    "end": { "dateTime": "2030-01-01T11:00:00.0000000", "timeZone": "UTC" }
                }
            ]
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let result = h
        .gateway
        .sync(&h.user_id, Provider::Microsoft)
        .await
        .unwrap();
    assert_eq!(result.upserted, 1);

    let events = h
        .gateway
        .events(&h.user_id, Some(Provider::Microsoft), "calendar")
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].provider, "microsoft");
    assert_eq!(events[0].payload["summary"], "Panel interview");
}
