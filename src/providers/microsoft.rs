//! Microsoft adapter
//!
//! Identity platform v2.0 token endpoint, Graph `calendarView` for events and
//! OneDrive items for picked files. Graph is asked to report times in UTC so
//! `dateTime` values carry no offset.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::http::{check_status, endpoint, map_send_error, read_capped, read_json};
use super::oauth::TokenEndpoint;
use super::{PickedFile, Provider, ProviderAdapter, ProviderError, TokenGrant};
use crate::calendar::{
    EventDraft, EventMutation, EventPage, EventPatch, EventPayload, RemoteEvent, TimeWindow,
};

pub const MICROSOFT_LOGIN_BASE: &str = "https://login.microsoftonline.com";
pub const MICROSOFT_GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

const DEFAULT_SCOPES: &str = "offline_access User.Read Calendars.ReadWrite Files.Read";
const OUTLOOK_TIMEZONE_HEADER: &str = r#"outlook.timezone="UTC""#;
const OUTLOOK_MAX_PAGE_SIZE_HEADER: &str = "odata.maxpagesize=50";
const PAGE_SIZE: &str = "50";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    mail: Option<String>,
    user_principal_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphEventList {
    #[serde(default)]
    value: Vec<GraphEvent>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphEvent {
    id: Option<String>,
    subject: Option<String>,
    body_preview: Option<String>,
    start: Option<GraphDateTime>,
    end: Option<GraphDateTime>,
    #[serde(default)]
    is_all_day: bool,
    #[serde(default)]
    is_cancelled: bool,
    show_as: Option<String>,
    location: Option<GraphLocation>,
    #[serde(default)]
    attendees: Vec<GraphAttendee>,
    online_meeting: Option<GraphOnlineMeeting>,
    web_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphDateTime {
    date_time: String,
    time_zone: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphLocation {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAttendee {
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphOnlineMeeting {
    join_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveItem {
    name: String,
    size: Option<u64>,
    file: Option<DriveItemFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItemFile {
    mime_type: Option<String>,
}

pub struct MicrosoftAdapter {
    client: Client,
    token_endpoint: TokenEndpoint,
    graph_base: String,
    request_timeout: Duration,
}

impl MicrosoftAdapter {
    pub fn new(client: Client, client_id: Option<String>, client_secret: Option<String>) -> Self {
        Self {
            client,
            token_endpoint: TokenEndpoint {
                url: token_url(MICROSOFT_LOGIN_BASE, "common"),
                client_id,
                client_secret,
                extra_params: vec![("scope", DEFAULT_SCOPES.to_string())],
                timeout: Duration::from_secs(15),
            },
            graph_base: MICROSOFT_GRAPH_BASE.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_endpoints(mut self, login_base: &str, tenant: &str, graph_base: &str) -> Self {
        self.token_endpoint.url = token_url(login_base, tenant);
        self.graph_base = graph_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeouts(mut self, token: Duration, request: Duration) -> Self {
        self.token_endpoint.timeout = token;
        self.request_timeout = request;
        self
    }

    fn graph_url(&self, segments: &[&str]) -> Result<url::Url, ProviderError> {
        endpoint(&self.graph_base, segments)
    }

    /// Continuation links are absolute; refuse to send the token anywhere else.
    fn continuation_url(&self, next_link: &str) -> Result<url::Url, ProviderError> {
        let link = url::Url::parse(next_link)
            .map_err(|e| ProviderError::Malformed(format!("invalid nextLink: {}", e)))?;
        let base = url::Url::parse(&self.graph_base)
            .map_err(|e| ProviderError::Configuration(format!("invalid Graph base: {}", e)))?;

        let base_path = base.path().trim_end_matches('/');
        let same_origin = link.scheme() == base.scheme()
            && link.host_str() == base.host_str()
            && link.port_or_known_default() == base.port_or_known_default();
        let under_base = base_path.is_empty()
            || link.path() == base_path
            || link.path().starts_with(&format!("{}/", base_path));

        if !(same_origin && under_base) {
            return Err(ProviderError::Malformed(format!(
                "nextLink outside of Graph base: {}",
                next_link
            )));
        }
        Ok(link)
    }
}

fn token_url(login_base: &str, tenant: &str) -> String {
    format!(
        "{}/{}/oauth2/v2.0/token",
        login_base.trim_end_matches('/'),
        tenant
    )
}

#[async_trait]
impl ProviderAdapter for MicrosoftAdapter {
    fn provider(&self) -> Provider {
        Provider::Microsoft
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenGrant, ProviderError> {
        self.token_endpoint
            .exchange_code(&self.client, code, redirect_uri, code_verifier)
            .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        self.token_endpoint
            .refresh(&self.client, refresh_token)
            .await
    }

    async fn fetch_account_email(
        &self,
        access_token: &str,
    ) -> Result<Option<String>, ProviderError> {
        let mut url = self.graph_url(&["me"])?;
        url.query_pairs_mut()
            .append_pair("$select", "mail,userPrincipalName");

        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| map_send_error("profile", e))?;
        let user: GraphUser = read_json(check_status(response).await?, "profile").await?;

        Ok(user
            .mail
            .filter(|m| !m.is_empty())
            .or(user.user_principal_name.filter(|u| !u.is_empty())))
    }

    async fn list_events(
        &self,
        access_token: &str,
        window: &TimeWindow,
        page: Option<&str>,
    ) -> Result<EventPage, ProviderError> {
        let url = match page {
            Some(next_link) => self.continuation_url(next_link)?,
            None => {
                let mut url = self.graph_url(&["me", "calendarView"])?;
                url.query_pairs_mut()
                    .append_pair(
                        "startDateTime",
                        &window.start.to_rfc3339_opts(SecondsFormat::Secs, true),
                    )
                    .append_pair(
                        "endDateTime",
                        &window.end.to_rfc3339_opts(SecondsFormat::Secs, true),
                    )
                    .append_pair("$orderby", "start/dateTime")
                    .append_pair("$top", PAGE_SIZE);
                url
            }
        };

        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .header("Prefer", OUTLOOK_TIMEZONE_HEADER)
            .header("Prefer", OUTLOOK_MAX_PAGE_SIZE_HEADER)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| map_send_error("event listing", e))?;
        let list: GraphEventList =
            read_json(check_status(response).await?, "event listing").await?;

        let mut events = Vec::with_capacity(list.value.len());
        for item in list.value {
            if let Some(event) = normalize_event(item)? {
                events.push(event);
            }
        }

        Ok(EventPage {
            events,
            next_page: list.next_link.filter(|l| !l.is_empty()),
        })
    }

    async fn mutate_event(
        &self,
        access_token: &str,
        mutation: &EventMutation,
    ) -> Result<Option<RemoteEvent>, ProviderError> {
        let request = match mutation {
            EventMutation::Create(draft) => self
                .client
                .post(self.graph_url(&["me", "events"])?)
                .json(&draft_body(draft)),
            EventMutation::Update { external_id, patch } => self
                .client
                .patch(self.graph_url(&["me", "events", external_id])?)
                .json(&patch_body(patch)),
            EventMutation::Delete { external_id } => self
                .client
                .delete(self.graph_url(&["me", "events", external_id])?),
        };

        let response = request
            .bearer_auth(access_token)
            .header("Prefer", OUTLOOK_TIMEZONE_HEADER)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| map_send_error("event mutation", e))?;
        let response = check_status(response).await?;

        if matches!(mutation, EventMutation::Delete { .. }) {
            return Ok(None);
        }

        let event: GraphEvent = read_json(response, "event mutation").await?;
        normalize_event(event)?
            .map(Some)
            .ok_or_else(|| ProviderError::Malformed("mutation returned a cancelled event".into()))
    }

    async fn fetch_file(
        &self,
        access_token: &str,
        file_id: &str,
        max_bytes: u64,
    ) -> Result<PickedFile, ProviderError> {
        let mut meta_url = self.graph_url(&["me", "drive", "items", file_id])?;
        meta_url
            .query_pairs_mut()
            .append_pair("$select", "id,name,size,file");

        let response = self
            .client
            .get(meta_url)
            .bearer_auth(access_token)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| map_send_error("file metadata", e))?;
        let item: DriveItem = read_json(check_status(response).await?, "file metadata").await?;

        let Some(file) = item.file else {
            return Err(ProviderError::Rejected {
                status: 400,
                body: format!("item '{}' is not a file", file_id),
            });
        };
        if let Some(size) = item.size
            && size > max_bytes
        {
            return Err(ProviderError::TooLarge {
                limit_bytes: max_bytes,
                actual_bytes: Some(size),
            });
        }

        // Graph answers with a 302 to a pre-authenticated download URL
        let response = self
            .client
            .get(self.graph_url(&["me", "drive", "items", file_id, "content"])?)
            .bearer_auth(access_token)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| map_send_error("file download", e))?;
        let bytes = read_capped(check_status(response).await?, max_bytes).await?;

        Ok(PickedFile {
            name: item.name,
            mime_type: file
                .mime_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            bytes,
        })
    }
}

fn normalize_event(event: GraphEvent) -> Result<Option<RemoteEvent>, ProviderError> {
    if event.is_cancelled {
        return Ok(None);
    }

    let id = event
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProviderError::Malformed("event without id".to_string()))?;
    let start = event
        .start
        .as_ref()
        .map(parse_graph_time)
        .transpose()?
        .ok_or_else(|| ProviderError::Malformed(format!("event {} has no start", id)))?;
    let end = match event.end.as_ref() {
        Some(time) => parse_graph_time(time)?,
        None => start,
    };

    let status = match event.show_as.as_deref() {
        Some("tentative") => "tentative",
        _ => "confirmed",
    };

    Ok(Some(RemoteEvent {
        external_id: id,
        payload: EventPayload {
            summary: event.subject.filter(|s| !s.trim().is_empty()),
            description: event.body_preview.filter(|s| !s.is_empty()),
            start,
            end,
            all_day: event.is_all_day,
            location: event
                .location
                .and_then(|l| l.display_name)
                .filter(|l| !l.is_empty()),
            attendees: event
                .attendees
                .into_iter()
                .filter_map(|a| a.email_address.and_then(|e| e.address))
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect(),
            link: event
                .online_meeting
                .and_then(|m| m.join_url)
                .or(event.web_link),
            status: Some(status.to_string()),
        },
    }))
}

/// Graph returns naive timestamps in the zone named by `timeZone`; we always
/// request UTC.
fn parse_graph_time(time: &GraphDateTime) -> Result<DateTime<Utc>, ProviderError> {
    if let Some(zone) = time.time_zone.as_deref()
        && !zone.eq_ignore_ascii_case("utc")
    {
        return Err(ProviderError::Malformed(format!(
            "unexpected time zone '{}'",
            zone
        )));
    }

    let raw = time.date_time.as_str();
    if raw.ends_with('Z') {
        return DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ProviderError::Malformed(format!("invalid dateTime '{}': {}", raw, e)));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| ProviderError::Malformed(format!("invalid dateTime '{}': {}", raw, e)))
}

fn time_body(instant: DateTime<Utc>) -> Value {
    json!({
        "dateTime": instant.format("%Y-%m-%dT%H:%M:%S").to_string(),
        "timeZone": "UTC",
    })
}

fn attendees_body(attendees: &[String]) -> Value {
    Value::Array(
        attendees
            .iter()
            .map(|email| json!({ "emailAddress": { "address": email }, "type": "required" }))
            .collect(),
    )
}

fn draft_body(draft: &EventDraft) -> Value {
    let mut body = Map::new();
    body.insert("subject".into(), json!(draft.summary));
    if let Some(description) = &draft.description {
        body.insert(
            "body".into(),
            json!({ "contentType": "text", "content": description }),
        );
    }
    if let Some(location) = &draft.location {
        body.insert("location".into(), json!({ "displayName": location }));
    }
    body.insert("start".into(), time_body(draft.start));
    body.insert("end".into(), time_body(draft.end));
    body.insert("isAllDay".into(), json!(draft.all_day));
    if !draft.attendees.is_empty() {
        body.insert("attendees".into(), attendees_body(&draft.attendees));
    }
    Value::Object(body)
}

fn patch_body(patch: &EventPatch) -> Value {
    let mut body = Map::new();
    if let Some(summary) = &patch.summary {
        body.insert("subject".into(), json!(summary));
    }
    if let Some(description) = &patch.description {
        body.insert(
            "body".into(),
            json!({ "contentType": "text", "content": description }),
        );
    }
    if let Some(location) = &patch.location {
        body.insert("location".into(), json!({ "displayName": location }));
    }
    if let Some(start) = patch.start {
        body.insert("start".into(), time_body(start));
    }
    if let Some(end) = patch.end {
        body.insert("end".into(), time_body(end));
    }
    if let Some(all_day) = patch.all_day {
        body.insert("isAllDay".into(), json!(all_day));
    }
    if let Some(attendees) = &patch.attendees {
        body.insert("attendees".into(), attendees_body(attendees));
    }
    Value::Object(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_string_contains, header, method, path, query_param},
    };

    fn adapter(server: &MockServer) -> MicrosoftAdapter {
        MicrosoftAdapter::new(
            Client::new(),
            Some("ms-client".to_string()),
            Some("ms-secret".to_string()),
        )
        .with_endpoints(&server.uri(), "common", &format!("{}/v1.0", server.uri()))
    }

    fn window() -> TimeWindow {
        TimeWindow::forward(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(), 30)
    }

    #[tokio::test]
    async fn refresh_sends_scope_and_keeps_missing_refresh_token_absent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("scope=offline_access"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "eyJ.new",
                "expires_in": "3600",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let grant = adapter(&server).refresh("old-refresh").await.unwrap();
        assert_eq!(grant.access_token, "eyJ.new");
        assert_eq!(grant.expires_in, Some(3600));
        assert!(grant.new_refresh_token().is_none());
    }

    #[tokio::test]
    async fn invalid_client_is_not_unrecoverable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/common/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "invalid_client",
                "error_description": "AADSTS7000215: Invalid client secret provided."
            })))
            .mount(&server)
            .await;

        let err = adapter(&server).refresh("r").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidGrant { ref code, .. } if code == "invalid_client"));
        assert!(!err.is_unrecoverable_grant());
    }

    #[tokio::test]
    async fn profile_falls_back_to_user_principal_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "mail": null,
                "userPrincipalName": "pat@contoso.onmicrosoft.com"
            })))
            .mount(&server)
            .await;

        let email = adapter(&server).fetch_account_email("t").await.unwrap();
        assert_eq!(email.as_deref(), Some("pat@contoso.onmicrosoft.com"));
    }

    #[tokio::test]
    async fn calendar_view_is_normalized_and_follows_next_link() {
        let server = MockServer::start().await;
        let next_link = format!("{}/v1.0/me/calendarView?$skiptoken=abc", server.uri());

        Mock::given(method("GET"))
            .and(path("/v1.0/me/calendarView"))
            .and(query_param("startDateTime", "2025-03-01T00:00:00Z"))
            .and(header("authorization", "Bearer graph-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {
                        "id": "AAMk-1",
                        "subject": "Standup",
                        "start": { "dateTime": "2025-03-02T09:00:00.0000000", "timeZone": "UTC" },
                        "end": { "dateTime": "2025-03-02T09:15:00.0000000", "timeZone": "UTC" },
                        "showAs": "tentative",
                        "location": { "displayName": "Teams" },
                        "attendees": [
                            { "emailAddress": { "address": "x@contoso.com", "name": "X" } }
                        ],
                        "onlineMeeting": { "joinUrl": "https://teams.microsoft.com/l/1" }
                    },
                    {
                        "id": "AAMk-2",
                        "isCancelled": true,
                        "start": { "dateTime": "2025-03-03T09:00:00.0000000", "timeZone": "UTC" },
                        "end": { "dateTime": "2025-03-03T10:00:00.0000000", "timeZone": "UTC" }
                    }
                ],
                "@odata.nextLink": next_link
            })))
            .mount(&server)
            .await;

        let graph = adapter(&server);
        let page = graph
            .list_events("graph-token", &window(), None)
            .await
            .unwrap();

        assert_eq!(page.events.len(), 1);
        let event = &page.events[0];
        assert_eq!(event.external_id, "AAMk-1");
        assert_eq!(
            event.payload.start,
            Utc.with_ymd_and_hms(2025, 3, 2, 9, 0, 0).unwrap()
        );
        assert_eq!(event.payload.status.as_deref(), Some("tentative"));
        assert_eq!(event.payload.location.as_deref(), Some("Teams"));
        assert_eq!(page.next_page.as_deref(), Some(next_link.as_str()));
    }

    #[tokio::test]
    async fn foreign_next_link_is_rejected() {
        let server = MockServer::start().await;
        let graph = adapter(&server);

        let err = graph
            .list_events(
                "graph-token",
                &window(),
                Some("https://attacker.example/v1.0/me/calendarView"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[test]
    fn next_link_must_share_origin_and_path_with_graph_base() {
        let adapter = MicrosoftAdapter::new(Client::new(), None, None).with_endpoints(
            "https://login.microsoftonline.com",
            "common",
            "https://graph.microsoft.com",
        );
        assert!(
            adapter
                .continuation_url("https://graph.microsoft.com/v1.0/me/calendarView?$skiptoken=x")
                .is_ok()
        );
        for link in [
            "https://graph.microsoft.com.evil.example/v1.0/me/calendarView",
            "http://graph.microsoft.com/v1.0/me/calendarView",
            "https://graph.microsoft.com:8443/v1.0/me/calendarView",
            "not a url",
        ] {
            assert!(
                matches!(adapter.continuation_url(link), Err(ProviderError::Malformed(_))),
                "{link}"
            );
        }

        let scoped = MicrosoftAdapter::new(Client::new(), None, None).with_endpoints(
            "https://login.microsoftonline.com",
            "common",
            "https://graph.microsoft.com/v1.0",
        );
        assert!(
            scoped
                .continuation_url("https://graph.microsoft.com/v1.0/me/events?$skip=10")
                .is_ok()
        );
        assert!(
            scoped
                .continuation_url("https://graph.microsoft.com/v1.0-beta/me/events")
                .is_err()
        );
    }

    #[tokio::test]
    async fn delete_returns_no_event() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1.0/me/events/AAMk-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let result = adapter(&server)
            .mutate_event(
                "t",
                &EventMutation::Delete {
                    external_id: "AAMk-1".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn graph_times_with_offsets_outside_utc_are_malformed() {
        let time = GraphDateTime {
            date_time: "2025-03-02T09:00:00".to_string(),
            time_zone: Some("Pacific Standard Time".to_string()),
        };
        assert!(parse_graph_time(&time).is_err());

        let time = GraphDateTime {
            date_time: "2025-03-02T09:00:00Z".to_string(),
            time_zone: None,
        };
        assert_eq!(
            parse_graph_time(&time).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 2, 9, 0, 0).unwrap()
        );
    }
}
