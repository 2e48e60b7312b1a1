//! Google adapter
//!
//! OAuth against `oauth2.googleapis.com`, events from the Calendar v3 API on
//! the primary calendar, picked files from Drive v3.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::http::{check_status, endpoint, map_send_error, read_capped, read_json};
use super::oauth::TokenEndpoint;
use super::{PickedFile, Provider, ProviderAdapter, ProviderError, TokenGrant};
use crate::calendar::{
    EventDraft, EventMutation, EventPage, EventPatch, EventPayload, RemoteEvent, TimeWindow,
};

pub const GOOGLE_OAUTH_BASE: &str = "https://oauth2.googleapis.com";
pub const GOOGLE_API_BASE: &str = "https://www.googleapis.com";

const EVENTS_PAGE_SIZE: &str = "250";

#[derive(Debug, Deserialize)]
struct GoogleUserinfo {
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEventList {
    #[serde(default)]
    items: Vec<GoogleEvent>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEvent {
    id: Option<String>,
    status: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    location: Option<String>,
    start: Option<GoogleEventTime>,
    end: Option<GoogleEventTime>,
    #[serde(default)]
    attendees: Vec<GoogleAttendee>,
    html_link: Option<String>,
    hangout_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEventTime {
    date_time: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleAttendee {
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileMetadata {
    name: String,
    mime_type: Option<String>,
    // Drive reports sizes as decimal strings
    size: Option<String>,
}

pub struct GoogleAdapter {
    client: Client,
    token_endpoint: TokenEndpoint,
    api_base: String,
    request_timeout: Duration,
}

impl GoogleAdapter {
    pub fn new(client: Client, client_id: Option<String>, client_secret: Option<String>) -> Self {
        Self {
            client,
            token_endpoint: TokenEndpoint {
                url: format!("{}/token", GOOGLE_OAUTH_BASE),
                client_id,
                client_secret,
                extra_params: Vec::new(),
                timeout: Duration::from_secs(15),
            },
            api_base: GOOGLE_API_BASE.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Override OAuth and API bases (used to point at mock servers)
    pub fn with_endpoints(mut self, oauth_base: &str, api_base: &str) -> Self {
        self.token_endpoint.url = format!("{}/token", oauth_base.trim_end_matches('/'));
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeouts(mut self, token: Duration, request: Duration) -> Self {
        self.token_endpoint.timeout = token;
        self.request_timeout = request;
        self
    }

    fn events_url(&self, event_id: Option<&str>) -> Result<url::Url, ProviderError> {
        let mut segments = vec!["calendar", "v3", "calendars", "primary", "events"];
        if let Some(id) = event_id {
            segments.push(id);
        }
        endpoint(&self.api_base, &segments)
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn provider(&self) -> Provider {
        Provider::Google
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
        let url = endpoint(&self.api_base, &["oauth2", "v2", "userinfo"])?;
        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| map_send_error("userinfo", e))?;

        let userinfo: GoogleUserinfo = read_json(check_status(response).await?, "userinfo").await?;
        Ok(userinfo.email.filter(|e| !e.is_empty()))
    }

    async fn list_events(
        &self,
        access_token: &str,
        window: &TimeWindow,
        page: Option<&str>,
    ) -> Result<EventPage, ProviderError> {
        let mut url = self.events_url(None)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair(
                    "timeMin",
                    &window.start.to_rfc3339_opts(SecondsFormat::Secs, true),
                )
                .append_pair(
                    "timeMax",
                    &window.end.to_rfc3339_opts(SecondsFormat::Secs, true),
                )
                .append_pair("singleEvents", "true")
                .append_pair("orderBy", "startTime")
                .append_pair("maxResults", EVENTS_PAGE_SIZE);
            if let Some(token) = page {
                query.append_pair("pageToken", token);
            }
        }

        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| map_send_error("event listing", e))?;

        let list: GoogleEventList =
            read_json(check_status(response).await?, "event listing").await?;

        let mut events = Vec::with_capacity(list.items.len());
        for item in list.items {
            if let Some(event) = normalize_event(item)? {
                events.push(event);
            }
        }

        Ok(EventPage {
            events,
            next_page: list.next_page_token.filter(|t| !t.is_empty()),
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
                .post(self.events_url(None)?)
                .json(&draft_body(draft)),
            EventMutation::Update { external_id, patch } => self
                .client
                .patch(self.events_url(Some(external_id))?)
                .json(&patch_body(patch)),
            EventMutation::Delete { external_id } => {
                self.client.delete(self.events_url(Some(external_id))?)
            }
        };

        let response = request
            .bearer_auth(access_token)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| map_send_error("event mutation", e))?;
        let response = check_status(response).await?;

        if matches!(mutation, EventMutation::Delete { .. }) {
            return Ok(None);
        }

        let event: GoogleEvent = read_json(response, "event mutation").await?;
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
        let mut meta_url = endpoint(&self.api_base, &["drive", "v3", "files", file_id])?;
        meta_url
            .query_pairs_mut()
            .append_pair("fields", "id,name,mimeType,size")
            .append_pair("supportsAllDrives", "true");

        let response = self
            .client
            .get(meta_url)
            .bearer_auth(access_token)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| map_send_error("file metadata", e))?;
        let metadata: DriveFileMetadata =
            read_json(check_status(response).await?, "file metadata").await?;

        if let Some(size) = metadata.size.as_deref().and_then(|s| s.parse::<u64>().ok())
            && size > max_bytes
        {
            return Err(ProviderError::TooLarge {
                limit_bytes: max_bytes,
                actual_bytes: Some(size),
            });
        }

        let mut content_url = endpoint(&self.api_base, &["drive", "v3", "files", file_id])?;
        content_url
            .query_pairs_mut()
            .append_pair("alt", "media")
            .append_pair("supportsAllDrives", "true");

        let response = self
            .client
            .get(content_url)
            .bearer_auth(access_token)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| map_send_error("file download", e))?;
        let bytes = read_capped(check_status(response).await?, max_bytes).await?;

        Ok(PickedFile {
            name: metadata.name,
            mime_type: metadata
                .mime_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            bytes,
        })
    }
}

/// Cancelled events are dropped; events without an id or start are malformed.
fn normalize_event(event: GoogleEvent) -> Result<Option<RemoteEvent>, ProviderError> {
    if event.status.as_deref() == Some("cancelled") {
        return Ok(None);
    }

    let id = event
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProviderError::Malformed("event without id".to_string()))?;
    let (start, all_day) = event
        .start
        .as_ref()
        .map(parse_event_time)
        .transpose()?
        .ok_or_else(|| ProviderError::Malformed(format!("event {} has no start", id)))?;
    let end = match event.end.as_ref() {
        Some(time) => parse_event_time(time)?.0,
        None => start,
    };

    Ok(Some(RemoteEvent {
        external_id: id,
        payload: EventPayload {
            summary: event.summary,
            description: event.description,
            start,
            end,
            all_day,
            location: event.location,
            attendees: event
                .attendees
                .into_iter()
                .filter_map(|a| a.email)
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect(),
            link: event.hangout_link.or(event.html_link),
            status: event.status,
        },
    }))
}

/// All-day dates map to midnight UTC.
fn parse_event_time(time: &GoogleEventTime) -> Result<(DateTime<Utc>, bool), ProviderError> {
    if let Some(date_time) = &time.date_time {
        let parsed = DateTime::parse_from_rfc3339(date_time).map_err(|e| {
            ProviderError::Malformed(format!("invalid dateTime '{}': {}", date_time, e))
        })?;
        return Ok((parsed.with_timezone(&Utc), false));
    }
    if let Some(date) = &time.date {
        let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|e| ProviderError::Malformed(format!("invalid date '{}': {}", date, e)))?;
        let midnight = day
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| ProviderError::Malformed(format!("invalid date '{}'", date)))?;
        return Ok((midnight.and_utc(), true));
    }
    Err(ProviderError::Malformed(
        "event time without dateTime or date".to_string(),
    ))
}

fn time_body(instant: DateTime<Utc>, all_day: bool) -> Value {
    if all_day {
        json!({ "date": instant.date_naive().format("%Y-%m-%d").to_string() })
    } else {
        json!({ "dateTime": instant.to_rfc3339_opts(SecondsFormat::Secs, true) })
    }
}

fn attendees_body(attendees: &[String]) -> Value {
    Value::Array(
        attendees
            .iter()
            .map(|email| json!({ "email": email }))
            .collect(),
    )
}

fn draft_body(draft: &EventDraft) -> Value {
    let mut body = Map::new();
    body.insert("summary".into(), json!(draft.summary));
    if let Some(description) = &draft.description {
        body.insert("description".into(), json!(description));
    }
    if let Some(location) = &draft.location {
        body.insert("location".into(), json!(location));
    }
    body.insert("start".into(), time_body(draft.start, draft.all_day));
    body.insert("end".into(), time_body(draft.end, draft.all_day));
    if !draft.attendees.is_empty() {
        body.insert("attendees".into(), attendees_body(&draft.attendees));
    }
    Value::Object(body)
}

fn patch_body(patch: &EventPatch) -> Value {
    let all_day = patch.all_day.unwrap_or(false);
    let mut body = Map::new();
    if let Some(summary) = &patch.summary {
        body.insert("summary".into(), json!(summary));
    }
    if let Some(description) = &patch.description {
        body.insert("description".into(), json!(description));
    }
    if let Some(location) = &patch.location {
        body.insert("location".into(), json!(location));
    }
    if let Some(start) = patch.start {
        body.insert("start".into(), time_body(start, all_day));
    }
    if let Some(end) = patch.end {
        body.insert("end".into(), time_body(end, all_day));
    }
    if let Some(attendees) = &patch.attendees {
        body.insert("attendees".into(), attendees_body(attendees));
    }
    Value::Object(body)
}
