//! Calendar domain types shared by the provider adapters, the fetcher, the
//! reconciliation engine and the mutation proxy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::IntegrationError;

pub mod fetcher;
pub mod mutation;
pub mod reconcile;

pub use fetcher::ResourceFetcher;
pub use mutation::EventMutationProxy;
pub use reconcile::ReconciliationEngine;

/// Item type under which calendar events are mirrored
pub const ITEM_TYPE_CALENDAR: &str = "calendar";

/// Half-open time range `[start, end)` used for listing and sweeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Window starting at `now` and extending `days` forward
    pub fn forward(now: DateTime<Utc>, days: u32) -> Self {
        Self {
            start: now,
            end: now + Duration::days(days as i64),
        }
    }
}

/// Normalized event fields stored as the mirror payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EventPayload {
    pub summary: Option<String>,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub all_day: bool,
    pub location: Option<String>,
    #[serde(default)]
    pub attendees: Vec<String>,
    /// Join or web link for the event
    pub link: Option<String>,
    /// Provider-side status (confirmed, tentative, ...)
    pub status: Option<String>,
}

/// An event as reported by a provider
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub external_id: String,
    pub payload: EventPayload,
}

/// One page of a provider listing
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<RemoteEvent>,
    /// Opaque continuation (page token or absolute next link)
    pub next_page: Option<String>,
}

/// Fields for a new event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EventDraft {
    pub summary: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub all_day: bool,
    pub location: Option<String>,
    #[serde(default)]
    pub attendees: Vec<String>,
}

impl EventDraft {
    pub fn validate(&self) -> Result<(), IntegrationError> {
        if self.summary.trim().is_empty() {
            return Err(IntegrationError::Validation(
                "summary must not be empty".to_string(),
            ));
        }
        validate_range(Some(self.start), Some(self.end))
    }
}

/// Partial update; absent fields are left unchanged on the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EventPatch {
    pub summary: Option<String>,
    pub description: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub all_day: Option<bool>,
    pub location: Option<String>,
    pub attendees: Option<Vec<String>>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        self == &EventPatch::default()
    }

    pub fn validate(&self) -> Result<(), IntegrationError> {
        if self.is_empty() {
            return Err(IntegrationError::Validation(
                "patch must change at least one field".to_string(),
            ));
        }
        if let Some(summary) = &self.summary
            && summary.trim().is_empty()
        {
            return Err(IntegrationError::Validation(
                "summary must not be empty".to_string(),
            ));
        }
        validate_range(self.start, self.end)
    }
}

fn validate_range(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<(), IntegrationError> {
    match (start, end) {
        (Some(start), Some(end)) if end < start => Err(IntegrationError::Validation(
            "end must not be before start".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Single-event write forwarded to a provider
#[derive(Debug, Clone, PartialEq)]
pub enum EventMutation {
    Create(EventDraft),
    Update {
        external_id: String,
        patch: EventPatch,
    },
    Delete {
        external_id: String,
    },
}

impl EventMutation {
    pub fn kind(&self) -> &'static str {
        match self {
            EventMutation::Create(_) => "create",
            EventMutation::Update { .. } => "update",
            EventMutation::Delete { .. } => "delete",
        }
    }
}

/// Outcome of one reconciliation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SyncResult {
    pub upserted: u64,
    pub deleted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn window_extends_forward_from_now() {
        let window = TimeWindow::forward(at(0), 30);
        assert_eq!(window.start, at(0));
        assert_eq!(window.end, at(0) + Duration::days(30));
    }

    #[test]
    fn draft_rejects_blank_summary_and_inverted_range() {
        let mut draft = EventDraft {
            summary: "Interview".to_string(),
            description: None,
            start: at(10),
            end: at(11),
            all_day: false,
            location: None,
            attendees: vec![],
        };
        assert!(draft.validate().is_ok());

        draft.end = at(9);
        assert!(matches!(
            draft.validate(),
            Err(IntegrationError::Validation(_))
        ));

        draft.end = at(11);
        draft.summary = "  ".to_string();
        assert!(draft.validate().is_err());
    }

    #[test]
    fn empty_patch_is_rejected() {
        assert!(EventPatch::default().validate().is_err());

        let patch = EventPatch {
            location: Some("Room 4".to_string()),
            ..EventPatch::default()
        };
        assert!(patch.validate().is_ok());
    }
}
