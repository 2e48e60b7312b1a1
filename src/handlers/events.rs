//! # Event Handlers
//!
//! The mirrored event view and single-event mutations.

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::parse_provider;
use crate::auth::{OperatorAuth, UserExtension, UserHeader};
use crate::calendar::{EventDraft, EventPatch, ITEM_TYPE_CALENDAR};
use crate::error::ApiError;
use crate::models::mirrored_item;
use crate::server::AppState;

#[derive(Debug, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct EventsQuery {
    /// Restrict to one provider (google or microsoft)
    pub provider: Option<String>,
    /// Item type; only `calendar` is supported
    pub item_type: Option<String>,
}

/// A mirrored event
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct MirroredEvent {
    #[schema(value_type = String)]
    pub id: Uuid,
    pub provider: String,
    pub item_type: String,
    pub external_id: String,
    /// Normalized event fields
    #[schema(value_type = crate::calendar::EventPayload)]
    pub payload: serde_json::Value,
    pub starts_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
}

impl From<mirrored_item::Model> for MirroredEvent {
    fn from(model: mirrored_item::Model) -> Self {
        Self {
            id: model.id,
            provider: model.provider,
            item_type: model.item_type,
            external_id: model.external_id,
            payload: model.payload,
            starts_at: model.starts_at.with_timezone(&Utc),
            last_synced_at: model.last_synced_at.with_timezone(&Utc),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EventsResponse {
    pub events: Vec<MirroredEvent>,
}

/// Active mirrored events of connected providers, earliest first
#[utoipa::path(
    get,
    path = "/events",
    security(("bearer_auth" = [])),
    params(EventsQuery, UserHeader),
    responses(
        (status = 200, description = "Mirrored events", body = EventsResponse),
        (status = 400, description = "Unsupported item type", body = ApiError),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "events"
)]
pub async fn list_events(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    user: UserExtension,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let provider = query
        .provider
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(parse_provider)
        .transpose()?;
    let item_type = query.item_type.as_deref().unwrap_or(ITEM_TYPE_CALENDAR);

    let events = state
        .gateway
        .events(user.id(), provider, item_type)
        .await?
        .into_iter()
        .map(MirroredEvent::from)
        .collect();
    Ok(Json(EventsResponse { events }))
}

/// Create an event on the provider and mirror it
#[utoipa::path(
    post,
    path = "/integrations/{provider}/events",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider identifier (google or microsoft)"),
        UserHeader
    ),
    request_body = EventDraft,
    responses(
        (status = 201, description = "Event created", body = MirroredEvent),
        (status = 400, description = "Invalid event", body = ApiError),
        (status = 409, description = "Provider not connected or authorization expired", body = ApiError),
        (status = 502, description = "Provider rejected the write", body = ApiError)
    ),
    tag = "events"
)]
pub async fn create_event(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    user: UserExtension,
    Path(provider): Path<String>,
    payload: Result<Json<EventDraft>, JsonRejection>,
) -> Result<(StatusCode, Json<MirroredEvent>), ApiError> {
    let provider = parse_provider(&provider)?;
    let Json(draft) = payload?;
    let item = state
        .gateway
        .create_event(user.id(), provider, draft)
        .await?;
    Ok((StatusCode::CREATED, Json(item.into())))
}

/// Patch an event on the provider and refresh its mirror row
#[utoipa::path(
    patch,
    path = "/integrations/{provider}/events/{external_id}",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider identifier (google or microsoft)"),
        ("external_id" = String, Path, description = "Provider event identifier"),
        UserHeader
    ),
    request_body = EventPatch,
    responses(
        (status = 200, description = "Event updated", body = MirroredEvent),
        (status = 400, description = "Invalid patch", body = ApiError),
        (status = 404, description = "Event not found on the provider", body = ApiError)
    ),
    tag = "events"
)]
pub async fn update_event(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    user: UserExtension,
    Path((provider, external_id)): Path<(String, String)>,
    payload: Result<Json<EventPatch>, JsonRejection>,
) -> Result<Json<MirroredEvent>, ApiError> {
    let provider = parse_provider(&provider)?;
    let Json(patch) = payload?;
    let item = state
        .gateway
        .update_event(user.id(), provider, &external_id, patch)
        .await?;
    Ok(Json(item.into()))
}

/// Delete an event on the provider and remove its mirror row
#[utoipa::path(
    delete,
    path = "/integrations/{provider}/events/{external_id}",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider identifier (google or microsoft)"),
        ("external_id" = String, Path, description = "Provider event identifier"),
        UserHeader
    ),
    responses(
        (status = 204, description = "Event deleted"),
        (status = 409, description = "Provider not connected or authorization expired", body = ApiError)
    ),
    tag = "events"
)]
pub async fn delete_event(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    user: UserExtension,
    Path((provider, external_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let provider = parse_provider(&provider)?;
    state
        .gateway
        .delete_event(user.id(), provider, &external_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
