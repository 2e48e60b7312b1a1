//! # Integration Handlers
//!
//! Connect, disconnect, status, sync and picker endpoints.

use std::collections::BTreeMap;

use axum::{
    Json,
    body::Body,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::parse_provider;
use crate::auth::{OperatorAuth, UserExtension, UserHeader};
use crate::error::ApiError;
use crate::gateway::{ConnectRequest, PickerToken, ProviderStatus};
use crate::server::AppState;

/// Connection state keyed by provider slug
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub integrations: BTreeMap<String, ProviderStatus>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectResponse {
    pub success: bool,
    /// Email of the connected account, when the provider reported one
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DisconnectResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SyncResponse {
    pub success: bool,
    pub upserted: u64,
    pub deleted: u64,
}

/// Connection status of every supported provider
#[utoipa::path(
    get,
    path = "/integrations",
    security(("bearer_auth" = [])),
    params(UserHeader),
    responses(
        (status = 200, description = "Per-provider connection status", body = StatusResponse),
        (status = 401, description = "Missing or invalid authorization token", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn status(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    user: UserExtension,
) -> Result<Json<StatusResponse>, ApiError> {
    let statuses = state.gateway.status(user.id()).await?;
    Ok(Json(StatusResponse {
        integrations: statuses
            .into_iter()
            .map(|(provider, status)| (provider.to_string(), status))
            .collect(),
    }))
}

/// Exchange an authorization code and store the credential
#[utoipa::path(
    post,
    path = "/integrations/{provider}/connect",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider identifier (google or microsoft)"),
        UserHeader
    ),
    request_body = ConnectRequest,
    responses(
        (status = 200, description = "Account connected", body = ConnectResponse),
        (status = 400, description = "Empty or rejected authorization code", body = ApiError),
        (status = 404, description = "Unknown provider or user", body = ApiError),
        (status = 503, description = "Provider temporarily unavailable", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn connect(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    user: UserExtension,
    Path(provider): Path<String>,
    payload: Result<Json<ConnectRequest>, JsonRejection>,
) -> Result<Json<ConnectResponse>, ApiError> {
    let provider = parse_provider(&provider)?;
    let Json(request) = payload?;
    let email = state.gateway.connect(user.id(), provider, request).await?;
    Ok(Json(ConnectResponse {
        success: true,
        email,
    }))
}

/// Disconnect a provider; mirrored items are kept
#[utoipa::path(
    delete,
    path = "/integrations/{provider}",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider identifier (google or microsoft)"),
        UserHeader
    ),
    responses(
        (status = 200, description = "Provider disconnected", body = DisconnectResponse),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn disconnect(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    user: UserExtension,
    Path(provider): Path<String>,
) -> Result<Json<DisconnectResponse>, ApiError> {
    let provider = parse_provider(&provider)?;
    state.gateway.disconnect(user.id(), provider).await?;
    Ok(Json(DisconnectResponse { success: true }))
}

/// Reconcile the provider's upcoming events into the mirror
#[utoipa::path(
    post,
    path = "/integrations/{provider}/sync",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider identifier (google or microsoft)"),
        UserHeader
    ),
    responses(
        (status = 200, description = "Sync completed", body = SyncResponse),
        (status = 409, description = "Provider not connected or authorization expired", body = ApiError),
        (status = 503, description = "Provider temporarily unavailable", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn sync(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    user: UserExtension,
    Path(provider): Path<String>,
) -> Result<Json<SyncResponse>, ApiError> {
    let provider = parse_provider(&provider)?;
    let result = state.gateway.sync(user.id(), provider).await?;
    Ok(Json(SyncResponse {
        success: true,
        upserted: result.upserted,
        deleted: result.deleted,
    }))
}

/// Access token for the client-side file picker
#[utoipa::path(
    get,
    path = "/integrations/{provider}/picker-token",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider identifier (google or microsoft)"),
        UserHeader
    ),
    responses(
        (status = 200, description = "Valid access token", body = PickerToken),
        (status = 409, description = "Provider not connected or authorization expired", body = ApiError),
        (status = 503, description = "Token refresh failed transiently", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn picker_token(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    user: UserExtension,
    Path(provider): Path<String>,
) -> Result<Json<PickerToken>, ApiError> {
    let provider = parse_provider(&provider)?;
    Ok(Json(state.gateway.picker_token(user.id(), provider).await?))
}

/// Download a file the user selected in the picker
#[utoipa::path(
    get,
    path = "/integrations/{provider}/files/{file_id}",
    security(("bearer_auth" = [])),
    params(
        ("provider" = String, Path, description = "Provider identifier (google or microsoft)"),
        ("file_id" = String, Path, description = "Provider file identifier"),
        UserHeader
    ),
    responses(
        (status = 200, description = "File content", content_type = "application/octet-stream"),
        (status = 404, description = "Unknown provider or file", body = ApiError),
        (status = 413, description = "File exceeds the configured size limit", body = ApiError)
    ),
    tag = "integrations"
)]
pub async fn picked_file(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    user: UserExtension,
    Path((provider, file_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let provider = parse_provider(&provider)?;
    let file = state
        .gateway
        .picked_file(user.id(), provider, &file_id)
        .await?;

    let content_type = HeaderValue::from_str(&file.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        file.name.replace(['"', '\\', '\r', '\n'], "_")
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from(file.bytes),
    )
        .into_response())
}
