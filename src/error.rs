//! # Error Handling
//!
//! Two layers live here: [`IntegrationError`], the domain taxonomy produced by
//! the token authority, fetcher, reconciliation engine and mutation proxy, and
//! [`ApiError`], the problem+json body the HTTP boundary renders. The
//! conversion between them is the only place provider failures become status
//! codes.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

use crate::providers::{Provider, ProviderError};
use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Extract current trace ID from the active tracing span (falls back to generated correlation ID)
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                // Fallback: generate a correlation ID for basic client-server log correlation
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

/// True when a write collided with a unique index
pub(crate) fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    matches!(
        error.sql_err(),
        Some(sea_orm::SqlErr::UniqueConstraintViolation(_))
    )
}

/// Upstream provider error information
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpstreamErrorDetails {
    /// Provider identifier (`google` or `microsoft`)
    pub provider: String,
    /// HTTP status code from upstream
    pub status: u16,
    /// Response body snippet from upstream (truncated for security)
    pub body_snippet: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        // Add Retry-After header if present
        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        // Log the full error for debugging
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
    }
}

/// Create a provider upstream error
pub fn provider_error(provider: String, status: u16, body: Option<String>) -> ApiError {
    let upstream = UpstreamErrorDetails {
        provider: provider.clone(),
        status,
        body_snippet: body.map(|b| {
            if b.chars().count() > 200 {
                let truncated: String = b.chars().take(200).collect();
                format!("{}...", truncated)
            } else {
                b
            }
        }),
    };

    ApiError::new(
        StatusCode::BAD_GATEWAY,
        "PROVIDER_ERROR",
        &format!("Provider {} returned error status {}", provider, status),
    )
    .with_details(json!(upstream))
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create an unauthorized error (401) with explicit trace_id
pub fn unauthorized_with_trace_id(message: Option<&str>, trace_id: String) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    let mut error = ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg);
    error.trace_id = Some(trace_id.into_boxed_str());
    error
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

/// Default Retry-After hint when a provider gave none
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// Domain failures of the integration layer
#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("{provider} is not connected")]
    NotConnected { provider: Provider },

    #[error("{provider} authorization expired; the user must reconnect")]
    AuthExpired { provider: Provider },

    #[error("token refresh for {provider} failed transiently: {message}")]
    RefreshTransient {
        provider: Provider,
        retry_after_secs: Option<u64>,
        message: String,
    },

    #[error("{provider} is unavailable: {message}")]
    ProviderUnavailable {
        provider: Provider,
        retry_after_secs: Option<u64>,
        message: String,
    },

    #[error("payload of {actual_bytes:?} bytes exceeds the {limit_bytes} byte limit")]
    SizeLimitExceeded {
        limit_bytes: u64,
        actual_bytes: Option<u64>,
    },

    #[error("concurrent write conflict on {resource}")]
    ConflictOnWrite { resource: String },

    #[error("{provider} rejected the request with status {status}: {message}")]
    ProviderRejected {
        provider: Provider,
        status: u16,
        message: String,
    },

    #[error("{provider} returned a malformed response: {message}")]
    MalformedResponse { provider: Provider, message: String },

    #[error("{provider} rejected the authorization: {message}")]
    InvalidAuthorization { provider: Provider, message: String },

    #[error("{provider} integration is misconfigured: {message}")]
    Misconfigured { provider: Provider, message: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("user {0} not found")]
    UserNotFound(uuid::Uuid),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Repositories return `anyhow::Result`; domain errors raised inside them
/// (write conflicts) are recovered here instead of becoming storage errors.
impl From<anyhow::Error> for IntegrationError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<IntegrationError>() {
            Ok(domain) => domain,
            Err(error) => Self::Storage(error),
        }
    }
}

impl IntegrationError {
    /// Classify a provider failure outside the refresh path. A 401 reaching
    /// this point has already survived one forced refresh.
    pub fn from_provider(provider: Provider, error: ProviderError) -> Self {
        match error {
            ProviderError::InvalidGrant { code, description } => Self::InvalidAuthorization {
                provider,
                message: description.unwrap_or(code),
            },
            ProviderError::Unauthorized(message) => Self::ProviderRejected {
                provider,
                status: 401,
                message,
            },
            ProviderError::RateLimited { retry_after_secs } => Self::ProviderUnavailable {
                provider,
                retry_after_secs,
                message: "rate limited".to_string(),
            },
            ProviderError::Unavailable(message) => Self::ProviderUnavailable {
                provider,
                retry_after_secs: None,
                message,
            },
            ProviderError::Rejected { status, body } => Self::ProviderRejected {
                provider,
                status,
                message: body,
            },
            ProviderError::Malformed(message) => Self::MalformedResponse { provider, message },
            ProviderError::TooLarge {
                limit_bytes,
                actual_bytes,
            } => Self::SizeLimitExceeded {
                limit_bytes,
                actual_bytes,
            },
            ProviderError::Configuration(message) => Self::Misconfigured { provider, message },
        }
    }

    /// True for failures worth retrying later without user action
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RefreshTransient { .. } | Self::ProviderUnavailable { .. }
        )
    }
}

impl From<IntegrationError> for ApiError {
    fn from(error: IntegrationError) -> Self {
        match error {
            IntegrationError::NotConnected { provider } => ApiError::new(
                StatusCode::CONFLICT,
                "NOT_CONNECTED",
                &format!("{} is not connected", provider),
            )
            .with_details(json!({ "provider": provider })),
            IntegrationError::AuthExpired { provider } => ApiError::new(
                StatusCode::CONFLICT,
                "AUTH_EXPIRED",
                &format!("{} authorization expired, reconnect required", provider),
            )
            .with_details(json!({ "provider": provider })),
            IntegrationError::RefreshTransient {
                provider,
                retry_after_secs,
                ..
            }
            | IntegrationError::ProviderUnavailable {
                provider,
                retry_after_secs,
                ..
            } => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "PROVIDER_UNAVAILABLE",
                &format!("{} is temporarily unavailable", provider),
            )
            .with_details(json!({ "provider": provider }))
            .with_retry_after(retry_after_secs.unwrap_or(DEFAULT_RETRY_AFTER_SECS)),
            IntegrationError::SizeLimitExceeded {
                limit_bytes,
                actual_bytes,
            } => ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "SIZE_LIMIT_EXCEEDED",
                "File exceeds the configured size limit",
            )
            .with_details(json!({ "limit_bytes": limit_bytes, "actual_bytes": actual_bytes })),
            IntegrationError::ConflictOnWrite { resource } => ApiError::new(
                StatusCode::CONFLICT,
                "CONFLICT",
                &format!("Concurrent update of {}", resource),
            ),
            IntegrationError::ProviderRejected {
                provider,
                status: status @ (404 | 410),
                ..
            } => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("{} reports the resource as missing", provider),
            )
            .with_details(json!({ "provider": provider, "status": status })),
            IntegrationError::ProviderRejected {
                provider,
                status,
                message,
            } => provider_error(provider.to_string(), status, Some(message)),
            IntegrationError::MalformedResponse { provider, message } => {
                tracing::warn!(%provider, error = %message, "Malformed provider response");
                provider_error(provider.to_string(), 200, Some(message))
            }
            IntegrationError::InvalidAuthorization { provider, message } => validation_error(
                "Authorization rejected by provider",
                json!({ "provider": provider, "reason": message }),
            ),
            IntegrationError::Validation(message) => {
                ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
            }
            IntegrationError::UserNotFound(user_id) => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("User {} not found", user_id),
            ),
            IntegrationError::Misconfigured { provider, message } => {
                tracing::error!(%provider, error = %message, "Provider integration misconfigured");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred",
                )
            }
            IntegrationError::Storage(error) => error.into(),
        }
    }
}
