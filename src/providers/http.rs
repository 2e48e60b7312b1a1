//! HTTP helpers shared by the provider adapters: status classification,
//! `Retry-After` handling, URL building and size-capped downloads.

use reqwest::{Client, Response, StatusCode, header::HeaderMap};
use serde::de::DeserializeOwned;
use url::Url;

use super::ProviderError;

/// Bodies quoted in errors are cut to this many characters
const MAX_ERROR_BODY_CHARS: usize = 500;

/// 403 bodies containing any of these are quota exhaustion, not permission errors
const QUOTA_ERROR_PATTERNS: &[&str] = &[
    "userratelimitexceeded",
    "ratelimitexceeded",
    "quotaexceeded",
    "servicelimit",
    "daily limit",
    "billing limit",
    "activitylimitreached",
];

pub fn build_client() -> Result<Client, ProviderError> {
    Client::builder()
        .user_agent(concat!("integrations/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ProviderError::Configuration(format!("HTTP client: {}", e)))
}

/// Transport failures (including timeouts) are always transient.
pub fn map_send_error(context: &str, error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Unavailable(format!("{} timed out", context))
    } else {
        ProviderError::Unavailable(format!("{} failed: {}", context, error))
    }
}

pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

pub fn truncate_body(body: &str) -> String {
    if body.chars().count() > MAX_ERROR_BODY_CHARS {
        let truncated: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}

fn is_quota_body(body: &str) -> bool {
    let lower = body.to_lowercase();
    QUOTA_ERROR_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// Classify a non-success status of a resource API call.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED => ProviderError::Unauthorized(truncate_body(body)),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            retry_after_secs: retry_after,
        },
        StatusCode::FORBIDDEN if is_quota_body(body) => ProviderError::RateLimited {
            retry_after_secs: retry_after,
        },
        s if s.is_server_error() => {
            ProviderError::Unavailable(format!("upstream status {}", s.as_u16()))
        }
        s => ProviderError::Rejected {
            status: s.as_u16(),
            body: truncate_body(body),
        },
    }
}

/// Pass successful responses through, turn everything else into a [`ProviderError`].
pub async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, retry_after, &body))
}

/// Read and decode a JSON body. Body read failures are transient, decode
/// failures are malformed responses.
pub async fn read_json<T: DeserializeOwned>(
    response: Response,
    context: &str,
) -> Result<T, ProviderError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| map_send_error(context, e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ProviderError::Malformed(format!("{}: {}", context, e)))
}

/// Stream a body into memory, aborting once `max_bytes` would be exceeded.
pub async fn read_capped(mut response: Response, max_bytes: u64) -> Result<Vec<u8>, ProviderError> {
    if let Some(declared) = response.content_length()
        && declared > max_bytes
    {
        return Err(ProviderError::TooLarge {
            limit_bytes: max_bytes,
            actual_bytes: Some(declared),
        });
    }

    let mut buffer = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| map_send_error("file download", e))?
    {
        if buffer.len() as u64 + chunk.len() as u64 > max_bytes {
            return Err(ProviderError::TooLarge {
                limit_bytes: max_bytes,
                actual_bytes: None,
            });
        }
        buffer.extend_from_slice(&chunk);
    }

    Ok(buffer)
}

/// Append path segments (percent-encoded) to a base URL.
pub fn endpoint(base: &str, segments: &[&str]) -> Result<Url, ProviderError> {
    let mut url = Url::parse(base)
        .map_err(|e| ProviderError::Configuration(format!("invalid base URL '{}': {}", base, e)))?;
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            ProviderError::Configuration(format!("base URL '{}' cannot carry a path", base))
        })?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, ""),
            ProviderError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(120), ""),
            ProviderError::RateLimited {
                retry_after_secs: Some(120)
            }
        ));
        assert!(matches!(
            classify_status(
                StatusCode::FORBIDDEN,
                None,
                r#"{"error":{"errors":[{"reason":"userRateLimitExceeded"}]}}"#
            ),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, "insufficient permissions"),
            ProviderError::Rejected { status: 403, .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::GONE, None, ""),
            ProviderError::Rejected { status: 410, .. }
        ));
    }

    #[test]
    fn endpoint_encodes_segments() {
        let url = endpoint("https://graph.example.com/v1.0/", &["me", "events", "a/b c"]).unwrap();
        assert_eq!(url.as_str(), "https://graph.example.com/v1.0/me/events/a%2Fb%20c");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(MAX_ERROR_BODY_CHARS + 10);
        assert_eq!(truncate_body(&body).chars().count(), MAX_ERROR_BODY_CHARS + 3);
    }
}
