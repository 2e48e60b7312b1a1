//! OAuth 2.0 token endpoint client (authorization code and refresh grants)

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};

use super::http::{map_send_error, parse_retry_after, truncate_body};
use super::{ProviderError, TokenGrant};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default, deserialize_with = "number_or_string")]
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    error_description: Option<String>,
}

// Some Microsoft endpoints still send `expires_in` as a string
fn number_or_string<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Some(n),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

/// Token endpoint of one provider
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    pub url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Extra form fields sent with every grant (e.g. Microsoft `scope`)
    pub extra_params: Vec<(&'static str, String)>,
    pub timeout: Duration,
}

impl TokenEndpoint {
    pub async fn exchange_code(
        &self,
        client: &Client,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenGrant, ProviderError> {
        let mut params = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
        ];
        if let Some(verifier) = code_verifier {
            params.push(("code_verifier", verifier.to_string()));
        }
        self.request(client, params, "token exchange").await
    }

    pub async fn refresh(
        &self,
        client: &Client,
        refresh_token: &str,
    ) -> Result<TokenGrant, ProviderError> {
        let params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        self.request(client, params, "token refresh").await
    }

    async fn request(
        &self,
        client: &Client,
        mut params: Vec<(&'static str, String)>,
        context: &str,
    ) -> Result<TokenGrant, ProviderError> {
        let (Some(client_id), Some(client_secret)) = (&self.client_id, &self.client_secret) else {
            return Err(ProviderError::Configuration(
                "client id and secret are not set".to_string(),
            ));
        };
        params.push(("client_id", client_id.clone()));
        params.push(("client_secret", client_secret.clone()));
        params.extend(self.extra_params.iter().cloned());

        let response = client
            .post(&self.url)
            .header("Accept", "application/json")
            .timeout(self.timeout)
            .form(&params)
            .send()
            .await
            .map_err(|e| map_send_error(context, e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| map_send_error(context, e))?;

        if !status.is_success() {
            return Err(classify_token_failure(status, retry_after, &body));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Malformed(format!("{} response: {}", context, e)))?;
        if token.access_token.is_empty() {
            return Err(ProviderError::Malformed(format!(
                "{} response carried an empty access token",
                context
            )));
        }

        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
        })
    }
}

/// Classify a failed token endpoint call. OAuth error bodies become
/// [`ProviderError::InvalidGrant`]; whether the code is unrecoverable is
/// decided by the caller.
pub fn classify_token_failure(
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::RateLimited {
            retry_after_secs: retry_after,
        };
    }
    if status.is_server_error() {
        return ProviderError::Unavailable(format!("token endpoint status {}", status.as_u16()));
    }

    match serde_json::from_str::<OAuthErrorBody>(body) {
        Ok(err) => ProviderError::InvalidGrant {
            code: err.error.to_ascii_lowercase(),
            description: err.error_description,
        },
        Err(_) => ProviderError::Rejected {
            status: status.as_u16(),
            body: truncate_body(body),
        },
    }
}
