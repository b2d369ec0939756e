//! OAuth 2.0 token refresh against Google's token endpoint.
//!
//! The authorization-code grant happens in the surrounding application; the
//! engine only ever exchanges stored refresh tokens.

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{ProviderError, ProviderErrorCode, ProviderResult};

use super::config::{GoogleConfig, OAuthCredentials};
use super::tokens::RefreshedToken;

/// Error body returned by the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OAuthClient {
    http_client: reqwest::Client,
    token_url: String,
    credentials: OAuthCredentials,
}

impl OAuthClient {
    pub fn new(config: &GoogleConfig) -> ProviderResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| ProviderError::configuration(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http_client,
            token_url: config.token_url.clone(),
            credentials: config.credentials.clone(),
        })
    }

    /// Exchanges a refresh token for a new access token.
    ///
    /// `invalid_grant` (revoked or expired refresh token) and client errors
    /// map to `AuthExpired`; the user has to reconnect.
    pub async fn refresh_token(&self, refresh_token: &str) -> ProviderResult<RefreshedToken> {
        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .http_client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(ProviderError::from_transport)?;

        if !status.is_success() {
            warn!(status = status.as_u16(), body = %body, "token refresh rejected");
            return Err(classify_refresh_failure(status.as_u16(), &body));
        }

        let token: RefreshedToken = serde_json::from_str(&body)
            .map_err(|e| ProviderError::invalid_response(format!("invalid token response: {e}")))?;
        info!("refreshed access token");
        Ok(token)
    }
}

fn classify_refresh_failure(status: u16, body: &str) -> ProviderError {
    let code = ProviderErrorCode::from_status(status);
    if code.is_retryable() {
        return ProviderError::from_status(status, body, None);
    }
    let reason = serde_json::from_str::<TokenErrorResponse>(body)
        .map(|e| match e.error_description {
            Some(desc) => format!("{}: {}", e.error, desc),
            None => e.error,
        })
        .unwrap_or_else(|_| format!("HTTP {status}"));
    ProviderError::auth_expired(format!("token refresh failed: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> OAuthClient {
        let config = GoogleConfig::new(OAuthCredentials::new("id", "secret"))
            .with_token_url(format!("{}/token", server.uri()));
        OAuthClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn refresh_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=r-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.new",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = client(&server).await.refresh_token("r-1").await.unwrap();
        assert_eq!(token.access_token, "ya29.new");
        assert_eq!(token.expires_in, Some(3599));
        assert!(token.refresh_token.is_none());
    }

    #[tokio::test]
    async fn invalid_grant_requires_reconnect() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })))
            .mount(&server)
            .await;

        let err = client(&server).await.refresh_token("r-1").await.unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::AuthExpired);
        assert!(err.message().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn server_errors_stay_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server).await.refresh_token("r-1").await.unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::ServiceUnavailable);
        assert!(err.is_retryable());
    }
}
