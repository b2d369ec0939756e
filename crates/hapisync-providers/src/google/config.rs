//! Google Calendar provider configuration.

use std::time::Duration;

use serde::Deserialize;

/// OAuth 2.0 client credentials of the application.
///
/// Needed only for refreshing access tokens; the authorization grant itself
/// happens in the surrounding application.
#[derive(Clone)]
pub struct OAuthCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// Google's downloadable credentials JSON, either nested under
/// `installed`/`web` or flat.
#[derive(Debug, Deserialize)]
struct CredentialsFile {
    installed: Option<NestedCredentials>,
    web: Option<NestedCredentials>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NestedCredentials {
    client_id: String,
    client_secret: String,
}

impl OAuthCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Parses a Google Cloud Console credentials JSON document.
    pub fn from_json(json: &str) -> Result<Self, String> {
        let file: CredentialsFile = serde_json::from_str(json)
            .map_err(|e| format!("failed to parse credentials JSON: {}", e))?;

        if let Some(creds) = file.web.or(file.installed) {
            return Ok(Self::new(creds.client_id, creds.client_secret));
        }
        if let (Some(client_id), Some(client_secret)) = (file.client_id, file.client_secret) {
            return Ok(Self::new(client_id, client_secret));
        }
        Err("credentials must contain a 'web'/'installed' section or root-level 'client_id'/'client_secret'".to_string())
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.client_id.is_empty() {
            return Err("client_id is required");
        }
        if !self.client_id.ends_with(".apps.googleusercontent.com") {
            return Err("client_id should end with .apps.googleusercontent.com");
        }
        if self.client_secret.is_empty() {
            return Err("client_secret is required");
        }
        Ok(())
    }
}

/// Configuration for [`GoogleCalendarClient`](super::GoogleCalendarClient).
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub credentials: OAuthCredentials,
    /// Calendar API root, overridable for tests.
    pub api_base_url: String,
    pub token_url: String,
    /// Transport timeout for a single HTTP request.
    pub timeout: Duration,
    pub user_agent: String,
    /// `maxResults` per list page.
    pub page_size: u32,
    /// Ceiling on pages followed by one list call.
    pub max_pages: u32,
}

impl GoogleConfig {
    pub const DEFAULT_API_BASE: &'static str = "https://www.googleapis.com/calendar/v3";
    pub const DEFAULT_TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
    pub const DEFAULT_PAGE_SIZE: u32 = 250;
    pub const DEFAULT_MAX_PAGES: u32 = 20;

    pub fn new(credentials: OAuthCredentials) -> Self {
        Self {
            credentials,
            api_base_url: Self::DEFAULT_API_BASE.to_string(),
            token_url: Self::DEFAULT_TOKEN_URL.to_string(),
            timeout: Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS),
            user_agent: format!("hapisync/{}", env!("CARGO_PKG_VERSION")),
            page_size: Self::DEFAULT_PAGE_SIZE,
            max_pages: Self::DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, 2500);
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nested_and_flat_credentials() {
        let nested = r#"{"web": {"client_id": "abc.apps.googleusercontent.com", "client_secret": "s", "project_id": "p"}}"#;
        let creds = OAuthCredentials::from_json(nested).unwrap();
        assert_eq!(creds.client_id, "abc.apps.googleusercontent.com");
        assert!(creds.validate().is_ok());

        let flat = r#"{"client_id": "x", "client_secret": "y"}"#;
        let creds = OAuthCredentials::from_json(flat).unwrap();
        assert_eq!(
            creds.validate(),
            Err("client_id should end with .apps.googleusercontent.com")
        );

        assert!(OAuthCredentials::from_json(r#"{"other": 1}"#).is_err());
    }

    #[test]
    fn defaults_and_builders() {
        let config = GoogleConfig::new(OAuthCredentials::new("id", "secret"))
            .with_api_base_url("http://127.0.0.1:9999/")
            .with_page_size(0)
            .with_max_pages(0);
        assert_eq!(config.api_base_url, "http://127.0.0.1:9999");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.page_size, 1);
        assert_eq!(config.max_pages, 1);
        assert!(config.user_agent.starts_with("hapisync/"));
        assert!(!format!("{:?}", config.credentials).contains("secret\""));
    }
}
