//! Error types for calendar provider operations.
//!
//! Every failure talking to the external calendar is classified into a
//! [`ProviderErrorCode`]. The code decides whether the retry policy tries
//! again and how the orchestrator reports the failure to the user.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The category of a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorCode {
    /// 401: the access token was rejected.
    AuthenticationFailed,
    /// 403: the account lacks permission on the calendar.
    AuthorizationFailed,
    /// The access token is expired and must be refreshed centrally, or the
    /// refresh itself was rejected. The user has to reconnect.
    AuthExpired,
    /// 429, paced by `Retry-After` when the provider sends it.
    RateLimited,
    /// 404 or 410 on an object. Treated as already gone.
    NotFound,
    /// 409.
    Conflict,
    /// 412.
    PreconditionFailed,
    /// 5xx.
    ServiceUnavailable,
    /// Transport failure or per-attempt timeout.
    NetworkError,
    /// 410 on a list request carrying a sync token.
    SyncTokenExpired,
    /// Body could not be parsed.
    InvalidResponse,
    /// 400.
    BadRequest,
    /// Missing or invalid configuration.
    ConfigurationError,
    /// Any other provider response.
    ProviderError,
    /// Unexpected local state.
    InternalError,
}

impl ProviderErrorCode {
    /// Returns true if this error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError
                | Self::RateLimited
                | Self::ServiceUnavailable
                | Self::Conflict
                | Self::PreconditionFailed
        )
    }

    /// True for every code that requires the user to reconnect the account.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed | Self::AuthorizationFailed | Self::AuthExpired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "authentication_failed",
            Self::AuthorizationFailed => "authorization_failed",
            Self::AuthExpired => "auth_expired",
            Self::RateLimited => "rate_limited",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::PreconditionFailed => "precondition_failed",
            Self::ServiceUnavailable => "service_unavailable",
            Self::NetworkError => "network_error",
            Self::SyncTokenExpired => "sync_token_expired",
            Self::InvalidResponse => "invalid_response",
            Self::BadRequest => "bad_request",
            Self::ConfigurationError => "configuration_error",
            Self::ProviderError => "provider_error",
            Self::InternalError => "internal_error",
        }
    }

    /// Maps an HTTP status to a code. Success statuses map to `ProviderError`.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => Self::BadRequest,
            401 => Self::AuthenticationFailed,
            403 => Self::AuthorizationFailed,
            404 | 410 => Self::NotFound,
            409 => Self::Conflict,
            412 => Self::PreconditionFailed,
            429 => Self::RateLimited,
            500..=599 => Self::ServiceUnavailable,
            _ => Self::ProviderError,
        }
    }
}

impl fmt::Display for ProviderErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An error that occurred while interacting with a calendar provider.
#[derive(Debug, Error)]
pub struct ProviderError {
    code: ProviderErrorCode,
    message: String,
    /// Provider-advertised delay before retrying (rate limiting).
    retry_after: Option<Duration>,
    /// HTTP status of the response, when there was one.
    status: Option<u16>,
    provider: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProviderError {
    pub fn new(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
            status: None,
            provider: None,
            source: None,
        }
    }

    /// Classifies a non-success HTTP response.
    ///
    /// The raw body is kept in the message for logs; user-facing text is
    /// derived from the code only.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let code = ProviderErrorCode::from_status(status);
        let body = body.trim();
        let message = if body.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {body}")
        };
        let mut err = Self::new(code, message);
        err.status = Some(status);
        if code == ProviderErrorCode::RateLimited {
            err.retry_after = retry_after;
        }
        err
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::AuthenticationFailed, message)
    }

    pub fn auth_expired(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::AuthExpired, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::NetworkError, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let mut err = Self::new(ProviderErrorCode::RateLimited, message);
        err.retry_after = retry_after;
        err
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::ServiceUnavailable, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::InvalidResponse, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::NotFound, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::ConfigurationError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::InternalError, message)
    }

    /// Converts a transport-level reqwest failure.
    pub fn from_transport(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "request timeout".to_string()
        } else if err.is_connect() {
            format!("connection failed: {err}")
        } else {
            format!("request failed: {err}")
        };
        Self::network(message).with_source(err)
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn code(&self) -> ProviderErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn is_auth(&self) -> bool {
        self.code.is_auth()
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ProviderErrorCode::NotFound
    }

    /// Copies code, message and pacing without the boxed source.
    pub fn duplicate(&self) -> Self {
        Self {
            code: self.code,
            message: self.message.clone(),
            retry_after: self.retry_after,
            status: self.status,
            provider: self.provider.clone(),
            source: None,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref provider) = self.provider {
            write!(f, "[{}] ", provider)?;
        }
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A specialized Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_codes() {
        for code in [
            ProviderErrorCode::NetworkError,
            ProviderErrorCode::RateLimited,
            ProviderErrorCode::ServiceUnavailable,
            ProviderErrorCode::Conflict,
            ProviderErrorCode::PreconditionFailed,
        ] {
            assert!(code.is_retryable(), "{code} should be retryable");
        }
        for code in [
            ProviderErrorCode::AuthExpired,
            ProviderErrorCode::AuthenticationFailed,
            ProviderErrorCode::NotFound,
            ProviderErrorCode::ProviderError,
            ProviderErrorCode::BadRequest,
        ] {
            assert!(!code.is_retryable(), "{code} should not be retryable");
        }
    }

    #[test]
    fn status_classification() {
        assert_eq!(ProviderErrorCode::from_status(401), ProviderErrorCode::AuthenticationFailed);
        assert_eq!(ProviderErrorCode::from_status(403), ProviderErrorCode::AuthorizationFailed);
        assert_eq!(ProviderErrorCode::from_status(404), ProviderErrorCode::NotFound);
        assert_eq!(ProviderErrorCode::from_status(410), ProviderErrorCode::NotFound);
        assert_eq!(ProviderErrorCode::from_status(409), ProviderErrorCode::Conflict);
        assert_eq!(ProviderErrorCode::from_status(412), ProviderErrorCode::PreconditionFailed);
        assert_eq!(ProviderErrorCode::from_status(503), ProviderErrorCode::ServiceUnavailable);
        assert_eq!(ProviderErrorCode::from_status(418), ProviderErrorCode::ProviderError);
    }

    #[test]
    fn from_status_keeps_retry_after_only_for_rate_limits() {
        let err = ProviderError::from_status(429, "slow down", Some(Duration::from_secs(7)));
        assert_eq!(err.code(), ProviderErrorCode::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(err.message(), "HTTP 429: slow down");

        let err = ProviderError::from_status(500, "", Some(Duration::from_secs(7)));
        assert_eq!(err.retry_after(), None);
        assert_eq!(err.message(), "HTTP 500");
    }

    #[test]
    fn status_is_kept_apart_from_the_message() {
        let gone = ProviderError::from_status(410, "HTTP 404 in body", None);
        assert_eq!(gone.status(), Some(410));
        assert!(gone.is_not_found());

        let missing = ProviderError::from_status(404, "", None);
        assert_eq!(missing.status(), Some(404));
        assert_eq!(missing.duplicate().status(), Some(404));

        assert_eq!(ProviderError::network("reset").status(), None);
    }

    #[test]
    fn auth_codes_require_reconnect() {
        assert!(ProviderError::auth_expired("refresh rejected").is_auth());
        assert!(ProviderError::from_status(403, "", None).is_auth());
        assert!(!ProviderError::network("reset").is_auth());
    }

    #[test]
    fn display_includes_provider() {
        let err = ProviderError::rate_limited("too many requests", None).with_provider("google");
        let display = format!("{}", err);
        assert!(display.contains("[google]"));
        assert!(display.contains("rate_limited"));
    }

    #[test]
    fn duplicate_drops_source() {
        use std::error::Error;
        let err = ProviderError::internal("boom").with_source(std::io::Error::other("disk"));
        assert!(err.source().is_some());
        let copy = err.duplicate();
        assert!(copy.source().is_none());
        assert_eq!(copy.code(), ProviderErrorCode::InternalError);
    }
}
