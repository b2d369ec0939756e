//! Google Calendar provider implementation.
//!
//! - [`GoogleCalendarClient`] talks to the Calendar v3 REST API
//! - [`OAuthClient`] exchanges refresh tokens at the token endpoint
//! - [`TokenCipher`] seals connection credentials at rest
//!
//! The authorization-code grant is owned by the surrounding application; a
//! connection arrives here with a token pair already issued.
//!
//! # Example
//!
//! ```ignore
//! use hapisync_providers::google::{GoogleCalendarClient, GoogleConfig, OAuthCredentials};
//!
//! let credentials = OAuthCredentials::new(
//!     "your-client-id.apps.googleusercontent.com",
//!     "your-client-secret",
//! );
//! let client = GoogleCalendarClient::new(GoogleConfig::new(credentials))?;
//! let calendars = client.list_calendars(&token).await?;
//! ```

pub mod client;
pub mod config;
pub mod oauth;
pub mod tokens;

pub use client::GoogleCalendarClient;
pub use config::{GoogleConfig, OAuthCredentials};
pub use oauth::OAuthClient;
pub use tokens::{AccessToken, RefreshedToken, TokenCipher, TokenInfo};
