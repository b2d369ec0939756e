//! CalendarProvider trait and the Google Calendar implementation.
//!
//! - [`CalendarProvider`] - the seam between the sync engine and the external calendar
//! - [`ProviderEvent`] - typed event payload of the provider
//! - [`to_provider_event`] / [`from_provider_event`] - conversion to and from the canonical shape
//! - [`RetryPolicy`] / [`RetryingProvider`] - exponential backoff around any provider
//! - [`ProviderError`] - classified provider failures
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐
//! │  Google API      │     │  MemoryProvider  │
//! └────────┬─────────┘     └────────┬─────────┘
//!          │                        │
//!          │    CalendarProvider    │
//!          └───────────┬────────────┘
//!                      │
//!                      ▼
//!             ┌─────────────────┐
//!             │ RetryingProvider│
//!             └────────┬────────┘
//!                      │ ProviderEvent
//!                      ▼ from_provider_event()
//!             ┌─────────────────┐
//!             │ CanonicalEvent  │
//!             └─────────────────┘
//! ```

pub mod error;
pub mod event;
pub mod google;
pub mod memory;
pub mod normalize;
pub mod provider;
pub mod retry;

pub use error::{ProviderError, ProviderErrorCode, ProviderResult};
pub use event::{ENGINE_TAG, ProviderEvent, ProviderEventTime};
pub use google::{AccessToken, RefreshedToken, TokenCipher, TokenInfo};
pub use memory::MemoryProvider;
pub use normalize::{from_provider_event, to_provider_event};
pub use provider::{
    BoxFuture, CalendarInfo, CalendarProvider, ErrorProvider, EventList, ListOptions,
    RetryingProvider, SendUpdates, WatchChannel, WatchRequest,
};
pub use retry::RetryPolicy;
