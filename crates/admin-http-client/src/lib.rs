//! Request pipeline for the admin console API.
//!
//! Every call goes through [`ApiClient`]: the response is decoded into a
//! `{code, msg, data}` envelope, classified, and either unwrapped for the
//! caller or turned into an [`ApiError`]. An expired access credential
//! (401) is renewed once per burst of concurrent failures and the request
//! replayed; an expired refresh credential (402) clears the credential and
//! raises a single session-expired interstitial that leads back to the
//! login route.

pub mod classify;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod notifier;
pub mod refresh;
pub mod request;
pub mod routes;
pub mod session;

pub use classify::{AuthCodes, Outcome, classify};
pub use client::ApiClient;
pub use config::{ClientConfig, ConfigError};
pub use envelope::{ContentKind, Payload, ResponseEnvelope, decode_body, decode_response};
pub use error::ApiError;
pub use notifier::{
    AutoConfirm, ChannelSurface, Decision, FallbackPrompt, HeadlessSurface, InterstitialEvent,
    InterstitialId, InterstitialSurface, NoPrompt, SessionExpiredNotifier, SurfaceUnavailable,
};
pub use refresh::RefreshCoordinator;
pub use request::{
    Attempt, CredentialsMode, FormData, FormPart, QueryParams, QueryValue, RequestBody,
    RequestDescriptor,
};
pub use routes::{LocalePrefix, LocaleRouting};
pub use session::{Location, MemoryNavigator, Navigator, RedirectGuard, SessionCoordination};
