use thiserror::Error;

use crate::config::ConfigError;

pub const DEFAULT_APPLICATION_ERROR_MESSAGE: &str = "Request failed, please try again later.";
pub const DEFAULT_SESSION_EXPIRED_MESSAGE: &str =
    "Your session has expired. Please sign in again.";
pub const DEFAULT_NETWORK_ERROR_MESSAGE: &str = "Network error, please check your connection.";

/// Error returned to callers of the request pipeline.
///
/// Auth classification stays inside the pipeline: a recoverable session
/// refresh never surfaces here, and a terminal one surfaces as
/// [`ApiError::SessionExpired`] alongside the session-expired interstitial.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("invalid client configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid request path")]
    InvalidPath,
    #[error("{message}")]
    InvalidBody { message: String },
    #[error("{message}")]
    Network { message: String },
    #[error("{message}")]
    Decode { message: String },
    #[error("{message}")]
    Application {
        status: u16,
        code: Option<i64>,
        message: String,
    },
    #[error("{message}")]
    SessionExpired { message: String },
}

impl ApiError {
    /// Human-readable message suitable for a toast.
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    #[must_use]
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired { .. })
    }

    pub(crate) fn network(error: &reqwest::Error) -> Self {
        let message = if error.is_timeout() {
            "Request timed out, please try again.".to_string()
        } else {
            DEFAULT_NETWORK_ERROR_MESSAGE.to_string()
        };
        Self::Network { message }
    }

    pub(crate) fn decode(error: impl std::fmt::Display) -> Self {
        Self::Decode {
            message: format!("failed to decode response body: {error}"),
        }
    }
}
