use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::classify::AuthCodes;
use crate::request::CredentialsMode;
use crate::routes::{LocalePrefix, LocaleRouting};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_REFRESH_PATH: &str = "/v1/auth/refresh";
pub const DEFAULT_LOGIN_ENDPOINT: &str = "/v1/auth/login";

pub const ENV_BASE_URL: &str = "ADMIN_API_BASE_URL";
pub const ENV_REFRESH_PATH: &str = "ADMIN_API_REFRESH_PATH";
pub const ENV_LOGIN_ENDPOINT: &str = "ADMIN_API_LOGIN_PATH";
pub const ENV_TIMEOUT_MS: &str = "ADMIN_API_TIMEOUT_MS";
pub const ENV_CREDENTIALS: &str = "ADMIN_API_CREDENTIALS";
pub const ENV_SOFT_AUTH_CODE: &str = "ADMIN_API_SOFT_AUTH_CODE";
pub const ENV_HARD_AUTH_CODE: &str = "ADMIN_API_HARD_AUTH_CODE";
pub const ENV_SUCCESS_CODE: &str = "ADMIN_API_SUCCESS_CODE";
pub const ENV_LOGIN_ROUTE: &str = "ADMIN_LOGIN_ROUTE";
pub const ENV_LOCALES: &str = "ADMIN_LOCALES";
pub const ENV_DEFAULT_LOCALE: &str = "ADMIN_DEFAULT_LOCALE";
pub const ENV_LOCALE_PREFIX: &str = "ADMIN_LOCALE_PREFIX";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("base url must not be empty")]
    EmptyBaseUrl,
    #[error("base url must use http:// or https:// and include a host")]
    InvalidBaseUrl,
    #[error("invalid ADMIN_API_TIMEOUT_MS: {0}")]
    InvalidTimeout(String),
    #[error("invalid ADMIN_API_CREDENTIALS: {0}")]
    InvalidCredentials(String),
    #[error("invalid ADMIN_LOCALE_PREFIX: {0}")]
    InvalidLocalePrefix(String),
    #[error("invalid auth code in {key}: {value}")]
    InvalidAuthCode { key: &'static str, value: String },
    #[error("failed to initialize http client: {0}")]
    HttpClient(String),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Renewal endpoint, called with cookies and an empty JSON body.
    pub refresh_path: String,
    /// Sign-in endpoint; soft failures from it never trigger a refresh.
    pub login_endpoint: String,
    pub timeout: Option<Duration>,
    pub credentials: CredentialsMode,
    pub auth_codes: AuthCodes,
    pub routing: LocaleRouting,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            login_endpoint: DEFAULT_LOGIN_ENDPOINT.to_string(),
            timeout: None,
            credentials: CredentialsMode::SameOrigin,
            auth_codes: AuthCodes::default(),
            routing: LocaleRouting::default(),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let base_url = normalize_base_url(
            env_non_empty(ENV_BASE_URL)
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL),
        )?;
        let refresh_path = env_non_empty(ENV_REFRESH_PATH).unwrap_or(defaults.refresh_path);
        let login_endpoint = env_non_empty(ENV_LOGIN_ENDPOINT).unwrap_or(defaults.login_endpoint);
        let timeout = env_non_empty(ENV_TIMEOUT_MS)
            .map(|raw| {
                raw.parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|error| ConfigError::InvalidTimeout(error.to_string()))
            })
            .transpose()?;
        let credentials = match env_non_empty(ENV_CREDENTIALS) {
            Some(raw) => CredentialsMode::parse(&raw)
                .ok_or_else(|| ConfigError::InvalidCredentials(raw.clone()))?,
            None => defaults.credentials,
        };
        let auth_codes = AuthCodes {
            soft: parse_code(ENV_SOFT_AUTH_CODE, defaults.auth_codes.soft)?,
            hard: parse_code(ENV_HARD_AUTH_CODE, defaults.auth_codes.hard)?,
            success: parse_code(ENV_SUCCESS_CODE, defaults.auth_codes.success)?,
        };

        let mut routing = defaults.routing;
        if let Some(login_route) = env_non_empty(ENV_LOGIN_ROUTE) {
            routing.login_path = login_route;
        }
        if let Some(raw) = env_non_empty(ENV_LOCALES) {
            routing.locales = raw
                .split(',')
                .map(str::trim)
                .filter(|locale| !locale.is_empty())
                .map(str::to_string)
                .collect();
        }
        routing.default_locale = env_non_empty(ENV_DEFAULT_LOCALE);
        if let Some(raw) = env_non_empty(ENV_LOCALE_PREFIX) {
            routing.prefix = LocalePrefix::parse(&raw)
                .ok_or_else(|| ConfigError::InvalidLocalePrefix(raw.clone()))?;
        }

        Ok(Self {
            base_url,
            refresh_path,
            login_endpoint,
            timeout,
            credentials,
            auth_codes,
            routing,
        })
    }
}

pub fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyBaseUrl);
    }
    let Some((scheme, remainder)) = trimmed.split_once("://") else {
        return Err(ConfigError::InvalidBaseUrl);
    };
    if !matches!(scheme, "http" | "https") {
        return Err(ConfigError::InvalidBaseUrl);
    }
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(ConfigError::InvalidBaseUrl);
    }
    Ok(trimmed.to_string())
}

fn parse_code(key: &'static str, default: i64) -> Result<i64, ConfigError> {
    match env_non_empty(key) {
        Some(value) => value
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidAuthCode { key, value }),
        None => Ok(default),
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
