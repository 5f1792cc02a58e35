//! The request pipeline: build, dispatch, decode, classify, then succeed,
//! refresh-and-retry, escalate or fail.

use std::sync::{Arc, RwLock};

use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue,
};
use reqwest::Url;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::classify::{Outcome, classify};
use crate::config::{ClientConfig, ConfigError, normalize_base_url};
use crate::envelope::{Payload, ResponseEnvelope, decode_response};
use crate::error::{ApiError, DEFAULT_APPLICATION_ERROR_MESSAGE, DEFAULT_SESSION_EXPIRED_MESSAGE};
use crate::notifier::SessionExpiredNotifier;
use crate::request::{Attempt, CredentialsMode, FormData, QueryParams, RequestBody, RequestDescriptor};
use crate::session::{MemoryNavigator, SessionCoordination};

const REQUEST_ID_HEADER: &str = "x-request-id";
const REFRESHED_TOKEN_FIELDS: [&str; 2] = ["accessToken", "token"];

/// Cheap-to-clone handle on the request pipeline.
///
/// All clones share default headers (and so the bearer credential) and the
/// session coordination state.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    base: Url,
    with_cookies: reqwest::Client,
    without_cookies: reqwest::Client,
    default_headers: RwLock<HeaderMap>,
    session: Arc<SessionCoordination>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.config.base_url)
            .field("session", &self.inner.session)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Client with its own headless session coordination.
    ///
    /// Refresh single-flight, the interstitial and the redirect guard are
    /// only shared between clones of this client. Clients that must share
    /// them with other clients are built with [`ApiClient::with_session`]
    /// on one `Arc<SessionCoordination>`.
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let session = Arc::new(SessionCoordination::new(
            SessionExpiredNotifier::default(),
            config.routing.clone(),
            Arc::new(MemoryNavigator::new("/")),
        ));
        Self::with_session(config, session)
    }

    pub fn with_session(
        mut config: ClientConfig,
        session: Arc<SessionCoordination>,
    ) -> Result<Self, ApiError> {
        config.base_url = normalize_base_url(&config.base_url)?;
        let base = Url::parse(&config.base_url)
            .map_err(|_| ApiError::Config(ConfigError::InvalidBaseUrl))?;
        let with_cookies = build_http(true)?;
        let without_cookies = build_http(false)?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                base,
                with_cookies,
                without_cookies,
                default_headers: RwLock::new(default_headers),
                session,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionCoordination> {
        &self.inner.session
    }

    /// Set or clear the bearer credential sent on subsequent requests.
    pub fn update_token(&self, token: Option<&str>) {
        self.set_default_header(
            AUTHORIZATION,
            token
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(|token| format!("Bearer {token}")),
        );
    }

    /// Set or clear the `Accept-Language` header.
    pub fn update_locale(&self, locale: Option<&str>) {
        self.set_default_header(
            ACCEPT_LANGUAGE,
            locale
                .map(str::trim)
                .filter(|locale| !locale.is_empty())
                .map(str::to_string),
        );
    }

    /// Current bearer credential, if any.
    #[must_use]
    pub fn credential(&self) -> Option<String> {
        let headers = self.read_headers();
        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_string)
    }

    fn set_default_header(&self, name: HeaderName, value: Option<String>) {
        let mut headers = self
            .inner
            .default_headers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match value.and_then(|value| HeaderValue::from_str(&value).ok()) {
            Some(value) => {
                headers.insert(name, value);
            }
            None => {
                headers.remove(name);
            }
        }
    }

    fn read_headers(&self) -> HeaderMap {
        self.inner
            .default_headers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Some(trimmed.to_string());
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.inner.config.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.inner.config.base_url, trimmed))
        }
    }

    pub async fn get<T>(&self, path: &str) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        self.send(RequestDescriptor::get(path)).await
    }

    pub async fn get_with<T>(&self, path: &str, params: QueryParams) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        self.send(RequestDescriptor::get(path).with_query(params))
            .await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(RequestDescriptor::post(path).json(body)?).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(RequestDescriptor::put(path).json(body)?).await
    }

    pub async fn patch<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(RequestDescriptor::patch(path).json(body)?).await
    }

    pub async fn delete<T>(&self, path: &str) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        self.send(RequestDescriptor::delete(path)).await
    }

    pub async fn upload<T>(&self, path: &str, form: FormData) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        self.send(RequestDescriptor::post(path).form(form)).await
    }

    /// Raw bytes of a successful response, for exports and file downloads.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>, ApiError> {
        self.send_raw(RequestDescriptor::get(path))
            .await
            .map(Payload::into_bytes)
    }

    pub async fn send<T>(&self, request: RequestDescriptor) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        self.send_raw(request).await?.deserialize()
    }

    /// Run a request through the full pipeline and return the unwrapped payload.
    pub async fn send_raw(&self, request: RequestDescriptor) -> Result<Payload, ApiError> {
        let mut request = request;
        loop {
            let envelope = self.dispatch(&request).await?;
            let outcome = classify(&envelope, &self.inner.config.auth_codes);
            tracing::debug!(
                path = %request.path,
                method = %request.method,
                status = ?envelope.status,
                code = ?envelope.code,
                outcome = outcome.as_str(),
                "classified response"
            );

            match outcome {
                Outcome::Success => return Ok(envelope.data),
                Outcome::ApplicationError => return Err(application_error(envelope)),
                Outcome::SoftAuthFailure if self.may_refresh(&request) => {
                    if self.refresh_session().await {
                        tracing::debug!(path = %request.path, "retrying after session refresh");
                        request = request.retried();
                        continue;
                    }
                    return Err(self.escalate(&request, envelope.msg));
                }
                Outcome::SoftAuthFailure | Outcome::HardAuthFailure => {
                    return Err(self.escalate(&request, envelope.msg));
                }
            }
        }
    }

    fn may_refresh(&self, request: &RequestDescriptor) -> bool {
        request.attempt == Attempt::Initial && !self.is_auth_endpoint(&request.path)
    }

    fn is_auth_endpoint(&self, path: &str) -> bool {
        let path = strip_query(path);
        let config = &self.inner.config;
        [config.refresh_path.as_str(), config.login_endpoint.as_str()]
            .iter()
            .any(|endpoint| {
                let endpoint = strip_query(endpoint);
                path == endpoint
                    || self
                        .endpoint(endpoint)
                        .is_some_and(|absolute| path == absolute)
            })
    }

    /// Clear the credential and hand the expiry to the session coordination.
    /// Never waits for the user's answer.
    fn escalate(&self, request: &RequestDescriptor, server_message: Option<String>) -> ApiError {
        let message = server_message
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SESSION_EXPIRED_MESSAGE.to_string());
        tracing::warn!(path = %request.path, %message, "session expired");
        self.update_token(None);
        self.inner.session.report_session_expired(&message);
        ApiError::SessionExpired { message }
    }

    async fn refresh_session(&self) -> bool {
        let client = self.clone();
        self.inner
            .session
            .refresh()
            .refresh(move || async move { client.renew().await })
            .await
    }

    /// Call the renewal endpoint directly; its response is never classified
    /// through `send_raw`, so it cannot recurse into another refresh.
    async fn renew(&self) -> bool {
        let config = &self.inner.config;
        let mut request = RequestDescriptor::post(config.refresh_path.clone())
            .credentials(CredentialsMode::Include)
            .skip_auth_refresh();
        request.body = Some(RequestBody::Json(json!({})));

        let envelope = match self.dispatch(&request).await {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(%error, "session refresh request failed");
                return false;
            }
        };
        let transport_ok = envelope.ok == Some(true);
        let business_ok = envelope
            .code
            .is_none_or(|code| code == config.auth_codes.success);
        if !(transport_ok && business_ok) {
            tracing::warn!(
                status = ?envelope.status,
                code = ?envelope.code,
                "session refresh rejected"
            );
            return false;
        }

        if let Payload::Json(Value::Object(data)) = &envelope.data {
            let token = REFRESHED_TOKEN_FIELDS
                .iter()
                .find_map(|field| data.get(*field).and_then(Value::as_str));
            if let Some(token) = token {
                self.update_token(Some(token));
            }
        }
        tracing::info!("session refreshed");
        true
    }

    async fn dispatch(&self, request: &RequestDescriptor) -> Result<ResponseEnvelope, ApiError> {
        let url = self
            .endpoint(&request.path)
            .ok_or(ApiError::InvalidPath)?;
        let url = Url::parse(&url).map_err(|_| ApiError::InvalidPath)?;
        let credentials = request
            .credentials
            .unwrap_or(self.inner.config.credentials);
        let http = if self.sends_cookies(credentials, &url) {
            &self.inner.with_cookies
        } else {
            &self.inner.without_cookies
        };

        let mut headers = self.read_headers();
        headers.extend(request.headers.clone());
        let request_id = format!("req_{}", Uuid::new_v4().simple());
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }

        let mut builder = http.request(request.method.clone(), url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query_pairs());
        }
        match &request.body {
            Some(RequestBody::Json(value)) => {
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                let body = serde_json::to_vec(value).map_err(|error| ApiError::InvalidBody {
                    message: format!("failed to serialize request body: {error}"),
                })?;
                builder = builder.body(body);
            }
            Some(RequestBody::Form(form)) => {
                headers.remove(CONTENT_TYPE);
                builder = builder.multipart(form.to_multipart()?);
            }
            None => {
                headers.remove(CONTENT_TYPE);
            }
        }
        builder = builder.headers(headers);
        if let Some(timeout) = request.timeout.or(self.inner.config.timeout) {
            builder = builder.timeout(timeout);
        }

        tracing::debug!(
            path = %request.path,
            method = %request.method,
            request_id = %request_id,
            attempt = ?request.attempt,
            "dispatching request"
        );
        let response = builder.send().await.map_err(|error| {
            tracing::warn!(path = %request.path, %error, "transport error");
            ApiError::network(&error)
        })?;
        decode_response(response).await
    }

    fn sends_cookies(&self, credentials: CredentialsMode, url: &Url) -> bool {
        match credentials {
            CredentialsMode::Include => true,
            CredentialsMode::Omit => false,
            CredentialsMode::SameOrigin => url.origin() == self.inner.base.origin(),
        }
    }
}

fn build_http(cookie_store: bool) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .cookie_store(cookie_store)
        .build()
        .map_err(|error| ConfigError::HttpClient(error.to_string()))
}

fn application_error(envelope: ResponseEnvelope) -> ApiError {
    let message = envelope
        .msg
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_APPLICATION_ERROR_MESSAGE.to_string());
    ApiError::Application {
        status: envelope.status.unwrap_or_default(),
        code: envelope.code,
        message,
    }
}

fn strip_query(path: &str) -> &str {
    path.split(['?', '#']).next().unwrap_or(path)
}
