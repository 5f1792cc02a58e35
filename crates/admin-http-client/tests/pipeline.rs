use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use admin_http_client::{
    ApiClient, ApiError, ChannelSurface, ClientConfig, Decision, FallbackPrompt, FormData,
    HeadlessSurface, InterstitialEvent, LocaleRouting, MemoryNavigator, NoPrompt, QueryParams,
    RequestDescriptor, SessionCoordination, SessionExpiredNotifier,
};
use anyhow::Result;
use axum::{Json, Router};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, oneshot};

struct Stub {
    base_url: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for Stub {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn spawn_stub(app: Router) -> Result<Stub> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        let _ = server.await;
    });

    Ok(Stub {
        base_url: format!("http://{addr}"),
        shutdown: Some(shutdown_tx),
    })
}

struct Harness {
    client: ApiClient,
    navigator: Arc<MemoryNavigator>,
    events: mpsc::UnboundedReceiver<InterstitialEvent>,
}

fn harness(base_url: &str, location: &str) -> Harness {
    let (surface, events) = ChannelSurface::new();
    let navigator = Arc::new(MemoryNavigator::new(location));
    let session = Arc::new(SessionCoordination::new(
        SessionExpiredNotifier::new(Arc::new(surface), Arc::new(NoPrompt)),
        LocaleRouting::default(),
        navigator.clone(),
    ));
    let client =
        ApiClient::with_session(ClientConfig::new(base_url), session).expect("api client");
    Harness {
        client,
        navigator,
        events,
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<InterstitialEvent>) -> Vec<InterstitialEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn mounted_messages(events: &[InterstitialEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            InterstitialEvent::Mounted { message, .. } => Some(message.clone()),
            InterstitialEvent::Unmounted { .. } => None,
        })
        .collect()
}

#[derive(Clone, Default)]
struct AuthStub {
    profile_calls: Arc<AtomicUsize>,
    refresh_calls: Arc<AtomicUsize>,
    refreshed: Arc<AtomicBool>,
    refresh_status: Arc<Mutex<Option<StatusCode>>>,
    refresh_delay_ms: Arc<AtomicUsize>,
    always_expired: Arc<AtomicBool>,
    authorizations: Arc<Mutex<Vec<Option<String>>>>,
    refresh_cookies: Arc<Mutex<Vec<Option<String>>>>,
}

async fn profile(State(stub): State<AuthStub>, headers: HeaderMap) -> impl IntoResponse {
    stub.profile_calls.fetch_add(1, Ordering::SeqCst);
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    stub.authorizations.lock().await.push(authorization);

    if stub.always_expired.load(Ordering::SeqCst) || !stub.refreshed.load(Ordering::SeqCst) {
        return Json(json!({ "code": 401, "msg": "token expired", "data": null }));
    }
    Json(json!({ "code": 200, "msg": "ok", "data": { "id": 1 } }))
}

async fn refresh(State(stub): State<AuthStub>, headers: HeaderMap) -> impl IntoResponse {
    stub.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    stub.refresh_cookies.lock().await.push(cookie);

    let delay = stub.refresh_delay_ms.load(Ordering::SeqCst) as u64;
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if let Some(status) = *stub.refresh_status.lock().await {
        return (status, Json(json!({ "code": status.as_u16(), "msg": "refresh failed" })));
    }
    stub.refreshed.store(true, Ordering::SeqCst);
    (
        StatusCode::OK,
        Json(json!({ "code": 200, "msg": "ok", "data": { "accessToken": "fresh-token" } })),
    )
}

async fn login() -> impl IntoResponse {
    (
        [(header::SET_COOKIE, "refresh_token=rt-1; Path=/; HttpOnly")],
        Json(json!({ "code": 200, "data": { "accessToken": "first-token" } })),
    )
}

fn auth_router(stub: AuthStub) -> Router {
    Router::new()
        .route("/v1/user/profile", get(profile))
        .route("/v1/auth/refresh", post(refresh))
        .route("/v1/auth/login", post(login))
        .with_state(stub)
}

#[tokio::test]
async fn soft_failure_refreshes_once_and_replays_the_request() -> Result<()> {
    let stub = AuthStub::default();
    let server = spawn_stub(auth_router(stub.clone())).await?;
    let mut harness = harness(&server.base_url, "/system/user");
    harness.client.update_token(Some("stale-token"));

    let profile: Value = harness.client.get("/v1/user/profile").await?;

    assert_eq!(profile, json!({ "id": 1 }));
    assert_eq!(stub.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(stub.profile_calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        *stub.authorizations.lock().await,
        vec![
            Some("Bearer stale-token".to_string()),
            Some("Bearer fresh-token".to_string()),
        ]
    );
    assert_eq!(harness.client.credential().as_deref(), Some("fresh-token"));
    assert!(drain(&mut harness.events).is_empty());
    assert!(!harness.client.session().refresh().is_in_flight());
    Ok(())
}

#[tokio::test]
async fn refresh_call_carries_the_cookie_jar() -> Result<()> {
    let stub = AuthStub::default();
    let server = spawn_stub(auth_router(stub.clone())).await?;
    let harness = harness(&server.base_url, "/system/user");

    let session: Value = harness
        .client
        .post("/v1/auth/login", &json!({ "username": "admin", "password": "admin123" }))
        .await?;
    harness.client.update_token(session["accessToken"].as_str());

    let _: Value = harness.client.get("/v1/user/profile").await?;
    let cookies = stub.refresh_cookies.lock().await.clone();
    assert_eq!(cookies.len(), 1);
    assert!(
        cookies[0]
            .as_deref()
            .is_some_and(|cookie| cookie.contains("refresh_token=rt-1"))
    );
    Ok(())
}

#[tokio::test]
async fn concurrent_soft_failures_share_one_refresh() -> Result<()> {
    let stub = AuthStub::default();
    stub.refresh_delay_ms.store(150, Ordering::SeqCst);
    let server = spawn_stub(auth_router(stub.clone())).await?;
    let mut harness = harness(&server.base_url, "/monitor/server");
    harness.client.update_token(Some("stale-token"));

    let requests = (0..6).map(|_| {
        let client = harness.client.clone();
        async move { client.get::<Value>("/v1/user/profile").await }
    });
    let results = futures::future::join_all(requests).await;

    for result in results {
        assert_eq!(result?, json!({ "id": 1 }));
    }
    assert_eq!(stub.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(stub.profile_calls.load(Ordering::SeqCst) >= 6);
    assert!(drain(&mut harness.events).is_empty());
    Ok(())
}

#[tokio::test]
async fn retried_request_is_never_refreshed_twice() -> Result<()> {
    let stub = AuthStub::default();
    stub.always_expired.store(true, Ordering::SeqCst);
    let server = spawn_stub(auth_router(stub.clone())).await?;
    let mut harness = harness(&server.base_url, "/system/menu");
    harness.client.update_token(Some("stale-token"));

    let error = harness
        .client
        .get::<Value>("/v1/user/profile")
        .await
        .expect_err("session expired");

    assert_eq!(
        error,
        ApiError::SessionExpired {
            message: "token expired".to_string()
        }
    );
    assert_eq!(stub.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(stub.profile_calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.client.credential(), None);
    assert_eq!(
        mounted_messages(&drain(&mut harness.events)),
        vec!["token expired".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn failed_refresh_clears_the_credential_and_prompts_once() -> Result<()> {
    let stub = AuthStub::default();
    *stub.refresh_status.lock().await = Some(StatusCode::INTERNAL_SERVER_ERROR);
    let server = spawn_stub(auth_router(stub.clone())).await?;
    let mut harness = harness(&server.base_url, "/system/user");
    harness.client.update_token(Some("stale-token"));

    let result = harness.client.get::<Value>("/v1/user/profile").await;

    assert!(matches!(result, Err(ApiError::SessionExpired { .. })));
    assert_eq!(harness.client.credential(), None);
    assert_eq!(stub.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(stub.profile_calls.load(Ordering::SeqCst), 1);
    assert_eq!(mounted_messages(&drain(&mut harness.events)).len(), 1);
    Ok(())
}

#[tokio::test]
async fn business_hard_code_on_transport_success_escalates_without_refresh() -> Result<()> {
    let refresh_calls = Arc::new(AtomicUsize::new(0));
    let calls = refresh_calls.clone();
    let app = Router::new()
        .route(
            "/v1/system/dict",
            get(|| async { Json(json!({ "code": 402, "msg": "expired", "data": null })) }),
        )
        .route(
            "/v1/auth/refresh",
            post(move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Json(json!({ "code": 200 }))
                }
            }),
        );
    let server = spawn_stub(app).await?;
    let mut harness = harness(&server.base_url, "/system/dict");
    harness.client.update_token(Some("token"));

    let error = harness
        .client
        .get::<Value>("/v1/system/dict")
        .await
        .expect_err("hard failure");

    assert_eq!(error.message(), "expired");
    assert!(error.is_session_expired());
    assert_eq!(refresh_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.client.credential(), None);
    assert_eq!(
        mounted_messages(&drain(&mut harness.events)),
        vec!["expired".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn skip_auth_refresh_escalates_a_soft_failure_directly() -> Result<()> {
    let stub = AuthStub::default();
    let server = spawn_stub(auth_router(stub.clone())).await?;
    let mut harness = harness(&server.base_url, "/system/user");

    let result = harness
        .client
        .send::<Value>(RequestDescriptor::get("/v1/user/profile").skip_auth_refresh())
        .await;

    assert!(matches!(result, Err(ApiError::SessionExpired { .. })));
    assert_eq!(stub.refresh_calls.load(Ordering::SeqCst), 0);
    assert_eq!(mounted_messages(&drain(&mut harness.events)).len(), 1);
    Ok(())
}

fn hard_failure_router() -> Router {
    Router::new().route(
        "/v1/monitor/cache",
        get(|| async {
            (
                StatusCode::PAYMENT_REQUIRED,
                Json(json!({ "code": 402, "msg": null, "data": null })),
            )
        }),
    )
}

#[tokio::test]
async fn simultaneous_hard_failures_prompt_once_and_redirect_once() -> Result<()> {
    let server = spawn_stub(hard_failure_router()).await?;
    let mut harness = harness(&server.base_url, "/system/user?page=2");

    let (first, second) = tokio::join!(
        harness.client.get::<Value>("/v1/monitor/cache"),
        harness.client.get::<Value>("/v1/monitor/cache"),
    );
    assert!(matches!(first, Err(ApiError::SessionExpired { .. })));
    assert!(matches!(second, Err(ApiError::SessionExpired { .. })));

    let mut events = drain(&mut harness.events);
    assert_eq!(events.len(), 1);
    let Some(InterstitialEvent::Mounted {
        id,
        message,
        responder,
    }) = events.pop()
    else {
        panic!("expected a mounted interstitial");
    };
    assert_eq!(message, "Your session has expired. Please sign in again.");

    responder.send(Decision::Confirm).expect("decision delivered");
    let unmounted = tokio::time::timeout(Duration::from_secs(2), harness.events.recv())
        .await?
        .expect("surface open");
    assert!(matches!(unmounted, InterstitialEvent::Unmounted { id: done } if done == id));
    assert_eq!(
        harness.navigator.navigations(),
        vec!["/login?redirect=%2Fsystem%2Fuser%3Fpage%3D2".to_string()]
    );

    let third = harness.client.get::<Value>("/v1/monitor/cache").await;
    assert!(matches!(third, Err(ApiError::SessionExpired { .. })));
    assert!(drain(&mut harness.events).is_empty());
    assert_eq!(harness.navigator.navigations().len(), 1);
    Ok(())
}

#[tokio::test]
async fn cancelled_prompt_allows_a_later_prompt() -> Result<()> {
    let server = spawn_stub(hard_failure_router()).await?;
    let mut harness = harness(&server.base_url, "/monitor/cache");

    let _ = harness.client.get::<Value>("/v1/monitor/cache").await;
    let Some(InterstitialEvent::Mounted { responder, .. }) = drain(&mut harness.events).pop()
    else {
        panic!("expected a mounted interstitial");
    };
    responder.send(Decision::Cancel).expect("decision delivered");
    let unmounted = tokio::time::timeout(Duration::from_secs(2), harness.events.recv())
        .await?
        .expect("surface open");
    assert!(matches!(unmounted, InterstitialEvent::Unmounted { .. }));
    assert!(!harness.client.session().guard().is_armed());
    assert!(harness.navigator.navigations().is_empty());

    let _ = harness.client.get::<Value>("/v1/monitor/cache").await;
    assert_eq!(mounted_messages(&drain(&mut harness.events)).len(), 1);
    Ok(())
}

#[tokio::test]
async fn hard_failure_on_the_login_route_shows_nothing() -> Result<()> {
    let server = spawn_stub(hard_failure_router()).await?;
    let mut harness = harness(&server.base_url, "/login?redirect=%2Fsystem%2Fuser");
    harness.client.update_token(Some("token"));

    let result = harness.client.get::<Value>("/v1/monitor/cache").await;

    assert!(matches!(result, Err(ApiError::SessionExpired { .. })));
    assert!(drain(&mut harness.events).is_empty());
    assert!(!harness.client.session().guard().is_armed());
    assert_eq!(harness.client.credential(), None);
    Ok(())
}

#[tokio::test]
async fn bare_json_body_is_returned_as_the_payload() -> Result<()> {
    let app = Router::new().route("/v1/health", get(|| async { Json(json!({ "foo": "bar" })) }));
    let server = spawn_stub(app).await?;
    let harness = harness(&server.base_url, "/");

    let body: Value = harness.client.get("/v1/health").await?;
    assert_eq!(body, json!({ "foo": "bar" }));
    Ok(())
}

#[tokio::test]
async fn application_errors_keep_the_credential_and_skip_the_prompt() -> Result<()> {
    let app = Router::new()
        .route(
            "/v1/system/dict",
            post(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "code": 500, "msg": "dictionary type already exists" })),
                )
            }),
        )
        .route(
            "/v1/system/role",
            get(|| async { Json(json!({ "code": 601, "msg": null, "data": null })) }),
        )
        .route(
            "/v1/monitor/server",
            get(|| async {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [(header::CONTENT_TYPE, "text/plain")],
                    "maintenance window",
                )
            }),
        );
    let server = spawn_stub(app).await?;
    let mut harness = harness(&server.base_url, "/system/dict");
    harness.client.update_token(Some("token"));

    let error = harness
        .client
        .post::<Value, _>("/v1/system/dict", &json!({ "dictType": "sys_status" }))
        .await
        .expect_err("application error");
    assert_eq!(
        error,
        ApiError::Application {
            status: 500,
            code: Some(500),
            message: "dictionary type already exists".to_string(),
        }
    );

    let error = harness
        .client
        .get::<Value>("/v1/system/role")
        .await
        .expect_err("business failure");
    assert_eq!(error.message(), "Request failed, please try again later.");

    let error = harness
        .client
        .get::<Value>("/v1/monitor/server")
        .await
        .expect_err("text error");
    assert_eq!(error.message(), "maintenance window");

    assert_eq!(harness.client.credential().as_deref(), Some("token"));
    assert!(drain(&mut harness.events).is_empty());
    Ok(())
}

#[tokio::test]
async fn malformed_json_is_a_decode_error_without_side_effects() -> Result<()> {
    let app = Router::new().route(
        "/v1/system/log",
        get(|| async { ([(header::CONTENT_TYPE, "application/json")], "{\"code\": 40") }),
    );
    let server = spawn_stub(app).await?;
    let mut harness = harness(&server.base_url, "/system/log");
    harness.client.update_token(Some("token"));

    let error = harness
        .client
        .get::<Value>("/v1/system/log")
        .await
        .expect_err("decode error");
    assert!(matches!(error, ApiError::Decode { .. }));
    assert_eq!(harness.client.credential().as_deref(), Some("token"));
    assert!(drain(&mut harness.events).is_empty());
    Ok(())
}

#[tokio::test]
async fn query_params_and_default_headers_reach_the_server() -> Result<()> {
    let app = Router::new().route(
        "/v1/system/log",
        get(
            |headers: HeaderMap, Query(params): Query<HashMap<String, String>>| async move {
                let header_value = |name: header::HeaderName| {
                    headers
                        .get(name)
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string)
                };
                Json(json!({
                    "code": 200,
                    "data": {
                        "params": params,
                        "language": header_value(header::ACCEPT_LANGUAGE),
                        "authorization": header_value(header::AUTHORIZATION),
                        "hasRequestId": headers.contains_key("x-request-id"),
                        "contentType": header_value(header::CONTENT_TYPE),
                    }
                }))
            },
        ),
    );
    let server = spawn_stub(app).await?;
    let harness = harness(&server.base_url, "/system/log");
    harness.client.update_token(Some("token"));
    harness.client.update_locale(Some("zh-CN"));

    let mut params = QueryParams::new();
    params.insert("page".to_string(), 2_i64.into());
    params.insert("keyword".to_string(), "login".into());
    params.insert("failedOnly".to_string(), true.into());
    let echo: Value = harness.client.get_with("/v1/system/log", params).await?;

    assert_eq!(
        echo,
        json!({
            "params": { "page": "2", "keyword": "login", "failedOnly": "true" },
            "language": "zh-CN",
            "authorization": "Bearer token",
            "hasRequestId": true,
            "contentType": null,
        })
    );
    Ok(())
}

#[tokio::test]
async fn uploads_are_sent_as_multipart() -> Result<()> {
    let app = Router::new().route(
        "/v1/common/upload",
        post(|headers: HeaderMap, body: axum::body::Bytes| async move {
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let text = String::from_utf8_lossy(&body).to_string();
            Json(json!({
                "code": 200,
                "data": {
                    "multipart": content_type.starts_with("multipart/form-data"),
                    "hasFile": text.contains("filename=\"avatar.png\""),
                    "hasFolder": text.contains("avatars"),
                }
            }))
        }),
    );
    let server = spawn_stub(app).await?;
    let harness = harness(&server.base_url, "/system/user/profile");

    let form = FormData::new().text("folder", "avatars").file(
        "file",
        b"\x89PNG".to_vec(),
        Some("avatar.png".to_string()),
        Some("image/png".to_string()),
    );
    let result: Value = harness.client.upload("/v1/common/upload", form).await?;

    assert_eq!(
        result,
        json!({ "multipart": true, "hasFile": true, "hasFolder": true })
    );
    Ok(())
}

#[tokio::test]
async fn downloads_return_raw_bytes() -> Result<()> {
    let app = Router::new().route(
        "/v1/system/user/export",
        get(|| async {
            (
                [(header::CONTENT_TYPE, "application/vnd.ms-excel")],
                vec![0x50_u8, 0x4b, 0x03, 0x04],
            )
        }),
    );
    let server = spawn_stub(app).await?;
    let harness = harness(&server.base_url, "/system/user");

    let bytes = harness.client.download("/v1/system/user/export").await?;
    assert_eq!(bytes, vec![0x50, 0x4b, 0x03, 0x04]);
    Ok(())
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    let mut harness = harness(&format!("http://{addr}"), "/system/user");
    harness.client.update_token(Some("token"));

    let error = harness
        .client
        .get::<Value>("/v1/user/profile")
        .await
        .expect_err("network error");
    assert!(matches!(error, ApiError::Network { .. }));
    assert_eq!(harness.client.credential().as_deref(), Some("token"));
    assert!(drain(&mut harness.events).is_empty());
    Ok(())
}

struct GatedPrompt {
    answer: std::sync::Mutex<std::sync::mpsc::Receiver<bool>>,
}

impl FallbackPrompt for GatedPrompt {
    fn confirm(&self, _message: &str) -> Option<bool> {
        let answer = self
            .answer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        answer.recv_timeout(Duration::from_secs(5)).ok()
    }
}

#[tokio::test]
async fn fallback_prompt_does_not_hold_up_the_error() -> Result<()> {
    let app = Router::new().route(
        "/v1/system/config",
        get(|| async { Json(json!({ "code": 402, "msg": "expired", "data": null })) }),
    );
    let server = spawn_stub(app).await?;
    let (answer, gate) = std::sync::mpsc::channel();
    let navigator = Arc::new(MemoryNavigator::new("/system/config"));
    let session = Arc::new(SessionCoordination::new(
        SessionExpiredNotifier::new(
            Arc::new(HeadlessSurface),
            Arc::new(GatedPrompt {
                answer: std::sync::Mutex::new(gate),
            }),
        ),
        LocaleRouting::default(),
        navigator.clone(),
    ));
    let client = ApiClient::with_session(ClientConfig::new(&server.base_url), session)?;

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        client.get::<Value>("/v1/system/config"),
    )
    .await?;

    assert_eq!(
        result,
        Err(ApiError::SessionExpired {
            message: "expired".to_string()
        })
    );
    assert!(navigator.navigations().is_empty());
    assert!(client.session().notifier().active_id().is_some());

    answer.send(true)?;
    tokio::time::timeout(
        Duration::from_secs(2),
        client.session().notifier().wait_idle(),
    )
    .await?;
    assert_eq!(
        navigator.navigations(),
        vec!["/login?redirect=%2Fsystem%2Fconfig".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn bodiless_writes_carry_no_content_type() -> Result<()> {
    let app = Router::new().route(
        "/v1/system/cache/refresh",
        post(|headers: HeaderMap, body: axum::body::Bytes| async move {
            Json(json!({
                "code": 200,
                "data": {
                    "contentType": headers
                        .get(header::CONTENT_TYPE)
                        .and_then(|value| value.to_str().ok()),
                    "length": body.len(),
                }
            }))
        }),
    );
    let server = spawn_stub(app).await?;
    let harness = harness(&server.base_url, "/monitor/cache");

    let echo: Value = harness
        .client
        .send(RequestDescriptor::post("/v1/system/cache/refresh"))
        .await?;
    assert_eq!(echo, json!({ "contentType": null, "length": 0 }));
    Ok(())
}
