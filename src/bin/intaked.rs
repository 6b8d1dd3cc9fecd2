//! intaked: HTTP front end for the submission gateway.
//!
//! - `GET  /health`: server status
//! - `POST /submissions`: submit a survey (JSON object or urlencoded form)
//! - `POST /steps/{index}`: validate one section of a multi-step form
//! - `GET  /admin/violations`, `GET /admin/blocks`, `POST /admin/unblock`,
//!   `POST /admin/purge`: abuse-guard administration, enabled by
//!   `admin_token` and authorised with `Authorization: Bearer <token>`
//!
//! The server owns the durable store while it runs, so operators go through
//! the admin routes rather than the `intake` CLI. A background task purges
//! expired attempts and blocks every `purge_interval_minutes`.
//!
//! Build and run: `cargo run --features server --bin intaked`

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use miette::{IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tower_http::cors::{AllowOrigin, CorsLayer};

use intake_gateway::config::GatewayConfig;
use intake_gateway::error::GatewayError;
use intake_gateway::gateway::{RequestContext, SubmissionGateway};
use intake_gateway::guard::{AbuseMonitor, ClientIdentity, PurgeReport, RequestOrigin};
use intake_gateway::paths::IntakePaths;
use intake_gateway::store::StoreResult;
use intake_gateway::survey::{RawForm, Survey};

const CSRF_COOKIE: &str = "intake_csrf";
const EMBED_ORIGIN_HEADER: &str = "x-embed-origin";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const MAX_BODY_BYTES: usize = 256 * 1024;

struct AppState {
    gateway: SubmissionGateway,
    monitor: AbuseMonitor,
    config: GatewayConfig,
}

impl AppState {
    fn new(gateway: SubmissionGateway, config: GatewayConfig) -> Self {
        let monitor = AbuseMonitor::new(Arc::clone(gateway.store()));
        Self {
            gateway,
            monitor,
            config,
        }
    }

    /// The survey's rate-limit window; attempts older than this never count.
    fn attempt_window(&self) -> Duration {
        Duration::minutes(i64::from(
            self.gateway.survey().security().rate_limit_window_minutes,
        ))
    }

    fn purge(&self, window: Option<Duration>) -> StoreResult<PurgeReport> {
        let window = window.unwrap_or_else(|| self.attempt_window());
        self.monitor.purge_expired(Utc::now(), window)
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    survey: String,
    submissions: Option<usize>,
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        success: false,
        error: message.into(),
    };
    (status, Json(body)).into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let submissions = state.gateway.store().submission_count().ok();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        survey: state.gateway.survey().id().to_string(),
        submissions,
    })
}

/// Decode a JSON object or urlencoded body into a raw form.
fn parse_form(headers: &HeaderMap, body: &[u8]) -> Result<RawForm, Response> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));

    if is_json {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")))?;
        RawForm::from_json(&value)
            .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "body must be a JSON object"))
    } else {
        Ok(RawForm::from_pairs(url::form_urlencoded::parse(body)))
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: impl header::AsHeaderName) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == CSRF_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

fn request_context(config: &GatewayConfig, peer: SocketAddr, headers: &HeaderMap) -> RequestContext {
    let forwarded = config
        .trust_forwarded_for
        .then(|| header_str(headers, FORWARDED_FOR_HEADER))
        .flatten()
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let identifier = forwarded
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string());

    RequestContext {
        client: ClientIdentity::new(identifier, header_str(headers, header::USER_AGENT)),
        origin: RequestOrigin {
            origin: header_str(headers, header::ORIGIN).map(str::to_string),
            referer: header_str(headers, header::REFERER).map(str::to_string),
            embed_origin: header_str(headers, EMBED_ORIGIN_HEADER).map(str::to_string),
        },
        session_token: session_token(headers),
    }
}

async fn submit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let form = match parse_form(&headers, &body) {
        Ok(form) => form,
        Err(rejection) => return rejection,
    };
    let context = request_context(&state.config, peer, &headers);

    let worker = Arc::clone(&state);
    let response =
        match tokio::task::spawn_blocking(move || worker.gateway.submit(&context, form)).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "submission task failed");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        };

    let status =
        StatusCode::from_u16(response.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = (status, Json(&response)).into_response();
    if let Some(secs) = response.retry_after {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            out.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    out
}

async fn validate_step(
    State(state): State<Arc<AppState>>,
    Path(index): Path<usize>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let form = match parse_form(&headers, &body) {
        Ok(form) => form,
        Err(rejection) => return rejection,
    };

    let worker = Arc::clone(&state);
    match tokio::task::spawn_blocking(move || worker.gateway.validate_step(&form, index)).await {
        Ok(Ok(outcome)) => Json(outcome).into_response(),
        Ok(Err(e @ GatewayError::NoSuchSection { .. })) => {
            error_response(StatusCode::NOT_FOUND, e.to_string())
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "step validation failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
        Err(e) => {
            tracing::error!(error = %e, "step validation task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

// ---------------------------------------------------------------------------
// Admin routes
// ---------------------------------------------------------------------------

fn default_violation_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
struct ViolationsQuery {
    since_hours: Option<i64>,
    #[serde(default = "default_violation_limit")]
    limit: usize,
    #[serde(default)]
    summary: bool,
}

#[derive(Debug, Deserialize)]
struct UnblockRequest {
    identifier: String,
    user_agent: String,
}

#[derive(Debug, Default, Deserialize)]
struct PurgeRequest {
    window_minutes: Option<i64>,
}

/// Admin routes answer 404 while no token is configured, 401 on a wrong one.
fn require_admin(config: &GatewayConfig, headers: &HeaderMap) -> Result<(), Response> {
    if !config.admin_enabled() {
        return Err(error_response(StatusCode::NOT_FOUND, "not found"));
    }
    let presented = header_str(headers, header::AUTHORIZATION)
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(token) if config.admin_token_matches(token) => Ok(()),
        _ => {
            tracing::warn!(target: "intake::security", "admin request rejected");
            Err(error_response(StatusCode::UNAUTHORIZED, "invalid admin token"))
        }
    }
}

/// Run a monitor operation off the async workers.
async fn admin_call<T, F>(state: &Arc<AppState>, op: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce(&AppState) -> StoreResult<T> + Send + 'static,
{
    let worker = Arc::clone(state);
    match tokio::task::spawn_blocking(move || op(&worker)).await {
        Ok(Ok(value)) => Json(value).into_response(),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "admin operation failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "store error")
        }
        Err(e) => {
            tracing::error!(error = %e, "admin task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn admin_violations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ViolationsQuery>,
) -> Response {
    if let Err(rejection) = require_admin(&state.config, &headers) {
        return rejection;
    }
    let since = query.since_hours.map(|h| Utc::now() - Duration::hours(h));
    if query.summary {
        admin_call(&state, move |s| s.monitor.summary(since, query.limit)).await
    } else {
        admin_call(&state, move |s| s.monitor.recent_violations(since, query.limit)).await
    }
}

async fn admin_blocks(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(rejection) = require_admin(&state.config, &headers) {
        return rejection;
    }
    admin_call(&state, |s| s.monitor.active_blocks(Utc::now())).await
}

async fn admin_unblock(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<UnblockRequest>,
) -> Response {
    if let Err(rejection) = require_admin(&state.config, &headers) {
        return rejection;
    }
    admin_call(&state, move |s| {
        let removed = s.monitor.unblock(&request.identifier, &request.user_agent)?;
        Ok(serde_json::json!({ "removed": removed }))
    })
    .await
}

async fn admin_purge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(rejection) = require_admin(&state.config, &headers) {
        return rejection;
    }
    let request: PurgeRequest = if body.is_empty() {
        PurgeRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}"));
            }
        }
    };
    let window = request.window_minutes.map(Duration::minutes);
    admin_call(&state, move |s| s.purge(window)).await
}

/// Purge expired rate-limit state on a fixed interval.
fn spawn_purge_task(state: Arc<AppState>) {
    let minutes = state.config.purge_interval_minutes;
    if minutes == 0 {
        tracing::info!("periodic purge disabled");
        return;
    }
    let period = std::time::Duration::from_secs(minutes.saturating_mul(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let worker = Arc::clone(&state);
            match tokio::task::spawn_blocking(move || worker.purge(None)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "periodic purge failed"),
                Err(e) => tracing::error!(error = %e, "periodic purge task failed"),
            }
        }
    });
}

/// CORS for the survey's allowed origins only.
fn cors_layer(gateway: &SubmissionGateway) -> CorsLayer {
    let guard = gateway.forgery_guard().clone();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin.to_str().is_ok_and(|o| guard.origin_allowed(o))
        }))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(EMBED_ORIGIN_HEADER)])
        .allow_credentials(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let resolved = IntakePaths::resolve()?;
    let config = GatewayConfig::load_or_default(&resolved.config_file())?.with_env()?;
    let paths = config.paths(resolved);
    paths.ensure_dirs()?;

    let survey = Survey::load(&config.survey_file(&paths))?;
    let store = config.open_store(&paths)?;
    let gateway = SubmissionGateway::new(survey, store);
    let cors = cors_layer(&gateway);
    let addr = config.addr();

    if !config.admin_enabled() {
        tracing::info!("admin routes disabled: no admin_token configured");
    }
    let state = Arc::new(AppState::new(gateway, config));
    spawn_purge_task(Arc::clone(&state));

    let app = Router::new()
        .route("/health", get(health))
        .route("/submissions", post(submit))
        .route("/steps/{index}", post(validate_step))
        .route("/admin/violations", get(admin_violations))
        .route("/admin/blocks", get(admin_blocks))
        .route("/admin/unblock", post(admin_unblock))
        .route("/admin/purge", post(admin_purge))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state);

    tracing::info!("intaked listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await.into_diagnostic()?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {},
                        _ = sigterm.recv() => {},
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
        tracing::info!("intaked shutting down");
    })
    .await
    .into_diagnostic()?;

    Ok(())
}
