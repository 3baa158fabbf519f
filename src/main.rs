mod amo;
mod calendar;
mod http;
mod imagegen;
mod jobs;
mod metrics;
mod models;
mod pipeline;
mod registry;
mod store;
mod webhook;

use amo::{AmoClient, AmoConfig, AmoSession, CrmError};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use calendar::{DeadlineCalculator, IsDayOffClient};
use imagegen::{ImageProxyClient, ImageProxyConfig};
use jobs::{LeadJob, LeadQueue};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, OrderProjection, TokenPair};
use pipeline::Pipeline;
use registry::{RegistryClient, RegistryConfig};
use serde_json::{Value, json};
use sqlx::postgres::PgPoolOptions;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use store::{OrderStore, PgStore};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

type Crm = AmoClient<PgStore>;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "permit.api", "server crashed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(db_pool_size_from_env())
        .connect(&database_url)
        .await?;
    let store = Arc::new(PgStore::new(pool));
    store.run_migrations().await?;

    // Without CRM credentials the read-only surface still serves; the
    // webhook acknowledges but cannot process.
    let crm = match AmoConfig::from_env() {
        Ok(config) => Some(Arc::new(AmoClient::new(AmoSession::new(
            config,
            store.clone(),
        )))),
        Err(err) => {
            warn!(target = "permit.api", "CRM disabled: {err}");
            None
        }
    };

    let queue = crm.as_ref().map(|crm| {
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            crm.clone(),
            DeadlineCalculator::new(IsDayOffClient::from_env()),
            RegistryConfig::from_env().map(RegistryClient::new),
            ImageProxyConfig::from_env().map(ImageProxyClient::new),
            track_base_from_env(),
        ));
        let (queue, _worker) = LeadQueue::spawn(pipeline);
        queue
    });

    let state = AppState {
        store,
        crm,
        queue,
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/webhook/amo", post(amo_webhook))
        .route("/auth/amo/callback", get(amo_callback))
        .route("/api/amo/status", get(amo_status))
        .route("/track/{slug}", get(track_order))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "permit.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    store: Arc<PgStore>,
    crm: Option<Arc<Crm>>,
    queue: Option<LeadQueue>,
    prometheus_handle: PrometheusHandle,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "permit-track-rs",
    }))
}

/// AmoCRM webhook receiver.
///
/// - Method: `POST`
/// - Path: `/webhook/amo`
/// - Body: JSON, urlencoded or multipart lead events
///
/// Always answers 200 so the CRM never enters its retry loop; parse
/// failures and internal problems surface in the body instead.
async fn amo_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Json<Value> {
    crate::metrics::inc_requests("/webhook/amo");
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let body = String::from_utf8_lossy(&body);

    if body.trim().is_empty() {
        return Json(json!({ "message": "Empty payload" }));
    }
    if content_type.starts_with("application/json")
        && serde_json::from_str::<Value>(&body).is_err()
    {
        return Json(json!({ "message": "Invalid payload" }));
    }

    let event = webhook::parse_webhook(content_type, &body);
    if event.is_empty() {
        return Json(json!({ "message": "No leads in payload" }));
    }

    let Some(queue) = &state.queue else {
        warn!(target = "permit.api", "webhook received but CRM is not configured");
        return Json(json!({
            "message": "Webhook accepted",
            "error": "processing disabled: CRM credentials are not configured",
        }));
    };

    for lead_id in &event.lead_ids {
        queue.enqueue(LeadJob {
            lead_id: *lead_id,
            status_change: event.status_change_for(*lead_id),
        });
    }

    Json(json!({
        "message": "Webhook accepted",
        "leadIds": event.lead_ids,
    }))
}

/// One-time OAuth code exchange. The pair is returned in the body for
/// operator configuration and is not persisted here.
async fn amo_callback(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<TokenPair>, AppError> {
    crate::metrics::inc_requests("/auth/amo/callback");
    if let Some(err) = params.get("error") {
        let detail = params.get("error_description").cloned();
        return Err(AppError::bad_request(format!("authorization denied: {err}"), detail));
    }
    let Some(code) = params.get("code").filter(|code| !code.trim().is_empty()) else {
        return Err(AppError::bad_request("missing code parameter", None));
    };
    let Some(crm) = &state.crm else {
        return Err(AppError::from(CrmError::MissingCredentials));
    };
    let pair = crm.session().exchange_code(code).await?;
    Ok(Json(pair))
}

/// Connectivity diagnostic: exercises an authorized account fetch and
/// maps the failure classes to distinguishable responses.
async fn amo_status(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/api/amo/status");
    let Some(crm) = &state.crm else {
        return Err(AppError::from(CrmError::MissingCredentials));
    };
    let account = crm.account().await?;
    Ok(Json(json!({
        "status": "ok",
        "account": account.map(|account| {
            json!({
                "id": account.id,
                "name": account.name,
                "subdomain": account.subdomain,
            })
        }),
    })))
}

/// Public read-only projection for the tracking page.
async fn track_order(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<OrderProjection>, AppError> {
    crate::metrics::inc_requests("/track");
    match state.store.get_by_slug(&slug).await {
        Ok(Some(order)) => Ok(Json(order)),
        Ok(None) => Err(AppError::not_found("order not found")),
        Err(err) => {
            error!(target = "permit.api", error = %err, "track lookup failed");
            Err(AppError::internal("storage failure"))
        }
    }
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    body: ApiError,
}

impl AppError {
    fn bad_request(error: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ApiError {
                error: error.into(),
                detail,
            },
        }
    }

    fn not_found(error: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ApiError {
                error: error.into(),
                detail: None,
            },
        }
    }

    fn internal(error: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ApiError {
                error: error.into(),
                detail: None,
            },
        }
    }
}

impl From<CrmError> for AppError {
    fn from(err: CrmError) -> Self {
        let status = match err {
            CrmError::MissingCredentials | CrmError::TokensNotFound => StatusCode::BAD_REQUEST,
            CrmError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ApiError {
                error: err.to_string(),
                detail: None,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

fn db_pool_size_from_env() -> u32 {
    std::env::var("DB_POOL_SIZE")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(5)
}

fn track_base_from_env() -> String {
    std::env::var("TRACKING_BASE_URL").unwrap_or_else(|_| "http://localhost:8000/track".into())
}
