use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::config::{is_valid_id, MonitorConfig};
use crate::downsample::Strategy;
use crate::engine::StatusService;
use crate::error::{StoreError, ValidationError};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;
const MAX_BUCKETS: usize = 365;

pub enum ApiError {
    Validation(ValidationError),
    NotFound(String),
    Store(StoreError),
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::Validation(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(err) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid request", "violations": err.violations })),
            )
                .into_response(),
            ApiError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("unknown monitor '{}'", id) })),
            )
                .into_response(),
            ApiError::Store(err) => {
                error!("Request failed: {}", err);
                let status = match err {
                    StoreError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, Json(json!({ "error": err.to_string() }))).into_response()
            }
        }
    }
}

/// Raw query values; parsed by hand so every bad field is reported at once.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    limit: Option<String>,
    offset: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UptimeQuery {
    buckets: Option<String>,
    strategy: Option<String>,
}

pub fn parse_page(query: &PageQuery) -> Result<(usize, usize), ValidationError> {
    let mut err = ValidationError::default();

    let limit = match query.limit.as_deref() {
        None => DEFAULT_LIMIT,
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) if (1..=MAX_LIMIT).contains(&n) => n,
            _ => {
                err.push("limit", format!("must be an integer between 1 and {}", MAX_LIMIT));
                DEFAULT_LIMIT
            }
        },
    };

    let offset = match query.offset.as_deref() {
        None => 0,
        Some(raw) => raw.parse::<usize>().unwrap_or_else(|_| {
            err.push("offset", "must be a non-negative integer");
            0
        }),
    };

    err.into_result((limit, offset))
}

pub fn parse_uptime(query: &UptimeQuery, default_buckets: usize, default_strategy: Strategy) -> Result<(usize, Strategy), ValidationError> {
    let mut err = ValidationError::default();

    let buckets = match query.buckets.as_deref() {
        None => default_buckets,
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) if (1..=MAX_BUCKETS).contains(&n) => n,
            _ => {
                err.push("buckets", format!("must be an integer between 1 and {}", MAX_BUCKETS));
                default_buckets
            }
        },
    };

    let strategy = match query.strategy.as_deref() {
        None => default_strategy,
        Some(raw) => raw.parse::<Strategy>().unwrap_or_else(|message| {
            err.push("strategy", message);
            default_strategy
        }),
    };

    err.into_result((buckets, strategy))
}

fn lookup<'a>(service: &'a StatusService, monitor_id: &str) -> Result<&'a MonitorConfig, ApiError> {
    if !is_valid_id(monitor_id) {
        let mut err = ValidationError::default();
        err.push("monitorId", "must be 1-64 characters of letters, digits, '-' or '_'");
        return Err(err.into());
    }
    service
        .monitor(monitor_id)
        .ok_or_else(|| ApiError::NotFound(monitor_id.to_string()))
}

pub async fn get_status(State(service): State<Arc<StatusService>>) -> impl IntoResponse {
    let snapshot = service.current_status().await;
    ([(header::CACHE_CONTROL, service.cache_control())], Json(snapshot))
}

pub async fn get_all_history(
    State(service): State<Arc<StatusService>>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (limit, offset) = parse_page(&query)?;
    let feed = service.all_history(limit, offset).await?;
    Ok(([(header::CACHE_CONTROL, service.cache_control())], Json(feed.as_ref().clone())))
}

pub async fn get_history(
    State(service): State<Arc<StatusService>>,
    Path(monitor_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let pagination = parse_page(&query);
    let monitor = lookup(&service, &monitor_id);
    let (monitor, (limit, offset)) = match (monitor, pagination) {
        (Ok(monitor), Ok(page)) => (monitor, page),
        (Err(ApiError::Validation(mut id_err)), Err(page_err)) => {
            id_err.violations.extend(page_err.violations);
            return Err(id_err.into());
        }
        (Err(e), _) => return Err(e),
        (_, Err(e)) => return Err(e.into()),
    };

    let history = service.monitor_history(monitor, limit, offset).await?;
    Ok(([(header::CACHE_CONTROL, service.cache_control())], Json(history)))
}

pub async fn get_uptime(
    State(service): State<Arc<StatusService>>,
    Path(monitor_id): Path<String>,
    Query(query): Query<UptimeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let monitor = lookup(&service, &monitor_id)?;
    let (buckets, strategy) = parse_uptime(&query, service.config.bucket_count, service.config.default_strategy)?;
    let bars = service.uptime_bars(monitor, buckets, strategy).await?;
    Ok(([(header::CACHE_CONTROL, service.cache_control())], Json(bars)))
}

/// Server-sent history feeds: the latest one first, then each new broadcast.
pub async fn stream_history(
    State(service): State<Arc<StatusService>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut view = service.sync().subscribe();
    let initial = view.latest();

    let events = stream::unfold((view, initial), |(mut view, pending)| async move {
        let feed = match pending {
            Some(feed) => feed,
            None => view.next().await?,
        };
        let event = Event::default()
            .event("history")
            .json_data(&*feed)
            .unwrap_or_else(|e| Event::default().comment(format!("encode failed: {}", e)));
        Some((Ok(event), (view, None)))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

pub async fn health() -> &'static str {
    "ok"
}

pub fn create_router(service: Arc<StatusService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(get_status))
        .route("/api/history", get(get_all_history))
        .route("/api/history/{monitor_id}", get(get_history))
        .route("/api/uptime/{monitor_id}", get(get_uptime))
        .route("/api/stream", get(stream_history))
        .fallback_service(ServeDir::new("public"))
        .with_state(service)
}

pub async fn start_server(port: u16, service: Arc<StatusService>) -> anyhow::Result<()> {
    let app = create_router(service);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Dashboard: http://localhost:{}", addr.port());
    axum::serve(listener, app).await?;
    Ok(())
}
