use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::Method;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error};

use crate::config::MonitorConfig;
use crate::models::{CheckOutcome, Status};

const DEFAULT_USER_AGENT: &str = concat!("upwatch/", env!("CARGO_PKG_VERSION"));

/// What the transport layer observed, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    HttpStatus(u16),
    Timeout,
    NetworkError(String),
}

pub fn classify_status_code(code: u16) -> Status {
    match code {
        200..=399 => Status::Up,
        400..=499 => Status::Degraded,
        _ => Status::Down,
    }
}

pub struct Prober {
    http_client: reqwest::Client,
    concurrency_limiter: Arc<Semaphore>,
    default_timeout_ms: u64,
}

impl Prober {
    pub fn new(max_concurrency: usize, default_timeout_ms: u64, user_agent: Option<&str>) -> reqwest::Result<Self> {
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(user_agent.unwrap_or(DEFAULT_USER_AGENT))
            .build()?;

        Ok(Self {
            http_client,
            concurrency_limiter: Arc::new(Semaphore::new(max_concurrency.max(1))),
            default_timeout_ms,
        })
    }

    /// Probes one monitor. Always yields an outcome; failures are data.
    pub async fn probe(&self, monitor: &MonitorConfig, timeout: Duration) -> CheckOutcome {
        let checked_at = Utc::now();
        let (result, elapsed) = self.dispatch(monitor, timeout).await;
        let response_time_ms = elapsed.as_millis() as u64;

        let outcome = match result {
            ProbeResult::HttpStatus(code) => CheckOutcome {
                monitor_id: monitor.id.clone(),
                status: classify_status_code(code),
                status_code: Some(code),
                response_time_ms,
                error_message: None,
                checked_at,
            },
            ProbeResult::Timeout => CheckOutcome {
                monitor_id: monitor.id.clone(),
                status: Status::Down,
                status_code: None,
                response_time_ms,
                error_message: Some(format!("Timeout after {}ms", timeout.as_millis())),
                checked_at,
            },
            ProbeResult::NetworkError(detail) => CheckOutcome {
                monitor_id: monitor.id.clone(),
                status: Status::Down,
                status_code: None,
                response_time_ms,
                error_message: Some(detail),
                checked_at,
            },
        };

        debug!(
            "probe {} -> {} ({}ms)",
            monitor.id, outcome.status, outcome.response_time_ms
        );
        outcome
    }

    /// Elapsed time covers dispatch to settlement, whichever way it settled.
    async fn dispatch(&self, monitor: &MonitorConfig, timeout: Duration) -> (ProbeResult, Duration) {
        let method = match Method::from_bytes(monitor.method.as_bytes()) {
            Ok(method) => method,
            Err(e) => return (ProbeResult::NetworkError(format!("Invalid method: {}", e)), Duration::ZERO),
        };

        let start = Instant::now();
        let request = self.http_client.request(method, &monitor.url).send();

        // Dropping the request future on expiry cancels the in-flight request.
        let result = match tokio::time::timeout(timeout, request).await {
            Ok(Ok(response)) => ProbeResult::HttpStatus(response.status().as_u16()),
            Ok(Err(e)) if e.is_timeout() => ProbeResult::Timeout,
            Ok(Err(e)) => ProbeResult::NetworkError(error_chain(&e)),
            Err(_) => ProbeResult::Timeout,
        };
        (result, start.elapsed())
    }

    /// Probes every monitor concurrently and returns outcomes in input order.
    pub async fn probe_all(self: &Arc<Self>, monitors: &[MonitorConfig]) -> Vec<CheckOutcome> {
        let mut tasks = FuturesUnordered::new();

        for (index, monitor) in monitors.iter().enumerate() {
            let prober = Arc::clone(self);
            let monitor = monitor.clone();
            let timeout = monitor.timeout(self.default_timeout_ms);

            tasks.push(async move {
                let handle = tokio::spawn(async move {
                    let _permit = prober.concurrency_limiter.acquire().await.ok();
                    prober.probe(&monitor, timeout).await
                });
                (index, handle.await)
            });
        }

        let mut slots: Vec<Option<CheckOutcome>> = vec![None; monitors.len()];
        while let Some((index, joined)) = tasks.next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Probe task for {} failed: {}", monitors[index].id, e);
                    CheckOutcome {
                        monitor_id: monitors[index].id.clone(),
                        status: Status::Down,
                        status_code: None,
                        response_time_ms: 0,
                        error_message: Some(format!("Probe task failed: {}", e)),
                        checked_at: Utc::now(),
                    }
                }
            };
            slots[index] = Some(outcome);
        }

        slots.into_iter().flatten().collect()
    }
}

/// reqwest hides the useful part of a connect error in its source chain.
fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = StdError::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = StdError::source(inner);
    }
    message
}
