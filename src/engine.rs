use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::aggregate::aggregate;
use crate::cache::SnapshotCache;
use crate::config::{AppConfig, MonitorConfig, StorageBackend};
use crate::downsample::{downsample, to_chart, ChartBar, Strategy};
use crate::edge;
use crate::error::StoreResult;
use crate::history::{CleanupReport, HistoryStore};
use crate::models::{CheckOutcome, MonitorHistory, Status, StatusResponse};
use crate::prober::Prober;
use crate::store::{self, Store};
use crate::sync::{HistoryFeed, ViewSync};

/// Owns every piece of the pipeline. Built once in `main` and handed to the
/// scheduler and the HTTP layer behind an `Arc`.
pub struct StatusService {
    pub config: AppConfig,
    prober: Arc<Prober>,
    cache: SnapshotCache,
    history: HistoryStore,
    sync: ViewSync<HistoryFeed>,
    last_statuses: Mutex<HashMap<String, Status>>,
    refresh: tokio::sync::Mutex<()>,
}

impl StatusService {
    pub fn new(config: AppConfig, store: Arc<dyn Store>, cache: SnapshotCache) -> Result<Self> {
        let prober = Prober::new(config.max_concurrency, config.timeout_ms, config.user_agent.as_deref())
            .context("Failed to create HTTP client")?;
        let history = HistoryStore::new(store, config.max_records_per_monitor);

        Ok(Self {
            config,
            prober: Arc::new(prober),
            cache,
            history,
            sync: ViewSync::new(),
            last_statuses: Mutex::new(HashMap::new()),
            refresh: tokio::sync::Mutex::new(()),
        })
    }

    /// Opens the configured backend. The persisted backend also gets an
    /// in-process shadow copy of the snapshot.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let store = store::open(&config.storage).context("Failed to open storage")?;
        let mut cache = SnapshotCache::new(Arc::clone(&store), config.cache_ttl());
        if config.storage.backend == StorageBackend::Sqlite {
            cache = cache.with_shadow(std::time::Duration::from_secs(config.shadow_ttl_secs));
        }
        Self::new(config, store, cache)
    }

    pub fn sync(&self) -> &ViewSync<HistoryFeed> {
        &self.sync
    }

    pub fn monitor(&self, id: &str) -> Option<&MonitorConfig> {
        self.config.monitor(id)
    }

    /// Probes every monitor, stores the new snapshot and appends each
    /// outcome to history.
    ///
    /// A failed snapshot or history write does not stop the remaining
    /// history writes; the first failure is returned afterwards.
    pub async fn check_all(&self) -> StoreResult<StatusResponse> {
        let started = Utc::now();
        let outcomes = self.prober.probe_all(&self.config.monitors).await;

        let aggregation = aggregate(&self.config.categories, &self.config.monitors, &outcomes);
        let overall = aggregation.overall_status;
        let now = Utc::now();
        let cached = self
            .cache
            .set(StatusResponse {
                overall_status: overall,
                categories: aggregation.categories,
                monitors: aggregation.monitors,
                timestamp: now,
                expires_at: now,
            })
            .await;
        if let Err(e) = &cached {
            error!("Failed to cache status snapshot: {}", e);
        }

        let mut first_error = None;
        for outcome in &outcomes {
            if let Err(e) = self.history.save_record(&outcome.monitor_id, outcome).await {
                error!("Failed to record history for {}: {}", outcome.monitor_id, e);
                first_error.get_or_insert(e);
            }
        }

        self.log_transitions(&outcomes);

        let elapsed = Utc::now() - started;
        info!(
            "Check cycle completed {} probes in {:.2}s, overall {}",
            outcomes.len(),
            elapsed.num_milliseconds() as f64 / 1000.0,
            overall
        );

        let snapshot = cached?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(snapshot),
        }
    }

    fn log_transitions(&self, outcomes: &[CheckOutcome]) {
        let mut last = self.last_statuses.lock().unwrap_or_else(|e| e.into_inner());
        for outcome in outcomes {
            let previous = last.insert(outcome.monitor_id.clone(), outcome.status);
            let changed = match previous {
                Some(old) => old != outcome.status,
                None => outcome.status != Status::Up,
            };
            if !changed {
                continue;
            }

            let msg = format!(
                "[CHANGE] {} -> {} ({})",
                outcome.monitor_id,
                outcome.status,
                outcome.error_message.as_deref().unwrap_or("ok")
            );
            if outcome.status == Status::Down {
                error!("{}", msg);
            } else {
                warn!("{}", msg);
            }
        }
    }

    /// The cached snapshot, rechecking on a miss. Never fails: storage
    /// trouble degrades to an `unknown` snapshot.
    pub async fn current_status(&self) -> StatusResponse {
        if let Some(snapshot) = self.cached_status().await {
            return snapshot;
        }

        // one recheck at a time; waiters pick up its snapshot
        let _refresh = self.refresh.lock().await;
        if let Some(snapshot) = self.cached_status().await {
            return snapshot;
        }

        match self.check_all().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("On-demand check failed: {}", e);
                match self.cache.get().await {
                    Ok(Some(snapshot)) => snapshot,
                    _ => StatusResponse::unavailable(Utc::now(), self.cache.ttl()),
                }
            }
        }
    }

    async fn cached_status(&self) -> Option<StatusResponse> {
        match self.cache.get().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Snapshot cache read failed: {}", e);
                None
            }
        }
    }

    pub async fn monitor_history(&self, monitor: &MonitorConfig, limit: usize, offset: usize) -> StoreResult<MonitorHistory> {
        self.history.page(&monitor.id, &monitor.label, limit, offset).await
    }

    /// Every configured monitor's history page. The result is also offered
    /// to other open views through [`ViewSync`].
    pub async fn all_history(&self, limit: usize, offset: usize) -> StoreResult<Arc<HistoryFeed>> {
        let mut feed = Vec::with_capacity(self.config.monitors.len());
        for monitor in &self.config.monitors {
            feed.push(self.monitor_history(monitor, limit, offset).await?);
        }
        let feed = Arc::new(feed);
        self.sync.publish(Arc::clone(&feed));
        Ok(feed)
    }

    pub async fn uptime_bars(&self, monitor: &MonitorConfig, buckets: usize, strategy: Strategy) -> StoreResult<Vec<ChartBar>> {
        let records = self
            .history
            .get_records(&monitor.id, self.config.max_records_per_monitor, 0)
            .await?;
        let retention = Duration::days(i64::from(self.config.retention_days));
        Ok(to_chart(&downsample(&records, buckets, strategy, Utc::now(), retention)))
    }

    pub async fn cleanup(&self) -> StoreResult<CleanupReport> {
        self.history.cleanup(self.config.retention_days).await
    }

    /// `Cache-Control` for responses that change once per check cycle.
    pub fn cache_control(&self) -> String {
        let interval_ms = (self.config.check_interval * 1000) as i64;
        edge::cache_control(Utc::now().timestamp_millis(), interval_ms, self.config.edge_grace_ms as i64)
    }

    pub async fn run(self: Arc<Self>) {
        info!("Status engine active: {} monitors in {} categories", self.config.monitors.len(), self.config.categories.len());
        info!("--- Check interval: {}s, max concurrency: {} ---", self.config.check_interval, self.config.max_concurrency);

        let mut cycle: u32 = 0;
        loop {
            if let Err(e) = self.check_all().await {
                error!("Check cycle failed: {}", e);
            }

            cycle = cycle.wrapping_add(1);
            if self.config.cleanup_every > 0 && cycle % self.config.cleanup_every == 0 {
                if let Err(e) = self.cleanup().await {
                    error!("History cleanup failed: {}", e);
                }
            }

            tokio::time::sleep(self.config.check_interval()).await;
        }
    }
}
