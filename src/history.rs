use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::StoreResult;
use crate::models::{CheckOutcome, HistoryRecord, HistoryStats, MonitorHistory, Status};
use crate::store::{history_key, Store, HISTORY_PREFIX};

/// Backstop expiry on every history key, independent of the retention policy.
pub const HISTORY_HARD_EXPIRY_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub monitors_scanned: usize,
    pub records_removed: usize,
    pub keys_removed: usize,
}

pub struct HistoryStore {
    store: Arc<dyn Store>,
    max_records: usize,
}

impl HistoryStore {
    pub fn new(store: Arc<dyn Store>, max_records: usize) -> Self {
        Self {
            store,
            max_records: max_records.max(1),
        }
    }

    async fn load(&self, monitor_id: &str) -> StoreResult<Vec<HistoryRecord>> {
        match self.store.get(&history_key(monitor_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn write(&self, monitor_id: &str, records: &[HistoryRecord]) -> StoreResult<()> {
        let key = history_key(monitor_id);
        if records.is_empty() {
            return self.store.delete(&key).await;
        }
        let raw = serde_json::to_string(records)?;
        self.store
            .set(&key, raw, Some(Duration::days(HISTORY_HARD_EXPIRY_DAYS)))
            .await
    }

    /// Appends a record for `outcome`. Duplicate outcomes produce duplicate
    /// records.
    pub async fn save_record(&self, monitor_id: &str, outcome: &CheckOutcome) -> StoreResult<HistoryRecord> {
        let mut record = HistoryRecord::from_outcome(outcome);
        record.monitor_id = monitor_id.to_string();

        let mut records = self.load(monitor_id).await?;
        // Newest first; a later insert with an equal timestamp goes in front.
        let position = records.partition_point(|r| r.recorded_at > record.recorded_at);
        records.insert(position, record.clone());
        records.truncate(self.max_records);

        self.write(monitor_id, &records).await?;
        Ok(record)
    }

    /// The most recent `limit` records after skipping the `offset` newest,
    /// oldest first.
    pub async fn get_records(&self, monitor_id: &str, limit: usize, offset: usize) -> StoreResult<Vec<HistoryRecord>> {
        let records = self.load(monitor_id).await?;
        Ok(window(&records, limit, offset))
    }

    /// One display page: fetches `limit + 1` to learn whether older records
    /// exist beyond it.
    pub async fn page(&self, monitor_id: &str, label: &str, limit: usize, offset: usize) -> StoreResult<MonitorHistory> {
        let all = self.load(monitor_id).await?;

        let mut records = window(&all, limit.saturating_add(1), offset);
        let has_more = records.len() > limit;
        if has_more {
            // ascending order, so the extra record is the oldest one
            records.remove(0);
        }

        let stats = calculate_stats(&records);
        Ok(MonitorHistory {
            monitor_id: monitor_id.to_string(),
            label: label.to_string(),
            total_records: all.len(),
            oldest_record: all.last().map(|r| r.recorded_at),
            newest_record: all.first().map(|r| r.recorded_at),
            records,
            has_more,
            stats,
        })
    }

    pub async fn delete_records(&self, monitor_id: &str) -> StoreResult<()> {
        self.store.delete(&history_key(monitor_id)).await
    }

    pub async fn monitor_ids(&self) -> StoreResult<Vec<String>> {
        let keys = self.store.keys(HISTORY_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(HISTORY_PREFIX).map(str::to_string))
            .collect())
    }

    pub async fn cleanup(&self, retention_days: u32) -> StoreResult<CleanupReport> {
        self.cleanup_at(Utc::now(), retention_days).await
    }

    /// Drops records older than `now - retention_days`. Keys left empty are
    /// removed rather than kept as empty arrays.
    pub async fn cleanup_at(&self, now: DateTime<Utc>, retention_days: u32) -> StoreResult<CleanupReport> {
        let cutoff = now - Duration::days(i64::from(retention_days));
        let mut report = CleanupReport::default();

        for monitor_id in self.monitor_ids().await? {
            report.monitors_scanned += 1;
            let mut records = self.load(&monitor_id).await?;
            let before = records.len();
            records.retain(|r| r.recorded_at >= cutoff);
            let removed = before - records.len();
            if removed == 0 && before > 0 {
                continue;
            }

            if records.is_empty() {
                report.keys_removed += 1;
            }
            report.records_removed += removed;
            debug!("Trimmed {} records from {}", removed, monitor_id);
            self.write(&monitor_id, &records).await?;
        }

        info!(
            "History cleanup: {} records removed, {} keys removed across {} monitors",
            report.records_removed, report.keys_removed, report.monitors_scanned
        );
        Ok(report)
    }
}

fn window(newest_first: &[HistoryRecord], limit: usize, offset: usize) -> Vec<HistoryRecord> {
    let mut records: Vec<HistoryRecord> = newest_first.iter().skip(offset).take(limit).cloned().collect();
    records.reverse();
    records
}

/// Rollup over `records`; zeroed when there are none.
pub fn calculate_stats(records: &[HistoryRecord]) -> HistoryStats {
    let total = records.len();
    if total == 0 {
        return HistoryStats::default();
    }

    let count = |status: Status| records.iter().filter(|r| r.status == status).count();
    let up_count = count(Status::Up);
    let sum: u64 = records.iter().map(|r| r.response_time_ms).sum();

    HistoryStats {
        total_checks: total,
        up_count,
        degraded_count: count(Status::Degraded),
        down_count: count(Status::Down),
        uptime: 100.0 * up_count as f64 / total as f64,
        avg_response_time: (sum as f64 / total as f64).round() as u64,
        min_response_time: records.iter().map(|r| r.response_time_ms).min().unwrap_or(0),
        max_response_time: records.iter().map(|r| r.response_time_ms).max().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn outcome(status: Status, response_time_ms: u64, checked_at: DateTime<Utc>) -> CheckOutcome {
        CheckOutcome {
            monitor_id: "api".into(),
            status,
            status_code: match status {
                Status::Down => None,
                _ => Some(200),
            },
            response_time_ms,
            error_message: None,
            checked_at,
        }
    }

    fn history() -> (HistoryStore, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (HistoryStore::new(store.clone(), 1_000), store)
    }

    async fn seed(history: &HistoryStore, count: i64, start: DateTime<Utc>) {
        for i in 0..count {
            history
                .save_record("api", &outcome(Status::Up, 10 + i as u64, start + Duration::minutes(i)))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn records_come_back_oldest_first() {
        let (history, _) = history();
        let start = Utc::now() - Duration::hours(1);
        seed(&history, 5, start).await;

        let records = history.get_records("api", 3, 0).await.unwrap();
        let times: Vec<_> = records.iter().map(|r| r.recorded_at).collect();
        assert_eq!(
            times,
            vec![start + Duration::minutes(2), start + Duration::minutes(3), start + Duration::minutes(4)]
        );

        let older = history.get_records("api", 3, 3).await.unwrap();
        let times: Vec<_> = older.iter().map(|r| r.recorded_at).collect();
        assert_eq!(times, vec![start, start + Duration::minutes(1)]);
    }

    #[tokio::test]
    async fn out_of_order_saves_are_sorted_and_ties_keep_insertion_order() {
        let (history, _) = history();
        let t = Utc::now() - Duration::minutes(10);

        let late = history.save_record("api", &outcome(Status::Up, 1, t + Duration::minutes(5))).await.unwrap();
        let first_tie = history.save_record("api", &outcome(Status::Down, 2, t)).await.unwrap();
        let second_tie = history.save_record("api", &outcome(Status::Degraded, 3, t)).await.unwrap();

        let ids: Vec<_> = history.get_records("api", 10, 0).await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first_tie.id, second_tie.id, late.id]);
    }

    #[tokio::test]
    async fn duplicate_outcomes_are_kept() {
        let (history, _) = history();
        let o = outcome(Status::Up, 5, Utc::now());
        let a = history.save_record("api", &o).await.unwrap();
        let b = history.save_record("api", &o).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(history.get_records("api", 10, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn page_reports_has_more_with_off_by_one_fetch() {
        let (history, _) = history();
        let start = Utc::now() - Duration::hours(1);
        seed(&history, 11, start).await;

        let page = history.page("api", "API", 10, 0).await.unwrap();
        assert_eq!(page.records.len(), 10);
        assert!(page.has_more);
        assert_eq!(page.total_records, 11);
        assert_eq!(page.records[0].recorded_at, start + Duration::minutes(1));
        assert_eq!(page.oldest_record, Some(start));
        assert_eq!(page.newest_record, Some(start + Duration::minutes(10)));

        let (exact, _) = self::history();
        seed(&exact, 10, start).await;
        let page = exact.page("api", "API", 10, 0).await.unwrap();
        assert_eq!(page.records.len(), 10);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn empty_monitor_page() {
        let (history, _) = history();
        let page = history.page("nothing", "Nothing", 10, 0).await.unwrap();
        assert!(page.records.is_empty());
        assert!(!page.has_more);
        assert_eq!(page.total_records, 0);
        assert!(page.oldest_record.is_none());
        assert_eq!(page.stats, HistoryStats::default());
    }

    #[tokio::test]
    async fn max_records_drops_oldest() {
        let history = HistoryStore::new(Arc::new(MemoryStore::new()), 3);
        let start = Utc::now() - Duration::hours(1);
        seed(&history, 5, start).await;

        let records = history.get_records("api", 10, 0).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].recorded_at, start + Duration::minutes(2));
    }

    #[tokio::test]
    async fn delete_records_removes_key() {
        let (history, store) = history();
        seed(&history, 2, Utc::now()).await;
        history.delete_records("api").await.unwrap();
        assert!(store.get("history:api").await.unwrap().is_none());
        assert!(history.monitor_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_trims_old_records_and_empty_keys() {
        let (history, store) = history();
        let now = Utc::now();

        history.save_record("api", &outcome(Status::Up, 1, now - Duration::days(9))).await.unwrap();
        history.save_record("api", &outcome(Status::Up, 1, now - Duration::days(8))).await.unwrap();
        history.save_record("api", &outcome(Status::Up, 1, now - Duration::hours(2))).await.unwrap();
        history.save_record("old", &outcome(Status::Down, 1, now - Duration::days(10))).await.unwrap();

        let report = history.cleanup_at(now, 7).await.unwrap();
        assert_eq!(report, CleanupReport { monitors_scanned: 2, records_removed: 3, keys_removed: 1 });

        let cutoff = now - Duration::days(7);
        let remaining = history.get_records("api", 100, 0).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.iter().all(|r| r.recorded_at >= cutoff));

        assert!(store.get("history:old").await.unwrap().is_none());
        assert_eq!(history.monitor_ids().await.unwrap(), vec!["api".to_string()]);
    }

    #[tokio::test]
    async fn cleanup_keeps_records_inside_window() {
        let (history, _) = history();
        let now = Utc::now();
        seed(&history, 4, now - Duration::days(6)).await;

        let report = history.cleanup_at(now, 7).await.unwrap();
        assert_eq!(report.records_removed, 0);
        assert_eq!(history.get_records("api", 100, 0).await.unwrap().len(), 4);
    }

    #[test]
    fn stats_over_mixed_window() {
        let now = Utc::now();
        let records: Vec<_> = [(Status::Up, 100), (Status::Up, 200), (Status::Down, 301), (Status::Down, 0)]
            .into_iter()
            .map(|(status, ms)| HistoryRecord::from_outcome(&outcome(status, ms, now)))
            .collect();

        let stats = calculate_stats(&records);
        assert_eq!(stats.uptime, 50.0);
        assert_eq!(stats.total_checks, 4);
        assert_eq!(stats.up_count, 2);
        assert_eq!(stats.down_count, 2);
        assert_eq!(stats.avg_response_time, 150);
        assert_eq!(stats.min_response_time, 0);
        assert_eq!(stats.max_response_time, 301);
    }

    #[test]
    fn stats_over_empty_window() {
        let stats = calculate_stats(&[]);
        assert_eq!(stats.uptime, 0.0);
        assert_eq!(stats.total_checks, 0);
    }
}
