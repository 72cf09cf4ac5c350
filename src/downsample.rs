use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::aggregate::worst_status;
use crate::models::{HistoryRecord, Status};

const LABEL_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// down > degraded > up, the same rule as category aggregation.
    #[default]
    Worst,
    /// Status of the chronologically last record in the slot.
    Latest,
    /// Most frequent status; ties go to the one seen first.
    Majority,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worst" => Ok(Strategy::Worst),
            "latest" => Ok(Strategy::Latest),
            "majority" => Ok(Strategy::Majority),
            other => Err(format!("unknown strategy '{}', expected worst, latest or majority", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub label: String,
    pub status: Status,
    pub is_placeholder: bool,
    pub is_future: bool,
    pub count: usize,
}

/// One bar as the dashboard chart draws it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartBar {
    pub date: String,
    pub tooltip: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_future: Option<bool>,
}

pub fn tooltip(status: Status) -> &'static str {
    match status {
        Status::Up => "Operational",
        Status::Degraded => "Degraded",
        Status::Down => "Outage",
        Status::Unknown => "No data",
    }
}

pub fn color(status: Status) -> &'static str {
    match status {
        Status::Up => "#22c55e",
        Status::Degraded => "#f59e0b",
        Status::Down => "#ef4444",
        Status::Unknown => "#d1d5db",
    }
}

/// Splits `[start, end]` into `bucket_count` equal slots and folds each
/// slot's records with `strategy`.
///
/// `start` is the later of the oldest record and `now - retention`; `end`
/// is the later of the newest record and `now`, which leaves trailing slots
/// for time that has not happened yet. Records older than `start` are
/// dropped.
pub fn downsample(
    records: &[HistoryRecord],
    bucket_count: usize,
    strategy: Strategy,
    now: DateTime<Utc>,
    retention: Duration,
) -> Vec<Bucket> {
    if bucket_count == 0 {
        return Vec::new();
    }

    let now_ms = now.timestamp_millis();
    let window_start = now_ms - retention.num_milliseconds().max(0);

    let (start, end) = match (
        records.iter().map(|r| r.recorded_at.timestamp_millis()).min(),
        records.iter().map(|r| r.recorded_at.timestamp_millis()).max(),
    ) {
        (Some(oldest), Some(newest)) => (oldest.max(window_start), newest.max(now_ms)),
        _ => (window_start, now_ms),
    };
    let span = i128::from(end - start);
    let n = bucket_count as i128;

    let mut slots: Vec<Vec<&HistoryRecord>> = vec![Vec::new(); bucket_count];
    for record in records {
        let t = record.recorded_at.timestamp_millis();
        if t < start {
            continue;
        }
        let index = if span == 0 {
            bucket_count - 1
        } else {
            let raw = i128::from(t - start) * n / span;
            (raw.min(n - 1)) as usize
        };
        slots[index].push(record);
    }

    let at = |offset: i128| millis_to_datetime(start + (offset as i64));

    slots
        .into_iter()
        .enumerate()
        .map(|(i, members)| {
            let i = i as i128;
            let slot_start = at(span * i / n);
            let slot_end = at(span * (i + 1) / n);
            let midpoint = at(span * (2 * i + 1) / (2 * n));

            let is_placeholder = members.is_empty();
            Bucket {
                start: slot_start,
                end: slot_end,
                label: midpoint.format(LABEL_FORMAT).to_string(),
                status: if is_placeholder { Status::Unknown } else { fold(&members, strategy) },
                is_placeholder,
                is_future: is_placeholder && midpoint > now,
                count: members.len(),
            }
        })
        .collect()
}

fn fold(members: &[&HistoryRecord], strategy: Strategy) -> Status {
    match strategy {
        Strategy::Worst => worst_status(members.iter().map(|r| r.status)),
        Strategy::Latest => members
            .iter()
            .copied()
            .fold(None::<&HistoryRecord>, |last, r| match last {
                Some(l) if l.recorded_at > r.recorded_at => Some(l),
                _ => Some(r),
            })
            .map_or(Status::Unknown, |r| r.status),
        Strategy::Majority => {
            let mut tally: Vec<(Status, usize)> = Vec::new();
            for r in members {
                match tally.iter_mut().find(|(s, _)| *s == r.status) {
                    Some((_, n)) => *n += 1,
                    None => tally.push((r.status, 1)),
                }
            }
            let mut best: Option<(Status, usize)> = None;
            for (status, n) in tally {
                if best.map_or(true, |(_, m)| n > m) {
                    best = Some((status, n));
                }
            }
            best.map_or(Status::Unknown, |(s, _)| s)
        }
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn to_chart(buckets: &[Bucket]) -> Vec<ChartBar> {
    buckets
        .iter()
        .map(|bucket| ChartBar {
            date: bucket.label.clone(),
            tooltip: tooltip(bucket.status).to_string(),
            color: color(bucket.status).to_string(),
            is_future: bucket.is_future.then_some(true),
        })
        .collect()
}
