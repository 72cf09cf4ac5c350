use std::collections::HashMap;

use crate::config::{CategoryConfig, MonitorConfig};
use crate::models::{CategoryStatus, CheckOutcome, MonitorStatus, Status};

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub overall_status: Status,
    pub categories: Vec<CategoryStatus>,
    pub monitors: Vec<MonitorStatus>,
}

/// Any down wins, then any degraded; all-up is up; anything else is unknown.
pub fn worst_status<I>(statuses: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let mut any = false;
    let mut all_up = true;
    let mut any_degraded = false;

    for status in statuses {
        any = true;
        match status {
            Status::Down => return Status::Down,
            Status::Degraded => any_degraded = true,
            Status::Up => {}
            Status::Unknown => all_up = false,
        }
    }

    if any_degraded {
        Status::Degraded
    } else if any && all_up {
        Status::Up
    } else {
        Status::Unknown
    }
}

/// Categories and monitors keep configuration order. Monitors without an
/// outcome are reported as unknown.
pub fn aggregate(
    categories: &[CategoryConfig],
    monitors: &[MonitorConfig],
    outcomes: &[CheckOutcome],
) -> Aggregation {
    let latest: HashMap<&str, &CheckOutcome> = outcomes
        .iter()
        .map(|outcome| (outcome.monitor_id.as_str(), outcome))
        .collect();

    let monitor_statuses: Vec<MonitorStatus> = monitors
        .iter()
        .map(|monitor| monitor_status(monitor, latest.get(monitor.id.as_str()).copied()))
        .collect();

    let category_statuses: Vec<CategoryStatus> = categories
        .iter()
        .map(|category| {
            let members: Vec<Status> = monitor_statuses
                .iter()
                .filter(|m| m.category == category.id)
                .map(|m| m.status)
                .collect();
            let count = |s: Status| members.iter().filter(|&&m| m == s).count();

            CategoryStatus {
                id: category.id.clone(),
                label: category.label.clone(),
                status: worst_status(members.iter().copied()),
                up: count(Status::Up),
                degraded: count(Status::Degraded),
                down: count(Status::Down),
                unknown: count(Status::Unknown),
                total: members.len(),
            }
        })
        .collect();

    Aggregation {
        overall_status: worst_status(category_statuses.iter().map(|c| c.status)),
        categories: category_statuses,
        monitors: monitor_statuses,
    }
}

fn monitor_status(monitor: &MonitorConfig, outcome: Option<&CheckOutcome>) -> MonitorStatus {
    MonitorStatus {
        id: monitor.id.clone(),
        label: monitor.label.clone(),
        category: monitor.category.clone(),
        url: monitor.url.clone(),
        status: outcome.map_or(Status::Unknown, |o| o.status),
        status_code: outcome.and_then(|o| o.status_code),
        response_time_ms: outcome.map(|o| o.response_time_ms),
        error_message: outcome.and_then(|o| o.error_message.clone()),
        checked_at: outcome.map(|o| o.checked_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const LEVELS: [Status; 4] = [Status::Up, Status::Degraded, Status::Down, Status::Unknown];

    fn category(id: &str) -> CategoryConfig {
        CategoryConfig { id: id.into(), label: id.to_uppercase() }
    }

    fn monitor(id: &str, category: &str) -> MonitorConfig {
        MonitorConfig {
            id: id.into(),
            label: id.into(),
            category: category.into(),
            url: format!("https://{}.example.com", id),
            method: "GET".into(),
            timeout_ms: None,
        }
    }

    fn outcome(id: &str, status: Status) -> CheckOutcome {
        CheckOutcome {
            monitor_id: id.into(),
            status,
            status_code: Some(200),
            response_time_ms: 12,
            error_message: None,
            checked_at: Utc::now(),
        }
    }

    #[test]
    fn any_down_member_means_down() {
        for a in LEVELS {
            for b in LEVELS {
                for c in LEVELS {
                    let result = worst_status([a, b, c]);
                    if [a, b, c].contains(&Status::Down) {
                        assert_eq!(result, Status::Down, "{:?}", [a, b, c]);
                    } else if [a, b, c].contains(&Status::Degraded) {
                        assert_eq!(result, Status::Degraded, "{:?}", [a, b, c]);
                    } else if [a, b, c].iter().all(|s| *s == Status::Up) {
                        assert_eq!(result, Status::Up);
                    } else {
                        assert_eq!(result, Status::Unknown);
                    }
                }
            }
        }
    }

    #[test]
    fn empty_input_is_unknown() {
        assert_eq!(worst_status(Vec::<Status>::new()), Status::Unknown);
        let aggregation = aggregate(&[], &[], &[]);
        assert_eq!(aggregation.overall_status, Status::Unknown);
        assert!(aggregation.categories.is_empty());
        assert!(aggregation.monitors.is_empty());
    }

    #[test]
    fn mixed_category_rolls_up_to_down() {
        let categories = vec![category("core")];
        let monitors = vec![monitor("a", "core"), monitor("b", "core"), monitor("c", "core")];
        let outcomes = vec![
            outcome("a", Status::Up),
            outcome("b", Status::Degraded),
            outcome("c", Status::Down),
        ];

        let aggregation = aggregate(&categories, &monitors, &outcomes);
        let core = &aggregation.categories[0];
        assert_eq!(core.status, Status::Down);
        assert_eq!((core.up, core.degraded, core.down, core.total), (1, 1, 1, 3));
        assert_eq!(aggregation.overall_status, Status::Down);
    }

    #[test]
    fn overall_uses_category_statuses() {
        let categories = vec![category("core"), category("edge"), category("empty")];
        let monitors = vec![monitor("a", "core"), monitor("b", "edge")];
        let outcomes = vec![outcome("a", Status::Up), outcome("b", Status::Degraded)];

        let aggregation = aggregate(&categories, &monitors, &outcomes);
        let statuses: Vec<_> = aggregation.categories.iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![Status::Up, Status::Degraded, Status::Unknown]);
        assert_eq!(aggregation.overall_status, Status::Degraded);
    }

    #[test]
    fn missing_outcome_is_unknown_not_up() {
        let categories = vec![category("core")];
        let monitors = vec![monitor("a", "core"), monitor("b", "core")];
        let outcomes = vec![outcome("a", Status::Up)];

        let aggregation = aggregate(&categories, &monitors, &outcomes);
        assert_eq!(aggregation.monitors[1].status, Status::Unknown);
        assert!(aggregation.monitors[1].checked_at.is_none());
        assert_eq!(aggregation.categories[0].status, Status::Unknown);
        assert_eq!(aggregation.categories[0].unknown, 1);
        assert_eq!(aggregation.overall_status, Status::Unknown);
    }
}
