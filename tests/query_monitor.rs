//! Query monitor window, statistics and pattern behaviour.

use std::sync::Arc;

use proptest::prelude::*;
use recordcache::application::records::{ListQuery, RecordFamily, RecordSource, SourceError};
use recordcache::infra::records::{InstrumentedSource, MemoryRecords};
use recordcache::monitor::{MonitorConfig, QueryMonitor};
use serde_json::json;
use uuid::Uuid;

fn monitor(buffer_size: usize, slow_query_threshold_ms: u64) -> QueryMonitor {
    QueryMonitor::new(MonitorConfig {
        buffer_size,
        slow_query_threshold_ms,
        ..Default::default()
    })
}

#[test]
fn hundred_sequential_durations() {
    let monitor = monitor(1000, 100);
    for ms in 1..=100 {
        monitor.record_query("SELECT 1", f64::from(ms), None);
    }

    let stats = monitor.stats();
    assert_eq!(stats.total_queries, 100);
    assert_eq!(stats.slow_queries, 0);
    assert_eq!(stats.min_duration, 1.0);
    assert_eq!(stats.max_duration, 100.0);
    assert_eq!(stats.avg_duration, 50.5);
    assert_eq!(stats.p50_duration, 50.0);
    assert_eq!(stats.p95_duration, 95.0);
    assert_eq!(stats.p99_duration, 99.0);
}

#[test]
fn distribution_buckets_one_of_each() {
    let monitor = QueryMonitor::default();
    for ms in [5.0, 30.0, 75.0, 200.0, 600.0] {
        monitor.record_query("SELECT 1", ms, None);
    }

    let distribution = serde_json::to_value(monitor.distribution()).expect("serializes");
    assert_eq!(
        distribution,
        json!({
            "0-10ms": 1,
            "10-50ms": 1,
            "50-100ms": 1,
            "100-500ms": 1,
            "500ms+": 1,
        })
    );
}

#[test]
fn threshold_is_exclusive() {
    let monitor = monitor(10, 100);
    monitor.record_query("SELECT at_threshold", 100.0, None);
    monitor.record_query("SELECT over_threshold", 100.5, None);

    let slow = monitor.slow_queries(10);
    assert_eq!(slow.len(), 1);
    assert_eq!(slow[0].query, "SELECT over_threshold");
    assert!(slow[0].stack.is_some());
    assert!(monitor.recent_queries(10)[1].stack.is_none());
}

#[test]
fn patterns_group_literal_variants() {
    let monitor = QueryMonitor::default();
    monitor.record_query("SELECT * FROM domains WHERE name = 'Safety'", 4.0, None);
    monitor.record_query("SELECT * FROM domains WHERE name = 'Latency'", 6.0, None);
    monitor.record_query("SELECT * FROM objectives WHERE id IN (1, 2, 3)", 20.0, None);

    let patterns = monitor.top_patterns(10);
    assert_eq!(patterns.len(), 2);
    assert_eq!(patterns[0].count, 2);
    assert_eq!(patterns[0].avg_duration_ms, 5.0);
    assert_eq!(patterns[0].total_duration_ms, 10.0);
    assert!(patterns[0].pattern.contains("name = ?"));
    assert!(patterns[1].pattern.contains("IN (?)"));

    assert_eq!(monitor.top_patterns(1).len(), 1);
}

#[test]
fn clear_resets_every_view() {
    let monitor = monitor(10, 1);
    monitor.record_query("SELECT pg_sleep(1)", 1000.0, Some(&[json!(1)][..]));
    monitor.clear();

    assert!(monitor.is_empty());
    assert_eq!(monitor.stats().total_queries, 0);
    assert_eq!(monitor.stats().p99_duration, 0.0);
    assert!(monitor.slow_queries(10).is_empty());
    assert!(monitor.recent_queries(10).is_empty());
    assert!(monitor.query_patterns().is_empty());
    assert_eq!(monitor.distribution().total(), 0);
}

#[tokio::test]
async fn instrumented_store_reports_statements() {
    let monitor = Arc::new(QueryMonitor::default());
    let source = InstrumentedSource::new(MemoryRecords::new(), monitor.clone());

    let created = source
        .create(
            RecordFamily::Objectives,
            serde_json::from_value(json!({"title": "Ship it", "domain": "delivery"}))
                .expect("object"),
        )
        .await
        .expect("create");
    source
        .list(
            RecordFamily::Objectives,
            &ListQuery::filtered("domain", "delivery"),
        )
        .await
        .expect("list");
    let missing = source
        .update(
            RecordFamily::Objectives,
            Uuid::new_v4(),
            serde_json::from_value(json!({"title": "Never"})).expect("object"),
        )
        .await;
    assert!(matches!(missing, Err(SourceError::NotFound)));

    let recent = monitor.recent_queries(10);
    assert_eq!(recent.len(), 3);
    assert!(recent[0].query.starts_with("UPDATE objectives SET"));
    assert!(recent[1].query.starts_with("SELECT * FROM objectives WHERE domain = $1"));
    assert_eq!(recent[1].params.as_deref(), Some(&["delivery".to_string()][..]));
    assert!(recent[2].query.starts_with("INSERT INTO objectives"));
    assert_ne!(created.id, Uuid::nil());
}

proptest! {
    #[test]
    fn window_holds_the_newest_records(
        capacity in 1usize..32,
        durations in proptest::collection::vec(0.0f64..1_000.0, 0..96),
    ) {
        let monitor = monitor(capacity, 100);
        for (index, ms) in durations.iter().enumerate() {
            monitor.record_query(&format!("SELECT {index}"), *ms, None);
        }

        let expected: Vec<String> = (0..durations.len())
            .rev()
            .take(capacity)
            .map(|index| format!("SELECT {index}"))
            .collect();
        let recent: Vec<String> = monitor
            .recent_queries(usize::MAX)
            .into_iter()
            .map(|record| record.query)
            .collect();

        prop_assert_eq!(monitor.len(), durations.len().min(capacity));
        prop_assert_eq!(recent, expected);
    }

    #[test]
    fn distribution_accounts_for_every_record(
        durations in proptest::collection::vec(0.0f64..2_000.0, 0..64),
    ) {
        let monitor = monitor(1000, 100);
        for ms in &durations {
            monitor.record_query("SELECT 1", *ms, None);
        }
        prop_assert_eq!(monitor.distribution().total(), durations.len());
        prop_assert_eq!(monitor.stats().total_queries, durations.len());
    }

    #[test]
    fn statistics_are_ordered(
        durations in proptest::collection::vec(0.0f64..5_000.0, 1..64),
    ) {
        let monitor = monitor(1000, 100);
        for ms in &durations {
            monitor.record_query("SELECT 1", *ms, None);
        }
        let stats = monitor.stats();
        prop_assert!(stats.min_duration <= stats.p50_duration);
        prop_assert!(stats.p50_duration <= stats.p95_duration);
        prop_assert!(stats.p95_duration <= stats.p99_duration);
        prop_assert!(stats.p99_duration <= stats.max_duration);
        prop_assert!(stats.min_duration <= stats.avg_duration);
        prop_assert!(stats.avg_duration <= stats.max_duration);
        prop_assert_eq!(
            stats.slow_queries,
            durations.iter().filter(|ms| **ms > 100.0).count()
        );
    }
}
