//! Live aggregation of outcomes into latency and throughput statistics.
//!
//! One [`StatsAggregator`] is shared (cheap `Clone`) by every virtual user of
//! a run. Each `(user_type, action)` pair owns an entry behind its own mutex,
//! plus one total entry; recording locks the pair's entry, then the total.
//! [`StatsAggregator::snapshot`] copies every entry under its own lock, so
//! each reported row is internally consistent (`success + failure == count`)
//! and counts never decrease from one snapshot to the next.
//!
//! Latencies go into an HdrHistogram tracking 1µs to 60s with 3 significant
//! digits, so reported percentiles are within 0.1% of the true sample
//! quantile. Samples above 60s are clamped.

use hdrhistogram::Histogram;
use lazy_static::lazy_static;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::journey::JourneyState;
use crate::outcome::Outcome;

const MAX_LATENCY_US: u64 = 60_000_000;
const SIGNIFICANT_DIGITS: u8 = 3;
const CURRENT_RPS_WINDOW_SECS: u64 = 10;

lazy_static! {
    static ref EMPTY_HISTOGRAM: Histogram<u64> =
        Histogram::new_with_bounds(1, MAX_LATENCY_US, SIGNIFICANT_DIGITS)
            .expect("valid histogram bounds");
}

/// Aggregated statistics of one row (an action, a user type or the total).
///
/// Latencies are reported in milliseconds.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AggregateStats {
    pub user_type: Option<String>,
    pub name: String,
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub p99_9_ms: f64,
    /// Requests per second since the aggregator was created.
    pub rps: f64,
    /// Requests per second over the last 10 whole seconds.
    pub current_rps: f64,
    /// Failure reason → occurrences.
    pub failures: BTreeMap<String, u64>,
}

impl AggregateStats {
    pub fn failure_ratio(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.count as f64
        }
    }
}

/// Cycle counters of one journey.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct JourneyStats {
    pub name: String,
    pub completed: u64,
    pub aborted: u64,
    pub skipped_steps: u64,
}

/// A row of the failures report.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailureRow {
    pub user_type: String,
    pub name: String,
    pub reason: String,
    pub occurrences: u64,
}

/// Point-in-time copy of all statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub elapsed_secs: f64,
    /// One row per `(user_type, action)`.
    pub entries: Vec<AggregateStats>,
    /// Actions merged across user types.
    pub by_action: Vec<AggregateStats>,
    /// All actions of a user type merged.
    pub by_user_type: Vec<AggregateStats>,
    pub total: AggregateStats,
    pub journeys: Vec<JourneyStats>,
    pub failures: Vec<FailureRow>,
}

impl StatsSnapshot {
    pub fn entry(&self, user_type: &str, name: &str) -> Option<&AggregateStats> {
        self.entries
            .iter()
            .find(|e| e.user_type.as_deref() == Some(user_type) && e.name == name)
    }

    pub fn action(&self, name: &str) -> Option<&AggregateStats> {
        self.by_action.iter().find(|e| e.name == name)
    }

    pub fn journey(&self, name: &str) -> Option<&JourneyStats> {
        self.journeys.iter().find(|j| j.name == name)
    }
}

#[derive(Clone)]
struct Entry {
    count: u64,
    success_count: u64,
    failure_count: u64,
    min: Option<Duration>,
    max: Duration,
    total_latency: Duration,
    histogram: Histogram<u64>,
    failures: BTreeMap<String, u64>,
    /// (second since start, requests in that second), oldest first.
    per_second: VecDeque<(u64, u64)>,
}

impl Entry {
    fn new() -> Self {
        Self {
            count: 0,
            success_count: 0,
            failure_count: 0,
            min: None,
            max: Duration::ZERO,
            total_latency: Duration::ZERO,
            histogram: EMPTY_HISTOGRAM.clone(),
            failures: BTreeMap::new(),
            per_second: VecDeque::new(),
        }
    }

    fn record(&mut self, outcome: &Outcome, second: u64) {
        self.count += 1;
        if outcome.succeeded {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
            *self
                .failures
                .entry(outcome.reason().to_string())
                .or_insert(0) += 1;
        }

        let latency = outcome.latency;
        self.min = Some(self.min.map_or(latency, |m| m.min(latency)));
        self.max = self.max.max(latency);
        self.total_latency += latency;

        let micros = (latency.as_micros() as u64).clamp(1, MAX_LATENCY_US);
        if let Err(e) = self.histogram.record(micros) {
            warn!(latency_us = micros, error = %e, "Failed to record latency in histogram");
        }

        match self.per_second.back_mut() {
            Some((s, n)) if *s == second => *n += 1,
            _ => self.per_second.push_back((second, 1)),
        }
        while let Some((s, _)) = self.per_second.front() {
            if *s + CURRENT_RPS_WINDOW_SECS < second {
                self.per_second.pop_front();
            } else {
                break;
            }
        }
    }

    fn merge(&mut self, other: &Entry) {
        self.count += other.count;
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = self.max.max(other.max);
        self.total_latency += other.total_latency;
        if let Err(e) = self.histogram.add(&other.histogram) {
            warn!(error = %e, "Failed to merge latency histograms");
        }
        for (reason, n) in &other.failures {
            *self.failures.entry(reason.clone()).or_insert(0) += n;
        }
        let mut seconds: BTreeMap<u64, u64> = self.per_second.iter().copied().collect();
        for (s, n) in &other.per_second {
            *seconds.entry(*s).or_insert(0) += n;
        }
        self.per_second = seconds.into_iter().collect();
    }

    fn to_stats(
        &self,
        user_type: Option<&str>,
        name: &str,
        elapsed: Duration,
        now_second: u64,
    ) -> AggregateStats {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        let quantile = |q: f64| {
            if self.histogram.is_empty() {
                0.0
            } else {
                self.histogram.value_at_quantile(q) as f64 / 1000.0
            }
        };
        let mean_ms = if self.count == 0 {
            0.0
        } else {
            ms(self.total_latency) / self.count as f64
        };
        let elapsed_secs = elapsed.as_secs_f64();

        AggregateStats {
            user_type: user_type.map(str::to_string),
            name: name.to_string(),
            count: self.count,
            success_count: self.success_count,
            failure_count: self.failure_count,
            min_ms: self.min.map(ms).unwrap_or(0.0),
            mean_ms,
            max_ms: ms(self.max),
            p50_ms: quantile(0.50),
            p90_ms: quantile(0.90),
            p95_ms: quantile(0.95),
            p99_ms: quantile(0.99),
            p99_9_ms: quantile(0.999),
            rps: if elapsed_secs > 0.0 {
                self.count as f64 / elapsed_secs
            } else {
                0.0
            },
            current_rps: self.current_rps(now_second),
            failures: self.failures.clone(),
        }
    }

    /// Rate over the last whole seconds, excluding the one in progress.
    fn current_rps(&self, now_second: u64) -> f64 {
        let window = now_second.min(CURRENT_RPS_WINDOW_SECS);
        if window == 0 {
            return 0.0;
        }
        let from = now_second - window;
        let requests: u64 = self
            .per_second
            .iter()
            .filter(|(s, _)| *s >= from && *s < now_second)
            .map(|(_, n)| n)
            .sum();
        requests as f64 / window as f64
    }
}

type EntryKey = (String, String);

struct Inner {
    started: Instant,
    entries: RwLock<HashMap<EntryKey, Arc<Mutex<Entry>>>>,
    total: Mutex<Entry>,
    journeys: Mutex<BTreeMap<String, JourneyStats>>,
}

/// Thread-safe statistics sink shared by every virtual user.
#[derive(Clone)]
pub struct StatsAggregator {
    inner: Arc<Inner>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                started: Instant::now(),
                entries: RwLock::new(HashMap::new()),
                total: Mutex::new(Entry::new()),
                journeys: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    fn now_second(&self) -> u64 {
        self.inner.started.elapsed().as_secs()
    }

    fn entry(&self, user_type: &str, action: &str) -> Arc<Mutex<Entry>> {
        let key = (user_type.to_string(), action.to_string());
        if let Some(entry) = self
            .inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return entry.clone();
        }
        self.inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Entry::new())))
            .clone()
    }

    /// Fold one outcome into the statistics.
    pub fn record(&self, user_type: &str, action: &str, outcome: &Outcome) {
        let second = self.now_second();
        let entry = self.entry(user_type, action);
        entry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(outcome, second);
        self.inner
            .total
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(outcome, second);
    }

    /// Count the end of a journey cycle (completed or aborted).
    pub fn record_journey_cycle(&self, journey: &str, state: JourneyState) {
        let mut journeys = self
            .inner
            .journeys
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let stats = journey_entry(&mut journeys, journey);
        match state {
            JourneyState::Completed => stats.completed += 1,
            JourneyState::Aborted { .. } => stats.aborted += 1,
            _ => {}
        }
    }

    /// Count a journey step skipped for an unmet precondition.
    pub fn record_step_skipped(&self, journey: &str) {
        let mut journeys = self
            .inner
            .journeys
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        journey_entry(&mut journeys, journey).skipped_steps += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Consistent copy of all statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.elapsed();
        let now_second = elapsed.as_secs();

        let handles: Vec<(EntryKey, Arc<Mutex<Entry>>)> = self
            .inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut copied: BTreeMap<EntryKey, Entry> = BTreeMap::new();
        for (key, handle) in handles {
            let entry = handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            copied.insert(key, entry);
        }
        let total = self
            .inner
            .total
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut by_action: BTreeMap<&str, Entry> = BTreeMap::new();
        let mut by_user_type: BTreeMap<&str, Entry> = BTreeMap::new();
        let mut failures = Vec::new();
        for ((user_type, action), entry) in &copied {
            by_action
                .entry(action.as_str())
                .or_insert_with(Entry::new)
                .merge(entry);
            by_user_type
                .entry(user_type.as_str())
                .or_insert_with(Entry::new)
                .merge(entry);
            for (reason, occurrences) in &entry.failures {
                failures.push(FailureRow {
                    user_type: user_type.clone(),
                    name: action.clone(),
                    reason: reason.clone(),
                    occurrences: *occurrences,
                });
            }
        }
        failures.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));

        let journeys = self
            .inner
            .journeys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        StatsSnapshot {
            elapsed_secs: elapsed.as_secs_f64(),
            entries: copied
                .iter()
                .map(|((user_type, action), e)| {
                    e.to_stats(Some(user_type), action, elapsed, now_second)
                })
                .collect(),
            by_action: by_action
                .iter()
                .map(|(action, e)| e.to_stats(None, action, elapsed, now_second))
                .collect(),
            by_user_type: by_user_type
                .iter()
                .map(|(user_type, e)| {
                    e.to_stats(Some(user_type), "Aggregated", elapsed, now_second)
                })
                .collect(),
            total: total.to_stats(None, "Aggregated", elapsed, now_second),
            journeys,
            failures,
        }
    }
}

fn journey_entry<'a>(
    journeys: &'a mut BTreeMap<String, JourneyStats>,
    name: &str,
) -> &'a mut JourneyStats {
    journeys
        .entry(name.to_string())
        .or_insert_with(|| JourneyStats {
            name: name.to_string(),
            ..JourneyStats::default()
        })
}

/// Render a snapshot as plain-text tables: requests, percentiles, failures
/// and journeys.
pub fn format_stats_table(snapshot: &StatsSnapshot) -> String {
    let mut out = String::new();
    let rule = "-".repeat(110);

    let _ = writeln!(
        out,
        "{:<18} {:<28} {:>8} {:>8} {:>9} {:>9} {:>9} {:>9} {:>8} {:>8}",
        "Type", "Name", "# reqs", "# fails", "Avg", "Min", "Max", "Med", "req/s", "fails/s"
    );
    let _ = writeln!(out, "{}", rule);
    let secs = snapshot.elapsed_secs.max(f64::EPSILON);
    let request_row = |out: &mut String, s: &AggregateStats| {
        let _ = writeln!(
            out,
            "{:<18} {:<28} {:>8} {:>8} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>8.2} {:>8.2}",
            s.user_type.as_deref().unwrap_or(""),
            s.name,
            s.count,
            format!("{}({:.0}%)", s.failure_count, s.failure_ratio() * 100.0),
            s.mean_ms,
            s.min_ms,
            s.max_ms,
            s.p50_ms,
            s.rps,
            s.failure_count as f64 / secs,
        );
    };
    for entry in &snapshot.entries {
        request_row(&mut out, entry);
    }
    let _ = writeln!(out, "{}", rule);
    request_row(&mut out, &snapshot.total);

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{:<18} {:<28} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9}",
        "Type", "Name", "# reqs", "50%", "90%", "95%", "99%", "99.9%"
    );
    let _ = writeln!(out, "{}", rule);
    let percentile_row = |out: &mut String, s: &AggregateStats| {
        let _ = writeln!(
            out,
            "{:<18} {:<28} {:>8} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2}",
            s.user_type.as_deref().unwrap_or(""),
            s.name,
            s.count,
            s.p50_ms,
            s.p90_ms,
            s.p95_ms,
            s.p99_ms,
            s.p99_9_ms,
        );
    };
    for entry in &snapshot.entries {
        percentile_row(&mut out, entry);
    }
    let _ = writeln!(out, "{}", rule);
    percentile_row(&mut out, &snapshot.total);

    if !snapshot.failures.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Error report");
        let _ = writeln!(out, "{:>8}  {:<40} {}", "# occ", "Type/Name", "Reason");
        let _ = writeln!(out, "{}", rule);
        for failure in &snapshot.failures {
            let _ = writeln!(
                out,
                "{:>8}  {:<40} {}",
                failure.occurrences,
                format!("{}/{}", failure.user_type, failure.name),
                failure.reason
            );
        }
    }

    if !snapshot.journeys.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:<30} {:>10} {:>10} {:>14}",
            "Journey", "completed", "aborted", "skipped steps"
        );
        let _ = writeln!(out, "{}", rule);
        for journey in &snapshot.journeys {
            let _ = writeln!(
                out,
                "{:<30} {:>10} {:>10} {:>14}",
                journey.name, journey.completed, journey.aborted, journey.skipped_steps
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;

    fn ok(ms: u64) -> Outcome {
        Outcome::success(200, Duration::from_millis(ms))
    }

    fn failed(reason: &str) -> Outcome {
        Outcome::failure(
            ErrorCategory::ServerError,
            Some(500),
            Duration::from_millis(5),
            reason,
        )
    }

    #[test]
    fn test_empty_snapshot() {
        let stats = StatsAggregator::new();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total.count, 0);
        assert_eq!(snapshot.total.p50_ms, 0.0);
        assert!(snapshot.entries.is_empty());
    }

    #[test]
    fn test_counts_and_latency_summary() {
        let stats = StatsAggregator::new();
        for ms in 1..=100 {
            stats.record("UserUser", "get_all_users", &ok(ms));
        }
        stats.record("UserUser", "create_user", &failed("unexpected status 500"));

        let snapshot = stats.snapshot();
        let users = snapshot.entry("UserUser", "get_all_users").unwrap();
        assert_eq!(users.count, 100);
        assert_eq!(users.success_count, 100);
        assert_eq!(users.min_ms, 1.0);
        assert_eq!(users.max_ms, 100.0);
        assert!((users.mean_ms - 50.5).abs() < 1e-9);
        // 3 significant digits: within 0.1% of the true quantile.
        assert!((users.p50_ms - 50.0).abs() <= 50.0 * 0.001 + 1e-9, "p50 {}", users.p50_ms);
        assert!((users.p99_ms - 99.0).abs() <= 99.0 * 0.001 + 1e-9, "p99 {}", users.p99_ms);

        assert_eq!(snapshot.total.count, 101);
        assert_eq!(snapshot.total.failure_count, 1);
        assert_eq!(snapshot.failures.len(), 1);
        assert_eq!(snapshot.failures[0].reason, "unexpected status 500");
        assert_eq!(snapshot.failures[0].name, "create_user");
    }

    #[test]
    fn test_rows_merged_across_user_types() {
        let stats = StatsAggregator::new();
        stats.record("JourneyUser", "health", &ok(10));
        stats.record("StressUser", "health", &ok(20));
        stats.record("StressUser", "list", &failed("boom"));

        let snapshot = stats.snapshot();
        let health = snapshot.action("health").unwrap();
        assert_eq!(health.count, 2);
        assert_eq!(health.min_ms, 10.0);
        assert_eq!(health.max_ms, 20.0);

        let stress = snapshot
            .by_user_type
            .iter()
            .find(|s| s.user_type.as_deref() == Some("StressUser"))
            .unwrap();
        assert_eq!(stress.count, 2);
        assert_eq!(stress.failure_count, 1);
        assert_eq!(stress.failures.get("boom"), Some(&1));
    }

    #[test]
    fn test_latency_above_range_is_clamped() {
        let stats = StatsAggregator::new();
        stats.record("U", "slow", &ok(120_000));
        let snapshot = stats.snapshot();
        let slow = snapshot.entry("U", "slow").unwrap();
        assert_eq!(slow.count, 1);
        assert_eq!(slow.max_ms, 120_000.0);
        assert!(slow.p99_ms <= 60_000.0 * 1.001);
    }

    #[test]
    fn test_journey_counters() {
        let stats = StatsAggregator::new();
        stats.record_journey_cycle("purchase", JourneyState::Completed);
        stats.record_journey_cycle("purchase", JourneyState::Aborted { step: 0 });
        stats.record_journey_cycle("purchase", JourneyState::Completed);
        stats.record_step_skipped("purchase");

        let snapshot = stats.snapshot();
        let purchase = snapshot.journey("purchase").unwrap();
        assert_eq!(purchase.completed, 2);
        assert_eq!(purchase.aborted, 1);
        assert_eq!(purchase.skipped_steps, 1);
    }

    #[test]
    fn test_concurrent_snapshots_consistent_and_monotone() {
        let stats = StatsAggregator::new();
        let mut writers = Vec::new();
        for t in 0..10 {
            let stats = stats.clone();
            writers.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let outcome = if (t + i) % 3 == 0 {
                        failed("unexpected status 500")
                    } else {
                        ok(i as u64 + 1)
                    };
                    stats.record("U", &format!("action_{}", t % 3), &outcome);
                }
            }));
        }

        let mut last_total = 0;
        let mut last_rows: HashMap<String, u64> = HashMap::new();
        while writers.iter().any(|w| !w.is_finished()) {
            let snapshot = stats.snapshot();
            for row in snapshot.entries.iter().chain(std::iter::once(&snapshot.total)) {
                assert_eq!(row.success_count + row.failure_count, row.count);
            }
            assert!(snapshot.total.count >= last_total);
            last_total = snapshot.total.count;
            for row in &snapshot.entries {
                let previous = last_rows.insert(row.name.clone(), row.count).unwrap_or(0);
                assert!(row.count >= previous);
            }
        }
        for writer in writers {
            writer.join().unwrap();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total.count, 1000);
        assert_eq!(
            snapshot.entries.iter().map(|e| e.count).sum::<u64>(),
            1000
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_rps_window() {
        let stats = StatsAggregator::new();
        for _ in 0..20 {
            stats.record("U", "a", &ok(1));
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        for _ in 0..10 {
            stats.record("U", "a", &ok(1));
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        // Seconds 0 and 1 complete: 30 requests over 2 seconds.
        let snapshot = stats.snapshot();
        assert!((snapshot.total.current_rps - 15.0).abs() < 1e-9);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(stats.snapshot().total.current_rps, 0.0);
    }

    #[test]
    fn test_format_stats_table() {
        let stats = StatsAggregator::new();
        stats.record("UserUser", "get_all_users", &ok(12));
        stats.record("UserUser", "get_all_users", &failed("unexpected status 503"));
        stats.record_journey_cycle("purchase", JourneyState::Completed);

        let table = format_stats_table(&stats.snapshot());
        assert!(table.contains("get_all_users"));
        assert!(table.contains("Aggregated"));
        assert!(table.contains("unexpected status 503"));
        assert!(table.contains("purchase"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = StatsAggregator::new();
        stats.record("U", "a", &ok(3));
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["total"]["count"], 1);
        assert_eq!(json["entries"][0]["user_type"], "U");
    }
}
