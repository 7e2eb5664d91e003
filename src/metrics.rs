//! Metrics recording
//!
//! Thin wrappers over the `metrics` facade. Nothing is exported until the
//! embedding process installs a recorder (a Prometheus exporter, say); until
//! then every call is a no-op.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::job::JobState;

// ── Replication metrics ──────────────────────────────────────────────────────

/// Record a successful lag poll for a job
pub fn record_replication_lag(job_id: &str, lag_bytes: u64, eta: Option<Duration>) {
    let labels = [("job", job_id.to_string())];
    gauge!("pgshift_replication_lag_bytes", &labels).set(lag_bytes as f64);
    if let Some(eta) = eta {
        gauge!("pgshift_replication_lag_eta_seconds", &labels).set(eta.as_secs_f64());
    }
}

/// Record a lag poll that could not measure anything
pub fn record_replication_lag_unknown(job_id: &str) {
    let labels = [("job", job_id.to_string())];
    counter!("pgshift_replication_lag_unknown_total", &labels).increment(1);
}

// ── Job metrics ──────────────────────────────────────────────────────────────

/// Record a committed state transition
pub fn record_job_transition(from: JobState, to: JobState) {
    let labels = [("from", from.to_string()), ("to", to.to_string())];
    counter!("pgshift_job_transitions_total", &labels).increment(1);
}

// ── Failover drill metrics ───────────────────────────────────────────────────

/// Outcome label for a finished drill.
pub fn drill_outcome(promoted: bool, write_accepted: bool, within_sla: bool) -> &'static str {
    match (promoted, write_accepted, within_sla) {
        (false, _, _) => "no_promotion",
        (true, false, _) => "write_refused",
        (true, true, false) => "sla_missed",
        (true, true, true) => "passed",
    }
}

/// Record how a failover drill went
pub fn record_failover_drill(time_to_new_primary: Option<Duration>, outcome: &'static str) {
    if let Some(elapsed) = time_to_new_primary {
        histogram!("pgshift_failover_promotion_seconds").record(elapsed.as_secs_f64());
    }
    let labels = [("outcome", outcome.to_string())];
    counter!("pgshift_failover_drills_total", &labels).increment(1);
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use metrics::{
        Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata,
        Recorder, SharedString, Unit,
    };
    use parking_lot::Mutex;

    use super::*;

    type Values = Arc<Mutex<BTreeMap<String, f64>>>;

    /// Keeps the latest value of every series, keyed `name{label=value,..}`.
    #[derive(Default)]
    struct Capture {
        values: Values,
    }

    struct Series {
        key: String,
        values: Values,
    }

    impl CounterFn for Series {
        fn increment(&self, value: u64) {
            *self.values.lock().entry(self.key.clone()).or_default() += value as f64;
        }

        fn absolute(&self, value: u64) {
            self.values.lock().insert(self.key.clone(), value as f64);
        }
    }

    impl GaugeFn for Series {
        fn increment(&self, value: f64) {
            *self.values.lock().entry(self.key.clone()).or_default() += value;
        }

        fn decrement(&self, value: f64) {
            *self.values.lock().entry(self.key.clone()).or_default() -= value;
        }

        fn set(&self, value: f64) {
            self.values.lock().insert(self.key.clone(), value);
        }
    }

    impl HistogramFn for Series {
        fn record(&self, value: f64) {
            self.values.lock().insert(self.key.clone(), value);
        }
    }

    impl Capture {
        fn series(&self, key: &Key) -> Arc<Series> {
            let labels: Vec<String> = key
                .labels()
                .map(|l| format!("{}={}", l.key(), l.value()))
                .collect();
            Arc::new(Series {
                key: format!("{}{{{}}}", key.name(), labels.join(",")),
                values: Arc::clone(&self.values),
            })
        }

        fn get(&self, key: &str) -> Option<f64> {
            self.values.lock().get(key).copied()
        }
    }

    impl Recorder for Capture {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            Counter::from_arc(self.series(key))
        }

        fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::from_arc(self.series(key))
        }

        fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::from_arc(self.series(key))
        }
    }

    #[test]
    fn test_lag_gauges_follow_latest_poll() {
        let capture = Capture::default();
        metrics::with_local_recorder(&capture, || {
            record_replication_lag("orders", 4096, Some(Duration::from_millis(1500)));
            record_replication_lag("orders", 512, None);
            record_replication_lag_unknown("orders");
            record_replication_lag_unknown("orders");
        });
        assert_eq!(capture.get("pgshift_replication_lag_bytes{job=orders}"), Some(512.0));
        // no estimate on the second poll, so the first one stands
        assert_eq!(
            capture.get("pgshift_replication_lag_eta_seconds{job=orders}"),
            Some(1.5)
        );
        assert_eq!(
            capture.get("pgshift_replication_lag_unknown_total{job=orders}"),
            Some(2.0)
        );
    }

    #[test]
    fn test_transitions_counted_per_edge() {
        let capture = Capture::default();
        metrics::with_local_recorder(&capture, || {
            record_job_transition(JobState::Syncing, JobState::Synced);
            record_job_transition(JobState::Syncing, JobState::Synced);
            record_job_transition(JobState::Synced, JobState::CutoverInProgress);
        });
        let syncing = format!(
            "pgshift_job_transitions_total{{from={},to={}}}",
            JobState::Syncing,
            JobState::Synced
        );
        assert_eq!(capture.get(&syncing), Some(2.0));
        assert_eq!(capture.values.lock().len(), 2);
    }

    #[test]
    fn test_drill_outcomes() {
        assert_eq!(drill_outcome(false, false, false), "no_promotion");
        assert_eq!(drill_outcome(true, false, true), "write_refused");
        assert_eq!(drill_outcome(true, true, false), "sla_missed");
        assert_eq!(drill_outcome(true, true, true), "passed");

        let capture = Capture::default();
        metrics::with_local_recorder(&capture, || {
            record_failover_drill(Some(Duration::from_secs(4)), "passed");
            record_failover_drill(None, "no_promotion");
        });
        assert_eq!(capture.get("pgshift_failover_promotion_seconds{}"), Some(4.0));
        assert_eq!(
            capture.get("pgshift_failover_drills_total{outcome=passed}"),
            Some(1.0)
        );
        assert_eq!(
            capture.get("pgshift_failover_drills_total{outcome=no_promotion}"),
            Some(1.0)
        );
    }
}
