//! Tollgate Metrics
//!
//! An explicit metrics value constructed at startup and threaded to the
//! components that emit. Counters and gauges are lock-free atomics;
//! labeled families keep their label maps behind an RwLock. `render()`
//! produces Prometheus text exposition format.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge that can move both ways.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn add(&self, n: i64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sub(&self, n: i64) {
        self.value.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Bucketed histogram of millisecond durations.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<u64>) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: u64) {
        let idx = self
            .bounds
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }
}

/// Counter family keyed by one label value.
#[derive(Debug, Default)]
pub struct LabeledCounter {
    series: RwLock<HashMap<String, Arc<Counter>>>,
}

impl LabeledCounter {
    pub fn inc_by(&self, label: &str, n: u64) {
        if let Some(counter) = self.series.read().get(label) {
            counter.inc_by(n);
            return;
        }
        let mut series = self.series.write();
        series
            .entry(label.to_string())
            .or_insert_with(|| Arc::new(Counter::default()))
            .inc_by(n);
    }

    pub fn inc(&self, label: &str) {
        self.inc_by(label, 1);
    }

    pub fn get(&self, label: &str) -> u64 {
        self.series
            .read()
            .get(label)
            .map(|c| c.get())
            .unwrap_or(0)
    }

    fn snapshot(&self) -> Vec<(String, u64)> {
        let mut entries: Vec<_> = self
            .series
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.get()))
            .collect();
        entries.sort();
        entries
    }
}

/// All meters emitted by the egress accounting service.
#[derive(Debug)]
pub struct Metrics {
    environment: String,
    /// Egress batches tracked, per node.
    pub tracked_batches: LabeledCounter,
    /// Consolidated bytes, per node.
    pub consolidated_bytes: LabeledCounter,
    /// Batches pending consolidation.
    pub unprocessed_batches: Gauge,
    /// Wall time of each consolidation run, milliseconds.
    pub consolidation_runs: Histogram,
}

impl Metrics {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            tracked_batches: LabeledCounter::default(),
            consolidated_bytes: LabeledCounter::default(),
            unprocessed_batches: Gauge::default(),
            consolidation_runs: Histogram::new(vec![
                10, 50, 100, 500, 1_000, 5_000, 10_000, 30_000, 60_000,
            ]),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Render all meters in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let env = &self.environment;

        let _ = writeln!(
            out,
            "# HELP tollgate_tracked_batches_total Total number of egress batches tracked per node"
        );
        let _ = writeln!(out, "# TYPE tollgate_tracked_batches_total counter");
        for (node, value) in self.tracked_batches.snapshot() {
            let _ = writeln!(
                out,
                "tollgate_tracked_batches_total{{node=\"{node}\",env=\"{env}\"}} {value}"
            );
        }

        let _ = writeln!(
            out,
            "# HELP tollgate_consolidated_bytes_total Total consolidated bytes per node"
        );
        let _ = writeln!(out, "# TYPE tollgate_consolidated_bytes_total counter");
        for (node, value) in self.consolidated_bytes.snapshot() {
            let _ = writeln!(
                out,
                "tollgate_consolidated_bytes_total{{node=\"{node}\",env=\"{env}\"}} {value}"
            );
        }

        let _ = writeln!(
            out,
            "# HELP tollgate_unprocessed_batches_total Total number of unprocessed batches"
        );
        let _ = writeln!(out, "# TYPE tollgate_unprocessed_batches_total gauge");
        let _ = writeln!(
            out,
            "tollgate_unprocessed_batches_total{{env=\"{env}\"}} {}",
            self.unprocessed_batches.get()
        );

        let _ = writeln!(
            out,
            "# HELP tollgate_consolidation_run_duration_ms Time in milliseconds for each consolidation run"
        );
        let _ = writeln!(out, "# TYPE tollgate_consolidation_run_duration_ms histogram");
        let hist = &self.consolidation_runs;
        let mut cumulative = 0u64;
        for (i, bound) in hist.bounds.iter().enumerate() {
            cumulative += hist.buckets[i].load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "tollgate_consolidation_run_duration_ms_bucket{{le=\"{bound}\",env=\"{env}\"}} {cumulative}"
            );
        }
        let _ = writeln!(
            out,
            "tollgate_consolidation_run_duration_ms_bucket{{le=\"+Inf\",env=\"{env}\"}} {}",
            hist.count()
        );
        let _ = writeln!(
            out,
            "tollgate_consolidation_run_duration_ms_sum{{env=\"{env}\"}} {}",
            hist.sum()
        );
        let _ = writeln!(
            out,
            "tollgate_consolidation_run_duration_ms_count{{env=\"{env}\"}} {}",
            hist.count()
        );

        out
    }
}
