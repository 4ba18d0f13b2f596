// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Registry of the proxy's own metrics.
//!
//! The registry is constructed once by the binary and handed to every component as an
//! `Arc<TelemetryRegistry>`; there is no process-wide singleton. Each registered metric is
//! one of a closed set of kinds, and every kind can produce a single `f64` snapshot, which is
//! all the agent reporter ever reads:
//!
//! | kind      | snapshot                                  |
//! |-----------|-------------------------------------------|
//! | Counter   | total count since start                   |
//! | Gauge     | last value set                            |
//! | Timer     | mean duration in milliseconds             |
//! | Histogram | mean of the recorded values               |
//!
//! All updates are lock-free atomics; only registration takes the registry lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use tracing::error;

/// Monotonically increasing count
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last-value-wins measurement, stored as `f64` bits
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Adjusts the value by `delta`, so several owners can share one gauge
    pub fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    #[must_use]
    pub fn value(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Running statistics over unsigned samples
#[derive(Debug, Default)]
pub struct Histogram {
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    pub fn record(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / count as f64
    }
}

/// Durations, kept as a histogram of microseconds
#[derive(Debug, Default)]
pub struct Timer(Histogram);

impl Timer {
    pub fn record(&self, elapsed: Duration) {
        self.0
            .record(elapsed.as_micros().try_into().unwrap_or(u64::MAX));
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.0.count()
    }

    #[must_use]
    pub fn mean_millis(&self) -> f64 {
        self.0.mean() / 1000.0
    }
}

#[derive(Clone, Debug)]
pub enum Metric {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Timer(Arc<Timer>),
    Histogram(Arc<Histogram>),
}

impl Metric {
    #[must_use]
    pub fn snapshot(&self) -> f64 {
        match self {
            Metric::Counter(c) => c.count() as f64,
            Metric::Gauge(g) => g.value(),
            Metric::Timer(t) => t.mean_millis(),
            Metric::Histogram(h) => h.mean(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Metric::Counter(_) => "counter",
            Metric::Gauge(_) => "gauge",
            Metric::Timer(_) => "timer",
            Metric::Histogram(_) => "histogram",
        }
    }
}

#[derive(Debug, Default)]
pub struct TelemetryRegistry {
    metrics: RwLock<HashMap<String, Metric, FnvBuildHasher>>,
}

macro_rules! get_or_register {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        /// Returns the metric registered under `name`, registering it on first use.
        ///
        /// If `name` is already taken by another kind, the error is logged and a detached
        /// metric is returned so the caller keeps working; it will not be reported.
        pub fn $fn_name(&self, name: &str) -> Arc<$ty> {
            if let Some(existing) = self.get(name) {
                return match existing {
                    Metric::$variant(m) => m,
                    other => {
                        error!(
                            "Metric {} is already registered as a {}, not a {}",
                            name,
                            other.kind(),
                            stringify!($fn_name)
                        );
                        Arc::new(<$ty>::default())
                    }
                };
            }

            #[allow(clippy::expect_used)]
            let mut metrics = self.metrics.write().expect("lock poisoned");
            let entry = metrics
                .entry(name.to_string())
                .or_insert_with(|| Metric::$variant(Arc::new(<$ty>::default())));
            match entry {
                Metric::$variant(m) => Arc::clone(m),
                // lost a registration race against another kind
                _ => Arc::new(<$ty>::default()),
            }
        }
    };
}

impl TelemetryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    get_or_register!(counter, Counter, Counter);
    get_or_register!(gauge, Gauge, Gauge);
    get_or_register!(timer, Timer, Timer);
    get_or_register!(histogram, Histogram, Histogram);

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Metric> {
        #[allow(clippy::expect_used)]
        self.metrics.read().expect("lock poisoned").get(name).cloned()
    }

    /// Snapshot of every registered metric, sorted by name
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, f64)> {
        #[allow(clippy::expect_used)]
        let metrics = self.metrics.read().expect("lock poisoned");
        let mut values: Vec<(String, f64)> = metrics
            .iter()
            .map(|(name, metric)| (name.clone(), metric.snapshot()))
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        values
    }

    /// Snapshot as a JSON object of `name -> value`, the check-in payload format
    #[must_use]
    pub fn snapshot_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .snapshot()
            .into_iter()
            .map(|(name, value)| (name, serde_json::json!(value)))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Encodes a dotted version as `major * 10^6 + minor * 10^3 + patch`.
///
/// Missing parts count as zero, as do parts that are not numbers, so `"1.2"` encodes like
/// `"1.2.0"`. Parts past the patch are ignored and the sum is never scaled further.
#[must_use]
pub fn encode_version(version: &str) -> i64 {
    let mut parts = version
        .split('.')
        .map(|p| p.parse::<i64>().unwrap_or_default());
    let major = parts.next().unwrap_or_default();
    let minor = parts.next().unwrap_or_default();
    let patch = parts.next().unwrap_or_default();
    major * 1_000_000 + minor * 1_000 + patch
}
