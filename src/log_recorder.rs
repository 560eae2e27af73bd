// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use log::info;
use metrics::Counter;
use metrics::Gauge;
use metrics::Histogram;
use metrics::Key;
use metrics::KeyName;
use metrics::Label;
use metrics::Metadata;
use metrics::Recorder;
use metrics::SharedString;
use metrics::Unit;
use metrics_util::registry::AtomicStorage;
use metrics_util::registry::Registry;

/// Collects run metrics in memory and logs them once the run is over.
///
/// Clones share one registry, so a clone can be installed as the global
/// recorder while the caller keeps another for `report()`.
#[derive(Clone)]
pub struct LogRecorder {
    registry: Arc<Registry<Key, AtomicStorage>>,
}

impl Default for LogRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder for LogRecorder {
    // Descriptions and units aren't reported.
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.registry
            .get_or_create_counter(key, |c| Counter::from_arc(c.clone()))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry
            .get_or_create_gauge(key, |g| Gauge::from_arc(g.clone()))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.registry
            .get_or_create_histogram(key, |h| Histogram::from_arc(h.clone()))
    }
}

fn fmt_key(key: &Key) -> String {
    let labels: Vec<String> = key
        .labels()
        .map(|l| format!("{}={}", l.key(), l.value()))
        .collect();
    if labels.is_empty() {
        key.name().to_string()
    } else {
        format!("{}{{{}}}", key.name(), labels.join(","))
    }
}

impl LogRecorder {
    pub fn new() -> Self {
        LogRecorder {
            registry: Arc::new(Registry::<Key, AtomicStorage>::atomic()),
        }
    }

    /// Current value of counter `name` with `labels`, 0 if never touched.
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let labels: Vec<Label> = labels
            .iter()
            .map(|(k, v)| Label::new(k.to_string(), v.to_string()))
            .collect();
        let key = Key::from_parts(name.to_string(), labels);
        match self.registry.get_counter(&key) {
            Some(counter) => counter.load(Relaxed),
            None => 0,
        }
    }

    /// Samples recorded so far into histogram `name`.
    pub fn histogram_values(&self, name: &str) -> Vec<f64> {
        let key = Key::from_name(name.to_string());
        match self.registry.get_histogram(&key) {
            Some(bucket) => bucket.data(),
            None => vec![],
        }
    }

    pub fn report(&self) {
        let mut counters: Vec<(String, u64)> = vec![];
        self.registry.visit_counters(|key, counter| {
            counters.push((fmt_key(key), counter.load(Relaxed)));
        });
        counters.sort();
        for (name, value) in counters.iter() {
            info!("{:<40} {:>12}", name, value);
        }

        let mut histograms: Vec<(String, Vec<f64>)> = vec![];
        self.registry.visit_histograms(|key, bucket| {
            histograms.push((fmt_key(key), bucket.data()));
        });
        histograms.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, data) in histograms.iter() {
            if data.is_empty() {
                continue;
            }
            let max = data.iter().copied().fold(f64::MIN, f64::max);
            let mean = data.iter().sum::<f64>() / data.len() as f64;
            info!(
                "{:<40} n={} mean={:.4} max={:.4}",
                name,
                data.len(),
                mean,
                max
            );
        }
    }
}
