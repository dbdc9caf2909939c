//! Metrics registry: counters, gauges, histograms, threshold watch
//!
//! Updates are lock-free per series (`DashMap` shards). Every update feeds
//! the bounded in-memory time series and re-evaluates threshold watchers; a
//! watcher only fires once its condition has held continuously for its
//! configured duration, and the violation goes out as a bus signal for the
//! alerting engine.

use crate::bus::{Signal, SignalPublisher};
use crate::domain_types::Severity;
use crate::time_provider::SharedTimeProvider;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::debug;

/// Default histogram bucket upper bounds, in milliseconds-style magnitudes
const DEFAULT_BUCKETS: [f64; 10] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
];

/// Ring-buffer depth per series
const SERIES_CAPACITY: usize = 1000;

/// Series samples older than this are pruned
const SERIES_MAX_AGE: Duration = Duration::from_secs(2 * 60 * 60);

/// Identity of one series: metric name plus sorted labels
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl SeriesKey {
    /// Builds a key from a name and unsorted label pairs
    pub fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    fn render_labels(&self) -> String {
        if self.labels.is_empty() {
            return String::new();
        }
        let parts: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", v.replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", parts.join(","))
    }
}

#[derive(Debug, Clone)]
struct HistogramData {
    bounds: Vec<f64>,
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl HistogramData {
    fn new(bounds: &[f64]) -> Self {
        Self {
            bounds: bounds.to_vec(),
            counts: vec![0; bounds.len() + 1],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.bounds.len());
        self.counts[idx] += 1;
        self.sum += value;
        self.count += 1;
    }
}

/// Threshold watch over one metric name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdWatch {
    pub metric: String,
    pub warning: f64,
    pub critical: f64,
    /// The condition must hold continuously for this long before firing
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Copy)]
struct Exceeded {
    since_ms: u64,
    fired: bool,
}

/// In-memory metrics registry with Prometheus exposition
pub struct MetricsRegistry {
    counters: DashMap<SeriesKey, f64>,
    gauges: DashMap<SeriesKey, f64>,
    histograms: DashMap<SeriesKey, HistogramData>,
    series: DashMap<SeriesKey, VecDeque<(u64, f64)>>,
    watchers: Vec<ThresholdWatch>,
    exceeded: DashMap<SeriesKey, Exceeded>,
    publisher: SignalPublisher,
    time: SharedTimeProvider,
}

impl MetricsRegistry {
    /// Creates a registry with the given threshold watchers
    pub fn new(
        watchers: Vec<ThresholdWatch>,
        publisher: SignalPublisher,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
            series: DashMap::new(),
            watchers,
            exceeded: DashMap::new(),
            publisher,
            time,
        }
    }

    /// Increments a counter
    pub fn inc_counter(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let key = SeriesKey::new(name, labels);
        let value = {
            let mut entry = self.counters.entry(key.clone()).or_insert(0.0);
            *entry += delta;
            *entry
        };
        self.after_update(key, value);
    }

    /// Sets a gauge
    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = SeriesKey::new(name, labels);
        self.gauges.insert(key.clone(), value);
        self.after_update(key, value);
    }

    /// Records a histogram observation
    pub fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = SeriesKey::new(name, labels);
        {
            let mut entry = self
                .histograms
                .entry(key.clone())
                .or_insert_with(|| HistogramData::new(&DEFAULT_BUCKETS));
            entry.observe(value);
        }
        self.after_update(key, value);
    }

    /// Current counter value, 0 when never written
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.counters
            .get(&SeriesKey::new(name, labels))
            .map(|v| *v)
            .unwrap_or(0.0)
    }

    /// Current gauge value
    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges.get(&SeriesKey::new(name, labels)).map(|v| *v)
    }

    /// Renders every series in Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        let mut counters: Vec<(SeriesKey, f64)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        counters.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        let mut last_name = None;
        for (key, value) in counters {
            if last_name.as_deref() != Some(key.name.as_str()) {
                let _ = writeln!(out, "# TYPE {} counter", key.name);
                last_name = Some(key.name.clone());
            }
            let _ = writeln!(out, "{}{} {value}", key.name, key.render_labels());
        }

        let mut gauges: Vec<(SeriesKey, f64)> = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        gauges.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        let mut last_name = None;
        for (key, value) in gauges {
            if last_name.as_deref() != Some(key.name.as_str()) {
                let _ = writeln!(out, "# TYPE {} gauge", key.name);
                last_name = Some(key.name.clone());
            }
            let _ = writeln!(out, "{}{} {value}", key.name, key.render_labels());
        }

        let mut histograms: Vec<(SeriesKey, HistogramData)> = self
            .histograms
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        histograms.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        let mut last_name = None;
        for (key, data) in histograms {
            if last_name.as_deref() != Some(key.name.as_str()) {
                let _ = writeln!(out, "# TYPE {} histogram", key.name);
                last_name = Some(key.name.clone());
            }
            let mut cumulative = 0u64;
            for (bound, count) in data.bounds.iter().zip(data.counts.iter()) {
                cumulative += count;
                let mut labels = key.labels.clone();
                labels.insert("le".to_string(), format_bound(*bound));
                let rendered = SeriesKey {
                    name: key.name.clone(),
                    labels,
                };
                let _ = writeln!(
                    out,
                    "{}_bucket{} {cumulative}",
                    key.name,
                    rendered.render_labels()
                );
            }
            let mut labels = key.labels.clone();
            labels.insert("le".to_string(), "+Inf".to_string());
            let rendered = SeriesKey {
                name: key.name.clone(),
                labels,
            };
            let _ = writeln!(
                out,
                "{}_bucket{} {}",
                key.name,
                rendered.render_labels(),
                data.count
            );
            let _ = writeln!(out, "{}_sum{} {}", key.name, key.render_labels(), data.sum);
            let _ = writeln!(
                out,
                "{}_count{} {}",
                key.name,
                key.render_labels(),
                data.count
            );
        }

        out
    }

    /// Records the sample into the bounded series and re-evaluates watchers
    fn after_update(&self, key: SeriesKey, value: f64) {
        let now_ms = self.time.epoch_millis();
        {
            let mut series = self.series.entry(key.clone()).or_default();
            series.push_back((now_ms, value));
            while series.len() > SERIES_CAPACITY {
                series.pop_front();
            }
            let cutoff = now_ms.saturating_sub(SERIES_MAX_AGE.as_millis() as u64);
            while series.front().is_some_and(|(ts, _)| *ts < cutoff) {
                series.pop_front();
            }
        }
        self.evaluate_watchers(&key, value, now_ms);
    }

    fn evaluate_watchers(&self, key: &SeriesKey, value: f64, now_ms: u64) {
        for watch in self.watchers.iter().filter(|w| w.metric == key.name) {
            if value < watch.warning {
                self.exceeded.remove(key);
                continue;
            }

            let mut entry = self.exceeded.entry(key.clone()).or_insert(Exceeded {
                since_ms: now_ms,
                fired: false,
            });
            let held_ms = now_ms.saturating_sub(entry.since_ms);
            if held_ms < watch.duration_secs * 1000 {
                continue;
            }
            if entry.fired {
                continue;
            }
            entry.fired = true;

            let severity = if value >= watch.critical {
                Severity::Critical
            } else {
                Severity::High
            };
            let threshold = if value >= watch.critical {
                watch.critical
            } else {
                watch.warning
            };
            debug!(metric = %key.name, value, threshold, "threshold violation");
            self.publisher.publish(Signal::ThresholdViolation {
                metric: key.name.clone(),
                current_value: value,
                threshold,
                severity,
                labels: key
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>(),
                at: self.time.now_utc(),
            });
        }
    }
}

fn format_bound(bound: f64) -> String {
    if bound.fract() == 0.0 {
        format!("{}", bound as i64)
    } else {
        format!("{bound}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SignalBus;
    use crate::time_provider::test_time_provider;

    fn registry(watchers: Vec<ThresholdWatch>) -> (MetricsRegistry, SignalBus) {
        let bus = SignalBus::new();
        let registry = MetricsRegistry::new(watchers, bus.publisher(), test_time_provider());
        (registry, bus)
    }

    #[test]
    fn counters_accumulate() {
        let (registry, _bus) = registry(Vec::new());
        registry.inc_counter("events_processed_total", &[], 1.0);
        registry.inc_counter("events_processed_total", &[], 2.0);
        assert_eq!(registry.counter_value("events_processed_total", &[]), 3.0);
    }

    #[test]
    fn labeled_series_are_distinct() {
        let (registry, _bus) = registry(Vec::new());
        registry.inc_counter("tool_calls_total", &[("tool", "send_event")], 1.0);
        registry.inc_counter("tool_calls_total", &[("tool", "get_responses")], 1.0);
        assert_eq!(
            registry.counter_value("tool_calls_total", &[("tool", "send_event")]),
            1.0
        );
    }

    #[test]
    fn prometheus_rendering_includes_types_and_labels() {
        let (registry, _bus) = registry(Vec::new());
        registry.inc_counter("errors_total", &[("kind", "network")], 2.0);
        registry.set_gauge("memory_usage_bytes", &[], 1024.0);
        registry.observe_histogram("invoke_duration_ms", &[], 12.0);

        let text = registry.render_prometheus();
        assert!(text.contains("# TYPE errors_total counter"));
        assert!(text.contains("errors_total{kind=\"network\"} 2"));
        assert!(text.contains("# TYPE memory_usage_bytes gauge"));
        assert!(text.contains("# TYPE invoke_duration_ms histogram"));
        assert!(text.contains("invoke_duration_ms_bucket{le=\"+Inf\"} 1"));
        assert!(text.contains("invoke_duration_ms_count 1"));
    }

    #[tokio::test]
    async fn watcher_fires_only_after_duration_held() {
        let (registry, bus) = registry(vec![ThresholdWatch {
            metric: "queue_depth".to_string(),
            warning: 10.0,
            critical: 50.0,
            duration_secs: 0,
        }]);
        let mut rx = bus.subscribe();

        registry.set_gauge("queue_depth", &[], 60.0);
        match rx.recv().await.unwrap() {
            Signal::ThresholdViolation {
                metric,
                severity,
                threshold,
                ..
            } => {
                assert_eq!(metric, "queue_depth");
                assert_eq!(severity, Severity::Critical);
                assert_eq!(threshold, 50.0);
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[test]
    fn watcher_with_duration_does_not_fire_immediately() {
        let (registry, bus) = registry(vec![ThresholdWatch {
            metric: "queue_depth".to_string(),
            warning: 10.0,
            critical: 50.0,
            duration_secs: 300,
        }]);
        let mut rx = bus.subscribe();
        registry.set_gauge("queue_depth", &[], 60.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn recovery_resets_the_exceeded_clock() {
        let (registry, bus) = registry(vec![ThresholdWatch {
            metric: "queue_depth".to_string(),
            warning: 10.0,
            critical: 50.0,
            duration_secs: 0,
        }]);
        let mut rx = bus.subscribe();
        registry.set_gauge("queue_depth", &[], 60.0);
        assert!(rx.try_recv().is_ok());
        // drop below warning, then exceed again: a fresh violation fires
        registry.set_gauge("queue_depth", &[], 1.0);
        registry.set_gauge("queue_depth", &[], 70.0);
        assert!(rx.try_recv().is_ok());
    }
}
