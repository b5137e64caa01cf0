//! Metrics and Monitoring Module
//!
//! In-process metrics collection for THE APEX ENGINE with Prometheus text
//! exposition. Metric names and units are a stable contract; producers use
//! the constants below rather than ad-hoc strings.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Stable metric names.
pub mod names {
    pub const OPPORTUNITY_SUBMITTED_TOTAL: &str = "opportunity_submitted_total";
    pub const OPPORTUNITY_REJECTED_TOTAL: &str = "opportunity_rejected_total";
    pub const OPPORTUNITY_EXECUTED_TOTAL: &str = "opportunity_executed_total";
    pub const OPPORTUNITY_EXPIRED_TOTAL: &str = "opportunity_expired_total";
    pub const EXECUTION_LATENCY_MS: &str = "execution_latency_ms";
    pub const PROVIDER_LATENCY_MS: &str = "provider_latency_ms";
    pub const PROVIDER_SUCCESS_RATE: &str = "provider_success_rate";
    pub const CIRCUIT_STATE: &str = "circuit_state";
    pub const PORTFOLIO_VALUE: &str = "portfolio_value";
    pub const DRAWDOWN_PCT: &str = "drawdown_pct";
    pub const QUEUE_DEPTH: &str = "queue_depth";
}

/// Sink consumed by every pipeline component. Implementations must be cheap
/// and non-blocking; recording happens on the hot path.
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]);
    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64);
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);
}

/// Discards everything. Useful for benches.
#[derive(Debug, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn incr_counter(&self, _name: &str, _labels: &[(&str, &str)]) {}
    fn observe_histogram(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
    fn set_gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
}

#[derive(Debug, Default, Clone)]
struct HistogramData {
    count: u64,
    sum: f64,
}

/// Metrics collector for THE APEX ENGINE.
#[derive(Default)]
pub struct MetricsCollector {
    counters: Mutex<HashMap<String, u64>>,
    histograms: Mutex<HashMap<String, HistogramData>>,
    gauges: Mutex<HashMap<String, f64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
        if labels.is_empty() {
            return name.to_string();
        }
        let rendered: Vec<String> = labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("{}{{{}}}", name, rendered.join(","))
    }

    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = Self::series_key(name, labels);
        *self.counters.lock().get(&key).unwrap_or(&0)
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let key = Self::series_key(name, labels);
        self.gauges.lock().get(&key).copied()
    }

    pub fn histogram_count(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = Self::series_key(name, labels);
        self.histograms.lock().get(&key).map(|h| h.count).unwrap_or(0)
    }

    /// Export all recorded series in Prometheus text format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();
        {
            let counters = self.counters.lock();
            let mut keys: Vec<_> = counters.keys().collect();
            keys.sort();
            for key in keys {
                out.push_str(&format!("{} {}\n", key, counters[key]));
            }
        }
        {
            let gauges = self.gauges.lock();
            let mut keys: Vec<_> = gauges.keys().collect();
            keys.sort();
            for key in keys {
                out.push_str(&format!("{} {}\n", key, gauges[key]));
            }
        }
        {
            let histograms = self.histograms.lock();
            let mut keys: Vec<_> = histograms.keys().collect();
            keys.sort();
            for key in keys {
                let h = &histograms[key];
                let (base, labels) = match key.find('{') {
                    Some(idx) => (&key[..idx], &key[idx..]),
                    None => (key.as_str(), ""),
                };
                out.push_str(&format!("{}_count{} {}\n", base, labels, h.count));
                out.push_str(&format!("{}_sum{} {}\n", base, labels, h.sum));
            }
        }
        out
    }
}

impl MetricsSink for MetricsCollector {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let key = Self::series_key(name, labels);
        *self.counters.lock().entry(key).or_insert(0) += 1;
    }

    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = Self::series_key(name, labels);
        let mut histograms = self.histograms.lock();
        let entry = histograms.entry(key).or_default();
        entry.count += 1;
        entry.sum += value;
    }

    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = Self::series_key(name, labels);
        self.gauges.lock().insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_with_labels() {
        let collector = MetricsCollector::new();
        collector.incr_counter(names::OPPORTUNITY_SUBMITTED_TOTAL, &[("kind", "triangular")]);
        collector.incr_counter(names::OPPORTUNITY_SUBMITTED_TOTAL, &[("kind", "triangular")]);
        collector.incr_counter(names::OPPORTUNITY_SUBMITTED_TOTAL, &[("kind", "cross_venue")]);
        assert_eq!(
            collector.counter_value(names::OPPORTUNITY_SUBMITTED_TOTAL, &[("kind", "triangular")]),
            2
        );
        assert_eq!(
            collector.counter_value(names::OPPORTUNITY_SUBMITTED_TOTAL, &[("kind", "cross_venue")]),
            1
        );
    }

    #[test]
    fn test_histogram_aggregates() {
        let collector = MetricsCollector::new();
        collector.observe_histogram(names::EXECUTION_LATENCY_MS, &[("kind", "snipe")], 12.0);
        collector.observe_histogram(names::EXECUTION_LATENCY_MS, &[("kind", "snipe")], 20.0);
        assert_eq!(collector.histogram_count(names::EXECUTION_LATENCY_MS, &[("kind", "snipe")]), 2);
    }

    #[test]
    fn test_prometheus_export_contains_series() {
        let collector = MetricsCollector::new();
        collector.set_gauge(names::PORTFOLIO_VALUE, &[], 1234.5);
        collector.incr_counter(names::OPPORTUNITY_REJECTED_TOTAL, &[("reason", "queue_full")]);
        let text = collector.export_prometheus();
        assert!(text.contains("portfolio_value 1234.5"));
        assert!(text.contains("opportunity_rejected_total{reason=\"queue_full\"} 1"));
    }
}
