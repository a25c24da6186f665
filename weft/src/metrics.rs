//! Prometheus metrics, compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! - `weft_executes_total` (counter) - execute messages issued to modules
//! - `weft_transfers_completed_total` (counter) - finished object transfers
//! - `weft_in_transit_objects` (gauge) - objects currently inbound
//! - `weft_barrier_duration_seconds` (histogram) - local barrier latency
//! - `weft_transfer_duration_seconds` (histogram) - object transfer latency
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for engine metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static EXECUTES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("weft_executes_total", "Execute messages issued to modules");
    let counter = CounterVec::new(opts, &["module", "what"])
        .expect("weft_executes_total metric creation failed");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("weft_executes_total registration failed");
    counter
});

pub static TRANSFERS_COMPLETED_TOTAL: LazyLock<prometheus::Counter> = LazyLock::new(|| {
    let counter = prometheus::Counter::new(
        "weft_transfers_completed_total",
        "Finished inbound object transfers",
    )
    .expect("weft_transfers_completed_total metric creation failed");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("weft_transfers_completed_total registration failed");
    counter
});

pub static IN_TRANSIT_OBJECTS: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new("weft_in_transit_objects", "Objects currently inbound")
        .expect("weft_in_transit_objects metric creation failed");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("weft_in_transit_objects registration failed");
    gauge
});

pub static BARRIER_DURATION_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        "weft_barrier_duration_seconds",
        "Time from barrier start to local completion",
    )
    .buckets(exponential_buckets(0.001, 2.0, 14).expect("bucket layout"));
    let histogram =
        Histogram::with_opts(opts).expect("weft_barrier_duration_seconds metric creation failed");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("weft_barrier_duration_seconds registration failed");
    histogram
});

pub static TRANSFER_DURATION_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        "weft_transfer_duration_seconds",
        "Time from object request to completion",
    )
    .buckets(exponential_buckets(0.001, 2.0, 14).expect("bucket layout"));
    let histogram =
        Histogram::with_opts(opts).expect("weft_transfer_duration_seconds metric creation failed");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("weft_transfer_duration_seconds registration failed");
    histogram
});

pub fn record_execute_issued(module: &str, what: &str) {
    EXECUTES_TOTAL.with_label_values(&[module, what]).inc();
}

pub fn record_transfer_completed(duration_secs: f64) {
    TRANSFERS_COMPLETED_TOTAL.inc();
    TRANSFER_DURATION_SECONDS.observe(duration_secs);
}

pub fn set_in_transit(count: f64) {
    IN_TRANSIT_OBJECTS.set(count);
}

pub fn observe_barrier_duration(duration_secs: f64) {
    BARRIER_DURATION_SECONDS.observe(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once() {
        record_execute_issued("module:1", "Prepare");
        record_execute_issued("module:1", "Prepare");
        record_transfer_completed(0.01);
        set_in_transit(3.0);
        observe_barrier_duration(0.002);
        assert!(!REGISTRY.gather().is_empty());
    }
}
