//! Tracing and telemetry instrumentation.
//!
//! Span helpers for the hot coordination paths plus record functions that
//! log and, with the `metrics` feature, update Prometheus series. Every
//! function is a cheap no-op observability-wise when the feature is off.

use std::future::Future;
use tracing::{info_span, Instrument, Span};

/// Span around handling one control-plane envelope.
#[must_use]
pub fn dispatch_span(kind: impl AsRef<str>, sender: impl AsRef<str>) -> Span {
    info_span!(
        "weft.dispatch",
        kind = %kind.as_ref(),
        sender = %sender.as_ref(),
    )
}

/// Span around one barrier from start to local completion.
#[must_use]
pub fn barrier_span(uuid: impl AsRef<str>) -> Span {
    info_span!(
        "weft.barrier",
        uuid = %uuid.as_ref(),
    )
}

/// Span around one object transfer from request to completion.
#[must_use]
pub fn transfer_span(object: impl AsRef<str>, referrer: impl AsRef<str>) -> Span {
    info_span!(
        "weft.transfer",
        object = %object.as_ref(),
        referrer = %referrer.as_ref(),
    )
}

/// Span around one module execution step.
#[must_use]
pub fn execute_span(module: impl AsRef<str>, what: impl AsRef<str>) -> Span {
    info_span!(
        "weft.execute",
        module = %module.as_ref(),
        what = %what.as_ref(),
    )
}

/// Instrument a future with a transfer span.
pub fn instrument_transfer<F>(
    object: impl AsRef<str>,
    referrer: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let span = transfer_span(object, referrer);
    future.instrument(span)
}

pub fn record_execute_issued(module: impl AsRef<str>, what: impl AsRef<str>) {
    tracing::info!(
        module = %module.as_ref(),
        what = %what.as_ref(),
        "execute issued"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_execute_issued(module.as_ref(), what.as_ref());
}

pub fn record_barrier_completed(uuid: impl AsRef<str>, duration_secs: f64) {
    tracing::info!(
        uuid = %uuid.as_ref(),
        duration_secs = duration_secs,
        "barrier completed locally"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_barrier_duration(duration_secs);
}

pub fn record_transfer_completed(object: impl AsRef<str>, duration_secs: f64) {
    tracing::debug!(
        object = %object.as_ref(),
        duration_secs = duration_secs,
        "transfer completed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_transfer_completed(duration_secs);
}

/// Update the gauge of objects currently in transit toward this rank.
pub fn set_in_transit(count: usize) {
    tracing::trace!(count, "in-transit object count updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_in_transit(count as f64);
}

/// Start timing an operation; pair with one of the `record_*` functions.
pub fn start_timing() -> TimingHandle {
    TimingHandle { start: std::time::Instant::now() }
}

#[derive(Debug)]
pub struct TimingHandle {
    start: std::time::Instant,
}

impl TimingHandle {
    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
