use tracing_subscriber::EnvFilter;

use crate::types::EndpointId;

/// Install a global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to `info`. Calling this
/// twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::counter!(name).increment(1);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_endpoint(name: &'static str, endpoint_id: &EndpointId) {
    metrics::counter!(name, "endpoint" => endpoint_id.0.clone()).increment(1);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_endpoint(_name: &'static str, _endpoint_id: &EndpointId) {}
