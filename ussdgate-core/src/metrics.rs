// ABOUTME: Prometheus metrics for the USSD gateway via the metrics facade.
// ABOUTME: Counters for inbound outcomes, fulfillments, sweeps and pushes; session gauge; wait histogram.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder once per process and return its handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    Ok(HANDLE.get_or_init(|| handle).clone())
}

/// `outcome` is one of: reply, terminal, timeout, ingest_failed, bad_request, not_found.
pub fn record_inbound(outcome: &'static str) {
    counter!("ussd_inbound_total", "outcome" => outcome).increment(1);
}

pub fn record_fulfill(delivered: bool) {
    let label = if delivered { "true" } else { "false" };
    counter!("ussd_fulfill_total", "delivered" => label).increment(1);
}

pub fn record_sessions_swept(count: usize) {
    if count > 0 {
        counter!("ussd_sessions_swept_total").increment(count as u64);
    }
}

pub fn set_active_sessions(count: usize) {
    gauge!("ussd_sessions_active").set(count as f64);
}

pub fn record_wait(elapsed: Duration) {
    histogram!("ussd_wait_seconds").record(elapsed.as_secs_f64());
}

/// `result` is one of: wired, failed, unsupported.
pub fn record_push(result: &'static str) {
    counter!("ussd_push_total", "result" => result).increment(1);
}
