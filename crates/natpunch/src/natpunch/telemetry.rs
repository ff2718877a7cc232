use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::natpunch::tunnel::frame::Flag;

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup. Without it every metric below is a no-op.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

#[derive(Debug, Clone, Copy)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Server => "server",
        }
    }
}

pub fn frame_rx(side: Side, flag: Flag) {
    metrics::counter!("natpunch_frames_rx_total", "side" => side.as_str(), "flag" => flag.as_str())
        .increment(1);
}

pub fn frame_tx(side: Side, flag: Flag) {
    metrics::counter!("natpunch_frames_tx_total", "side" => side.as_str(), "flag" => flag.as_str())
        .increment(1);
}

/// `reason` is a short static label such as `"malformed"` or `"unknown_flow"`.
pub fn frame_dropped(side: Side, reason: &'static str) {
    metrics::counter!("natpunch_frames_dropped_total", "side" => side.as_str(), "reason" => reason)
        .increment(1);
}

pub fn session_registered() {
    metrics::counter!("natpunch_sessions_registered_total").increment(1);
}

pub fn session_evicted(reason: &'static str) {
    metrics::counter!("natpunch_sessions_evicted_total", "reason" => reason).increment(1);
}

pub fn active_sessions(n: usize) {
    metrics::gauge!("natpunch_sessions_active").set(n as f64);
}

pub fn client_reconnect() {
    metrics::counter!("natpunch_client_reconnects_total").increment(1);
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
