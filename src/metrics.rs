//! Observability surface
//!
//! Every observation the coordinator emits, under one roof so names and
//! labels stay consistent. Exporters plug in through the `metrics` facade
//! (Prometheus, statsd, ...) without this crate taking a side.

use crate::breaker::CircuitState;
use metrics::{counter, gauge, histogram};

pub const ITEMS_SUBMITTED_TOTAL: &str = "items_submitted_total";
pub const ITEMS_DROPPED_TOTAL: &str = "items_dropped_total";
pub const QUEUE_DEPTH: &str = "queue_depth";
pub const WORKERS_ALIVE: &str = "workers_alive";
pub const CIRCUIT_STATE: &str = "circuit_state";
pub const BATCHES_WRITTEN_TOTAL: &str = "batches_written_total";
pub const WRITE_ERRORS_TOTAL: &str = "write_errors_total";
pub const WRITE_LATENCY_SECONDS: &str = "write_latency_seconds";

pub(crate) fn submitted(coord_id: &str, count: u64) {
    counter!(ITEMS_SUBMITTED_TOTAL, "coord_id" => coord_id.to_string()).increment(count);
}

pub(crate) fn dropped(coord_id: &str, reason: &'static str, count: u64) {
    counter!(ITEMS_DROPPED_TOTAL, "coord_id" => coord_id.to_string(), "reason" => reason)
        .increment(count);
}

pub(crate) fn queue_depth(coord_id: &str, depth: usize) {
    gauge!(QUEUE_DEPTH, "coord_id" => coord_id.to_string()).set(depth as f64);
}

pub(crate) fn workers_alive(coord_id: &str, alive: usize) {
    gauge!(WORKERS_ALIVE, "coord_id" => coord_id.to_string()).set(alive as f64);
}

pub(crate) fn circuit_state(coord_id: &str, state: CircuitState) {
    gauge!(CIRCUIT_STATE, "coord_id" => coord_id.to_string()).set(state.as_gauge() as f64);
}

pub(crate) fn batch_written(coord_id: &str, worker_id: usize) {
    counter!(
        BATCHES_WRITTEN_TOTAL,
        "coord_id" => coord_id.to_string(),
        "worker_id" => worker_id.to_string()
    )
    .increment(1);
}

pub(crate) fn write_error(coord_id: &str, worker_id: usize, error_kind: &'static str) {
    counter!(
        WRITE_ERRORS_TOTAL,
        "coord_id" => coord_id.to_string(),
        "worker_id" => worker_id.to_string(),
        "error_kind" => error_kind
    )
    .increment(1);
}

pub(crate) fn write_latency(coord_id: &str, worker_id: usize, seconds: f64) {
    histogram!(
        WRITE_LATENCY_SECONDS,
        "coord_id" => coord_id.to_string(),
        "worker_id" => worker_id.to_string()
    )
    .record(seconds);
}
