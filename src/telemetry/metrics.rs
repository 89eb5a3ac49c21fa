//! Pool and binding metrics.

use ::metrics::{counter, gauge};

use crate::session::PoolStats;

/// Count one bind, labelled by policy and whether the pool had to grow.
pub fn record_bind(policy: &'static str, created: bool) {
    let slot = if created { "created" } else { "reused" };
    counter!("mux_core_bind_total", "policy" => policy, "slot" => slot).increment(1);
}

/// Count tokens sent to the driver and tokens served from resident state.
pub fn record_tokens(evaluated: u64, reused: u64) {
    counter!("mux_core_tokens_evaluated_total").increment(evaluated);
    counter!("mux_core_tokens_reused_total").increment(reused);
}

/// Publish pool occupancy gauges.
pub fn record_pool(stats: &PoolStats) {
    gauge!("mux_core_pool_slots").set(stats.total as f64);
    gauge!("mux_core_pool_free_slots").set(stats.free as f64);
    gauge!("mux_core_pool_dedicated_slots").set(stats.dedicated as f64);
}
