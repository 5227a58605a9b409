use tracing::trace;

// Lightweight metric helpers on top of tracing. The Prometheus recorder in
// main.rs picks up request counters; these trace events cover the rest
// without threading a registry through every module.

pub fn inc_requests(route: &'static str) {
    trace!(target = "vault.metrics", route = route, "requests_total_inc");
}

pub fn op_elapsed(op: &'static str, elapsed_ms: u128) {
    trace!(
        target = "vault.metrics",
        op = op,
        elapsed_ms = elapsed_ms as u64,
        "op_elapsed"
    );
}

pub fn queue_depth(depth: usize) {
    trace!(target = "vault.metrics", depth = depth, "relist_queue_depth");
}
