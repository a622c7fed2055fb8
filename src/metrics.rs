use tracing::trace;

// Lightweight metrics helpers. These intentionally avoid pulling in metrics
// macros; a collector can scrape them out of the trace stream.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "bazaar.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "bazaar.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
