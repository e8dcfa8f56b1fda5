use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Requests by route name and terminal decision (allow/challenge/deny).
pub static REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("satgate_requests_total", "Requests by route and decision"),
        &["route", "decision"],
    )
    .expect("metric definition")
});

/// 402 challenges issued, by tier and reason (none/calls_exhausted/budget_exhausted/...).
pub static CHALLENGES_ISSUED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("satgate_challenges_issued_total", "L402 challenges issued"),
        &["tier", "reason"],
    )
    .expect("metric definition")
});

/// Token validation failures, by failure kind.
pub static TOKENS_REJECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("satgate_tokens_rejected_total", "Token validation failures"),
        &["reason"],
    )
    .expect("metric definition")
});

/// Meter exhaustions, by quota kind (calls/budget).
pub static METER_EXHAUSTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("satgate_meter_exhausted_total", "Quota exhaustions"),
        &["kind"],
    )
    .expect("metric definition")
});

/// Times the primary metering store failed and the in-process fallback took over.
pub static METER_FALLBACKS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "satgate_meter_fallbacks_total",
        "Metering store failures degraded to the in-process fallback",
    )
    .expect("metric definition")
});

/// Upstream round-trip latency by upstream name.
pub static UPSTREAM_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "satgate_upstream_latency_seconds",
            "Upstream response latency",
        ),
        &["upstream"],
    )
    .expect("metric definition")
});

/// End-to-end decision latency (route match through policy verdict).
pub static DECISION_LATENCY: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "satgate_decision_latency_seconds",
        "Policy decision latency",
    ))
    .expect("metric definition")
});

/// Register all gateway metrics. Call once at startup.
pub fn register_metrics() {
    let registry = &*REGISTRY;
    let _ = registry.register(Box::new(REQUESTS_TOTAL.clone()));
    let _ = registry.register(Box::new(CHALLENGES_ISSUED.clone()));
    let _ = registry.register(Box::new(TOKENS_REJECTED.clone()));
    let _ = registry.register(Box::new(METER_EXHAUSTED.clone()));
    let _ = registry.register(Box::new(METER_FALLBACKS.clone()));
    let _ = registry.register(Box::new(UPSTREAM_LATENCY.clone()));
    let _ = registry.register(Box::new(DECISION_LATENCY.clone()));
}
