//! 📈 Prometheus Metrics
//!
//! Refresh counters, cycle duration, the published composite and per-status
//! factor counts. Registered once at startup and rendered on `/metrics`.

use log::warn;
use once_cell::sync::Lazy;
use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};

use crate::factors::FactorStatus;
use crate::pipeline::Snapshot;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REFRESH_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("gscore_refresh_total", "Total scoring cycles attempted").unwrap()
});

static REFRESH_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("gscore_refresh_failures_total", "Scoring cycles that failed").unwrap()
});

static REFRESH_DURATION: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("gscore_refresh_duration_seconds", "Scoring cycle duration")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0]),
    )
    .unwrap()
});

static COMPOSITE_SCORE: Lazy<Gauge> = Lazy::new(|| {
    Gauge::new("gscore_composite_score", "Latest published composite score").unwrap()
});

static FACTORS_FRESH: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("gscore_factors_fresh", "Fresh factors in latest cycle").unwrap());

static FACTORS_STALE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("gscore_factors_stale", "Stale factors in latest cycle").unwrap());

static FACTORS_EXCLUDED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("gscore_factors_excluded", "Excluded factors in latest cycle").unwrap()
});

/// Register all metrics. Safe to call once at startup.
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(REFRESH_TOTAL.clone()),
        Box::new(REFRESH_FAILURES.clone()),
        Box::new(REFRESH_DURATION.clone()),
        Box::new(COMPOSITE_SCORE.clone()),
        Box::new(FACTORS_FRESH.clone()),
        Box::new(FACTORS_STALE.clone()),
        Box::new(FACTORS_EXCLUDED.clone()),
    ];
    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            warn!("⚠️  Metric registration failed: {}", e);
        }
    }
}

/// Record one refresh attempt.
pub fn record_refresh(success: bool, duration_secs: f64) {
    REFRESH_TOTAL.inc();
    if !success {
        REFRESH_FAILURES.inc();
    }
    REFRESH_DURATION.observe(duration_secs);
}

/// Publish gauges from a completed snapshot.
pub fn observe_snapshot(snapshot: &Snapshot) {
    COMPOSITE_SCORE.set(snapshot.composite_score);
    let count = |status: FactorStatus| {
        snapshot.factors.iter().filter(|f| f.status == status).count() as i64
    };
    FACTORS_FRESH.set(count(FactorStatus::Fresh));
    FACTORS_STALE.set(count(FactorStatus::Stale));
    FACTORS_EXCLUDED.set(count(FactorStatus::Excluded));
}

/// Render the registry in Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("⚠️  Metrics encoding failed: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_after_recording() {
        init_metrics();
        record_refresh(true, 0.05);
        record_refresh(false, 0.10);
        let body = render();
        assert!(body.contains("gscore_refresh_total"));
        assert!(body.contains("gscore_refresh_failures_total"));
    }
}
