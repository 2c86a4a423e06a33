//! ✅ Composite Validator
//!
//! Independent audit path for a published composite: re-derives the
//! expected value from the same factor list and adjustment values through
//! its own renormalize → weighted-sum → adjust → clamp arithmetic, and
//! asserts the published value matches within a fixed tolerance. Runs
//! post-hoc (tests, monitoring jobs), never in the serving hot path, and
//! never mutates state.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::{ModelConfig, WEIGHT_SUM_TOLERANCE};
use crate::factors::FactorSummary;
use crate::scoring::composite::{apply_sensitivity, clamp_score};

/// Tolerance on |expected - published|, accounting for independent rounding
/// paths on either side.
pub const COMPOSITE_TOLERANCE: f64 = 0.5;

/// Structured validation outcome, suitable for logging/alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub delta: f64,
    pub expected: f64,
    pub actual: f64,
    pub raw_composite: f64,
    /// Sum of renormalized weights over the included set (should be 1.0)
    pub total_weight: f64,
    pub included_factors: Vec<String>,
    pub excluded_count: usize,
    /// Whether configured enabled weights sum to 1.0 (of 100 pct points)
    pub weight_sum_ok: bool,
}

/// Structural invariant, distinct from the per-cycle composite check:
/// enabled configured factor weights must sum to 1.0 (100 percentage
/// points) within tolerance.
pub fn validate_weight_structure(cfg: &ModelConfig) -> bool {
    let sum: f64 = cfg.enabled_factors().map(|f| f.weight).sum();
    (sum / 100.0 - 1.0).abs() <= WEIGHT_SUM_TOLERANCE
}

/// Re-derive the expected composite and compare against the published one.
///
/// `cycle_adj_pts`/`spike_adj_pts` are the adjustment values as actually
/// published alongside the composite.
pub fn validate_composite_score(
    factors: &[FactorSummary],
    published_composite: f64,
    cycle_adj_pts: f64,
    spike_adj_pts: f64,
    cfg: &ModelConfig,
) -> ValidationReport {
    // Own renormalization loop, deliberately not shared with the aggregator
    let usable: Vec<&FactorSummary> = factors.iter().filter(|f| f.is_usable()).collect();
    let enabled_usable: Vec<&FactorSummary> = usable
        .iter()
        .copied()
        .filter(|f| {
            cfg.enabled_factors()
                .any(|c| c.key == f.key && c.weight > 0.0)
        })
        .collect();

    let configured_total: f64 = enabled_usable
        .iter()
        .map(|f| cfg.factor(&f.key).map(|c| c.weight).unwrap_or(0.0))
        .sum();

    let weight_sum_ok = validate_weight_structure(cfg);

    if enabled_usable.is_empty() || configured_total <= 0.0 {
        warn!("⚠️  Validator: no usable weighted factors to recompute from");
        return ValidationReport {
            valid: false,
            delta: f64::NAN,
            expected: f64::NAN,
            actual: published_composite,
            raw_composite: f64::NAN,
            total_weight: 0.0,
            included_factors: Vec::new(),
            excluded_count: factors.len(),
            weight_sum_ok,
        };
    }

    let mut total_weight = 0.0;
    let mut weighted_sum = 0.0;
    for f in &enabled_usable {
        let w = cfg.factor(&f.key).map(|c| c.weight).unwrap_or(0.0) / configured_total;
        total_weight += w;
        weighted_sum += f.score.unwrap_or(0.0) * w;
    }

    let raw_composite = weighted_sum.round();
    let adjusted = clamp_score(raw_composite + cycle_adj_pts + spike_adj_pts);
    let expected = apply_sensitivity(adjusted, &cfg.policy.sensitivity);

    let delta = (expected - published_composite).abs();
    let valid = delta <= COMPOSITE_TOLERANCE && weight_sum_ok;

    if !valid {
        warn!(
            "⚠️  Composite validation failed: expected {:.2}, published {:.2} (delta {:.2})",
            expected, published_composite, delta
        );
    }

    ValidationReport {
        valid,
        delta,
        expected,
        actual: published_composite,
        raw_composite,
        total_weight,
        included_factors: enabled_usable.iter().map(|f| f.key.clone()).collect(),
        excluded_count: factors.len() - enabled_usable.len(),
        weight_sum_ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_model_config;
    use crate::factors::FactorStatus;
    use crate::scoring::composite::{aggregate, finalize};

    fn fresh_factors(cfg: &ModelConfig, scores: &[(&str, f64)]) -> Vec<FactorSummary> {
        scores
            .iter()
            .map(|(key, score)| {
                let fc = cfg.factor(key).unwrap();
                FactorSummary {
                    key: fc.key.clone(),
                    label: fc.label.clone(),
                    pillar: fc.pillar.clone(),
                    counts_toward: None,
                    weight: fc.weight,
                    score: Some(*score),
                    status: FactorStatus::Fresh,
                    last_updated_utc: None,
                    reason: None,
                    source: None,
                }
            })
            .collect()
    }

    #[test]
    fn test_round_trip_validates() {
        let cfg = default_model_config();
        let factors = fresh_factors(
            &cfg,
            &[
                ("stablecoins", 40.0),
                ("trend_valuation", 55.0),
                ("term_leverage", 70.0),
                ("social_interest", 30.0),
            ],
        );
        let raw = aggregate(&factors, &cfg).unwrap();
        let result = finalize(&raw, 1.2, -0.4, &cfg);

        let report =
            validate_composite_score(&factors, result.final_composite, 1.2, -0.4, &cfg);
        assert!(report.valid, "round trip must validate: {:?}", report);
        assert!(report.delta <= COMPOSITE_TOLERANCE);
        assert!((report.total_weight - 1.0).abs() < 1e-9);
        assert_eq!(report.included_factors.len(), 4);
        assert!(report.weight_sum_ok);
    }

    #[test]
    fn test_detects_corrupted_composite() {
        let cfg = default_model_config();
        let factors = fresh_factors(&cfg, &[("stablecoins", 40.0), ("trend_valuation", 60.0)]);
        let raw = aggregate(&factors, &cfg).unwrap();
        let result = finalize(&raw, 0.0, 0.0, &cfg);

        // Off by 10 points must fail
        let report = validate_composite_score(
            &factors,
            result.final_composite + 10.0,
            0.0,
            0.0,
            &cfg,
        );
        assert!(!report.valid);
        assert!(report.delta > COMPOSITE_TOLERANCE);
    }

    #[test]
    fn test_validator_respects_adjustments_and_clamp() {
        let cfg = default_model_config();
        let factors = fresh_factors(&cfg, &[("stablecoins", 99.0), ("trend_valuation", 99.0)]);
        let raw = aggregate(&factors, &cfg).unwrap();
        let result = finalize(&raw, 2.0, 3.0, &cfg);
        assert_eq!(result.final_composite, 100.0);

        let report = validate_composite_score(&factors, 100.0, 2.0, 3.0, &cfg);
        assert!(report.valid);
    }

    #[test]
    fn test_stale_and_excluded_factors_ignored() {
        let cfg = default_model_config();
        let mut factors = fresh_factors(&cfg, &[("stablecoins", 40.0), ("trend_valuation", 60.0)]);
        factors.push(FactorSummary {
            key: "term_leverage".to_string(),
            label: "Term".to_string(),
            pillar: "term_structure".to_string(),
            counts_toward: None,
            weight: 20.0,
            score: Some(95.0),
            status: FactorStatus::Stale,
            last_updated_utc: None,
            reason: Some("stale_beyond_ttl".to_string()),
            source: None,
        });

        let raw = aggregate(&factors, &cfg).unwrap();
        let result = finalize(&raw, 0.0, 0.0, &cfg);
        let report = validate_composite_score(&factors, result.final_composite, 0.0, 0.0, &cfg);
        assert!(report.valid);
        assert_eq!(report.excluded_count, 1);
        assert!(!report.included_factors.contains(&"term_leverage".to_string()));
    }

    #[test]
    fn test_no_usable_factors_is_invalid() {
        let cfg = default_model_config();
        let report = validate_composite_score(&[], 50.0, 0.0, 0.0, &cfg);
        assert!(!report.valid);
        assert!(report.delta.is_nan());
    }

    #[test]
    fn test_weight_structure_check() {
        let cfg = default_model_config();
        assert!(validate_weight_structure(&cfg));

        let mut broken = default_model_config();
        broken.factors[0].weight += 1.0;
        assert!(!validate_weight_structure(&broken));

        let factors = fresh_factors(&broken, &[("stablecoins", 40.0), ("trend_valuation", 60.0)]);
        let report = validate_composite_score(&factors, 48.0, 0.0, 0.0, &broken);
        assert!(!report.weight_sum_ok);
        assert!(!report.valid);
    }
}
