//! 📊 Weight Renormalization & Composite Aggregator
//!
//! The heart of the engine. Filters the classified factor list to usable
//! (fresh, finite-scored) factors, renormalizes their configured weights to
//! sum to exactly 1.0 over that set, and computes the weighted composite.
//! A factor excluded for staleness has its weight redistributed
//! proportionally across the remaining fresh factors, never silently
//! dropped, which would bias the composite toward zero.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::config::{normalize_factor_weights, ModelConfig, SensitivityTransformConfig};
use crate::factors::FactorSummary;
use crate::scoring::bands::band_for;

/// Aggregation failure states.
#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("insufficient usable factors: {usable} fresh of {required} required")]
    InsufficientFactors { usable: usize, required: usize },
}

/// Raw composite before adjustments.
#[derive(Debug, Clone)]
pub struct RawComposite {
    /// Rounded weighted sum in [0,100]
    pub raw_composite: f64,
    /// Keys of factors included in the weighted sum
    pub included: Vec<String>,
    /// Keys of enabled factors left out (stale or excluded)
    pub excluded: Vec<String>,
    /// Sum of configured percentage points of the included factors
    pub total_effective_weight: f64,
    /// Renormalized per-factor weights (sum to 1.0)
    pub weights: HashMap<String, f64>,
}

/// Output entity of one scoring cycle. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeResult {
    pub raw_composite: f64,
    pub cycle_adj_pts: f64,
    pub spike_adj_pts: f64,
    pub final_composite: f64,
    pub band_key: String,
    pub included_factor_keys: Vec<String>,
    pub excluded_factor_keys: Vec<String>,
    pub total_effective_weight: f64,
    /// Which transform produced final_composite ("linear" or "sensitivity:…")
    pub transform: String,
}

/// Compute the raw composite over the usable subset of `factors`.
///
/// Only `fresh` counts: stale factors, even with a numeric score, stay out
/// of the composite (they are still shown in the UI, tagged stale).
pub fn aggregate(
    factors: &[FactorSummary],
    cfg: &ModelConfig,
) -> Result<RawComposite, CompositeError> {
    let usable: Vec<&FactorSummary> = factors.iter().filter(|f| f.is_usable()).collect();

    let required = cfg.policy.min_factors_required;
    if usable.len() < required {
        return Err(CompositeError::InsufficientFactors {
            usable: usable.len(),
            required,
        });
    }

    let usable_keys: Vec<&str> = usable.iter().map(|f| f.key.as_str()).collect();
    let weights = normalize_factor_weights(cfg, &usable_keys);
    if weights.is_empty() {
        // All usable factors carry zero configured weight
        return Err(CompositeError::InsufficientFactors {
            usable: 0,
            required,
        });
    }

    let mut sum = 0.0;
    for f in &usable {
        if let Some(w) = weights.get(&f.key) {
            sum += f.score.unwrap_or(0.0) * w;
        }
    }
    let raw_composite = sum.round().clamp(0.0, 100.0);

    let included: Vec<String> = usable
        .iter()
        .filter(|f| weights.contains_key(&f.key))
        .map(|f| f.key.clone())
        .collect();
    let excluded: Vec<String> = factors
        .iter()
        .filter(|f| !included.contains(&f.key))
        .map(|f| f.key.clone())
        .collect();

    let total_effective_weight: f64 = cfg
        .enabled_factors()
        .filter(|f| included.contains(&f.key))
        .map(|f| f.weight)
        .sum();

    debug!(
        "📊 Raw composite {} from {} factors (effective weight {:.1})",
        raw_composite,
        included.len(),
        total_effective_weight
    );

    Ok(RawComposite {
        raw_composite,
        included,
        excluded,
        total_effective_weight,
        weights,
    })
}

/// Clamp a composite score into [0,100].
pub fn clamp_score(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}

/// Config-gated nonlinear sensitivity transform.
///
/// Stretches deviations from the 50-point midpoint by the `gamma` power,
/// preserving the endpoints and the midpoint. Identity when disabled or
/// gamma == 1. This replaces the legacy pattern of rewriting the scoring
/// source at runtime: an explicit, testable function.
pub fn apply_sensitivity(score: f64, t: &SensitivityTransformConfig) -> f64 {
    if !t.enabled || (t.gamma - 1.0).abs() < f64::EPSILON {
        return score;
    }
    let deviation = (score - 50.0) / 50.0; // [-1, 1]
    let stretched = deviation.abs().powf(t.gamma) * deviation.signum();
    clamp_score(50.0 + stretched * 50.0)
}

/// Describe the active transform for the snapshot contract.
pub fn transform_label(t: &SensitivityTransformConfig) -> String {
    if t.enabled && (t.gamma - 1.0).abs() >= f64::EPSILON {
        format!("sensitivity:gamma={}", t.gamma)
    } else {
        "linear".to_string()
    }
}

/// Sum adjustments into the raw composite, clamp, apply the transform and
/// map to a band. The single place final composites are produced.
pub fn finalize(
    raw: &RawComposite,
    cycle_adj_pts: f64,
    spike_adj_pts: f64,
    cfg: &ModelConfig,
) -> CompositeResult {
    let adjusted = clamp_score(raw.raw_composite + cycle_adj_pts + spike_adj_pts);
    let final_composite = apply_sensitivity(adjusted, &cfg.policy.sensitivity);
    let band = band_for(final_composite, &cfg.bands);

    CompositeResult {
        raw_composite: raw.raw_composite,
        cycle_adj_pts,
        spike_adj_pts,
        final_composite,
        band_key: band.key.clone(),
        included_factor_keys: raw.included.clone(),
        excluded_factor_keys: raw.excluded.clone(),
        total_effective_weight: raw.total_effective_weight,
        transform: transform_label(&cfg.policy.sensitivity),
    }
}
