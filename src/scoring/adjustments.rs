//! 🔄 Cycle & Spike Adjustments
//!
//! Two independent, config-gated, bounded additive deltas applied on top of
//! the raw composite. Both degrade to a zero, clearly-reasoned no-op on any
//! upstream data failure; adjustments are enhancements, never blocking
//! dependencies.
//!
//! - Cycle: residual z-score of price against a long-run log/log trend fit
//!   over weekly closes; only active beyond a deviation threshold.
//! - Spike: 1-day return z-score against EWMA-estimated volatility
//!   (λ≈0.94); only active beyond |z| > threshold.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{CycleAdjustmentConfig, SpikeAdjustmentConfig};
use crate::math::{ewma, ols, tanh01};
use crate::store::PricePoint;

/// Slow adjustment from long-run trend deviation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleAdjustment {
    /// Bounded additive delta in points
    pub adj_pts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend_price_usd: Option<f64>,
    /// price/trend - 1, as a fraction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deviation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub residual_z: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_utc: Option<String>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CycleAdjustment {
    fn noop(reason: &str) -> Self {
        CycleAdjustment {
            adj_pts: 0.0,
            trend_price_usd: None,
            deviation: None,
            residual_z: None,
            last_utc: None,
            source: "btc_daily_history".to_string(),
            reason: Some(reason.to_string()),
        }
    }
}

/// Fast adjustment from short-run volatility spikes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikeAdjustment {
    /// Bounded additive delta in points
    pub adj_pts: f64,
    /// 1-day return, as a fraction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_return: Option<f64>,
    /// EWMA daily volatility, as a fraction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vol: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_utc: Option<String>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SpikeAdjustment {
    fn noop(reason: &str) -> Self {
        SpikeAdjustment {
            adj_pts: 0.0,
            day_return: None,
            vol: None,
            z: None,
            last_utc: None,
            source: "btc_daily_history".to_string(),
            reason: Some(reason.to_string()),
        }
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Compute the cycle adjustment from daily close history.
///
/// Fits ln(price) against ln(days) over weekly samples, then measures
/// today's residual. Inactive inside the deviation band; capped at
/// ±`cap_pts` outside it.
pub fn cycle_adjustment(history: &[PricePoint], cfg: &CycleAdjustmentConfig) -> CycleAdjustment {
    if !cfg.enabled {
        return CycleAdjustment::noop("disabled");
    }

    let valid: Vec<&PricePoint> = history
        .iter()
        .filter(|p| p.close.is_finite() && p.close > 0.0)
        .collect();
    let Some(latest) = valid.last().copied() else {
        return CycleAdjustment::noop("insufficient_data");
    };

    // Weekly sampling, anchored so the latest close is always included
    let mut weekly: Vec<&PricePoint> = valid.iter().rev().step_by(7).copied().collect();
    weekly.reverse();
    if weekly.len() < cfg.min_weeks {
        return CycleAdjustment::noop("insufficient_data");
    }

    let first_date = weekly[0].date;
    let xs: Vec<f64> = weekly
        .iter()
        .map(|p| (((p.date - first_date).num_days() + 1) as f64).ln())
        .collect();
    let ys: Vec<f64> = weekly.iter().map(|p| p.close.ln()).collect();

    let Some((slope, intercept)) = ols(&xs, &ys) else {
        return CycleAdjustment::noop("insufficient_data");
    };

    let resid_var = xs
        .iter()
        .zip(ys.iter())
        .map(|(&x, &y)| (y - (slope * x + intercept)).powi(2))
        .sum::<f64>()
        / xs.len() as f64;
    let resid_std = resid_var.sqrt();
    if resid_std < 1e-9 {
        return CycleAdjustment::noop("insufficient_signal");
    }

    let x_now = (((latest.date - first_date).num_days() + 1) as f64).ln();
    let trend_ln = slope * x_now + intercept;
    let trend_price = trend_ln.exp();
    let deviation = latest.close / trend_price - 1.0;
    let z = (latest.close.ln() - trend_ln) / resid_std;

    let last_utc = Some(format!("{}T00:00:00Z", latest.date));

    if deviation.abs() <= cfg.deviation_threshold {
        return CycleAdjustment {
            adj_pts: 0.0,
            trend_price_usd: Some(round2(trend_price)),
            deviation: Some(deviation),
            residual_z: Some(z),
            last_utc,
            source: "btc_daily_history".to_string(),
            reason: Some("within_trend_band".to_string()),
        };
    }

    // tanh-mapped z in [-1,1], scaled to the cap
    let mapped = 2.0 * tanh01(z, cfg.z_scale) - 1.0;
    let adj_pts = round2((mapped * cfg.cap_pts).clamp(-cfg.cap_pts, cfg.cap_pts));

    debug!(
        "🔄 Cycle adjustment: dev={:.1}% z={:.2} → {:+.2} pts",
        deviation * 100.0,
        z,
        adj_pts
    );

    CycleAdjustment {
        adj_pts,
        trend_price_usd: Some(round2(trend_price)),
        deviation: Some(deviation),
        residual_z: Some(z),
        last_utc,
        source: "btc_daily_history".to_string(),
        reason: None,
    }
}

/// Compute the spike adjustment from daily close history.
///
/// z-scores today's log return against an EWMA volatility estimate built
/// from the prior `lookback_days` returns. `down_moves_raise_risk` controls
/// whether a crash adds or subtracts risk points.
pub fn spike_adjustment(history: &[PricePoint], cfg: &SpikeAdjustmentConfig) -> SpikeAdjustment {
    if !cfg.enabled {
        return SpikeAdjustment::noop("disabled");
    }

    let closes: Vec<(chrono::NaiveDate, f64)> = history
        .iter()
        .filter(|p| p.close.is_finite() && p.close > 0.0)
        .map(|p| (p.date, p.close))
        .collect();
    if closes.len() < cfg.lookback_days + 2 {
        return SpikeAdjustment::noop("insufficient_data");
    }

    let tail = &closes[closes.len() - (cfg.lookback_days + 2)..];
    let returns: Vec<f64> = tail.windows(2).map(|w| (w[1].1 / w[0].1).ln()).collect();

    let (prior, today) = returns.split_at(returns.len() - 1);
    let today_return = today[0];

    // EWMA variance: var_t = λ·var_{t-1} + (1-λ)·r_t²
    let mut var: Option<f64> = None;
    for r in prior {
        var = Some(ewma(var, r * r, 1.0 - cfg.lambda));
    }
    let vol = var.map(|v| v.sqrt()).unwrap_or(f64::NAN);
    if !vol.is_finite() || vol < 1e-9 {
        return SpikeAdjustment::noop("insufficient_signal");
    }

    let z = today_return / vol;
    let last_utc = Some(format!("{}T00:00:00Z", tail[tail.len() - 1].0));

    if z.abs() <= cfg.z_threshold {
        return SpikeAdjustment {
            adj_pts: 0.0,
            day_return: Some(today_return.exp_m1()),
            vol: Some(vol),
            z: Some(z),
            last_utc,
            source: "btc_daily_history".to_string(),
            reason: Some("below_threshold".to_string()),
        };
    }

    let magnitude = ((z.abs() - cfg.z_threshold) * cfg.pts_per_sigma).min(cfg.cap_pts);
    let sign = if z > 0.0 {
        1.0
    } else if cfg.down_moves_raise_risk {
        1.0
    } else {
        -1.0
    };
    let adj_pts = round2(sign * magnitude);

    debug!(
        "⚡ Spike adjustment: r={:.2}% z={:.2} → {:+.2} pts",
        today_return.exp_m1() * 100.0,
        z,
        adj_pts
    );

    SpikeAdjustment {
        adj_pts,
        day_return: Some(today_return.exp_m1()),
        vol: Some(vol),
        z: Some(z),
        last_utc,
        source: "btc_daily_history".to_string(),
        reason: None,
    }
}
