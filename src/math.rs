//! 📐 Normalization Primitives
//!
//! Small reusable math library shared by factor normalization and the
//! cycle/spike adjustments. Every function treats non-finite inputs
//! (NaN, ±Infinity) as "unknown" and propagates NaN instead of panicking,
//! so one bad upstream value degrades a single factor, not the pipeline.

/// Clip each value to the [lo_pct, hi_pct] empirical percentile range of the
/// finite subset of `values`.
///
/// Returns a same-length vector. Non-finite inputs map to NaN in the output.
/// Percentiles are expressed as fractions in [0,1].
pub fn winsorize(values: &[f64], lo_pct: f64, hi_pct: f64) -> Vec<f64> {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return values.iter().map(|_| f64::NAN).collect();
    }
    finite.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let lo = percentile_of_sorted(&finite, lo_pct);
    let hi = percentile_of_sorted(&finite, hi_pct);
    if !(lo <= hi) {
        // Unusable percentile bounds; pass values through, NaN for non-finite
        return values
            .iter()
            .map(|&v| if v.is_finite() { v } else { f64::NAN })
            .collect();
    }

    values
        .iter()
        .map(|&v| {
            if !v.is_finite() {
                f64::NAN
            } else {
                v.clamp(lo, hi)
            }
        })
        .collect()
}

/// Linear-interpolated percentile of a pre-sorted finite slice.
fn percentile_of_sorted(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() || !pct.is_finite() {
        return f64::NAN;
    }
    let p = pct.clamp(0.0, 1.0);
    let rank = p * (sorted.len() - 1) as f64;
    let lo_idx = rank.floor() as usize;
    let hi_idx = rank.ceil() as usize;
    if lo_idx == hi_idx {
        sorted[lo_idx]
    } else {
        let frac = rank - lo_idx as f64;
        sorted[lo_idx] * (1.0 - frac) + sorted[hi_idx] * frac
    }
}

/// Z-score of `x` against a reference set (population standard deviation).
///
/// Returns NaN when the finite reference is empty or has zero variance.
pub fn z_score(x: f64, reference: &[f64]) -> f64 {
    if !x.is_finite() {
        return f64::NAN;
    }
    let finite: Vec<f64> = reference.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let var = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    if var <= 0.0 {
        return f64::NAN;
    }
    (x - mean) / var.sqrt()
}

/// Mid-rank percentile of `x` within `reference`: fraction strictly below
/// plus half the fraction equal. Range [0,1]. NaN on empty reference.
pub fn percentile_rank(reference: &[f64], x: f64) -> f64 {
    if !x.is_finite() {
        return f64::NAN;
    }
    let finite: Vec<f64> = reference.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    let below = finite.iter().filter(|&&v| v < x).count() as f64;
    let equal = finite.iter().filter(|&&v| v == x).count() as f64;
    (below + 0.5 * equal) / finite.len() as f64
}

/// Logistic curve mapping, midpoint `x0` (default call sites use 0.5).
pub fn logistic01(x: f64, k: f64, x0: f64) -> f64 {
    if !x.is_finite() || !k.is_finite() || !x0.is_finite() {
        return f64::NAN;
    }
    1.0 / (1.0 + (-k * (x - x0)).exp())
}

/// Map a z-score into [0,1] with saturation: 0.5*(1+tanh(z/scale)).
pub fn tanh01(z: f64, scale: f64) -> f64 {
    if !z.is_finite() || !scale.is_finite() || scale == 0.0 {
        return f64::NAN;
    }
    0.5 * (1.0 + (z / scale).tanh())
}

/// Map a [0,1] percentile into an integer risk score in [0,100] through a
/// logistic curve. `invert` flips the percentile when higher raw values mean
/// lower risk.
pub fn risk_from_percentile(p: f64, invert: bool, k: f64) -> f64 {
    if !p.is_finite() {
        return f64::NAN;
    }
    let p = if invert { 1.0 - p } else { p };
    let mapped = logistic01(p, k, 0.5);
    if !mapped.is_finite() {
        return f64::NAN;
    }
    (mapped * 100.0).round().clamp(0.0, 100.0)
}

/// Map a z-score into an integer risk score in [0,100].
///
/// `direction` is ±1.0 (whether positive z raises risk), `clip` bounds the
/// z-score before mapping, `scale` controls tanh saturation.
pub fn risk_from_z(z: f64, direction: f64, scale: f64, clip: f64) -> f64 {
    if !z.is_finite() || !direction.is_finite() || !clip.is_finite() {
        return f64::NAN;
    }
    let clipped = z.clamp(-clip.abs(), clip.abs());
    let mapped = tanh01(direction.signum() * clipped, scale);
    if !mapped.is_finite() {
        return f64::NAN;
    }
    (mapped * 100.0).round().clamp(0.0, 100.0)
}

/// Exponential smoothing step. First call (prev=None) returns curr unchanged.
pub fn ewma(prev: Option<f64>, curr: f64, alpha: f64) -> f64 {
    if !curr.is_finite() || !alpha.is_finite() {
        return f64::NAN;
    }
    match prev {
        Some(p) if p.is_finite() => alpha * curr + (1.0 - alpha) * p,
        _ => curr,
    }
}

/// Rolling simple moving average. Leading entries are NaN until the window
/// fills; a non-finite value inside the window yields NaN for that position.
pub fn sma(series: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; series.len()];
    if window == 0 || series.len() < window {
        return out;
    }
    for i in (window - 1)..series.len() {
        let slice = &series[i + 1 - window..=i];
        if slice.iter().all(|v| v.is_finite()) {
            out[i] = slice.iter().sum::<f64>() / window as f64;
        }
    }
    out
}

/// Rolling exponential moving average, seeded from the first finite value.
/// Positions before the seed are NaN; non-finite samples hold the prior ema.
pub fn ema(series: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; series.len()];
    if window == 0 || series.is_empty() {
        return out;
    }
    let alpha = 2.0 / (window as f64 + 1.0);
    let mut state: Option<f64> = None;
    for (i, &v) in series.iter().enumerate() {
        match state {
            None => {
                if v.is_finite() {
                    state = Some(v);
                    out[i] = v;
                }
            }
            Some(prev) => {
                let next = if v.is_finite() {
                    alpha * v + (1.0 - alpha) * prev
                } else {
                    prev
                };
                state = Some(next);
                out[i] = next;
            }
        }
    }
    out
}

/// Ordinary least squares fit `y = slope*x + intercept`.
///
/// Returns None with fewer than 10 paired finite points or a singular
/// denominator.
pub fn ols(xs: &[f64], ys: &[f64]) -> Option<(f64, f64)> {
    let pairs: Vec<(f64, f64)> = xs
        .iter()
        .zip(ys.iter())
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(&x, &y)| (x, y))
        .collect();
    if pairs.len() < 10 {
        return None;
    }
    let n = pairs.len() as f64;
    let sum_x: f64 = pairs.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = pairs.iter().map(|(_, y)| y).sum();
    let sum_xx: f64 = pairs.iter().map(|(x, _)| x * x).sum();
    let sum_xy: f64 = pairs.iter().map(|(x, y)| x * y).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < 1e-12 {
        return None;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    Some((slope, intercept))
}
