//! 🎨 Risk Band Mapper
//!
//! The single band implementation used by the aggregator, the HTTP layer
//! and the validator. Bands are data (configuration), not inline threshold
//! ladders; the mapper iterates the configured table in ascending order.

use crate::config::RiskBand;

/// Return the band whose half-open `[lo, hi)` range contains `score`.
///
/// Falls back to the last (highest) band when no range matched, which
/// covers score == 100 exactly since ranges are half-open.
pub fn band_for(score: f64, bands: &[RiskBand]) -> &RiskBand {
    for b in bands {
        if score >= b.range[0] && score < b.range[1] {
            return b;
        }
    }
    bands.last().expect("band table must not be empty")
}

/// Structural validation of a band table: ascending, gap-free, overlap-free
/// coverage of [0,100] with adjacent bands sharing boundaries.
pub fn validate_bands(bands: &[RiskBand]) -> Vec<String> {
    let mut problems = Vec::new();
    if bands.is_empty() {
        problems.push("band table is empty".to_string());
        return problems;
    }
    if bands[0].range[0] != 0.0 {
        problems.push(format!(
            "first band '{}' starts at {} (expected 0)",
            bands[0].key, bands[0].range[0]
        ));
    }
    if bands[bands.len() - 1].range[1] != 100.0 {
        problems.push(format!(
            "last band '{}' ends at {} (expected 100)",
            bands[bands.len() - 1].key,
            bands[bands.len() - 1].range[1]
        ));
    }
    for b in bands {
        if b.range[0] >= b.range[1] {
            problems.push(format!("band '{}' has empty or inverted range", b.key));
        }
    }
    for pair in bands.windows(2) {
        if pair[0].range[1] != pair[1].range[0] {
            problems.push(format!(
                "bands '{}' and '{}' do not share a boundary ({} vs {})",
                pair[0].key, pair[1].key, pair[0].range[1], pair[1].range[0]
            ));
        }
    }
    problems
}
