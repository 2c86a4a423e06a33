//! ⏱️ Staleness Classifier
//!
//! Per-factor state machine, re-evaluated on every scoring cycle:
//! Unknown → {Fresh, Stale, Excluded}. A null score short-circuits to
//! Excluded; otherwise age against the TTL decides, with calendar-aware
//! grace for factors whose underlying data only updates on business days.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};

use crate::factors::FactorStatus;

/// Freshness policy for one factor, taken from its configuration.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessPolicy {
    pub ttl_hours: f64,
    /// Beyond this age the factor is excluded outright
    pub stale_beyond_hours: f64,
    /// Weekend/business-day grace applies
    pub business_days_only: bool,
}

impl FreshnessPolicy {
    pub fn from_config(f: &crate::config::FactorConfig) -> Self {
        FreshnessPolicy {
            ttl_hours: f.freshness_hours,
            stale_beyond_hours: f.stale_beyond_hours,
            business_days_only: f.business_days_only,
        }
    }
}

/// Most recent business day at or before `date` (Sat/Sun roll back to Friday).
pub fn most_recent_business_day(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date - Duration::days(2),
        _ => date,
    }
}

/// Classify one factor for this cycle.
///
/// `score`/`reason` come from the factor computation; `last_utc` is the
/// parsed data timestamp. Returns the status and the reason to surface when
/// the status is not a plain Fresh.
pub fn classify(
    score: Option<f64>,
    upstream_reason: Option<&str>,
    last_utc: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    policy: &FreshnessPolicy,
) -> (FactorStatus, Option<String>) {
    // Rule 1: no usable value, no timestamp check
    let has_score = score.map(|s| s.is_finite()).unwrap_or(false);
    if !has_score {
        let reason = upstream_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "computation_failed".to_string());
        return (FactorStatus::Excluded, Some(reason));
    }

    let Some(ts) = last_utc else {
        return (FactorStatus::Excluded, Some("missing_timestamp".to_string()));
    };

    let age_hours = now.signed_duration_since(ts).num_seconds() as f64 / 3600.0;

    // Rule 2: within TTL
    if age_hours <= policy.ttl_hours {
        return (FactorStatus::Fresh, None);
    }

    // Rule 3: business-day grace: data stamped on the most recent business
    // day counts fresh regardless of raw elapsed hours
    if policy.business_days_only {
        let data_date = ts.date_naive();
        let reference = most_recent_business_day(now.date_naive());
        if data_date == reference {
            let reason = if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
                "fresh_weekend_data_from_friday"
            } else {
                "fresh_business_day_data"
            };
            return (FactorStatus::Fresh, Some(reason.to_string()));
        }
    }

    // Rule 4: beyond the hard threshold
    if age_hours > policy.stale_beyond_hours {
        return (FactorStatus::Excluded, Some("stale_beyond_ttl".to_string()));
    }

    // Rule 5: stale but not yet excluded; still outside the composite
    (FactorStatus::Stale, Some("stale_beyond_ttl".to_string()))
}
