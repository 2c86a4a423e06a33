//! 🧠 Scoring Pipeline
//!
//! One call = one scoring cycle: gather factor results concurrently,
//! classify staleness, aggregate the composite, apply bounded adjustments,
//! map the band and assemble the snapshot document the presentation layer
//! renders. Pure compute: persistence and write debouncing belong to the
//! caller, which serializes cycles.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{ConfigProvider, RiskBand, MODEL_VERSION};
use crate::factors::{gather_factor_results, FactorSource, FactorStatus, FactorSummary};
use crate::scoring::adjustments::{cycle_adjustment, spike_adjustment, CycleAdjustment, SpikeAdjustment};
use crate::scoring::composite::{aggregate, finalize, CompositeError};
use crate::scoring::staleness::{classify, FreshnessPolicy};
use crate::store::{PricePoint, SnapshotStore};

/// Overall cycle health surfaced alongside the composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Every enabled factor fresh
    Green,
    /// Composite computed, but some factors stale/excluded
    Yellow,
    /// Insufficient factors; previous snapshot held
    Red,
}

/// BTC price context block of the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtcBlock {
    pub spot_usd: f64,
    pub as_of_utc: String,
    pub source: String,
}

/// The output artifact of one scoring cycle, the contract the
/// presentation layer renders. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub ok: bool,
    pub as_of_utc: DateTime<Utc>,
    pub composite_raw: f64,
    pub composite_score: f64,
    pub cycle_adjustment: CycleAdjustment,
    pub spike_adjustment: SpikeAdjustment,
    pub band: RiskBand,
    pub health: Health,
    pub factors: Vec<FactorSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub btc: Option<BtcBlock>,
    pub provenance: Vec<Value>,
    pub model_version: String,
    pub config_digest: String,
    pub transform: String,
    pub included_factor_keys: Vec<String>,
    pub excluded_factor_keys: Vec<String>,
    pub total_effective_weight: f64,
}

/// Cycle-level failures surfaced to the HTTP layer.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("insufficient usable factors: {usable} of {required} required")]
    InsufficientFactors { usable: usize, required: usize },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The scoring pipeline: an explicit configuration provider, the flat-file
/// store and the enumerated factor source set.
pub struct ScoringPipeline {
    provider: Arc<ConfigProvider>,
    store: Arc<SnapshotStore>,
    sources: Vec<Box<dyn FactorSource>>,
}

impl ScoringPipeline {
    pub fn new(
        provider: Arc<ConfigProvider>,
        store: Arc<SnapshotStore>,
        sources: Vec<Box<dyn FactorSource>>,
    ) -> Self {
        ScoringPipeline {
            provider,
            store,
            sources,
        }
    }

    /// The configuration provider backing this pipeline.
    pub fn provider(&self) -> &Arc<ConfigProvider> {
        &self.provider
    }

    /// Run one full scoring cycle and return the snapshot. Does not write
    /// anything; an insufficient-factor cycle returns a typed error so the
    /// caller can hold the previous snapshot.
    pub async fn run_cycle(&self) -> Result<Snapshot, PipelineError> {
        let now = Utc::now();

        // Reload so operators can push new weights without a redeploy; a
        // failed reload keeps serving the last-known-good configuration.
        if let Err(e) = self.provider.reload() {
            warn!("⚠️  Config reload failed, keeping last-known-good: {}", e);
        }
        let cfg = self.provider.config();
        let digest = self.provider.digest();

        let results = gather_factor_results(&self.sources).await;

        let mut factors = Vec::with_capacity(cfg.factors.len());
        for fc in cfg.enabled_factors() {
            let result = results.iter().find(|(k, _)| k == &fc.key).map(|(_, r)| r);

            let (score, last_utc, reason, source) = match result {
                Some(r) => {
                    let parsed = r
                        .last_utc
                        .as_deref()
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|dt| dt.with_timezone(&Utc));
                    (r.score, parsed, r.reason.clone(), r.source.clone())
                }
                None => (None, None, Some("source_not_registered".to_string()), None),
            };

            // Scores outside [0,100] violate the contract; treat as unusable
            let (score, reason) = match score {
                Some(s) if s.is_finite() && !(0.0..=100.0).contains(&s) => {
                    (None, Some("score_out_of_range".to_string()))
                }
                other => (other, reason),
            };

            let policy = FreshnessPolicy::from_config(fc);
            let (status, status_reason) =
                classify(score, reason.as_deref(), last_utc, now, &policy);

            factors.push(FactorSummary {
                key: fc.key.clone(),
                label: fc.label.clone(),
                pillar: fc.pillar.clone(),
                counts_toward: fc.counts_toward.clone(),
                weight: fc.weight,
                // A non-fresh factor keeps its score for display; the
                // aggregator only consumes fresh ones
                score,
                status,
                last_updated_utc: last_utc,
                reason: status_reason,
                source,
            });
        }

        let raw = match aggregate(&factors, &cfg) {
            Ok(raw) => raw,
            Err(CompositeError::InsufficientFactors { usable, required }) => {
                warn!(
                    "🚨 Insufficient factors ({} of {}) - holding previous snapshot",
                    usable, required
                );
                return Err(PipelineError::InsufficientFactors { usable, required });
            }
        };

        let prices = self.store.load_prices();
        let cycle = cycle_adjustment(&prices, &cfg.cycle);
        let spike = spike_adjustment(&prices, &cfg.spike);

        let result = finalize(&raw, cycle.adj_pts, spike.adj_pts, &cfg);

        let health = if factors.iter().all(|f| f.status == FactorStatus::Fresh) {
            Health::Green
        } else {
            Health::Yellow
        };

        let btc = prices.last().map(|p: &PricePoint| BtcBlock {
            spot_usd: p.close,
            as_of_utc: format!("{}T00:00:00Z", p.date),
            source: "btc_daily_history".to_string(),
        });

        let mut provenance: Vec<Value> = factors
            .iter()
            .map(|f| {
                json!({
                    "key": f.key,
                    "source": f.source,
                    "last_utc": f.last_updated_utc,
                    "status": f.status.as_str(),
                    "reason": f.reason,
                })
            })
            .collect();
        provenance.push(json!({
            "run_id": Uuid::new_v4().to_string(),
            "computed_at": now,
            "config_digest": digest,
        }));

        info!(
            "🧮 Composite {} ({}) from {} factors [raw {} cycle {:+.2} spike {:+.2}]",
            result.final_composite,
            result.band_key,
            result.included_factor_keys.len(),
            result.raw_composite,
            cycle.adj_pts,
            spike.adj_pts
        );

        let band = crate::scoring::bands::band_for(result.final_composite, &cfg.bands).clone();

        Ok(Snapshot {
            ok: true,
            as_of_utc: now,
            composite_raw: result.raw_composite,
            composite_score: result.final_composite,
            cycle_adjustment: cycle,
            spike_adjustment: spike,
            band,
            health,
            factors,
            btc,
            provenance,
            model_version: MODEL_VERSION.to_string(),
            config_digest: digest,
            transform: result.transform,
            included_factor_keys: result.included_factor_keys,
            excluded_factor_keys: result.excluded_factor_keys,
            total_effective_weight: result.total_effective_weight,
        })
    }

    /// Build the history row for a snapshot.
    pub fn history_row(snapshot: &Snapshot) -> crate::store::HistoryRow {
        crate::store::HistoryRow {
            as_of_utc: snapshot.as_of_utc,
            composite: snapshot.composite_score,
            version: snapshot.model_version.clone(),
            factors: snapshot
                .factors
                .iter()
                .map(|f| {
                    let score = if f.status == FactorStatus::Fresh {
                        f.score
                    } else {
                        None
                    };
                    (f.key.clone(), score)
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_model_config, ConfigProvider, ValidationMode};
    use crate::factors::{FactorResult, StaticSource};
    use crate::scoring::validator::validate_composite_score;

    fn source(key: &str, score: Option<f64>, hours_old: i64) -> Box<dyn FactorSource> {
        let ts = Utc::now() - chrono::Duration::hours(hours_old);
        Box::new(StaticSource::new(
            key,
            FactorResult {
                score,
                last_utc: Some(ts.to_rfc3339()),
                source: Some(format!("{}_feed", key)),
                details: Vec::new(),
                reason: None,
                provenance: Vec::new(),
            },
        ))
    }

    fn test_pipeline(name: &str, sources: Vec<Box<dyn FactorSource>>) -> ScoringPipeline {
        let dir = format!("/tmp/gscore_pipeline_{}", name);
        let _ = std::fs::remove_dir_all(&dir);
        let provider = Arc::new(
            ConfigProvider::with_config(default_model_config(), ValidationMode::Lenient).unwrap(),
        );
        let store = Arc::new(SnapshotStore::new(&dir).unwrap());
        ScoringPipeline::new(provider, store, sources)
    }

    #[tokio::test]
    async fn test_full_cycle_all_fresh() {
        let cfg = default_model_config();
        let sources: Vec<Box<dyn FactorSource>> = cfg
            .enabled_factors()
            .map(|f| source(&f.key, Some(50.0), 1))
            .collect();
        let pipeline = test_pipeline("all_fresh", sources);

        let snapshot = pipeline.run_cycle().await.unwrap();
        assert!(snapshot.ok);
        assert_eq!(snapshot.health, Health::Green);
        assert_eq!(snapshot.composite_raw, 50.0);
        // No price history → both adjustments are reasoned no-ops
        assert_eq!(snapshot.cycle_adjustment.adj_pts, 0.0);
        assert_eq!(snapshot.spike_adjustment.adj_pts, 0.0);
        assert_eq!(snapshot.composite_score, 50.0);
        assert_eq!(snapshot.band.key, "hold_wait");
        assert_eq!(snapshot.model_version, MODEL_VERSION);
        assert!(!snapshot.config_digest.is_empty());
        assert_eq!(snapshot.transform, "linear");

        // The published snapshot must survive the offline audit
        let report = validate_composite_score(
            &snapshot.factors,
            snapshot.composite_score,
            snapshot.cycle_adjustment.adj_pts,
            snapshot.spike_adjustment.adj_pts,
            &cfg,
        );
        assert!(report.valid, "audit failed: {:?}", report);
    }

    #[tokio::test]
    async fn test_cycle_with_stale_and_failed_factors() {
        let cfg = default_model_config();
        let mut sources: Vec<Box<dyn FactorSource>> = Vec::new();
        for f in cfg.enabled_factors() {
            match f.key.as_str() {
                // 18h old vs 12h TTL → stale
                "term_leverage" => sources.push(source(&f.key, Some(90.0), 18)),
                // feed failure → excluded
                "social_interest" => sources.push(source(&f.key, None, 1)),
                _ => sources.push(source(&f.key, Some(40.0), 1)),
            }
        }
        let pipeline = test_pipeline("degraded", sources);

        let snapshot = pipeline.run_cycle().await.unwrap();
        assert_eq!(snapshot.health, Health::Yellow);
        // Stale and failed factors are reported but not aggregated
        assert!(!snapshot.included_factor_keys.contains(&"term_leverage".to_string()));
        assert!(!snapshot.included_factor_keys.contains(&"social_interest".to_string()));
        assert!(snapshot.excluded_factor_keys.contains(&"term_leverage".to_string()));
        // All fresh factors scored 40 → renormalized composite is 40
        assert_eq!(snapshot.composite_raw, 40.0);

        let term = snapshot.factors.iter().find(|f| f.key == "term_leverage").unwrap();
        assert_eq!(term.status, FactorStatus::Stale);
        assert_eq!(term.score, Some(90.0)); // still displayed
    }

    #[tokio::test]
    async fn test_insufficient_factors_errors_out() {
        let cfg = default_model_config();
        let sources: Vec<Box<dyn FactorSource>> = cfg
            .enabled_factors()
            .enumerate()
            .map(|(i, f)| {
                if i == 0 {
                    source(&f.key, Some(50.0), 1)
                } else {
                    source(&f.key, None, 1)
                }
            })
            .collect();
        let pipeline = test_pipeline("insufficient", sources);

        match pipeline.run_cycle().await {
            Err(PipelineError::InsufficientFactors { usable, required }) => {
                assert_eq!(usable, 1);
                assert_eq!(required, 2);
            }
            other => panic!("expected InsufficientFactors, got {:?}", other.map(|s| s.ok)),
        }
    }

    #[tokio::test]
    async fn test_out_of_range_score_is_excluded() {
        let cfg = default_model_config();
        let sources: Vec<Box<dyn FactorSource>> = cfg
            .enabled_factors()
            .map(|f| {
                if f.key == "stablecoins" {
                    source(&f.key, Some(250.0), 1)
                } else {
                    source(&f.key, Some(50.0), 1)
                }
            })
            .collect();
        let pipeline = test_pipeline("out_of_range", sources);

        let snapshot = pipeline.run_cycle().await.unwrap();
        let sc = snapshot.factors.iter().find(|f| f.key == "stablecoins").unwrap();
        assert_eq!(sc.status, FactorStatus::Excluded);
        assert_eq!(sc.reason.as_deref(), Some("score_out_of_range"));
    }

    #[tokio::test]
    async fn test_history_row_masks_non_fresh_scores() {
        let cfg = default_model_config();
        let sources: Vec<Box<dyn FactorSource>> = cfg
            .enabled_factors()
            .map(|f| {
                if f.key == "term_leverage" {
                    source(&f.key, Some(90.0), 18)
                } else {
                    source(&f.key, Some(50.0), 1)
                }
            })
            .collect();
        let pipeline = test_pipeline("history_row", sources);
        let snapshot = pipeline.run_cycle().await.unwrap();

        let row = ScoringPipeline::history_row(&snapshot);
        assert_eq!(row.factors["term_leverage"], None);
        assert_eq!(row.factors["stablecoins"], Some(50.0));
        assert_eq!(row.composite, snapshot.composite_score);
    }

    #[tokio::test]
    async fn test_snapshot_serde_round_trip() {
        let cfg = default_model_config();
        let sources: Vec<Box<dyn FactorSource>> = cfg
            .enabled_factors()
            .map(|f| source(&f.key, Some(62.0), 1))
            .collect();
        let pipeline = test_pipeline("serde", sources);
        let snapshot = pipeline.run_cycle().await.unwrap();

        let body = serde_json::to_string(&snapshot).unwrap();
        let parsed: Snapshot = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.composite_score, snapshot.composite_score);
        assert_eq!(parsed.band.key, snapshot.band.key);
        assert_eq!(parsed.factors.len(), snapshot.factors.len());
    }
}
