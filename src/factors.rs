//! 🧩 Factor Contract & Source Fan-out
//!
//! The engine never calls external APIs itself. Factor computations run
//! out of process and publish a normalized `FactorResult`; this module owns
//! the contract, the per-snapshot `FactorSummary`, and the concurrent
//! fan-out that guarantees one failing source degrades to a null score
//! instead of aborting the scoring cycle.

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Staleness classification of a factor for one scoring cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactorStatus {
    Fresh,
    Stale,
    Excluded,
}

impl FactorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactorStatus::Fresh => "fresh",
            FactorStatus::Stale => "stale",
            FactorStatus::Excluded => "excluded",
        }
    }
}

/// Normalized output contract of one factor computation.
///
/// Producers write this shape; the engine only consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorResult {
    /// Risk score in [0,100], or None when the factor has no usable value
    pub score: Option<f64>,
    /// ISO-8601 timestamp of the underlying data
    #[serde(default)]
    pub last_utc: Option<String>,
    /// Upstream data source identifier
    #[serde(default)]
    pub source: Option<String>,
    /// Free-form diagnostic rows for the UI
    #[serde(default)]
    pub details: Vec<Value>,
    /// Failure or staleness explanation
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub provenance: Vec<Value>,
}

impl FactorResult {
    /// Degraded result for a failed source.
    pub fn failed(key: &str) -> Self {
        FactorResult {
            score: None,
            last_utc: None,
            source: None,
            details: Vec::new(),
            reason: Some(format!("{}_error", key)),
            provenance: Vec::new(),
        }
    }
}

/// One factor, annotated for one snapshot.
///
/// Invariants: `score == None` implies `status == Excluded`; a Fresh factor
/// always carries a numeric score in [0,100].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorSummary {
    pub key: String,
    pub label: String,
    /// Pillar used for weight accounting
    pub pillar: String,
    /// Display-only pillar override; does not affect composite math
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts_toward: Option<String>,
    /// Configured share of 100
    pub weight: f64,
    pub score: Option<f64>,
    pub status: FactorStatus,
    pub last_updated_utc: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl FactorSummary {
    /// Whether this factor participates in the composite this cycle.
    pub fn is_usable(&self) -> bool {
        self.status == FactorStatus::Fresh
            && self.score.map(|s| s.is_finite()).unwrap_or(false)
    }
}

/// A factor source is anything that can produce a `FactorResult`.
///
/// The concrete set is enumerated at startup; there is no string-keyed
/// dynamic loading. `compute` returns a boxed future so sources stay
/// object-safe behind `dyn`.
pub trait FactorSource: Send + Sync {
    fn key(&self) -> &str;
    fn compute(&self) -> BoxFuture<'_, anyhow::Result<FactorResult>>;
}

/// Reads a producer-dropped JSON document from `data/feeds/<key>.json`.
///
/// A missing or malformed file is a normal degraded state, not an error:
/// the classifier will mark the factor excluded.
pub struct FeedFileSource {
    key: String,
    path: PathBuf,
}

impl FeedFileSource {
    pub fn new(key: &str, feeds_dir: &Path) -> Self {
        FeedFileSource {
            key: key.to_string(),
            path: feeds_dir.join(format!("{}.json", key)),
        }
    }
}

impl FactorSource for FeedFileSource {
    fn key(&self) -> &str {
        &self.key
    }

    fn compute(&self) -> BoxFuture<'_, anyhow::Result<FactorResult>> {
        Box::pin(async move {
            let raw = match tokio::fs::read_to_string(&self.path).await {
                Ok(raw) => raw,
                Err(e) => {
                    debug!("📭 No feed file for '{}': {}", self.key, e);
                    return Ok(FactorResult {
                        score: None,
                        last_utc: None,
                        source: None,
                        details: Vec::new(),
                        reason: Some("feed_missing".to_string()),
                        provenance: Vec::new(),
                    });
                }
            };
            match serde_json::from_str::<FactorResult>(&raw) {
                Ok(result) => Ok(result),
                Err(e) => {
                    warn!("⚠️  Malformed feed file for '{}': {}", self.key, e);
                    Ok(FactorResult {
                        score: None,
                        last_utc: None,
                        source: None,
                        details: Vec::new(),
                        reason: Some("feed_malformed".to_string()),
                        provenance: Vec::new(),
                    })
                }
            }
        })
    }
}

/// Fixed in-memory source, used by tests and embedded callers.
pub struct StaticSource {
    key: String,
    result: FactorResult,
}

impl StaticSource {
    pub fn new(key: &str, result: FactorResult) -> Self {
        StaticSource {
            key: key.to_string(),
            result,
        }
    }
}

impl FactorSource for StaticSource {
    fn key(&self) -> &str {
        &self.key
    }

    fn compute(&self) -> BoxFuture<'_, anyhow::Result<FactorResult>> {
        let result = self.result.clone();
        Box::pin(async move { Ok(result) })
    }
}

/// Build the standard feed-file source set for every enabled factor.
pub fn feed_sources(
    cfg: &crate::config::ModelConfig,
    feeds_dir: &Path,
) -> Vec<Box<dyn FactorSource>> {
    cfg.enabled_factors()
        .map(|f| Box::new(FeedFileSource::new(&f.key, feeds_dir)) as Box<dyn FactorSource>)
        .collect()
}

/// Fan out every source concurrently and settle all of them.
///
/// A source that returns Err (or panics inside its own future) is converted
/// to a degraded `{score: None, reason: "<key>_error"}` result; the cycle
/// always receives one result per source.
pub async fn gather_factor_results(
    sources: &[Box<dyn FactorSource>],
) -> Vec<(String, FactorResult)> {
    let futures: Vec<_> = sources
        .iter()
        .map(|s| async move {
            let key = s.key().to_string();
            match s.compute().await {
                Ok(result) => (key, result),
                Err(e) => {
                    warn!("⚠️  Factor source '{}' failed: {}", key, e);
                    let degraded = FactorResult::failed(&key);
                    (key, degraded)
                }
            }
        })
        .collect();
    join_all(futures).await
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSource;

    impl FactorSource for FailingSource {
        fn key(&self) -> &str {
            "broken"
        }
        fn compute(&self) -> BoxFuture<'_, anyhow::Result<FactorResult>> {
            Box::pin(async { anyhow::bail!("upstream exploded") })
        }
    }

    fn scored(key: &str, score: f64) -> Box<dyn FactorSource> {
        Box::new(StaticSource::new(
            key,
            FactorResult {
                score: Some(score),
                last_utc: Some("2024-06-15T00:00:00Z".to_string()),
                source: Some("test".to_string()),
                details: Vec::new(),
                reason: None,
                provenance: Vec::new(),
            },
        ))
    }

    #[tokio::test]
    async fn test_gather_isolates_failures() {
        let sources: Vec<Box<dyn FactorSource>> =
            vec![scored("alpha", 40.0), Box::new(FailingSource), scored("beta", 60.0)];
        let results = gather_factor_results(&sources).await;
        assert_eq!(results.len(), 3);

        let broken = results.iter().find(|(k, _)| k == "broken").unwrap();
        assert!(broken.1.score.is_none());
        assert_eq!(broken.1.reason.as_deref(), Some("broken_error"));

        let alpha = results.iter().find(|(k, _)| k == "alpha").unwrap();
        assert_eq!(alpha.1.score, Some(40.0));
    }

    #[tokio::test]
    async fn test_feed_file_source_missing_file() {
        let dir = std::path::Path::new("/tmp/gscore_feeds_missing_test");
        let _ = std::fs::remove_dir_all(dir);
        std::fs::create_dir_all(dir).unwrap();

        let source = FeedFileSource::new("etf_flows", dir);
        let result = source.compute().await.unwrap();
        assert!(result.score.is_none());
        assert_eq!(result.reason.as_deref(), Some("feed_missing"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_feed_file_source_roundtrip() {
        let dir = std::path::Path::new("/tmp/gscore_feeds_roundtrip_test");
        let _ = std::fs::remove_dir_all(dir);
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join("trend_valuation.json"),
            r#"{"score": 62.0, "last_utc": "2024-06-15T08:00:00Z", "source": "trend-model"}"#,
        )
        .unwrap();

        let source = FeedFileSource::new("trend_valuation", dir);
        let result = source.compute().await.unwrap();
        assert_eq!(result.score, Some(62.0));
        assert_eq!(result.source.as_deref(), Some("trend-model"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_feed_file_source_malformed() {
        let dir = std::path::Path::new("/tmp/gscore_feeds_malformed_test");
        let _ = std::fs::remove_dir_all(dir);
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("stablecoins.json"), "{not json").unwrap();

        let source = FeedFileSource::new("stablecoins", dir);
        let result = source.compute().await.unwrap();
        assert!(result.score.is_none());
        assert_eq!(result.reason.as_deref(), Some("feed_malformed"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_status_serde_lowercase() {
        assert_eq!(serde_json::to_string(&FactorStatus::Fresh).unwrap(), "\"fresh\"");
        assert_eq!(
            serde_json::from_str::<FactorStatus>("\"excluded\"").unwrap(),
            FactorStatus::Excluded
        );
    }
}
