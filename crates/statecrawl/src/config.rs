//! Scanner configuration
//!
//! All tunables consumed by the pipeline live here. The configuration is
//! deserialized once (usually from a YAML file), validated, and then passed
//! around behind an `Arc`; it is immutable for the lifetime of a batch.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Distance used for pairwise comparison of record fingerprints.
///
/// Similarity metrics (Jaro-Winkler, MLIPNS) are inverted to distances so
/// every variant is non-negative and symmetric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum DistanceType {
    /// TLSH header+body difference between two fingerprints
    #[default]
    Tlsh,
    /// Per-character embedding of the fingerprint, clustered in Euclidean space
    Hash2Vec,
    /// Levenshtein edit distance
    Levenshtein,
    /// Hamming distance (length difference counts as mismatches)
    Hamming,
    /// Damerau-Levenshtein edit distance
    DamerauLevenshtein,
    /// `1 - jaro_winkler(a, b)`
    JaroWinklerInverted,
    /// `1 - mlipns(a, b)`
    MlipnsInverted,
    /// Caller supplies a ready-made distance matrix
    Precomputed,
}

impl FromStr for DistanceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tlsh" => Ok(Self::Tlsh),
            "hash2vec" => Ok(Self::Hash2Vec),
            "levenshtein" => Ok(Self::Levenshtein),
            "hamming" => Ok(Self::Hamming),
            "damerau_levenshtein" => Ok(Self::DamerauLevenshtein),
            "jaro-winkler-inverted" => Ok(Self::JaroWinklerInverted),
            "mlipns" => Ok(Self::MlipnsInverted),
            "precomputed" => Ok(Self::Precomputed),
            other => Err(Error::config(format!("unknown distance type '{other}'"))),
        }
    }
}

impl TryFrom<String> for DistanceType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DistanceType> for String {
    fn from(value: DistanceType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DistanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tlsh => "tlsh",
            Self::Hash2Vec => "hash2vec",
            Self::Levenshtein => "levenshtein",
            Self::Hamming => "hamming",
            Self::DamerauLevenshtein => "damerau_levenshtein",
            Self::JaroWinklerInverted => "jaro-winkler-inverted",
            Self::MlipnsInverted => "mlipns",
            Self::Precomputed => "precomputed",
        };
        f.write_str(name)
    }
}

/// Strategy for picking the DBSCAN neighborhood radius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum EpsSelection {
    /// Sweep eps over `0.1 * m, m in 2..=9` and keep the best silhouette score
    #[default]
    Silhouette,
    /// Knee of the sorted 2-NN distance curve (maximum second difference)
    Knee,
    /// Knee variant that drops zero distances before locating the knee
    KneeDropZeros,
    /// A fixed `1e-9`: every point is its own cluster unless identical
    InfinitesimalFixed,
}

impl FromStr for EpsSelection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sil" => Ok(Self::Silhouette),
            "knee" => Ok(Self::Knee),
            "kneed_lib" => Ok(Self::KneeDropZeros),
            "infinitesimal-fixed" => Ok(Self::InfinitesimalFixed),
            other => Err(Error::config(format!("unknown eps selection '{other}'"))),
        }
    }
}

impl TryFrom<String> for EpsSelection {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<EpsSelection> for String {
    fn from(value: EpsSelection) -> Self {
        match value {
            EpsSelection::Silhouette => "sil",
            EpsSelection::Knee => "knee",
            EpsSelection::KneeDropZeros => "kneed_lib",
            EpsSelection::InfinitesimalFixed => "infinitesimal-fixed",
        }
        .to_string()
    }
}

/// Which document field feeds the distance calculation.
///
/// `Top` names a top-level key (`"hash"`); `Path` walks nested documents
/// (`["response", "data"]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSelector {
    /// A single top-level field name
    Top(String),
    /// A path of keys into nested documents
    Path(Vec<String>),
}

impl Default for FieldSelector {
    fn default() -> Self {
        Self::Top("hash".to_string())
    }
}

impl FieldSelector {
    /// Extract the selected field from a JSON representation of a record.
    pub fn project(&self, doc: &serde_json::Value) -> Result<String> {
        let value = match self {
            Self::Top(key) => doc.get(key),
            Self::Path(keys) => {
                let mut cursor = Some(doc);
                for key in keys {
                    cursor = cursor.and_then(|v| v.get(key));
                }
                cursor
            }
        };
        match value {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(Error::invalid_record(format!(
                "field {self:?} not present in document"
            ))),
        }
    }

    fn validate(&self) -> Result<()> {
        let empty = match self {
            Self::Top(key) => key.is_empty(),
            Self::Path(keys) => keys.is_empty() || keys.iter().any(String::is_empty),
        };
        if empty {
            return Err(Error::config("empty field selector"));
        }
        Ok(())
    }
}

/// Endpoint detector flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DetectorVariant {
    /// First-of-its-locator-group wins
    Basic,
    /// Cluster-count watermark per peer group
    #[default]
    Clustering,
}

/// How the four detectors and the crawler are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum ExecutionMode {
    /// Round-robin in a single task until the crawler converges (normative)
    #[default]
    Sequential,
    /// One background task per work, each looping with a throttle
    ParallelThreaded,
    /// Works are pushed onto named queues drained by external consumers
    ParallelQueue,
}

impl FromStr for ExecutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "parallel-threaded" => Ok(Self::ParallelThreaded),
            "parallel-queue" => Ok(Self::ParallelQueue),
            other => Err(Error::config(format!("unknown execution type '{other}'"))),
        }
    }
}

impl TryFrom<String> for ExecutionMode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ExecutionMode> for String {
    fn from(value: ExecutionMode) -> Self {
        match value {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::ParallelThreaded => "parallel-threaded",
            ExecutionMode::ParallelQueue => "parallel-queue",
        }
        .to_string()
    }
}

/// Projection of a request/response pair that feeds the interaction hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum InteractionHashMethod {
    /// Method, scheme, path, status code and the `<a>`/`<form>` elements
    #[default]
    LinksOnly,
    /// `LinksOnly` plus query parameters and request headers
    LinksWithParams,
    /// Everything, including the full response body
    WholeResponse,
}

impl FromStr for InteractionHashMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "links-only" => Ok(Self::LinksOnly),
            "links-with-params" => Ok(Self::LinksWithParams),
            "whole-response" => Ok(Self::WholeResponse),
            other => Err(Error::config(format!(
                "unknown interaction hash method '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for InteractionHashMethod {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<InteractionHashMethod> for String {
    fn from(value: InteractionHashMethod) -> Self {
        match value {
            InteractionHashMethod::LinksOnly => "links-only",
            InteractionHashMethod::LinksWithParams => "links-with-params",
            InteractionHashMethod::WholeResponse => "whole-response",
        }
        .to_string()
    }
}

/// Crawler and interaction-handler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Drop extracted endpoints whose host differs from the source endpoint
    pub restrict_host: bool,
    /// Paths that are never turned into endpoints (the reset path is always added)
    pub ignore_paths: Vec<String>,
    /// Per-request timeout for the shared HTTP session
    pub request_timeout_secs: u64,
    /// Projection used when hashing interactions
    pub interaction_hash_method: InteractionHashMethod,
    /// Path of the user-defined entry endpoint seeded at startup
    pub initial_path: String,
    /// Path of the user-defined reset endpoint seeded at startup
    pub reset_path: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            restrict_host: true,
            ignore_paths: Vec::new(),
            request_timeout_secs: 50,
            interaction_hash_method: InteractionHashMethod::LinksOnly,
            initial_path: "/".to_string(),
            reset_path: "/reset".to_string(),
        }
    }
}

/// State navigator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigatorConfig {
    /// How many times a fully-visited state is re-walked before moving on
    pub max_revisits: u32,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self { max_revisits: 3 }
    }
}

/// Endpoint detector settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EndpointDetectorConfig {
    /// Basic (locator-group) or clustering-based detection
    pub variant: DetectorVariant,
    /// Distance used when clustering the peer group
    pub distance_type: DistanceType,
    /// Field fed into the distance calculation
    pub field_for_distance: FieldSelector,
    /// Delete dirty endpoints instead of leaving them unclean
    pub delete_dirty: bool,
    /// Neighborhood radius selection
    pub eps_selection: EpsSelection,
}

/// State-change detector settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StateChangeDetectorConfig {
    /// Distance used when clustering similar interactions
    pub distance_type: DistanceType,
    /// Field fed into the distance calculation (e.g. `response.data`)
    pub field_for_distance: FieldSelector,
    /// Only consider interactions produced by a fuzzer
    pub only_interactions_from_fuzzer: bool,
    /// Neighborhood radius selection
    pub eps_selection: EpsSelection,
}

/// State detector (collapser) settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StateDetectorConfig {
    /// Distance used when clustering state hashes
    pub distance_type: DistanceType,
    /// Field fed into the distance calculation
    pub field_for_distance: FieldSelector,
    /// Delete collapsed states (and descendants) instead of marking them
    pub delete_collapsed: bool,
    /// Neighborhood radius selection
    pub eps_selection: EpsSelection,
}

/// Work manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Scheduling discipline
    pub execution_type: ExecutionMode,
    /// Sleep between iterations in the parallel disciplines (milliseconds)
    pub throttle_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            execution_type: ExecutionMode::Sequential,
            throttle_ms: 200,
        }
    }
}

/// Status HTTP surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address the status server binds to
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3030".to_string(),
        }
    }
}

/// Top-level scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Seed for the deterministic hash padding
    pub random_seed: u64,
    /// Crawler / interaction handler section
    pub crawler: CrawlerConfig,
    /// Navigator section
    pub state_navigator: NavigatorConfig,
    /// Endpoint detector section
    pub endpoint_detector: EndpointDetectorConfig,
    /// State-change detector section
    pub state_change_detector: StateChangeDetectorConfig,
    /// State collapser section
    pub state_detector: StateDetectorConfig,
    /// Work manager section
    pub workers: WorkersConfig,
    /// Status surface section
    pub api: ApiConfig,
}

impl Config {
    /// Load and validate a configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("cannot read config file: {e}")))?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate a configuration from a YAML string.
    pub fn from_yaml(raw: &str) -> Result<Arc<Self>> {
        let config: Self = serde_yml::from_str(raw)
            .map_err(|e| Error::config(format!("cannot parse config: {e}")))?;
        config.validate()?;
        Ok(Arc::new(config))
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.endpoint_detector.field_for_distance.validate()?;
        self.state_change_detector.field_for_distance.validate()?;
        self.state_detector.field_for_distance.validate()?;
        if self.crawler.request_timeout_secs == 0 {
            return Err(Error::config("request_timeout_secs must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.random_seed, 0);
        assert!(config.crawler.restrict_host);
        assert_eq!(config.crawler.request_timeout_secs, 50);
        assert_eq!(config.state_navigator.max_revisits, 3);
        assert_eq!(config.endpoint_detector.distance_type, DistanceType::Tlsh);
        assert_eq!(
            config.endpoint_detector.field_for_distance,
            FieldSelector::Top("hash".to_string())
        );
        assert_eq!(config.workers.execution_type, ExecutionMode::Sequential);
        assert_eq!(config.workers.throttle_ms, 200);
    }

    #[test]
    fn test_parse_yaml_sections() {
        let yaml = r#"
random_seed: 42
state_navigator:
  max_revisits: 2
endpoint_detector:
  variant: basic
  distance_type: hash2vec
  delete_dirty: true
state_change_detector:
  distance_type: levenshtein
  field_for_distance: [response, data]
workers:
  execution_type: parallel-threaded
  throttle_ms: 50
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.random_seed, 42);
        assert_eq!(config.state_navigator.max_revisits, 2);
        assert_eq!(config.endpoint_detector.variant, DetectorVariant::Basic);
        assert_eq!(
            config.endpoint_detector.distance_type,
            DistanceType::Hash2Vec
        );
        assert!(config.endpoint_detector.delete_dirty);
        assert_eq!(
            config.state_change_detector.distance_type,
            DistanceType::Levenshtein
        );
        assert_eq!(
            config.state_change_detector.field_for_distance,
            FieldSelector::Path(vec!["response".to_string(), "data".to_string()])
        );
        assert_eq!(
            config.workers.execution_type,
            ExecutionMode::ParallelThreaded
        );
        assert_eq!(config.workers.throttle_ms, 50);
    }

    #[test]
    fn test_unknown_distance_type_is_fatal() {
        let yaml = "endpoint_detector:\n  distance_type: cosine\n";
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unknown_execution_type_is_fatal() {
        let yaml = "workers:\n  execution_type: distributed\n";
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_empty_field_selector_is_fatal() {
        let yaml = "state_detector:\n  field_for_distance: \"\"\n";
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("empty field selector"));
    }

    #[test]
    fn test_field_selector_projection() {
        let doc = serde_json::json!({
            "hash": "T1AB",
            "response": { "data": "<html></html>", "code": 200 }
        });
        let top = FieldSelector::Top("hash".to_string());
        assert_eq!(top.project(&doc).unwrap(), "T1AB");

        let path = FieldSelector::Path(vec!["response".to_string(), "data".to_string()]);
        assert_eq!(path.project(&doc).unwrap(), "<html></html>");

        let missing = FieldSelector::Top("nope".to_string());
        assert!(missing.project(&doc).is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "random_seed: 7\nstate_navigator:\n  max_revisits: 1\n").unwrap();
        let config = Config::from_yaml_file(&path).unwrap();
        assert_eq!(config.random_seed, 7);
        assert_eq!(config.state_navigator.max_revisits, 1);
    }

    #[test]
    fn test_missing_config_file_is_fatal() {
        let err = Config::from_yaml_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_distance_type_round_trip() {
        for name in [
            "tlsh",
            "hash2vec",
            "levenshtein",
            "hamming",
            "damerau_levenshtein",
            "jaro-winkler-inverted",
            "mlipns",
            "precomputed",
        ] {
            let parsed: DistanceType = name.parse().unwrap();
            assert_eq!(parsed.to_string(), name);
        }
    }
}
