//! Per-endpoint RPC limitations.
//!
//! Raw limits are measured by calibration runs and persisted in a findings
//! file (`chain → url prefix → limitations`). The registry derives the
//! limits actually used at runtime: it caps batches on endpoints with a
//! short internal timeout, honours `disableBatching`, applies a per-method
//! safety margin and turns batches of one into "no batching".

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chainrange_core::planner::PlannerOptions;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::{debug, error, trace};

use crate::error::RpcError;
use crate::request::RpcMethod;

/// Calibration ceiling: a raw limit equal to this means "no limit was found".
pub const MAX_RPC_BATCHING_SIZE: usize = 500;

/// Widest `eth_getLogs` span ever tried during calibration.
pub const MAX_RPC_GETLOGS_SPAN: u64 = 10_000;

/// Calls slower than this count as failed while calibrating, and are
/// reported as slow at runtime.
pub const RPC_SOFT_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Types ───────────────────────────────────────────────────────────────────

/// Minimum spacing between two calls to the same endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinDelay {
    NoLimit,
    Millis(u64),
}

impl MinDelay {
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::NoLimit => None,
            Self::Millis(ms) => Some(Duration::from_millis(*ms)),
        }
    }
}

impl Serialize for MinDelay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::NoLimit => serializer.serialize_str("no-limit"),
            Self::Millis(ms) => serializer.serialize_u64(*ms),
        }
    }
}

impl<'de> Deserialize<'de> for MinDelay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Self::Millis(ms)),
            Raw::Text(s) if s == "no-limit" => Ok(Self::NoLimit),
            Raw::Text(s) => Err(serde::de::Error::custom(format!(
                "invalid minDelayBetweenCalls '{s}', expected a number or \"no-limit\""
            ))),
        }
    }
}

/// Limitations of one endpoint, raw (as measured) or derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLimitations {
    /// Whether the node serves historical state.
    pub is_archive_node: bool,
    pub min_delay_between_calls: MinDelay,
    /// Widest block span accepted by `eth_getLogs`.
    pub max_get_logs_block_span: u64,
    /// Server-side timeout, when the endpoint has a short one.
    #[serde(default)]
    pub internal_timeout_ms: Option<u64>,
    #[serde(default)]
    pub disable_batching: bool,
    /// Maximum batch size per method. `None` forbids batching.
    #[serde(default)]
    pub methods: BTreeMap<RpcMethod, Option<usize>>,
}

impl RpcLimitations {
    /// Limits assumed for an endpoint nothing is known about.
    pub fn conservative() -> Self {
        Self {
            is_archive_node: false,
            min_delay_between_calls: MinDelay::Millis(1_000),
            max_get_logs_block_span: 10,
            internal_timeout_ms: None,
            disable_batching: false,
            methods: RpcMethod::ALL.iter().map(|m| (*m, None)).collect(),
        }
    }

    /// Maximum batch size for `method`, `None` when calls must go one by one.
    pub fn batch_size(&self, method: RpcMethod) -> Option<usize> {
        self.methods.get(&method).copied().flatten()
    }

    /// Apply the derivation rules to raw, measured limitations.
    pub fn derive(&self, margins: &SafetyMargins) -> Self {
        let mut derived = self.clone();
        for (method, limit) in derived.methods.iter_mut() {
            let Some(raw) = *limit else { continue };
            *limit = derive_limit(raw, *method, self.internal_timeout_ms, self.disable_batching, margins);
            if *limit != Some(raw) {
                trace!(method = %method, raw, derived = ?limit, "lowered rpc limitation");
            }
        }
        derived
    }

    /// Planner options fitting this endpoint, on top of `base`.
    pub fn planner_options(&self, base: PlannerOptions) -> PlannerOptions {
        base.max_range_size(self.max_get_logs_block_span.clamp(1, MAX_RPC_GETLOGS_SPAN))
    }
}

fn derive_limit(
    raw: usize,
    method: RpcMethod,
    internal_timeout_ms: Option<u64>,
    disable_batching: bool,
    margins: &SafetyMargins,
) -> Option<usize> {
    let mut limit = raw;
    match internal_timeout_ms {
        Some(ms) if ms <= 5_000 => limit = limit.min(10),
        Some(ms) if ms <= 10_000 => limit = limit.min(30),
        _ => {}
    }
    if disable_batching {
        return None;
    }
    if limit != MAX_RPC_BATCHING_SIZE {
        limit = (limit as f64 * margins.for_method(method)).floor() as usize;
    }
    (limit > 1).then_some(limit)
}

fn default_get_logs_margin() -> f64 {
    0.7
}

fn default_call_margin() -> f64 {
    0.8
}

fn default_get_block_by_number_margin() -> f64 {
    0.7
}

fn default_block_number_margin() -> f64 {
    0.7
}

fn default_get_transaction_receipt_margin() -> f64 {
    0.5
}

/// Fraction of a measured limit actually used, per method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyMargins {
    #[serde(default = "default_get_logs_margin")]
    pub get_logs: f64,
    #[serde(default = "default_call_margin")]
    pub call: f64,
    #[serde(default = "default_get_block_by_number_margin")]
    pub get_block_by_number: f64,
    #[serde(default = "default_block_number_margin")]
    pub block_number: f64,
    /// Receipts are large, stay well below the measured limit.
    #[serde(default = "default_get_transaction_receipt_margin")]
    pub get_transaction_receipt: f64,
}

impl Default for SafetyMargins {
    fn default() -> Self {
        Self {
            get_logs: default_get_logs_margin(),
            call: default_call_margin(),
            get_block_by_number: default_get_block_by_number_margin(),
            block_number: default_block_number_margin(),
            get_transaction_receipt: default_get_transaction_receipt_margin(),
        }
    }
}

impl SafetyMargins {
    pub fn for_method(&self, method: RpcMethod) -> f64 {
        match method {
            RpcMethod::GetLogs => self.get_logs,
            RpcMethod::Call => self.call,
            RpcMethod::GetBlockByNumber => self.get_block_by_number,
            RpcMethod::BlockNumber => self.block_number,
            RpcMethod::GetTransactionReceipt => self.get_transaction_receipt,
        }
    }
}

/// Raw findings: chain → url prefix → limitations.
pub type RawFindings = BTreeMap<String, BTreeMap<String, RpcLimitations>>;

// ─── Findings file ───────────────────────────────────────────────────────────

/// The JSON file calibration runs write their findings to.
#[derive(Debug, Clone)]
pub struct FindingsFile {
    path: PathBuf,
}

impl FindingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the findings. A missing file means "nothing measured yet".
    pub async fn load(&self) -> Result<RawFindings, RpcError> {
        let value = self.read_value().await?;
        serde_json::from_value(value).map_err(|e| self.error(e))
    }

    /// Deep-merge `diff` into the stored findings and write the file back.
    pub async fn merge_and_save(&self, diff: &RawFindings) -> Result<RawFindings, RpcError> {
        let mut current = self.read_value().await?;
        let patch = serde_json::to_value(diff).map_err(|e| self.error(e))?;
        deep_merge(&mut current, patch);

        let merged: RawFindings = serde_json::from_value(current).map_err(|e| self.error(e))?;
        let body = serde_json::to_string_pretty(&merged).map_err(|e| self.error(e))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await.map_err(|e| self.error(e))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| self.error(e))?;
        debug!(path = %self.path.display(), chains = merged.len(), "rpc findings saved");
        Ok(merged)
    }

    async fn read_value(&self) -> Result<Value, RpcError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| self.error(e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Object(Default::default())),
            Err(e) => Err(self.error(e)),
        }
    }

    fn error(&self, e: impl fmt::Display) -> RpcError {
        RpcError::Findings(format!("{}: {e}", self.path.display()))
    }
}

/// Recursively merge `patch` into `base`. Objects merge key by key; any other
/// value in `patch` replaces the one in `base`.
fn deep_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Derived limitations of every known endpoint, computed once.
#[derive(Debug, Clone, Default)]
pub struct LimitationRegistry {
    chains: BTreeMap<String, BTreeMap<String, RpcLimitations>>,
}

impl LimitationRegistry {
    pub fn new(raw: &RawFindings, margins: &SafetyMargins) -> Self {
        let chains = raw
            .iter()
            .map(|(chain, endpoints)| {
                let derived = endpoints
                    .iter()
                    .map(|(prefix, limits)| {
                        let derived = limits.derive(margins);
                        if derived != *limits {
                            debug!(chain = %chain, url = %prefix, "derived rpc limitations differ from raw findings");
                        }
                        (prefix.clone(), derived)
                    })
                    .collect();
                (chain.clone(), derived)
            })
            .collect();
        Self { chains }
    }

    pub async fn load(file: &FindingsFile, margins: &SafetyMargins) -> Result<Self, RpcError> {
        let raw = file.load().await?;
        Ok(Self::new(&raw, margins))
    }

    /// Limitations of the longest registered prefix of `url` on `chain`.
    /// Unknown endpoints get [`RpcLimitations::conservative`].
    pub fn get_limitations(&self, chain: &str, url: &str) -> RpcLimitations {
        let found = self.chains.get(chain).and_then(|endpoints| {
            endpoints
                .iter()
                .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, limits)| limits.clone())
        });
        found.unwrap_or_else(|| {
            error!(chain, url, "No rpc limitations found for chain/rpcUrl");
            RpcLimitations::conservative()
        })
    }

    /// Every endpoint prefix known for `chain`.
    pub fn urls_for_chain(&self, chain: &str) -> Result<Vec<String>, RpcError> {
        self.chains
            .get(chain)
            .filter(|endpoints| !endpoints.is_empty())
            .map(|endpoints| endpoints.keys().cloned().collect())
            .ok_or_else(|| RpcError::UnknownChain(chain.to_string()))
    }

    /// Chains with at least one measured endpoint, sorted.
    pub fn chains(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(timeout: Option<u64>, get_logs: Option<usize>) -> RpcLimitations {
        let mut limits = RpcLimitations::conservative();
        limits.internal_timeout_ms = timeout;
        limits.methods.insert(RpcMethod::GetLogs, get_logs);
        limits
    }

    fn findings(limits: RpcLimitations) -> RawFindings {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("https://rpc.ankr.com/bsc".to_string(), limits);
        let mut raw = BTreeMap::new();
        raw.insert("bsc".to_string(), endpoints);
        raw
    }

    #[test]
    fn timeout_cap_then_margin() {
        let derived = raw(Some(8_000), Some(100)).derive(&SafetyMargins::default());
        assert_eq!(derived.batch_size(RpcMethod::GetLogs), Some(21));
    }

    #[test]
    fn short_timeout_caps_at_ten() {
        let derived = raw(Some(3_000), Some(100)).derive(&SafetyMargins::default());
        assert_eq!(derived.batch_size(RpcMethod::GetLogs), Some(7));
    }

    #[test]
    fn calibration_ceiling_skips_margin() {
        let derived = raw(None, Some(MAX_RPC_BATCHING_SIZE)).derive(&SafetyMargins::default());
        assert_eq!(derived.batch_size(RpcMethod::GetLogs), Some(MAX_RPC_BATCHING_SIZE));
    }

    #[test]
    fn tiny_or_disabled_batches_become_none() {
        let derived = raw(None, Some(2)).derive(&SafetyMargins::default());
        assert_eq!(derived.batch_size(RpcMethod::GetLogs), None);

        let mut disabled = raw(None, Some(100));
        disabled.disable_batching = true;
        assert_eq!(disabled.derive(&SafetyMargins::default()).batch_size(RpcMethod::GetLogs), None);
    }

    #[test]
    fn receipts_use_the_lowest_margin() {
        let mut limits = RpcLimitations::conservative();
        limits.methods.insert(RpcMethod::GetTransactionReceipt, Some(100));
        limits.methods.insert(RpcMethod::Call, Some(100));
        let derived = limits.derive(&SafetyMargins::default());
        assert_eq!(derived.batch_size(RpcMethod::GetTransactionReceipt), Some(50));
        assert_eq!(derived.batch_size(RpcMethod::Call), Some(80));
    }

    #[test]
    fn findings_json_shape() {
        let limits: RpcLimitations = serde_json::from_value(json!({
            "isArchiveNode": true,
            "minDelayBetweenCalls": "no-limit",
            "maxGetLogsBlockSpan": 3000,
            "internalTimeoutMs": null,
            "disableBatching": false,
            "methods": {
                "eth_getLogs": 500,
                "eth_call": null,
                "eth_getBlockByNumber": 100,
                "eth_blockNumber": 100,
                "eth_getTransactionReceipt": 10
            }
        }))
        .unwrap();
        assert!(limits.is_archive_node);
        assert_eq!(limits.min_delay_between_calls, MinDelay::NoLimit);
        assert_eq!(limits.batch_size(RpcMethod::GetLogs), Some(500));
        assert_eq!(limits.batch_size(RpcMethod::Call), None);

        assert!(serde_json::from_value::<MinDelay>(json!("soon")).is_err());
        assert_eq!(serde_json::to_value(MinDelay::Millis(250)).unwrap(), json!(250));
    }

    #[test]
    fn longest_prefix_wins() {
        let mut raw_findings = findings(raw(None, Some(100)));
        raw_findings
            .get_mut("bsc")
            .unwrap()
            .insert("https://rpc.ankr.com/bsc/premium".to_string(), raw(None, Some(MAX_RPC_BATCHING_SIZE)));
        let registry = LimitationRegistry::new(&raw_findings, &SafetyMargins::default());

        let premium = registry.get_limitations("bsc", "https://rpc.ankr.com/bsc/premium/KEY");
        assert_eq!(premium.batch_size(RpcMethod::GetLogs), Some(MAX_RPC_BATCHING_SIZE));
        let public = registry.get_limitations("bsc", "https://rpc.ankr.com/bsc");
        assert_eq!(public.batch_size(RpcMethod::GetLogs), Some(70));
    }

    #[test]
    fn unknown_endpoint_gets_conservative_defaults() {
        let registry = LimitationRegistry::new(&findings(raw(None, Some(100))), &SafetyMargins::default());
        assert_eq!(registry.get_limitations("bsc", "https://other.rpc"), RpcLimitations::conservative());
        assert_eq!(registry.get_limitations("fantom", "https://rpc.ankr.com/bsc"), RpcLimitations::conservative());
    }

    #[test]
    fn urls_for_chain_lists_prefixes() {
        let registry = LimitationRegistry::new(&findings(raw(None, Some(100))), &SafetyMargins::default());
        assert_eq!(registry.urls_for_chain("bsc").unwrap(), vec!["https://rpc.ankr.com/bsc".to_string()]);
        assert!(matches!(registry.urls_for_chain("fantom"), Err(RpcError::UnknownChain(_))));
        assert_eq!(registry.chains().collect::<Vec<_>>(), vec!["bsc"]);
    }

    #[test]
    fn planner_options_follow_get_logs_span() {
        let mut limits = RpcLimitations::conservative();
        limits.max_get_logs_block_span = 2_000;
        let options = limits.planner_options(PlannerOptions::default().max_addresses_per_query(5));
        assert_eq!(options.max_range_size, 2_000);
        assert_eq!(options.max_addresses_per_query, 5);
    }

    #[test]
    fn planner_options_cap_span_at_calibration_ceiling() {
        let mut limits = RpcLimitations::conservative();
        limits.max_get_logs_block_span = 1_000_000;
        assert_eq!(limits.planner_options(PlannerOptions::default()).max_range_size, MAX_RPC_GETLOGS_SPAN);

        limits.max_get_logs_block_span = 0;
        assert_eq!(limits.planner_options(PlannerOptions::default()).max_range_size, 1);
    }

    #[tokio::test]
    async fn findings_file_merge_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let file = FindingsFile::new(dir.path().join("rpc-limitations.json"));
        assert!(file.load().await.unwrap().is_empty());

        file.merge_and_save(&findings(raw(None, Some(100)))).await.unwrap();

        let mut update = findings(raw(Some(8_000), Some(40)));
        let mut polygon = BTreeMap::new();
        polygon.insert("https://polygon-rpc.com".to_string(), RpcLimitations::conservative());
        update.insert("polygon".to_string(), polygon);
        file.merge_and_save(&update).await.unwrap();

        let stored = file.load().await.unwrap();
        assert_eq!(stored.len(), 2);
        let bsc = &stored["bsc"]["https://rpc.ankr.com/bsc"];
        assert_eq!(bsc.internal_timeout_ms, Some(8_000));
        assert_eq!(bsc.batch_size(RpcMethod::GetLogs), Some(40));

        let registry = LimitationRegistry::load(&file, &SafetyMargins::default()).await.unwrap();
        assert_eq!(
            registry
                .get_limitations("bsc", "https://rpc.ankr.com/bsc")
                .batch_size(RpcMethod::GetLogs),
            Some(21)
        );
    }

    #[test]
    fn deep_merge_keeps_untouched_keys() {
        let mut base = json!({"bsc": {"a": {"x": 1, "y": 2}}, "eth": {}});
        deep_merge(&mut base, json!({"bsc": {"a": {"y": 3}, "b": {}}}));
        assert_eq!(base, json!({"bsc": {"a": {"x": 1, "y": 3}, "b": {}}, "eth": {}}));
    }
}
