//! `chainrange.json`: settings shared by every command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use chainrange_core::PlannerOptions;
use chainrange_fetch::FetchGuardConfig;
use chainrange_rpc::SafetyMargins;

use crate::logging::LogConfig;

fn default_findings() -> PathBuf {
    PathBuf::from("rpc-limitations.json")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".chainrange-cache")
}

/// Every field is optional; `{}` is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRangeConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub planner: PlannerOptions,
    #[serde(default)]
    pub fetch: FetchGuardConfig,
    #[serde(default)]
    pub safety_margins: SafetyMargins,
    /// RPC limitations findings file.
    #[serde(default = "default_findings")]
    pub findings: PathBuf,
    /// Directory of the file cache used by fetching commands.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for ChainRangeConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            planner: PlannerOptions::default(),
            fetch: FetchGuardConfig::default(),
            safety_margins: SafetyMargins::default(),
            findings: default_findings(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl ChainRangeConfig {
    /// Read the config at `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file '{}'", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parse config file '{}'", path.display()))?;
        config.planner.validate().context("invalid planner options")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: ChainRangeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.planner, PlannerOptions::default());
        assert_eq!(config.fetch, FetchGuardConfig::default());
        assert_eq!(config.findings, PathBuf::from("rpc-limitations.json"));
    }

    #[test]
    fn load_reads_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chainrange.json");
        std::fs::write(
            &path,
            r#"{"planner": {"max_addresses_per_query": 20}, "log": {"level": "debug"}}"#,
        )
        .unwrap();

        let config = ChainRangeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.planner.max_addresses_per_query, 20);
        assert_eq!(config.planner.max_range_size, PlannerOptions::default().max_range_size);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn load_rejects_invalid_planner_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chainrange.json");
        std::fs::write(&path, r#"{"planner": {"max_addresses_per_query": 0}}"#).unwrap();
        assert!(ChainRangeConfig::load(Some(&path)).is_err());
    }
}
