use crate::error::{LoomError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Runtime configuration, loaded from YAML and overridable through
/// `LOOMDB_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoomConfig {
    /// SQLite file; `None` keeps everything in memory.
    pub database: Option<PathBuf>,
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_ms: u64,
    pub catch_up: CatchUpPolicy,
    /// Upper bound on occurrences emitted per rule in one tick.
    pub max_catch_up: usize,
}

/// What a scheduler tick does with occurrences missed during a poll gap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpPolicy {
    /// One event per missed occurrence.
    #[default]
    EmitAll,
    /// Only the most recent missed occurrence.
    LatestOnly,
}

impl Default for LoomConfig {
    fn default() -> Self {
        LoomConfig {
            database: None,
            default_page_size: 50,
            max_page_size: 500,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            interval_ms: 60_000,
            catch_up: CatchUpPolicy::EmitAll,
            max_catch_up: 100,
        }
    }
}

impl LoomConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: LoomConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Load from a YAML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (the process environment in
    /// production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup("LOOMDB_DB_PATH") {
            self.database = match path.as_str() {
                "" | ":memory:" => None,
                p => Some(PathBuf::from(p)),
            };
        }
        if let Some(v) = lookup("LOOMDB_DEFAULT_PAGE_SIZE") {
            self.default_page_size = parse_var("LOOMDB_DEFAULT_PAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("LOOMDB_MAX_PAGE_SIZE") {
            self.max_page_size = parse_var("LOOMDB_MAX_PAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("LOOMDB_SCHEDULER_INTERVAL_MS") {
            self.scheduler.interval_ms = parse_var("LOOMDB_SCHEDULER_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("LOOMDB_SCHEDULER_CATCH_UP") {
            self.scheduler.catch_up = match v.as_str() {
                "emit_all" => CatchUpPolicy::EmitAll,
                "latest_only" => CatchUpPolicy::LatestOnly,
                other => {
                    return Err(LoomError::InvalidData(format!(
                        "LOOMDB_SCHEDULER_CATCH_UP must be emit_all or latest_only, got '{other}'"
                    )))
                }
            };
        }
        if let Some(v) = lookup("LOOMDB_SCHEDULER_MAX_CATCH_UP") {
            self.scheduler.max_catch_up = parse_var("LOOMDB_SCHEDULER_MAX_CATCH_UP", &v)?;
        }
        Ok(())
    }

    /// Clamp a requested page size to the configured bounds.
    pub fn page_size(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size.max(1))
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| LoomError::InvalidData(format!("{key} has an invalid value '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = LoomConfig::from_yaml_str("max_page_size: 200\nscheduler:\n  catch_up: latest_only\n").unwrap();
        assert_eq!(config.max_page_size, 200);
        assert_eq!(config.default_page_size, 50);
        assert_eq!(config.scheduler.catch_up, CatchUpPolicy::LatestOnly);
        assert_eq!(config.scheduler.interval_ms, 60_000);
        assert!(config.database.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LOOMDB_DB_PATH", "/tmp/loom.db"),
            ("LOOMDB_SCHEDULER_INTERVAL_MS", "250"),
            ("LOOMDB_SCHEDULER_CATCH_UP", "latest_only"),
        ]
        .into_iter()
        .collect();

        let mut config = LoomConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.database, Some(PathBuf::from("/tmp/loom.db")));
        assert_eq!(config.scheduler.interval_ms, 250);
        assert_eq!(config.scheduler.catch_up, CatchUpPolicy::LatestOnly);
    }

    #[test]
    fn test_bad_env_value_is_rejected() {
        let mut config = LoomConfig::default();
        let err = config
            .apply_overrides(|k| (k == "LOOMDB_MAX_PAGE_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("LOOMDB_MAX_PAGE_SIZE"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loomdb.yaml");
        std::fs::write(&path, "default_page_size: 10\n").unwrap();
        let config = LoomConfig::load(&path).unwrap();
        assert_eq!(config.default_page_size, 10);
    }

    #[test]
    fn test_page_size_is_clamped() {
        let config = LoomConfig::default();
        assert_eq!(config.page_size(None), 50);
        assert_eq!(config.page_size(Some(0)), 1);
        assert_eq!(config.page_size(Some(10_000)), 500);
    }
}
