//! Controller settings: a YAML file named by `UNITSET_CONFIG`, then
//! environment overrides, then defaults for anything left unset.

use crate::errors::*;
use crate::retry::Backoff;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_CONFIG_PATH: &str = "UNITSET_CONFIG";
pub const ENV_NAMESPACE: &str = "UNITSET_NAMESPACE";
pub const ENV_WORKERS: &str = "UNITSET_WORKERS";

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Watch a single namespace instead of the whole cluster.
    pub namespace: Option<String>,
    /// UnitSets reconciled concurrently. A key is never handled by two
    /// workers at once.
    pub workers: u16,
    /// Reporting component on emitted events.
    pub controller_name: String,
    /// First requeue delay after a failed reconcile.
    pub requeue_base_ms: u64,
    /// Ceiling of the per-key requeue delay.
    pub requeue_max_secs: u64,
    /// Attempts at a conflicting status write.
    pub status_retry_steps: u32,
    /// Requeue interval for sets that reconciled cleanly.
    pub resync_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: None,
            workers: 2,
            controller_name: "unitset-controller".to_string(),
            requeue_base_ms: 5,
            requeue_max_secs: 1000,
            status_retry_steps: 5,
            resync_secs: 300,
        }
    }
}

impl Config {
    /// Reads the file named by `UNITSET_CONFIG`, if any, and applies
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Config::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .chain_err(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)?;
        if config.workers == 0 {
            bail!("workers must be at least 1");
        }
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(namespace) = lookup(ENV_NAMESPACE).filter(|ns| !ns.is_empty()) {
            self.namespace = Some(namespace);
        }
        if let Some(workers) = lookup(ENV_WORKERS) {
            self.workers = match workers.parse() {
                Ok(n) if n > 0 => n,
                _ => bail!("{} must be a positive integer, got {:?}", ENV_WORKERS, workers),
            };
        }
        Ok(())
    }

    /// Per-key requeue schedule after failed reconciles.
    pub fn requeue_backoff(&self) -> Backoff {
        Backoff {
            steps: u32::MAX,
            duration: Duration::from_millis(self.requeue_base_ms),
            factor: 2.0,
            jitter: 0.1,
            cap: Some(Duration::from_secs(self.requeue_max_secs)),
        }
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_files_keep_defaults() {
        let config = Config::from_yaml("workers: 8\ncontrollerName: units\n").unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.controller_name, "units");
        assert_eq!(config.resync_secs, 300);
        assert_eq!(config.namespace, None);
    }

    #[test]
    fn zero_workers_are_rejected() {
        assert!(Config::from_yaml("workers: 0").is_err());
    }

    #[test]
    fn environment_overrides_the_file() {
        let env: HashMap<&str, &str> = [(ENV_NAMESPACE, "prod"), (ENV_WORKERS, "4")].into();
        let mut config = Config::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.namespace.as_deref(), Some("prod"));
        assert_eq!(config.workers, 4);

        let err = config
            .apply_overrides(|k| (k == ENV_WORKERS).then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_WORKERS));
    }

    #[test]
    fn requeue_backoff_is_capped() {
        let mut config = Config::default();
        let backoff = Config { requeue_max_secs: 1, ..config.clone() }.requeue_backoff();
        assert_eq!(backoff.duration, Duration::from_millis(5));
        assert!(backoff.delay(40) <= Duration::from_millis(1100));
        config.requeue_base_ms = 100;
        assert_eq!(config.requeue_backoff().duration, Duration::from_millis(100));
    }
}
