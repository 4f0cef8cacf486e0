//! Layered configuration: built-in defaults, then an optional YAML file,
//! then `FLEET_UPGRADE_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dfx: DfxConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub top_up: TopUpConfig,
    #[serde(default)]
    pub survey: SurveyConfig,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dfx: DfxConfig::default(),
            timing: TimingConfig::default(),
            retry: RetryConfig::default(),
            top_up: TopUpConfig::default(),
            survey: SurveyConfig::default(),
            output_dir: default_output_dir(),
            log_level: default_log_level(),
        }
    }
}

fn default_output_dir() -> String {
    "logs-upgrade".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// ── dfx ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfxConfig {
    pub binary: String,
    pub call_timeout_secs: u64,
    pub deploy_timeout_secs: u64,
    /// Directory `dfx deploy` runs from (holds dfx.json for the agent build).
    pub deploy_dir: Option<String>,
    pub registry_node: String,
    pub registry_method: String,
    /// Deployment-key mapping file, relative to `deploy_dir` when not absolute.
    pub canister_ids_file: String,
    /// Command that refreshes the mapping file before a run.
    pub prepare_command: Vec<String>,
}

impl Default for DfxConfig {
    fn default() -> Self {
        Self {
            binary: "dfx".to_string(),
            call_timeout_secs: 120,
            deploy_timeout_secs: 900,
            deploy_dir: None,
            registry_node: "game_state_canister".to_string(),
            registry_method: "getMainerAgentCanistersAdmin".to_string(),
            canister_ids_file: "canister_ids.json".to_string(),
            prepare_command: Vec::new(),
        }
    }
}

impl DfxConfig {
    pub fn canister_ids_path(&self) -> PathBuf {
        let file = PathBuf::from(&self.canister_ids_file);
        match &self.deploy_dir {
            Some(dir) if file.is_relative() => Path::new(dir).join(file),
            _ => file,
        }
    }
}

// ── Timing ─────────────────────────────────────────────────

/// Polling cadence for the drain and post-upgrade gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub call_throttle_ms: u64,
    pub queue_grace_secs: u64,
    pub flag_propagation_secs: u64,
    pub flag_poll_attempts: u32,
    pub maintenance_gate_attempts: u32,
    pub maintenance_gate_interval_secs: u64,
    pub health_settle_secs: u64,
    pub health_attempts: u32,
    pub health_interval_secs: u64,
    pub health_maintenance_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            call_throttle_ms: 500,
            queue_grace_secs: 600,
            flag_propagation_secs: 3,
            flag_poll_attempts: 5,
            maintenance_gate_attempts: 10,
            maintenance_gate_interval_secs: 6,
            health_settle_secs: 10,
            health_attempts: 5,
            health_interval_secs: 5,
            health_maintenance_interval_secs: 15,
        }
    }
}

impl TimingConfig {
    /// No throttling and no waits; used by tests against in-memory platforms.
    pub fn immediate() -> Self {
        Self {
            call_throttle_ms: 0,
            queue_grace_secs: 600,
            flag_propagation_secs: 0,
            flag_poll_attempts: 3,
            maintenance_gate_attempts: 3,
            maintenance_gate_interval_secs: 0,
            health_settle_secs: 0,
            health_attempts: 3,
            health_interval_secs: 0,
            health_maintenance_interval_secs: 0,
        }
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.call_throttle_ms)
    }

    pub fn queue_grace(&self) -> Duration {
        Duration::from_secs(self.queue_grace_secs)
    }
}

// ── Retry budgets ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Read-only calls: safe to repeat, generous budget.
    pub status: RetryPolicy,
    /// Single mutating calls.
    pub mutation: RetryPolicy,
    /// Deploys: network-heavy, idempotent to retry.
    pub deploy: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            status: RetryPolicy::new(5, 3.0),
            mutation: RetryPolicy::new(3, 2.0),
            deploy: RetryPolicy::new(5, 10.0),
        }
    }
}

// ── Top-up ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopUpConfig {
    /// Grant size in trillions of cycles.
    pub amount_tc: u64,
    pub settle_secs: u64,
}

impl Default for TopUpConfig {
    fn default() -> Self {
        Self {
            amount_tc: 1,
            settle_secs: 10,
        }
    }
}

impl TopUpConfig {
    pub fn cycles(&self) -> u128 {
        u128::from(self.amount_tc) * 1_000_000_000_000
    }
}

// ── Survey ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurveyConfig {
    pub workers: usize,
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self { workers: 10 }
    }
}

// ── Loading ────────────────────────────────────────────────

impl Config {
    /// Default config file: `~/.config/fleet-upgrade/config.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("fleet-upgrade").join("config.yaml"))
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        let file = path
            .map(Path::to_path_buf)
            .or_else(Self::default_path);
        if let Some(file) = file {
            figment = figment.merge(Yaml::file(file));
        }
        figment.merge(Env::prefixed("FLEET_UPGRADE_").split("__"))
    }
}

/// Load configuration. An explicit `path` must exist; the default path is optional.
pub fn load(path: Option<&Path>) -> Result<Config> {
    if let Some(p) = path {
        if !p.exists() {
            anyhow::bail!("config file {} does not exist", p.display());
        }
    }
    Config::figment(path)
        .extract()
        .with_context(|| match path {
            Some(p) => format!("loading configuration from {}", p.display()),
            None => "loading configuration".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_keep_observed_cadence() {
        let cfg = Config::default();
        assert_eq!(cfg.timing.queue_grace_secs, 600);
        assert_eq!(cfg.retry.status.max_attempts, 5);
        assert_eq!(cfg.survey.workers, 10);
        assert_eq!(cfg.top_up.cycles(), 1_000_000_000_000);
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "timing:\n  queue_grace_secs: 120\nsurvey:\n  workers: 4\ndfx:\n  deploy_dir: /srv/agent"
        )
        .unwrap();

        let cfg = load(Some(file.path())).unwrap();
        assert_eq!(cfg.timing.queue_grace_secs, 120);
        // untouched keys in a partially specified section keep their defaults
        assert_eq!(cfg.timing.health_attempts, 5);
        assert_eq!(cfg.survey.workers, 4);
        assert_eq!(
            cfg.dfx.canister_ids_path(),
            PathBuf::from("/srv/agent/canister_ids.json")
        );
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
