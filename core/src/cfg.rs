use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::job::{Action, BackoffPolicy, Constraint, JobSpec};

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"locsampler"`.
    pub application: &'static str,
}

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    pub log_level: String,
    /// KV directory; the platform data dir when unset.
    pub data_dir: Option<String>,
    /// What to sample and how often.
    pub sampling: SamplingCfg,
    /// Retry backoff applied to `Retry` outcomes.
    pub backoff: BackoffCfg,
    /// Simulated location provider.
    pub source: SourceCfg,
    /// Static permission grants.
    pub permissions: PermissionsCfg,
    /// Constraint probe selection.
    pub device: DeviceCfg,
    /// Status server (only used with the `web-api` feature).
    pub status: StatusCfg,
}

/// `[sampling]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplingCfg {
    /// Unique name of the recurring registration.
    pub job_name: String,
    /// Seconds between periodic ticks.
    pub interval_secs: u64,
    /// Hard deadline for one fix.
    pub deadline_secs: u64,
    /// Request the provider's high accuracy mode.
    pub high_accuracy: bool,
    /// Update interval handed to the provider subscription.
    pub update_interval_secs: u64,
    /// Constraints gating each periodic tick.
    pub constraints: Vec<Constraint>,
    /// Also enqueue a one-shot sample at startup.
    pub run_once_on_start: bool,
}

impl Default for SamplingCfg {
    fn default() -> Self {
        Self {
            job_name: "LocationWork".to_string(),
            interval_secs: 3600,
            deadline_secs: 20,
            high_accuracy: true,
            update_interval_secs: 600,
            constraints: vec![Constraint::BatteryNotLow],
            run_once_on_start: true,
        }
    }
}

impl SamplingCfg {
    /// Sampling action; `background` runs also need background permission.
    pub fn action(&self, background: bool) -> Action {
        Action::SampleLocation {
            deadline_ms: self.deadline_secs.saturating_mul(1000),
            high_accuracy: self.high_accuracy,
            background,
        }
    }

    /// The recurring registration described by this section.
    pub fn periodic_spec(&self) -> JobSpec {
        let mut spec = JobSpec::periodic(
            self.job_name.clone(),
            Duration::from_secs(self.interval_secs),
            self.action(true),
        );
        spec.constraints.extend(self.constraints.iter().copied());
        spec
    }

    /// The startup one-shot (no constraints).
    pub fn once_spec(&self) -> JobSpec {
        JobSpec::once(format!("{}-once", self.job_name), self.action(true))
    }
}

/// `[backoff]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffCfg {
    /// First retry delay.
    pub initial_secs: u64,
    /// Cap on any retry delay.
    pub max_secs: u64,
    /// Retries before falling back to the regular interval.
    pub max_attempts: u32,
}

impl Default for BackoffCfg {
    fn default() -> Self {
        let p = BackoffPolicy::default();
        Self {
            initial_secs: p.initial.as_secs(),
            max_secs: p.max.as_secs(),
            max_attempts: p.max_attempts,
        }
    }
}

impl BackoffCfg {
    /// Convert to the scheduler's policy type.
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_secs(self.initial_secs),
            max: Duration::from_secs(self.max_secs.max(self.initial_secs)),
            max_attempts: self.max_attempts,
        }
    }
}

/// `[source]` section: the simulated provider's fix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceCfg {
    /// Latitude of the delivered fix.
    pub latitude: f64,
    /// Longitude of the delivered fix.
    pub longitude: f64,
    /// Accuracy radius in meters.
    pub accuracy_m: f64,
    /// Delay between subscribe and delivery.
    pub delay_ms: u64,
    /// When false every subscription is refused.
    pub available: bool,
}

impl Default for SourceCfg {
    fn default() -> Self {
        Self {
            latitude: 37.7749,
            longitude: -122.4194,
            accuracy_m: 10.0,
            delay_ms: 1_000,
            available: true,
        }
    }
}

/// `[permissions]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PermissionsCfg {
    /// Foreground (fine) location granted.
    pub foreground_location: bool,
    /// Background location granted.
    pub background_location: bool,
}

impl Default for PermissionsCfg {
    fn default() -> Self {
        Self { foreground_location: true, background_location: true }
    }
}

/// Which constraint probe to use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Read `/sys/class/power_supply` and `/sys/class/net`.
    #[default]
    Sysfs,
    /// Use the static flags below.
    Static,
}

/// `[device]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceCfg {
    /// Probe implementation.
    pub probe: ProbeKind,
    /// Capacity (percent) below which the battery counts as low.
    pub battery_low_percent: u8,
    /// Static probe: battery is low.
    pub battery_low: bool,
    /// Static probe: network is up.
    pub network_available: bool,
}

impl Default for DeviceCfg {
    fn default() -> Self {
        Self {
            probe: ProbeKind::Sysfs,
            battery_low_percent: 15,
            battery_low: false,
            network_available: true,
        }
    }
}

/// `[status]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatusCfg {
    /// Listen address for the status server.
    pub listen: String,
}

impl Default for StatusCfg {
    fn default() -> Self {
        Self { listen: "127.0.0.1:7878".to_string() }
    }
}

impl Config {
    /// Defaults used when no file exists yet.
    pub fn new_default() -> Self {
        Self { log_level: "info".to_string(), ..Self::default() }
    }

    /// KV directory: `data_dir` if set, else the platform data dir.
    pub fn resolve_data_dir(&self, app: &AppId) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(PathBuf::from(dir));
        }
        let pd = project_dirs(app)?;
        Ok(pd.data_dir().join("kv"))
    }
}

fn project_dirs(app: &AppId) -> Result<ProjectDirs> {
    ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let dir = project_dirs(app)?.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<Config> {
    let path = config_dir(app)?.join("config.toml");
    load_from(&path)
}

/// Load `path`, writing defaults there first if it does not exist.
pub fn load_from(path: &Path) -> Result<Config> {
    if path.exists() {
        let txt = fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let mut cfg: Config = toml::from_str(&txt)
            .with_context(|| format!("parse {}", path.display()))?;
        if cfg.log_level.is_empty() {
            cfg.log_level = "info".to_string();
        }
        Ok(cfg)
    } else {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create config dir {}", parent.display()))?;
        }
        let cfg = Config::new_default();
        save_config(path, &cfg)?;
        Ok(cfg)
    }
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
