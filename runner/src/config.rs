use crate::{notify::NotifyConfig, sync::BarrierMode};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

pub const SUPPORTED_EXECUTORS: [&str; 2] = ["local", "single"];

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to open config {path:?}: {source}")]
    Read { path: PathBuf, source: Error },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Config failed preflight checks")]
    Preflight,
    #[error("Executor not supported: {0}")]
    UnsupportedExecutor(String),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    // shared directory all workers coordinate through
    pub run_dir: PathBuf,
    // fixed number of worker partitions
    pub ncores: usize,
    pub masks: MaskConfig,
    pub scorer: ScorerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub barrier: BarrierMode,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    // remove per-worker scratch files after a successful reassembly
    #[serde(default = "default_cleanup")]
    pub cleanup: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct MaskConfig {
    pub brain: PathBuf,
    // defaults to the brain mask
    pub process: Option<PathBuf>,
    #[serde(default = "default_radius")]
    pub radius: f64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ScorerConfig {
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    // milliseconds per unit
    #[serde(default = "default_scorer_timeout")]
    pub timeout: u64,
}

/// Passed through to the scorer for every unit
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub labels: Vec<f64>,
    pub algorithm: String,
    pub cv: BTreeMap<String, serde_yaml::Value>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            labels: Vec::new(),
            algorithm: String::from("svr"),
            cv: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    // Name of the selected executor, see Executors::load for the selection proccess
    pub name: String,
    // worker threads of the local executor, defaults to min(cpus, ncores)
    pub threads: Option<usize>,
    // pin local worker threads to cores
    pub pin: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: String::from("local"),
            threads: None,
            pin: false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct RateConfig {
    // report to the rate estimator every `interval` units
    pub interval: usize,
    // core 0 clears the rate record every `refresh_interval` units
    pub refresh_interval: usize,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            interval: 7,
            refresh_interval: 21,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatConfig {
    // seconds without a heartbeat before `status` reports a worker as stale
    pub stale_after: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { stale_after: 600 }
    }
}

impl HeartbeatConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after)
    }
}

impl JobConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(|source| ConfigErrors::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(serde_yaml::from_reader(file)?)
    }

    /// report every problem at once, returns true if any was found
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.ncores == 0 {
            error!("ncores must be at least 1");
            contains_error = true;
        }

        if !self.masks.brain.is_file() {
            error!(
                "masks.brain not found at {}",
                self.masks.brain.to_string_lossy()
            );
            contains_error = true;
        }

        if let Some(ref process) = self.masks.process {
            if !process.is_file() {
                error!("masks.process not found at {}", process.to_string_lossy());
                contains_error = true;
            }
        }

        if !self.masks.radius.is_finite() || self.masks.radius < 0.0 {
            error!("masks.radius must be finite and non-negative");
            contains_error = true;
        }

        if !check_exec("scorer.exec", &self.scorer.exec) {
            contains_error = true;
        }

        if self.scorer.timeout == 0 {
            error!("scorer.timeout cannot be 0, every unit would time out");
            contains_error = true;
        }

        if self.model.labels.is_empty() {
            warn!("model.labels is empty, the scorer will not receive any labels");
        }

        self.executor.name = self.executor.name.to_lowercase();

        if !SUPPORTED_EXECUTORS.contains(&self.executor.name.as_str()) {
            error!(
                "executor.name ({}) is not supported, please use one of {SUPPORTED_EXECUTORS:?}",
                self.executor.name
            );
            contains_error = true;
        }

        if self.executor.threads == Some(0) {
            error!("executor.threads cannot be 0");
            contains_error = true;
        }

        if self.rate.interval == 0 || self.rate.refresh_interval == 0 {
            error!("rate.interval and rate.refresh_interval must be at least 1");
            contains_error = true;
        }

        if self.heartbeat.stale_after == 0 {
            warn!("heartbeat.stale_after is 0, every running worker will be reported as stale");
        }

        if let NotifyConfig::Exec { ref exec, .. } = self.notify {
            if !check_exec("notify.exec", exec) {
                contains_error = true;
            }
        }

        contains_error
    }
}

/// log why `path` can't be used as the executable `name`, true if it can
fn check_exec(name: &str, path: &Path) -> bool {
    if !path.is_file() {
        error!(
            "Failed to find {name}. Either not a file or not found at {}",
            path.to_string_lossy()
        );

        return false;
    }

    match check_executable(path) {
        Ok(true) => true,
        Ok(false) => {
            error!(
                "{name} target {} is not executable",
                path.to_string_lossy()
            );

            false
        }
        Err(e) => {
            error!(
                "Failed to determine if {name} ({}) is an executable: {e}",
                path.to_string_lossy()
            );

            false
        }
    }
}

fn default_cleanup() -> bool {
    true
}

fn default_radius() -> f64 {
    4.0
}

fn default_scorer_timeout() -> u64 {
    600_000
}
