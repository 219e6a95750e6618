use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::orchestration::{JobLimit, SchedulerConfig};
use crate::{klog_debug, Error, Result};

pub const DEFAULT_LOADAVG_LATENCY_SECS: u64 = 30;
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Concurrent build jobs; 0 or `None` means no ceiling.
    #[serde(default = "default_jobs")]
    pub jobs: Option<usize>,
    /// Refuse new jobs while the 1-minute load average is at or above this.
    pub load_average: Option<f64>,
    #[serde(default = "default_fetch_jobs")]
    pub fetch_jobs: usize,
    #[serde(default = "default_loadavg_latency")]
    pub loadavg_latency_secs: u64,
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_ms: u64,
    #[serde(default)]
    pub background: bool,
    pub log_dir: Option<String>,
    pub build_dir: Option<String>,
}

fn default_jobs() -> Option<usize> {
    Some(1)
}

fn default_fetch_jobs() -> usize {
    1
}

fn default_loadavg_latency() -> u64 {
    DEFAULT_LOADAVG_LATENCY_SECS
}

fn default_cancel_grace() -> u64 {
    DEFAULT_CANCEL_GRACE_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            load_average: None,
            fetch_jobs: default_fetch_jobs(),
            loadavg_latency_secs: default_loadavg_latency(),
            cancel_grace_ms: default_cancel_grace(),
            background: false,
            log_dir: None,
            build_dir: None,
        }
    }
}

impl Config {
    pub fn kiln_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".kiln"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::kiln_dir()?.join("kiln.toml"))
    }

    /// Directory for per-package build logs.
    pub fn log_dir(&self) -> Result<PathBuf> {
        match &self.log_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::kiln_dir()?.join("logs")),
        }
    }

    /// Parent of the per-package build directories.
    pub fn build_dir(&self) -> Result<PathBuf> {
        match &self.build_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::kiln_dir()?.join("build")),
        }
    }

    pub fn job_limit(&self) -> JobLimit {
        JobLimit::from(self.jobs.unwrap_or(0))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_jobs: self.job_limit(),
            max_load: self.load_average,
            loadavg_latency: Duration::from_secs(self.loadavg_latency_secs),
            background: self.background,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(load) = self.load_average {
            if !load.is_finite() || load <= 0.0 {
                return Err(Error::Validation(format!(
                    "load_average must be a positive number, got {}",
                    load
                )));
            }
        }
        if self.fetch_jobs == 0 {
            return Err(Error::Validation("fetch_jobs must be at least 1".to_string()));
        }
        if self.loadavg_latency_secs == 0 {
            return Err(Error::Validation(
                "loadavg_latency_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        klog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            klog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        klog_debug!(
            "Config loaded: jobs={:?}, load_average={:?}, fetch_jobs={}",
            config.jobs,
            config.load_average,
            config.fetch_jobs
        );
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let kiln_dir = Self::kiln_dir()?;
        if !kiln_dir.exists() {
            fs::create_dir_all(&kiln_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        klog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
