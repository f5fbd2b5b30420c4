//! Configuration management for Crosspost
//!
//! A single TOML file describes the runtime context, scheduler and retry
//! policy, the transform pool, generic option defaults and every
//! destination. Every section has defaults, so a file listing only
//! `[[destinations]]` is complete.
//!
//! ```toml
//! [context]
//! auth_id = "me"
//! base_dir = "~/crosspost-out"
//!
//! [retry]
//! max_retries = 5
//!
//! [[destinations]]
//! id = "gallery"
//! depends_on = ["archive"]
//!
//! [destinations.defaults]
//! rating = "general"
//! site = { kind = "gallery", folders = ["sketches"] }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::adapters::{FileRequirements, RuntimeContext};
use crate::error::{ConfigError, Result};
use crate::options::{DestinationOptions, GenericOptions};
use crate::scheduler::{RetryPolicy, SchedulerConfig};
use crate::transform::{TransformPoolConfig, WorkerBackend};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub context: RuntimeContext,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub transform: TransformSection,
    /// Generic option defaults applied beneath every destination's defaults
    #[serde(default)]
    pub defaults: GenericOptions,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
    #[serde(default = "default_max_active_submissions")]
    pub max_active_submissions: usize,
    #[serde(default = "default_adapter_timeout_secs")]
    pub adapter_timeout_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_outstanding: default_max_outstanding(),
            max_active_submissions: default_max_active_submissions(),
            adapter_timeout_secs: default_adapter_timeout_secs(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_outstanding() -> usize {
    8
}

fn default_max_active_submissions() -> usize {
    4
}

fn default_adapter_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_jitter() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformMode {
    #[default]
    InProcess,
    Subprocess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformSection {
    #[serde(default)]
    pub mode: TransformMode,
    /// Path of the `crosspost-transform` binary (subprocess mode)
    #[serde(default)]
    pub worker_program: Option<String>,
    /// Defaults to the number of CPUs
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// A worker silent for this long on one request is replaced
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for TransformSection {
    fn default() -> Self {
        Self {
            mode: TransformMode::default(),
            worker_program: None,
            max_workers: None,
            idle_timeout_secs: default_idle_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_request_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub id: String,
    /// Website name reported by the adapter; defaults to `id`
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub rate_limit_free: bool,
    #[serde(default)]
    pub posts_per_hour: Option<u32>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub defaults: DestinationOptions,
    /// Image normalization applied before posting
    #[serde(default)]
    pub requirements: Option<FileRequirements>,
}

impl DestinationConfig {
    pub fn website(&self) -> &str {
        self.website.as_deref().unwrap_or(&self.id)
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load, expand and validate configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.expand_paths()?;
        config.validate()?;
        Ok(config)
    }

    /// Tilde-expand paths and fill in the default output directory
    fn expand_paths(&mut self) -> Result<()> {
        let base_dir = self.context.base_dir.to_string_lossy().to_string();
        self.context.base_dir = if base_dir.is_empty() {
            resolve_data_path()?.join("posts")
        } else {
            PathBuf::from(shellexpand::tilde(&base_dir).to_string())
        };

        if let Some(program) = &self.transform.worker_program {
            self.transform.worker_program = Some(shellexpand::tilde(program).to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, reason: &str| ConfigError::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.scheduler.poll_interval_ms == 0 {
            return Err(invalid("scheduler.poll_interval_ms", "must be greater than 0").into());
        }
        if self.scheduler.max_outstanding == 0 {
            return Err(invalid("scheduler.max_outstanding", "must be greater than 0").into());
        }
        if self.scheduler.max_active_submissions == 0 {
            return Err(
                invalid("scheduler.max_active_submissions", "must be greater than 0").into(),
            );
        }
        if self.scheduler.adapter_timeout_secs == 0 {
            return Err(invalid("scheduler.adapter_timeout_secs", "must be greater than 0").into());
        }
        if self.transform.max_workers == Some(0) {
            return Err(invalid("transform.max_workers", "must be greater than 0").into());
        }
        if self.transform.request_timeout_secs == 0 {
            return Err(invalid("transform.request_timeout_secs", "must be greater than 0").into());
        }
        if self.transform.mode == TransformMode::Subprocess && self.transform.worker_program.is_none()
        {
            return Err(ConfigError::MissingField("transform.worker_program".to_string()).into());
        }

        let mut ids = HashSet::new();
        for destination in &self.destinations {
            if destination.id.trim().is_empty() {
                return Err(invalid("destinations.id", "must not be empty").into());
            }
            if !ids.insert(destination.id.as_str()) {
                return Err(invalid(
                    "destinations.id",
                    &format!("'{}' is listed more than once", destination.id),
                )
                .into());
            }
            if destination.posts_per_hour == Some(0) {
                return Err(invalid(
                    &format!("destinations.{}.posts_per_hour", destination.id),
                    "must be greater than 0",
                )
                .into());
            }
        }

        for destination in &self.destinations {
            for prerequisite in &destination.depends_on {
                if !ids.contains(prerequisite.as_str()) {
                    return Err(invalid(
                        &format!("destinations.{}.depends_on", destination.id),
                        &format!("unknown destination '{}'", prerequisite),
                    )
                    .into());
                }
            }
        }

        if let Some(id) = self.find_dependency_cycle() {
            return Err(invalid(
                &format!("destinations.{}.depends_on", id),
                "prerequisites form a cycle",
            )
            .into());
        }

        Ok(())
    }

    fn find_dependency_cycle(&self) -> Option<&str> {
        let edges: HashMap<&str, Vec<&str>> = self
            .destinations
            .iter()
            .map(|d| (d.id.as_str(), d.depends_on.iter().map(String::as_str).collect()))
            .collect();

        fn visit<'a>(
            node: &'a str,
            edges: &HashMap<&'a str, Vec<&'a str>>,
            visiting: &mut HashSet<&'a str>,
            done: &mut HashSet<&'a str>,
        ) -> bool {
            if done.contains(node) {
                return false;
            }
            if !visiting.insert(node) {
                return true;
            }
            let cyclic = edges
                .get(node)
                .is_some_and(|next| next.iter().any(|n| visit(n, edges, visiting, done)));
            visiting.remove(node);
            done.insert(node);
            cyclic
        }

        let mut done = HashSet::new();
        self.destinations
            .iter()
            .map(|d| d.id.as_str())
            .find(|id| visit(id, &edges, &mut HashSet::new(), &mut done))
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(self.scheduler.poll_interval_ms),
            max_outstanding: self.scheduler.max_outstanding,
            max_active_submissions: self.scheduler.max_active_submissions,
            adapter_timeout: Duration::from_secs(self.scheduler.adapter_timeout_secs),
            retry: RetryPolicy {
                max_retries: self.retry.max_retries,
                backoff_base: Duration::from_millis(self.retry.backoff_base_ms),
                max_backoff: Duration::from_secs(self.retry.max_backoff_secs),
                jitter: self.retry.jitter,
            },
        }
    }

    pub fn pool_config(&self) -> TransformPoolConfig {
        let backend = match (&self.transform.mode, &self.transform.worker_program) {
            (TransformMode::Subprocess, Some(program)) => WorkerBackend::Subprocess {
                program: PathBuf::from(program),
            },
            _ => WorkerBackend::InProcess,
        };
        TransformPoolConfig {
            backend,
            max_workers: self
                .transform
                .max_workers
                .unwrap_or_else(|| num_cpus::get().max(1)),
            idle_timeout: Duration::from_secs(self.transform.idle_timeout_secs),
            request_timeout: Duration::from_secs(self.transform.request_timeout_secs),
        }
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CROSSPOST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("crosspost").join("config.toml"))
}

/// Resolve the data directory path following XDG Base Directory spec
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("crosspost"))
}
