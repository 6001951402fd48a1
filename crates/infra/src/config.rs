//! Pipeline configuration from `ANNOFLOW_*` environment variables.
//!
//! Unset service URLs select the in-process backends, so an empty environment
//! yields a working development setup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::storage::VaultConfig;
use crate::task::{DEFAULT_LOG_SUFFIX, DEFAULT_RESULT_SUFFIX, OutputNaming};
use crate::workers::{AnnotatorConfig, RunnerConfig};

pub const ENV_PREFIX: &str = "ANNOFLOW_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Postgres URL; `None` keeps metadata and profiles in memory.
    pub database_url: Option<String>,
    /// Redis URL; `None` keeps queues and the delay scheduler in memory.
    pub redis_url: Option<String>,
    pub hot_store_url: String,
    pub cold_store_url: String,
    pub inputs_bucket: String,
    pub results_bucket: String,
    pub key_prefix: String,
    pub work_dir: PathBuf,
    pub task_program: String,
    pub task_args: Vec<String>,
    pub result_suffix: String,
    pub log_suffix: String,
    pub archive_delay: Duration,
    pub visibility_timeout: Duration,
    pub wait_time: Duration,
    pub max_receives: u32,
    pub expedited_latency: Duration,
    pub standard_latency: Duration,
    pub expedited_capacity: Option<usize>,
    pub result_url_base: String,
    /// Create missing tables at startup instead of only verifying them.
    pub auto_migrate: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            hot_store_url: "memory:///".to_string(),
            cold_store_url: "memory:///".to_string(),
            inputs_bucket: "annoflow-inputs".to_string(),
            results_bucket: "annoflow-results".to_string(),
            key_prefix: "annoflow".to_string(),
            work_dir: std::env::temp_dir().join("annoflow"),
            task_program: "annotate".to_string(),
            task_args: Vec::new(),
            result_suffix: DEFAULT_RESULT_SUFFIX.to_string(),
            log_suffix: DEFAULT_LOG_SUFFIX.to_string(),
            archive_delay: Duration::from_secs(300),
            visibility_timeout: Duration::from_secs(300),
            wait_time: Duration::from_secs(20),
            max_receives: 5,
            expedited_latency: Duration::from_secs(300),
            standard_latency: Duration::from_secs(4 * 60 * 60),
            expedited_capacity: None,
            result_url_base: "http://localhost:5000/annotations/".to_string(),
            auto_migrate: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source (full names, prefix included).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Vars { lookup };
        let mut cfg = Self::default();

        cfg.database_url = env.string("DATABASE_URL");
        cfg.redis_url = env.string("REDIS_URL");
        env.set_string("HOT_STORE_URL", &mut cfg.hot_store_url);
        env.set_string("COLD_STORE_URL", &mut cfg.cold_store_url);
        env.set_string("INPUTS_BUCKET", &mut cfg.inputs_bucket);
        env.set_string("RESULTS_BUCKET", &mut cfg.results_bucket);
        if let Some(prefix) = env.raw("KEY_PREFIX") {
            cfg.key_prefix = prefix;
        }
        if let Some(dir) = env.string("WORK_DIR") {
            cfg.work_dir = PathBuf::from(dir);
        }
        env.set_string("TASK_PROGRAM", &mut cfg.task_program);
        if let Some(args) = env.raw("TASK_ARGS") {
            cfg.task_args = args.split_whitespace().map(str::to_string).collect();
        }
        env.set_string("RESULT_SUFFIX", &mut cfg.result_suffix);
        env.set_string("LOG_SUFFIX", &mut cfg.log_suffix);

        if let Some(d) = env.secs("ARCHIVE_DELAY_SECS")? {
            cfg.archive_delay = d;
        }
        if let Some(d) = env.secs("VISIBILITY_TIMEOUT_SECS")? {
            cfg.visibility_timeout = d;
        }
        if let Some(d) = env.secs("WAIT_TIME_SECS")? {
            cfg.wait_time = d;
        }
        if let Some(n) = env.parse::<u32>("MAX_RECEIVES")? {
            if n == 0 {
                return Err(env.invalid("MAX_RECEIVES", "must be at least 1"));
            }
            cfg.max_receives = n;
        }
        if let Some(d) = env.secs("EXPEDITED_LATENCY_SECS")? {
            cfg.expedited_latency = d;
        }
        if let Some(d) = env.secs("STANDARD_LATENCY_SECS")? {
            cfg.standard_latency = d;
        }
        if let Some(n) = env.parse::<usize>("EXPEDITED_CAPACITY")? {
            cfg.expedited_capacity = Some(n);
        }
        env.set_string("RESULT_URL_BASE", &mut cfg.result_url_base);
        if let Some(b) = env.flag("AUTO_MIGRATE")? {
            cfg.auto_migrate = b;
        }

        Ok(cfg)
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            wait: self.wait_time,
            max_receives: self.max_receives,
            ..RunnerConfig::default()
        }
    }

    pub fn vault_config(&self) -> VaultConfig {
        VaultConfig {
            expedited_latency: self.expedited_latency,
            standard_latency: self.standard_latency,
            expedited_capacity: self.expedited_capacity,
        }
    }

    pub fn annotator_config(&self) -> AnnotatorConfig {
        AnnotatorConfig {
            work_dir: self.work_dir.clone(),
            results_bucket: self.results_bucket.clone(),
            key_prefix: self.key_prefix.clone(),
            archive_delay: self.archive_delay,
            result_url_base: self.result_url_base.clone(),
        }
    }

    pub fn output_naming(&self) -> OutputNaming {
        OutputNaming {
            result_suffix: self.result_suffix.clone(),
            log_suffix: self.log_suffix.clone(),
        }
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}"))
    }

    /// Trimmed value; empty counts as unset.
    fn string(&self, name: &str) -> Option<String> {
        self.raw(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn set_string(&self, name: &str, slot: &mut String) {
        if let Some(v) = self.string(name) {
            *slot = v;
        }
    }

    fn invalid(&self, name: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            var: format!("{ENV_PREFIX}{name}"),
            value: self.raw(name).unwrap_or_default(),
            reason: reason.into(),
        }
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(name)
            .map(|v| v.parse::<T>().map_err(|e| self.invalid(name, e.to_string())))
            .transpose()
    }

    fn secs(&self, name: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_secs))
    }

    fn flag(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        match self.string(name).map(|v| v.to_ascii_lowercase()) {
            None => Ok(None),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(self.invalid(name, "expected a boolean")),
            },
        }
    }
}
