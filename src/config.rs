//! Worker configuration
//!
//! Loaded from the environment (after `.env`, if present) once at startup and
//! passed explicitly to every component.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("JUDGE_CPUS lists {cpus} cores but the pool has {slots} slots")]
    NotEnoughCpus { cpus: usize, slots: usize },

    #[error("JUDGE_CPUS assigns core {0} more than once")]
    DuplicateCpu(usize),

    #[error("pool size must be at least 1")]
    EmptyPool,

    #[error("SANDBOX_BUFFER_SIZE is {size} bytes, at least {min} are needed")]
    BufferTooSmall { size: usize, min: usize },
}

/// Smallest accepted sandbox response buffer, in bytes
pub const MIN_SANDBOX_BUFFER_SIZE: usize = 16;

/// Judge worker configuration
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub redis_url: String,
    /// Parent directory of per-submission workspaces
    pub code_dir: PathBuf,
    /// Root of stored files; test data lives under `data/<problem_id>`
    pub file_dir: PathBuf,
    /// Default build container image
    pub runner_image: String,
    /// Container CLI used for builds
    pub docker_bin: String,
    /// Unix socket of the sandbox daemon
    pub sandbox_socket: PathBuf,
    /// Capacity of the sandbox response buffer in bytes
    pub sandbox_buffer_size: usize,
    /// Upper bound on one sandbox round trip (None = wait indefinitely)
    pub sandbox_timeout: Option<Duration>,
    /// Upper bound on one build container run (None = wait indefinitely)
    pub compile_timeout: Option<Duration>,
    /// Number of concurrent worker slots
    pub pool_size: usize,
    /// Core reserved for each slot, indexed by slot
    pub cpus: Vec<usize>,
    /// Delete the workspace after each job
    pub auto_clean: bool,
    /// Blocking pop timeout; bounds how long shutdown waits on an idle slot
    pub queue_poll: Duration,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        let pool_size = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            redis_url: "redis://localhost:6379".into(),
            code_dir: "/var/lib/cloud-judge/code".into(),
            file_dir: "/var/lib/cloud-judge/files".into(),
            runner_image: "cloud-judge/runner:latest".into(),
            docker_bin: "docker".into(),
            sandbox_socket: "/var/run/judge.sock".into(),
            sandbox_buffer_size: 2048,
            sandbox_timeout: None,
            compile_timeout: None,
            pool_size,
            cpus: (0..pool_size).collect(),
            auto_clean: true,
            queue_poll: Duration::from_secs(5),
        }
    }
}

impl JudgeConfig {
    /// Build configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let pool_size = parse_or(&lookup, "JUDGE_POOL_SIZE", defaults.pool_size)?;
        if pool_size == 0 {
            return Err(ConfigError::EmptyPool);
        }

        let cpus = match lookup("JUDGE_CPUS") {
            Some(raw) => parse_cpu_list(&raw)?,
            None => (0..pool_size).collect(),
        };

        let config = Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            code_dir: lookup("CODE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.code_dir),
            file_dir: lookup("FILE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.file_dir),
            runner_image: lookup("RUNNER_IMAGE").unwrap_or(defaults.runner_image),
            docker_bin: lookup("DOCKER_BIN").unwrap_or(defaults.docker_bin),
            sandbox_socket: lookup("SANDBOX_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(defaults.sandbox_socket),
            sandbox_buffer_size: parse_or(
                &lookup,
                "SANDBOX_BUFFER_SIZE",
                defaults.sandbox_buffer_size,
            )?,
            sandbox_timeout: optional_duration(
                parse_or(&lookup, "SANDBOX_TIMEOUT_MS", 0u64)?,
                Duration::from_millis,
            ),
            compile_timeout: optional_duration(
                parse_or(&lookup, "COMPILE_TIMEOUT_SECS", 0u64)?,
                Duration::from_secs,
            ),
            pool_size,
            cpus,
            auto_clean: parse_bool(&lookup, "AUTO_CLEAN_WORKSPACE", defaults.auto_clean)?,
            queue_poll: Duration::from_secs(parse_or(&lookup, "QUEUE_POLL_SECS", 5u64)?),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the slot/core table (one distinct core per slot) and the
    /// sandbox buffer size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if self.sandbox_buffer_size < MIN_SANDBOX_BUFFER_SIZE {
            return Err(ConfigError::BufferTooSmall {
                size: self.sandbox_buffer_size,
                min: MIN_SANDBOX_BUFFER_SIZE,
            });
        }
        if self.cpus.len() < self.pool_size {
            return Err(ConfigError::NotEnoughCpus {
                cpus: self.cpus.len(),
                slots: self.pool_size,
            });
        }
        let mut seen = std::collections::HashSet::new();
        for &cpu in &self.cpus[..self.pool_size] {
            if !seen.insert(cpu) {
                return Err(ConfigError::DuplicateCpu(cpu));
            }
        }
        Ok(())
    }

    /// Workspace directory of one submission
    pub fn workspace(&self, submission_id: &str) -> PathBuf {
        self.code_dir.join(submission_id)
    }

    /// Test data directory of one problem
    pub fn test_data(&self, problem_id: i64) -> PathBuf {
        self.file_dir.join("data").join(problem_id.to_string())
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(key) {
        Some(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { key, value }),
        },
        None => Ok(default),
    }
}

fn parse_cpu_list(raw: &str) -> Result<Vec<usize>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError::InvalidValue {
                key: "JUDGE_CPUS",
                value: raw.to_string(),
            })
        })
        .collect()
}

fn optional_duration(value: u64, unit: fn(u64) -> Duration) -> Option<Duration> {
    (value > 0).then(|| unit(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = JudgeConfig::from_lookup(lookup_from(&[("JUDGE_POOL_SIZE", "2")])).unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.cpus, vec![0, 1]);
        assert_eq!(config.sandbox_buffer_size, 2048);
        assert!(config.sandbox_timeout.is_none());
        assert!(config.compile_timeout.is_none());
        assert!(config.auto_clean);
    }

    #[test]
    fn test_explicit_values() {
        let config = JudgeConfig::from_lookup(lookup_from(&[
            ("JUDGE_POOL_SIZE", "2"),
            ("JUDGE_CPUS", "4, 6"),
            ("SANDBOX_TIMEOUT_MS", "1500"),
            ("AUTO_CLEAN_WORKSPACE", "false"),
            ("CODE_DIR", "/tmp/code"),
            ("FILE_DIR", "/tmp/files"),
        ]))
        .unwrap();

        assert_eq!(config.cpus, vec![4, 6]);
        assert_eq!(config.sandbox_timeout, Some(Duration::from_millis(1500)));
        assert!(!config.auto_clean);
        assert_eq!(config.workspace("abc"), PathBuf::from("/tmp/code/abc"));
        assert_eq!(config.test_data(1001), PathBuf::from("/tmp/files/data/1001"));
    }

    #[test]
    fn test_cpu_table_must_cover_pool() {
        let err = JudgeConfig::from_lookup(lookup_from(&[
            ("JUDGE_POOL_SIZE", "3"),
            ("JUDGE_CPUS", "0,1"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::NotEnoughCpus { cpus: 2, slots: 3 }));
    }

    #[test]
    fn test_cpu_table_rejects_duplicates() {
        let err = JudgeConfig::from_lookup(lookup_from(&[
            ("JUDGE_POOL_SIZE", "2"),
            ("JUDGE_CPUS", "1,1"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateCpu(1)));
    }

    #[test]
    fn test_invalid_number() {
        let err = JudgeConfig::from_lookup(lookup_from(&[("SANDBOX_BUFFER_SIZE", "big")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "SANDBOX_BUFFER_SIZE",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_pool_rejected() {
        let err = JudgeConfig::from_lookup(lookup_from(&[("JUDGE_POOL_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyPool));
    }

    #[test]
    fn test_buffer_size_has_a_floor() {
        let err = JudgeConfig::from_lookup(lookup_from(&[("SANDBOX_BUFFER_SIZE", "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::BufferTooSmall {
                size: 0,
                min: MIN_SANDBOX_BUFFER_SIZE
            }
        ));

        let config = JudgeConfig::from_lookup(lookup_from(&[("SANDBOX_BUFFER_SIZE", "16")]))
            .unwrap();
        assert_eq!(config.sandbox_buffer_size, MIN_SANDBOX_BUFFER_SIZE);
    }
}
