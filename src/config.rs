use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::core::{OrchestraError, Result};

/// Engine configuration with all tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    // Scheduler configuration
    /// Maximum number of tasks running at once in one session
    pub concurrency_limit: usize,

    // Retry configuration
    /// Retries allowed after the first attempt, unless a task overrides it
    pub max_retries: u32,
    pub retry: RetryConfig,

    // Timeouts
    /// Per-task timeout when the descriptor does not set one (None = unlimited)
    pub default_task_timeout_secs: Option<u64>,
    /// How long a timed out or cancelled task gets to return after its token trips
    pub cancel_grace_ms: u64,

    // Failure policy
    /// Keep running independent siblings after a failure and block dependents lazily
    pub continue_on_partial_failure: bool,
    /// Aggregate successful results that arrive after the session was cancelled
    pub aggregate_late_results: bool,

    pub conflicts: ConflictConfig,
    pub stream: StreamConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Adds up to 25% random spread to every delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Attempt an automatic merge as soon as a conflict is detected
    pub auto_resolve: bool,
    /// Glob patterns; a conflicted path matching one of them is Critical
    pub critical_paths: Vec<String>,
    /// Fraction of changed lines above which a conflict is High
    pub high_change_ratio: f64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            auto_resolve: false,
            critical_paths: default_critical_paths(),
            high_change_ratio: 0.5,
        }
    }
}

fn default_critical_paths() -> Vec<String> {
    [
        "package.json",
        "package-lock.json",
        "Cargo.toml",
        "go.mod",
        "pyproject.toml",
        "requirements.txt",
        "tsconfig.json",
        "*.csproj",
        "*.sln",
        "config.json",
        "config.*.json",
        "appsettings.json",
        "docker-compose.yml",
        "Dockerfile",
        ".env",
        "Program.cs",
        "src/main.*",
        "src/index.*",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Buffered events per subscriber before it is disconnected
    pub subscriber_capacity: usize,
    /// Events retained for replay to late subscribers
    pub history_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            history_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive, overridden by RUST_LOG
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 3,
            max_retries: 2,
            retry: RetryConfig::default(),
            default_task_timeout_secs: Some(600), // 10 minutes
            cancel_grace_ms: 2_000,
            continue_on_partial_failure: false,
            aggregate_late_results: true,
            conflicts: ConflictConfig::default(),
            stream: StreamConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl OrchestrationConfig {
    /// Create a new builder for OrchestrationConfig
    pub fn builder() -> OrchestrationConfigBuilder {
        OrchestrationConfigBuilder::new()
    }

    /// Create a configuration tuned for development and tests
    pub fn development() -> Self {
        Self {
            retry: RetryConfig {
                base_delay_ms: 10,
                max_delay_ms: 100,
                multiplier: 2.0,
                jitter: false,
            },
            default_task_timeout_secs: Some(30),
            cancel_grace_ms: 200,
            logging: LoggingConfig {
                level: "debug".to_string(),
                json: false,
            },
            ..Default::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(OrchestraError::configuration_field(
                "concurrency_limit must be greater than 0",
                "concurrency_limit",
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(OrchestraError::configuration_field(
                "retry.multiplier must be >= 1.0",
                "retry.multiplier",
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(OrchestraError::configuration_field(
                "retry.base_delay_ms cannot exceed retry.max_delay_ms",
                "retry.base_delay_ms",
            ));
        }
        if self.default_task_timeout_secs == Some(0) {
            return Err(OrchestraError::configuration_field(
                "default_task_timeout_secs must be greater than 0",
                "default_task_timeout_secs",
            ));
        }
        if !(0.0..=1.0).contains(&self.conflicts.high_change_ratio) {
            return Err(OrchestraError::configuration_field(
                "conflicts.high_change_ratio must be within 0.0..=1.0",
                "conflicts.high_change_ratio",
            ));
        }
        for pattern in &self.conflicts.critical_paths {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(OrchestraError::configuration_field(
                    format!("invalid critical path pattern '{}': {}", pattern, e),
                    "conflicts.critical_paths",
                ));
            }
        }
        if self.stream.subscriber_capacity == 0 {
            return Err(OrchestraError::configuration_field(
                "stream.subscriber_capacity must be greater than 0",
                "stream.subscriber_capacity",
            ));
        }
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| OrchestraError::ConfigLoad {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loading orchestration config");
        Self::from_yaml_str(&raw)
    }

    /// Apply ORCHESTRA_* environment overrides on top of this config
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("ORCHESTRA_CONCURRENCY_LIMIT") {
            self.concurrency_limit = raw.trim().parse().map_err(|_| {
                OrchestraError::configuration_field(
                    format!("ORCHESTRA_CONCURRENCY_LIMIT is not a number: {}", raw),
                    "concurrency_limit",
                )
            })?;
        }
        if let Some(raw) = lookup("ORCHESTRA_MAX_RETRIES") {
            self.max_retries = raw.trim().parse().map_err(|_| {
                OrchestraError::configuration_field(
                    format!("ORCHESTRA_MAX_RETRIES is not a number: {}", raw),
                    "max_retries",
                )
            })?;
        }
        if let Some(level) = lookup("ORCHESTRA_LOG_LEVEL") {
            self.logging.level = level;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Effective timeout for a task, preferring its own setting
    pub fn task_timeout(&self, task_timeout_secs: Option<u64>) -> Option<Duration> {
        task_timeout_secs
            .or(self.default_task_timeout_secs)
            .map(Duration::from_secs)
    }
}

/// Builder for OrchestrationConfig
pub struct OrchestrationConfigBuilder {
    config: OrchestrationConfig,
}

impl Default for OrchestrationConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestrationConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestrationConfig::default(),
        }
    }

    pub fn from_config(config: OrchestrationConfig) -> Self {
        Self { config }
    }

    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.config.concurrency_limit = limit;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set retry delays in milliseconds
    pub fn retry_delays(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.config.retry.base_delay_ms = base_ms;
        self.config.retry.max_delay_ms = max_ms;
        self
    }

    pub fn retry_jitter(mut self, enabled: bool) -> Self {
        self.config.retry.jitter = enabled;
        self
    }

    pub fn cancel_grace_ms(mut self, ms: u64) -> Self {
        self.config.cancel_grace_ms = ms;
        self
    }

    pub fn continue_on_partial_failure(mut self, enabled: bool) -> Self {
        self.config.continue_on_partial_failure = enabled;
        self
    }

    pub fn aggregate_late_results(mut self, enabled: bool) -> Self {
        self.config.aggregate_late_results = enabled;
        self
    }

    pub fn auto_resolve(mut self, enabled: bool) -> Self {
        self.config.conflicts.auto_resolve = enabled;
        self
    }

    pub fn critical_paths<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.conflicts.critical_paths = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn high_change_ratio(mut self, ratio: f64) -> Self {
        self.config.conflicts.high_change_ratio = ratio;
        self
    }

    pub fn logging(mut self, level: impl Into<String>, json: bool) -> Self {
        self.config.logging.level = level.into();
        self.config.logging.json = json;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<OrchestrationConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = OrchestrationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency_limit, 3);
        assert!(config.aggregate_late_results);
        assert!(!config.continue_on_partial_failure);
    }

    #[test]
    fn test_development_config() {
        let config = OrchestrationConfig::development();
        assert!(config.validate().is_ok());
        assert!(!config.retry.jitter);
        assert_eq!(config.cancel_grace_ms, 200);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = OrchestrationConfig::default();
        config.concurrency_limit = 0;
        assert!(matches!(
            config.validate(),
            Err(OrchestraError::Configuration { field: Some(ref f), .. }) if f == "concurrency_limit"
        ));
        config.concurrency_limit = 2;

        config.conflicts.critical_paths.push("[".into());
        assert!(config.validate().is_err());
        config.conflicts.critical_paths.pop();

        config.retry.base_delay_ms = config.retry.max_delay_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = OrchestrationConfig::builder()
            .concurrency_limit(5)
            .max_retries(4)
            .retry_delays(1, 10)
            .continue_on_partial_failure(true)
            .auto_resolve(true)
            .critical_paths(["schema.sql"])
            .build()
            .unwrap();

        assert_eq!(config.concurrency_limit, 5);
        assert_eq!(config.max_retries, 4);
        assert!(config.continue_on_partial_failure);
        assert!(config.conflicts.auto_resolve);
        assert_eq!(config.conflicts.critical_paths, vec!["schema.sql".to_string()]);
    }

    #[test]
    fn test_yaml_uses_defaults_for_missing_fields() {
        let yaml = r#"
concurrency_limit: 4
conflicts:
  auto_resolve: true
"#;
        let config = OrchestrationConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.concurrency_limit, 4);
        assert!(config.conflicts.auto_resolve);
        assert_eq!(config.conflicts.high_change_ratio, 0.5);
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ORCHESTRA_CONCURRENCY_LIMIT", "7"),
            ("ORCHESTRA_LOG_LEVEL", "trace"),
        ]
        .into_iter()
        .collect();
        let config = OrchestrationConfig::default()
            .with_overrides_from(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.concurrency_limit, 7);
        assert_eq!(config.logging.level, "trace");

        let bad = OrchestrationConfig::default()
            .with_overrides_from(|key| {
                (key == "ORCHESTRA_MAX_RETRIES").then(|| "lots".to_string())
            });
        assert!(bad.is_err());
    }

    #[test]
    fn test_task_timeout_prefers_task_setting() {
        let config = OrchestrationConfig::default();
        assert_eq!(config.task_timeout(Some(5)), Some(Duration::from_secs(5)));
        assert_eq!(config.task_timeout(None), Some(Duration::from_secs(600)));
    }
}
