//! Orchestrator configuration.
//!
//! Sources are layered, later ones winning:
//! 1. built-in defaults ([`OrchestratorConfig::default`])
//! 2. the YAML or TOML file
//! 3. the file's `environments.<name>` block for the selected environment
//! 4. `TEST_CONFIG_<SECTION>_<KEY>` environment variables
//!
//! Unknown keys, invalid enum values and out-of-range numbers are errors.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use ::config::{Config, File, FileFormat, Value, ValueKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::category::{CategoryPriority, CategorySystem, ReferenceKind, TestCategory};
use crate::fail_fast::{FailFastMode, ThresholdConfig};
use crate::orchestrator::ExecutionMode;
use crate::splitter::SplittingStrategy;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "TEST_CONFIG_";

/// Sections addressable from environment variables.
const SECTIONS: &[&str] = &["execution", "splitting", "fail_fast", "history"];

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0}")]
    Source(#[from] ::config::ConfigError),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("category '{category}' references unknown {kind} '{reference}'")]
    UnknownCategoryReference {
        category: String,
        reference: String,
        kind: ReferenceKind,
    },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Execution section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Upper bound on categories running at once.
    pub max_parallel: usize,
    pub mode: ExecutionMode,
    pub skip_dependencies: bool,
    /// Shell command run per category; `{category}` and `{tests}` are substituted.
    pub command_template: String,
    pub default_timeout_seconds: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            mode: ExecutionMode::default(),
            skip_dependencies: false,
            command_template: "pytest -m {category}".to_string(),
            default_timeout_seconds: 300,
        }
    }
}

/// Splitting section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SplittingConfig {
    pub strategy: SplittingStrategy,
    pub target_window_minutes: f64,
    pub max_windows: Option<usize>,
    pub rebalance: bool,
}

impl Default for SplittingConfig {
    fn default() -> Self {
        Self {
            strategy: SplittingStrategy::default(),
            target_window_minutes: 5.0,
            max_windows: None,
            rebalance: true,
        }
    }
}

impl SplittingConfig {
    pub fn target_window_seconds(&self) -> f64 {
        self.target_window_minutes * 60.0
    }
}

/// Fail-fast section. Threshold fields mirror [`ThresholdConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FailFastConfig {
    pub mode: FailFastMode,
    pub failure_rate_threshold: f64,
    pub critical_failure_count: u32,
    pub consecutive_failure_count: u32,
    pub time_window_seconds: u64,
    pub min_sample_size: u32,
    pub category_thresholds: BTreeMap<String, f64>,
}

impl Default for FailFastConfig {
    fn default() -> Self {
        let thresholds = ThresholdConfig::default();
        Self {
            mode: FailFastMode::default(),
            failure_rate_threshold: thresholds.failure_rate_threshold,
            critical_failure_count: thresholds.critical_failure_count,
            consecutive_failure_count: thresholds.consecutive_failure_count,
            time_window_seconds: thresholds.time_window_seconds,
            min_sample_size: thresholds.min_sample_size,
            category_thresholds: thresholds.category_thresholds,
        }
    }
}

impl FailFastConfig {
    pub fn thresholds(&self) -> ThresholdConfig {
        ThresholdConfig {
            failure_rate_threshold: self.failure_rate_threshold,
            critical_failure_count: self.critical_failure_count,
            consecutive_failure_count: self.consecutive_failure_count,
            time_window_seconds: self.time_window_seconds,
            min_sample_size: self.min_sample_size,
            category_thresholds: self.category_thresholds.clone(),
        }
    }
}

/// History section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
    pub test_history_path: PathBuf,
    pub failure_history_path: PathBuf,
    pub metrics_dir: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            test_history_path: PathBuf::from(".testorch/test_history.json"),
            failure_history_path: PathBuf::from(".testorch/failure_history.json"),
            metrics_dir: PathBuf::from(".testorch/runs"),
        }
    }
}

/// A category added by, or overridden in, the configuration file.
///
/// Absent fields keep the built-in value, or the [`TestCategory::new`]
/// default for new categories.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CategoryDefinition {
    pub description: Option<String>,
    pub priority: Option<CategoryPriority>,
    pub timeout_seconds: Option<u64>,
    pub dependencies: Option<BTreeSet<String>>,
    pub conflicts: Option<BTreeSet<String>>,
    pub parallel_safe: Option<bool>,
    pub memory_intensive: Option<bool>,
    pub cpu_intensive: Option<bool>,
    pub database_dependent: Option<bool>,
    pub network_dependent: Option<bool>,
    pub environment: Option<String>,
    pub estimated_duration: Option<f64>,
}

impl CategoryDefinition {
    fn apply(&self, mut category: TestCategory) -> TestCategory {
        if let Some(description) = &self.description {
            category.description = description.clone();
        }
        if let Some(priority) = self.priority {
            category.priority = priority;
        }
        if let Some(timeout) = self.timeout_seconds {
            category.timeout_seconds = timeout;
        }
        if let Some(dependencies) = &self.dependencies {
            category.dependencies = dependencies.clone();
        }
        if let Some(conflicts) = &self.conflicts {
            category.conflicts = conflicts.clone();
        }
        if let Some(value) = self.parallel_safe {
            category.parallel_safe = value;
        }
        if let Some(value) = self.memory_intensive {
            category.memory_intensive = value;
        }
        if let Some(value) = self.cpu_intensive {
            category.cpu_intensive = value;
        }
        if let Some(value) = self.database_dependent {
            category.database_dependent = value;
        }
        if let Some(value) = self.network_dependent {
            category.network_dependent = value;
        }
        if let Some(environment) = &self.environment {
            category.environment = Some(environment.clone());
        }
        if let Some(duration) = self.estimated_duration {
            category.estimated_duration = duration;
        }
        category
    }
}

/// Complete orchestrator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub execution: ExecutionConfig,
    pub splitting: SplittingConfig,
    pub fail_fast: FailFastConfig,
    pub history: HistoryConfig,
    pub categories: BTreeMap<String, CategoryDefinition>,
    /// Per-environment override blocks, already merged when loaded.
    #[serde(skip_serializing)]
    pub environments: BTreeMap<String, serde_json::Value>,
}

/// Supported configuration file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Format from a file extension.
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            _ => Err(ConfigError::InvalidValue {
                key: "config file".to_string(),
                message: format!("{} is neither .yaml, .yml nor .toml", path.display()),
            }),
        }
    }
}

impl From<ConfigFormat> for FileFormat {
    fn from(format: ConfigFormat) -> Self {
        match format {
            ConfigFormat::Yaml => FileFormat::Yaml,
            ConfigFormat::Toml => FileFormat::Toml,
        }
    }
}

impl OrchestratorConfig {
    /// Load from an optional file, an optional environment block and the
    /// process environment.
    pub fn load(path: Option<&Path>, environment: Option<&str>) -> ConfigResult<Self> {
        let source = match path {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Some((content, ConfigFormat::from_path(path)?))
            }
            None => None,
        };

        Self::from_sources(
            source.as_ref().map(|(content, format)| (content.as_str(), *format)),
            environment,
            std::env::vars(),
        )
    }

    /// Build from explicit sources. `vars` stands in for the process environment.
    pub fn from_sources<I>(
        file: Option<(&str, ConfigFormat)>,
        environment: Option<&str>,
        vars: I,
    ) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let defaults = Config::try_from(&OrchestratorConfig::default())?;
        let mut builder = Config::builder().add_source(defaults.clone());

        if let Some((content, format)) = file {
            builder = builder.add_source(File::from_str(content, FileFormat::from(format)));

            if let Some(environment) = environment {
                let parsed = Config::builder()
                    .add_source(File::from_str(content, FileFormat::from(format)))
                    .build()?;
                match parsed.get_table(&format!("environments.{environment}")) {
                    Ok(block) => {
                        let mut overrides = Vec::new();
                        flatten_table("", block, &mut overrides);
                        for (key, value) in overrides {
                            debug!(environment, key = %key, "applying environment override");
                            builder = builder.set_override(key, value)?;
                        }
                    }
                    Err(::config::ConfigError::NotFound(_)) => {
                        debug!(environment, "no environment block in configuration");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        let mut vars: Vec<(String, String)> = vars
            .into_iter()
            .filter(|(name, _)| name.starts_with(ENV_PREFIX))
            .collect();
        vars.sort();
        let default_tree = serde_json::to_value(OrchestratorConfig::default())
            .map_err(|err| ::config::ConfigError::Foreign(Box::new(err)))?;
        for (name, raw) in vars {
            let (key, value) = env_override(&default_tree, &name, &raw)?;
            debug!(var = %name, key = %key, "applying environment variable override");
            builder = builder.set_override(key, value)?;
        }

        let config: OrchestratorConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks that the type system does not cover.
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };

        if self.execution.max_parallel == 0 {
            return Err(invalid("execution.max_parallel", "must be at least 1"));
        }
        if self.execution.default_timeout_seconds == 0 {
            return Err(invalid("execution.default_timeout_seconds", "must be at least 1"));
        }
        if !(self.splitting.target_window_minutes > 0.0) {
            return Err(invalid("splitting.target_window_minutes", "must be positive"));
        }
        if self.splitting.max_windows == Some(0) {
            return Err(invalid("splitting.max_windows", "must be at least 1"));
        }
        self.fail_fast.thresholds().validate()
    }

    /// Default categories with configured additions and overrides applied.
    ///
    /// Dangling dependency or conflict references are an error.
    pub fn build_category_system(&self) -> ConfigResult<CategorySystem> {
        let mut system = CategorySystem::with_defaults();
        for (name, definition) in &self.categories {
            let base = system.get(name).cloned().unwrap_or_else(|| {
                TestCategory::new(name.clone(), definition.priority.unwrap_or_default())
                    .with_timeout(self.execution.default_timeout_seconds)
            });
            system.add_category(definition.apply(base));
        }

        if let Some(dangling) = system.validate_references().into_iter().next() {
            return Err(ConfigError::UnknownCategoryReference {
                category: dangling.category,
                reference: dangling.reference,
                kind: dangling.kind,
            });
        }
        Ok(system)
    }
}

fn flatten_table(
    prefix: &str,
    table: ::config::Map<String, Value>,
    out: &mut Vec<(String, Value)>,
) {
    for (key, value) in table {
        let path = if prefix.is_empty() {
            key
        } else {
            format!("{prefix}.{key}")
        };
        match value.kind {
            ValueKind::Table(inner) => flatten_table(&path, inner, out),
            kind => out.push((path, Value::from(kind))),
        }
    }
}

/// Resolve `TEST_CONFIG_<SECTION>_<KEY>` against the defaults and coerce the
/// raw string to the kind of the default value.
fn env_override(
    defaults: &serde_json::Value,
    name: &str,
    raw: &str,
) -> ConfigResult<(String, ValueKind)> {
    let rest = name[ENV_PREFIX.len()..].to_ascii_lowercase();
    let mut sections: Vec<&str> = SECTIONS.to_vec();
    sections.sort_by_key(|s| std::cmp::Reverse(s.len()));

    let (section, field) = sections
        .iter()
        .find_map(|section| {
            rest.strip_prefix(section)
                .and_then(|r| r.strip_prefix('_'))
                .filter(|r| !r.is_empty())
                .map(|field| (*section, field.to_string()))
        })
        .ok_or_else(|| ConfigError::UnknownKey(name.to_string()))?;

    let existing = defaults
        .get(section)
        .and_then(|s| s.get(&field))
        .ok_or_else(|| ConfigError::UnknownKey(name.to_string()))?;

    let invalid = |expected: &str| ConfigError::InvalidValue {
        key: name.to_string(),
        message: format!("expected {expected}, got '{raw}'"),
    };
    let value = match existing {
        serde_json::Value::Bool(_) => {
            ValueKind::Boolean(parse_bool(raw).ok_or_else(|| invalid("a boolean"))?)
        }
        serde_json::Value::Number(n) if n.is_f64() => {
            ValueKind::Float(raw.trim().parse().map_err(|_| invalid("a number"))?)
        }
        serde_json::Value::Number(_) => {
            ValueKind::I64(raw.trim().parse().map_err(|_| invalid("an integer"))?)
        }
        serde_json::Value::Array(_) => ValueKind::from(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<String>>(),
        ),
        serde_json::Value::String(_) => ValueKind::String(raw.to_string()),
        serde_json::Value::Null => infer_kind(raw),
        serde_json::Value::Object(_) => {
            return Err(invalid("a scalar; sections cannot be set from a variable"))
        }
    };
    Ok((format!("{section}.{field}"), value))
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Kind for a default that has no value of its own.
fn infer_kind(raw: &str) -> ValueKind {
    let trimmed = raw.trim();
    if let Ok(int) = trimmed.parse::<i64>() {
        ValueKind::I64(int)
    } else if let Ok(float) = trimmed.parse::<f64>() {
        ValueKind::Float(float)
    } else if let Some(flag) = parse_bool(trimmed) {
        ValueKind::Boolean(flag)
    } else {
        ValueKind::String(raw.to_string())
    }
}
