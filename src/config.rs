use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat, Map};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::providers::SimulationProfile;
use crate::retry::{PollPolicy, RetryPolicy};

/// Configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "approval-harness.toml";
/// Prefix for environment overrides, e.g. `APPROVAL_HARNESS__GENERAL__REGION`
pub const ENV_PREFIX: &str = "APPROVAL_HARNESS";
const ENV_SEPARATOR: &str = "__";
/// Shared suffix of the document and stack names
pub const RESOURCE_BASE_NAME: &str = "automation-delete-cf-stack-with-approval";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("failed to read .env file: {0}")]
    DotEnv(#[from] dotenvy::Error),
    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Immutable configuration for one harness run
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub general: GeneralConfig,
    pub linux: LinuxConfig,
    pub paths: PathsConfig,
    pub timeouts: TimeoutConfig,
    pub polling: PollingConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub region: String,
    /// Prepended to every resource name so parallel runs do not collide
    pub resource_prefix: String,
    pub automation_service_role_name: String,
    pub log_level: String,
    /// Account the simulated provider reports
    pub account_id: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            resource_prefix: "harness-".to_string(),
            automation_service_role_name: "AutomationServiceRole".to_string(),
            log_level: "info".to_string(),
            account_id: "123456789012".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LinuxConfig {
    pub ami: String,
    pub instance_type: String,
}

impl Default for LinuxConfig {
    fn default() -> Self {
        Self {
            ami: "ami-0c02fb55956c7d316".to_string(),
            instance_type: "t3.micro".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    pub document: PathBuf,
    pub template: PathBuf,
    /// Roots scanned by `lint` when no paths are given
    pub lint_roots: Vec<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            document: PathBuf::from(
                "documents/DeleteCloudFormationWithApproval/aws-DeleteCloudFormationWithApproval.json",
            ),
            template: PathBuf::from("documents/DeleteCloudFormationWithApproval/TwoInstances.yml"),
            lint_roots: vec![PathBuf::from("documents")],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub stack_create_secs: u64,
    pub document_create_secs: u64,
    pub execution_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            stack_create_secs: 900,
            document_create_secs: 120,
            execution_secs: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 2_000,
            max_interval_ms: 30_000,
            multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl HarnessConfig {
    /// Load configuration with precedence:
    /// 1. Default values
    /// 2. Configuration file (`approval-harness.toml`, or `path` when given)
    /// 3. Environment variables (prefixed with `APPROVAL_HARNESS__`)
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_env_file()?;
        Self::load_with_env(path, None)
    }

    /// Same as [`HarnessConfig::load`] but reads overrides from `env` instead
    /// of the process environment.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&HarnessConfig::default())?);

        match path {
            // an explicit path must exist
            Some(path) => {
                builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                builder = builder.add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .list_separator(",")
                .with_list_parse_key("paths.lint_roots")
                .try_parsing(true)
                .source(env),
        );

        let config: HarnessConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<(), ConfigError> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::debug!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("timeouts.stack_create_secs", self.timeouts.stack_create_secs),
            ("timeouts.document_create_secs", self.timeouts.document_create_secs),
            ("timeouts.execution_secs", self.timeouts.execution_secs),
            ("polling.initial_interval_ms", self.polling.initial_interval_ms),
            ("retry.max_attempts", u64::from(self.retry.max_attempts)),
        ];
        if let Some((key, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
        }
        if self.polling.max_interval_ms < self.polling.initial_interval_ms {
            return Err(ConfigError::Invalid(
                "polling.max_interval_ms must not be below polling.initial_interval_ms".to_string(),
            ));
        }
        if !self.polling.multiplier.is_finite() || self.polling.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "polling.multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.general.automation_service_role_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "general.automation_service_role_name must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Name shared by the automation document and the stack
    pub fn resource_name(&self) -> String {
        format!("{}{}", self.general.resource_prefix, RESOURCE_BASE_NAME)
    }

    pub fn stack_create_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.stack_create_secs)
    }

    pub fn document_create_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.document_create_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.execution_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            initial_interval: Duration::from_millis(self.polling.initial_interval_ms),
            max_interval: Duration::from_millis(self.polling.max_interval_ms),
            multiplier: self.polling.multiplier,
        }
    }

    /// Simulated world matching this configuration
    pub fn simulation_profile(&self) -> SimulationProfile {
        SimulationProfile {
            account_id: self.general.account_id.clone(),
            region: self.general.region.clone(),
            roles: vec![self.general.automation_service_role_name.clone()],
            ..SimulationProfile::default()
        }
    }
}
