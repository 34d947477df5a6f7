//! Agent configuration: transport target, model endpoint, and the policy
//! knobs of the deterministic core.
//!
//! Defaults come from `OPSWARM_*` environment variables so the binary
//! runs without a config file; an optional TOML file overrides them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use oversight::{ConfigError, PolicyConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Where commands run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// `local` or `ssh`.
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Private key path for ssh; empty means the ssh agent decides.
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_seconds: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: env_or("OPSWARM_TRANSPORT", "local"),
            host: env_or("OPSWARM_SSH_HOST", "localhost"),
            port: env_or("OPSWARM_SSH_PORT", "22").parse().unwrap_or(22),
            user: env_or("OPSWARM_SSH_USER", "root"),
            identity_file: std::env::var("OPSWARM_SSH_IDENTITY").ok().map(PathBuf::from),
            connect_timeout_seconds: 10,
        }
    }
}

/// OpenAI-compatible model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub url: String,
    pub model: String,
    pub api_key: String,
    /// Model-side timeout per completion call.
    pub timeout_seconds: u64,
    /// HTTP retries with exponential backoff: 2s, 4s, 8s, ...
    pub max_retries: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            url: env_or("OPSWARM_MODEL_URL", "http://localhost:8080/v1"),
            model: env_or("OPSWARM_MODEL", "gpt-4o-mini"),
            api_key: env_or("OPSWARM_MODEL_API_KEY", "not-needed"),
            timeout_seconds: env_or("OPSWARM_MODEL_TIMEOUT", "60").parse().unwrap_or(60),
            max_retries: env_or("OPSWARM_MODEL_RETRIES", "3").parse().unwrap_or(3),
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Target OS family for templates and package-manager selection.
    pub os_type: String,
    /// Path of the persisted state document.
    pub state_path: PathBuf,
    pub transport: TransportConfig,
    pub model: ModelConfig,
    pub policy: PolicyConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl AgentConfig {
    /// Environment-variable defaults only.
    pub fn from_env() -> Self {
        Self {
            transport: TransportConfig::default(),
            model: ModelConfig::default(),
            policy: PolicyConfig::default(),
            os_type: env_or("OPSWARM_OS_TYPE", "ubuntu"),
            state_path: PathBuf::from(env_or(
                "OPSWARM_STATE_PATH",
                ".opswarm/agent-state.json",
            )),
        }
    }

    /// Env defaults overlaid with a TOML file, then validated.
    pub fn load(path: &Path) -> Result<Self, ConfigFileError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigFileError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy.validate()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AgentConfig::from_env();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn toml_overlay_overrides_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opswarm.toml");
        std::fs::write(
            &path,
            r#"
os_type = "centos"

[policy]
error_threshold_per_step = 3
human_escalation_threshold = 5

[transport]
kind = "ssh"
host = "db-01.internal"
user = "ops"
"#,
        )
        .unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.os_type, "centos");
        assert_eq!(config.policy.error_threshold_per_step, 3);
        assert_eq!(config.transport.host, "db-01.internal");
        // Unspecified fields keep their defaults.
        assert_eq!(config.policy.max_steps, 10);
    }

    #[test]
    fn invalid_policy_in_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opswarm.toml");
        std::fs::write(&path, "[policy]\ncommand_timeout_seconds = 0\n").unwrap();

        assert!(matches!(
            AgentConfig::load(&path),
            Err(ConfigFileError::Invalid(_))
        ));
    }

    #[test]
    fn missing_file_errors() {
        assert!(matches!(
            AgentConfig::load(Path::new("/nonexistent/opswarm.toml")),
            Err(ConfigFileError::Read { .. })
        ));
    }
}
