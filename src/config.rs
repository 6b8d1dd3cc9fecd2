//! Deployment configuration for the gateway server and CLI.
//!
//! Read from `intake.toml` in the XDG config directory, then overridden by
//! `INTAKE_*` environment variables. Survey behaviour (allow-list, limits,
//! questions) lives in the survey definition, not here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::paths::IntakePaths;
use crate::store::{self, GatewayStore, StoreResult};

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file: {path}")]
    #[diagnostic(
        code(intake::config::read),
        help("Check that the file exists and is readable, or remove it to use defaults.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    #[diagnostic(
        code(intake::config::parse),
        help(
            "See the `GatewayConfig` fields: bind, port, data_dir, survey_path, store, \
             trust_forwarded_for, admin_token, purge_interval_minutes."
        )
    )]
    Parse { path: String, message: String },

    #[error("invalid value for {var}: \"{value}\"")]
    #[diagnostic(code(intake::config::env))]
    InvalidEnv { var: String, value: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Which store backend to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// redb file under the data directory. One process at a time holds it.
    #[default]
    Durable,
    /// Per-process only. For development and tests.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Overrides the XDG data directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Overrides `<config_dir>/survey.toml`.
    #[serde(default)]
    pub survey_path: Option<PathBuf>,
    #[serde(default)]
    pub store: StoreBackend,
    /// Take the client identifier from `X-Forwarded-For`. Enable only behind
    /// a proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
    /// Bearer token for the server's `/admin` routes. The routes are off
    /// while this is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
    /// How often the server purges expired attempts and blocks. Zero turns
    /// the task off.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_minutes: u64,
}

fn default_bind() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8300
}

fn default_purge_interval() -> u64 {
    60
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            data_dir: None,
            survey_path: None,
            store: StoreBackend::default(),
            trust_forwarded_for: false,
            admin_token: None,
            purge_interval_minutes: default_purge_interval(),
        }
    }
}

impl GatewayConfig {
    pub fn from_toml_str(source: &str, path: &Path) -> ConfigResult<Self> {
        toml::from_str(source).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&source, path)
    }

    /// Load the file if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Apply `INTAKE_*` environment overrides.
    pub fn with_env(self) -> ConfigResult<Self> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from any variable lookup.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        if let Some(bind) = lookup("INTAKE_BIND") {
            self.bind = bind;
        }
        if let Some(port) = lookup("INTAKE_PORT") {
            self.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "INTAKE_PORT".into(),
                value: port.clone(),
            })?;
        }
        if let Some(dir) = lookup("INTAKE_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(survey) = lookup("INTAKE_SURVEY") {
            self.survey_path = Some(PathBuf::from(survey));
        }
        if let Some(token) = lookup("INTAKE_ADMIN_TOKEN") {
            self.admin_token = Some(token);
        }
        if let Some(minutes) = lookup("INTAKE_PURGE_INTERVAL") {
            self.purge_interval_minutes = minutes.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "INTAKE_PURGE_INTERVAL".into(),
                value: minutes.clone(),
            })?;
        }
        if let Some(backend) = lookup("INTAKE_STORE") {
            self.store = match backend.as_str() {
                "durable" => StoreBackend::Durable,
                "memory" => StoreBackend::Memory,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "INTAKE_STORE".into(),
                        value: backend,
                    });
                }
            };
        }
        Ok(self)
    }

    /// Whether `presented` is the configured admin token. Always false when
    /// no non-blank token is configured.
    pub fn admin_token_matches(&self, presented: &str) -> bool {
        match self.admin_token.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            Some(expected) => bool::from(presented.as_bytes().ct_eq(expected.as_bytes())),
            None => false,
        }
    }

    pub fn admin_enabled(&self) -> bool {
        self.admin_token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    /// `bind:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Paths with the configured data directory applied.
    pub fn paths(&self, resolved: IntakePaths) -> IntakePaths {
        match &self.data_dir {
            Some(dir) => IntakePaths {
                data_dir: dir.clone(),
                ..resolved
            },
            None => resolved,
        }
    }

    pub fn survey_file(&self, paths: &IntakePaths) -> PathBuf {
        self.survey_path
            .clone()
            .unwrap_or_else(|| paths.default_survey_file())
    }

    /// Open the configured store backend.
    pub fn open_store(&self, paths: &IntakePaths) -> StoreResult<Arc<dyn GatewayStore>> {
        match self.store {
            StoreBackend::Durable => store::with_persistence(&paths.store_dir()),
            StoreBackend::Memory => Ok(store::memory_only()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.addr(), "0.0.0.0:8300");
        assert_eq!(cfg.store, StoreBackend::Durable);
        assert!(!cfg.trust_forwarded_for);
        assert!(!cfg.admin_enabled());
        assert_eq!(cfg.purge_interval_minutes, 60);
    }

    #[test]
    fn admin_token_must_match_exactly() {
        assert!(!GatewayConfig::default().admin_token_matches(""));

        let blank = GatewayConfig {
            admin_token: Some("  ".into()),
            ..GatewayConfig::default()
        };
        assert!(!blank.admin_enabled());
        assert!(!blank.admin_token_matches("  "));

        let vars = HashMap::from([("INTAKE_ADMIN_TOKEN", "s3cret"), ("INTAKE_PURGE_INTERVAL", "15")]);
        let cfg = GatewayConfig::default()
            .with_overrides(|v| vars.get(v).map(|s| s.to_string()))
            .unwrap();
        assert!(cfg.admin_enabled());
        assert_eq!(cfg.purge_interval_minutes, 15);
        assert!(cfg.admin_token_matches("s3cret"));
        assert!(!cfg.admin_token_matches("s3cre"));
        assert!(!cfg.admin_token_matches("s3cret "));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = GatewayConfig::from_toml_str(
            "port = 9000\nstore = \"memory\"\n",
            Path::new("intake.toml"),
        )
        .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.store, StoreBackend::Memory);
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let err = GatewayConfig::from_toml_str("port = \"x\"", Path::new("intake.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn overrides_apply() {
        let vars = HashMap::from([
            ("INTAKE_PORT", "8080"),
            ("INTAKE_DATA_DIR", "/srv/intake"),
            ("INTAKE_STORE", "memory"),
        ]);
        let cfg = GatewayConfig::default()
            .with_overrides(|v| vars.get(v).map(|s| s.to_string()))
            .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.data_dir, Some(PathBuf::from("/srv/intake")));
        assert_eq!(cfg.store, StoreBackend::Memory);
    }

    #[test]
    fn invalid_port_override_is_rejected() {
        let err = GatewayConfig::default()
            .with_overrides(|v| (v == "INTAKE_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var, .. } if var == "INTAKE_PORT"));
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = GatewayConfig::load_or_default(&dir.path().join("intake.toml")).unwrap();
        assert_eq!(cfg, GatewayConfig::default());
    }

    #[test]
    fn data_dir_overrides_paths() {
        let cfg = GatewayConfig {
            data_dir: Some(PathBuf::from("/srv/intake")),
            ..GatewayConfig::default()
        };
        let paths = cfg.paths(IntakePaths {
            config_dir: PathBuf::from("/cfg"),
            data_dir: PathBuf::from("/data"),
        });
        assert_eq!(paths.store_dir(), PathBuf::from("/srv/intake/store"));
        assert_eq!(cfg.survey_file(&paths), PathBuf::from("/cfg/survey.toml"));
    }
}
