//! XDG-compliant path resolution for the intake gateway.
//!
//! Provides `IntakePaths`: where the deployment config, survey definitions,
//! and the durable abuse/submission store live by default.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Errors from path resolution.
#[derive(Debug, Error, Diagnostic)]
pub enum PathError {
    #[error("cannot determine home directory")]
    #[diagnostic(
        code(intake::paths::no_home),
        help("Set the HOME environment variable, or pass --data-dir explicitly.")
    )]
    NoHome,

    #[error("failed to create directory: {path}")]
    #[diagnostic(
        code(intake::paths::create_dir),
        help("Check that the parent directory exists and you have write permissions.")
    )]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type PathResult<T> = std::result::Result<T, PathError>;

const APP_DIR: &str = "intake-gateway";

/// Global XDG-compliant directories for the gateway.
#[derive(Debug, Clone)]
pub struct IntakePaths {
    /// `$XDG_CONFIG_HOME/intake-gateway/`
    pub config_dir: PathBuf,
    /// `$XDG_DATA_HOME/intake-gateway/`
    pub data_dir: PathBuf,
}

impl IntakePaths {
    /// Resolve XDG directories from environment variables with standard fallbacks.
    pub fn resolve() -> PathResult<Self> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .map_err(|_| PathError::NoHome)?;

        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".config"))
            .join(APP_DIR);

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".local/share"))
            .join(APP_DIR);

        Ok(Self {
            config_dir,
            data_dir,
        })
    }

    /// Paths rooted at an explicit data directory (config stays XDG-derived
    /// when resolvable, otherwise sits next to the data).
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        let config_dir = Self::resolve()
            .map(|p| p.config_dir)
            .unwrap_or_else(|_| data_dir.join("config"));
        Self {
            config_dir,
            data_dir,
        }
    }

    /// Create all base directories. Idempotent.
    pub fn ensure_dirs(&self) -> PathResult<()> {
        for dir in [&self.config_dir, &self.data_dir, &self.store_dir()] {
            std::fs::create_dir_all(dir).map_err(|e| PathError::CreateDir {
                path: dir.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Path to the deployment config file.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("intake.toml")
    }

    /// Default survey definition location.
    pub fn default_survey_file(&self) -> PathBuf {
        self.config_dir.join("survey.toml")
    }

    /// Directory holding the redb database.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_paths_use_app_dir() {
        // Avoid mutating env vars (unsafe in edition 2024); only check shape.
        let paths = IntakePaths::resolve().unwrap();
        assert!(paths.config_dir.ends_with(APP_DIR));
        assert!(paths.data_dir.ends_with(APP_DIR));
    }

    #[test]
    fn derived_files_live_under_their_dirs() {
        let paths = IntakePaths {
            config_dir: PathBuf::from("/cfg/intake-gateway"),
            data_dir: PathBuf::from("/data/intake-gateway"),
        };
        assert_eq!(
            paths.config_file(),
            PathBuf::from("/cfg/intake-gateway/intake.toml")
        );
        assert_eq!(
            paths.default_survey_file(),
            PathBuf::from("/cfg/intake-gateway/survey.toml")
        );
        assert_eq!(
            paths.store_dir(),
            PathBuf::from("/data/intake-gateway/store")
        );
    }

    #[test]
    fn ensure_dirs_creates_store_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = IntakePaths {
            config_dir: dir.path().join("cfg"),
            data_dir: dir.path().join("data"),
        };
        paths.ensure_dirs().unwrap();
        assert!(paths.store_dir().is_dir());
        assert!(paths.config_dir.is_dir());
        // Idempotent.
        paths.ensure_dirs().unwrap();
    }
}
