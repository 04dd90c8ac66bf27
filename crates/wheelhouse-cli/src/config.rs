//! The `[mirror]` TOML configuration table (spec.md §6), validated eagerly
//! so a missing required field aborts before any network I/O (spec.md §7).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0:?}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config file {0:?}")]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("config is missing required field `{0}`, or it is empty")]
    MissingField(&'static str),
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    mirror: MirrorConfig,
}

#[derive(Debug, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub wishlist_file: Option<PathBuf>,
    #[serde(default)]
    pub python_versions: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_index_url")]
    pub index_url: String,
    #[serde(default = "default_pypi_url")]
    pub pypi_url: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("mirror")
}

fn default_index_url() -> String {
    "https://pypi.org/simple".to_string()
}

fn default_pypi_url() -> String {
    "https://pypi.org/pypi".to_string()
}

fn default_concurrency() -> usize {
    10
}

impl MirrorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs_err::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;
        let file: ConfigFile = toml::from_str(&raw).map_err(|err| ConfigError::Parse(path.to_path_buf(), err))?;
        file.mirror.validate()?;
        Ok(file.mirror)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.packages.is_empty() && self.wishlist_file.is_none() {
            return Err(ConfigError::MissingField("packages"));
        }
        if self.python_versions.is_empty() {
            return Err(ConfigError::MissingField("python_versions"));
        }
        if self.platforms.is_empty() {
            return Err(ConfigError::MissingField("platforms"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wheelhouse.toml");
        fs_err::write(
            &path,
            r#"
            [mirror]
            packages = ["click"]
            python_versions = ["3.12"]
            platforms = ["linux_x86_64"]
            "#,
        )
        .unwrap();
        let config = MirrorConfig::load(&path).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("mirror"));
        assert_eq!(config.pypi_url, "https://pypi.org/pypi");
    }

    #[test]
    fn rejects_missing_packages_before_any_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wheelhouse.toml");
        fs_err::write(
            &path,
            r#"
            [mirror]
            python_versions = ["3.12"]
            platforms = ["linux_x86_64"]
            "#,
        )
        .unwrap();
        let err = MirrorConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("packages")));
    }
}
