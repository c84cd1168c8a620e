//! Optional user configuration file

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use kubetap_types::ColorMode;

use crate::sink::OutputFormat;

/// Defaults read from `config.toml`; command-line flags take precedence
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub namespace: Option<String>,
    pub color: Option<ColorMode>,
    pub timestamps: Option<bool>,
    pub output: Option<OutputFormat>,
    /// Seconds between pod listings while following new pods
    pub poll_interval: Option<u64>,
    /// Seconds streams get to close after a stop
    pub grace_period: Option<u64>,
}

impl FileConfig {
    /// Load `path`, or the default location if none is given
    ///
    /// A missing default file yields an empty config; a missing explicit
    /// file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !explicit && !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid config at {}", path.display()))?;
        if config.poll_interval == Some(0) {
            anyhow::bail!("Invalid config at {}: poll_interval must be at least 1", path.display());
        }
        if config.grace_period == Some(0) {
            anyhow::bail!("Invalid config at {}: grace_period must be at least 1", path.display());
        }

        tracing::debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// `$XDG_CONFIG_HOME/kubetap/config.toml` or the platform equivalent
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kubetap").join("config.toml"))
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval.map(Duration::from_secs)
    }

    pub fn grace_period(&self) -> Option<Duration> {
        self.grace_period.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
context = "staging"
namespace = "ops"
color = "never"
timestamps = true
output = "json"
poll_interval = 10
"#
        )
        .unwrap();

        let config = FileConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.context.as_deref(), Some("staging"));
        assert_eq!(config.namespace.as_deref(), Some("ops"));
        assert_eq!(config.color, Some(ColorMode::Never));
        assert_eq!(config.timestamps, Some(true));
        assert_eq!(config.output, Some(OutputFormat::Json));
        assert_eq!(config.poll_interval(), Some(Duration::from_secs(10)));
        assert_eq!(config.grace_period(), None);
    }

    #[test]
    fn test_empty_file_is_default() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = FileConfig::load(Some(file.path())).unwrap();
        assert_eq!(config, FileConfig::default());
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(FileConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "colour = \"always\"").unwrap();
        let err = FileConfig::load(Some(file.path())).unwrap_err();
        assert!(format!("{:#}", err).contains("colour"));
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        for key in ["poll_interval", "grace_period"] {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            writeln!(file, "{} = 0", key).unwrap();
            let err = FileConfig::load(Some(file.path())).unwrap_err();
            assert!(format!("{:#}", err).contains(key), "{}", key);
        }
    }
}
