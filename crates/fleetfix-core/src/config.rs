//! Configuration file loading.
//!
//! The config is a JSON object shared with the cloning step, so unknown keys are ignored:
//!
//! ```json
//! { "output_dir": "output", "include": "^org/", "exclude": "-archive$" }
//! ```

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;

use crate::domain::{FleetError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "fleetfix.json";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory holding the clones and their manifest. Relative paths are resolved against
    /// the directory containing the config file.
    pub output_dir: PathBuf,
    /// Only repositories whose name matches are selected.
    #[serde(default)]
    pub include: Option<String>,
    /// Repositories whose name matches are dropped.
    #[serde(default)]
    pub exclude: Option<String>,
}

impl Config {
    /// Load and validate the config at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        check_permissions(path)?;
        let text = std::fs::read_to_string(path).map_err(|source| FleetError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json(&text, base).map_err(|e| match e {
            FleetError::Serialization(source) => FleetError::ConfigParse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse a config, resolving `output_dir` against `base_dir`.
    pub fn from_json(text: &str, base_dir: &Path) -> Result<Self> {
        let mut config: Config = serde_json::from_str(text)?;
        if config.output_dir.is_relative() {
            config.output_dir = base_dir.join(&config.output_dir);
        }
        config.filter()?;
        Ok(config)
    }

    pub fn filter(&self) -> Result<RepoFilter> {
        RepoFilter::new(self.include.as_deref(), self.exclude.as_deref())
    }
}

/// Include/exclude name filter.
#[derive(Debug, Clone)]
pub struct RepoFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl RepoFilter {
    pub fn new(include: Option<&str>, exclude: Option<&str>) -> Result<Self> {
        let compile = |field: &'static str, pattern: Option<&str>| {
            pattern
                .map(Regex::new)
                .transpose()
                .map_err(|source| FleetError::InvalidPattern { field, source })
        };
        Ok(Self {
            include: compile("include", include)?,
            exclude: compile("exclude", exclude)?,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        let included = self.include.as_ref().map_or(true, |re| re.is_match(name));
        let excluded = self.exclude.as_ref().map_or(false, |re| re.is_match(name));
        included && !excluded
    }
}

/// The config sits next to credentials used for cloning; refuse it when others can read it.
#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::metadata(path).map_err(|source| FleetError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(FleetError::InsecureConfig {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str, mode: u32) -> PathBuf {
        let path = dir.join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        }
        #[cfg(not(unix))]
        let _ = mode;
        path
    }

    #[test]
    fn relative_output_dir_is_resolved_against_config_dir() {
        let config = Config::from_json(r#"{"output_dir": "clones"}"#, Path::new("/etc/fleet"))
            .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/etc/fleet/clones"));

        let config = Config::from_json(r#"{"output_dir": "/abs"}"#, Path::new("/etc/fleet"))
            .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/abs"));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config = Config::from_json(
            r#"{"output_dir": "o", "source": "github", "push_settings": {}}"#,
            Path::new("."),
        )
        .unwrap();
        assert!(config.include.is_none());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = Config::from_json(r#"{"output_dir": "o", "include": "("}"#, Path::new("."))
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidPattern { field: "include", .. }));
    }

    #[test]
    fn filter_applies_include_then_exclude() {
        let filter = RepoFilter::new(Some("^org/"), Some("-archive$")).unwrap();
        assert!(filter.matches("org/service"));
        assert!(!filter.matches("other/service"));
        assert!(!filter.matches("org/old-archive"));

        let everything = RepoFilter::new(None, None).unwrap();
        assert!(everything.matches("anything"));
    }

    #[test]
    fn load_reads_private_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), r#"{"output_dir": "out"}"#, 0o600);
        let config = Config::load(&path).unwrap();
        assert_eq!(config.output_dir, dir.path().join("out"));
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "{not json", 0o600);
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, FleetError::ConfigParse { .. }));
        assert!(err.to_string().contains(DEFAULT_CONFIG_FILE));
    }

    #[cfg(unix)]
    #[test]
    fn load_rejects_world_readable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), r#"{"output_dir": "out"}"#, 0o644);
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, FleetError::InsecureConfig { mode: 0o644, .. }));
    }

    #[test]
    fn missing_config_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, FleetError::ConfigRead { .. }));
    }
}
