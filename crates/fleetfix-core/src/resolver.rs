//! Turns configuration into the list of working copies to operate on.
//!
//! The cloning step leaves a manifest in the output directory, a JSON object mapping
//! repository names to clone URLs. `repos_filtered.json` is preferred over `repos.json`.
//! Each repository's working copy lives at `<output_dir>/<name>`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::Config;
use crate::domain::{FleetError, RepoHandle, Result};

pub const FILTERED_MANIFEST: &str = "repos_filtered.json";
pub const MANIFEST: &str = "repos.json";

/// Where the repo set comes from.
#[derive(Debug, Clone)]
pub enum RepoSource {
    Config(Config),
    /// Explicit working copies, bypassing the config.
    Paths(Vec<PathBuf>),
}

impl RepoSource {
    /// Resolve the repo set, keeping at most `limit` entries.
    ///
    /// An empty result is [`FleetError::NoRepositories`].
    pub fn resolve(&self, limit: Option<usize>) -> Result<Vec<RepoHandle>> {
        let mut repos = match self {
            RepoSource::Config(config) => find_repos(config)?,
            RepoSource::Paths(paths) => paths.iter().map(RepoHandle::from_path).collect(),
        };
        if let Some(limit) = limit {
            repos.truncate(limit);
        }
        if repos.is_empty() {
            return Err(FleetError::NoRepositories);
        }
        Ok(repos)
    }
}

/// Read the clone manifest under `config.output_dir` and apply the include/exclude filter.
///
/// Handles are sorted by repository name.
pub fn find_repos(config: &Config) -> Result<Vec<RepoHandle>> {
    let filter = config.filter()?;
    let manifest = read_manifest(&config.output_dir)?;
    let total = manifest.len();

    let repos: Vec<RepoHandle> = manifest
        .into_keys()
        .filter(|name| filter.matches(name))
        .map(|name| {
            let path = config.output_dir.join(&name);
            RepoHandle::new(name, path)
        })
        .collect();

    debug!(
        output_dir = %config.output_dir.display(),
        cloned = total,
        selected = repos.len(),
        "resolved repositories"
    );
    Ok(repos)
}

fn read_manifest(output_dir: &Path) -> Result<BTreeMap<String, String>> {
    let filtered = output_dir.join(FILTERED_MANIFEST);
    let path = if filtered.is_file() {
        filtered
    } else {
        output_dir.join(MANIFEST)
    };

    let text = std::fs::read_to_string(&path).map_err(|source| FleetError::ManifestRead {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| FleetError::ManifestParse { path, source })
}
