//! Runtime installations
//!
//! Guests run on a runtime installed under a folder named
//! `<version>-<framework>` (for example `16.0.1-native`), or
//! `dev-<framework>` for a local development build that always wins.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeFormatError {
    #[error("Runtime folder '{0}' is not <version>-<framework>")]
    MissingSeparator(String),

    #[error("Runtime folder '{0}' has no framework")]
    MissingFramework(String),

    #[error("Invalid runtime version '{0}'")]
    BadVersion(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Preferred runtime '{preferred}' is not in the allowed set {allowed:?}")]
    PreferredNotAllowed { preferred: String, allowed: Vec<String> },

    #[error("Failed to scan runtime directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Dotted numeric version. Missing trailing components compare as zero.
#[derive(Debug, Clone, Eq)]
pub struct RuntimeVersion(Vec<u32>);

impl RuntimeVersion {
    pub fn new(parts: impl Into<Vec<u32>>) -> Self {
        Self(parts.into())
    }

    pub fn parts(&self) -> &[u32] {
        &self.0
    }
}

impl FromStr for RuntimeVersion {
    type Err = RuntimeFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RuntimeFormatError::BadVersion(s.to_string()));
        }
        s.split('.')
            .map(|part| part.parse::<u32>().map_err(|_| RuntimeFormatError::BadVersion(s.to_string())))
            .collect::<Result<Vec<_>, _>>()
            .map(RuntimeVersion)
    }
}

impl Ord for RuntimeVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for RuntimeVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RuntimeVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

/// One installed runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    /// `None` for a development build.
    pub version: Option<RuntimeVersion>,
    pub framework: String,
    pub path: Option<PathBuf>,
}

impl RuntimeInfo {
    /// Parse a runtime folder name.
    pub fn parse(folder_name: &str) -> Result<Self, RuntimeFormatError> {
        let (version, framework) = folder_name
            .split_once('-')
            .ok_or_else(|| RuntimeFormatError::MissingSeparator(folder_name.to_string()))?;
        if framework.is_empty() {
            return Err(RuntimeFormatError::MissingFramework(folder_name.to_string()));
        }
        let version = if version.eq_ignore_ascii_case("dev") { None } else { Some(version.parse()?) };
        Ok(Self { version, framework: framework.to_ascii_lowercase(), path: None })
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn is_dev(&self) -> bool {
        self.version.is_none()
    }
}

impl fmt::Display for RuntimeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}-{}", version, self.framework),
            None => write!(f, "dev-{}", self.framework),
        }
    }
}

/// Family name that accepts whichever runtime the host prefers.
pub const PORTABLE: &str = "portable";

/// Installed runtimes a host is allowed to use.
#[derive(Debug, Clone)]
pub struct RuntimeCatalog {
    preferred: String,
    allowed: Vec<String>,
    runtimes: Vec<RuntimeInfo>,
}

impl RuntimeCatalog {
    /// An empty `allowed` list allows every family.
    pub fn new(preferred: &str, allowed: &[String]) -> Result<Self, CatalogError> {
        let preferred = preferred.to_ascii_lowercase();
        let allowed: Vec<String> = allowed.iter().map(|a| a.to_ascii_lowercase()).collect();
        if !allowed.is_empty() && !allowed.contains(&preferred) {
            return Err(CatalogError::PreferredNotAllowed { preferred, allowed });
        }
        Ok(Self { preferred, allowed, runtimes: Vec::new() })
    }

    fn is_allowed(&self, framework: &str) -> bool {
        self.allowed.is_empty() || self.allowed.iter().any(|a| a == framework)
    }

    /// Add a runtime unless its family is not allowed. Returns whether it was added.
    pub fn add(&mut self, runtime: RuntimeInfo) -> bool {
        if !self.is_allowed(&runtime.framework) {
            tracing::debug!("[RuntimeCatalog.add] Skipping disallowed runtime {}", runtime);
            return false;
        }
        self.runtimes.push(runtime);
        true
    }

    /// Scan `dir` for runtime folders. Unparseable names are skipped with a warning.
    pub async fn discover(&mut self, dir: &Path) -> Result<usize, CatalogError> {
        let io = |source| CatalogError::Io { path: dir.to_path_buf(), source };
        let mut entries = tokio::fs::read_dir(dir).await.map_err(io)?;
        let mut added = 0;
        while let Some(entry) = entries.next_entry().await.map_err(io)? {
            if !entry.file_type().await.map_err(io)?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match RuntimeInfo::parse(&name) {
                Ok(info) => {
                    if self.add(info.with_path(entry.path())) {
                        added += 1;
                    }
                }
                Err(e) => tracing::warn!("[RuntimeCatalog.discover] {}", e),
            }
        }
        tracing::debug!("[RuntimeCatalog.discover] Found {} runtimes under {}", added, dir.display());
        Ok(added)
    }

    pub fn runtimes(&self) -> &[RuntimeInfo] {
        &self.runtimes
    }

    pub fn has_dev_runtime(&self) -> bool {
        self.runtimes.iter().any(RuntimeInfo::is_dev)
    }

    /// Pick a runtime for a package.
    ///
    /// Development build first, then the lowest version at or above
    /// `min_version`, then the highest installed version.
    pub fn select(&self, family: &str, min_version: Option<&RuntimeVersion>) -> Option<RuntimeInfo> {
        let family = family.to_ascii_lowercase();
        let candidates: Vec<&RuntimeInfo> = if family == PORTABLE {
            let preferred: Vec<&RuntimeInfo> = self.runtimes.iter().filter(|r| r.framework == self.preferred).collect();
            if preferred.is_empty() {
                self.runtimes.iter().collect()
            } else {
                preferred
            }
        } else {
            self.runtimes.iter().filter(|r| r.framework == family).collect()
        };

        if let Some(dev) = candidates.iter().find(|r| r.is_dev()) {
            return Some((*dev).clone());
        }

        let meets_min = |r: &&&RuntimeInfo| match (&r.version, min_version) {
            (Some(v), Some(min)) => v >= min,
            _ => true,
        };
        if let Some(best) = candidates.iter().filter(meets_min).min_by(|a, b| a.version.cmp(&b.version)) {
            return Some((*best).clone());
        }

        let highest = candidates.iter().max_by(|a, b| a.version.cmp(&b.version))?;
        tracing::warn!(
            "[RuntimeCatalog.select] No {} runtime at or above {}; falling back to {}",
            family,
            min_version.map(ToString::to_string).unwrap_or_default(),
            highest
        );
        Some((*highest).clone())
    }
}
