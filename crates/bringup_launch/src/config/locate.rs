//! Executable and package lookups used by substitutions and node actions

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Environment variable listing install prefixes (colon separated)
pub const AMENT_PREFIX_PATH: &str = "AMENT_PREFIX_PATH";

/// Marker directory of the ament resource index, relative to a prefix
const PACKAGE_INDEX: &str = "share/ament_index/resource_index/packages";

/// Locate an executable by name.
///
/// Names containing a path separator are checked as-is; bare names are searched
/// in `search_path` (or `PATH` when `None`).
pub fn find_executable(name: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }

    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path_var: OsString = match search_path {
        Some(path) => path.to_os_string(),
        None => std::env::var_os("PATH")?,
    };

    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|full| is_executable(full))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Maps package names to their install locations
pub trait PackageLocator: Send + Sync {
    /// `<prefix>/share/<package>`
    fn share_dir(&self, package: &str) -> Option<PathBuf>;

    /// `<prefix>/lib/<package>`, where node executables live
    fn lib_dir(&self, package: &str) -> Option<PathBuf>;
}

/// Package lookup through the ament resource index.
///
/// Explicit share-directory overrides take precedence over the index.
#[derive(Debug, Clone, Default)]
pub struct AmentIndex {
    prefixes: Vec<PathBuf>,
    overrides: HashMap<String, PathBuf>,
}

impl AmentIndex {
    /// Build an index from `AMENT_PREFIX_PATH`
    pub fn from_env() -> Self {
        let prefixes = std::env::var_os(AMENT_PREFIX_PATH)
            .map(|value| std::env::split_paths(&value).collect())
            .unwrap_or_default();
        Self {
            prefixes,
            overrides: HashMap::new(),
        }
    }

    /// Build an index over explicit prefixes
    pub fn with_prefixes(prefixes: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            prefixes: prefixes.into_iter().collect(),
            overrides: HashMap::new(),
        }
    }

    /// Pin a package's share directory
    pub fn with_override(mut self, package: impl Into<String>, share: impl Into<PathBuf>) -> Self {
        self.overrides.insert(package.into(), share.into());
        self
    }

    /// Pin several share directories
    pub fn with_overrides(mut self, overrides: HashMap<String, PathBuf>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    pub fn prefixes(&self) -> &[PathBuf] {
        &self.prefixes
    }

    fn prefix_of(&self, package: &str) -> Option<&Path> {
        self.prefixes
            .iter()
            .find(|prefix| prefix.join(PACKAGE_INDEX).join(package).is_file())
            .map(PathBuf::as_path)
    }
}

impl PackageLocator for AmentIndex {
    fn share_dir(&self, package: &str) -> Option<PathBuf> {
        if let Some(share) = self.overrides.get(package) {
            return Some(share.clone());
        }
        self.prefix_of(package)
            .map(|prefix| prefix.join("share").join(package))
    }

    fn lib_dir(&self, package: &str) -> Option<PathBuf> {
        if let Some(share) = self.overrides.get(package) {
            // <prefix>/share/<package> -> <prefix>/lib/<package>
            let prefix = share.parent()?.parent()?;
            return Some(prefix.join("lib").join(package));
        }
        self.prefix_of(package)
            .map(|prefix| prefix.join("lib").join(package))
    }
}
