//! Kernel configuration: directory roots and their defaults.

use std::path::PathBuf;

/// Default directory scanned for built-in apps.
pub const DEFAULT_BUILTIN_PATH: &str = "./snapps";

/// Where the kernel looks for apps and keeps persisted state.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Directory of built-in apps, one subdirectory per app.
    pub builtin_path: PathBuf,
    /// Additional app directories to scan during discovery.
    pub extra_paths: Vec<PathBuf>,
    /// Root of the state store's namespace directories.
    pub state_base: PathBuf,
    /// Working directory bound to app façades.
    pub working_dir: PathBuf,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            builtin_path: PathBuf::from(DEFAULT_BUILTIN_PATH),
            extra_paths: Vec::new(),
            state_base: default_state_base(),
            working_dir: PathBuf::from("."),
        }
    }
}

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.builtin_path = path.into();
        self
    }

    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_paths.push(path.into());
        self
    }

    pub fn with_state_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_base = path.into();
        self
    }

    pub fn with_working_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_dir = path.into();
        self
    }
}

/// `$HOME/.openclaw/snapper-state`, falling back to the current directory
/// when no home directory can be resolved.
fn default_state_base() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".openclaw")
        .join("snapper-state")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_layout() {
        let config = KernelConfig::default();
        assert_eq!(config.builtin_path, PathBuf::from("./snapps"));
        assert!(config.state_base.ends_with(".openclaw/snapper-state"));
        assert!(config.extra_paths.is_empty());
    }

    #[test]
    fn builders_override_each_root() {
        let config = KernelConfig::new()
            .with_builtin_path("/opt/snapps")
            .with_search_path("/extra/one")
            .with_search_path("/extra/two")
            .with_state_base("/var/state")
            .with_working_dir("/work");
        assert_eq!(config.builtin_path, PathBuf::from("/opt/snapps"));
        assert_eq!(config.extra_paths.len(), 2);
        assert_eq!(config.state_base, PathBuf::from("/var/state"));
        assert_eq!(config.working_dir, PathBuf::from("/work"));
    }
}
