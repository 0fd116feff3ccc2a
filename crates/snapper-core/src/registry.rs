//! SnApp registry: manifest discovery, validation, and the catalog.
//!
//! Discovery scans the built-in directory plus any additional search paths
//! for first-level child directories containing a `snap.json`. Broken
//! manifests are collected per-directory and skipped rather than aborting
//! the scan; one bad app must not keep the host from starting.
//!
//! The catalog is the insertion-ordered map of accepted apps keyed by id.
//! Registration is the only validation gate; every downstream component
//! trusts what the registry accepted.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::KernelError;
use crate::error::KernelResult;
use crate::lifecycle::RegisteredApp;
use crate::manifest::SnappManifest;

/// File name of the app descriptor inside each app directory.
pub const MANIFEST_FILE: &str = "snap.json";

/// A per-directory discovery failure. Never raised, only accumulated.
#[derive(Debug)]
pub struct DiscoveryError {
    /// The app directory whose manifest could not be used.
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of a discovery scan.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub manifests: Vec<SnappManifest>,
    pub errors: Vec<DiscoveryError>,
}

#[derive(Default)]
struct Catalog {
    apps: HashMap<String, Arc<RegisteredApp>>,
    /// Registration order, for `get_all` iteration.
    order: Vec<String>,
}

/// Discovers, validates, and catalogs SnApp manifests.
pub struct SnappRegistry {
    builtin_path: PathBuf,
    extra_paths: Vec<PathBuf>,
    catalog: RwLock<Catalog>,
}

impl SnappRegistry {
    /// Create a registry scanning `builtin_path` for built-in apps.
    pub fn new(builtin_path: impl Into<PathBuf>) -> Self {
        Self {
            builtin_path: builtin_path.into(),
            extra_paths: Vec::new(),
            catalog: RwLock::new(Catalog::default()),
        }
    }

    /// Add an additional directory to scan during discovery.
    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_paths.push(path.into());
        self
    }

    /// Scan all configured directories for app manifests.
    ///
    /// Directories that do not exist and child directories without a
    /// `snap.json` are silently skipped. A directory whose `snap.json`
    /// exists but cannot be read or parsed lands in the report's `errors`.
    pub async fn discover(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let roots: Vec<&Path> = std::iter::once(self.builtin_path.as_path())
            .chain(self.extra_paths.iter().map(PathBuf::as_path))
            .collect();

        for root in roots {
            let mut entries = match tokio::fs::read_dir(root).await {
                Ok(entries) => entries,
                Err(_) => {
                    debug!(path = %root.display(), "search path missing, skipping");
                    continue;
                }
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let dir = entry.path();
                if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let manifest_path = dir.join(MANIFEST_FILE);
                let raw = match tokio::fs::read_to_string(&manifest_path).await {
                    Ok(raw) => raw,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "unreadable snap.json, skipping");
                        report.errors.push(DiscoveryError {
                            path: dir,
                            reason: format!("failed to read {MANIFEST_FILE}: {e}"),
                        });
                        continue;
                    }
                };
                match serde_json::from_str::<SnappManifest>(&raw) {
                    Ok(manifest) => {
                        debug!(snapp = %manifest.id, path = %dir.display(), "manifest discovered");
                        report.manifests.push(manifest);
                    }
                    Err(e) => {
                        warn!(path = %dir.display(), error = %e, "invalid snap.json, skipping");
                        report.errors.push(DiscoveryError {
                            path: dir,
                            reason: format!("invalid {MANIFEST_FILE}: {e}"),
                        });
                    }
                }
            }
        }

        info!(
            manifest_count = report.manifests.len(),
            error_count = report.errors.len(),
            "snapp discovery finished"
        );
        report
    }

    /// Validate and catalog a manifest.
    ///
    /// The new app starts in the `registered` state with both timestamps set
    /// to now. Fails with [`KernelError::DuplicateId`] when the id is taken
    /// and [`KernelError::InvalidManifest`] on any schema breach.
    pub fn register(&self, manifest: SnappManifest) -> KernelResult<Arc<RegisteredApp>> {
        manifest.validate()?;

        let mut catalog = self.catalog.write().expect("catalog lock poisoned");
        if catalog.apps.contains_key(&manifest.id) {
            return Err(KernelError::DuplicateId(manifest.id));
        }

        let id = manifest.id.clone();
        let app = Arc::new(RegisteredApp::new(manifest));
        catalog.apps.insert(id.clone(), Arc::clone(&app));
        catalog.order.push(id.clone());
        info!(snapp = %id, "snapp registered");
        Ok(app)
    }

    pub fn get(&self, id: &str) -> Option<Arc<RegisteredApp>> {
        self.catalog.read().expect("catalog lock poisoned").apps.get(id).cloned()
    }

    pub fn has(&self, id: &str) -> bool {
        self.catalog.read().expect("catalog lock poisoned").apps.contains_key(id)
    }

    /// All catalogued apps in registration order.
    pub fn get_all(&self) -> Vec<Arc<RegisteredApp>> {
        let catalog = self.catalog.read().expect("catalog lock poisoned");
        catalog
            .order
            .iter()
            .filter_map(|id| catalog.apps.get(id).cloned())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.catalog.read().expect("catalog lock poisoned").apps.len()
    }

    /// Drop an app from the catalog. Returns the removed record.
    pub fn unregister(&self, id: &str) -> Option<Arc<RegisteredApp>> {
        let mut catalog = self.catalog.write().expect("catalog lock poisoned");
        let removed = catalog.apps.remove(id);
        if removed.is_some() {
            catalog.order.retain(|existing| existing != id);
            info!(snapp = %id, "snapp unregistered");
        }
        removed
    }

    /// Drop every catalogued app.
    pub fn clear(&self) {
        let mut catalog = self.catalog.write().expect("catalog lock poisoned");
        catalog.apps.clear();
        catalog.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::AppState;
    use crate::manifest::OpenclawRequirements;

    fn manifest(id: &str) -> SnappManifest {
        SnappManifest {
            id: id.to_string(),
            name: format!("App {id}"),
            entry: "./index".to_string(),
            permissions: vec![],
            openclaw: OpenclawRequirements {
                min_version: "2.0.0".to_string(),
                hooks: None,
            },
            short_name: None,
            version: None,
            description: None,
            icon: None,
            author: None,
            config: None,
        }
    }

    fn registry() -> SnappRegistry {
        SnappRegistry::new("./snapps")
    }

    #[test]
    fn register_starts_in_registered_state() {
        let registry = registry();
        let app = registry.register(manifest("a")).expect("register");
        assert_eq!(app.state(), AppState::Registered);
        assert!(app.registered_at() > 0);
        assert_eq!(app.registered_at(), app.state_changed_at());
        assert!(registry.has("a"));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn duplicate_id_rejected() {
        let registry = registry();
        registry.register(manifest("a")).unwrap();
        let err = registry.register(manifest("a")).unwrap_err();
        assert!(matches!(err, KernelError::DuplicateId(id) if id == "a"));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn invalid_manifest_rejected_and_not_catalogued() {
        let registry = registry();
        let err = registry.register(manifest("Bad-Id")).unwrap_err();
        assert!(matches!(err, KernelError::InvalidManifest { .. }));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn get_all_preserves_registration_order() {
        let registry = registry();
        for id in ["zulu", "alpha", "mike"] {
            registry.register(manifest(id)).unwrap();
        }
        let ids: Vec<_> = registry.get_all().iter().map(|a| a.id().to_string()).collect();
        assert_eq!(ids, ["zulu", "alpha", "mike"]);
    }

    #[test]
    fn unregister_and_clear() {
        let registry = registry();
        registry.register(manifest("a")).unwrap();
        registry.register(manifest("b")).unwrap();

        assert!(registry.unregister("a").is_some());
        assert!(registry.unregister("a").is_none());
        assert_eq!(registry.count(), 1);

        registry.clear();
        assert_eq!(registry.count(), 0);
        assert!(registry.get_all().is_empty());
    }

    #[tokio::test]
    async fn discover_scans_first_level_directories() {
        let root = tempfile::tempdir().expect("tempdir");

        // Valid app.
        let good = root.path().join("good-app");
        std::fs::create_dir(&good).unwrap();
        std::fs::write(
            good.join(MANIFEST_FILE),
            serde_json::to_string(&manifest("good-app")).unwrap(),
        )
        .unwrap();

        // Broken manifest, must land in errors.
        let broken = root.path().join("broken-app");
        std::fs::create_dir(&broken).unwrap();
        std::fs::write(broken.join(MANIFEST_FILE), "{ not json").unwrap();

        // Directory without a manifest, silently skipped.
        std::fs::create_dir(root.path().join("not-an-app")).unwrap();

        // Stray file at the top level, ignored.
        std::fs::write(root.path().join("README.md"), "hi").unwrap();

        let registry = SnappRegistry::new(root.path());
        let report = registry.discover().await;

        assert_eq!(report.manifests.len(), 1);
        assert_eq!(report.manifests[0].id, "good-app");
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].path.ends_with("broken-app"));
    }

    #[tokio::test]
    async fn discover_missing_root_is_not_an_error() {
        let registry = SnappRegistry::new("/definitely/not/a/real/path");
        let report = registry.discover().await;
        assert!(report.manifests.is_empty());
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn discover_merges_extra_search_paths() {
        let builtin = tempfile::tempdir().unwrap();
        let extra = tempfile::tempdir().unwrap();

        for (root, id) in [(&builtin, "builtin-app"), (&extra, "extra-app")] {
            let dir = root.path().join(id);
            std::fs::create_dir(&dir).unwrap();
            std::fs::write(
                dir.join(MANIFEST_FILE),
                serde_json::to_string(&manifest(id)).unwrap(),
            )
            .unwrap();
        }

        let registry = SnappRegistry::new(builtin.path()).with_search_path(extra.path());
        let report = registry.discover().await;
        let mut ids: Vec<_> = report.manifests.iter().map(|m| m.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, ["builtin-app", "extra-app"]);
    }
}
