//! The composed kernel: one registry, store, hook router, and bus.
//!
//! `SnapperKernel` is the host's entry point. Startup runs discovery and
//! registers whatever parses; broken manifests are logged and skipped so
//! one bad app cannot keep the host from starting. Activation builds the
//! per-app façade, hands it to the app's factory, and drives the lifecycle;
//! unloading disposes the façade again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;

use tracing::info;
use tracing::warn;

use crate::api::SnappApi;
use crate::bus::MessageBus;
use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::error::KernelResult;
use crate::hooks::HookPayload;
use crate::hooks::HookRouter;
use crate::lifecycle::AppState;
use crate::lifecycle::LifecycleDriver;
use crate::lifecycle::RegisteredApp;
use crate::lifecycle::SnappInstance;
use crate::registry::SnappRegistry;
use crate::store::StateCrypto;
use crate::store::StateStore;

/// The SnApp runtime kernel.
pub struct SnapperKernel {
    config: KernelConfig,
    registry: SnappRegistry,
    driver: LifecycleDriver,
    store: Arc<StateStore>,
    hooks: Arc<HookRouter>,
    bus: Arc<MessageBus>,
    facades: Mutex<HashMap<String, Arc<SnappApi>>>,
}

impl SnapperKernel {
    pub fn new(config: KernelConfig) -> Self {
        Self::build(config, None)
    }

    /// A kernel whose state store encrypts flagged entries through `crypto`.
    pub fn with_crypto(config: KernelConfig, crypto: Arc<dyn StateCrypto>) -> Self {
        Self::build(config, Some(crypto))
    }

    fn build(config: KernelConfig, crypto: Option<Arc<dyn StateCrypto>>) -> Self {
        let mut registry = SnappRegistry::new(&config.builtin_path);
        for path in &config.extra_paths {
            registry = registry.with_search_path(path);
        }
        let mut store = StateStore::new(&config.state_base);
        if let Some(crypto) = crypto {
            store = store.with_crypto(crypto);
        }
        Self {
            config,
            registry,
            driver: LifecycleDriver::new(),
            store: Arc::new(store),
            hooks: Arc::new(HookRouter::new()),
            bus: Arc::new(MessageBus::new()),
            facades: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &SnappRegistry {
        &self.registry
    }

    pub fn driver(&self) -> &LifecycleDriver {
        &self.driver
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn hooks(&self) -> &Arc<HookRouter> {
        &self.hooks
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Scan the configured directories and register every manifest that
    /// validates. Returns how many apps were registered; failures are
    /// logged and skipped.
    pub async fn discover_and_register(&self) -> usize {
        let report = self.registry.discover().await;
        let mut registered = 0;
        for manifest in report.manifests {
            let id = manifest.id.clone();
            match self.registry.register(manifest) {
                Ok(_) => registered += 1,
                Err(e) => {
                    warn!(snapp = %id, error = %e, "failed to register discovered snapp, skipping");
                }
            }
        }
        info!(registered, skipped = report.errors.len(), "snapp startup discovery done");
        registered
    }

    /// The façade bound to a currently activated app, if any.
    pub fn facade(&self, id: &str) -> Option<Arc<SnappApi>> {
        self.facades.lock().expect("facade table poisoned").get(id).cloned()
    }

    fn app(&self, id: &str) -> KernelResult<Arc<RegisteredApp>> {
        self.registry.get(id).ok_or_else(|| KernelError::UnknownApp(id.to_string()))
    }

    /// Activate an app end to end.
    ///
    /// A freshly registered app is loaded first with the default loader.
    /// The per-app façade is constructed (or reused across a
    /// suspend/resume cycle) and handed to `factory`, which returns the
    /// instance whose callbacks the lifecycle will drive.
    pub async fn activate<F, Fut>(&self, id: &str, factory: F) -> KernelResult<Arc<SnappApi>>
    where
        F: FnOnce(Arc<SnappApi>) -> Fut,
        Fut: Future<Output = anyhow::Result<SnappInstance>>,
    {
        let app = self.app(id)?;
        if app.state() == AppState::Registered {
            self.driver.load(&app).await?;
        }
        match app.state() {
            AppState::Loaded | AppState::Suspended => {}
            state => {
                return Err(KernelError::PreconditionViolated {
                    operation: "activate",
                    state,
                });
            }
        }

        let api = {
            let mut facades = self.facades.lock().expect("facade table poisoned");
            Arc::clone(facades.entry(id.to_string()).or_insert_with(|| {
                Arc::new(SnappApi::new(
                    Arc::clone(&app),
                    app.manifest().granted_permissions(),
                    Arc::clone(&self.store),
                    Arc::clone(&self.hooks),
                    Arc::clone(&self.bus),
                    self.config.working_dir.clone(),
                ))
            }))
        };

        let api_for_factory = Arc::clone(&api);
        self.driver.activate(&app, move || factory(api_for_factory)).await?;
        Ok(api)
    }

    /// Suspend an active app. `false` when it was not active.
    pub async fn suspend(&self, id: &str) -> KernelResult<bool> {
        let app = self.app(id)?;
        self.driver.suspend(&app).await
    }

    /// Unload an app and dispose its façade. `false` when it was already
    /// just registered.
    pub async fn unload(&self, id: &str) -> KernelResult<bool> {
        let app = self.app(id)?;
        let unloaded = self.driver.unload(&app).await?;
        if unloaded
            && let Some(api) = self.facades.lock().expect("facade table poisoned").remove(id)
        {
            api.dispose();
        }
        Ok(unloaded)
    }

    /// Emit a host lifecycle event to every subscribed app.
    pub async fn emit(&self, payload: HookPayload) {
        self.hooks.emit(payload).await;
    }
}
