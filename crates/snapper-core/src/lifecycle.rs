//! App lifecycle state machine and transition driver.
//!
//! Every registered app moves through
//! `registered → loading → loaded → activating → active` with suspension
//! (`active ↔ suspended`) and teardown (`unloading → registered`) branches.
//! Any callback or factory failure parks the app in `error`, recoverable
//! only through [`LifecycleDriver::unload`]; the driver never retries on
//! its own.
//!
//! The state lives in an atomic on [`RegisteredApp`] so concurrent readers
//! observe intermediate states (`loading`, `activating`, ...) without
//! locking. Sequencing two transitions on the same app is the caller's
//! responsibility; the driver enforces entry preconditions, not mutual
//! exclusion.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::KernelError;
use crate::error::KernelResult;
use crate::manifest::SnappManifest;
use crate::now_epoch_ms;

/// Lifecycle state of a registered app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Registered,
    Loading,
    Loaded,
    Activating,
    Active,
    Suspending,
    Suspended,
    Unloading,
    Error,
}

impl AppState {
    /// Snake-case name as it appears in logs and persisted records.
    pub fn as_str(self) -> &'static str {
        match self {
            AppState::Registered => "registered",
            AppState::Loading => "loading",
            AppState::Loaded => "loaded",
            AppState::Activating => "activating",
            AppState::Active => "active",
            AppState::Suspending => "suspending",
            AppState::Suspended => "suspended",
            AppState::Unloading => "unloading",
            AppState::Error => "error",
        }
    }

    /// Whether `self → to` is in the valid-transition table.
    ///
    /// `x → x` is a permitted no-op for every state.
    pub fn can_transition_to(self, to: AppState) -> bool {
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (AppState::Registered, AppState::Loading)
                | (AppState::Loading, AppState::Loaded)
                | (AppState::Loading, AppState::Error)
                | (AppState::Loaded, AppState::Activating)
                | (AppState::Loaded, AppState::Unloading)
                | (AppState::Activating, AppState::Active)
                | (AppState::Activating, AppState::Error)
                | (AppState::Active, AppState::Suspending)
                | (AppState::Active, AppState::Unloading)
                | (AppState::Suspending, AppState::Suspended)
                | (AppState::Suspending, AppState::Error)
                | (AppState::Suspended, AppState::Activating)
                | (AppState::Suspended, AppState::Unloading)
                | (AppState::Unloading, AppState::Registered)
                | (AppState::Unloading, AppState::Error)
                | (AppState::Error, AppState::Unloading)
        )
    }

    fn from_u8(value: u8) -> AppState {
        match value {
            0 => AppState::Registered,
            1 => AppState::Loading,
            2 => AppState::Loaded,
            3 => AppState::Activating,
            4 => AppState::Active,
            5 => AppState::Suspending,
            6 => AppState::Suspended,
            7 => AppState::Unloading,
            _ => AppState::Error,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            AppState::Registered => 0,
            AppState::Loading => 1,
            AppState::Loaded => 2,
            AppState::Activating => 3,
            AppState::Active => 4,
            AppState::Suspending => 5,
            AppState::Suspended => 6,
            AppState::Unloading => 7,
            AppState::Error => 8,
        }
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion returned by an instance callback.
pub type InstanceFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A lifecycle callback supplied by the app factory.
pub type InstanceCallback = Box<dyn Fn() -> InstanceFuture + Send + Sync>;

/// Wrap an async closure as an [`InstanceCallback`].
pub fn instance_callback<F, Fut>(f: F) -> InstanceCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

/// The record an app factory returns on activation.
///
/// Each callback is optional; the driver tests presence before invoking.
/// The kernel treats the callbacks as opaque capability objects; it never
/// inspects what they capture.
#[derive(Default)]
pub struct SnappInstance {
    pub on_activate: Option<InstanceCallback>,
    pub on_suspend: Option<InstanceCallback>,
    pub on_destroy: Option<InstanceCallback>,
}

impl SnappInstance {
    /// An instance with no lifecycle callbacks.
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for SnappInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnappInstance")
            .field("on_activate", &self.on_activate.is_some())
            .field("on_suspend", &self.on_suspend.is_some())
            .field("on_destroy", &self.on_destroy.is_some())
            .finish()
    }
}

/// A catalogued app: manifest plus mutable lifecycle bookkeeping.
///
/// The registry owns the manifest; the state field changes exclusively
/// through [`LifecycleDriver`] methods. Invariants: `error` is present when
/// the state is `error`; `instance` is present in `active`, `suspending`,
/// and `suspended`.
pub struct RegisteredApp {
    manifest: SnappManifest,
    registered_at: u64,
    state: AtomicU8,
    state_changed_at: AtomicU64,
    instance: Mutex<Option<Arc<SnappInstance>>>,
    error: Mutex<Option<String>>,
}

impl RegisteredApp {
    pub(crate) fn new(manifest: SnappManifest) -> Self {
        let now = now_epoch_ms();
        Self {
            manifest,
            registered_at: now,
            state: AtomicU8::new(AppState::Registered.as_u8()),
            state_changed_at: AtomicU64::new(now),
            instance: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn manifest(&self) -> &SnappManifest {
        &self.manifest
    }

    /// Epoch-ms timestamp of registration.
    pub fn registered_at(&self) -> u64 {
        self.registered_at
    }

    /// Epoch-ms timestamp of the last successful state change.
    pub fn state_changed_at(&self) -> u64 {
        self.state_changed_at.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> AppState {
        AppState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The reason the app is in the error state, if it is.
    pub fn last_error(&self) -> Option<String> {
        self.error.lock().expect("error mutex poisoned").clone()
    }

    /// The live instance, populated on activation and cleared on unload.
    pub fn instance(&self) -> Option<Arc<SnappInstance>> {
        self.instance.lock().expect("instance mutex poisoned").clone()
    }

    fn set_state(&self, state: AppState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
        self.state_changed_at.store(now_epoch_ms(), Ordering::SeqCst);
    }

    fn set_instance(&self, instance: Option<Arc<SnappInstance>>) {
        *self.instance.lock().expect("instance mutex poisoned") = instance;
    }

    fn set_error(&self, reason: Option<String>) {
        *self.error.lock().expect("error mutex poisoned") = reason;
    }
}

impl fmt::Debug for RegisteredApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredApp")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("error", &self.last_error())
            .finish()
    }
}

/// Drives apps through the lifecycle state machine.
///
/// All operations re-check the transition table on entry and raise
/// [`KernelError::InvalidTransition`] when the app is not in a state the
/// operation can start from.
#[derive(Debug, Default)]
pub struct LifecycleDriver;

impl LifecycleDriver {
    pub fn new() -> Self {
        Self
    }

    /// Enter a transient state, rejecting anything outside the table.
    ///
    /// Re-entering the current state is rejected too: an operation entry is
    /// a real transition, not the table's `x → x` no-op.
    fn enter(&self, app: &RegisteredApp, to: AppState) -> KernelResult<()> {
        let from = app.state();
        if from == to || !from.can_transition_to(to) {
            return Err(KernelError::InvalidTransition { from, to });
        }
        app.set_state(to);
        debug!(snapp = %app.id(), from = %from, to = %to, "lifecycle transition");
        Ok(())
    }

    /// Complete an in-flight operation. Only called on table-valid edges.
    fn settle(&self, app: &RegisteredApp, to: AppState) {
        let from = app.state();
        debug_assert!(from.can_transition_to(to), "settle {from} -> {to}");
        app.set_state(to);
        debug!(snapp = %app.id(), from = %from, to = %to, "lifecycle transition");
    }

    /// Park the app in the error state, recording the reason.
    fn fail(&self, app: &RegisteredApp, reason: &anyhow::Error) {
        app.set_error(Some(format!("{reason:#}")));
        app.set_state(AppState::Error);
        warn!(snapp = %app.id(), error = %reason, "snapp entered error state");
    }

    /// Load an app with the default no-op loader.
    pub async fn load(&self, app: &RegisteredApp) -> KernelResult<()> {
        self.load_with(app, || async { Ok(()) }).await
    }

    /// Load an app: `registered → loading → loaded`.
    ///
    /// A loader failure records the reason, parks the app in `error`, and
    /// re-raises as [`KernelError::CallbackFailure`].
    pub async fn load_with<L, Fut>(&self, app: &RegisteredApp, loader: L) -> KernelResult<()>
    where
        L: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        self.enter(app, AppState::Loading)?;
        match loader().await {
            Ok(()) => {
                self.settle(app, AppState::Loaded);
                info!(snapp = %app.id(), "snapp loaded");
                Ok(())
            }
            Err(cause) => {
                self.fail(app, &cause);
                Err(KernelError::CallbackFailure {
                    callback: "loader",
                    cause,
                })
            }
        }
    }

    /// Activate an app: `loaded|suspended → activating → active`.
    ///
    /// Awaits `factory()` for the instance, stores it on the app, then
    /// awaits the instance's `on_activate` callback if present. Any failure
    /// parks the app in `error` and re-raises.
    pub async fn activate<F, Fut>(&self, app: &RegisteredApp, factory: F) -> KernelResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<SnappInstance>>,
    {
        self.enter(app, AppState::Activating)?;

        let instance = match factory().await {
            Ok(instance) => Arc::new(instance),
            Err(cause) => {
                self.fail(app, &cause);
                return Err(KernelError::FactoryFailure(cause));
            }
        };
        app.set_instance(Some(Arc::clone(&instance)));

        if let Some(on_activate) = &instance.on_activate
            && let Err(cause) = on_activate().await
        {
            self.fail(app, &cause);
            return Err(KernelError::CallbackFailure {
                callback: "on_activate",
                cause,
            });
        }

        self.settle(app, AppState::Active);
        info!(snapp = %app.id(), "snapp active");
        Ok(())
    }

    /// Suspend an active app: `active → suspending → suspended`.
    ///
    /// Returns `false` without mutating when the app is not active.
    pub async fn suspend(&self, app: &RegisteredApp) -> KernelResult<bool> {
        if app.state() != AppState::Active {
            return Ok(false);
        }
        self.enter(app, AppState::Suspending)?;

        if let Some(instance) = app.instance()
            && let Some(on_suspend) = &instance.on_suspend
            && let Err(cause) = on_suspend().await
        {
            self.fail(app, &cause);
            return Err(KernelError::CallbackFailure {
                callback: "on_suspend",
                cause,
            });
        }

        self.settle(app, AppState::Suspended);
        info!(snapp = %app.id(), "snapp suspended");
        Ok(true)
    }

    /// Unload an app: `* → unloading → registered`.
    ///
    /// Returns `false` when the app is already just registered. This is the
    /// only exit from the error state; on success the instance and recorded
    /// error are both cleared.
    pub async fn unload(&self, app: &RegisteredApp) -> KernelResult<bool> {
        if app.state() == AppState::Registered {
            return Ok(false);
        }
        self.enter(app, AppState::Unloading)?;

        if let Some(instance) = app.instance()
            && let Some(on_destroy) = &instance.on_destroy
            && let Err(cause) = on_destroy().await
        {
            self.fail(app, &cause);
            return Err(KernelError::CallbackFailure {
                callback: "on_destroy",
                cause,
            });
        }

        app.set_instance(None);
        app.set_error(None);
        self.settle(app, AppState::Registered);
        info!(snapp = %app.id(), "snapp unloaded");
        Ok(true)
    }
}
