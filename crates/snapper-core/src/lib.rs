//! In-process SnApp runtime kernel.
//!
//! Discovers self-describing apps on disk, validates their manifests,
//! drives each through the lifecycle state machine, and gives every running
//! instance a capability-gated façade over the shared services:
//!
//! 1. [`SnappRegistry`] scans app directories for `snap.json` manifests
//! 2. [`LifecycleDriver`] walks apps through
//!    `registered → loaded → active ↔ suspended → registered`
//! 3. [`HookRouter`] fans host lifecycle events out by priority
//! 4. [`MessageBus`] brokers channel pub/sub and request/response calls
//! 5. [`StateStore`] persists namespaced state with TTL and optional
//!    encryption
//! 6. [`SnappApi`] is the per-app view stitching the above together,
//!    enforcing the manifest's permission grants
//!
//! Apps run in the same trust domain as the host: permissions are advisory
//! capability gates, not a sandbox. The bus never leaves the process.

pub mod api;
pub mod bus;
pub mod config;
pub mod error;
pub mod hooks;
pub mod kernel;
pub mod lifecycle;
pub mod manifest;
pub mod registry;
pub mod store;
pub mod ui;

pub use api::API_VERSION;
pub use api::HOST_COMMAND_REPLY_CHANNEL;
pub use api::HOST_PROMPT_CONTEXT_CHANNEL;
pub use api::HOST_TOAST_CHANNEL;
pub use api::SnappApi;
pub use api::SnappLogger;
pub use api::VersionInfo;
pub use bus::DEFAULT_REQUEST_TIMEOUT;
pub use bus::MessageBus;
pub use bus::SubscriptionId;
pub use bus::method_handler;
pub use bus::rpc_channel;
pub use config::KernelConfig;
pub use error::KernelError;
pub use error::KernelResult;
pub use hooks::HookHandlerId;
pub use hooks::HookName;
pub use hooks::HookOptions;
pub use hooks::HookPayload;
pub use hooks::HookRouter;
pub use hooks::hook_handler;
pub use kernel::SnapperKernel;
pub use lifecycle::AppState;
pub use lifecycle::LifecycleDriver;
pub use lifecycle::RegisteredApp;
pub use lifecycle::SnappInstance;
pub use lifecycle::instance_callback;
pub use manifest::Permission;
pub use manifest::SnappManifest;
pub use registry::DiscoveryReport;
pub use registry::MANIFEST_FILE;
pub use registry::SnappRegistry;
pub use store::PersistOptions;
pub use store::STATE_FORMAT_VERSION;
pub use store::StateCrypto;
pub use store::StateEntry;
pub use store::StateStore;
pub use ui::CommandResult;
pub use ui::CommandSpec;
pub use ui::ToastOptions;
pub use ui::command_handler;

/// Milliseconds since the unix epoch; the kernel's single clock source.
pub(crate) fn now_epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
