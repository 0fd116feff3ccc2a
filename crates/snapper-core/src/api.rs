//! Per-app API façade: the capability-gated view of the kernel services.
//!
//! One façade is constructed per activation, bound to a single app's
//! identity and granted permissions. Every gated operation checks its
//! permission tag first and raises [`KernelError::PermissionDenied`] naming
//! the tag on a miss; permissions are advisory capability gates, not a
//! sandbox.
//!
//! The façade holds no durable state of its own. Storage calls delegate to
//! the [`StateStore`], hook subscriptions to the [`HookRouter`], messaging
//! to the [`MessageBus`]; tabs, panels, and commands live in memory until
//! [`SnappApi::dispose`]. Host-bound notifications (toasts, prompt context,
//! command replies) ride reserved `host:*` bus channels with the app as
//! sender.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tracing::warn;

use crate::bus::BusHandler;
use crate::bus::MessageBus;
use crate::bus::SubscriptionId;
use crate::error::KernelError;
use crate::error::KernelResult;
use crate::hooks::HookHandler;
use crate::hooks::HookHandlerId;
use crate::hooks::HookName;
use crate::hooks::HookOptions;
use crate::hooks::HookRouter;
use crate::hooks::hook_handler;
use crate::lifecycle::AppState;
use crate::lifecycle::RegisteredApp;
use crate::manifest::Permission;
use crate::manifest::SnappManifest;
use crate::store::PersistOptions;
use crate::store::StateStore;
use crate::ui::CommandArgs;
use crate::ui::CommandContext;
use crate::ui::CommandResult;
use crate::ui::CommandSpec;
use crate::ui::PanelDefinition;
use crate::ui::PanelEvent;
use crate::ui::PanelOptions;
use crate::ui::TabDefinition;
use crate::ui::TabEvent;
use crate::ui::TabOptions;
use crate::ui::TabUpdate;
use crate::ui::ToastOptions;
use crate::ui::UiEventKind;

/// Version of the façade surface itself.
pub const API_VERSION: &str = "1.0.0";

/// Reserved channel carrying [`ToastOptions`] to the host shell.
pub const HOST_TOAST_CHANNEL: &str = "host:toast";
/// Reserved channel carrying injected prompt context to the host.
pub const HOST_PROMPT_CONTEXT_CHANNEL: &str = "host:prompt-context";
/// Reserved channel carrying command replies back to the issuing shell.
pub const HOST_COMMAND_REPLY_CHANNEL: &str = "host:command-reply";

/// App and façade version pair returned by [`SnappApi::version_info`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: Option<String>,
    pub api_version: String,
}

/// App-scoped logger. Every line carries the app id; child loggers add a
/// bracketed prefix.
#[derive(Debug, Clone)]
pub struct SnappLogger {
    snapp_id: String,
    prefix: Option<String>,
}

impl SnappLogger {
    fn new(snapp_id: &str) -> Self {
        Self {
            snapp_id: snapp_id.to_string(),
            prefix: None,
        }
    }

    /// Derive a logger whose lines carry an additional prefix.
    pub fn child(&self, prefix: &str) -> SnappLogger {
        let prefix = match &self.prefix {
            Some(parent) => format!("{parent}:{prefix}"),
            None => prefix.to_string(),
        };
        SnappLogger {
            snapp_id: self.snapp_id.clone(),
            prefix: Some(prefix),
        }
    }

    fn line(&self, message: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("[{prefix}] {message}"),
            None => message.to_string(),
        }
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(snapp = %self.snapp_id, "{}", self.line(message));
    }

    pub fn info(&self, message: &str) {
        tracing::info!(snapp = %self.snapp_id, "{}", self.line(message));
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(snapp = %self.snapp_id, "{}", self.line(message));
    }

    pub fn error(&self, message: &str) {
        tracing::error!(snapp = %self.snapp_id, "{}", self.line(message));
    }
}

/// Callback observing tab events. Failures are swallowed.
pub type TabEventCallback = Arc<dyn Fn(&TabEvent) -> anyhow::Result<()> + Send + Sync>;
/// Callback observing panel events. Failures are swallowed.
pub type PanelEventCallback = Arc<dyn Fn(&PanelEvent) -> anyhow::Result<()> + Send + Sync>;

/// The capability-gated API surface handed to one running app.
pub struct SnappApi {
    app: Arc<RegisteredApp>,
    permissions: HashSet<Permission>,
    store: Arc<StateStore>,
    hooks: Arc<HookRouter>,
    bus: Arc<MessageBus>,
    working_dir: PathBuf,
    logger: SnappLogger,
    tabs: Mutex<Vec<TabDefinition>>,
    panels: Mutex<Vec<PanelDefinition>>,
    tab_counter: AtomicU64,
    panel_counter: AtomicU64,
    tab_listeners: Mutex<Vec<TabEventCallback>>,
    panel_listeners: Mutex<Vec<PanelEventCallback>>,
    commands: Mutex<HashMap<String, CommandSpec>>,
    current_session: Arc<Mutex<Option<String>>>,
    hook_subscriptions: Mutex<Vec<(HookName, HookHandlerId)>>,
    bus_subscriptions: Mutex<Vec<(String, SubscriptionId)>>,
    disposed: AtomicBool,
}

impl SnappApi {
    /// Build a façade bound to `app` with the given permission grants.
    ///
    /// The façade immediately subscribes (ungated, internal) to session
    /// hooks so command contexts know the current session id.
    pub fn new(
        app: Arc<RegisteredApp>,
        permissions: HashSet<Permission>,
        store: Arc<StateStore>,
        hooks: Arc<HookRouter>,
        bus: Arc<MessageBus>,
        working_dir: PathBuf,
    ) -> Self {
        let logger = SnappLogger::new(app.id());
        let current_session: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let mut hook_subscriptions = Vec::new();
        let session = Arc::clone(&current_session);
        let start_id = hooks.on(
            HookName::SessionStart,
            hook_handler(move |payload| {
                let session = Arc::clone(&session);
                async move {
                    *session.lock().expect("session slot poisoned") =
                        Some(payload.session_id().to_string());
                    Ok(())
                }
            }),
            HookOptions::default(),
        );
        hook_subscriptions.push((HookName::SessionStart, start_id));
        let session = Arc::clone(&current_session);
        let end_id = hooks.on(
            HookName::SessionEnd,
            hook_handler(move |_payload| {
                let session = Arc::clone(&session);
                async move {
                    *session.lock().expect("session slot poisoned") = None;
                    Ok(())
                }
            }),
            HookOptions::default(),
        );
        hook_subscriptions.push((HookName::SessionEnd, end_id));

        Self {
            app,
            permissions,
            store,
            hooks,
            bus,
            working_dir,
            logger,
            tabs: Mutex::new(Vec::new()),
            panels: Mutex::new(Vec::new()),
            tab_counter: AtomicU64::new(0),
            panel_counter: AtomicU64::new(0),
            tab_listeners: Mutex::new(Vec::new()),
            panel_listeners: Mutex::new(Vec::new()),
            commands: Mutex::new(HashMap::new()),
            current_session,
            hook_subscriptions: Mutex::new(hook_subscriptions),
            bus_subscriptions: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn id(&self) -> &str {
        self.app.id()
    }

    pub fn manifest(&self) -> &SnappManifest {
        self.app.manifest()
    }

    pub fn state(&self) -> AppState {
        self.app.state()
    }

    pub fn version_info(&self) -> VersionInfo {
        VersionInfo {
            version: self.manifest().version.clone(),
            api_version: API_VERSION.to_string(),
        }
    }

    pub fn logger(&self) -> &SnappLogger {
        &self.logger
    }

    // ------------------------------------------------------------------
    // Permissions
    // ------------------------------------------------------------------

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    fn require(&self, permission: Permission) -> KernelResult<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(KernelError::PermissionDenied(permission))
        }
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub async fn persist(
        &self,
        key: &str,
        value: Value,
        options: PersistOptions,
    ) -> KernelResult<()> {
        self.require(Permission::StorageWrite)?;
        self.store.persist(self.id(), key, value, options).await
    }

    pub async fn restore(&self, key: &str, namespace: Option<&str>) -> KernelResult<Option<Value>> {
        self.require(Permission::StorageRead)?;
        Ok(self.store.restore(self.id(), key, namespace).await)
    }

    pub async fn restore_or(
        &self,
        key: &str,
        default: Value,
        namespace: Option<&str>,
    ) -> KernelResult<Value> {
        self.require(Permission::StorageRead)?;
        Ok(self.store.restore_or(self.id(), key, default, namespace).await)
    }

    pub async fn remove(&self, key: &str, namespace: Option<&str>) -> KernelResult<()> {
        self.require(Permission::StorageDelete)?;
        self.store.remove(self.id(), key, namespace).await
    }

    pub async fn list_keys(&self, namespace: Option<&str>) -> KernelResult<Vec<String>> {
        self.require(Permission::StorageRead)?;
        Ok(self.store.list_keys(self.id(), namespace).await)
    }

    pub async fn clear_state(&self, namespace: Option<&str>) -> KernelResult<()> {
        self.require(Permission::StorageDelete)?;
        self.store.clear(self.id(), namespace).await
    }

    // ------------------------------------------------------------------
    // Tabs
    // ------------------------------------------------------------------

    fn emit_tab_event(&self, kind: UiEventKind, tab_id: &str) {
        let event = TabEvent {
            kind,
            tab_id: tab_id.to_string(),
        };
        let listeners: Vec<TabEventCallback> = {
            let listeners = self.tab_listeners.lock().expect("tab listeners poisoned");
            listeners.clone()
        };
        for listener in listeners {
            if let Err(e) = listener(&event) {
                warn!(snapp = %self.id(), error = %e, "tab event callback failed");
            }
        }
    }

    pub fn register_tab(&self, options: TabOptions) -> KernelResult<String> {
        self.require(Permission::UiTab)?;
        let n = self.tab_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("tab_{}_{n}", self.id());
        self.tabs.lock().expect("tab list poisoned").push(TabDefinition {
            id: id.clone(),
            title: options.title,
            icon: options.icon,
            active: false,
            data: options.data,
        });
        self.emit_tab_event(UiEventKind::Activated, &id);
        Ok(id)
    }

    pub fn unregister_tab(&self, tab_id: &str) -> KernelResult<bool> {
        self.require(Permission::UiTab)?;
        let removed = {
            let mut tabs = self.tabs.lock().expect("tab list poisoned");
            let before = tabs.len();
            tabs.retain(|tab| tab.id != tab_id);
            before != tabs.len()
        };
        if removed {
            self.emit_tab_event(UiEventKind::Closed, tab_id);
        }
        Ok(removed)
    }

    pub fn update_tab(&self, tab_id: &str, update: TabUpdate) -> KernelResult<bool> {
        self.require(Permission::UiTab)?;
        let updated = {
            let mut tabs = self.tabs.lock().expect("tab list poisoned");
            match tabs.iter_mut().find(|tab| tab.id == tab_id) {
                Some(tab) => {
                    if let Some(title) = update.title {
                        tab.title = title;
                    }
                    if let Some(icon) = update.icon {
                        tab.icon = Some(icon);
                    }
                    if let Some(data) = update.data {
                        tab.data = Some(data);
                    }
                    true
                }
                None => false,
            }
        };
        if updated {
            self.emit_tab_event(UiEventKind::Updated, tab_id);
        }
        Ok(updated)
    }

    /// Mark one tab active and every other tab of this app inactive.
    pub fn activate_tab(&self, tab_id: &str) -> KernelResult<bool> {
        self.require(Permission::UiTab)?;
        let found = {
            let mut tabs = self.tabs.lock().expect("tab list poisoned");
            let found = tabs.iter().any(|tab| tab.id == tab_id);
            if found {
                for tab in tabs.iter_mut() {
                    tab.active = tab.id == tab_id;
                }
            }
            found
        };
        if found {
            self.emit_tab_event(UiEventKind::Activated, tab_id);
        }
        Ok(found)
    }

    pub fn get_tabs(&self) -> KernelResult<Vec<TabDefinition>> {
        self.require(Permission::UiTab)?;
        Ok(self.tabs.lock().expect("tab list poisoned").clone())
    }

    pub fn on_tab_event(&self, callback: TabEventCallback) -> KernelResult<()> {
        self.require(Permission::UiTab)?;
        self.tab_listeners.lock().expect("tab listeners poisoned").push(callback);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Panels
    // ------------------------------------------------------------------

    fn emit_panel_event(&self, kind: UiEventKind, panel_id: &str) {
        let event = PanelEvent {
            kind,
            panel_id: panel_id.to_string(),
        };
        let listeners: Vec<PanelEventCallback> = {
            let listeners = self.panel_listeners.lock().expect("panel listeners poisoned");
            listeners.clone()
        };
        for listener in listeners {
            if let Err(e) = listener(&event) {
                warn!(snapp = %self.id(), error = %e, "panel event callback failed");
            }
        }
    }

    pub fn register_panel(&self, options: PanelOptions) -> KernelResult<String> {
        self.require(Permission::UiPanel)?;
        let n = self.panel_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("panel_{}_{n}", self.id());
        self.panels.lock().expect("panel list poisoned").push(PanelDefinition {
            id: id.clone(),
            title: options.title,
            icon: options.icon,
            expanded: options.expanded,
            data: options.data,
        });
        self.emit_panel_event(UiEventKind::Activated, &id);
        Ok(id)
    }

    pub fn unregister_panel(&self, panel_id: &str) -> KernelResult<bool> {
        self.require(Permission::UiPanel)?;
        let removed = {
            let mut panels = self.panels.lock().expect("panel list poisoned");
            let before = panels.len();
            panels.retain(|panel| panel.id != panel_id);
            before != panels.len()
        };
        if removed {
            self.emit_panel_event(UiEventKind::Closed, panel_id);
        }
        Ok(removed)
    }

    /// Flip a panel's `expanded` flag, or set it when `expanded` is given.
    pub fn toggle_panel(&self, panel_id: &str, expanded: Option<bool>) -> KernelResult<bool> {
        self.require(Permission::UiPanel)?;
        let toggled = {
            let mut panels = self.panels.lock().expect("panel list poisoned");
            match panels.iter_mut().find(|panel| panel.id == panel_id) {
                Some(panel) => {
                    panel.expanded = expanded.unwrap_or(!panel.expanded);
                    true
                }
                None => false,
            }
        };
        if toggled {
            self.emit_panel_event(UiEventKind::Updated, panel_id);
        }
        Ok(toggled)
    }

    pub fn get_panels(&self) -> KernelResult<Vec<PanelDefinition>> {
        self.require(Permission::UiPanel)?;
        Ok(self.panels.lock().expect("panel list poisoned").clone())
    }

    pub fn on_panel_event(&self, callback: PanelEventCallback) -> KernelResult<()> {
        self.require(Permission::UiPanel)?;
        self.panel_listeners.lock().expect("panel listeners poisoned").push(callback);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Toasts
    // ------------------------------------------------------------------

    /// Forward a toast to the host shell.
    pub fn show_toast(&self, options: ToastOptions) -> KernelResult<()> {
        self.require(Permission::UiToast)?;
        self.bus.publish(
            HOST_TOAST_CHANNEL,
            &json!({ "snapp": self.id(), "toast": options }),
            Some(self.id()),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Register a command under `<app-id>:<name>`. Returns the full key.
    pub fn register_command(&self, spec: CommandSpec) -> KernelResult<String> {
        self.require(Permission::CommandRegister)?;
        let key = format!("{}:{}", self.id(), spec.name);
        self.commands.lock().expect("command table poisoned").insert(key.clone(), spec);
        Ok(key)
    }

    /// Remove a command by bare name or full key. Returns `true` if found.
    pub fn unregister_command(&self, name: &str) -> KernelResult<bool> {
        self.require(Permission::CommandRegister)?;
        let key = if name.contains(':') {
            name.to_string()
        } else {
            format!("{}:{}", self.id(), name)
        };
        Ok(self.commands.lock().expect("command table poisoned").remove(&key).is_some())
    }

    /// Execute a command line issued by the host terminal shell.
    ///
    /// The first whitespace token is looked up verbatim (callers typically
    /// pass `<app-id>:<name> <args>`); remaining tokens become positional
    /// arguments. Unknown commands and handler failures both come back as
    /// `success: false`; the shell never sees a raised error.
    pub async fn execute_command(&self, line: &str) -> CommandResult {
        let mut tokens = line.split_whitespace();
        let Some(name) = tokens.next() else {
            return CommandResult::error("empty command line");
        };
        let handler = {
            let commands = self.commands.lock().expect("command table poisoned");
            commands.get(name).map(|spec| Arc::clone(&spec.handler))
        };
        let Some(handler) = handler else {
            return CommandResult::error(format!("unknown command '{name}'"));
        };

        let args = CommandArgs {
            positional: tokens.map(str::to_string).collect(),
            options: HashMap::new(),
            raw: line.to_string(),
            flags: HashSet::new(),
        };
        let session_id = self.current_session.lock().expect("session slot poisoned").clone();
        let bus = Arc::clone(&self.bus);
        let snapp_id = self.id().to_string();
        let command = name.to_string();
        let reply: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(move |message| {
            bus.publish(
                HOST_COMMAND_REPLY_CHANNEL,
                &json!({ "snapp": snapp_id, "command": command, "message": message }),
                Some(snapp_id.as_str()),
            );
        });
        let ctx = CommandContext::new(self.id(), session_id, reply);

        match handler(args, ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!(snapp = %self.id(), command = name, error = %e, "command handler failed");
                CommandResult::error(format!("{e:#}"))
            }
        }
    }

    /// Registered command keys, for the host's completion listing.
    pub fn command_keys(&self) -> Vec<String> {
        self.commands.lock().expect("command table poisoned").keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    pub fn on_hook(
        &self,
        hook: HookName,
        handler: HookHandler,
        options: HookOptions,
    ) -> KernelResult<HookHandlerId> {
        self.require(Permission::SessionHook)?;
        let id = self.hooks.on(hook, handler, options);
        self.hook_subscriptions
            .lock()
            .expect("hook subscription list poisoned")
            .push((hook, id));
        Ok(id)
    }

    pub fn once_hook(&self, hook: HookName, handler: HookHandler) -> KernelResult<HookHandlerId> {
        self.require(Permission::SessionHook)?;
        let id = self.hooks.once(hook, handler);
        self.hook_subscriptions
            .lock()
            .expect("hook subscription list poisoned")
            .push((hook, id));
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Context
    // ------------------------------------------------------------------

    /// Hand a piece of prompt context to the host. The priority is
    /// forwarded verbatim; the host decides what it means.
    pub fn inject_prompt_context(&self, text: &str, priority: Option<i32>) -> KernelResult<()> {
        self.require(Permission::PromptInject)?;
        self.bus.publish(
            HOST_PROMPT_CONTEXT_CHANNEL,
            &json!({ "snapp": self.id(), "text": text, "priority": priority }),
            Some(self.id()),
        );
        Ok(())
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_dir
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    pub fn publish(&self, channel: &str, message: &Value) -> KernelResult<()> {
        self.require(Permission::BusPublish)?;
        self.bus.publish(channel, message, Some(self.id()));
        Ok(())
    }

    pub fn subscribe(&self, channel: &str, handler: BusHandler) -> KernelResult<SubscriptionId> {
        self.require(Permission::BusSubscribe)?;
        let id = self.bus.subscribe(channel, handler, Some(self.id()));
        self.bus_subscriptions
            .lock()
            .expect("bus subscription list poisoned")
            .push((channel.to_string(), id));
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Release everything the façade registered on behalf of the app:
    /// tabs, panels, commands, event callbacks, hook and bus subscriptions.
    /// Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.tabs.lock().expect("tab list poisoned").clear();
        self.panels.lock().expect("panel list poisoned").clear();
        self.tab_listeners.lock().expect("tab listeners poisoned").clear();
        self.panel_listeners.lock().expect("panel listeners poisoned").clear();
        self.commands.lock().expect("command table poisoned").clear();
        self.tab_counter.store(0, Ordering::SeqCst);
        self.panel_counter.store(0, Ordering::SeqCst);
        for (hook, id) in self
            .hook_subscriptions
            .lock()
            .expect("hook subscription list poisoned")
            .drain(..)
        {
            self.hooks.off(hook, id);
        }
        for (channel, id) in self
            .bus_subscriptions
            .lock()
            .expect("bus subscription list poisoned")
            .drain(..)
        {
            self.bus.unsubscribe(&channel, id);
        }
        self.logger.info("façade disposed");
    }
}

impl std::fmt::Debug for SnappApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnappApi")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("permissions", &self.permissions.len())
            .finish()
    }
}
