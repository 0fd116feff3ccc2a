//! Data shapes the kernel hands to the host shell.
//!
//! Tabs, panels, toasts, and command plumbing are plain records owned by
//! the per-app façade and echoed to the host via events; the kernel never
//! renders anything.

use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

/// What happened to a tab or panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiEventKind {
    Activated,
    Closed,
    Updated,
}

/// Event echoed to `on_tab_event` callbacks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabEvent {
    #[serde(rename = "type")]
    pub kind: UiEventKind,
    pub tab_id: String,
}

/// Event echoed to `on_panel_event` callbacks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelEvent {
    #[serde(rename = "type")]
    pub kind: UiEventKind,
    pub panel_id: String,
}

/// What an app supplies when registering a tab.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TabOptions {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Opaque payload the host passes through to the rendered tab.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A registered tab as the host sees it.
#[derive(Debug, Clone, Serialize)]
pub struct TabDefinition {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Partial tab update; `None` fields stay unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TabUpdate {
    pub title: Option<String>,
    pub icon: Option<String>,
    pub data: Option<Value>,
}

/// What an app supplies when registering a panel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PanelOptions {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub expanded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A registered panel as the host sees it.
#[derive(Debug, Clone, Serialize)]
pub struct PanelDefinition {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub expanded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Toast severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

/// A toast notification forwarded to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToastOptions {
    pub message: String,
    #[serde(default)]
    pub kind: ToastKind,
    /// How long the host should show it, if it honors durations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Parsed command invocation.
///
/// The kernel's parse is positional-only: the first token selects the
/// command, the rest land in `positional`. `options` and `flags` stay
/// empty unless a higher-level parser fills them in.
#[derive(Debug, Clone, Default)]
pub struct CommandArgs {
    pub positional: Vec<String>,
    pub options: HashMap<String, String>,
    /// The full line as typed.
    pub raw: String,
    pub flags: HashSet<String>,
}

/// Outcome of a command invocation.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
            data: None,
        }
    }

    pub fn ok_with_message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

/// Progress reporting handle for long-running commands.
///
/// Purely observational: updates go to the host through the log stream.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    snapp_id: String,
    label: String,
}

impl ProgressTracker {
    pub(crate) fn new(snapp_id: &str, label: &str) -> Self {
        Self {
            snapp_id: snapp_id.to_string(),
            label: label.to_string(),
        }
    }

    pub fn update(&self, percent: u8, message: &str) {
        info!(
            snapp = %self.snapp_id,
            task = %self.label,
            percent = percent.min(100),
            "{message}"
        );
    }

    pub fn finish(&self) {
        info!(snapp = %self.snapp_id, task = %self.label, "done");
    }
}

/// Context handed to a command handler.
#[derive(Clone)]
pub struct CommandContext {
    /// The session the command was issued in, when one is active.
    pub session_id: Option<String>,
    /// Sends a line of output back to the issuing shell.
    pub reply: Arc<dyn Fn(&str) + Send + Sync>,
    snapp_id: String,
}

impl CommandContext {
    pub(crate) fn new(
        snapp_id: &str,
        session_id: Option<String>,
        reply: Arc<dyn Fn(&str) + Send + Sync>,
    ) -> Self {
        Self {
            session_id,
            reply,
            snapp_id: snapp_id.to_string(),
        }
    }

    /// Start a progress tracker for a long-running step.
    pub fn progress(&self, label: &str) -> ProgressTracker {
        ProgressTracker::new(&self.snapp_id, label)
    }
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("snapp_id", &self.snapp_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Completion returned by a command handler.
pub type CommandFuture = Pin<Box<dyn Future<Output = anyhow::Result<CommandResult>> + Send>>;

/// A registered command handler.
pub type CommandHandler = Arc<dyn Fn(CommandArgs, CommandContext) -> CommandFuture + Send + Sync>;

/// Wrap an async closure as a [`CommandHandler`].
pub fn command_handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(CommandArgs, CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<CommandResult>> + Send + 'static,
{
    Arc::new(move |args, ctx| Box::pin(f(args, ctx)))
}

/// What an app supplies when registering a command.
#[derive(Clone)]
pub struct CommandSpec {
    /// Bare name; the façade files it under `<app-id>:<name>`.
    pub name: String,
    pub description: String,
    pub handler: CommandHandler,
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tab_event_serializes_with_type_tag() {
        let event = TabEvent {
            kind: UiEventKind::Activated,
            tab_id: "tab_x_1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "activated");
        assert_eq!(json["tabId"], "tab_x_1");
    }

    #[test]
    fn toast_defaults_to_info() {
        let toast: ToastOptions = serde_json::from_str(r#"{"message": "hi"}"#).unwrap();
        assert_eq!(toast.kind, ToastKind::Info);
        assert_eq!(toast.duration_ms, None);
    }
}
