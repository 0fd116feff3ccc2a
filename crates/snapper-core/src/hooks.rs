//! Hook router: priority-ordered dispatch of host lifecycle events.
//!
//! The host emits a fixed set of session and tool events; apps subscribe
//! with a priority and an optional filter predicate. Within a single emit,
//! handlers run strictly in descending priority order (insertion order
//! among equals) and each is awaited before the next begins. A failing
//! handler is logged and skipped; one bad subscriber must not block the
//! event chain.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

/// The closed set of host lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookName {
    SessionStart,
    SessionEnd,
    BeforeAgent,
    AfterAgent,
    BeforeTool,
    AfterTool,
    ToolError,
}

impl HookName {
    pub const ALL: [HookName; 7] = [
        HookName::SessionStart,
        HookName::SessionEnd,
        HookName::BeforeAgent,
        HookName::AfterAgent,
        HookName::BeforeTool,
        HookName::AfterTool,
        HookName::ToolError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HookName::SessionStart => "session_start",
            HookName::SessionEnd => "session_end",
            HookName::BeforeAgent => "before_agent",
            HookName::AfterAgent => "after_agent",
            HookName::BeforeTool => "before_tool",
            HookName::AfterTool => "after_tool",
            HookName::ToolError => "tool_error",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload for each hook. The variant fixes the event, so a payload
/// can never be emitted on the wrong hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum HookPayload {
    SessionStart {
        session_id: String,
    },
    SessionEnd {
        session_id: String,
    },
    BeforeAgent {
        session_id: String,
        prompt: String,
    },
    AfterAgent {
        session_id: String,
        response: String,
    },
    BeforeTool {
        session_id: String,
        tool: String,
        args: Value,
    },
    AfterTool {
        session_id: String,
        tool: String,
        result: Value,
    },
    ToolError {
        session_id: String,
        tool: String,
        error: String,
    },
}

impl HookPayload {
    /// The hook this payload belongs to.
    pub fn hook(&self) -> HookName {
        match self {
            HookPayload::SessionStart { .. } => HookName::SessionStart,
            HookPayload::SessionEnd { .. } => HookName::SessionEnd,
            HookPayload::BeforeAgent { .. } => HookName::BeforeAgent,
            HookPayload::AfterAgent { .. } => HookName::AfterAgent,
            HookPayload::BeforeTool { .. } => HookName::BeforeTool,
            HookPayload::AfterTool { .. } => HookName::AfterTool,
            HookPayload::ToolError { .. } => HookName::ToolError,
        }
    }

    /// Every payload carries the session it happened in.
    pub fn session_id(&self) -> &str {
        match self {
            HookPayload::SessionStart { session_id }
            | HookPayload::SessionEnd { session_id }
            | HookPayload::BeforeAgent { session_id, .. }
            | HookPayload::AfterAgent { session_id, .. }
            | HookPayload::BeforeTool { session_id, .. }
            | HookPayload::AfterTool { session_id, .. }
            | HookPayload::ToolError { session_id, .. } => session_id,
        }
    }
}

/// Completion returned by a hook handler.
pub type HookFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A subscribed hook handler. Sync subscribers return a ready future;
/// either way the router awaits it before moving to the next handler.
pub type HookHandler = Arc<dyn Fn(HookPayload) -> HookFuture + Send + Sync>;

/// Predicate deciding whether a handler sees a given payload.
pub type HookFilter = Arc<dyn Fn(&HookPayload) -> bool + Send + Sync>;

/// Wrap an async closure as a [`HookHandler`].
pub fn hook_handler<F, Fut>(f: F) -> HookHandler
where
    F: Fn(HookPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

/// Stable identity of a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandlerId(u64);

/// Subscription options: dispatch priority and an optional payload filter.
#[derive(Default)]
pub struct HookOptions {
    /// Higher runs earlier. Default 0.
    pub priority: i32,
    pub filter: Option<HookFilter>,
}

impl HookOptions {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: HookFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    priority: i32,
    filter: Option<HookFilter>,
    handler: HookHandler,
    once: bool,
}

/// Routes host lifecycle events to priority-ordered subscriber lists.
#[derive(Default)]
pub struct HookRouter {
    handlers: Mutex<HashMap<HookName, Vec<HandlerEntry>>>,
    next_id: AtomicU64,
}

impl HookRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler. Returns the id to pass to [`HookRouter::off`].
    pub fn on(&self, hook: HookName, handler: HookHandler, options: HookOptions) -> HookHandlerId {
        self.insert(hook, handler, options, false)
    }

    /// Subscribe a handler that removes itself after its first invocation.
    pub fn once(&self, hook: HookName, handler: HookHandler) -> HookHandlerId {
        self.insert(hook, handler, HookOptions::default(), true)
    }

    fn insert(
        &self,
        hook: HookName,
        handler: HookHandler,
        options: HookOptions,
        once: bool,
    ) -> HookHandlerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut handlers = self.handlers.lock().expect("handler table poisoned");
        let list = handlers.entry(hook).or_default();
        list.push(HandlerEntry {
            id,
            priority: options.priority,
            filter: options.filter,
            handler,
            once,
        });
        // Stable sort keeps insertion order among equal priorities.
        list.sort_by_key(|entry| std::cmp::Reverse(entry.priority));
        debug!(hook = %hook, handler_id = id, priority = options.priority, "hook handler added");
        HookHandlerId(id)
    }

    /// Remove a subscription. Returns `true` if it was still registered.
    pub fn off(&self, hook: HookName, id: HookHandlerId) -> bool {
        let mut handlers = self.handlers.lock().expect("handler table poisoned");
        let Some(list) = handlers.get_mut(&hook) else {
            return false;
        };
        let before = list.len();
        list.retain(|entry| entry.id != id.0);
        before != list.len()
    }

    /// Emit a payload to every matching subscriber of its hook.
    ///
    /// Handlers run sequentially in priority order; each is awaited before
    /// the next starts. Handler failures are logged and do not stop the
    /// chain. One-shot handlers are removed after their first delivery.
    pub async fn emit(&self, payload: HookPayload) {
        let hook = payload.hook();
        let snapshot: Vec<HandlerEntry> = {
            let handlers = self.handlers.lock().expect("handler table poisoned");
            handlers.get(&hook).cloned().unwrap_or_default()
        };
        if snapshot.is_empty() {
            return;
        }

        let mut fired_once: Vec<u64> = Vec::new();
        for entry in &snapshot {
            if let Some(filter) = &entry.filter
                && !filter(&payload)
            {
                continue;
            }
            if entry.once {
                fired_once.push(entry.id);
            }
            if let Err(e) = (entry.handler)(payload.clone()).await {
                warn!(hook = %hook, handler_id = entry.id, error = %e, "hook handler failed");
            }
        }

        if !fired_once.is_empty() {
            let mut handlers = self.handlers.lock().expect("handler table poisoned");
            if let Some(list) = handlers.get_mut(&hook) {
                list.retain(|entry| !fired_once.contains(&entry.id));
            }
        }
    }

    /// Drop subscriptions for one hook, or all of them.
    pub fn clear(&self, hook: Option<HookName>) {
        let mut handlers = self.handlers.lock().expect("handler table poisoned");
        match hook {
            Some(hook) => {
                handlers.remove(&hook);
            }
            None => handlers.clear(),
        }
    }

    pub fn has_handlers(&self, hook: HookName) -> bool {
        self.count(hook) > 0
    }

    pub fn count(&self, hook: HookName) -> usize {
        self.handlers
            .lock()
            .expect("handler table poisoned")
            .get(&hook)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_start(id: &str) -> HookPayload {
        HookPayload::SessionStart {
            session_id: id.to_string(),
        }
    }

    fn recording_handler(log: Arc<Mutex<Vec<i32>>>, tag: i32) -> HookHandler {
        hook_handler(move |_payload| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(tag);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn handlers_run_in_descending_priority_order() {
        let router = HookRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for priority in [1, 3, 2] {
            router.on(
                HookName::SessionStart,
                recording_handler(Arc::clone(&log), priority),
                HookOptions::priority(priority),
            );
        }

        router.emit(session_start("s")).await;
        assert_eq!(*log.lock().unwrap(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn equal_priorities_keep_insertion_order() {
        let router = HookRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in [10, 20, 30] {
            router.on(
                HookName::SessionStart,
                recording_handler(Arc::clone(&log), tag),
                HookOptions::default(),
            );
        }
        router.emit(session_start("s")).await;
        assert_eq!(*log.lock().unwrap(), vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_siblings() {
        let router = HookRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.on(
            HookName::SessionStart,
            hook_handler(|_| async { anyhow::bail!("subscriber bug") }),
            HookOptions::priority(10),
        );
        router.on(
            HookName::SessionStart,
            recording_handler(Arc::clone(&log), 1),
            HookOptions::default(),
        );

        router.emit(session_start("s")).await;
        assert_eq!(*log.lock().unwrap(), vec![1], "sibling must still run");
    }

    #[tokio::test]
    async fn filter_skips_non_matching_payloads() {
        let router = HookRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let options = HookOptions::default()
            .with_filter(Arc::new(|payload| payload.session_id() == "wanted"));
        router.on(
            HookName::SessionStart,
            recording_handler(Arc::clone(&log), 1),
            options,
        );

        router.emit(session_start("other")).await;
        assert!(log.lock().unwrap().is_empty());
        router.emit(session_start("wanted")).await;
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn once_delivers_exactly_once() {
        let router = HookRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.once(HookName::SessionEnd, recording_handler(Arc::clone(&log), 7));

        router
            .emit(HookPayload::SessionEnd {
                session_id: "s".to_string(),
            })
            .await;
        router
            .emit(HookPayload::SessionEnd {
                session_id: "s".to_string(),
            })
            .await;

        assert_eq!(*log.lock().unwrap(), vec![7]);
        assert_eq!(router.count(HookName::SessionEnd), 0);
    }

    #[tokio::test]
    async fn off_removes_a_subscription() {
        let router = HookRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = router.on(
            HookName::BeforeTool,
            recording_handler(Arc::clone(&log), 1),
            HookOptions::default(),
        );

        assert!(router.off(HookName::BeforeTool, id));
        assert!(!router.off(HookName::BeforeTool, id), "second off is a no-op");

        router
            .emit(HookPayload::BeforeTool {
                session_id: "s".to_string(),
                tool: "grep".to_string(),
                args: Value::Null,
            })
            .await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_and_accessors() {
        let router = HookRouter::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        router.on(
            HookName::SessionStart,
            recording_handler(Arc::clone(&log), 1),
            HookOptions::default(),
        );
        router.on(
            HookName::SessionEnd,
            recording_handler(Arc::clone(&log), 2),
            HookOptions::default(),
        );

        assert!(router.has_handlers(HookName::SessionStart));
        router.clear(Some(HookName::SessionStart));
        assert!(!router.has_handlers(HookName::SessionStart));
        assert!(router.has_handlers(HookName::SessionEnd));

        router.clear(None);
        assert!(!router.has_handlers(HookName::SessionEnd));
    }

    #[test]
    fn payload_serializes_with_hook_tag() {
        let json = serde_json::to_value(session_start("s")).unwrap();
        assert_eq!(json["hook"], "session_start");
        assert_eq!(json["session_id"], "s");
    }
}
