//! In-process message bus: channel pub/sub and named-method RPC.
//!
//! Pub/sub delivers to subscribers synchronously in subscription order;
//! a failing subscriber is logged and skipped. RPC uses a dedicated call
//! table keyed by `(app, method)` and resolves the caller's completion
//! directly, bounded by a timeout; the pub/sub layer stays unidirectional.
//! Every request is still mirrored as an envelope on the reserved
//! `rpc:<app>:<method>` channel so observers can watch the traffic.
//!
//! A request for an app with no registrations at all waits out its timeout
//! (the target may simply not have started yet); a request for a known app
//! but unknown method is rejected immediately.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use tokio::sync::Notify;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::error::KernelError;
use crate::error::KernelResult;

/// Default RPC timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

/// A channel subscriber. Invoked with the message and the sender's app id.
pub type BusHandler = Arc<dyn Fn(&Value, Option<&str>) -> anyhow::Result<()> + Send + Sync>;

/// Completion returned by a method handler.
pub type MethodFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// A registered RPC method. Invoked with the request payload and sender.
pub type MethodHandler = Arc<dyn Fn(Value, Option<String>) -> MethodFuture + Send + Sync>;

/// Wrap an async closure as a [`MethodHandler`].
pub fn method_handler<F, Fut>(f: F) -> MethodHandler
where
    F: Fn(Value, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |payload, sender| Box::pin(f(payload, sender)))
}

/// Stable identity of a channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscription {
    id: u64,
    subscriber: Option<String>,
    once: bool,
    handler: BusHandler,
}

/// The reserved channel name mirroring requests for `(app, method)`.
pub fn rpc_channel(app: &str, method: &str) -> String {
    format!("rpc:{app}:{method}")
}

/// In-process pub/sub and RPC broker.
#[derive(Default)]
pub struct MessageBus {
    channels: Mutex<HashMap<String, Vec<Subscription>>>,
    methods: Mutex<HashMap<String, HashMap<String, MethodHandler>>>,
    method_added: Notify,
    next_id: AtomicU64,
}

enum MethodLookup {
    Found(MethodHandler),
    UnknownMethod,
    AppAbsent,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a channel. Returns the id to pass to
    /// [`MessageBus::unsubscribe`].
    pub fn subscribe(
        &self,
        channel: &str,
        handler: BusHandler,
        subscriber: Option<&str>,
    ) -> SubscriptionId {
        self.insert(channel, handler, subscriber, false)
    }

    /// Subscribe for exactly one delivery.
    pub fn subscribe_once(
        &self,
        channel: &str,
        handler: BusHandler,
        subscriber: Option<&str>,
    ) -> SubscriptionId {
        self.insert(channel, handler, subscriber, true)
    }

    fn insert(
        &self,
        channel: &str,
        handler: BusHandler,
        subscriber: Option<&str>,
        once: bool,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut channels = self.channels.lock().expect("channel table poisoned");
        channels.entry(channel.to_string()).or_default().push(Subscription {
            id,
            subscriber: subscriber.map(str::to_string),
            once,
            handler,
        });
        debug!(channel, subscriber, subscription_id = id, "bus subscription added");
        SubscriptionId(id)
    }

    /// Remove a subscription. Returns `true` if it was still registered.
    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> bool {
        let mut channels = self.channels.lock().expect("channel table poisoned");
        let Some(subs) = channels.get_mut(channel) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|sub| sub.id != id.0);
        before != subs.len()
    }

    /// Deliver a message to every subscriber of a channel, in subscription
    /// order. Subscriber failures are logged and do not stop delivery.
    pub fn publish(&self, channel: &str, message: &Value, sender: Option<&str>) {
        let snapshot: Vec<Subscription> = {
            let channels = self.channels.lock().expect("channel table poisoned");
            channels.get(channel).cloned().unwrap_or_default()
        };
        if snapshot.is_empty() {
            return;
        }

        let mut fired_once: Vec<u64> = Vec::new();
        for sub in &snapshot {
            if sub.once {
                fired_once.push(sub.id);
            }
            if let Err(e) = (sub.handler)(message, sender) {
                warn!(
                    channel,
                    subscriber = sub.subscriber.as_deref(),
                    error = %e,
                    "bus subscriber failed"
                );
            }
        }

        if !fired_once.is_empty() {
            let mut channels = self.channels.lock().expect("channel table poisoned");
            if let Some(subs) = channels.get_mut(channel) {
                // Delete in reverse index order so earlier indices stay valid.
                let positions: Vec<usize> = subs
                    .iter()
                    .enumerate()
                    .filter(|(_, sub)| fired_once.contains(&sub.id))
                    .map(|(i, _)| i)
                    .collect();
                for i in positions.into_iter().rev() {
                    subs.remove(i);
                }
            }
        }
    }

    /// Number of current subscribers on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .expect("channel table poisoned")
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Register an RPC method under `app`. Replaces a previous handler for
    /// the same `(app, method)`.
    pub fn register_method(&self, app: &str, method: &str, handler: MethodHandler) {
        let mut methods = self.methods.lock().expect("method table poisoned");
        methods
            .entry(app.to_string())
            .or_default()
            .insert(method.to_string(), handler);
        debug!(app, method, "rpc method registered");
        self.method_added.notify_waiters();
    }

    /// Remove an RPC method. Returns `true` if it was registered.
    pub fn unregister_method(&self, app: &str, method: &str) -> bool {
        let mut methods = self.methods.lock().expect("method table poisoned");
        let Some(table) = methods.get_mut(app) else {
            return false;
        };
        let removed = table.remove(method).is_some();
        if table.is_empty() {
            methods.remove(app);
        }
        removed
    }

    fn lookup(&self, app: &str, method: &str) -> MethodLookup {
        let methods = self.methods.lock().expect("method table poisoned");
        match methods.get(app) {
            Some(table) => match table.get(method) {
                Some(handler) => MethodLookup::Found(Arc::clone(handler)),
                None => MethodLookup::UnknownMethod,
            },
            None => MethodLookup::AppAbsent,
        }
    }

    /// Call `method` on `target` with the default timeout.
    pub async fn request(
        &self,
        target: &str,
        method: &str,
        payload: Value,
        sender: Option<&str>,
    ) -> KernelResult<Value> {
        self.request_with_timeout(target, method, payload, sender, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// Call `method` on `target`, waiting at most `timeout` for the result.
    ///
    /// The request envelope `{ requestId, payload, sender }` is mirrored on
    /// the reserved `rpc:<target>:<method>` channel before dispatch. A known
    /// app without the method rejects with [`KernelError::UnknownMethod`];
    /// an absent app is awaited until a registration appears or the timeout
    /// rejects with [`KernelError::RequestTimeout`].
    pub async fn request_with_timeout(
        &self,
        target: &str,
        method: &str,
        payload: Value,
        sender: Option<&str>,
        timeout: Duration,
    ) -> KernelResult<Value> {
        let request_id = Uuid::new_v4().to_string();
        self.publish(
            &rpc_channel(target, method),
            &json!({ "requestId": request_id, "payload": payload.clone(), "sender": sender }),
            sender,
        );

        let sender_owned = sender.map(str::to_string);
        let call = async {
            let handler = loop {
                let registered = self.method_added.notified();
                match self.lookup(target, method) {
                    MethodLookup::Found(handler) => break Ok(handler),
                    MethodLookup::UnknownMethod => {
                        break Err(KernelError::UnknownMethod {
                            app: target.to_string(),
                            method: method.to_string(),
                        });
                    }
                    MethodLookup::AppAbsent => registered.await,
                }
            }?;
            handler(payload.clone(), sender_owned.clone())
                .await
                .map_err(|cause| KernelError::MethodFailure {
                    app: target.to_string(),
                    method: method.to_string(),
                    cause,
                })
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => {
                debug!(app = target, method, request_id = %request_id, "rpc request finished");
                result
            }
            Err(_) => Err(KernelError::RequestTimeout {
                app: target.to_string(),
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Drop every subscription and method registration.
    pub fn clear(&self) {
        self.channels.lock().expect("channel table poisoned").clear();
        self.methods.lock().expect("method table poisoned").clear();
        // Wake pending requests so they re-check and wait out their timeout.
        self.method_added.notify_waiters();
    }
}
