//! Namespaced state persistence with TTL and pluggable cryptography.
//!
//! One store serves every app, partitioned by namespace (default: the app
//! id). Entries live as JSON files under
//! `<base>/<namespace>/<key>.json` (or `.enc` when written through the
//! configured crypto hook) with an in-memory mirror that is authoritative
//! for reads. Expiration is checked lazily on every read path; there is no
//! background sweeper, [`StateStore::clear_expired`] is the explicit
//! compaction entry point.
//!
//! The store is single-process. Concurrent writers to the same key are
//! serialized by the filesystem, last writer wins.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::error::KernelError;
use crate::error::KernelResult;
use crate::now_epoch_ms;

/// Current on-disk entry format.
pub const STATE_FORMAT_VERSION: u32 = 1;

const PLAIN_EXT: &str = "json";
const ENCRYPTED_EXT: &str = "enc";

/// User-provided cryptography hook for encrypted entries.
///
/// `encrypt` receives the serialized entry and its output is written to
/// disk verbatim; `decrypt` must invert it. When no hook is configured the
/// `encrypted` flag is honored silently and entries stay plaintext.
pub trait StateCrypto: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> anyhow::Result<String>;
    fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String>;
}

/// One persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEntry {
    pub value: Value,
    /// Epoch-ms creation time.
    pub created_at: u64,
    /// Epoch-ms expiry; absent entries never expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub encrypted: bool,
    pub version: u32,
}

impl StateEntry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Notification that a key changed, sent to [`StateStore::on_change`]
/// listeners when the writer asked for `sync`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub namespace: String,
    pub key: String,
    pub snapp_id: String,
}

/// A change listener callback.
pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Stable identity of a change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeListenerId(u64);

/// Per-call persistence options.
#[derive(Default)]
pub struct PersistOptions {
    /// Override the namespace (default: the calling app's id).
    pub namespace: Option<String>,
    /// Time to live; the entry expires `ttl` after creation.
    pub ttl: Option<Duration>,
    /// Pipe the serialized entry through the configured crypto hook.
    pub encrypted: bool,
    /// Emit a change event to `on_change` listeners.
    pub sync: bool,
}

/// Aggregate statistics over the currently visible entries of a namespace.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_entries: usize,
    /// Sum of on-disk file sizes, in bytes.
    pub total_size: u64,
    /// Entries that expired between enumeration and inspection.
    pub expired_entries: usize,
    /// Epoch-ms `createdAt` of the oldest visible entry.
    pub oldest_entry: Option<u64>,
    pub newest_entry: Option<u64>,
}

/// Filesystem-backed key/value store with an in-memory mirror.
pub struct StateStore {
    base_path: PathBuf,
    crypto: Option<Arc<dyn StateCrypto>>,
    memory: Mutex<HashMap<String, HashMap<String, StateEntry>>>,
    listeners: Mutex<Vec<(u64, ChangeListener)>>,
    next_listener_id: AtomicU64,
}

impl StateStore {
    /// Create a store rooted at `base_path`. The directory is created lazily
    /// on first persist.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            crypto: None,
            memory: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
        }
    }

    /// Attach a cryptography hook for entries persisted with `encrypted`.
    pub fn with_crypto(mut self, crypto: Arc<dyn StateCrypto>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.base_path.join(sanitize(namespace))
    }

    fn entry_path(&self, namespace: &str, key: &str, ext: &str) -> PathBuf {
        self.namespace_dir(namespace).join(format!("{}.{ext}", sanitize(key)))
    }

    fn resolve_namespace<'a>(snapp_id: &'a str, namespace: Option<&'a str>) -> &'a str {
        namespace.unwrap_or(snapp_id)
    }

    /// Persist a value under `(namespace, key)`.
    ///
    /// Writes the in-memory mirror first, then the file, atomically via a
    /// sibling `.tmp` and rename, owner-only on unix. Parent directories are
    /// created as needed.
    pub async fn persist(
        &self,
        snapp_id: &str,
        key: &str,
        value: Value,
        options: PersistOptions,
    ) -> KernelResult<()> {
        let namespace = options.namespace.as_deref().unwrap_or(snapp_id).to_string();
        let now = now_epoch_ms();
        let use_crypto = options.encrypted && self.crypto.is_some();
        let entry = StateEntry {
            value,
            created_at: now,
            expires_at: options.ttl.map(|ttl| now + ttl.as_millis() as u64),
            encrypted: use_crypto,
            version: STATE_FORMAT_VERSION,
        };

        {
            let mut memory = self.memory.lock().expect("memory mirror poisoned");
            memory
                .entry(namespace.clone())
                .or_default()
                .insert(key.to_string(), entry.clone());
        }

        let store_err = |cause: anyhow::Error| KernelError::Store {
            namespace: namespace.clone(),
            key: key.to_string(),
            cause,
        };

        let mut serialized = serde_json::to_string(&entry)
            .map_err(|e| store_err(anyhow::Error::new(e).context("serialize entry")))?;
        if use_crypto && let Some(crypto) = &self.crypto {
            serialized = crypto.encrypt(&serialized).map_err(&store_err)?;
        }

        let ext = if use_crypto { ENCRYPTED_EXT } else { PLAIN_EXT };
        let path = self.entry_path(&namespace, key, ext);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| store_err(anyhow::Error::new(e).context("create namespace dir")))?;
        }

        let tmp = path.with_extension(format!("{ext}.tmp"));
        tokio::fs::write(&tmp, serialized.as_bytes())
            .await
            .map_err(|e| store_err(anyhow::Error::new(e).context("write entry")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = tokio::fs::set_permissions(&tmp, perms).await {
                warn!(namespace = %namespace, key, error = %e, "could not restrict entry file mode");
            }
        }
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| store_err(anyhow::Error::new(e).context("rename entry into place")))?;

        // Drop a stale counterpart with the other extension so reads cannot
        // resurrect an older value.
        let other_ext = if use_crypto { PLAIN_EXT } else { ENCRYPTED_EXT };
        let _ = tokio::fs::remove_file(self.entry_path(&namespace, key, other_ext)).await;

        debug!(namespace = %namespace, key, encrypted = use_crypto, "state entry persisted");

        if options.sync {
            let event = ChangeEvent {
                namespace,
                key: key.to_string(),
                snapp_id: snapp_id.to_string(),
            };
            let listeners: Vec<ChangeListener> = {
                let listeners = self.listeners.lock().expect("listener list poisoned");
                listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
            };
            for listener in listeners {
                listener(&event);
            }
        }

        Ok(())
    }

    /// Restore the value under `(namespace, key)`, or `None` when missing,
    /// expired, or unreadable.
    ///
    /// The in-memory mirror wins when present; an expired mirror entry is
    /// dropped without falling back to disk. Disk reads probe `.enc` before
    /// `.json` and never raise; corrupt or undecryptable entries are logged
    /// and treated as missing.
    pub async fn restore(
        &self,
        snapp_id: &str,
        key: &str,
        namespace: Option<&str>,
    ) -> Option<Value> {
        let namespace = Self::resolve_namespace(snapp_id, namespace);
        let now = now_epoch_ms();

        {
            let mut memory = self.memory.lock().expect("memory mirror poisoned");
            if let Some(entries) = memory.get_mut(namespace) {
                match entries.get(key) {
                    Some(entry) if entry.is_expired(now) => {
                        entries.remove(key);
                        return None;
                    }
                    Some(entry) => return Some(entry.value.clone()),
                    None => {}
                }
            }
        }

        let entry = self.read_disk_entry(namespace, key).await?;
        if entry.is_expired(now) {
            return None;
        }
        if entry.version != STATE_FORMAT_VERSION {
            warn!(
                namespace,
                key,
                version = entry.version,
                "state entry has unexpected format version"
            );
        }

        let value = entry.value.clone();
        let mut memory = self.memory.lock().expect("memory mirror poisoned");
        memory
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), entry);
        Some(value)
    }

    /// [`StateStore::restore`] with a fallback value.
    pub async fn restore_or(
        &self,
        snapp_id: &str,
        key: &str,
        default: Value,
        namespace: Option<&str>,
    ) -> Value {
        self.restore(snapp_id, key, namespace).await.unwrap_or(default)
    }

    async fn read_disk_entry(&self, namespace: &str, key: &str) -> Option<StateEntry> {
        for ext in [ENCRYPTED_EXT, PLAIN_EXT] {
            let path = self.entry_path(namespace, key, ext);
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(namespace, key, error = %e, "unreadable state entry");
                    return None;
                }
            };
            let decoded = if ext == ENCRYPTED_EXT {
                match &self.crypto {
                    Some(crypto) => match crypto.decrypt(&raw) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            warn!(namespace, key, error = %e, "state entry failed to decrypt");
                            return None;
                        }
                    },
                    // No hook configured: the payload may still be plaintext
                    // from a run without crypto.
                    None => raw,
                }
            } else {
                raw
            };
            match serde_json::from_str::<StateEntry>(&decoded) {
                Ok(entry) => return Some(entry),
                Err(e) => {
                    warn!(namespace, key, error = %e, "corrupt state entry treated as missing");
                    return None;
                }
            }
        }
        None
    }

    /// Delete the entry under `(namespace, key)`. Missing files are fine.
    pub async fn remove(
        &self,
        snapp_id: &str,
        key: &str,
        namespace: Option<&str>,
    ) -> KernelResult<()> {
        let namespace = Self::resolve_namespace(snapp_id, namespace);
        {
            let mut memory = self.memory.lock().expect("memory mirror poisoned");
            if let Some(entries) = memory.get_mut(namespace) {
                entries.remove(key);
            }
        }
        for ext in [PLAIN_EXT, ENCRYPTED_EXT] {
            match tokio::fs::remove_file(self.entry_path(namespace, key, ext)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(KernelError::Store {
                        namespace: namespace.to_string(),
                        key: key.to_string(),
                        cause: anyhow::Error::new(e).context("remove entry"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Keys of all non-expired entries in the namespace. Missing directory
    /// means an empty list.
    pub async fn list_keys(&self, snapp_id: &str, namespace: Option<&str>) -> Vec<String> {
        let namespace = Self::resolve_namespace(snapp_id, namespace);
        let now = now_epoch_ms();
        let mut keys = Vec::new();
        for stem in self.stored_stems(namespace).await {
            if let Some(entry) = self.read_disk_entry(namespace, &stem).await
                && !entry.is_expired(now)
            {
                keys.push(stem);
            }
        }
        keys
    }

    /// File stems present in the namespace directory, deduplicated across
    /// the two extensions.
    async fn stored_stems(&self, namespace: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut stems = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(self.namespace_dir(namespace)).await else {
            return stems;
        };
        while let Ok(Some(dirent)) = entries.next_entry().await {
            let path = dirent.path();
            let is_entry = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == PLAIN_EXT || e == ENCRYPTED_EXT);
            if !is_entry {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && seen.insert(stem.to_string())
            {
                stems.push(stem.to_string());
            }
        }
        stems
    }

    /// Drop the whole namespace: memory and directory.
    pub async fn clear(&self, snapp_id: &str, namespace: Option<&str>) -> KernelResult<()> {
        let namespace = Self::resolve_namespace(snapp_id, namespace);
        self.memory.lock().expect("memory mirror poisoned").remove(namespace);
        match tokio::fs::remove_dir_all(self.namespace_dir(namespace)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KernelError::Store {
                namespace: namespace.to_string(),
                key: String::new(),
                cause: anyhow::Error::new(e).context("remove namespace dir"),
            }),
        }
    }

    /// Remove every expired entry of the namespace. Returns how many were
    /// removed. This is the only operation that inspects expired entries.
    pub async fn clear_expired(&self, snapp_id: &str, namespace: Option<&str>) -> KernelResult<usize> {
        let namespace = Self::resolve_namespace(snapp_id, namespace);
        let now = now_epoch_ms();
        let mut removed = 0;
        for stem in self.stored_stems(namespace).await {
            let Some(entry) = self.read_disk_entry(namespace, &stem).await else {
                continue;
            };
            if entry.is_expired(now) {
                self.remove(snapp_id, &stem, Some(namespace)).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(namespace, removed, "expired state entries cleared");
        }
        Ok(removed)
    }

    /// Aggregate statistics over the namespace's visible entries.
    pub async fn get_stats(&self, snapp_id: &str, namespace: Option<&str>) -> StoreStats {
        let namespace = Self::resolve_namespace(snapp_id, namespace);
        let mut stats = StoreStats::default();
        let now = now_epoch_ms();
        for key in self.list_keys(snapp_id, Some(namespace)).await {
            let Some(entry) = self.read_disk_entry(namespace, &key).await else {
                continue;
            };
            if entry.is_expired(now) {
                stats.expired_entries += 1;
                continue;
            }
            stats.total_entries += 1;
            let ext = if entry.encrypted { ENCRYPTED_EXT } else { PLAIN_EXT };
            if let Ok(meta) = tokio::fs::metadata(self.entry_path(namespace, &key, ext)).await {
                stats.total_size += meta.len();
            }
            stats.oldest_entry = Some(match stats.oldest_entry {
                Some(oldest) => oldest.min(entry.created_at),
                None => entry.created_at,
            });
            stats.newest_entry = Some(match stats.newest_entry {
                Some(newest) => newest.max(entry.created_at),
                None => entry.created_at,
            });
        }
        stats
    }

    /// Subscribe to change events. Returns the id to pass to
    /// [`StateStore::remove_change_listener`].
    pub fn on_change(&self, listener: ChangeListener) -> ChangeListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.listeners.lock().expect("listener list poisoned").push((id, listener));
        ChangeListenerId(id)
    }

    /// Remove a change listener. Returns `true` if it was registered.
    pub fn remove_change_listener(&self, id: ChangeListenerId) -> bool {
        let mut listeners = self.listeners.lock().expect("listener list poisoned");
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id.0);
        before != listeners.len()
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
///
/// Lossy: distinct namespaces or keys may collide after sanitization. Apps
/// are expected to use sane keys.
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde_json::json;

    use super::*;

    /// Reversible toy cipher, good enough to prove the hook wiring.
    struct Base64Crypto;

    impl StateCrypto for Base64Crypto {
        fn encrypt(&self, plaintext: &str) -> anyhow::Result<String> {
            Ok(BASE64.encode(plaintext))
        }

        fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String> {
            let bytes = BASE64.decode(ciphertext)?;
            Ok(String::from_utf8(bytes)?)
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path())
    }

    #[test]
    fn sanitize_replaces_everything_unsafe() {
        assert_eq!(sanitize("plain-key_9"), "plain-key_9");
        assert_eq!(sanitize("a/b c.d"), "a_b_c_d");
        assert_eq!(sanitize("Ünïcode"), "_n_code");
    }

    #[tokio::test]
    async fn persist_then_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let value = json!({ "nested": { "list": [1, 2, 3] }, "ok": true });

        store
            .persist("app", "settings", value.clone(), PersistOptions::default())
            .await
            .unwrap();
        assert_eq!(store.restore("app", "settings", None).await, Some(value));
    }

    #[tokio::test]
    async fn restore_survives_a_fresh_store_instance() {
        let dir = tempfile::tempdir().unwrap();
        store_in(&dir)
            .persist("app", "k", json!(42), PersistOptions::default())
            .await
            .unwrap();

        // New instance, cold memory mirror: must come from disk.
        let store = store_in(&dir);
        assert_eq!(store.restore("app", "k", None).await, Some(json!(42)));
    }

    #[tokio::test]
    async fn restore_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.restore("app", "nope", None).await, None);
        assert_eq!(
            store.restore_or("app", "nope", json!("fallback"), None).await,
            json!("fallback")
        );
    }

    #[tokio::test]
    async fn namespace_defaults_to_app_and_can_be_overridden() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .persist(
                "app",
                "k",
                json!("shared"),
                PersistOptions {
                    namespace: Some("team".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(store.restore("app", "k", None).await, None, "default ns untouched");
        assert_eq!(
            store.restore("other-app", "k", Some("team")).await,
            Some(json!("shared")),
            "any app can read the explicit namespace"
        );
    }

    #[tokio::test]
    async fn ttl_expires_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .persist(
                "a",
                "k",
                json!("v"),
                PersistOptions {
                    ttl: Some(Duration::from_millis(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            store.restore_or("a", "k", json!("d"), None).await,
            json!("d"),
            "expired entry must yield the default"
        );
        assert!(store.list_keys("a", None).await.is_empty());
    }

    #[tokio::test]
    async fn clear_expired_counts_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .persist(
                "a",
                "short",
                json!(1),
                PersistOptions {
                    ttl: Some(Duration::from_millis(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.persist("a", "keep", json!(2), PersistOptions::default()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.clear_expired("a", None).await.unwrap(), 1);
        assert_eq!(store.clear_expired("a", None).await.unwrap(), 0, "second pass is empty");
        assert_eq!(store.list_keys("a", None).await, vec!["keep".to_string()]);
    }

    #[tokio::test]
    async fn remove_deletes_memory_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.persist("a", "k", json!(1), PersistOptions::default()).await.unwrap();
        store.remove("a", "k", None).await.unwrap();
        assert_eq!(store.restore("a", "k", None).await, None);
        // Removing again is not an error.
        store.remove("a", "k", None).await.unwrap();
    }

    #[tokio::test]
    async fn clear_drops_the_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.persist("a", "k1", json!(1), PersistOptions::default()).await.unwrap();
        store.persist("a", "k2", json!(2), PersistOptions::default()).await.unwrap();

        store.clear("a", None).await.unwrap();
        assert!(store.list_keys("a", None).await.is_empty());
        assert_eq!(store.restore("a", "k1", None).await, None);
        // Clearing a namespace that never existed is fine.
        store.clear("ghost", None).await.unwrap();
    }

    #[tokio::test]
    async fn encrypted_entries_round_trip_through_the_hook() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).with_crypto(Arc::new(Base64Crypto));
        store
            .persist(
                "a",
                "secret",
                json!({ "token": "hunter2" }),
                PersistOptions {
                    encrypted: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // The .enc file exists and is not plaintext JSON.
        let enc_path = dir.path().join("a").join("secret.enc");
        let raw = std::fs::read_to_string(&enc_path).unwrap();
        assert!(serde_json::from_str::<Value>(&raw).is_err(), "must not be plain JSON");

        // A cold store with the hook reads it back.
        let store = StateStore::new(dir.path()).with_crypto(Arc::new(Base64Crypto));
        assert_eq!(
            store.restore("a", "secret", None).await,
            Some(json!({ "token": "hunter2" }))
        );
    }

    #[tokio::test]
    async fn encrypted_flag_without_hook_is_honored_silently() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .persist(
                "a",
                "k",
                json!(1),
                PersistOptions {
                    encrypted: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // No hook: written as plaintext .json, readable as usual.
        assert!(dir.path().join("a").join("k.json").exists());
        assert_eq!(store.restore("a", "k", None).await, Some(json!(1)));
    }

    #[tokio::test]
    async fn corrupt_entry_is_treated_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let ns = dir.path().join("a");
        std::fs::create_dir_all(&ns).unwrap();
        std::fs::write(ns.join("bad.json"), "{ definitely not json").unwrap();

        let store = store_in(&dir);
        assert_eq!(store.restore_or("a", "bad", json!("d"), None).await, json!("d"));
    }

    #[tokio::test]
    async fn version_mismatch_warns_but_returns_the_value() {
        let dir = tempfile::tempdir().unwrap();
        let ns = dir.path().join("a");
        std::fs::create_dir_all(&ns).unwrap();
        std::fs::write(
            ns.join("old.json"),
            r#"{"value": "vintage", "createdAt": 5, "encrypted": false, "version": 0}"#,
        )
        .unwrap();

        let store = store_in(&dir);
        assert_eq!(store.restore("a", "old", None).await, Some(json!("vintage")));
    }

    #[tokio::test]
    async fn get_stats_reflects_visible_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.persist("a", "k1", json!(1), PersistOptions::default()).await.unwrap();
        store.persist("a", "k2", json!("two"), PersistOptions::default()).await.unwrap();

        let stats = store.get_stats("a", None).await;
        assert_eq!(stats.total_entries, 2);
        assert!(stats.total_size > 0);
        assert_eq!(stats.expired_entries, 0);
        assert!(stats.oldest_entry.is_some());
        assert!(stats.newest_entry.unwrap() >= stats.oldest_entry.unwrap());

        let empty = store.get_stats("a", Some("empty-ns")).await;
        assert_eq!(empty.total_entries, 0);
        assert_eq!(empty.oldest_entry, None);
    }

    #[tokio::test]
    async fn sync_persist_notifies_change_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let events: Arc<Mutex<Vec<ChangeEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let id = store.on_change(Arc::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));

        store
            .persist(
                "app",
                "k",
                json!(1),
                PersistOptions {
                    sync: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // Without sync, no event.
        store.persist("app", "quiet", json!(2), PersistOptions::default()).await.unwrap();

        {
            let events = events.lock().unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].namespace, "app");
            assert_eq!(events[0].key, "k");
            assert_eq!(events[0].snapp_id, "app");
        }

        assert!(store.remove_change_listener(id));
        assert!(!store.remove_change_listener(id));
    }

    #[tokio::test]
    async fn unsafe_keys_are_sanitized_onto_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .persist("app", "path/like key", json!(1), PersistOptions::default())
            .await
            .unwrap();

        assert!(dir.path().join("app").join("path_like_key.json").exists());
        assert_eq!(store.restore("app", "path/like key", None).await, Some(json!(1)));
    }
}
