use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::config::KeystoreConfig;
use crate::error::{BackendError, KeystoreError, Result};
use crate::keystore::backend::MessageBackend;
use crate::keystore::codec;
use crate::keystore::debounce::Debouncer;
use crate::keystore::index::{self, LoadedStore, ScanOptions};

/// Source of write timestamps (unix milliseconds).
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

#[derive(Debug, Clone)]
struct StoreEntry {
    data: JsonValue,
    backing_message_ids: Vec<u64>,
    dirty: bool,
    /// Bumped on every write; a sync only clears `dirty` if it is unchanged.
    revision: u64,
}

impl StoreEntry {
    fn empty() -> Self {
        Self {
            data: json!({}),
            backing_message_ids: Vec::new(),
            dirty: true,
            revision: 1,
        }
    }

    fn loaded(store: LoadedStore) -> Self {
        Self {
            data: store.data,
            backing_message_ids: store.backing_message_ids,
            dirty: false,
            revision: 0,
        }
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.revision += 1;
    }
}

/// Summary of the in-memory table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeystoreStats {
    pub total_stores: usize,
    pub dirty_stores: usize,
    /// Sum of the serialized JSON length of every store.
    pub total_size_bytes: usize,
}

/// Outcome of one `sync` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Another sync was already running; nothing was done.
    pub skipped: bool,
    pub synced: Vec<String>,
    pub failed: Vec<String>,
    pub messages_sent: usize,
    pub messages_deleted: usize,
}

impl SyncReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        !self.skipped && self.failed.is_empty()
    }
}

/// Inserts `write_delay` between consecutive channel writes.
struct Pacer {
    delay: Duration,
    first: bool,
}

impl Pacer {
    fn new(delay: Duration) -> Self {
        Self { delay, first: true }
    }

    async fn wait(&mut self) {
        if !self.first && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.first = false;
    }
}

/// Resets the in-flight flag even if the sync future is dropped.
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Named JSON stores persisted as messages in one Discord channel.
///
/// Reads and writes are served from memory. Dirty stores are flushed by a
/// periodic task started in [`initialize`](Self::initialize), by
/// [`sync_soon`](Self::sync_soon), or explicitly with [`sync`](Self::sync).
///
/// Values handed out are copies. Callers that read, modify and write back
/// should go through [`update_store`](Self::update_store) or hold
/// [`lock_store`](Self::lock_store) so that two handlers in this process
/// cannot interleave on the same store.
pub struct Keystore {
    backend: Option<Arc<dyn MessageBackend>>,
    config: KeystoreConfig,
    clock: Clock,
    stores: Mutex<BTreeMap<String, StoreEntry>>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    syncing: AtomicBool,
    initialized: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    debounce: Debouncer,
}

impl fmt::Debug for Keystore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keystore")
            .field("backend", &self.backend)
            .field("channel_id", &self.config.channel_id)
            .field("stores", &self.stores.lock().len())
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish()
    }
}

impl Keystore {
    /// Build a keystore over `backend`. Nothing touches the network until
    /// [`initialize`](Self::initialize).
    pub fn new(backend: Arc<dyn MessageBackend>, config: KeystoreConfig) -> Self {
        Self::build(Some(backend), config)
    }

    /// A memory-only keystore. Writes are kept for the life of the process
    /// and `sync` does nothing.
    pub fn detached(config: KeystoreConfig) -> Self {
        Self::build(None, config)
    }

    fn build(backend: Option<Arc<dyn MessageBackend>>, config: KeystoreConfig) -> Self {
        Self {
            backend,
            config,
            clock: Arc::new(|| chrono::Utc::now().timestamp_millis()),
            stores: Mutex::new(BTreeMap::new()),
            locks: DashMap::new(),
            syncing: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            timer: Mutex::new(None),
            debounce: Debouncer::new(),
        }
    }

    /// Replace the write-timestamp source.
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.backend.is_some()
    }

    pub fn config(&self) -> &KeystoreConfig {
        &self.config
    }

    fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            history_limit: self.config.history_limit,
            write_delay: self.config.write_delay(),
        }
    }

    fn target(&self) -> Result<Option<(&Arc<dyn MessageBackend>, u64)>> {
        match &self.backend {
            None => Ok(None),
            Some(backend) => {
                let channel_id = self.config.channel_id.ok_or(KeystoreError::NoChannel)?;
                Ok(Some((backend, channel_id)))
            }
        }
    }

    /// Resolve the channel, load every store from it and start the
    /// periodic flush.
    ///
    /// Errors here mean persistence is unavailable. The caller decides
    /// whether to continue on a [`detached`](Self::detached) keystore.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            tracing::warn!("Keystore already initialized");
            return Ok(());
        }

        let Some((backend, channel_id)) = self.target()? else {
            tracing::info!("Keystore running without persistence");
            self.initialized.store(true, Ordering::Release);
            return Ok(());
        };

        let channel = backend
            .resolve_channel(channel_id)
            .await
            .map_err(|cause| KeystoreError::ChannelUnavailable { channel_id, cause })?;
        if !channel.text_capable {
            return Err(KeystoreError::NotTextChannel {
                channel_id,
                name: channel.name,
            });
        }

        let reconstruction =
            index::reconstruct(backend.as_ref(), channel_id, &self.scan_options()).await?;
        let loaded = reconstruction.stores.len();
        self.apply_loaded(reconstruction.stores);

        self.start_timer();
        self.initialized.store(true, Ordering::Release);
        tracing::info!(
            "Keystore initialized: {} store(s) loaded from #{}",
            loaded,
            channel.name
        );
        Ok(())
    }

    /// Loaded stores replace clean entries. Dirty entries hold writes that
    /// have not reached the channel yet and keep their value.
    fn apply_loaded(&self, loaded: BTreeMap<String, LoadedStore>) {
        let mut stores = self.stores.lock();
        for (name, store) in loaded {
            match stores.get_mut(&name) {
                Some(entry) if entry.dirty => {
                    entry.backing_message_ids = store.backing_message_ids;
                }
                _ => {
                    stores.insert(name, StoreEntry::loaded(store));
                }
            }
        }
    }

    fn start_timer(self: &Arc<Self>) {
        let period = self.config.sync_interval();
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(keystore) = weak.upgrade() else {
                    break;
                };
                let report = keystore.sync(false).await;
                if !report.failed.is_empty() {
                    tracing::warn!(
                        "Periodic sync left {} store(s) dirty: {:?}",
                        report.failed.len(),
                        report.failed
                    );
                }
            }
        });
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    /// A copy of the store's data. An absent store is created as `{}`.
    pub fn get_store(&self, name: &str) -> JsonValue {
        let mut stores = self.stores.lock();
        stores
            .entry(name.to_string())
            .or_insert_with(StoreEntry::empty)
            .data
            .clone()
    }

    /// Deserialize a store into `T`.
    pub fn get_typed<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        Ok(serde_json::from_value(self.get_store(name))?)
    }

    /// Replace a store's data and mark it dirty.
    pub fn set_store(&self, name: &str, data: JsonValue) {
        let mut stores = self.stores.lock();
        let entry = stores
            .entry(name.to_string())
            .or_insert_with(StoreEntry::empty);
        entry.data = data;
        entry.touch();
    }

    pub fn set_typed<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        self.set_store(name, serde_json::to_value(value)?);
        Ok(())
    }

    /// Force a store dirty.
    pub fn mark_dirty(&self, name: &str) {
        let mut stores = self.stores.lock();
        stores
            .entry(name.to_string())
            .or_insert_with(StoreEntry::empty)
            .touch();
    }

    /// The per-store lock used by [`update_store`](Self::update_store).
    ///
    /// Hold it across a get/modify/set sequence that needs to await in
    /// between. Do not call `update_store` on the same store while holding it.
    pub async fn lock_store(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(name.to_string()).or_default().value().clone();
        lock.lock_owned().await
    }

    /// Read-modify-write under the store's lock. The store is only written
    /// (and marked dirty) if `f` changed it.
    pub async fn update_store<F, R>(&self, name: &str, f: F) -> R
    where
        F: FnOnce(&mut JsonValue) -> R,
    {
        let _guard = self.lock_store(name).await;
        let before = self.get_store(name);
        let mut data = before.clone();
        let result = f(&mut data);
        if data != before {
            self.set_store(name, data);
        }
        result
    }

    /// Flush dirty stores (all stores when `force`) to the channel.
    ///
    /// Each store's existing records are found by a live scan, deleted, and
    /// replaced by the new encoding. Only one sync runs at a time; a call
    /// made while another is in flight returns a skipped report.
    ///
    /// Nothing is written before [`initialize`](Self::initialize) succeeds,
    /// so placeholder stores cannot overwrite what the channel holds.
    pub async fn sync(&self, force: bool) -> SyncReport {
        let (backend, channel_id) = match self.target() {
            Ok(Some(target)) => target,
            Ok(None) => return SyncReport::default(),
            Err(e) => {
                tracing::error!("Keystore sync impossible: {}", e);
                return SyncReport::default();
            }
        };
        if !self.initialized.load(Ordering::Acquire) {
            tracing::warn!("Cannot sync: keystore not initialized");
            return SyncReport::default();
        }

        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Sync already in progress, skipping");
            return SyncReport::skipped();
        }
        let _guard = SyncGuard(&self.syncing);

        let pending: Vec<(String, JsonValue, u64)> = {
            let stores = self.stores.lock();
            stores
                .iter()
                .filter(|(_, entry)| force || entry.dirty)
                .map(|(name, entry)| (name.clone(), entry.data.clone(), entry.revision))
                .collect()
        };

        let mut report = SyncReport::default();
        if pending.is_empty() {
            return report;
        }

        let mut pacer = Pacer::new(self.config.write_delay());
        for (name, data, revision) in pending {
            match self
                .flush_store(backend.as_ref(), channel_id, &name, &data, &mut pacer, &mut report)
                .await
            {
                Ok((message_ids, leftovers)) => {
                    let mut stores = self.stores.lock();
                    if let Some(entry) = stores.get_mut(&name) {
                        entry.backing_message_ids = message_ids;
                        if leftovers == 0 && entry.revision == revision {
                            entry.dirty = false;
                        }
                    }
                    if leftovers == 0 {
                        report.synced.push(name);
                    } else {
                        // Stays dirty so the next live scan retries the deletes
                        tracing::warn!(
                            "Store \"{}\" written but {} old record(s) remain",
                            name,
                            leftovers
                        );
                        report.failed.push(name);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to sync store \"{}\": {}", name, e);
                    report.failed.push(name);
                }
            }
        }

        tracing::info!(
            "Keystore sync: {} store(s) written, {} failed, {} message(s) sent, {} deleted",
            report.synced.len(),
            report.failed.len(),
            report.messages_sent,
            report.messages_deleted
        );
        report
    }

    async fn flush_store(
        &self,
        backend: &dyn MessageBackend,
        channel_id: u64,
        name: &str,
        data: &JsonValue,
        pacer: &mut Pacer,
        report: &mut SyncReport,
    ) -> Result<(Vec<u64>, usize)> {
        let timestamp = (self.clock)();
        let records = codec::encode(name, data, timestamp, self.config.max_message_size)?;

        // Live scan: catches records another instance wrote since we loaded
        let messages = backend
            .fetch_recent_messages(channel_id, self.config.history_limit)
            .await?;
        let (existing, _) = index::collect_records(messages, backend.self_id());
        let mut leftovers = 0;
        for (message_id, record) in existing {
            if record.store != name {
                continue;
            }
            pacer.wait().await;
            match backend.delete_message(channel_id, message_id).await {
                Ok(()) | Err(BackendError::NotFound(_)) => report.messages_deleted += 1,
                Err(e) => {
                    tracing::warn!(
                        "Failed to delete old record {} of store \"{}\": {}",
                        message_id,
                        name,
                        e
                    );
                    leftovers += 1;
                }
            }
        }

        let mut message_ids = Vec::with_capacity(records.len());
        for record in &records {
            pacer.wait().await;
            let id = backend
                .send_message(channel_id, &record.to_content()?)
                .await?;
            report.messages_sent += 1;
            message_ids.push(id);
        }
        tracing::debug!(
            "Saved store \"{}\" in {} part(s)",
            name,
            message_ids.len()
        );
        Ok((message_ids, leftovers))
    }

    /// Schedule a `sync(false)` after the configured debounce delay,
    /// replacing any flush already scheduled this way.
    pub fn sync_soon(self: &Arc<Self>) {
        if !self.is_persistent() {
            return;
        }
        let weak = Arc::downgrade(self);
        self.debounce
            .schedule(self.config.flush_debounce(), async move {
                if let Some(keystore) = weak.upgrade() {
                    keystore.sync(false).await;
                }
            });
    }

    /// Reload stores from the channel. Dirty stores keep their in-memory
    /// value. Returns the number of stores found.
    pub async fn reload(&self) -> Result<usize> {
        let Some((backend, channel_id)) = self.target()? else {
            return Ok(0);
        };
        let reconstruction =
            index::reconstruct(backend.as_ref(), channel_id, &self.scan_options()).await?;
        let found = reconstruction.stores.len();
        self.apply_loaded(reconstruction.stores);
        tracing::info!("Keystore reloaded: {} store(s)", found);
        Ok(found)
    }

    /// Delete every record of every store from the channel and drop all
    /// in-memory stores. Returns the number of messages deleted.
    pub async fn clear_all(&self) -> Result<usize> {
        let mut deleted = 0;
        if let Some((backend, channel_id)) = self.target()? {
            let messages = backend
                .fetch_recent_messages(channel_id, self.config.history_limit)
                .await?;
            let (records, _) = index::collect_records(messages, backend.self_id());
            let mut pacer = Pacer::new(self.config.write_delay());
            for (message_id, _) in records {
                pacer.wait().await;
                match backend.delete_message(channel_id, message_id).await {
                    Ok(()) => deleted += 1,
                    Err(e) => tracing::warn!("Failed to delete record {}: {}", message_id, e),
                }
            }
        }
        self.stores.lock().clear();
        tracing::info!("Keystore cleared: {} message(s) deleted", deleted);
        Ok(deleted)
    }

    /// Stop background flushing and write every store one last time.
    pub async fn shutdown(&self) -> SyncReport {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        self.debounce.cancel();

        // A tick may be mid-flight; let it finish rather than skip the final flush
        while self.syncing.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let report = self.sync(true).await;
        tracing::info!("Keystore shut down");
        report
    }

    pub fn stats(&self) -> KeystoreStats {
        let stores = self.stores.lock();
        KeystoreStats {
            total_stores: stores.len(),
            dirty_stores: stores.values().filter(|entry| entry.dirty).count(),
            total_size_bytes: stores
                .values()
                .map(|entry| entry.data.to_string().len())
                .sum(),
        }
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.stores
            .lock()
            .get(name)
            .is_some_and(|entry| entry.dirty)
    }

    /// Names of all stores currently held in memory.
    pub fn store_names(&self) -> Vec<String> {
        self.stores.lock().keys().cloned().collect()
    }

    pub fn backing_message_ids(&self, name: &str) -> Vec<u64> {
        self.stores
            .lock()
            .get(name)
            .map(|entry| entry.backing_message_ids.clone())
            .unwrap_or_default()
    }
}

impl Drop for Keystore {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryChannel;
    use pretty_assertions::assert_eq;

    const CHANNEL: u64 = 77;
    const BOT: u64 = 5;

    fn config() -> KeystoreConfig {
        KeystoreConfig {
            channel_id: Some(CHANNEL),
            write_delay_ms: 0,
            ..Default::default()
        }
    }

    fn keystore(channel: &MemoryChannel) -> Arc<Keystore> {
        Arc::new(Keystore::new(Arc::new(channel.clone()), config()))
    }

    #[tokio::test]
    async fn test_get_store_creates_empty_dirty_store() {
        let ks = Keystore::detached(KeystoreConfig::default());
        assert_eq!(ks.get_store("fresh"), json!({}));
        assert!(ks.is_dirty("fresh"));
        assert_eq!(ks.stats().total_stores, 1);
    }

    #[tokio::test]
    async fn test_get_store_returns_copy() {
        let ks = Keystore::detached(KeystoreConfig::default());
        ks.set_store("s", json!({"a": 1}));
        let mut copy = ks.get_store("s");
        copy["a"] = json!(2);
        assert_eq!(ks.get_store("s"), json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_detached_sync_is_noop() {
        let ks = Arc::new(Keystore::detached(KeystoreConfig::default()));
        ks.initialize().await.unwrap();
        ks.set_store("s", json!({"a": 1}));
        let report = ks.sync(true).await;
        assert_eq!(report, SyncReport::default());
        assert_eq!(ks.get_store("s"), json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_initialize_requires_channel() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        let ks = Arc::new(Keystore::new(
            Arc::new(channel.clone()),
            KeystoreConfig::default(),
        ));
        assert!(matches!(
            ks.initialize().await,
            Err(KeystoreError::NoChannel)
        ));

        let ks = Arc::new(Keystore::new(
            Arc::new(channel.clone()),
            KeystoreConfig {
                channel_id: Some(CHANNEL + 1),
                ..config()
            },
        ));
        assert!(matches!(
            ks.initialize().await,
            Err(KeystoreError::ChannelUnavailable { .. })
        ));

        channel.set_text_capable(false);
        assert!(matches!(
            keystore(&channel).initialize().await,
            Err(KeystoreError::NotTextChannel { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_then_sync_writes_records() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        let ks = keystore(&channel);
        ks.initialize().await.unwrap();

        ks.set_store("user-levels", json!({"g1-u1": [120, 1700000000000_i64, 9]}));
        let report = ks.sync(false).await;
        assert_eq!(report.synced, vec!["user-levels"]);
        assert_eq!(report.messages_sent, 1);
        assert!(!ks.is_dirty("user-levels"));
        assert_eq!(ks.backing_message_ids("user-levels").len(), 1);

        // second sync has nothing to do
        let report = ks.sync(false).await;
        assert!(report.synced.is_empty());
        assert_eq!(channel.send_count(), 1);
    }

    #[tokio::test]
    async fn test_resync_replaces_previous_records() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        let ks = keystore(&channel);
        ks.initialize().await.unwrap();

        ks.set_store("s", json!({"v": 1}));
        ks.sync(false).await;
        ks.set_store("s", json!({"v": 2}));
        let report = ks.sync(false).await;
        assert_eq!(report.messages_deleted, 1);

        let records = channel.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_entry_too_large_keeps_store_dirty() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        let ks = Arc::new(Keystore::new(
            Arc::new(channel.clone()),
            KeystoreConfig {
                max_message_size: 100,
                ..config()
            },
        ));
        ks.initialize().await.unwrap();
        ks.set_store("big", json!({"k": "x".repeat(500)}));
        ks.set_store("small", json!({"k": 1}));

        let report = ks.sync(false).await;
        assert_eq!(report.failed, vec!["big"]);
        assert_eq!(report.synced, vec!["small"]);
        assert!(ks.is_dirty("big"));
        assert!(!ks.is_dirty("small"));
    }

    #[tokio::test]
    async fn test_failed_send_keeps_store_dirty() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        let ks = keystore(&channel);
        ks.initialize().await.unwrap();
        ks.set_store("s", json!({"a": 1}));

        channel.fail_sends(true);
        let report = ks.sync(false).await;
        assert_eq!(report.failed, vec!["s"]);
        assert!(ks.is_dirty("s"));

        channel.fail_sends(false);
        let report = ks.sync(false).await;
        assert!(report.is_clean());
        assert!(!ks.is_dirty("s"));
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_store_dirty_until_cleaned() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        let ks = keystore(&channel);
        ks.initialize().await.unwrap();
        ks.set_store("s", json!({"v": 1}));
        ks.sync(false).await;

        ks.set_store("s", json!({"v": 2}));
        channel.fail_deletes(true);
        let report = ks.sync(false).await;
        assert_eq!(report.failed, vec!["s"]);
        assert!(report.synced.is_empty());
        assert_eq!(report.messages_sent, 1);
        assert!(ks.is_dirty("s"));
        assert_eq!(channel.records().len(), 2);

        // the next pass removes both the leftover and its own previous write
        channel.fail_deletes(false);
        let report = ks.sync(false).await;
        assert!(report.is_clean());
        assert!(!ks.is_dirty("s"));
        let records = channel.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_sync_before_initialize_writes_nothing() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        let ks = keystore(&channel);
        ks.set_store("s", json!({}));

        assert_eq!(ks.sync(true).await, SyncReport::default());
        assert_eq!(ks.shutdown().await, SyncReport::default());
        assert_eq!(channel.send_count(), 0);
        assert!(ks.is_dirty("s"));
    }

    #[tokio::test]
    async fn test_write_during_sync_stays_dirty() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        // The clock runs mid-flush, after the snapshot; use it to land a write
        let hook: Arc<std::sync::OnceLock<Weak<Keystore>>> = Arc::default();
        let hook_in_clock = Arc::clone(&hook);
        let ks = Arc::new(
            Keystore::new(Arc::new(channel.clone()), config()).with_clock(move || {
                if let Some(ks) = hook_in_clock.get().and_then(Weak::upgrade) {
                    ks.set_store("s", json!({"a": 2}));
                }
                1_000
            }),
        );
        hook.set(Arc::downgrade(&ks)).unwrap();
        ks.initialize().await.unwrap();
        ks.set_store("s", json!({"a": 1}));

        let report = ks.sync(false).await;
        assert_eq!(report.synced, vec!["s"]);
        assert_eq!(channel.records()[0].data, json!({"a": 1}));
        assert!(ks.is_dirty("s"));
        assert_eq!(ks.get_store("s"), json!({"a": 2}));
    }

    #[tokio::test]
    async fn test_concurrent_sync_is_skipped() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        let ks = keystore(&channel);
        ks.initialize().await.unwrap();

        ks.syncing.store(true, Ordering::Release);
        assert!(ks.sync(true).await.skipped);
        ks.syncing.store(false, Ordering::Release);
        assert!(!ks.sync(true).await.skipped);
    }

    #[tokio::test]
    async fn test_update_store_only_writes_on_change() {
        let ks = Keystore::detached(KeystoreConfig::default());
        ks.set_store("s", json!({"n": 1}));
        ks.stores.lock().get_mut("s").unwrap().dirty = false;

        let n = ks
            .update_store("s", |data| data["n"].as_i64().unwrap_or(0))
            .await;
        assert_eq!(n, 1);
        assert!(!ks.is_dirty("s"));

        ks.update_store("s", |data| data["n"] = json!(2)).await;
        assert!(ks.is_dirty("s"));
        assert_eq!(ks.get_store("s"), json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_update_store_serializes_writers() {
        let ks = Arc::new(Keystore::detached(KeystoreConfig::default()));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let ks = Arc::clone(&ks);
            handles.push(tokio::spawn(async move {
                ks.update_store("counter", |data| {
                    let n = data["n"].as_u64().unwrap_or(0);
                    data["n"] = json!(n + 1);
                })
                .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(ks.get_store("counter")["n"], json!(20));
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        #[derive(Debug, Default, PartialEq, Serialize, serde::Deserialize)]
        struct Queue {
            messages: Vec<u64>,
        }
        let ks = Keystore::detached(KeystoreConfig::default());
        ks.set_typed("q", &Queue { messages: vec![1, 2] }).unwrap();
        let queue: Queue = ks.get_typed("q").unwrap();
        assert_eq!(queue.messages, vec![1, 2]);

        ks.set_store("q", json!({"messages": "nope"}));
        assert!(ks.get_typed::<Queue>("q").is_err());
    }

    #[tokio::test]
    async fn test_reload_keeps_dirty_stores() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        let writer = keystore(&channel);
        writer.initialize().await.unwrap();
        writer.set_store("a", json!({"v": "remote"}));
        writer.set_store("b", json!({"v": "remote"}));
        writer.sync(false).await;

        let reader = keystore(&channel);
        reader.initialize().await.unwrap();
        reader.set_store("b", json!({"v": "local"}));

        writer.set_store("a", json!({"v": "remote2"}));
        writer.set_store("b", json!({"v": "remote2"}));
        writer.sync(false).await;

        assert_eq!(reader.reload().await.unwrap(), 2);
        assert_eq!(reader.get_store("a"), json!({"v": "remote2"}));
        assert_eq!(reader.get_store("b"), json!({"v": "local"}));
    }

    #[tokio::test]
    async fn test_clear_all() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        let ks = keystore(&channel);
        ks.initialize().await.unwrap();
        ks.set_store("a", json!({"x": 1}));
        ks.set_store("b", json!({"y": 1}));
        ks.sync(false).await;
        channel.inject(42, "human message");

        assert_eq!(ks.clear_all().await.unwrap(), 2);
        assert!(channel.records().is_empty());
        assert_eq!(channel.messages().len(), 1);
        assert_eq!(ks.stats().total_stores, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let ks = Keystore::detached(KeystoreConfig::default());
        ks.set_store("a", json!({"x": 1}));
        ks.set_store("b", json!([]));
        ks.stores.lock().get_mut("b").unwrap().dirty = false;

        let stats = ks.stats();
        assert_eq!(stats.total_stores, 2);
        assert_eq!(stats.dirty_stores, 1);
        assert_eq!(stats.total_size_bytes, r#"{"x":1}"#.len() + "[]".len());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_everything() {
        let channel = MemoryChannel::new(BOT, CHANNEL);
        let ks = keystore(&channel);
        ks.initialize().await.unwrap();
        ks.set_store("a", json!({"x": 1}));
        ks.sync(false).await;

        let report = ks.shutdown().await;
        assert_eq!(report.synced, vec!["a"]);
        assert_eq!(channel.records().len(), 1);
    }
}
