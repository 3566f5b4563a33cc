//! Bounded model-instance cache with pins and LRU eviction.
//!
//! `acquire` pins an instance for the lifetime of the returned `ModelLease`.
//! When the cache is full, the unpinned instance with the oldest `last_used`
//! is evicted (ties broken by creation order). When every resident instance
//! is pinned, `acquire` waits for a release, bounded by `acquire_timeout`.
//!
//! All state lives behind one mutex whose critical sections never await;
//! runtime calls (unload after eviction) happen after the lock is dropped.
//! `last_used` is a logical clock that ticks on every acquisition, so
//! ordering is exact even when two acquisitions share a wall-clock instant.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::errors::CacheError;
use super::registry::ModelRegistry;
use crate::inference::client::{ModelRuntimeClient, RuntimeSet};
use crate::inference::config::{CacheConfig, ModelConfig};

// ─── ModelInstance ───────────────────────────────────────────────────────────

/// A resident model: its config bound to the runtime client serving it.
pub struct ModelInstance {
    id: u64,
    config: ModelConfig,
    client: Arc<dyn ModelRuntimeClient>,
    created_at: DateTime<Utc>,
    last_used: AtomicU64,
    request_count: AtomicU64,
}

impl ModelInstance {
    /// Creation sequence number, unique per cache.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn ModelRuntimeClient> {
        &self.client
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Logical time of the last acquisition; 0 means never acquired.
    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    fn touch(&self, tick: u64) {
        self.last_used.store(tick, Ordering::SeqCst);
        self.request_count.fetch_add(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInstance")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("endpoint", &self.client.endpoint())
            .field("last_used", &self.last_used())
            .field("request_count", &self.request_count())
            .finish()
    }
}

/// Diagnostic view of one resident instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidentModel {
    pub name: String,
    pub id: u64,
    pub pins: usize,
    pub last_used: u64,
    pub request_count: u64,
}

// ─── Internal state ──────────────────────────────────────────────────────────

struct Slot {
    instance: Arc<ModelInstance>,
    pins: usize,
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<String, Slot>,
    clock: u64,
    next_id: u64,
}

impl CacheState {
    fn new_instance(&mut self, config: &ModelConfig, client: &Arc<dyn ModelRuntimeClient>) -> Arc<ModelInstance> {
        self.next_id += 1;
        Arc::new(ModelInstance {
            id: self.next_id,
            config: config.clone(),
            client: Arc::clone(client),
            created_at: Utc::now(),
            last_used: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
        })
    }

    /// Remove the least-recently-used unpinned instance.
    fn evict_lru(&mut self) -> Option<Arc<ModelInstance>> {
        let victim = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.pins == 0)
            .min_by_key(|(_, slot)| (slot.instance.last_used(), slot.instance.id))
            .map(|(name, _)| name.clone())?;
        self.slots.remove(&victim).map(|slot| slot.instance)
    }

    /// One acquisition attempt. `None` means full with every slot pinned.
    fn try_acquire(
        &mut self,
        config: &ModelConfig,
        client: &Arc<dyn ModelRuntimeClient>,
        capacity: usize,
    ) -> Option<(Arc<ModelInstance>, Option<Arc<ModelInstance>>)> {
        if let Some(slot) = self.slots.get_mut(&config.name) {
            self.clock += 1;
            slot.pins += 1;
            slot.instance.touch(self.clock);
            return Some((Arc::clone(&slot.instance), None));
        }

        let evicted = if self.slots.len() >= capacity {
            Some(self.evict_lru()?)
        } else {
            None
        };

        self.clock += 1;
        let instance = self.new_instance(config, client);
        instance.touch(self.clock);
        self.slots.insert(
            config.name.clone(),
            Slot {
                instance: Arc::clone(&instance),
                pins: 1,
            },
        );
        Some((instance, evicted))
    }
}

struct CacheInner {
    state: Mutex<CacheState>,
    freed: Notify,
    registry: ModelRegistry,
    runtimes: RuntimeSet,
    capacity: usize,
    acquire_timeout: Duration,
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, instance: &ModelInstance) {
        let freed = {
            let mut state = self.lock();
            match state.slots.get_mut(instance.name()) {
                Some(slot) if slot.instance.id == instance.id => {
                    slot.pins = slot.pins.saturating_sub(1);
                    slot.pins == 0
                }
                _ => false,
            }
        };
        tracing::debug!(model = %instance.name(), freed, "model released");
        if freed {
            self.freed.notify_waiters();
        }
    }
}

// ─── ModelCache ──────────────────────────────────────────────────────────────

/// Shared handle to the model cache. Cloning is cheap.
#[derive(Clone)]
pub struct ModelCache {
    inner: Arc<CacheInner>,
}

impl ModelCache {
    pub fn new(
        registry: ModelRegistry,
        runtimes: RuntimeSet,
        capacity: usize,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState::default()),
                freed: Notify::new(),
                registry,
                runtimes,
                capacity: capacity.max(1),
                acquire_timeout,
            }),
        }
    }

    pub fn from_config(registry: ModelRegistry, runtimes: RuntimeSet, config: &CacheConfig) -> Self {
        Self::new(registry, runtimes, config.capacity, config.acquire_timeout())
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Config for `name`, if known.
    pub fn resolve(&self, name: &str) -> Result<&ModelConfig, CacheError> {
        self.inner
            .registry
            .get(name)
            .ok_or_else(|| CacheError::ModelNotFound {
                name: name.to_string(),
            })
    }

    /// Pin an instance of `name`, loading it (and evicting if full) when it
    /// is not resident.
    pub async fn acquire(&self, name: &str) -> Result<ModelLease, CacheError> {
        let config = self.resolve(name)?.clone();
        let client = self.inner.runtimes.client_for(&config)?;
        let started = Instant::now();
        let deadline = started + self.inner.acquire_timeout;

        loop {
            // Register for wake-ups before inspecting state so a release
            // between the check and the wait is not missed.
            let notified = self.inner.freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let attempt = self
                .inner
                .lock()
                .try_acquire(&config, &client, self.inner.capacity);

            if let Some((instance, evicted)) = attempt {
                if let Some(evicted) = evicted {
                    self.after_eviction(evicted);
                }
                tracing::debug!(
                    model = %name,
                    instance = instance.id(),
                    last_used = instance.last_used(),
                    "model acquired"
                );
                return Ok(ModelLease {
                    cache: Arc::clone(&self.inner),
                    instance,
                });
            }

            tracing::info!(
                model = %name,
                capacity = self.inner.capacity,
                "all cached models pinned; waiting for a release"
            );
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(model = %name, waited_ms, "model acquire timed out");
                return Err(CacheError::AcquireTimeout {
                    name: name.to_string(),
                    waited_ms,
                });
            }
        }
    }

    /// Unpin a lease. Equivalent to dropping it.
    pub fn release(&self, lease: ModelLease) {
        drop(lease);
    }

    /// Make `name` resident without pinning it or marking it used.
    ///
    /// Preloaded instances count as never used, so among themselves they are
    /// evicted in creation order. Skipped when the cache is full of pinned
    /// instances.
    pub fn preload(&self, name: &str) -> Result<(), CacheError> {
        let config = self.resolve(name)?.clone();
        let client = self.inner.runtimes.client_for(&config)?;

        let evicted = {
            let mut state = self.inner.lock();
            if state.slots.contains_key(name) {
                return Ok(());
            }
            let evicted = if state.slots.len() >= self.inner.capacity {
                match state.evict_lru() {
                    Some(evicted) => Some(evicted),
                    None => {
                        tracing::warn!(model = %name, "preload skipped; cache full of pinned models");
                        return Ok(());
                    }
                }
            } else {
                None
            };
            let instance = state.new_instance(&config, &client);
            state.slots.insert(config.name.clone(), Slot { instance, pins: 0 });
            evicted
        };

        if let Some(evicted) = evicted {
            self.after_eviction(evicted);
        }
        tracing::info!(model = %name, "model preloaded");
        Ok(())
    }

    /// Resident instances, sorted by name.
    pub fn snapshot(&self) -> Vec<ResidentModel> {
        let state = self.inner.lock();
        let mut resident: Vec<ResidentModel> = state
            .slots
            .iter()
            .map(|(name, slot)| ResidentModel {
                name: name.clone(),
                id: slot.instance.id,
                pins: slot.pins,
                last_used: slot.instance.last_used(),
                request_count: slot.instance.request_count(),
            })
            .collect();
        resident.sort_by(|a, b| a.name.cmp(&b.name));
        resident
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().slots.contains_key(name)
    }

    /// Log the eviction and ask the runtime to free the model, off-lock.
    fn after_eviction(&self, evicted: Arc<ModelInstance>) {
        tracing::info!(
            model = %evicted.name(),
            instance = evicted.id(),
            last_used = evicted.last_used(),
            requests = evicted.request_count(),
            "model evicted"
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let path = evicted.config().path.clone();
                if let Err(e) = evicted.client().unload(&path).await {
                    tracing::warn!(model = %evicted.name(), error = %e, "runtime unload failed");
                }
            });
        }
    }
}

// ─── ModelLease ──────────────────────────────────────────────────────────────

/// A pinned instance. The pin is released when the lease is dropped, on
/// every exit path.
pub struct ModelLease {
    cache: Arc<CacheInner>,
    instance: Arc<ModelInstance>,
}

impl ModelLease {
    pub fn instance(&self) -> &Arc<ModelInstance> {
        &self.instance
    }
}

impl std::ops::Deref for ModelLease {
    type Target = ModelInstance;

    fn deref(&self) -> &ModelInstance {
        &self.instance
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.cache.release(&self.instance);
    }
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease")
            .field("instance", &self.instance)
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::config::Provider;
    use crate::inference::testing::ScriptedRuntime;

    fn cache_with(names: &[&str], capacity: usize, timeout: Duration) -> (ModelCache, Arc<ScriptedRuntime>) {
        let runtime = ScriptedRuntime::new(Vec::new());
        let registry = ModelRegistry::new(
            names
                .iter()
                .map(|n| ModelConfig::discovered(n, Provider::Ollama, &format!("{n}:latest"))),
        );
        let cache = ModelCache::new(
            registry,
            RuntimeSet::uniform(runtime.clone()),
            capacity,
            timeout,
        );
        (cache, runtime)
    }

    fn resident_names(cache: &ModelCache) -> Vec<String> {
        cache.snapshot().into_iter().map(|r| r.name).collect()
    }

    #[tokio::test]
    async fn test_same_instance_and_last_used_increases() {
        let (cache, _) = cache_with(&["a"], 3, Duration::from_secs(1));

        let first = cache.acquire("a").await.unwrap();
        let (id, used) = (first.id(), first.last_used());
        cache.release(first);

        let second = cache.acquire("a").await.unwrap();
        assert_eq!(second.id(), id);
        assert!(second.last_used() > used);
        assert_eq!(second.request_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let (cache, _) = cache_with(&["a"], 1, Duration::from_secs(1));
        assert!(matches!(
            cache.acquire("zzz").await,
            Err(CacheError::ModelNotFound { name }) if name == "zzz"
        ));
        assert!(cache.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let (cache, runtime) = cache_with(&["a", "b", "c"], 2, Duration::from_secs(1));

        drop(cache.acquire("a").await.unwrap());
        drop(cache.acquire("b").await.unwrap());
        drop(cache.acquire("a").await.unwrap());
        drop(cache.acquire("c").await.unwrap());

        assert_eq!(resident_names(&cache), vec!["a", "c"]);

        // Unload runs on a spawned task.
        tokio::task::yield_now().await;
        assert_eq!(*runtime.unloaded.lock().unwrap(), vec!["b:latest".to_string()]);
    }

    #[tokio::test]
    async fn test_pinned_instance_never_evicted() {
        let (cache, _) = cache_with(&["a", "b", "c"], 2, Duration::from_secs(1));

        let pinned_a = cache.acquire("a").await.unwrap();
        drop(cache.acquire("b").await.unwrap());
        // "a" is older but pinned, so "b" goes.
        let _c = cache.acquire("c").await.unwrap();

        assert_eq!(resident_names(&cache), vec!["a", "c"]);
        assert_eq!(pinned_a.name(), "a");
    }

    #[tokio::test]
    async fn test_capacity_one_blocks_until_release() {
        let (cache, _) = cache_with(&["a", "b"], 1, Duration::from_secs(5));

        let lease_a = cache.acquire("a").await.unwrap();
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.acquire("b").await.map(|lease| lease.id()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(resident_names(&cache), vec!["a"]);

        drop(lease_a);
        let b_id = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish after release")
            .unwrap()
            .unwrap();
        assert_eq!(resident_names(&cache), vec!["b"]);
        assert!(b_id > 1);
    }

    #[tokio::test]
    async fn test_acquire_wait_is_bounded() {
        let (cache, _) = cache_with(&["a", "b"], 1, Duration::from_millis(50));
        let _a = cache.acquire("a").await.unwrap();

        match cache.acquire("b").await {
            Err(CacheError::AcquireTimeout { name, waited_ms }) => {
                assert_eq!(name, "b");
                assert!(waited_ms >= 50);
            }
            other => panic!("expected AcquireTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_preloaded_evicted_in_creation_order() {
        let (cache, _) = cache_with(&["a", "b", "c"], 2, Duration::from_secs(1));
        cache.preload("a").unwrap();
        cache.preload("b").unwrap();
        assert!(cache.snapshot().iter().all(|r| r.last_used == 0 && r.pins == 0));

        drop(cache.acquire("c").await.unwrap());
        assert_eq!(resident_names(&cache), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_release_is_lazy() {
        let (cache, _) = cache_with(&["a"], 1, Duration::from_secs(1));
        let lease = cache.acquire("a").await.unwrap();
        assert_eq!(cache.snapshot()[0].pins, 1);
        cache.release(lease);
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].pins, 0);
    }

    /// Drive a fixed pseudo-random acquire/release sequence and check the
    /// eviction choice at every step against a direct computation.
    #[tokio::test]
    async fn test_eviction_choice_over_random_sequence() {
        let names = ["m0", "m1", "m2", "m3", "m4", "m5"];
        let (cache, _) = cache_with(&names, 3, Duration::from_millis(10));
        let mut held: Vec<ModelLease> = Vec::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;

        for _ in 0..400 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            if seed % 3 == 0 && !held.is_empty() {
                let idx = (seed as usize / 3) % held.len();
                drop(held.swap_remove(idx));
                continue;
            }

            let name = names[(seed as usize / 7) % names.len()];
            let before = cache.snapshot();
            let resident = before.iter().any(|r| r.name == name);
            let expected_victim = if !resident && before.len() >= 3 {
                before
                    .iter()
                    .filter(|r| r.pins == 0)
                    .min_by_key(|r| (r.last_used, r.id))
                    .map(|r| r.name.clone())
            } else {
                None
            };

            match cache.acquire(name).await {
                Ok(lease) => {
                    let after = resident_names(&cache);
                    assert!(after.len() <= 3);
                    if let Some(victim) = expected_victim {
                        assert!(!after.contains(&victim), "{victim} should be evicted");
                    }
                    for pinned in before.iter().filter(|r| r.pins > 0) {
                        assert!(after.contains(&pinned.name), "pinned {} evicted", pinned.name);
                    }
                    held.push(lease);
                }
                Err(CacheError::AcquireTimeout { .. }) => {
                    assert!(before.iter().all(|r| r.pins > 0));
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }
}
