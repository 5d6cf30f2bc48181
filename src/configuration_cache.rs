//! In-memory cache of compiled flag definitions.
//!
//! Each key moves through `absent -> loading -> present | not found -> expired -> loading ...`.
//! Concurrent lookups of the same missing or expired key share one loader call (single-flight).
//! If a refresh fails, the last known value keeps being served (stale-while-error) and the
//! failure is logged.
//!
//! Entries are immutable and replaced wholesale. Readers clone an `Arc` under a short read lock,
//! so a refresh never changes a value that an in-flight evaluation is already holding.
//!
//! The number of entries is bounded. When the cache is full, expired absences are swept first,
//! then absences and invalid definitions, then the definitions closest to expiry.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use rand::{thread_rng, Rng};
use tokio::{sync::watch, time::Instant};

use crate::{
    configuration_loader::{ConfigurationLoader, LoadOutcome},
    error::ConfigError,
    flag::{CompileLimits, CompiledFlag, FlagDefinition},
    metrics::Metrics,
    EvaluatorConfig, Error, Result, Str,
};

/// Cache settings. Usually derived from [`EvaluatorConfig`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time-to-live of present (and invalid) entries.
    pub ttl: Duration,
    /// Time-to-live of confirmed-absence entries.
    pub not_found_ttl: Duration,
    /// Random amount subtracted from each entry's TTL so that entries loaded together do not
    /// expire together.
    pub ttl_jitter: Duration,
    /// How long a stale value is served after a failed refresh before the next attempt.
    pub refresh_failure_backoff: Duration,
    /// Maximum number of cached keys, definitions and absences together.
    pub max_entries: usize,
    pub limits: CompileLimits,
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig::from(&EvaluatorConfig::default())
    }
}

impl From<&EvaluatorConfig> for CacheConfig {
    fn from(config: &EvaluatorConfig) -> CacheConfig {
        CacheConfig {
            ttl: config.cache_ttl,
            not_found_ttl: config.not_found_ttl,
            ttl_jitter: config.ttl_jitter,
            refresh_failure_backoff: config.refresh_failure_backoff,
            max_entries: config.max_cache_entries,
            limits: CompileLimits {
                max_rule_depth: config.max_rule_depth,
            },
        }
    }
}

/// Cached state of one flag key.
#[derive(Debug, Clone)]
pub enum CachedFlag {
    Found(Arc<CompiledFlag>),
    /// The loader confirmed that the flag does not exist.
    NotFound,
    /// The definition failed load-time validation. Evaluates to `DISABLED`.
    Invalid(ConfigError),
}

impl CachedFlag {
    /// Version of a present definition.
    pub fn version(&self) -> Option<u64> {
        match self {
            CachedFlag::Found(flag) => Some(flag.version),
            CachedFlag::NotFound | CachedFlag::Invalid(_) => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, CachedFlag::Found(_))
    }
}

/// Immutable cache slot.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: CachedFlag,
    pub fetched_at: Instant,
    pub expires_at: Instant,
    /// Set when the value is served after a failed or timed-out refresh.
    pub stale: bool,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

type LoadResult = Result<Arc<CacheEntry>>;

enum InFlight {
    /// Another caller finished loading while we were waiting for the lock.
    Ready(Arc<CacheEntry>),
    Waiting(watch::Receiver<Option<LoadResult>>),
}

/// `ConfigurationCache` maps flag keys to compiled definitions, loading them on demand.
///
/// The cache is shared between concurrent evaluations; it is used behind an `Arc` because loads
/// run on spawned tasks that outlive the caller that started them.
pub struct ConfigurationCache {
    loader: Arc<dyn ConfigurationLoader>,
    config: CacheConfig,
    entries: RwLock<HashMap<Str, Arc<CacheEntry>>>,
    /// One receiver per key being loaded. Guards single-flight; never held across an await.
    in_flight: Mutex<HashMap<Str, watch::Receiver<Option<LoadResult>>>>,
    metrics: Arc<Metrics>,
}

impl ConfigurationCache {
    pub fn new(
        loader: Arc<dyn ConfigurationLoader>,
        config: CacheConfig,
        metrics: Arc<Metrics>,
    ) -> ConfigurationCache {
        ConfigurationCache {
            loader,
            config,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Return the cached entry for `flag_key` without loading it, fresh or not.
    pub fn get(&self, flag_key: &str) -> Option<Arc<CacheEntry>> {
        // self.entries.read() should always return Ok(). Err() is possible only if the lock is
        // poisoned (writer panicked while holding the lock), which should never happen.
        let entries = self
            .entries
            .read()
            .expect("thread holding cache lock should not panic");
        entries.get(flag_key).cloned()
    }

    /// Return the entry for `flag_key`, loading it if it is absent or expired.
    ///
    /// If `deadline` passes before the load completes, the previous (stale) entry is returned when
    /// there is one. The load itself keeps running for other waiters.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the deadline passed and nothing was cached.
    /// - The loader's error if the load failed and nothing was cached.
    pub async fn get_or_load(
        self: &Arc<Self>,
        flag_key: &str,
        deadline: Option<Instant>,
    ) -> Result<Arc<CacheEntry>> {
        let cached = self.get(flag_key);
        if let Some(entry) = cached.as_ref().filter(|entry| entry.is_fresh(Instant::now())) {
            self.metrics.record_hit();
            return Ok(Arc::clone(entry));
        }
        self.metrics.record_miss();

        let mut restarted = false;
        loop {
            let mut receiver = match self.join_or_start_load(flag_key) {
                InFlight::Ready(entry) => return Ok(entry),
                InFlight::Waiting(receiver) => receiver,
            };

            let outcome = {
                let wait = receiver.wait_for(Option::is_some);
                let result = match deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, wait).await {
                        Ok(result) => result,
                        Err(_elapsed) => return self.fall_back(flag_key, cached, Error::Timeout),
                    },
                    None => wait.await,
                };
                // Err means the load task went away without publishing a result.
                result.ok().and_then(|value| value.clone())
            };

            match outcome {
                Some(result) => return result,
                // The load task was dropped unfinished, e.g. its runtime shut down. Its marker is
                // gone, so joining again starts a fresh load on the current runtime.
                None if !restarted => {
                    log::debug!(target: "toggle", flag_key; "flag load was abandoned, restarting it");
                    restarted = true;
                }
                None => {
                    return self.fall_back(
                        flag_key,
                        cached,
                        Error::LoadFailed("configuration load was abandoned".to_owned()),
                    )
                }
            }
        }
    }

    /// Load every key in `flag_keys` that is not already fresh.
    ///
    /// All keys are attempted. Returns the first error encountered, if any.
    pub async fn prefetch<I, K>(self: &Arc<Self>, flag_keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut first_error = None;
        for flag_key in flag_keys {
            if let Err(err) = self.get_or_load(flag_key.as_ref(), None).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drop the entry for `flag_key` so that the next lookup reloads it. Returns `true` if an
    /// entry was present.
    pub fn invalidate(&self, flag_key: &str) -> bool {
        let removed = self
            .entries
            .write()
            .expect("thread holding cache lock should not panic")
            .remove(flag_key)
            .is_some();
        if removed {
            log::debug!(target: "toggle", flag_key; "invalidated cached flag definition");
        }
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries
            .write()
            .expect("thread holding cache lock should not panic")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("thread holding cache lock should not panic")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry, including expired definitions that would otherwise be served as
    /// stale fallback. Returns the number of entries removed.
    ///
    /// The cache never exceeds [`CacheConfig::max_entries`] on its own; this is for callers that
    /// want to release memory early, e.g. from a periodic housekeeping task.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .expect("thread holding cache lock should not panic");
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now));
        let purged = before - entries.len();
        self.metrics.record_evictions(purged as u64);
        purged
    }

    fn join_or_start_load(self: &Arc<Self>, flag_key: &str) -> InFlight {
        let mut in_flight = self
            .in_flight
            .lock()
            .expect("thread holding in-flight lock should not panic");

        if let Some(receiver) = in_flight.get(flag_key) {
            self.metrics.record_collapsed();
            return InFlight::Waiting(receiver.clone());
        }

        // A load may have completed between the first lookup and taking the lock.
        if let Some(entry) = self
            .get(flag_key)
            .filter(|entry| entry.is_fresh(Instant::now()))
        {
            return InFlight::Ready(entry);
        }

        let flag_key = Str::from(flag_key);
        let (sender, receiver) = watch::channel(None);
        in_flight.insert(flag_key.clone(), receiver.clone());
        drop(in_flight);

        self.spawn_load(flag_key, sender);
        InFlight::Waiting(receiver)
    }

    fn spawn_load(self: &Arc<Self>, flag_key: Str, sender: watch::Sender<Option<LoadResult>>) {
        // Created outside the task so that the marker is cleared even if the task is dropped
        // before its first poll.
        let guard = LoadGuard {
            cache: Arc::clone(self),
            flag_key,
            sender,
        };
        tokio::spawn(async move {
            let LoadGuard { cache, flag_key, .. } = &guard;
            cache.metrics.record_load();
            log::debug!(target: "toggle", flag_key; "loading flag definition");

            // The loader runs in its own task so that a panic inside it fails this load only.
            let loader = Arc::clone(&cache.loader);
            let key = flag_key.clone();
            let loaded = match tokio::spawn(async move { loader.load(&key).await }).await {
                Ok(loaded) => loaded,
                Err(err) => Err(Error::LoadFailed(format!("loader task failed: {err}"))),
            };

            let result = cache.complete_load(flag_key, loaded);

            // Publish before the guard clears the marker: a caller that still finds the marker
            // joins a channel that already holds the result.
            guard.sender.send_replace(Some(result));
        });
    }

    /// Store the outcome of a load and return the entry to hand to waiters.
    fn complete_load(&self, flag_key: &Str, loaded: Result<LoadOutcome>) -> LoadResult {
        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .expect("thread holding cache lock should not panic");
        let previous = entries.get(flag_key).cloned();

        let entry = match loaded {
            Ok(LoadOutcome::Found(definition)) => {
                self.found_entry(flag_key, definition, previous.as_deref(), now)
            }
            Ok(LoadOutcome::NotFound) => {
                log::debug!(target: "toggle", flag_key; "flag not found, caching absence");
                self.fresh_entry(CachedFlag::NotFound, now, self.config.not_found_ttl)
            }
            Err(Error::ConfigInvalid(err)) => {
                log::warn!(target: "toggle", flag_key; "invalid flag definition: {err}");
                self.fresh_entry(CachedFlag::Invalid(err), now, self.config.ttl)
            }
            Err(err) => {
                self.metrics.record_load_failure();
                let Some(previous) = previous else {
                    if err.is_retriable() {
                        log::warn!(target: "toggle", flag_key; "failed to load flag definition: {err}");
                    } else {
                        log::error!(target: "toggle", flag_key; "failed to load flag definition, retrying will not help: {err}");
                    }
                    return Err(err);
                };

                self.metrics.record_stale_fallback();
                log::warn!(target: "toggle", flag_key; "refresh failed, serving stale flag definition: {err}");
                CacheEntry {
                    value: previous.value.clone(),
                    fetched_at: previous.fetched_at,
                    expires_at: now + self.config.refresh_failure_backoff,
                    stale: true,
                }
            }
        };

        if !entries.contains_key(flag_key) && entries.len() >= self.config.max_entries {
            self.make_room(&mut entries, now);
        }

        let entry = Arc::new(entry);
        entries.insert(flag_key.clone(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Evict entries until one more fits.
    ///
    /// Expired absences and invalid definitions go first. Expired definitions stay as stale
    /// fallback while there is room; past that, non-definitions are evicted before definitions
    /// and earlier expiry before later.
    fn make_room(&self, entries: &mut HashMap<Str, Arc<CacheEntry>>, now: Instant) {
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now) || entry.value.is_found());

        let capacity = self.config.max_entries.max(1);
        while entries.len() >= capacity {
            let victim = entries
                .iter()
                .min_by_key(|(_, entry)| (entry.value.is_found(), entry.expires_at))
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else {
                break;
            };
            entries.remove(&victim);
        }

        let evicted = before - entries.len();
        self.metrics.record_evictions(evicted as u64);
        log::debug!(target: "toggle", evicted, max_entries = self.config.max_entries; "cache is full, evicted entries");
    }

    fn found_entry(
        &self,
        flag_key: &Str,
        definition: FlagDefinition,
        previous: Option<&CacheEntry>,
        now: Instant,
    ) -> CacheEntry {
        if let Some(previous) = previous {
            if let Some(cached_version) = previous.value.version() {
                if definition.version < cached_version {
                    log::warn!(target: "toggle", flag_key, version = definition.version, cached_version; "ignoring flag definition older than the cached one");
                    return self.fresh_entry(previous.value.clone(), now, self.config.ttl);
                }
            }
        }

        let value = match CompiledFlag::compile(&definition, &self.config.limits) {
            Ok(flag) => {
                log::debug!(target: "toggle", flag_key, version = flag.version; "cached flag definition");
                CachedFlag::Found(Arc::new(flag))
            }
            Err(err) => {
                log::warn!(target: "toggle", flag_key, version = definition.version; "invalid flag definition: {err}");
                CachedFlag::Invalid(err)
            }
        };
        self.fresh_entry(value, now, self.config.ttl)
    }

    fn fresh_entry(&self, value: CachedFlag, now: Instant, ttl: Duration) -> CacheEntry {
        CacheEntry {
            value,
            fetched_at: now,
            expires_at: now + jitter(ttl, self.config.ttl_jitter),
            stale: false,
        }
    }

    /// Serve the previous entry as stale, or fail with `err` if there is none.
    fn fall_back(
        &self,
        flag_key: &str,
        cached: Option<Arc<CacheEntry>>,
        err: Error,
    ) -> Result<Arc<CacheEntry>> {
        let Some(entry) = cached else {
            return Err(err);
        };
        self.metrics.record_stale_fallback();
        log::warn!(target: "toggle", flag_key; "serving stale flag definition: {err}");
        Ok(Arc::new(CacheEntry {
            stale: true,
            ..CacheEntry::clone(&entry)
        }))
    }
}

/// Owned by a load task. Clears the key's in-flight marker when the task ends, whether it
/// completed or was dropped unfinished. In the latter case `sender` is dropped right after, so
/// waiters see the channel close instead of waiting forever.
struct LoadGuard {
    cache: Arc<ConfigurationCache>,
    flag_key: Str,
    sender: watch::Sender<Option<LoadResult>>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.cache.in_flight.lock() {
            in_flight.remove(&self.flag_key);
        }
    }
}

/// Apply randomized `jitter` to `ttl`.
fn jitter(ttl: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(ttl, thread_rng().gen_range(Duration::ZERO..=jitter))
}
