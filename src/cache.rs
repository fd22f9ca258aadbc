//! Shape-keyed cache of compiled routines.
//!
//! The table is split into shards, each behind its own `RwLock`, so lookups
//! for unrelated shapes never contend. A miss installs a `Compiling` marker
//! before any code is generated; later requests for the same key wait on the
//! marker instead of compiling again. Failed compilations are handed to the
//! waiters and then forgotten.

use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak, mpsc};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use hashbrown::{DefaultHashBuilder, HashMap};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::CompileError;
use crate::ir::Direction;
use crate::routine::CompiledRoutine;
use crate::shape::ShapeKey;

type Key = (ShapeKey, Direction);

/// Counters reported by [`CompilationCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Lookups that found a compilation in flight and waited for it.
    pub waits: u64,
    pub compilations: u64,
    pub failures: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    waits: AtomicU64,
    compilations: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
}

struct Entry {
    routine: Arc<CompiledRoutine>,
    created: Instant,
    /// Value of the cache clock at the last hit.
    last_used: AtomicU64,
    accesses: AtomicU64,
}

struct InFlight {
    owner: ThreadId,
    result: Mutex<Option<Result<Arc<CompiledRoutine>, CompileError>>>,
    done: Condvar,
}

impl InFlight {
    fn wait(&self) -> Result<Arc<CompiledRoutine>, CompileError> {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut result);
        }
    }

    fn publish(&self, result: Result<Arc<CompiledRoutine>, CompileError>) {
        *self.result.lock() = Some(result);
        self.done.notify_all();
    }
}

enum Slot {
    Ready(Entry),
    Compiling(Arc<InFlight>),
}

type Shard = RwLock<HashMap<Key, Slot>>;

pub struct CompilationCache {
    shards: Box<[Shard]>,
    hasher: DefaultHashBuilder,
    clock: AtomicU64,
    counters: Counters,
    max_entries: usize,
    ttl: Option<Duration>,
}

impl CompilationCache {
    pub fn new(shards: usize, max_entries: usize, ttl: Option<Duration>) -> Self {
        let shards = shards.max(1);
        CompilationCache {
            shards: (0..shards).map(|_| RwLock::new(HashMap::new())).collect(),
            hasher: DefaultHashBuilder::default(),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    fn shard(&self, key: &Key) -> &Shard {
        let h = self.hasher.hash_one(key);
        &self.shards[(h as usize) % self.shards.len()]
    }

    fn expired(&self, entry: &Entry, now: Instant) -> bool {
        self.ttl.is_some_and(|ttl| now.duration_since(entry.created) >= ttl)
    }

    fn touch(&self, entry: &Entry) -> Arc<CompiledRoutine> {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        entry.last_used.store(tick, Ordering::Relaxed);
        entry.accesses.fetch_add(1, Ordering::Relaxed);
        Arc::clone(&entry.routine)
    }

    /// Return the routine for `key`, running `compile` if nobody has yet.
    ///
    /// Concurrent callers for the same key share one compilation. A thread
    /// asking for a key it is itself compiling gets
    /// [`CompileError::RecursiveCompilation`] instead of deadlocking.
    pub fn get_or_compile<F>(
        &self,
        shape: ShapeKey,
        direction: Direction,
        compile: F,
    ) -> Result<Arc<CompiledRoutine>, CompileError>
    where
        F: FnOnce() -> Result<CompiledRoutine, CompileError>,
    {
        let key = (shape, direction);
        let shard = self.shard(&key);
        let now = Instant::now();

        let waiting = {
            let map = shard.read();
            match map.get(&key) {
                Some(Slot::Ready(entry)) if !self.expired(entry, now) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(key = ?key.0, %direction, "cache hit");
                    return Ok(self.touch(entry));
                }
                Some(Slot::Compiling(flight)) => Some(Arc::clone(flight)),
                _ => None,
            }
        };
        if let Some(flight) = waiting {
            return self.wait_for(&key, &flight);
        }

        let flight = {
            let mut map = shard.write();
            let waiting = match map.get(&key) {
                Some(Slot::Ready(entry)) if !self.expired(entry, now) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(self.touch(entry));
                }
                Some(Slot::Compiling(flight)) => Some(Arc::clone(flight)),
                _ => None,
            };
            if let Some(flight) = waiting {
                drop(map);
                return self.wait_for(&key, &flight);
            }
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            let flight = Arc::new(InFlight {
                owner: thread::current().id(),
                result: Mutex::new(None),
                done: Condvar::new(),
            });
            map.insert(key, Slot::Compiling(Arc::clone(&flight)));
            flight
        };

        let mut guard = PublishOnDrop {
            cache: self,
            key: Some(key),
            flight: &flight,
        };
        let result = compile().map(Arc::new);
        guard.finish(result.clone());

        if result.is_ok() {
            self.evict_over_capacity();
        }
        result
    }

    fn wait_for(&self, key: &Key, flight: &InFlight) -> Result<Arc<CompiledRoutine>, CompileError> {
        if flight.owner == thread::current().id() {
            return Err(CompileError::RecursiveCompilation {
                type_name: key.0.shape().type_identifier,
            });
        }
        self.counters.waits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(key = ?key.0, direction = %key.1, "waiting on in-flight compilation");
        flight.wait()
    }

    fn settle(&self, key: Key, flight: &InFlight, result: Result<Arc<CompiledRoutine>, CompileError>) {
        {
            let mut map = self.shard(&key).write();
            match &result {
                Ok(routine) => {
                    self.counters.compilations.fetch_add(1, Ordering::Relaxed);
                    let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
                    map.insert(
                        key,
                        Slot::Ready(Entry {
                            routine: Arc::clone(routine),
                            created: Instant::now(),
                            last_used: AtomicU64::new(tick),
                            accesses: AtomicU64::new(1),
                        }),
                    );
                }
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = ?key.0, direction = %key.1, error = %e, "compilation failed");
                    map.remove(&key);
                }
            }
        }
        flight.publish(result);
    }

    /// Whether a finished routine for `key` is cached.
    pub fn contains(&self, shape: ShapeKey, direction: Direction) -> bool {
        let key = (shape, direction);
        matches!(self.shard(&key).read().get(&key), Some(Slot::Ready(_)))
    }

    /// How many times the cached routine for `key` has been handed out.
    pub fn accesses(&self, shape: ShapeKey, direction: Direction) -> Option<u64> {
        let key = (shape, direction);
        match self.shard(&key).read().get(&key) {
            Some(Slot::Ready(entry)) => Some(entry.accesses.load(Ordering::Relaxed)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().values().filter(|slot| matches!(slot, Slot::Ready(_))).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            waits: c.waits.load(Ordering::Relaxed),
            compilations: c.compilations.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Drop every finished routine. In-flight compilations still complete and
    /// are inserted afterwards. Routines already handed out stay valid.
    pub fn invalidate_all(&self) {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut map = shard.write();
            let before = map.len();
            map.retain(|_, slot| matches!(slot, Slot::Compiling(_)));
            removed += before - map.len();
        }
        self.counters.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        tracing::debug!(removed, "invalidated compilation cache");
    }

    /// Remove expired entries, then trim to capacity. Returns how many
    /// entries were removed.
    pub fn sweep_now(&self) -> usize {
        let mut removed = 0;
        if self.ttl.is_some() {
            let now = Instant::now();
            for shard in self.shards.iter() {
                let mut map = shard.write();
                let before = map.len();
                map.retain(|_, slot| match slot {
                    Slot::Ready(entry) => !self.expired(entry, now),
                    Slot::Compiling(_) => true,
                });
                removed += before - map.len();
            }
            self.counters.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed += self.evict_over_capacity();
        if removed > 0 {
            tracing::debug!(removed, "swept compilation cache");
        }
        removed
    }

    /// Evict least-recently-used entries until at most `max_entries` remain.
    fn evict_over_capacity(&self) -> usize {
        let mut evicted = 0;
        while self.len() > self.max_entries {
            let Some((shard, key)) = self.least_recently_used() else {
                break;
            };
            let mut map = self.shards[shard].write();
            if let Some(Slot::Ready(_)) = map.get(&key) {
                map.remove(&key);
                evicted += 1;
                tracing::debug!(key = ?key.0, direction = %key.1, "evicted routine");
            }
        }
        self.counters.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    fn least_recently_used(&self) -> Option<(usize, Key)> {
        let mut oldest: Option<(u64, usize, Key)> = None;
        for (i, shard) in self.shards.iter().enumerate() {
            let map = shard.read();
            for (key, slot) in map.iter() {
                let Slot::Ready(entry) = slot else { continue };
                let tick = entry.last_used.load(Ordering::Relaxed);
                if oldest.as_ref().is_none_or(|(t, _, _)| tick < *t) {
                    oldest = Some((tick, i, *key));
                }
            }
        }
        oldest.map(|(_, shard, key)| (shard, key))
    }

    /// Start a thread that calls [`sweep_now`](Self::sweep_now) every
    /// `interval`. It exits once the returned [`Sweeper`] or the cache is
    /// dropped.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> std::io::Result<Sweeper> {
        let (stop, stopped) = mpsc::channel::<()>();
        let cache: Weak<Self> = Arc::downgrade(self);
        thread::Builder::new()
            .name("jitson-sweeper".into())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    let Some(cache) = cache.upgrade() else { break };
                    cache.sweep_now();
                }
                tracing::trace!("sweeper stopped");
            })?;
        Ok(Sweeper { _stop: stop })
    }
}

/// Handle to the background sweep thread.
pub struct Sweeper {
    _stop: mpsc::Sender<()>,
}

/// Settles the in-flight marker even if compilation panics, so waiters are
/// not left blocked forever.
struct PublishOnDrop<'a> {
    cache: &'a CompilationCache,
    key: Option<Key>,
    flight: &'a InFlight,
}

impl PublishOnDrop<'_> {
    fn finish(&mut self, result: Result<Arc<CompiledRoutine>, CompileError>) {
        if let Some(key) = self.key.take() {
            self.cache.settle(key, self.flight, result);
        }
    }
}

impl Drop for PublishOnDrop<'_> {
    fn drop(&mut self) {
        if self.key.is_some() {
            self.finish(Err(CompileError::Assembly("compilation panicked".into())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{Facet, Shape};
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;

    fn key(shape: &'static Shape) -> ShapeKey {
        ShapeKey::new(shape)
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = CompilationCache::new(4, 16, None);
        let err = cache
            .get_or_compile(key(u8::SHAPE), Direction::Encode, || {
                Err(CompileError::UnsupportedShape { type_name: "u8", reason: "test" })
            })
            .unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedShape { type_name: "u8", .. }));
        assert!(!cache.contains(key(u8::SHAPE), Direction::Encode));
        let stats = cache.stats();
        assert_eq!((stats.misses, stats.failures, stats.entries), (1, 1, 0));
    }

    #[test]
    fn recursive_request_is_reported() {
        let cache = CompilationCache::new(1, 16, None);
        let err = cache
            .get_or_compile(key(u16::SHAPE), Direction::Decode, || {
                cache.get_or_compile(key(u16::SHAPE), Direction::Decode, || unreachable!())?;
                unreachable!()
            })
            .unwrap_err();
        assert_eq!(err, CompileError::RecursiveCompilation { type_name: "u16" });
        assert!(cache.is_empty());
    }

    #[test]
    fn panicking_compile_releases_waiters() {
        let cache = CompilationCache::new(1, 16, None);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = cache.get_or_compile(key(i8::SHAPE), Direction::Encode, || panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(cache.stats().failures, 1);
        // The marker is gone, so the next request compiles again.
        let err = cache
            .get_or_compile(key(i8::SHAPE), Direction::Encode, || Err(CompileError::UnsupportedTarget))
            .unwrap_err();
        assert_eq!(err, CompileError::UnsupportedTarget);
    }

    #[cfg(any(all(target_arch = "x86_64", not(windows)), target_arch = "aarch64"))]
    mod native {
        use super::*;
        use crate::config::Config;
        use crate::pool::MemoryPool;

        fn compile(shape: &'static Shape) -> impl FnOnce() -> Result<CompiledRoutine, CompileError> {
            move || CompiledRoutine::compile(shape, Direction::Encode, &Config::default(), &MemoryPool::new(4))
        }

        #[test]
        fn hits_return_the_same_instance() {
            let cache = CompilationCache::new(4, 16, None);
            let a = cache.get_or_compile(key(u32::SHAPE), Direction::Encode, compile(u32::SHAPE)).unwrap();
            let b = cache
                .get_or_compile(key(u32::SHAPE), Direction::Encode, || unreachable!())
                .unwrap();
            assert!(Arc::ptr_eq(&a, &b));
            let stats = cache.stats();
            assert_eq!((stats.hits, stats.misses, stats.compilations), (1, 1, 1));
            assert_eq!(cache.accesses(key(u32::SHAPE), Direction::Encode), Some(2));
        }

        #[test]
        fn concurrent_requests_compile_once() {
            let cache = CompilationCache::new(4, 16, None);
            let compiled = AtomicUsize::new(0);
            let barrier = Barrier::new(8);
            let routines: Vec<_> = thread::scope(|s| {
                let handles: Vec<_> = (0..8)
                    .map(|_| {
                        s.spawn(|| {
                            barrier.wait();
                            cache
                                .get_or_compile(key(u64::SHAPE), Direction::Encode, || {
                                    compiled.fetch_add(1, Ordering::SeqCst);
                                    thread::sleep(Duration::from_millis(20));
                                    compile(u64::SHAPE)()
                                })
                                .unwrap()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });
            assert_eq!(compiled.load(Ordering::SeqCst), 1);
            assert!(routines.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        }

        #[test]
        fn least_recently_used_is_evicted_first() {
            let cache = CompilationCache::new(2, 2, None);
            cache.get_or_compile(key(u8::SHAPE), Direction::Encode, compile(u8::SHAPE)).unwrap();
            cache.get_or_compile(key(u16::SHAPE), Direction::Encode, compile(u16::SHAPE)).unwrap();
            // Refresh u8 so u16 becomes the oldest.
            cache.get_or_compile(key(u8::SHAPE), Direction::Encode, || unreachable!()).unwrap();
            cache.get_or_compile(key(u32::SHAPE), Direction::Encode, compile(u32::SHAPE)).unwrap();

            assert!(cache.contains(key(u8::SHAPE), Direction::Encode));
            assert!(!cache.contains(key(u16::SHAPE), Direction::Encode));
            assert!(cache.contains(key(u32::SHAPE), Direction::Encode));
            assert_eq!(cache.stats().evictions, 1);
        }

        #[test]
        fn expired_entries_are_swept() {
            let cache = CompilationCache::new(1, 16, Some(Duration::from_millis(10)));
            let first = cache.get_or_compile(key(i32::SHAPE), Direction::Encode, compile(i32::SHAPE)).unwrap();
            thread::sleep(Duration::from_millis(30));
            assert_eq!(cache.sweep_now(), 1);
            assert!(cache.is_empty());
            // A routine that was handed out keeps working after eviction.
            assert!(!first.code().is_empty());
        }

        #[test]
        fn invalidate_all_empties_the_table() {
            let cache = CompilationCache::new(4, 16, None);
            cache.get_or_compile(key(i64::SHAPE), Direction::Encode, compile(i64::SHAPE)).unwrap();
            cache.invalidate_all();
            assert!(!cache.contains(key(i64::SHAPE), Direction::Encode));
        }

        #[test]
        fn sweeper_thread_runs() {
            let cache = Arc::new(CompilationCache::new(1, 16, Some(Duration::from_millis(5))));
            cache.get_or_compile(key(i16::SHAPE), Direction::Encode, compile(i16::SHAPE)).unwrap();
            let _sweeper = cache.start_sweeper(Duration::from_millis(5)).unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while !cache.is_empty() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            assert!(cache.is_empty());
        }
    }
}
