// Copyright 2020 Palantir Technologies, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
use crate::clock::Clock;
use crate::errors::{self, PoolManagerConstructionError};
use conjure_error::Error;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A compute-if-absent cache with an optional sliding expiry.
///
/// At most one construction runs per key. Callers arriving while a value is being constructed block until it
/// completes and then observe the same value or a copy of the same error. Failures are not cached.
pub(crate) struct TtlCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
}

struct Inner<K, V> {
    entries: HashMap<K, Slot<V>>,
    next_id: usize,
}

enum Slot<V> {
    Ready { value: V, last_access: Instant },
    Pending(Arc<Flight<V>>),
}

struct Flight<V> {
    id: usize,
    state: Mutex<Option<Result<V, Error>>>,
    done: Condvar,
}

impl<V> Flight<V>
where
    V: Clone,
{
    fn finish(&self, result: Result<V, Error>) {
        *self.state.lock() = Some(result);
        self.done.notify_all();
    }

    fn wait(&self) -> Result<V, Error> {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = &*state {
                return match result {
                    Ok(value) => Ok(value.clone()),
                    Err(e) => Err(errors::share(e)),
                };
            }
            self.done.wait(&mut state);
        }
    }
}

enum Lookup<V> {
    Hit(V),
    Wait(Arc<Flight<V>>),
    Miss,
}

/// The result of a cache lookup.
pub(crate) struct Fetched<V> {
    pub(crate) value: V,
    /// `true` if this call constructed the value.
    pub(crate) constructed: bool,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub(crate) fn new(ttl: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        TtlCache {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_id: 0,
            }),
            ttl,
            clock,
        }
    }

    fn expired(&self, last_access: Instant, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(last_access) >= ttl,
            None => false,
        }
    }

    pub(crate) fn get<F>(&self, key: K, make_value: F) -> Result<Fetched<V>, Error>
    where
        F: FnOnce() -> Result<V, Error>,
    {
        let now = self.clock.now();

        let mut inner = self.inner.lock();
        let lookup = match inner.entries.get_mut(&key) {
            Some(Slot::Ready { value, last_access }) => {
                if self.expired(*last_access, now) {
                    Lookup::Miss
                } else {
                    *last_access = now;
                    Lookup::Hit(value.clone())
                }
            }
            Some(Slot::Pending(flight)) => Lookup::Wait(flight.clone()),
            None => Lookup::Miss,
        };

        let flight = match lookup {
            Lookup::Hit(value) => {
                return Ok(Fetched {
                    value,
                    constructed: false,
                })
            }
            Lookup::Wait(flight) => {
                drop(inner);
                return flight.wait().map(|value| Fetched {
                    value,
                    constructed: false,
                });
            }
            Lookup::Miss => {
                inner.entries.retain(|_, slot| match slot {
                    Slot::Ready { last_access, .. } => !self.expired(*last_access, now),
                    Slot::Pending(_) => true,
                });

                let id = inner.next_id;
                inner.next_id += 1;
                let flight = Arc::new(Flight {
                    id,
                    state: Mutex::new(None),
                    done: Condvar::new(),
                });
                inner
                    .entries
                    .insert(key.clone(), Slot::Pending(flight.clone()));
                flight
            }
        };
        drop(inner);

        let guard = FlightGuard {
            cache: self,
            key,
            flight,
            done: false,
        };
        let result = make_value();
        guard.complete(result).map(|value| Fetched {
            value,
            constructed: true,
        })
    }

    /// Removes all entries whose key matches the predicate, returning the number of values removed.
    ///
    /// Constructions in progress for matching keys still complete for their callers but are not stored.
    pub(crate) fn invalidate_if<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&K) -> bool,
    {
        let mut removed = 0;
        self.inner.lock().entries.retain(|key, slot| {
            if !predicate(key) {
                return true;
            }
            if let Slot::Ready { .. } = slot {
                removed += 1;
            }
            false
        });
        removed
    }

    pub(crate) fn clear(&self) -> usize {
        self.invalidate_if(|_| true)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|s| matches!(s, Slot::Ready { .. }))
            .count()
    }
}

struct FlightGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    cache: &'a TtlCache<K, V>,
    key: K,
    flight: Arc<Flight<V>>,
    done: bool,
}

impl<K, V> FlightGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn is_current(&self, inner: &Inner<K, V>) -> bool {
        matches!(
            inner.entries.get(&self.key),
            Some(Slot::Pending(f)) if f.id == self.flight.id
        )
    }

    fn complete(mut self, result: Result<V, Error>) -> Result<V, Error> {
        let mut inner = self.cache.inner.lock();
        if self.is_current(&inner) {
            match &result {
                Ok(value) => {
                    let slot = Slot::Ready {
                        value: value.clone(),
                        last_access: self.cache.clock.now(),
                    };
                    inner.entries.insert(self.key.clone(), slot);
                }
                Err(_) => {
                    inner.entries.remove(&self.key);
                }
            }
        }
        drop(inner);

        let shared = match &result {
            Ok(value) => Ok(value.clone()),
            Err(e) => Err(errors::share(e)),
        };
        self.flight.finish(shared);
        self.done = true;

        result
    }
}

impl<K, V> Drop for FlightGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if self.done {
            return;
        }

        let mut inner = self.cache.inner.lock();
        if self.is_current(&inner) {
            inner.entries.remove(&self.key);
        }
        drop(inner);

        self.flight
            .finish(Err(Error::internal_safe(PoolManagerConstructionError::new(
                "construction panicked",
            ))));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::errors::{find_cause, IdentityLoadError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    const TTL: Duration = Duration::from_secs(60);

    fn cache(ttl: Option<Duration>) -> TtlCache<u32, Arc<u32>> {
        TtlCache::new(ttl, Arc::new(SystemClock))
    }

    #[test]
    fn hit_after_miss() {
        let cache = cache(None);
        let first = cache.get(0, || Ok(Arc::new(1))).unwrap();
        assert!(first.constructed);
        let second = cache.get(0, || panic!()).unwrap();
        assert!(!second.constructed);
        assert!(Arc::ptr_eq(&first.value, &second.value));
    }

    #[test]
    fn sliding_expiry() {
        let clock = Arc::new(ManualClock::new());
        let cache = TtlCache::new(Some(TTL), clock.clone());

        let value = cache.get(0, || Ok(Arc::new(1))).unwrap().value;

        clock.advance(TTL - Duration::from_secs(1));
        let hit = cache.get(0, || panic!()).unwrap().value;
        assert!(Arc::ptr_eq(&value, &hit));

        // the previous access restarted the window
        clock.advance(TTL - Duration::from_secs(1));
        let hit = cache.get(0, || panic!()).unwrap().value;
        assert!(Arc::ptr_eq(&value, &hit));

        clock.advance(TTL);
        let fresh = cache.get(0, || Ok(Arc::new(1))).unwrap();
        assert!(fresh.constructed);
        assert!(!Arc::ptr_eq(&value, &fresh.value));
    }

    #[test]
    fn expired_entries_are_swept() {
        let clock = Arc::new(ManualClock::new());
        let cache = TtlCache::new(Some(TTL), clock.clone());

        cache.get(0, || Ok(Arc::new(0))).unwrap();
        cache.get(1, || Ok(Arc::new(1))).unwrap();
        clock.advance(TTL);
        cache.get(2, || Ok(Arc::new(2))).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = cache(None);
        let error = cache
            .get(0, || Err(Error::internal_safe(IdentityLoadError::new("bad"))))
            .err()
            .unwrap();
        assert!(find_cause::<IdentityLoadError>(&error).is_some());
        assert_eq!(cache.len(), 0);

        let value = cache.get(0, || Ok(Arc::new(1))).unwrap();
        assert!(value.constructed);
    }

    #[test]
    fn single_construction_under_contention() {
        let cache = Arc::new(cache(None));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get(0, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(100));
                            Ok(Arc::new(1))
                        })
                        .unwrap()
                        .value
                })
            })
            .collect::<Vec<_>>();

        let values = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }

    #[test]
    fn failure_reaches_all_waiters() {
        let cache = Arc::new(cache(None));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let handles = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get(0, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(100));
                            Err(Error::internal_safe(IdentityLoadError::new("bad key")))
                        })
                        .err()
                        .unwrap()
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            let error = handle.join().unwrap();
            assert_eq!(
                find_cause::<IdentityLoadError>(&error).unwrap().message(),
                "bad key"
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn panicking_construction_is_not_cached() {
        let cache = Arc::new(cache(None));

        let result = thread::spawn({
            let cache = cache.clone();
            move || cache.get(0, || panic!("boom")).map(|f| f.value)
        })
        .join();
        assert!(result.is_err());

        let value = cache.get(0, || Ok(Arc::new(1))).unwrap();
        assert!(value.constructed);
    }

    #[test]
    fn invalidate_matching() {
        let cache = cache(None);
        for i in 0..6 {
            cache.get(i, || Ok(Arc::new(i))).unwrap();
        }

        assert_eq!(cache.invalidate_if(|k| k % 2 == 0), 3);
        assert_eq!(cache.len(), 3);
        assert!(cache.get(1, || panic!()).is_ok());
        assert!(cache.get(0, || Ok(Arc::new(0))).unwrap().constructed);

        assert_eq!(cache.clear(), 4);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn invalidated_construction_is_not_published() {
        let cache = cache(None);
        let value = cache
            .get(0, || {
                assert_eq!(cache.invalidate_if(|_| true), 0);
                Ok(Arc::new(1))
            })
            .unwrap();
        assert!(value.constructed);
        assert_eq!(cache.len(), 0);
    }
}
