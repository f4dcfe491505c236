// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Neo4jError, Result};

#[derive(Debug)]
pub(crate) struct MostlyRLock<T: Debug> {
    inner: RwLock<T>,
    updating: AtomicBool,
}

impl<T: Debug> MostlyRLock<T> {
    pub(crate) fn new(inner: T) -> Self {
        let inner = RwLock::new(inner);
        Self {
            inner,
            updating: AtomicBool::new(false),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<T> {
        self.inner.read()
    }

    pub(crate) fn update<'a, UPDATE: FnMut(RwLockWriteGuard<'a, T>) -> Result<()>>(
        &'a self,
        mut updater: UPDATE,
    ) -> Result<RwLockReadGuard<'a, T>> {
        let done = RefCell::new(false);
        self.maybe_write(
            {
                let done = &done;
                |_| !*done.borrow()
            },
            {
                let done = &done;
                |lock| {
                    *done.borrow_mut() = true;
                    updater(lock)
                }
            },
        )
    }

    /// Only one writer at a time.
    /// The updater must re-check the condition as another writer might have run in between.
    pub(crate) fn maybe_write<
        'a,
        CHECK: FnMut(&RwLockReadGuard<'a, T>) -> bool,
        UPDATE: FnMut(RwLockWriteGuard<'a, T>) -> Result<()>,
    >(
        &'a self,
        mut needs_update: CHECK,
        mut updater: UPDATE,
    ) -> Result<RwLockReadGuard<'a, T>> {
        loop {
            {
                let r_lock = self.inner.read();
                if !needs_update(&r_lock) {
                    return Ok(r_lock);
                }
                // avoid drowning the writer
                RwLockReadGuard::unlock_fair(r_lock);
            }
            let already_updating = self.updating.swap(true, Ordering::SeqCst);
            if !already_updating {
                let w_lock = self.inner.write();
                self.updating.store(false, Ordering::SeqCst);
                updater(w_lock)?;
                return Ok(self.inner.read());
            }
        }
    }
}

/// Coalesces concurrent executions of the same work.
///
/// The first caller for a key (the leader) runs the work.
/// Callers arriving while it runs (followers) wait for the leader's result.
#[derive(Debug)]
pub(crate) struct SingleFlight<K, V> {
    flights: Mutex<HashMap<K, Arc<Flight<V>>>>,
}

#[derive(Debug)]
struct Flight<V> {
    result: Mutex<Option<Result<V>>>,
    landed: Condvar,
}

impl<K: Hash + Eq + Clone + Debug, V: Clone> SingleFlight<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn run(
        &self,
        key: &K,
        deadline: Option<Instant>,
        work: impl FnOnce() -> Result<V>,
    ) -> Result<V> {
        let (flight, is_leader) = {
            let mut flights = self.flights.lock();
            match flights.get(key) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight {
                        result: Mutex::new(None),
                        landed: Condvar::new(),
                    });
                    flights.insert(key.clone(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };
        if !is_leader {
            debug!("joining in-flight work for {key:?}");
            return flight.wait(deadline);
        }
        let mut guard = LandingGuard {
            group: self,
            key,
            flight: &flight,
            landed: false,
        };
        let res = work();
        guard.land(res.clone());
        res
    }

    fn finish(&self, key: &K, flight: &Flight<V>, res: Result<V>) {
        // new callers must start a new flight from here on
        self.flights.lock().remove(key);
        *flight.result.lock() = Some(res);
        flight.landed.notify_all();
    }
}

impl<V: Clone> Flight<V> {
    fn wait(&self, deadline: Option<Instant>) -> Result<V> {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            match deadline {
                None => self.landed.wait(&mut result),
                Some(deadline) => {
                    if self.landed.wait_until(&mut result, deadline).timed_out() {
                        if let Some(result) = result.as_ref() {
                            return result.clone();
                        }
                        return Err(Neo4jError::connection_acquisition_timeout(
                            "waiting for another thread to fetch routing information",
                        ));
                    }
                }
            }
        }
    }
}

struct LandingGuard<'a, K: Hash + Eq + Clone + Debug, V: Clone> {
    group: &'a SingleFlight<K, V>,
    key: &'a K,
    flight: &'a Flight<V>,
    landed: bool,
}

impl<K: Hash + Eq + Clone + Debug, V: Clone> LandingGuard<'_, K, V> {
    fn land(&mut self, res: Result<V>) {
        self.landed = true;
        self.group.finish(self.key, self.flight, res);
    }
}

impl<K: Hash + Eq + Clone + Debug, V: Clone> Drop for LandingGuard<'_, K, V> {
    fn drop(&mut self) {
        if !self.landed {
            // the leader panicked, don't leave followers hanging
            self.group.finish(
                self.key,
                self.flight,
                Err(Neo4jError::disconnect(
                    "fetching routing information was aborted",
                )),
            );
        }
    }
}
