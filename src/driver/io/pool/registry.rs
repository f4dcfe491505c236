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

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::MutexGuard;

use super::single_pool::{
    ConnectionPoolMetrics, RoomSignal, SimplePool, SinglePooledConnection,
    UnpreparedSinglePooledConnection,
};
use super::tracker::ConnectionTracker;
use super::{PoolConfig, DEFAULT_CLUSTER_SIZE};
use crate::address_::Address;
use crate::error_::{Neo4jError, Result};
use crate::sync::MostlyRLock;

type Pools = HashMap<Arc<Address>, SimplePool>;

/// One connection pool per server address.
///
/// The registry never retries on its own:
/// every failure to open a connection is reported to the caller exactly once.
#[derive(Debug)]
pub(crate) struct ServerRegistry {
    config: Arc<PoolConfig>,
    pools: MostlyRLock<Pools>,
    tracker: Arc<ConnectionTracker>,
    room_signal: Arc<RoomSignal>,
    closed: AtomicBool,
}

impl ServerRegistry {
    pub(crate) fn new(config: Arc<PoolConfig>) -> Self {
        Self {
            config,
            pools: MostlyRLock::new(HashMap::with_capacity(DEFAULT_CLUSTER_SIZE)),
            tracker: Arc::new(ConnectionTracker::new()),
            room_signal: Default::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Acquire a connection to `address`, waiting for room in its pool if necessary.
    pub(crate) fn acquire(
        &self,
        address: &Arc<Address>,
        deadline: Option<Instant>,
        idle_time_before_connection_test: Option<Duration>,
    ) -> Result<SinglePooledConnection> {
        loop {
            let unprepared = match self.pool_for(address)?.acquire(deadline) {
                Err(Neo4jError::Disposed { .. }) if !self.is_closed() => continue,
                res => res?,
            };
            match unprepared.prepare(deadline, idle_time_before_connection_test) {
                Ok(Some(connection)) => return Ok(connection),
                Ok(None) => continue,
                Err(Neo4jError::Disposed { .. }) if !self.is_closed() => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// `Ok(None)` if the pool for `address` is saturated.
    pub(crate) fn acquire_no_wait(
        &self,
        address: &Arc<Address>,
    ) -> Result<Option<UnpreparedSinglePooledConnection>> {
        loop {
            match self.pool_for(address)?.acquire_no_wait() {
                // the pool got dropped concurrently, a new one will be created
                Err(Neo4jError::Disposed { .. }) if !self.is_closed() => continue,
                res => return res,
            }
        }
    }

    /// Like [`ServerRegistry::acquire()`], but `Ok(None)` instead of waiting if the pool
    /// for `address` is saturated.
    pub(crate) fn try_acquire(
        &self,
        address: &Arc<Address>,
        deadline: Option<Instant>,
        idle_time_before_connection_test: Option<Duration>,
    ) -> Result<Option<SinglePooledConnection>> {
        loop {
            let Some(unprepared) = self.acquire_no_wait(address)? else {
                return Ok(None);
            };
            match unprepared.prepare(deadline, idle_time_before_connection_test) {
                Ok(Some(connection)) => return Ok(Some(connection)),
                Ok(None) => {}
                Err(Neo4jError::Disposed { .. }) if !self.is_closed() => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Wait until the pool of any of `addresses` has room and take it.
    ///
    /// Returns the index of the address together with the unprepared connection.
    /// Fails with a timeout if `deadline` passes first.
    pub(crate) fn wait_for_any(
        &self,
        addresses: &[Arc<Address>],
        deadline: Option<Instant>,
    ) -> Result<(usize, UnpreparedSinglePooledConnection)> {
        let mut room = self.room_lock();
        loop {
            for (i, address) in addresses.iter().enumerate() {
                if let Some(unprepared) = self.acquire_no_wait(address)? {
                    return Ok((i, unprepared));
                }
            }
            self.wait_for_room(&mut room, deadline)?;
        }
    }

    /// Must be held while checking pools for room before calling
    /// [`ServerRegistry::wait_for_room()`].
    fn room_lock(&self) -> MutexGuard<'_, ()> {
        self.room_signal.lock.lock()
    }

    /// Wait until any pool of this registry made room (or got closed).
    fn wait_for_room(
        &self,
        lock: &mut MutexGuard<'_, ()>,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Neo4jError::disposed("driver"));
        }
        match deadline {
            None => self.room_signal.cond.wait(lock),
            Some(deadline) => {
                if self.room_signal.cond.wait_until(lock, deadline).timed_out() {
                    return Err(Neo4jError::connection_acquisition_timeout(
                        "waiting for room in the connection pool",
                    ));
                }
            }
        }
        Ok(())
    }

    fn pool_for(&self, address: &Arc<Address>) -> Result<SimplePool> {
        if self.is_closed() {
            return Err(Neo4jError::disposed("driver"));
        }
        let pools = self.pools.maybe_write(
            |pools| !pools.contains_key(address),
            |mut pools| {
                if !pools.contains_key(address) {
                    debug!("creating connection pool for {address}");
                    pools.insert(
                        Arc::clone(address),
                        SimplePool::new(
                            Arc::clone(address),
                            Arc::clone(&self.config),
                            Arc::clone(&self.tracker),
                            Arc::clone(&self.room_signal),
                        ),
                    );
                }
                Ok(())
            },
        )?;
        let pool = pools
            .get(address)
            .map(SimplePool::clone)
            .expect("pool created above");
        drop(pools);
        if self.is_closed() {
            // lost the race against close(), which might not have seen this pool
            return Err(Neo4jError::disposed("driver"));
        }
        Ok(pool)
    }

    /// Drop the pools of all addresses not in `keep`.
    ///
    /// Idle connections of dropped pools are closed right away, borrowed ones on release.
    pub(crate) fn retain(&self, keep: &HashSet<Arc<Address>>) {
        let mut removed = Vec::new();
        drop(self.pools.update(|mut pools| {
            let stale = pools
                .keys()
                .filter(|address| !keep.contains(*address))
                .map(Arc::clone)
                .collect::<Vec<_>>();
            for address in stale {
                if let Some(pool) = pools.remove(&address) {
                    removed.push(pool);
                }
            }
            Ok(())
        }));
        for pool in removed {
            debug!("dropping connection pool for {}", pool.address());
            pool.close();
        }
    }

    /// Close idle connections to `address` and make sure borrowed ones won't be reused.
    pub(crate) fn deactivate(&self, address: &Address) {
        let pool = self.pools.read().get(address).map(SimplePool::clone);
        if let Some(pool) = pool {
            debug!("deactivating connection pool for {address}");
            pool.deactivate();
        }
    }

    pub(crate) fn purge_idle(&self) {
        for pool in self.all_pools() {
            pool.purge_idle();
        }
    }

    /// Close all pools.
    ///
    /// Idle connections are closed right away, borrowed ones on release.
    /// Further acquisitions fail with [`Neo4jError::Disposed`].
    /// Closing more than once is a no-op.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("closing all connection pools");
        }
        for pool in self.all_pools() {
            pool.close();
        }
        let _lock = self.room_signal.lock.lock();
        self.room_signal.cond.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn get_metrics(&self, address: &Address) -> Option<ConnectionPoolMetrics> {
        self.pools.read().get(address).map(SimplePool::get_metrics)
    }

    fn all_pools(&self) -> Vec<SimplePool> {
        self.pools.read().values().map(SimplePool::clone).collect()
    }
}
