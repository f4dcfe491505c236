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

use std::collections::VecDeque;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::lock_api::MutexGuard;
use parking_lot::{Condvar, Mutex, RawMutex};

use super::super::connection::Connection;
use super::tracker::{ConnectionId, ConnectionTracker};
use super::PoolConfig;
use crate::address_::Address;
use crate::error_::{Neo4jError, Result};

#[derive(Debug)]
pub(crate) struct PoolElement {
    id: ConnectionId,
    connection: Box<dyn Connection>,
    created_at: Instant,
    last_used_at: Instant,
    generation: usize,
}

impl PoolElement {
    fn is_older_than(&self, lifetime: Duration) -> bool {
        self.created_at.elapsed() >= lifetime
    }

    fn is_idle_for(&self, timeout: Duration) -> bool {
        self.last_used_at.elapsed() >= timeout
    }

    fn purge_reason(&self, config: &PoolConfig) -> Option<&'static str> {
        if !self.connection.is_open() {
            return Some("connection closed while idle");
        }
        if let Some(lifetime) = config.max_connection_lifetime {
            if self.is_older_than(lifetime) {
                return Some("connection reached max lifetime");
            }
        }
        if let Some(timeout) = config.connection_idle_timeout {
            if self.is_idle_for(timeout) {
                return Some("connection reached idle timeout");
            }
        }
        None
    }
}

/// Signalled whenever any pool of a registry made room.
#[derive(Debug, Default)]
pub(crate) struct RoomSignal {
    pub(crate) lock: Mutex<()>,
    pub(crate) cond: Condvar,
}

impl RoomSignal {
    fn notify(&self) {
        let _lock = self.lock.lock();
        self.cond.notify_all();
    }
}

#[derive(Debug)]
pub(crate) struct InnerPool {
    address: Arc<Address>,
    config: Arc<PoolConfig>,
    tracker: Arc<ConnectionTracker>,
    room_signal: Arc<RoomSignal>,
    synced: Mutex<InnerPoolSyncedData>,
    made_room_condition: Condvar,
}

#[derive(Debug)]
struct InnerPoolSyncedData {
    raw_pool: VecDeque<PoolElement>,
    reservations: usize,
    borrowed: usize,
    closing: usize,
    created: usize,
    failed_to_create: usize,
    closed: usize,
    generation: usize,
    state: ConnectionPoolState,
    acquisition_times: AcquisitionTimes,
}

impl InnerPool {
    fn new(
        address: Arc<Address>,
        config: Arc<PoolConfig>,
        tracker: Arc<ConnectionTracker>,
        room_signal: Arc<RoomSignal>,
    ) -> Self {
        let raw_pool = VecDeque::with_capacity(config.max_connection_pool_size);
        let synced = Mutex::new(InnerPoolSyncedData {
            raw_pool,
            reservations: 0,
            borrowed: 0,
            closing: 0,
            created: 0,
            failed_to_create: 0,
            closed: 0,
            generation: 0,
            state: ConnectionPoolState::Active,
            acquisition_times: AcquisitionTimes::default(),
        });
        Self {
            address,
            config,
            tracker,
            room_signal,
            synced,
            made_room_condition: Condvar::new(),
        }
    }

    fn acquire_new(&self, deadline: Option<Instant>) -> Result<PoolElement> {
        let connection = self.open_new(deadline);
        let mut sync = self.synced.lock();
        sync.reservations -= 1;
        let connection = match connection {
            Ok(connection) => connection,
            Err(err) => {
                sync.failed_to_create += 1;
                drop(sync);
                info!("failed to open connection to {}: {}", self.address, err);
                self.notify_room();
                return Err(err);
            }
        };
        sync.created += 1;
        if sync.state == ConnectionPoolState::Deactivated {
            // the server is reachable again
            sync.state = ConnectionPoolState::Active;
        }
        let now = Instant::now();
        let element = PoolElement {
            id: self.tracker.next_id(),
            connection,
            created_at: now,
            last_used_at: now,
            generation: sync.generation,
        };
        self.tracker.register(
            element.id,
            Arc::clone(&self.address),
            now,
            element.connection.terminator(),
        );
        if sync.state == ConnectionPoolState::Closed {
            sync.closing += 1;
            drop(sync);
            self.finish_close(vec![element], "pool closed while connecting");
            return Err(Neo4jError::disposed("connection pool"));
        }
        sync.borrowed += 1;
        debug!("{}: opened to {}", element.id, self.address);
        Ok(element)
    }

    fn open_new(&self, deadline: Option<Instant>) -> Result<Box<dyn Connection>> {
        self.config.connector.open(
            Arc::clone(&self.address),
            &self.config.connect_options,
            deadline,
        )
    }

    fn cancel_reservation(&self) {
        self.synced.lock().reservations -= 1;
        self.notify_room();
    }

    /// Elements must have been accounted for in `closing` already.
    fn finish_close(&self, elements: Vec<PoolElement>, reason: &str) {
        if elements.is_empty() {
            return;
        }
        let count = elements.len();
        for mut element in elements {
            debug!("{}: closing ({reason})", element.id);
            element.connection.close();
            self.tracker.unregister(element.id);
        }
        {
            let mut sync = self.synced.lock();
            sync.closing -= count;
            sync.closed += count;
        }
        self.notify_room();
    }

    fn notify_room(&self) {
        self.made_room_condition.notify_all();
        self.room_signal.notify();
    }

    fn release(inner_pool: &Arc<InnerPool>, mut element: PoolElement, healthy: bool) {
        let mut sync = inner_pool.synced.lock();
        sync.borrowed -= 1;
        let close_reason = if !healthy {
            Some("released as unhealthy")
        } else if !element.connection.is_open() {
            Some("connection closed while in use")
        } else if sync.state == ConnectionPoolState::Closed {
            Some("pool closed")
        } else if element.generation != sync.generation {
            Some("marked for close")
        } else if inner_pool
            .config
            .max_connection_lifetime
            .map(|lifetime| element.is_older_than(lifetime))
            .unwrap_or(false)
        {
            Some("connection reached max lifetime")
        } else if inner_pool
            .config
            .max_idle_connection_pool_size
            .map(|max_idle| sync.raw_pool.len() >= max_idle)
            .unwrap_or(false)
        {
            Some("idle pool full")
        } else {
            None
        };
        match close_reason {
            None => {
                element.last_used_at = Instant::now();
                sync.raw_pool.push_back(element);
                drop(sync);
                inner_pool.notify_room();
            }
            Some(reason) => {
                sync.closing += 1;
                drop(sync);
                inner_pool.finish_close(vec![element], reason);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SimplePool(Arc<InnerPool>);

impl SimplePool {
    pub(crate) fn new(
        address: Arc<Address>,
        config: Arc<PoolConfig>,
        tracker: Arc<ConnectionTracker>,
        room_signal: Arc<RoomSignal>,
    ) -> Self {
        Self(Arc::new(InnerPool::new(
            address,
            config,
            tracker,
            room_signal,
        )))
    }

    pub(crate) fn address(&self) -> &Arc<Address> {
        &self.address
    }

    pub(crate) fn acquire(
        &self,
        deadline: Option<Instant>,
    ) -> Result<UnpreparedSinglePooledConnection> {
        {
            let mut synced = self.synced.lock();
            loop {
                if synced.state == ConnectionPoolState::Closed {
                    return Err(Neo4jError::disposed("connection pool"));
                }
                if let Some(element) = Self::acquire_existing(&mut synced) {
                    return Ok(UnpreparedSinglePooledConnection::new(
                        Slot::Existing(element),
                        Arc::clone(&self.0),
                    ));
                }
                if self.has_room(&synced) {
                    synced.reservations += 1;
                    break;
                } else {
                    self.wait_for_room(deadline, &mut synced)?;
                }
            }
        }
        Ok(UnpreparedSinglePooledConnection::new(
            Slot::Reservation,
            Arc::clone(&self.0),
        ))
    }

    fn wait_for_room(
        &self,
        deadline: Option<Instant>,
        synced: &mut MutexGuard<RawMutex, InnerPoolSyncedData>,
    ) -> Result<()> {
        match deadline {
            None => self.made_room_condition.wait(synced),
            Some(deadline) => {
                if self
                    .made_room_condition
                    .wait_until(synced, deadline)
                    .timed_out()
                {
                    return Err(Neo4jError::connection_acquisition_timeout(
                        "waiting for room in the connection pool",
                    ));
                }
            }
        }
        Ok(())
    }

    /// `Ok(None)` if the pool is saturated.
    pub(crate) fn acquire_no_wait(&self) -> Result<Option<UnpreparedSinglePooledConnection>> {
        {
            let mut synced = self.synced.lock();
            if synced.state == ConnectionPoolState::Closed {
                return Err(Neo4jError::disposed("connection pool"));
            }
            if let Some(element) = Self::acquire_existing(&mut synced) {
                return Ok(Some(UnpreparedSinglePooledConnection::new(
                    Slot::Existing(element),
                    Arc::clone(&self.0),
                )));
            }
            if self.has_room(&synced) {
                synced.reservations += 1;
            } else {
                return Ok(None);
            }
        }
        Ok(Some(UnpreparedSinglePooledConnection::new(
            Slot::Reservation,
            Arc::clone(&self.0),
        )))
    }

    fn has_room(&self, synced: &InnerPoolSyncedData) -> bool {
        synced.raw_pool.len() + synced.borrowed + synced.reservations + synced.closing
            < self.config.max_connection_pool_size
    }

    fn acquire_existing(synced: &mut InnerPoolSyncedData) -> Option<PoolElement> {
        let element = synced.raw_pool.pop_front();
        if element.is_some() {
            synced.borrowed += 1;
        }
        element
    }

    /// Close all idle connections and mark all borrowed ones to be closed on release.
    ///
    /// The pool stays usable.
    pub(crate) fn deactivate(&self) {
        let idle = {
            let mut synced = self.synced.lock();
            if synced.state == ConnectionPoolState::Active {
                synced.state = ConnectionPoolState::Deactivated;
            }
            synced.generation += 1;
            let idle = mem::take(&mut synced.raw_pool);
            synced.closing += idle.len();
            idle
        };
        self.finish_close(idle.into(), "server deactivated");
    }

    /// Like [`SimplePool::deactivate()`], but further acquisitions fail.
    ///
    /// Closing is idempotent.
    pub(crate) fn close(&self) {
        let idle = {
            let mut synced = self.synced.lock();
            if synced.state == ConnectionPoolState::Closed && synced.raw_pool.is_empty() {
                return;
            }
            synced.state = ConnectionPoolState::Closed;
            synced.generation += 1;
            let idle = mem::take(&mut synced.raw_pool);
            synced.closing += idle.len();
            idle
        };
        self.finish_close(idle.into(), "pool closed");
        // wake up waiters so that they can fail fast
        self.notify_room();
    }

    /// Close idle connections that are broken, too old, or have been idle for too long.
    pub(crate) fn purge_idle(&self) {
        let purged = {
            let mut synced = self.synced.lock();
            let (purged, kept): (Vec<_>, Vec<_>) = mem::take(&mut synced.raw_pool)
                .into_iter()
                .partition(|element| element.purge_reason(&self.config).is_some());
            synced.raw_pool = kept.into();
            synced.closing += purged.len();
            purged
        };
        self.finish_close(purged, "purged while idle");
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.synced.lock().state == ConnectionPoolState::Closed
    }

    pub(crate) fn get_metrics(&self) -> ConnectionPoolMetrics {
        let synced = self.synced.lock();
        ConnectionPoolMetrics {
            created: synced.created,
            closed: synced.closed,
            failed_to_create: synced.failed_to_create,
            creating: synced.reservations,
            closing: synced.closing,
            in_use: synced.borrowed,
            idle: synced.raw_pool.len(),
            state: synced.state,
            acquisition_times: synced.acquisition_times,
        }
    }
}

impl Deref for SimplePool {
    type Target = InnerPool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug)]
enum Slot {
    Existing(PoolElement),
    Reservation,
}

/// Either an idle connection taken from the pool or a reservation to open a new one.
///
/// Dropping it returns the connection or the reservation to the pool.
#[derive(Debug)]
pub(crate) struct UnpreparedSinglePooledConnection {
    pool: Arc<InnerPool>,
    slot: Option<Slot>,
}

impl UnpreparedSinglePooledConnection {
    fn new(slot: Slot, pool: Arc<InnerPool>) -> Self {
        Self {
            pool,
            slot: Some(slot),
        }
    }

    /// `Ok(None)` means the idle connection turned out to be unusable and has been discarded.
    /// The caller should try again.
    pub(crate) fn prepare(
        mut self,
        deadline: Option<Instant>,
        idle_time_before_connection_test: Option<Duration>,
    ) -> Result<Option<SinglePooledConnection>> {
        let slot = self
            .slot
            .take()
            .expect("slot option should be Some from init to prepare");
        let pool = Arc::clone(&self.pool);
        match slot {
            Slot::Reservation => {
                let element = self.pool.acquire_new(deadline)?;
                Ok(Some(SinglePooledConnection::new(element, pool)))
            }
            Slot::Existing(mut element) => {
                if let Some(reason) = element.purge_reason(&self.pool.config) {
                    debug!("{}: {reason}", element.id);
                    InnerPool::release(&self.pool, element, false);
                    return Ok(None);
                }
                if let Some(timeout) = idle_time_before_connection_test {
                    if let Err(err) = Self::liveness_check(&mut element, timeout, deadline) {
                        debug!("{}: liveness check failed: {}", element.id, err);
                        InnerPool::release(&self.pool, element, false);
                        return Ok(None);
                    }
                }
                Ok(Some(SinglePooledConnection::new(element, pool)))
            }
        }
    }

    fn liveness_check(
        element: &mut PoolElement,
        timeout: Duration,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if element.is_idle_for(timeout) {
            debug!("{}: liveness check", element.id);
            element.connection.reset(deadline)?;
            element.last_used_at = Instant::now();
        }
        Ok(())
    }
}

impl Drop for UnpreparedSinglePooledConnection {
    fn drop(&mut self) {
        match self.slot.take() {
            None => {}
            Some(Slot::Existing(element)) => InnerPool::release(&self.pool, element, true),
            Some(Slot::Reservation) => self.pool.cancel_reservation(),
        }
    }
}

/// A connection borrowed from a single-address pool.
///
/// Returned to the pool (or closed) when dropped.
#[derive(Debug)]
pub(crate) struct SinglePooledConnection {
    pool: Arc<InnerPool>,
    element: Option<PoolElement>,
    healthy: bool,
}

impl SinglePooledConnection {
    fn new(element: PoolElement, pool: Arc<InnerPool>) -> Self {
        Self {
            pool,
            element: Some(element),
            healthy: true,
        }
    }

    fn element(&self) -> &PoolElement {
        self.element
            .as_ref()
            .expect("element option should be Some from init to drop")
    }

    fn element_mut(&mut self) -> &mut PoolElement {
        self.element
            .as_mut()
            .expect("element option should be Some from init to drop")
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.element().id
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.element().created_at
    }

    pub(crate) fn last_used_at(&self) -> Instant {
        self.element().last_used_at
    }

    pub(crate) fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Count `waited` towards the acquisition times of the connection's pool.
    pub(crate) fn record_acquisition(&self, waited: Duration) {
        self.pool.synced.lock().acquisition_times.record(waited);
    }
}

impl Drop for SinglePooledConnection {
    fn drop(&mut self) {
        let element = self
            .element
            .take()
            .expect("element option should be Some from init to drop");
        InnerPool::release(&self.pool, element, self.healthy);
    }
}

impl Deref for SinglePooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.element().connection.as_ref()
    }
}

impl DerefMut for SinglePooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.element_mut().connection.as_mut()
    }
}

/// Snapshot of the bookkeeping of the connection pool for a single address.
///
/// At every point where no connection is being opened or closed,
/// `created - closed == in_use + idle` holds.
/// `created + failed_to_create` is the number of attempts to open a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct ConnectionPoolMetrics {
    pub created: usize,
    pub closed: usize,
    pub failed_to_create: usize,
    pub creating: usize,
    pub closing: usize,
    pub in_use: usize,
    pub idle: usize,
    pub state: ConnectionPoolState,
    pub acquisition_times: AcquisitionTimes,
}

/// Lifecycle of the connection pool for a single address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ConnectionPoolState {
    #[default]
    Active,
    /// The server failed and the pool's idle connections were closed.
    /// Back to [`ConnectionPoolState::Active`] once a new connection could be opened.
    Deactivated,
    /// Terminal, acquisitions fail.
    Closed,
}

/// How long successful acquisitions took,
/// from the caller asking for a connection until it got one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct AcquisitionTimes {
    pub count: u64,
    pub max: Duration,
    pub total: Duration,
}

impl AcquisitionTimes {
    fn record(&mut self, waited: Duration) {
        self.count += 1;
        self.max = self.max.max(waited);
        self.total = self.total.saturating_add(waited);
    }

    /// `None` if nothing has been acquired yet.
    pub fn mean(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        let nanos = self.total.as_nanos() / u128::from(self.count);
        Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }
}

impl ConnectionPoolMetrics {
    /// Whether the pool's counters reconcile.
    ///
    /// Connections currently being closed are still counted as created but not closed.
    pub fn is_consistent(&self) -> bool {
        self.created >= self.closed
            && self.created - self.closed == self.in_use + self.idle + self.closing
    }
}
