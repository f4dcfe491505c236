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
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use log::debug;

use super::super::connection::DiscoveryResponse;
use crate::address_::Address;
use crate::driver::RoutingControl;

pub(crate) type DbKey = Option<Arc<String>>;

/// Upper bound for the ttl a router can hand out.
///
/// Keeps `created + ttl` representable as an [`Instant`].
const MAX_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Snapshot of the cluster topology for one database.
///
/// Tables are never changed in place.
/// Every change (refresh, removing a server) produces a new table that replaces the old one.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routers: Vec<Arc<Address>>,
    readers: Vec<Arc<Address>>,
    writers: Vec<Arc<Address>>,
    database: Option<Arc<String>>,
    pub(crate) initialized_without_writers: bool,
    created: Instant,
    ttl: Duration,
}

impl RoutingTable {
    /// Table that only knows the seed router and is stale right away.
    pub(crate) fn new(initial_router: Arc<Address>) -> Self {
        Self {
            routers: Vec::new(),
            readers: vec![initial_router],
            writers: Vec::new(),
            database: None,
            initialized_without_writers: true,
            created: Instant::now(),
            ttl: Duration::ZERO,
        }
    }

    pub(crate) fn from_discovery(response: DiscoveryResponse) -> Self {
        let DiscoveryResponse {
            ttl_seconds,
            database,
            routers,
            readers,
            writers,
        } = response;
        let into_arcs =
            |addresses: Vec<Address>| addresses.into_iter().map(Arc::new).collect::<Vec<_>>();
        let writers = into_arcs(writers);
        Self {
            routers: into_arcs(routers),
            readers: into_arcs(readers),
            initialized_without_writers: writers.is_empty(),
            writers,
            database: database.map(Arc::new),
            created: Instant::now(),
            ttl: Duration::from_secs(ttl_seconds).min(MAX_TTL),
        }
    }

    pub fn routers(&self) -> &[Arc<Address>] {
        &self.routers
    }

    pub fn readers(&self) -> &[Arc<Address>] {
        &self.readers
    }

    pub fn writers(&self) -> &[Arc<Address>] {
        &self.writers
    }

    /// The database this table belongs to, if known.
    pub fn database(&self) -> Option<&str> {
        self.database.as_ref().map(|db| db.as_str())
    }

    pub fn expires_at(&self) -> Instant {
        self.created + self.ttl
    }

    pub fn is_expired(&self) -> bool {
        self.created.elapsed() >= self.ttl
    }

    pub(crate) fn servers_for_mode(&self, mode: RoutingControl) -> &[Arc<Address>] {
        match mode {
            RoutingControl::Read => &self.readers,
            RoutingControl::Write => &self.writers,
        }
    }

    pub(crate) fn is_fresh(&self, mode: RoutingControl) -> bool {
        if self.routers.is_empty() {
            debug!("routing table expired: no routers left {:?}", self);
            return false;
        }
        if self.servers_for_mode(mode).is_empty() {
            debug!(
                "routing table expired: no servers for {:?} mode left {:?}",
                mode, self
            );
            return false;
        }
        if self.is_expired() {
            debug!(
                "routing table expired: ttl ({:?}) <= age ({:?}) {:?}",
                self.ttl,
                self.created.elapsed(),
                self
            );
            return false;
        }
        true
    }

    /// Whether the table expired more than `purge_delay` ago.
    pub(crate) fn is_aged(&self, purge_delay: Duration) -> bool {
        self.created.elapsed() >= self.ttl.saturating_add(purge_delay)
    }

    /// `None` if `addr` is not part of the table.
    pub(crate) fn without_server(&self, addr: &Address) -> Option<Self> {
        if !self.addresses().any(|a| **a == *addr) {
            return None;
        }
        let filter = |addresses: &[Arc<Address>]| {
            addresses
                .iter()
                .filter(|a| ***a != *addr)
                .map(Arc::clone)
                .collect()
        };
        Some(Self {
            routers: filter(&self.routers),
            readers: filter(&self.readers),
            writers: filter(&self.writers),
            ..self.clone()
        })
    }

    /// `None` if `addr` is not a writer of the table.
    pub(crate) fn without_writer(&self, addr: &Address) -> Option<Self> {
        if !self.writers.iter().any(|a| **a == *addr) {
            return None;
        }
        Some(Self {
            writers: self
                .writers
                .iter()
                .filter(|a| ***a != *addr)
                .map(Arc::clone)
                .collect(),
            ..self.clone()
        })
    }

    /// Copy of the table that is stale right away.
    pub(crate) fn expired(&self) -> Self {
        Self {
            ttl: Duration::ZERO,
            ..self.clone()
        }
    }

    pub(crate) fn addresses(&self) -> impl Iterator<Item = &Arc<Address>> {
        self.routers
            .iter()
            .chain(self.readers.iter())
            .chain(self.writers.iter())
    }
}

type RoutingTables = HashMap<DbKey, Arc<RoutingTable>>;

/// Copy-on-write map of routing tables.
///
/// Reads never lock.
/// Writers replace the whole map; a reader never sees a partially updated table.
#[derive(Debug, Default)]
pub(crate) struct RoutingTableStore {
    tables: ArcSwap<RoutingTables>,
}

impl RoutingTableStore {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    pub(crate) fn get(&self, db: &DbKey) -> Option<Arc<RoutingTable>> {
        self.tables.load().get(db).map(Arc::clone)
    }

    pub(crate) fn install(&self, db: DbKey, table: Arc<RoutingTable>) {
        debug!("storing new routing table for {db:?}: {table:?}");
        self.tables.rcu(|tables| {
            let mut tables = RoutingTables::clone(tables);
            tables.insert(db.clone(), Arc::clone(&table));
            tables
        });
    }

    /// Replace every table for which `f` returns a new version.
    pub(crate) fn update_all(&self, f: impl Fn(&RoutingTable) -> Option<RoutingTable>) {
        self.tables.rcu(|tables| {
            tables
                .iter()
                .map(|(db, table)| {
                    let table = f(table.as_ref())
                        .map(Arc::new)
                        .unwrap_or_else(|| Arc::clone(table));
                    (db.clone(), table)
                })
                .collect::<RoutingTables>()
        });
    }

    pub(crate) fn update(&self, db: &DbKey, f: impl Fn(&RoutingTable) -> Option<RoutingTable>) {
        self.tables.rcu(|tables| {
            let mut tables = RoutingTables::clone(tables);
            if let Some(new_table) = tables.get(db).and_then(|table| f(table.as_ref())) {
                tables.insert(db.clone(), Arc::new(new_table));
            }
            tables
        });
    }

    /// Remove tables that have been expired for longer than `purge_delay`.
    pub(crate) fn purge_aged(&self, purge_delay: Duration) {
        self.tables.rcu(|tables| {
            tables
                .iter()
                .filter(|(db, table)| {
                    let aged = table.is_aged(purge_delay);
                    if aged {
                        debug!("purging routing table for {db:?}");
                    }
                    !aged
                })
                .map(|(db, table)| (db.clone(), Arc::clone(table)))
                .collect::<RoutingTables>()
        });
    }

    /// All addresses referenced by any table.
    pub(crate) fn addresses(&self) -> HashSet<Arc<Address>> {
        self.tables
            .load()
            .values()
            .flat_map(|table| table.addresses().map(Arc::clone).collect::<Vec<_>>())
            .collect()
    }
}
