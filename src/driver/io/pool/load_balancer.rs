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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use log::{debug, info};

use super::super::connection::DiscoveryQuery;
use super::discovery::Discovery;
use super::registry::ServerRegistry;
use super::routing::{DbKey, RoutingTable, RoutingTableStore};
use super::single_pool::SinglePooledConnection;
use super::{AcquireArgs, PoolConfig};
use crate::address_::Address;
use crate::driver::RoutingControl;
use crate::error_::{Neo4jError, Result};

/// Picks a server per access mode from the database's routing table.
#[derive(Debug)]
pub(crate) struct LoadBalancer {
    config: Arc<PoolConfig>,
    registry: Arc<ServerRegistry>,
    tables: Arc<RoutingTableStore>,
    discovery: Discovery,
    next_reader: AtomicUsize,
    next_writer: AtomicUsize,
}

impl LoadBalancer {
    pub(crate) fn new(
        config: Arc<PoolConfig>,
        registry: Arc<ServerRegistry>,
        query: Arc<dyn DiscoveryQuery>,
    ) -> Self {
        assert!(config.connect_options.routing_context.is_some());
        let tables = Arc::new(RoutingTableStore::new());
        let discovery = Discovery::new(
            Arc::clone(&config),
            query,
            Arc::clone(&registry),
            Arc::clone(&tables),
        );
        Self {
            config,
            registry,
            tables,
            discovery,
            next_reader: AtomicUsize::new(0),
            next_writer: AtomicUsize::new(0),
        }
    }

    pub(crate) fn acquire(&self, args: AcquireArgs) -> Result<SinglePooledConnection> {
        let rt_args = args.update_rt_args;
        let table = self.discovery.fresh_table(rt_args, args.mode)?;
        let candidates = self.candidates(&table, args.mode)?;
        let mut reachable = Vec::with_capacity(candidates.len());

        // first pass: take whatever is available right away
        for candidate in candidates {
            match self.registry.try_acquire(
                &candidate,
                rt_args.deadline,
                self.config.idle_time_before_connection_test,
            ) {
                Ok(Some(connection)) => return Ok(connection),
                Ok(None) => reachable.push(candidate),
                Err(err) if err.is_disconnect() => {
                    info!("skipping unreachable {candidate}: {err}");
                }
                Err(err) => return Err(err),
            }
        }

        // all reachable candidates are saturated: wait for any of them to make room
        loop {
            if reachable.is_empty() {
                return Err(self.all_unreachable(rt_args.db, args.mode));
            }
            let (i, unprepared) = self.registry.wait_for_any(&reachable, rt_args.deadline)?;
            match unprepared.prepare(
                rt_args.deadline,
                self.config.idle_time_before_connection_test,
            ) {
                Ok(Some(connection)) => return Ok(connection),
                Ok(None) => {}
                // the pool got dropped concurrently, a new one will be created
                Err(Neo4jError::Disposed { .. }) if !self.registry.is_closed() => {}
                Err(err) if err.is_disconnect() => {
                    info!("skipping unreachable {}: {err}", reachable[i]);
                    reachable.remove(i);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Candidates for `mode`, starting at the next server in round-robin order.
    fn candidates(
        &self,
        table: &RoutingTable,
        mode: RoutingControl,
    ) -> Result<Vec<Arc<Address>>> {
        let servers = table.servers_for_mode(mode);
        if servers.is_empty() {
            return Err(Neo4jError::session_expired(format!(
                "no servers available for {mode:?} in routing table {table:?}"
            )));
        }
        let counter = match mode {
            RoutingControl::Read => &self.next_reader,
            RoutingControl::Write => &self.next_writer,
        };
        let start = counter.fetch_add(1, Ordering::Relaxed) % servers.len();
        let candidates = servers
            .iter()
            .cycle()
            .skip(start)
            .take(servers.len())
            .map(Arc::clone)
            .collect_vec();
        debug!("{mode:?} candidates: {candidates:?}");
        Ok(candidates)
    }

    fn all_unreachable(&self, db: &DbKey, mode: RoutingControl) -> Neo4jError {
        info!("no {mode:?} server of {db:?} reachable, invalidating routing table");
        self.invalidate(db);
        Neo4jError::disconnect(format!("no {mode:?} server reachable"))
    }

    /// Remove `address` from all routing tables and close its idle connections.
    pub(crate) fn deactivate_server(&self, address: &Address) {
        self.discovery.deactivate_server(address);
    }

    /// Remove `address` from the writers of all routing tables.
    pub(crate) fn deactivate_writer(&self, address: &Address) {
        debug!("deactivating writer: {address}");
        self.tables.update_all(|table| table.without_writer(address));
    }

    /// Make the next acquisition for the database fetch a new routing table.
    pub(crate) fn invalidate(&self, db: &DbKey) {
        debug!("invalidating routing table for {db:?}");
        self.tables.update(db, |table| Some(table.expired()));
    }

    pub(crate) fn purge_aged_tables(&self, purge_delay: Duration) {
        self.tables.purge_aged(purge_delay);
        self.discovery.clean_up_pools();
    }

    pub(crate) fn routing_table(&self, db: &DbKey) -> Option<Arc<RoutingTable>> {
        self.tables.get(db)
    }
}
