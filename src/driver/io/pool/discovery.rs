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

use std::sync::Arc;

use log::{debug, error, info};

use super::super::connection::{DiscoveryQuery, DiscoveryRequest};
use super::registry::ServerRegistry;
use super::routing::{DbKey, RoutingTable, RoutingTableStore};
use super::single_pool::SinglePooledConnection;
use super::{PoolConfig, UpdateRtArgs};
use crate::address_::Address;
use crate::driver::RoutingControl;
use crate::error_::{Neo4jError, Result};
use crate::sync::SingleFlight;

/// Fetches fresh routing tables from the cluster's routers.
///
/// At most one refresh per database is in flight at any time.
/// Callers arriving while a refresh is running wait for its outcome.
#[derive(Debug)]
pub(crate) struct Discovery {
    config: Arc<PoolConfig>,
    query: Arc<dyn DiscoveryQuery>,
    registry: Arc<ServerRegistry>,
    tables: Arc<RoutingTableStore>,
    flights: SingleFlight<DbKey, Arc<RoutingTable>>,
}

impl Discovery {
    pub(crate) fn new(
        config: Arc<PoolConfig>,
        query: Arc<dyn DiscoveryQuery>,
        registry: Arc<ServerRegistry>,
        tables: Arc<RoutingTableStore>,
    ) -> Self {
        Self {
            config,
            query,
            registry,
            tables,
            flights: SingleFlight::new(),
        }
    }

    /// The current table for the database if it's fresh for `mode`, otherwise a new one.
    pub(crate) fn fresh_table(
        &self,
        args: UpdateRtArgs,
        mode: RoutingControl,
    ) -> Result<Arc<RoutingTable>> {
        if let Some(table) = self.tables.get(args.db) {
            if table.is_fresh(mode) {
                return Ok(table);
            }
        }
        self.flights.run(args.db, args.deadline, || {
            // a flight that just landed might have done the work already
            if let Some(table) = self.tables.get(args.db) {
                if table.is_fresh(mode) {
                    return Ok(table);
                }
            }
            self.update_rt(args, mode)
        })
    }

    fn update_rt(&self, args: UpdateRtArgs, mode: RoutingControl) -> Result<Arc<RoutingTable>> {
        let seed = &self.config.address;
        let current = self
            .tables
            .get(args.db)
            .unwrap_or_else(|| Arc::new(RoutingTable::new(Arc::clone(seed))));
        let routers = current
            .routers()
            .iter()
            .filter(|&router| router != seed)
            .map(Arc::clone)
            .collect::<Vec<_>>();
        // last valid table that lacked servers for `mode`
        let mut fallback = None;
        let new_rt = if current.initialized_without_writers {
            match self.fetch_rt_from_seed(args, mode, &mut fallback)? {
                Err(err) if !routers.is_empty() && !is_timeout(&err) => {
                    self.fetch_rt_from_routers(&routers, args, mode, &mut fallback)?
                }
                res => res,
            }
        } else {
            match self.fetch_rt_from_routers(&routers, args, mode, &mut fallback)? {
                Err(err) if !is_timeout(&err) => {
                    self.fetch_rt_from_seed(args, mode, &mut fallback)?
                }
                res => res,
            }
        };
        let new_rt = match (new_rt, fallback) {
            (Ok(new_rt), _) => new_rt,
            (Err(_), Some(fallback)) => {
                info!("no router knows {mode:?} servers for {:?}", args.db);
                fallback
            }
            (Err(err), None) if is_timeout(&err) => return Err(err),
            (Err(err), None) => {
                error!("unable to retrieve routing information: {err}");
                return Err(Neo4jError::disconnect(format!(
                    "unable to retrieve routing information; last error: {err}"
                )));
            }
        };
        let new_rt = Arc::new(new_rt);
        // installed before the flight lands so that no caller can observe the old table
        self.tables.install(args.db.clone(), Arc::clone(&new_rt));
        self.clean_up_pools();
        Ok(new_rt)
    }

    fn fetch_rt_from_seed(
        &self,
        args: UpdateRtArgs,
        mode: RoutingControl,
        fallback: &mut Option<RoutingTable>,
    ) -> Result<Result<RoutingTable>> {
        let resolved = match Self::wrap_discovery_error(
            Arc::clone(&self.config.address).custom_resolve(self.config.resolver.as_deref()),
        )? {
            Ok(resolved) => resolved.collect::<Vec<_>>(),
            Err(err) => return Ok(Err(err)),
        };
        self.fetch_rt_from_routers(&resolved, args, mode, fallback)
    }

    /// Ask the routers in order until one returns a table with servers for `mode`.
    ///
    /// Routers whose pool is saturated are skipped at first.
    /// If no other router succeeds, discovery waits for any of them to make room.
    fn fetch_rt_from_routers(
        &self,
        routers: &[Arc<Address>],
        args: UpdateRtArgs,
        mode: RoutingControl,
        fallback: &mut Option<RoutingTable>,
    ) -> Result<Result<RoutingTable>> {
        let idle_test = self.config.idle_time_before_connection_test;
        let mut last_err = None;
        let mut saturated = Vec::new();
        for router in routers {
            let connection = match self.registry.try_acquire(router, args.deadline, idle_test) {
                Ok(Some(connection)) => Ok(connection),
                Ok(None) => {
                    debug!("pool of router {router} is full, asking it later");
                    saturated.push(Arc::clone(router));
                    continue;
                }
                Err(err) => Err(err),
            };
            match self.ask_router(router, connection, args, mode, fallback)? {
                Ok(rt) => return Ok(Ok(rt)),
                Err(err) => last_err = Some(err),
            }
        }
        while !saturated.is_empty() {
            let found = self.registry.wait_for_any(&saturated, args.deadline);
            let (i, unprepared) = match Self::wrap_discovery_error(found)? {
                Ok(found) => found,
                Err(err) => {
                    last_err = Some(err);
                    break;
                }
            };
            let connection = match unprepared.prepare(args.deadline, idle_test) {
                Ok(Some(connection)) => Ok(connection),
                Ok(None) => continue,
                Err(Neo4jError::Disposed { .. }) if !self.registry.is_closed() => continue,
                Err(err) => Err(err),
            };
            let router = saturated.remove(i);
            match self.ask_router(&router, connection, args, mode, fallback)? {
                Ok(rt) => return Ok(Ok(rt)),
                Err(err) => last_err = Some(err),
            }
        }
        Ok(Err(match last_err {
            None => Neo4jError::disconnect("no known routers left"),
            Some(err) => err,
        }))
    }

    /// Fetch a table from `router` and deactivate the router if that fails.
    ///
    /// A valid table without servers for `mode` is kept in `fallback`
    /// and counts as a failure that leaves the router active.
    fn ask_router(
        &self,
        router: &Arc<Address>,
        connection: Result<SinglePooledConnection>,
        args: UpdateRtArgs,
        mode: RoutingControl,
        fallback: &mut Option<RoutingTable>,
    ) -> Result<Result<RoutingTable>> {
        let res = connection
            .and_then(|connection| self.fetch_rt_from_router(router, connection, args));
        match Self::wrap_discovery_error(res)? {
            Ok(rt) if !rt.servers_for_mode(mode).is_empty() => Ok(Ok(rt)),
            Ok(rt) => {
                info!("{router} returned routing table without {mode:?} servers");
                *fallback = Some(rt);
                Ok(Err(Neo4jError::session_expired(format!(
                    "{router} returned routing table without {mode:?} servers"
                ))))
            }
            Err(err) => {
                if !is_timeout(&err) {
                    self.deactivate_server(router);
                }
                Ok(Err(err))
            }
        }
    }

    fn fetch_rt_from_router(
        &self,
        router: &Arc<Address>,
        mut connection: SinglePooledConnection,
        args: UpdateRtArgs,
    ) -> Result<RoutingTable> {
        debug!("fetching routing table for {:?} from {router}", args.db);
        let request = DiscoveryRequest {
            database: args.db.clone(),
            bookmarks: args.bookmarks.map(Arc::clone),
            impersonated_user: args.imp_user.map(Arc::clone),
            routing_context: self
                .config
                .connect_options
                .routing_context
                .clone()
                .unwrap_or_default(),
            deadline: args.deadline,
        };
        let mut response = match self.query.discover(&mut *connection, &request) {
            Ok(response) => response,
            Err(err) => {
                if err.server_error().is_none() {
                    connection.mark_unhealthy();
                }
                return Err(err);
            }
        };
        if response.routers.is_empty() {
            return Err(Neo4jError::disconnect(format!(
                "{router} returned routing table without routers"
            )));
        }
        if response.readers.is_empty() {
            return Err(Neo4jError::disconnect(format!(
                "{router} returned routing table without readers"
            )));
        }
        if response.database.is_none() {
            response.database = args.db.as_ref().map(|db| String::clone(db));
        }
        Ok(RoutingTable::from_discovery(response))
    }

    /// Remove `address` from all routing tables and close its idle connections.
    pub(crate) fn deactivate_server(&self, address: &Address) {
        debug!("deactivating address: {address}");
        self.tables.update_all(|table| table.without_server(address));
        self.registry.deactivate(address);
    }

    /// Drop the pools of all addresses no routing table refers to any more.
    pub(crate) fn clean_up_pools(&self) {
        let mut keep = self.tables.addresses();
        keep.insert(Arc::clone(&self.config.address));
        self.registry.retain(&keep);
    }

    fn wrap_discovery_error<T>(res: Result<T>) -> Result<Result<T>> {
        match res {
            Ok(t) => Ok(Ok(t)),
            Err(e) => {
                if e.fatal_during_discovery() {
                    Err(e)
                } else {
                    info!("ignored error during discovery: {e}");
                    Ok(Err(e))
                }
            }
        }
    }
}

fn is_timeout(err: &Neo4jError) -> bool {
    matches!(err, Neo4jError::Timeout { .. })
}
