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

mod discovery;
mod housekeeping;
mod load_balancer;
mod registry;
mod routing;
mod single_pool;
mod tracker;

use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use super::connection::{ConnectOptions, Connection, Connector, DiscoveryQuery};
use crate::address_::resolution::AddressResolver;
use crate::address_::Address;
use crate::driver::session::bookmarks::Bookmarks;
use crate::driver::RoutingControl;
use crate::error_::{Neo4jError, Result};
pub(crate) use housekeeping::Housekeeper;
use load_balancer::LoadBalancer;
use registry::ServerRegistry;
pub(crate) use routing::DbKey;
pub use routing::RoutingTable;
pub use single_pool::{AcquisitionTimes, ConnectionPoolMetrics, ConnectionPoolState};
use single_pool::SinglePooledConnection;
pub use tracker::{ConnectionId, LiveConnection};

// 7 is a reasonable common upper bound for the size of clusters
pub(crate) const DEFAULT_CLUSTER_SIZE: usize = 7;

#[derive(Debug)]
pub(crate) struct PoolConfig {
    /// The seed address.
    pub(crate) address: Arc<Address>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) connect_options: ConnectOptions,
    pub(crate) resolver: Option<Box<dyn AddressResolver>>,
    pub(crate) max_connection_pool_size: usize,
    pub(crate) max_idle_connection_pool_size: Option<usize>,
    pub(crate) max_connection_lifetime: Option<Duration>,
    pub(crate) connection_idle_timeout: Option<Duration>,
    pub(crate) idle_time_before_connection_test: Option<Duration>,
    pub(crate) routing_table_purge_delay: Duration,
}

impl PoolConfig {
    pub(crate) fn is_routing(&self) -> bool {
        self.connect_options.routing_context.is_some()
    }
}

/// Hands out connections either to a single server (direct) or to the cluster member best
/// suited for the request (routing).
#[derive(Debug)]
pub(crate) struct Pool {
    pub(crate) config: Arc<PoolConfig>,
    registry: Arc<ServerRegistry>,
    pools: Pools,
}

#[derive(Debug)]
enum Pools {
    Direct,
    Routing(LoadBalancer),
}

impl Pool {
    pub(crate) fn new(config: PoolConfig, discovery_query: Arc<dyn DiscoveryQuery>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(ServerRegistry::new(Arc::clone(&config)));
        let pools = if config.is_routing() {
            Pools::Routing(LoadBalancer::new(
                Arc::clone(&config),
                Arc::clone(&registry),
                discovery_query,
            ))
        } else {
            Pools::Direct
        };
        Self {
            config,
            registry,
            pools,
        }
    }

    pub(crate) fn is_routing(&self) -> bool {
        matches!(self.pools, Pools::Routing(_))
    }

    pub(crate) fn acquire(&self, args: AcquireArgs) -> Result<PooledConnection> {
        let started = Instant::now();
        let connection = match &self.pools {
            Pools::Direct => self.registry.acquire(
                &self.config.address,
                args.update_rt_args.deadline,
                self.config.idle_time_before_connection_test,
            )?,
            Pools::Routing(load_balancer) => load_balancer.acquire(args)?,
        };
        connection.record_acquisition(started.elapsed());
        debug!(
            "{}: acquired connection to {} for {:?}",
            connection.id(),
            connection.address(),
            args.mode
        );
        Ok(PooledConnection {
            connection,
            pool: self,
        })
    }

    pub(crate) fn deactivate_server(&self, address: &Address) {
        match &self.pools {
            Pools::Direct => self.registry.deactivate(address),
            Pools::Routing(load_balancer) => load_balancer.deactivate_server(address),
        }
    }

    pub(crate) fn deactivate_writer(&self, address: &Address) {
        if let Pools::Routing(load_balancer) = &self.pools {
            load_balancer.deactivate_writer(address)
        }
    }

    /// Make the next acquisition for `db` fetch a new routing table.
    pub(crate) fn invalidate(&self, db: &DbKey) {
        if let Pools::Routing(load_balancer) = &self.pools {
            load_balancer.invalidate(db)
        }
    }

    /// Periodic maintenance, see [`Housekeeper`].
    pub(crate) fn housekeeping(&self) {
        self.registry.purge_idle();
        if let Pools::Routing(load_balancer) = &self.pools {
            load_balancer.purge_aged_tables(self.config.routing_table_purge_delay);
        }
    }

    pub(crate) fn routing_table(&self, db: &DbKey) -> Option<Arc<RoutingTable>> {
        match &self.pools {
            Pools::Direct => None,
            Pools::Routing(load_balancer) => load_balancer.routing_table(db),
        }
    }

    pub(crate) fn get_metrics(&self, address: &Address) -> Option<ConnectionPoolMetrics> {
        self.registry.get_metrics(address)
    }

    pub(crate) fn live_connections(&self) -> Vec<LiveConnection> {
        self.registry.tracker().live_connections()
    }

    pub(crate) fn terminate_connection(&self, id: ConnectionId) -> bool {
        self.registry.tracker().terminate(id)
    }

    pub(crate) fn close(&self) {
        self.registry.close();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.registry.is_closed()
    }
}

/// A connection borrowed from the [`Driver`](crate::driver::Driver)'s pool.
///
/// The connection is exclusively owned until it is dropped
/// (or [`PooledConnection::release()`]d), at which point it's handed back to the pool.
#[derive(Debug)]
pub struct PooledConnection<'pool> {
    connection: SinglePooledConnection,
    pool: &'pool Pool,
}

impl<'pool> PooledConnection<'pool> {
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn address(&self) -> &Arc<Address> {
        self.connection.address()
    }

    pub fn created_at(&self) -> Instant {
        self.connection.created_at()
    }

    pub fn last_used_at(&self) -> Instant {
        self.connection.last_used_at()
    }

    /// Send a request over the connection and wait for the response.
    ///
    /// Failures are reported to the pool (see [`PooledConnection::report_error()`]).
    pub fn send_receive(&mut self, request: &[u8], deadline: Option<Instant>) -> Result<Vec<u8>> {
        self.wrap_io(|connection| connection.send_receive(request, deadline))
    }

    pub fn reset(&mut self, deadline: Option<Instant>) -> Result<()> {
        self.wrap_io(|connection| connection.reset(deadline))
    }

    fn wrap_io<R>(&mut self, io_op: impl FnOnce(&mut dyn Connection) -> Result<R>) -> Result<R> {
        let was_open = self.connection.is_open();
        let res = io_op(&mut *self.connection);
        match &res {
            Err(err) => self.report_error(err),
            Ok(_) if was_open && !self.connection.is_open() => {
                self.report_error(&Neo4jError::disconnect("connection closed unexpectedly"))
            }
            Ok(_) => {}
        }
        res
    }

    /// Let the pool know about an error that occurred while using this connection.
    ///
    ///  * Connectivity errors make the connection unusable
    ///    and remove its server from all routing tables.
    ///  * `DatabaseUnavailable` removes the server from all routing tables.
    ///  * `NotALeader` and `ForbiddenOnReadOnlyDatabase` remove the server from the writers.
    ///  * Protocol violations make the connection unusable.
    pub fn report_error(&mut self, error: &Neo4jError) {
        match error {
            Neo4jError::Disconnect { .. } => {
                self.connection.mark_unhealthy();
                self.pool.deactivate_server(self.connection.address());
            }
            Neo4jError::ServerError { error } => {
                if error.deactivates_server() {
                    self.pool.deactivate_server(self.connection.address());
                } else if error.invalidates_writer() {
                    self.pool.deactivate_writer(self.connection.address());
                }
            }
            Neo4jError::ProtocolError { .. } => self.connection.mark_unhealthy(),
            _ => {}
        }
    }

    /// Close the connection on release instead of returning it to the pool.
    pub fn mark_unhealthy(&mut self) {
        self.connection.mark_unhealthy();
    }

    pub fn is_healthy(&self) -> bool {
        self.connection.is_healthy()
    }

    /// Hand the connection back to the pool.
    ///
    /// Unhealthy connections are closed instead.
    pub fn release(mut self, healthy: bool) {
        if !healthy {
            self.connection.mark_unhealthy();
        }
    }
}

impl<'pool> Deref for PooledConnection<'pool> {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        &*self.connection
    }
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct AcquireArgs<'a> {
    pub(crate) mode: RoutingControl,
    pub(crate) update_rt_args: UpdateRtArgs<'a>,
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct UpdateRtArgs<'a> {
    pub(crate) db: &'a DbKey,
    pub(crate) bookmarks: Option<&'a Arc<Bookmarks>>,
    pub(crate) imp_user: Option<&'a Arc<String>>,
    pub(crate) deadline: Option<Instant>,
}
