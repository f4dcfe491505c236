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

pub(crate) mod config;
pub(crate) mod io;
pub(crate) mod session;

use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use crate::address_::Address;
use crate::error_::Result;
pub use config::{
    ConnectionConfig, ConnectionConfigParseError, DriverConfig, Encryption,
    InvalidRoutingContextError,
};
use io::connection::{ConnectOptions, Connector, DiscoveryQuery};
use io::pool::{Housekeeper, Pool, PoolConfig};
pub use io::pool::{
    AcquisitionTimes, ConnectionId, ConnectionPoolMetrics, ConnectionPoolState, LiveConnection,
    PooledConnection, RoutingTable,
};
use session::bookmarks::Bookmarks;
use session::retry::{ExponentialBackoff, RetryPolicy};
use session::{RetryContext, Session, SessionConfig};

pub mod auth {
    pub use super::config::auth::*;
}

/// Entry point of the crate.
///
/// Owns the connection pool (direct for `bolt` URIs, routing for `neo4j` URIs) and the
/// background housekeeping.
/// Sessions and connections borrow from the driver, so they cannot outlive it.
#[derive(Debug)]
pub struct Driver {
    pool: Arc<Pool>,
    housekeeper: Option<Housekeeper>,
    connection_acquisition_timeout: Option<Duration>,
    retry_policy: ExponentialBackoff,
}

impl Driver {
    /// Create a new driver.
    ///
    /// No connection is established until one is needed.
    /// The `connector` opens connections, the `discovery_query` fetches routing information
    /// over them (only used when routing).
    pub fn new(
        mut connection_config: ConnectionConfig,
        config: DriverConfig,
        connector: Arc<dyn Connector>,
        discovery_query: Arc<dyn DiscoveryQuery>,
    ) -> Self {
        if let Some(routing_context) = &mut connection_config.routing_context {
            let before = routing_context.insert(
                String::from("address"),
                connection_config.address.to_string(),
            );
            assert!(
                before.is_none(),
                "address was already set in routing context"
            );
        }
        let pool_config = PoolConfig {
            address: Arc::new(connection_config.address),
            connector,
            connect_options: ConnectOptions {
                user_agent: config.user_agent,
                auth: config.auth,
                routing_context: connection_config.routing_context,
                connection_timeout: config.connection_timeout,
                encryption: connection_config.encryption,
            },
            resolver: config.resolver,
            max_connection_pool_size: config.max_connection_pool_size,
            max_idle_connection_pool_size: config.max_idle_connection_pool_size,
            max_connection_lifetime: config.max_connection_lifetime,
            connection_idle_timeout: config.connection_idle_timeout,
            idle_time_before_connection_test: config.idle_time_before_connection_test,
            routing_table_purge_delay: config.routing_table_purge_delay,
        };
        let pool = Arc::new(Pool::new(pool_config, discovery_query));
        let housekeeper = config
            .housekeeping_interval
            .and_then(|interval| Housekeeper::start(Arc::downgrade(&pool), interval));
        Driver {
            pool,
            housekeeper,
            connection_acquisition_timeout: config.connection_acquisition_timeout,
            retry_policy: config.retry_policy,
        }
    }

    pub fn session<C: AsRef<SessionConfig>>(&self, config: C) -> Session<C> {
        Session::new(config, &self.pool, self.connection_acquisition_timeout)
    }

    /// Whether the driver picks servers based on the cluster's routing information.
    pub fn is_routing(&self) -> bool {
        self.pool.is_routing()
    }

    /// Borrow a connection from the pool.
    ///
    /// Without an explicit deadline, the configured
    /// [connection acquisition timeout](`DriverConfig::with_connection_acquisition_timeout`)
    /// applies.
    pub fn acquire_connection(&self, config: &AcquireConfig) -> Result<PooledConnection> {
        let deadline = match config.deadline {
            Some(deadline) => Some(deadline),
            None => session::deadline(self.connection_acquisition_timeout),
        };
        session::acquire(
            &self.pool,
            config.mode,
            &config.database,
            config.bookmarks.as_ref(),
            config.impersonated_user.as_ref(),
            deadline,
        )
    }

    /// Run `work` against `database` (`None` for the home database) under `policy`.
    ///
    /// Shorthand for a single [`Session::run_with_retry()`].
    pub fn run_with_retry<'driver, R, P: RetryPolicy>(
        &'driver self,
        database: Option<&str>,
        mode: RoutingControl,
        policy: P,
        work: impl FnMut(&mut PooledConnection<'driver>, &mut RetryContext) -> Result<R>,
    ) -> StdResult<R, P::Error> {
        let config = match database {
            None => SessionConfig::new(),
            Some(database) => SessionConfig::new().with_database(String::from(database)),
        };
        self.session(config).run_with_retry(mode, policy, work)
    }

    /// The retry policy configured via [`DriverConfig::with_retry_policy()`].
    pub fn retry_policy(&self) -> &ExponentialBackoff {
        &self.retry_policy
    }

    /// Make sure the DBMS is reachable by acquiring a reader and probing it.
    pub fn verify_connectivity(&self) -> Result<()> {
        let mut connection = self.acquire_connection(&AcquireConfig::new(RoutingControl::Read))?;
        let deadline = session::deadline(self.connection_acquisition_timeout);
        connection.reset(deadline)
    }

    /// Counters of the pool for `address`.
    ///
    /// `None` if the driver holds no pool for the address (any more).
    pub fn get_metrics(&self, address: &Address) -> Option<ConnectionPoolMetrics> {
        self.pool.get_metrics(address)
    }

    /// All connections currently open (idle or in use).
    pub fn live_connections(&self) -> Vec<LiveConnection> {
        self.pool.live_connections()
    }

    /// Sever a connection from the outside, e.g., to test failure handling.
    ///
    /// The pool notices the next time the connection is used or acquired.
    /// Returns `false` if the connection is unknown or can't be terminated.
    pub fn terminate_connection(&self, id: ConnectionId) -> bool {
        self.pool.terminate_connection(id)
    }

    /// The current routing table of `database` (`None` for the home database).
    ///
    /// `None` when not routing or no table has been fetched (or it has been purged).
    pub fn routing_table(&self, database: Option<&str>) -> Option<Arc<RoutingTable>> {
        let db = database.map(|db| Arc::new(String::from(db)));
        self.pool.routing_table(&db)
    }

    /// Stop the housekeeping and close all connections.
    ///
    /// Waiting acquisitions fail with [`Neo4jError::Disposed`](crate::Neo4jError::Disposed),
    /// connections in use are closed when they are returned.
    /// Closing more than once is a no-op.
    pub fn close(&self) {
        if let Some(housekeeper) = &self.housekeeper {
            housekeeper.stop();
        }
        if !self.pool.is_closed() {
            debug!("closing driver");
            self.pool.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.close();
    }
}

/// What connection [`Driver::acquire_connection()`] should hand out.
#[derive(Debug, Clone)]
pub struct AcquireConfig {
    mode: RoutingControl,
    database: Option<Arc<String>>,
    bookmarks: Option<Arc<Bookmarks>>,
    impersonated_user: Option<Arc<String>>,
    deadline: Option<Instant>,
}

impl AcquireConfig {
    /// A connection for `mode` to the home database.
    pub fn new(mode: RoutingControl) -> Self {
        Self {
            mode,
            database: None,
            bookmarks: None,
            impersonated_user: None,
            deadline: None,
        }
    }

    #[inline]
    pub fn with_database(mut self, database: String) -> Self {
        self.database = Some(Arc::new(database));
        self
    }

    #[inline]
    pub fn with_default_database(mut self) -> Self {
        self.database = None;
        self
    }

    /// Bookmarks the routers must have caught up with before answering.
    #[inline]
    pub fn with_bookmarks(mut self, bookmarks: Arc<Bookmarks>) -> Self {
        self.bookmarks = Some(bookmarks);
        self
    }

    #[inline]
    pub fn with_impersonated_user(mut self, user: String) -> Self {
        self.impersonated_user = Some(Arc::new(user));
        self
    }

    /// Give up at `deadline` instead of after the driver's acquisition timeout.
    #[inline]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Whether work only reads or (potentially) also writes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RoutingControl {
    /// Routed to the readers of the cluster.
    Read,
    /// Routed to the writers (leaders) of the cluster.
    Write,
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::io::fake::{response, FakeConnector, FakeDiscovery};
    use super::session::retry::RetryableError;
    use super::*;
    use crate::error_::Neo4jError;

    struct Fixture {
        connector: Arc<FakeConnector>,
        discovery: Arc<FakeDiscovery>,
        driver: Driver,
    }

    fn fixture(uri: &str, config: DriverConfig) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let connector = FakeConnector::new();
        let discovery = FakeDiscovery::new(response(
            300,
            &["r1:7687", "r2:7687"],
            &["r1:7687", "r2:7687"],
            &["w1:7687"],
        ));
        let driver = Driver::new(
            uri.parse().unwrap(),
            config,
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::clone(&discovery) as Arc<dyn DiscoveryQuery>,
        );
        Fixture {
            connector,
            discovery,
            driver,
        }
    }

    fn fast_retries() -> ExponentialBackoff {
        ExponentialBackoff::new()
            .with_initial_delay(Duration::from_millis(1))
            .with_max_retry_time(Duration::from_secs(5))
    }

    #[rstest]
    fn test_direct_driver() {
        let fixture = fixture("bolt://localhost:7687", DriverConfig::new());
        assert!(!fixture.driver.is_routing());
        let connection = fixture
            .driver
            .acquire_connection(&AcquireConfig::new(RoutingControl::Write))
            .unwrap();
        assert_eq!(**connection.address(), Address::from("localhost:7687"));
        drop(connection);
        assert!(fixture.driver.routing_table(None).is_none());
        assert_eq!(fixture.discovery.calls(), 0);
        let metrics = fixture
            .driver
            .get_metrics(&Address::from("localhost:7687"))
            .unwrap();
        assert_eq!(metrics.idle, 1);
    }

    #[rstest]
    fn test_routing_context_carries_address() {
        let fixture = fixture("neo4j://localhost:7687?region=eu", DriverConfig::new());
        assert!(fixture.driver.is_routing());
        fixture.driver.verify_connectivity().unwrap();
        let request = fixture.discovery.last_request().unwrap();
        assert_eq!(
            request.routing_context.get("address").map(String::as_str),
            Some("localhost:7687")
        );
        assert_eq!(
            request.routing_context.get("region").map(String::as_str),
            Some("eu")
        );
    }

    #[rstest]
    fn test_acquire_config_reaches_discovery() {
        let fixture = fixture("neo4j://localhost", DriverConfig::new());
        let bookmarks = Arc::new(Bookmarks::from_raw([String::from("bm")]));
        let config = AcquireConfig::new(RoutingControl::Write)
            .with_database(String::from("movies"))
            .with_bookmarks(Arc::clone(&bookmarks))
            .with_impersonated_user(String::from("alice"));
        let connection = fixture.driver.acquire_connection(&config).unwrap();
        assert_eq!(**connection.address(), Address::from("w1:7687"));

        let request = fixture.discovery.last_request().unwrap();
        assert_eq!(request.database.as_deref().map(String::as_str), Some("movies"));
        assert_eq!(request.bookmarks, Some(bookmarks));
        assert_eq!(
            request.impersonated_user.as_deref().map(String::as_str),
            Some("alice")
        );
        let table = fixture.driver.routing_table(Some("movies")).unwrap();
        assert_eq!(table.writers().len(), 1);
        assert!(fixture.driver.routing_table(None).is_none());
    }

    #[rstest]
    fn test_run_with_retry() {
        let fixture = fixture("neo4j://localhost", DriverConfig::new());
        let mut attempts = 0;
        let res = fixture.driver.run_with_retry(
            Some("movies"),
            RoutingControl::Write,
            fast_retries(),
            |connection, _| {
                attempts += 1;
                if attempts < 3 {
                    return Err(Neo4jError::session_expired("no longer leader"));
                }
                connection.send_receive(b"CREATE", None)
            },
        );
        assert_eq!(res.unwrap(), b"CREATE".to_vec());
        assert_eq!(attempts, 3);
    }

    #[rstest]
    fn test_configured_retry_policy() {
        let config = DriverConfig::new().with_max_transaction_retry_time(Duration::from_secs(7));
        let fixture = fixture("neo4j://localhost", config);
        assert_eq!(
            fixture.driver.retry_policy().max_retry_time(),
            Duration::from_secs(7)
        );
    }

    #[rstest]
    fn test_terminate_connection() {
        let fixture = fixture("bolt://localhost", DriverConfig::new());
        let id = {
            let connection = fixture
                .driver
                .acquire_connection(&AcquireConfig::new(RoutingControl::Read))
                .unwrap();
            connection.id()
        };
        let live = fixture.driver.live_connections();
        assert_eq!(live.len(), 1);
        assert!(fixture.driver.terminate_connection(id));
        assert!(!fixture.connector.links("localhost:7687")[0].is_open());

        fixture
            .driver
            .acquire_connection(&AcquireConfig::new(RoutingControl::Read))
            .unwrap();
        assert_eq!(fixture.connector.opened_to("localhost:7687"), 2);
    }

    #[rstest]
    fn test_close() {
        let fixture = fixture("neo4j://localhost", DriverConfig::new());
        fixture.driver.verify_connectivity().unwrap();
        fixture.driver.close();
        assert!(fixture.driver.is_closed());
        fixture.driver.close();

        let res = fixture
            .driver
            .acquire_connection(&AcquireConfig::new(RoutingControl::Read));
        assert!(matches!(res, Err(Neo4jError::Disposed { .. })));
        let res: StdResult<(), _> = fixture.driver.run_with_retry(
            None,
            RoutingControl::Read,
            fast_retries(),
            |_, _| Ok(()),
        );
        assert!(matches!(
            res,
            Err(RetryableError::Neo4jError(Neo4jError::Disposed { .. }))
        ));
        assert!(fixture
            .connector
            .links("localhost:7687")
            .iter()
            .all(|link| !link.is_open()));
    }

    #[rstest]
    #[case(DriverConfig::new().without_housekeeping(), false)]
    #[case(DriverConfig::new().with_housekeeping_interval(Duration::from_millis(10)), true)]
    #[case(DriverConfig::new(), true)]
    fn test_housekeeping_config(#[case] config: DriverConfig, #[case] running: bool) {
        let fixture = fixture("bolt://localhost", config);
        assert_eq!(fixture.driver.housekeeper.is_some(), running);
        fixture.driver.close();
    }
}
