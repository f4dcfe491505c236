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

pub(crate) mod bookmarks;
pub(crate) mod config;
pub(crate) mod retry;

use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use super::io::pool::{AcquireArgs, DbKey, Pool, PooledConnection, UpdateRtArgs};
use crate::driver::RoutingControl;
use crate::error_::{Neo4jError, Result};
use bookmarks::Bookmarks;
pub use config::SessionConfig;
use retry::RetryPolicy;

/// A causally consistent chain of work against one database.
///
/// Every unit of work gets its own connection from the driver's pool.
/// Bookmarks of successful work are carried forward so that later work observes earlier
/// writes, even when it ends up on a different cluster member.
///
/// Create one with [`Driver::session()`](crate::driver::Driver::session).
#[derive(Debug)]
pub struct Session<'driver, C> {
    config: C,
    pool: &'driver Pool,
    connection_acquisition_timeout: Option<Duration>,
    last_bookmarks: Option<Arc<Bookmarks>>,
}

impl<'driver, C: AsRef<SessionConfig>> Session<'driver, C> {
    pub(crate) fn new(
        config: C,
        pool: &'driver Pool,
        connection_acquisition_timeout: Option<Duration>,
    ) -> Self {
        Session {
            config,
            pool,
            connection_acquisition_timeout,
            last_bookmarks: None,
        }
    }

    /// Borrow a connection suited for `mode` from the pool.
    ///
    /// The connection goes back to the pool when dropped.
    /// Use [`Session::update_bookmarks()`] to pass on the bookmarks the work produced.
    pub fn acquire_connection(&mut self, mode: RoutingControl) -> Result<PooledConnection<'driver>> {
        let bookmarks = self.last_raw_bookmarks().map(Arc::clone);
        acquire(
            self.pool,
            mode,
            &self.config.as_ref().database,
            bookmarks.as_ref(),
            self.config.as_ref().impersonated_user.as_ref(),
            deadline(self.connection_acquisition_timeout),
        )
    }

    /// Run `work` under `policy`.
    ///
    /// Each attempt gets a freshly acquired connection.
    /// When an attempt fails, its connection is reported to the pool (see
    /// [`PooledConnection::report_error()`]) and closed;
    /// a [`Neo4jError::SessionExpired`] additionally makes the next attempt fetch a new routing
    /// table.
    /// Bookmarks registered through [`RetryContext::update_bookmarks()`] by the successful
    /// attempt become the session's bookmarks.
    ///
    /// # Example
    /// ```no_run
    /// use std::sync::Arc;
    ///
    /// use neo4j_routing::connection::{Connector, DiscoveryQuery};
    /// use neo4j_routing::driver::{ConnectionConfig, Driver, DriverConfig, RoutingControl};
    /// use neo4j_routing::retry::ExponentialBackoff;
    /// use neo4j_routing::session::SessionConfig;
    ///
    /// # fn run(connector: Arc<dyn Connector>, discovery: Arc<dyn DiscoveryQuery>) {
    /// let driver = Driver::new(
    ///     "neo4j://localhost:7687".parse().unwrap(),
    ///     DriverConfig::new(),
    ///     connector,
    ///     discovery,
    /// );
    /// let mut session = driver.session(SessionConfig::new().with_database(String::from("movies")));
    /// let response = session
    ///     .run_with_retry(
    ///         RoutingControl::Write,
    ///         ExponentialBackoff::new(),
    ///         |connection, _ctx| connection.send_receive(b"request", None),
    ///     )
    ///     .unwrap();
    /// # }
    /// ```
    pub fn run_with_retry<R, P: RetryPolicy>(
        &mut self,
        mode: RoutingControl,
        policy: P,
        mut work: impl FnMut(&mut PooledConnection<'driver>, &mut RetryContext) -> Result<R>,
    ) -> StdResult<R, P::Error> {
        let pool = self.pool;
        let timeout = self.connection_acquisition_timeout;
        let db = self.config.as_ref().database.clone();
        let imp_user = self.config.as_ref().impersonated_user.clone();
        let started_at = Instant::now();
        let mut attempt = 0;
        let mut bookmarks = self
            .last_raw_bookmarks()
            .map(Arc::clone)
            .unwrap_or_default();

        let res = policy.execute(|| {
            attempt += 1;
            let mut ctx = RetryContext {
                attempt,
                started_at,
                bookmarks: Arc::clone(&bookmarks),
            };
            let mut connection = acquire(
                pool,
                mode,
                &db,
                Some(&ctx.bookmarks),
                imp_user.as_ref(),
                deadline(timeout),
            )?;
            match work(&mut connection, &mut ctx) {
                Ok(r) => {
                    bookmarks = ctx.bookmarks;
                    Ok(r)
                }
                Err(err) => {
                    debug!("attempt {attempt} failed: {err}");
                    connection.report_error(&err);
                    connection.release(false);
                    if matches!(err, Neo4jError::SessionExpired { .. }) {
                        pool.invalidate(&db);
                    }
                    Err(err)
                }
            }
        });
        if res.is_ok() && !bookmarks.is_empty() {
            self.last_bookmarks = Some(bookmarks);
        }
        res
    }

    /// Replace the session's bookmarks with the ones produced by work run on a connection
    /// from [`Session::acquire_connection()`].
    ///
    /// Empty bookmarks are ignored.
    pub fn update_bookmarks(&mut self, bookmarks: Bookmarks) {
        if !bookmarks.is_empty() {
            self.last_bookmarks = Some(Arc::new(bookmarks));
        }
    }

    #[inline]
    fn last_raw_bookmarks(&self) -> Option<&Arc<Bookmarks>> {
        self.last_bookmarks
            .as_ref()
            .or(self.config.as_ref().bookmarks.as_ref())
    }

    /// The bookmarks of the last successful work, or the initial bookmarks from the
    /// [`SessionConfig`] if there was none yet.
    #[inline]
    pub fn last_bookmarks(&self) -> Arc<Bookmarks> {
        self.last_raw_bookmarks().map(Arc::clone).unwrap_or_default()
    }
}

pub(crate) fn acquire<'pool>(
    pool: &'pool Pool,
    mode: RoutingControl,
    db: &DbKey,
    bookmarks: Option<&Arc<Bookmarks>>,
    imp_user: Option<&Arc<String>>,
    deadline: Option<Instant>,
) -> Result<PooledConnection<'pool>> {
    let res = pool.acquire(AcquireArgs {
        mode,
        update_rt_args: UpdateRtArgs {
            db,
            bookmarks,
            imp_user,
            deadline,
        },
    });
    if let Err(Neo4jError::SessionExpired { .. }) = &res {
        pool.invalidate(db);
    }
    res
}

/// `None` (wait forever) if the deadline is too far in the future to be represented.
pub(crate) fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

/// State of the unit of work handed to [`Session::run_with_retry()`].
#[derive(Debug)]
pub struct RetryContext {
    attempt: usize,
    started_at: Instant,
    bookmarks: Arc<Bookmarks>,
}

impl RetryContext {
    /// 1 for the first attempt.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// When the first attempt started.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// The bookmarks the work must wait for.
    pub fn bookmarks(&self) -> &Bookmarks {
        &self.bookmarks
    }

    /// Register the bookmarks produced by the work.
    ///
    /// Empty bookmarks are ignored.
    pub fn update_bookmarks(&mut self, bookmarks: Bookmarks) {
        if !bookmarks.is_empty() {
            self.bookmarks = Arc::new(bookmarks);
        }
    }
}
