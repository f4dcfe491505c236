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

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::address_::Address;
use crate::driver::config::auth::AuthToken;
use crate::driver::config::Encryption;
use crate::driver::session::bookmarks::Bookmarks;
use crate::error_::Result;

// imports for docs
#[allow(unused)]
use crate::driver::Driver;
#[allow(unused)]
use crate::error_::Neo4jError;

/// A single, established connection to a server.
///
/// Implementations encapsulate the wire protocol.
/// The pool only relies on the methods of this trait to manage the connection's lifecycle.
///
/// A connection can be severed at any time from the outside (network failure, peer reset,
/// [`Terminator::terminate()`]).
/// Implementations must reflect this in [`Connection::is_open()`].
pub trait Connection: Debug + Send {
    /// The address this connection was opened to.
    fn address(&self) -> &Arc<Address>;

    /// `false` once the connection has been closed or broke down.
    fn is_open(&self) -> bool;

    /// Send a request and wait for the server's response.
    ///
    /// The payload is opaque to the pool.
    /// IO failures must be reported as [`Neo4jError::Disconnect`].
    fn send_receive(&mut self, request: &[u8], deadline: Option<Instant>) -> Result<Vec<u8>>;

    /// Cheap round-trip used as liveness check before handing out a connection that has been
    /// idle for a while.
    fn reset(&mut self, deadline: Option<Instant>) -> Result<()>;

    /// Close the connection.
    ///
    /// Must not fail and must be safe to call on a connection that has already been closed.
    fn close(&mut self);

    /// A handle that allows severing the connection while it's owned by someone else.
    ///
    /// Used for instrumentation only, see [`Driver::terminate_connection()`].
    fn terminator(&self) -> Option<Arc<dyn Terminator>> {
        None
    }
}

/// Severs a connection from outside the pool.
///
/// See [`Connection::terminator()`].
pub trait Terminator: Debug + Send + Sync {
    fn terminate(&self);
}

/// Opens new [`Connection`]s.
pub trait Connector: Debug + Send + Sync {
    /// Establish and authenticate a new connection.
    ///
    /// Failures to reach the server must be reported as [`Neo4jError::Disconnect`].
    /// Authentication failures should be reported as [`Neo4jError::ServerError`].
    fn open(
        &self,
        address: Arc<Address>,
        options: &ConnectOptions,
        deadline: Option<Instant>,
    ) -> Result<Box<dyn Connection>>;
}

/// Everything a [`Connector`] needs to know to open a connection.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConnectOptions {
    pub user_agent: String,
    pub auth: Arc<AuthToken>,
    /// `None` when routing is disabled.
    pub routing_context: Option<HashMap<String, String>>,
    /// Maximum time to wait for the connection to be established.
    pub connection_timeout: Option<Duration>,
    /// Whether (and how) the connection must be secured.
    /// Certificate handling is up to the [`Connector`].
    pub encryption: Encryption,
}

/// Fetches routing information over a [`Connection`].
pub trait DiscoveryQuery: Debug + Send + Sync {
    fn discover(
        &self,
        connection: &mut dyn Connection,
        request: &DiscoveryRequest,
    ) -> Result<DiscoveryResponse>;
}

/// Parameters of a single routing information request.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct DiscoveryRequest {
    /// `None` means the user's home database.
    pub database: Option<Arc<String>>,
    pub bookmarks: Option<Arc<Bookmarks>>,
    pub impersonated_user: Option<Arc<String>>,
    pub routing_context: HashMap<String, String>,
    pub deadline: Option<Instant>,
}

/// Routing information as returned by a router.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryResponse {
    pub ttl_seconds: u64,
    /// The database the information belongs to, if the router names it.
    pub database: Option<String>,
    pub routers: Vec<Address>,
    pub readers: Vec<Address>,
    pub writers: Vec<Address>,
}
