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

pub(crate) mod auth;

use std::collections::HashMap;
use std::result::Result as StdResult;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uriparse::{Query, URI};

use super::session::retry::ExponentialBackoff;
use crate::address_::resolution::AddressResolver;
use crate::address_::Address;
use crate::address_::DEFAULT_PORT;
use auth::AuthToken;

// imports for docs
#[allow(unused)]
use super::Driver;
#[allow(unused)]
use crate::error_::Neo4jError;

const DEFAULT_USER_AGENT: &str = env!("NEO4J_DEFAULT_USER_AGENT");
pub(crate) const DEFAULT_MAX_CONNECTION_POOL_SIZE: usize = 100;
pub(crate) const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_CONNECTION_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(3600);
pub(crate) const DEFAULT_ROUTING_TABLE_PURGE_DELAY: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

/// Configure how the driver should behave.
#[derive(Debug)]
pub struct DriverConfig {
    pub(crate) user_agent: String,
    pub(crate) auth: Arc<AuthToken>,
    pub(crate) max_connection_lifetime: Option<Duration>,
    pub(crate) connection_idle_timeout: Option<Duration>,
    pub(crate) idle_time_before_connection_test: Option<Duration>,
    pub(crate) max_connection_pool_size: usize,
    pub(crate) max_idle_connection_pool_size: Option<usize>,
    pub(crate) connection_timeout: Option<Duration>,
    pub(crate) connection_acquisition_timeout: Option<Duration>,
    pub(crate) resolver: Option<Box<dyn AddressResolver>>,
    pub(crate) retry_policy: ExponentialBackoff,
    pub(crate) routing_table_purge_delay: Duration,
    pub(crate) housekeeping_interval: Option<Duration>,
}

/// How the [`Connector`](crate::connection::Connector) should secure connections.
///
/// Certificate handling itself is up to the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum Encryption {
    /// Plain text.
    #[default]
    Disabled,
    /// TLS, verifying the server's certificate against the system's root CA certificates.
    TrustSystemCas,
    /// TLS, accepting any certificate.
    ///
    /// **⚠️ WARNING**:  
    /// This is not secure and should only be used for testing purposes.
    TrustAnyCertificate,
}

/// Tell the driver where the DBMS it be found and how to connect to it.
///
/// ## From a URI
/// `ConnectionConfig` implements `FromStr`.
/// The string is expected to follow the form:
/// ```text
/// scheme://host[:port[?routing_context]]
/// ```
/// Where scheme must be one of:
///
/// | scheme      | encryption                                       | routing |
/// | ----------- | ------------------------------------------------ | ------- |
/// | `neo4j`     | none                                             | yes     |
/// | `neo4j+s`   | yes                                              | yes     |
/// | `neo4j+ssc` | yes, *but every certificate is accepted*.        | yes     |
/// | `bolt`      | none                                             | no      |
/// | `bolt+s`    | yes                                              | no      |
/// | `bolt+ssc`  | yes, *but every certificate is accepted*.        | no      |
///
/// The routing context may only be present for schemes that support routing.
///
/// ```
/// use neo4j_routing::driver::ConnectionConfig;
///
/// let conf: ConnectionConfig = "neo4j+s://localhost:7687?region=eu".parse().unwrap();
/// ```
///
/// ## Programmatically
/// ```
/// use std::collections::HashMap;
///
/// use neo4j_routing::driver::{ConnectionConfig, Encryption};
///
/// let routing_context = {
///     let mut map = HashMap::with_capacity(1);
///     map.insert("region".to_string(), "eu".to_string());
///     map
/// };
/// let conf = ConnectionConfig::new(("localhost", 7687).into())
///     .with_encryption(Encryption::TrustSystemCas)
///     .with_routing_context(routing_context)
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub(crate) address: Address,
    pub(crate) routing_context: Option<HashMap<String, String>>,
    pub(crate) encryption: Encryption,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            user_agent: String::from(DEFAULT_USER_AGENT),
            auth: Default::default(),
            max_connection_lifetime: Some(DEFAULT_MAX_CONNECTION_LIFETIME),
            connection_idle_timeout: None,
            idle_time_before_connection_test: None,
            max_connection_pool_size: DEFAULT_MAX_CONNECTION_POOL_SIZE,
            max_idle_connection_pool_size: None,
            connection_timeout: Some(DEFAULT_CONNECTION_TIMEOUT),
            connection_acquisition_timeout: Some(DEFAULT_CONNECTION_ACQUISITION_TIMEOUT),
            resolver: None,
            retry_policy: Default::default(),
            routing_table_purge_delay: DEFAULT_ROUTING_TABLE_PURGE_DELAY,
            housekeeping_interval: Some(DEFAULT_HOUSEKEEPING_INTERVAL),
        }
    }
}

impl DriverConfig {
    /// Create a new driver configuration with default values.
    ///
    /// This is the same as calling [`DriverConfig::default()`].
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure a custom user agent the driver should send to the DBMS.
    ///
    /// The user agent should follow the form `<app-name>/<version>[ <further information>]`.
    /// For example, `"my-app/1.0.0"` or `"my-app/1.0.0 linux emea-prod-1"`.
    ///
    /// If omitted, the driver chooses a *default* user agent.
    ///
    /// # Example
    /// ```
    /// use neo4j_routing::driver::DriverConfig;
    ///
    /// let config = DriverConfig::new().with_user_agent(String::from("my-app/1.0.0"));
    /// ```
    #[inline]
    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Configure the auth token the driver should use to authenticate with the DBMS.
    ///
    /// # Example
    /// ```
    /// use std::sync::Arc;
    ///
    /// use neo4j_routing::driver::auth::AuthToken;
    /// use neo4j_routing::driver::DriverConfig;
    ///
    /// let auth = Arc::new(AuthToken::new_basic_auth("neo4j", "pass"));
    /// let config = DriverConfig::new().with_auth(auth);
    /// ```
    #[inline]
    pub fn with_auth(mut self, auth: Arc<AuthToken>) -> Self {
        self.auth = auth;
        self
    }

    /// Limit the maximum lifetime of any connection.
    ///
    /// Connections older than this are closed instead of being handed out or put back into
    /// the pool.
    /// The default is 1 hour.
    #[inline]
    pub fn with_max_connection_lifetime(mut self, max_connection_lifetime: Duration) -> Self {
        self.max_connection_lifetime = Some(max_connection_lifetime);
        self
    }

    /// Disable closing connections based on their age.
    ///
    /// See also [`DriverConfig::with_max_connection_lifetime()`].
    #[inline]
    pub fn without_max_connection_lifetime(mut self) -> Self {
        self.max_connection_lifetime = None;
        self
    }

    /// Close connections that have been idle in the pool for longer than `timeout`.
    ///
    /// Disabled by default.
    #[inline]
    pub fn with_connection_idle_timeout(mut self, timeout: Duration) -> Self {
        self.connection_idle_timeout = Some(timeout);
        self
    }

    #[inline]
    pub fn without_connection_idle_timeout(mut self) -> Self {
        self.connection_idle_timeout = None;
        self
    }

    /// Test connections that have been idle for longer than `idle_time` before handing them
    /// out ([`Connection::reset()`](crate::connection::Connection::reset)).
    ///
    /// Connections failing the test are discarded and the acquisition carries on.
    /// `Duration::ZERO` tests every connection taken from the pool.
    /// Disabled by default.
    #[inline]
    pub fn with_idle_time_before_connection_test(mut self, idle_time: Duration) -> Self {
        self.idle_time_before_connection_test = Some(idle_time);
        self
    }

    #[inline]
    pub fn without_idle_time_before_connection_test(mut self) -> Self {
        self.idle_time_before_connection_test = None;
        self
    }

    /// Maximum number of connections per server (idle, in use, being opened or being closed).
    ///
    /// The default is 100.
    ///
    /// # Panics
    /// If `max_connection_pool_size` is 0.
    #[inline]
    pub fn with_max_connection_pool_size(mut self, max_connection_pool_size: usize) -> Self {
        assert!(
            max_connection_pool_size > 0,
            "max_connection_pool_size must be at least 1"
        );
        self.max_connection_pool_size = max_connection_pool_size;
        self
    }

    /// Maximum number of idle connections kept per server.
    ///
    /// Connections released while this many are idle already are closed.
    #[deprecated(note = "use `with_max_connection_pool_size` to bound the pool")]
    #[inline]
    pub fn with_max_idle_connection_pool_size(mut self, max_idle: usize) -> Self {
        self.max_idle_connection_pool_size = Some(max_idle);
        self
    }

    /// Maximum time to wait for a new connection to be established.
    ///
    /// The default is 30 seconds.
    #[inline]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    #[inline]
    pub fn without_connection_timeout(mut self) -> Self {
        self.connection_timeout = None;
        self
    }

    #[inline]
    pub fn with_default_connection_timeout(mut self) -> Self {
        self.connection_timeout = Some(DEFAULT_CONNECTION_TIMEOUT);
        self
    }

    /// Maximum time to wait for a connection from the pool.
    ///
    /// This includes fetching routing information, waiting for room in the pool, and
    /// establishing a new connection.
    /// When the time runs out, [`Neo4jError::Timeout`] is returned.
    ///
    /// The default is 60 seconds.
    #[inline]
    pub fn with_connection_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.connection_acquisition_timeout = Some(timeout);
        self
    }

    /// Wait for a connection indefinitely.
    #[inline]
    pub fn without_connection_acquisition_timeout(mut self) -> Self {
        self.connection_acquisition_timeout = None;
        self
    }

    #[inline]
    pub fn with_default_connection_acquisition_timeout(mut self) -> Self {
        self.connection_acquisition_timeout = Some(DEFAULT_CONNECTION_ACQUISITION_TIMEOUT);
        self
    }

    /// Resolve the seed address through a custom [`AddressResolver`].
    ///
    /// The resolver is only consulted when routing and only for the seed address,
    /// never for addresses learned from the cluster.
    #[inline]
    pub fn with_resolver(mut self, resolver: Box<dyn AddressResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[inline]
    pub fn without_resolver(mut self) -> Self {
        self.resolver = None;
        self
    }

    /// The policy returned by [`Driver::retry_policy()`].
    #[inline]
    pub fn with_retry_policy(mut self, policy: ExponentialBackoff) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Shorthand for adjusting the max retry time of the configured retry policy.
    ///
    /// The default is 30 seconds.
    #[inline]
    pub fn with_max_transaction_retry_time(mut self, max_retry_time: Duration) -> Self {
        self.retry_policy = self.retry_policy.with_max_retry_time(max_retry_time);
        self
    }

    /// Keep routing tables around for this long after they expired before forgetting them
    /// (and closing the connections to servers only they referred to).
    ///
    /// The default is 30 seconds.
    #[inline]
    pub fn with_routing_table_purge_delay(mut self, delay: Duration) -> Self {
        self.routing_table_purge_delay = delay;
        self
    }

    /// How often the background housekeeping closes expired idle connections and purges aged
    /// routing tables.
    ///
    /// The default is 30 seconds.
    ///
    /// # Panics
    /// If `interval` is zero.
    #[inline]
    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        assert!(!interval.is_zero(), "housekeeping interval must not be zero");
        self.housekeeping_interval = Some(interval);
        self
    }

    /// Don't run background housekeeping.
    ///
    /// Idle connections are then only checked when being acquired.
    #[inline]
    pub fn without_housekeeping(mut self) -> Self {
        self.housekeeping_interval = None;
        self
    }
}

impl ConnectionConfig {
    /// Create a new connection configuration with default values.
    ///
    /// Besides the required address, no encryption will be used and routing with an empty
    /// routing context is the default.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            routing_context: Some(HashMap::new()),
            encryption: Encryption::Disabled,
        }
    }

    /// Change the address the driver should connect to.
    pub fn with_address(mut self, address: Address) -> Self {
        self.address = address;
        self
    }

    /// Choose whether the driver should perform routing [`true`] or not [`false`].
    ///
    /// Routing is enabled by *default*.
    ///
    /// Routing should be used and also works with single instance DBMS setups.
    /// Only when specifically needing to connect to a single cluster node (e.g., for maintenance),
    /// should routing be disabled.
    ///
    /// Disabling routing drops a previously configured routing context.
    pub fn with_routing(mut self, routing: bool) -> Self {
        if !routing {
            self.routing_context = None
        } else if self.routing_context.is_none() {
            self.routing_context = Some(HashMap::new());
        }
        self
    }

    /// Enable routing with a specific routing context.
    ///
    /// The routing context is a set of key-value pairs that will be sent to the routers and can
    /// be used for routing policies (e.g., choosing a region).
    ///
    /// # Errors
    /// An [`InvalidRoutingContextError`] is returned if the routing context contains the *reserved*
    /// key `"address"`.
    #[allow(clippy::result_large_err)]
    pub fn with_routing_context(
        mut self,
        routing_context: HashMap<String, String>,
    ) -> StdResult<Self, InvalidRoutingContextError<Self>> {
        if routing_context.contains_key("address") {
            return Err(InvalidRoutingContextError {
                builder: self,
                it: "cannot contain key 'address'",
            });
        }
        self.routing_context = Some(routing_context);
        Ok(self)
    }

    pub fn with_encryption(mut self, encryption: Encryption) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn routing_context(&self) -> Option<&HashMap<String, String>> {
        self.routing_context.as_ref()
    }

    pub fn encryption(&self) -> Encryption {
        self.encryption
    }

    fn parse_uri(uri: &str) -> StdResult<ConnectionConfig, ConnectionConfigParseError> {
        let uri = URI::try_from(uri).map_err(URIError)?;

        let (routing, encryption) = match uri.scheme().as_str() {
            "neo4j" => (true, Encryption::Disabled),
            "neo4j+s" => (true, Encryption::TrustSystemCas),
            "neo4j+ssc" => (true, Encryption::TrustAnyCertificate),
            "bolt" => (false, Encryption::Disabled),
            "bolt+s" => (false, Encryption::TrustSystemCas),
            "bolt+ssc" => (false, Encryption::TrustAnyCertificate),
            scheme => {
                return Err(ConnectionConfigParseError(format!(
                    "unknown scheme in URI {} expected `neo4j`, `neo4j+s`, `neo4j+ssc`, \
                         `bolt`, `bolt+s`, or `bolt+ssc`",
                    scheme
                )))
            }
        };

        let authority = uri
            .authority()
            .ok_or(ConnectionConfigParseError(String::from(
                "missing host in URI",
            )))?;
        if let Some(username) = authority.username() {
            return Err(ConnectionConfigParseError(format!(
                "URI cannot contain a username, found: {}",
                username
            )));
        }
        if authority.has_password() {
            return Err(ConnectionConfigParseError(String::from(
                "URI cannot contain a password",
            )));
        }
        let host = authority.host().to_string();
        let port = authority.port().unwrap_or(DEFAULT_PORT);

        let path = uri.path().to_string();
        if !(path.is_empty() || path == "/") {
            return Err(ConnectionConfigParseError(format!(
                "URI cannot contain a path, found: {}",
                path
            )));
        }

        let routing_context = match uri.query() {
            None => routing.then(HashMap::new),
            Some(query) if query == "" => routing.then(HashMap::new),
            Some(query) => {
                if !routing {
                    return Err(ConnectionConfigParseError(format!(
                        "URI with bolt scheme cannot contain a query (routing context), found: {}",
                        query,
                    )));
                }
                Some(Self::parse_query(query)?)
            }
        };

        if let Some(fragment) = uri.fragment() {
            return Err(ConnectionConfigParseError(format!(
                "URI cannot contain a fragment, found: {}",
                fragment
            )));
        }

        Ok(ConnectionConfig {
            address: (host, port).into(),
            routing_context,
            encryption,
        })
    }

    fn parse_query(query: &Query) -> StdResult<HashMap<String, String>, ConnectionConfigParseError> {
        let mut result = HashMap::new();
        let mut query = query.to_owned();
        query.normalize();
        for key_value in query.split('&') {
            let (key, value) = match key_value.split('=').collect::<Vec<_>>()[..] {
                [key, value] => (key, value),
                _ => {
                    return Err(ConnectionConfigParseError(format!(
                        "couldn't parse key=value pair '{}' in '{}'",
                        key_value, query
                    )))
                }
            };
            if key == "address" {
                return Err(ConnectionConfigParseError(format!(
                    "routing context cannot contain key 'address', found: {}",
                    value
                )));
            }
            result.insert(key.into(), value.into());
        }
        Ok(result)
    }
}

impl TryFrom<&str> for ConnectionConfig {
    type Error = ConnectionConfigParseError;

    fn try_from(value: &str) -> StdResult<Self, Self::Error> {
        Self::parse_uri(value)
    }
}

impl FromStr for ConnectionConfig {
    type Err = ConnectionConfigParseError;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        Self::parse_uri(s)
    }
}

/// Used when an attempt to parse a URL into a [`ConnectionConfig`] failed.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConnectionConfigParseError(String);

#[derive(Debug)]
struct URIError(uriparse::URIError);

impl From<URIError> for ConnectionConfigParseError {
    fn from(e: URIError) -> Self {
        ConnectionConfigParseError(format!("couldn't parse URI {}", e.0))
    }
}

/// Used when configuring a routing context that is invalid.
///
/// See also [`ConnectionConfig::with_routing_context()`].
#[derive(Debug, Error)]
#[error("routing context invalid because it {it}")]
pub struct InvalidRoutingContextError<Builder> {
    pub builder: Builder,
    it: &'static str,
}
