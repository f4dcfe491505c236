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

use std::error::Error as StdError;
use std::fmt::{Display, Formatter};
use std::io;

use log::info;
use thiserror::Error;

// imports for docs
#[allow(unused)]
use crate::address_::resolution::AddressResolver;
#[allow(unused)]
use crate::driver::DriverConfig;

type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Error, Debug)]
/// Errors that can occur while routing, pooling, or retrying work.
///
/// **Important Notes on Usage:**
///  * Error messages are *not* considered part of the crate's API.
///    They may change at any time and don't follow semantic versioning.
///  * Use [`Neo4jError::kind()`] to branch on the type of failure and
///    [`ServerError::code()`] for errors reported by the DBMS.
pub enum Neo4jError {
    /// used when
    ///  * experiencing a connectivity error.
    ///    E.g., not able to connect, a broken socket,
    ///    not able to fetch routing information
    #[error("connection failed: {message} (during commit: {during_commit}){}",
            source.as_ref().map(|err| format!(" caused by: {err}")).unwrap_or_default())]
    #[non_exhaustive]
    Disconnect {
        message: String,
        source: Option<io::Error>,
        /// Will be true when connection was lost while the caller cannot be
        /// sure whether the ongoing transaction has been committed or not.
        during_commit: bool,
    },

    /// The server can no longer serve the role (reader/writer) the connection was acquired for.
    ///
    /// The routing table for the affected database is invalidated before the work is retried.
    #[error("session expired: {message}")]
    #[non_exhaustive]
    SessionExpired { message: String },

    /// Used when the crate encounters an error caused by user input.
    /// For example:
    ///  * A configured address resolver ([`DriverConfig::with_resolver()`]) returned no addresses.
    ///  * A URI could not be turned into a connection configuration.
    #[error("invalid configuration: {message}")]
    #[non_exhaustive]
    InvalidConfig { message: String },

    /// Used when:
    ///  * the server returns an error.
    #[error("{error}")]
    #[non_exhaustive]
    ServerError { error: ServerError },

    /// Used when
    ///  * connection acquisition timed out
    ///    ([`DriverConfig::with_connection_acquisition_timeout()`]),
    ///  * waiting for another thread's routing table refresh timed out.
    #[error("{message}")]
    #[non_exhaustive]
    Timeout { message: String },

    /// The driver (or its pool) has been closed.
    /// No further connections can be acquired.
    #[error("{message}")]
    #[non_exhaustive]
    Disposed { message: String },

    /// Used when a user-provided callback failed.
    ///
    /// See [`UserCallbackError`] for more information.
    #[error("{error}")]
    #[non_exhaustive]
    UserCallback { error: UserCallbackError },

    /// An unexpected message or message content was received from the server or from the
    /// [`DiscoveryQuery`](crate::connection::DiscoveryQuery).
    #[error(
        "encountered a protocol violation, \
        this is likely a bug in the connection layer or the server: {message}"
    )]
    #[non_exhaustive]
    ProtocolError { message: String },
}

/// Coarse classification of a [`Neo4jError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Connect or IO failure, or no router reachable.
    Unreachable,
    /// The server cannot serve the requested role any longer.
    SessionExpired,
    /// Transient server error.
    Transient,
    /// Timed out while waiting for a connection or a routing table.
    AcquisitionTimeout,
    /// Authentication or authorization failed.
    Authentication,
    /// The request was rejected by the server.
    Client,
    /// The server failed internally.
    Database,
    /// Used after close.
    Disposed,
    /// Invalid user configuration.
    InvalidConfig,
    /// A user callback failed.
    UserCallback,
    /// Protocol violation.
    Protocol,
}

impl Neo4jError {
    /// Whether a [`RetryPolicy`](crate::retry::RetryPolicy) should try the work again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Neo4jError::ServerError { error } => error.is_retryable(),
            Neo4jError::Disconnect { during_commit, .. } => !during_commit,
            Neo4jError::SessionExpired { .. } => true,
            Neo4jError::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Neo4jError::Disconnect { .. } => ErrorKind::Unreachable,
            Neo4jError::SessionExpired { .. } => ErrorKind::SessionExpired,
            Neo4jError::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            Neo4jError::ServerError { error } => error.kind(),
            Neo4jError::Timeout { .. } => ErrorKind::AcquisitionTimeout,
            Neo4jError::Disposed { .. } => ErrorKind::Disposed,
            Neo4jError::UserCallback { .. } => ErrorKind::UserCallback,
            Neo4jError::ProtocolError { .. } => ErrorKind::Protocol,
        }
    }

    pub fn read_err(err: io::Error) -> Self {
        info!("read error: {}", err);
        Self::Disconnect {
            message: String::from("failed to read"),
            source: Some(err),
            during_commit: false,
        }
    }

    pub fn write_error(err: io::Error) -> Neo4jError {
        info!("write error: {}", err);
        Self::Disconnect {
            message: String::from("failed to write"),
            source: Some(err),
            during_commit: false,
        }
    }

    pub fn connect_error(err: io::Error) -> Neo4jError {
        Self::Disconnect {
            message: String::from("failed to open connection"),
            source: Some(err),
            during_commit: false,
        }
    }

    pub fn disconnect<S: Into<String>>(message: S) -> Self {
        Self::Disconnect {
            message: message.into(),
            source: None,
            during_commit: false,
        }
    }

    pub fn session_expired<S: Into<String>>(message: S) -> Self {
        Self::SessionExpired {
            message: message.into(),
        }
    }

    pub fn protocol_error<S: Into<String>>(message: S) -> Self {
        Self::ProtocolError {
            message: message.into(),
        }
    }

    pub(crate) fn disposed<S: AsRef<str>>(what: S) -> Self {
        Self::Disposed {
            message: format!("{} has been closed", what.as_ref()),
        }
    }

    /// Mark a connectivity error as having happened while committing.
    ///
    /// Such errors are not retried as the outcome of the commit is unknown.
    pub fn failed_commit(mut self) -> Self {
        if let Self::Disconnect { during_commit, .. } = &mut self {
            *during_commit = true;
        }
        self
    }

    pub(crate) fn connection_acquisition_timeout<S: AsRef<str>>(during: S) -> Self {
        Self::Timeout {
            message: format!("connection acquisition timed out while {}", during.as_ref()),
        }
    }

    pub(crate) fn is_disconnect(&self) -> bool {
        matches!(self, Neo4jError::Disconnect { .. })
    }

    pub(crate) fn fatal_during_discovery(&self) -> bool {
        match self {
            Neo4jError::ServerError { error } => error.fatal_during_discovery(),
            Neo4jError::InvalidConfig { .. } => true,
            Neo4jError::UserCallback { .. } => true,
            Neo4jError::Disposed { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn server_error(&self) -> Option<&ServerError> {
        match self {
            Neo4jError::ServerError { error } => Some(error),
            _ => None,
        }
    }
}

// Followers of a coalesced routing table refresh receive a copy of the leader's error.
// Sources that cannot be cloned are carried over by their message.
impl Clone for Neo4jError {
    fn clone(&self) -> Self {
        match self {
            Neo4jError::Disconnect {
                message,
                source,
                during_commit,
            } => Neo4jError::Disconnect {
                message: message.clone(),
                source: source
                    .as_ref()
                    .map(|err| io::Error::new(err.kind(), err.to_string())),
                during_commit: *during_commit,
            },
            Neo4jError::SessionExpired { message } => Neo4jError::SessionExpired {
                message: message.clone(),
            },
            Neo4jError::InvalidConfig { message } => Neo4jError::InvalidConfig {
                message: message.clone(),
            },
            Neo4jError::ServerError { error } => Neo4jError::ServerError {
                error: error.clone(),
            },
            Neo4jError::Timeout { message } => Neo4jError::Timeout {
                message: message.clone(),
            },
            Neo4jError::Disposed { message } => Neo4jError::Disposed {
                message: message.clone(),
            },
            Neo4jError::UserCallback { error } => Neo4jError::UserCallback {
                error: error.clone_by_message(),
            },
            Neo4jError::ProtocolError { message } => Neo4jError::ProtocolError {
                message: message.clone(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerError {
    pub code: String,
    pub message: String,
}

impl ServerError {
    pub fn new(code: String, message: String) -> Self {
        let code = match code.as_str() {
            // In 5.0, these errors have been re-classified as ClientError.
            // For backwards compatibility with Neo4j 4.4 and earlier, we re-map
            // them here, too.
            "Neo.TransientError.Transaction.Terminated" => {
                String::from("Neo.ClientError.Transaction.Terminated")
            }
            "Neo.TransientError.Transaction.LockClientStopped" => {
                String::from("Neo.ClientError.Transaction.LockClientStopped")
            }
            _ => code,
        };
        Self { code, message }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn classification(&self) -> &str {
        self.code.split('.').nth(1).unwrap_or("")
    }

    pub fn category(&self) -> &str {
        self.code.split('.').nth(2).unwrap_or("")
    }

    pub fn title(&self) -> &str {
        self.code.split('.').nth(3).unwrap_or("")
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_security_error() {
            return ErrorKind::Authentication;
        }
        match self.classification() {
            "TransientError" => ErrorKind::Transient,
            "ClientError" => ErrorKind::Client,
            _ => ErrorKind::Database,
        }
    }

    pub(crate) fn is_retryable(&self) -> bool {
        match self.code() {
            "Neo.ClientError.Security.AuthorizationExpired"
            | "Neo.ClientError.Cluster.NotALeader"
            | "Neo.ClientError.General.ForbiddenOnReadOnlyDatabase" => true,
            _ => self.classification() == "TransientError",
        }
    }

    pub(crate) fn fatal_during_discovery(&self) -> bool {
        match self.code() {
            "Neo.ClientError.Database.DatabaseNotFound"
            | "Neo.ClientError.Transaction.InvalidBookmark"
            | "Neo.ClientError.Transaction.InvalidBookmarkMixture"
            | "Neo.ClientError.Statement.TypeError"
            | "Neo.ClientError.Statement.ArgumentError"
            | "Neo.ClientError.Request.Invalid" => true,
            code => {
                code.starts_with("Neo.ClientError.Security.")
                    && code != "Neo.ClientError.Security.AuthorizationExpired"
            }
        }
    }

    pub(crate) fn deactivates_server(&self) -> bool {
        self.code.as_str() == "Neo.TransientError.General.DatabaseUnavailable"
    }

    pub(crate) fn invalidates_writer(&self) -> bool {
        matches!(
            self.code(),
            "Neo.ClientError.Cluster.NotALeader"
                | "Neo.ClientError.General.ForbiddenOnReadOnlyDatabase"
        )
    }

    pub(crate) fn is_security_error(&self) -> bool {
        self.code.starts_with("Neo.ClientError.Security.")
    }
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "server error {}: {}", self.code, self.message)
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UserCallbackError {
    /// The configured [`AddressResolver`] ([`DriverConfig::with_resolver()`]) returned an error.
    #[error("resolver callback failed: {0}")]
    Resolver(BoxError),
}

impl UserCallbackError {
    pub fn user_error(&self) -> &dyn StdError {
        match self {
            UserCallbackError::Resolver(err) => err.as_ref(),
        }
    }

    pub fn into_user_error(self) -> BoxError {
        match self {
            UserCallbackError::Resolver(err) => err,
        }
    }

    fn clone_by_message(&self) -> Self {
        match self {
            UserCallbackError::Resolver(err) => UserCallbackError::Resolver(err.to_string().into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Neo4jError>;

impl From<ServerError> for Neo4jError {
    fn from(err: ServerError) -> Self {
        Neo4jError::ServerError { error: err }
    }
}

#[cfg(test)]
mod tests {
    use rstest::*;

    use super::*;

    fn server_error(code: &str) -> Neo4jError {
        ServerError::new(code.into(), "message".into()).into()
    }

    #[rstest]
    #[case(Neo4jError::disconnect("gone"), true)]
    #[case(Neo4jError::disconnect("gone").failed_commit(), false)]
    #[case(Neo4jError::session_expired("leader switch"), true)]
    #[case(Neo4jError::connection_acquisition_timeout("testing"), true)]
    #[case(Neo4jError::disposed("pool"), false)]
    #[case(Neo4jError::protocol_error("garbage"), false)]
    #[case(server_error("Neo.TransientError.General.DatabaseUnavailable"), true)]
    #[case(server_error("Neo.TransientError.Transaction.Terminated"), false)]
    #[case(server_error("Neo.TransientError.Transaction.LockClientStopped"), false)]
    #[case(server_error("Neo.ClientError.Cluster.NotALeader"), true)]
    #[case(server_error("Neo.ClientError.General.ForbiddenOnReadOnlyDatabase"), true)]
    #[case(server_error("Neo.ClientError.Security.AuthorizationExpired"), true)]
    #[case(server_error("Neo.ClientError.Security.Unauthorized"), false)]
    #[case(server_error("Neo.ClientError.Statement.SyntaxError"), false)]
    fn test_is_retryable(#[case] error: Neo4jError, #[case] retryable: bool) {
        assert_eq!(error.is_retryable(), retryable);
    }

    #[rstest]
    #[case(Neo4jError::disconnect("gone"), ErrorKind::Unreachable)]
    #[case(Neo4jError::session_expired("x"), ErrorKind::SessionExpired)]
    #[case(Neo4jError::connection_acquisition_timeout("x"), ErrorKind::AcquisitionTimeout)]
    #[case(Neo4jError::disposed("pool"), ErrorKind::Disposed)]
    #[case(server_error("Neo.TransientError.General.DatabaseUnavailable"), ErrorKind::Transient)]
    #[case(server_error("Neo.TransientError.Transaction.Terminated"), ErrorKind::Client)]
    #[case(server_error("Neo.ClientError.Security.Unauthorized"), ErrorKind::Authentication)]
    #[case(server_error("Neo.DatabaseError.General.UnknownError"), ErrorKind::Database)]
    fn test_kind(#[case] error: Neo4jError, #[case] kind: ErrorKind) {
        assert_eq!(error.kind(), kind);
    }

    #[rstest]
    #[case("Neo.ClientError.Database.DatabaseNotFound", true)]
    #[case("Neo.ClientError.Transaction.InvalidBookmark", true)]
    #[case("Neo.ClientError.Security.Unauthorized", true)]
    #[case("Neo.ClientError.Security.AuthorizationExpired", false)]
    #[case("Neo.TransientError.General.DatabaseUnavailable", false)]
    fn test_fatal_during_discovery(#[case] code: &str, #[case] fatal: bool) {
        assert_eq!(server_error(code).fatal_during_discovery(), fatal);
    }

    #[rstest]
    fn test_clone_keeps_io_source_message() {
        let error = Neo4jError::connect_error(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "nobody home",
        ));
        let cloned = error.clone();
        assert_eq!(error.to_string(), cloned.to_string());
        let Neo4jError::Disconnect {
            source: Some(source),
            ..
        } = cloned
        else {
            panic!("expected disconnect with source");
        };
        assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
    }
}
