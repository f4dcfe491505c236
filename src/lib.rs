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

//! Cluster-aware connection routing, pooling, and retry for Neo4j clients.
//!
//! The crate manages connections to a single DBMS instance (`bolt://` URIs) or to a cluster
//! (`neo4j://` URIs).
//! For clusters, it keeps per-database routing tables up to date, spreads work across the
//! cluster members in round-robin order, and takes failing members out of rotation.
//! Units of work can be retried with exponential backoff across leader switches and
//! transient failures.
//!
//! The wire protocol is not part of this crate.
//! Connections are opened by a user-provided [`connection::Connector`] and routing
//! information is fetched through a [`connection::DiscoveryQuery`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use neo4j_routing::connection::{Connector, DiscoveryQuery};
//! use neo4j_routing::driver::{AcquireConfig, Driver, DriverConfig, RoutingControl};
//!
//! # fn run(connector: Arc<dyn Connector>, discovery: Arc<dyn DiscoveryQuery>) {
//! let driver = Driver::new(
//!     "neo4j://localhost:7687".parse().unwrap(),
//!     DriverConfig::new(),
//!     connector,
//!     discovery,
//! );
//! let config = AcquireConfig::new(RoutingControl::Read).with_database(String::from("movies"));
//! let mut connection = driver.acquire_connection(&config).unwrap();
//! let response = connection.send_receive(b"request", None).unwrap();
//! # }
//! ```

mod address_;
pub mod driver;
mod error_;
mod macros;
mod sync;

pub use address_::Address;
pub use error_::{Neo4jError, Result};

pub mod address {
    pub use super::address_::resolution::*;
    pub use super::address_::*;
}
pub mod bookmarks {
    pub use super::driver::session::bookmarks::*;
}
pub mod connection {
    pub use super::driver::io::connection::*;
}
pub mod error {
    pub use super::error_::{ErrorKind, Neo4jError, Result, ServerError, UserCallbackError};
}
pub mod retry {
    pub use super::driver::session::retry::*;
}
pub mod session {
    pub use super::driver::session::*;
}
