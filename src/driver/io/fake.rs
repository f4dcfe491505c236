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

//! In-memory [`Connector`] and [`DiscoveryQuery`] for exercising the pool without a server.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::connection::{
    ConnectOptions, Connection, Connector, DiscoveryQuery, DiscoveryRequest, DiscoveryResponse,
    Terminator,
};
use super::pool::PoolConfig;
use crate::address_::Address;
use crate::driver::config::Encryption;
use crate::error_::{Neo4jError, Result};

#[derive(Debug)]
pub(crate) struct FakeLink {
    open: AtomicBool,
    fail_reset: AtomicBool,
    resets: AtomicUsize,
}

impl FakeLink {
    fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            fail_reset: AtomicBool::new(false),
            resets: AtomicUsize::new(0),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Make the next liveness check fail without closing the link first.
    pub(crate) fn fail_reset(&self) {
        self.fail_reset.store(true, Ordering::SeqCst);
    }

    pub(crate) fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl Terminator for FakeLink {
    fn terminate(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub(crate) struct FakeConnection {
    address: Arc<Address>,
    link: Arc<FakeLink>,
}

impl Connection for FakeConnection {
    fn address(&self) -> &Arc<Address> {
        &self.address
    }

    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    fn send_receive(&mut self, request: &[u8], _deadline: Option<Instant>) -> Result<Vec<u8>> {
        if !self.is_open() {
            return Err(Neo4jError::write_error(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection terminated",
            )));
        }
        Ok(request.to_vec())
    }

    fn reset(&mut self, _deadline: Option<Instant>) -> Result<()> {
        self.link.resets.fetch_add(1, Ordering::SeqCst);
        if !self.is_open() || self.link.fail_reset.load(Ordering::SeqCst) {
            self.close();
            return Err(Neo4jError::read_err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.link.terminate();
    }

    fn terminator(&self) -> Option<Arc<dyn Terminator>> {
        Some(Arc::clone(&self.link) as Arc<dyn Terminator>)
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeConnector {
    unreachable: Mutex<HashSet<Address>>,
    opened: Mutex<Vec<(Arc<Address>, Arc<FakeLink>)>>,
    attempts: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<Self> {
        Default::default()
    }

    pub(crate) fn set_unreachable(&self, address: &str, unreachable: bool) {
        let mut addresses = self.unreachable.lock();
        if unreachable {
            addresses.insert(Address::from(address));
        } else {
            addresses.remove(&Address::from(address));
        }
    }

    /// Number of calls to [`Connector::open()`], successful or not.
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Links of all connections successfully opened to `address`, oldest first.
    pub(crate) fn links(&self, address: &str) -> Vec<Arc<FakeLink>> {
        let address = Address::from(address);
        self.opened
            .lock()
            .iter()
            .filter(|(a, _)| **a == address)
            .map(|(_, link)| Arc::clone(link))
            .collect()
    }

    pub(crate) fn opened_to(&self, address: &str) -> usize {
        self.links(address).len()
    }
}

impl Connector for FakeConnector {
    fn open(
        &self,
        address: Arc<Address>,
        _options: &ConnectOptions,
        _deadline: Option<Instant>,
    ) -> Result<Box<dyn Connection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.lock().contains(&*address) {
            return Err(Neo4jError::connect_error(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{address} refused the connection"),
            )));
        }
        let link = Arc::new(FakeLink::new());
        self.opened
            .lock()
            .push((Arc::clone(&address), Arc::clone(&link)));
        Ok(Box::new(FakeConnection { address, link }))
    }
}

#[derive(Debug)]
pub(crate) struct FakeDiscovery {
    response: Mutex<Result<DiscoveryResponse>>,
    per_router: Mutex<HashMap<Address, Result<DiscoveryResponse>>>,
    delay: Mutex<Duration>,
    requests: Mutex<Vec<(Arc<Address>, DiscoveryRequest)>>,
}

impl FakeDiscovery {
    pub(crate) fn new(response: DiscoveryResponse) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(Ok(response)),
            per_router: Default::default(),
            delay: Default::default(),
            requests: Default::default(),
        })
    }

    pub(crate) fn set_response(&self, response: Result<DiscoveryResponse>) {
        *self.response.lock() = response;
    }

    pub(crate) fn set_router_response(&self, router: &str, response: Result<DiscoveryResponse>) {
        self.per_router
            .lock()
            .insert(Address::from(router), response);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Routers asked so far, in order.
    pub(crate) fn routers_asked(&self) -> Vec<Arc<Address>> {
        self.requests
            .lock()
            .iter()
            .map(|(router, _)| Arc::clone(router))
            .collect()
    }

    pub(crate) fn last_request(&self) -> Option<DiscoveryRequest> {
        self.requests
            .lock()
            .last()
            .map(|(_, request)| request.clone())
    }
}

impl DiscoveryQuery for FakeDiscovery {
    fn discover(
        &self,
        connection: &mut dyn Connection,
        request: &DiscoveryRequest,
    ) -> Result<DiscoveryResponse> {
        let router = Arc::clone(connection.address());
        self.requests.lock().push((Arc::clone(&router), request.clone()));
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            sleep(delay);
        }
        if !connection.is_open() {
            return Err(Neo4jError::disconnect("connection closed"));
        }
        if let Some(response) = self.per_router.lock().get(&*router) {
            return response.clone();
        }
        self.response.lock().clone()
    }
}

pub(crate) fn response(
    ttl_seconds: u64,
    routers: &[&str],
    readers: &[&str],
    writers: &[&str],
) -> DiscoveryResponse {
    let addresses = |raw: &[&str]| raw.iter().map(|a| Address::from(*a)).collect();
    DiscoveryResponse {
        ttl_seconds,
        database: None,
        routers: addresses(routers),
        readers: addresses(readers),
        writers: addresses(writers),
    }
}

pub(crate) fn pool_config(
    seed: &str,
    routing: bool,
    max_connection_pool_size: usize,
    connector: Arc<FakeConnector>,
) -> PoolConfig {
    PoolConfig {
        address: Arc::new(Address::from(seed)),
        connector,
        connect_options: ConnectOptions {
            user_agent: String::from("test"),
            auth: Default::default(),
            routing_context: routing.then(HashMap::new),
            connection_timeout: None,
            encryption: Encryption::Disabled,
        },
        resolver: None,
        max_connection_pool_size,
        max_idle_connection_pool_size: None,
        max_connection_lifetime: None,
        connection_idle_timeout: None,
        idle_time_before_connection_test: None,
        routing_table_purge_delay: Duration::from_secs(30),
    }
}
