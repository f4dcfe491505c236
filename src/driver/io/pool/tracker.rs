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
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use parking_lot::Mutex;

use super::super::connection::Terminator;
use crate::address_::Address;

/// Stable identifier of a pooled connection for the lifetime of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Observation-only view of a live connection.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct LiveConnection {
    pub id: ConnectionId,
    pub address: Arc<Address>,
    pub created_at: Instant,
}

#[derive(Debug)]
struct TrackedConnection {
    info: LiveConnection,
    terminator: Option<Arc<dyn Terminator>>,
}

/// Registry of all connections currently open, keyed by [`ConnectionId`].
///
/// Never consulted by the pools' own bookkeeping.
/// Terminating a connection through the tracker only severs it,
/// the owning pool notices the next time it touches the connection.
#[derive(Debug, Default)]
pub(crate) struct ConnectionTracker {
    next_id: AtomicU64,
    live: Mutex<HashMap<ConnectionId, TrackedConnection>>,
}

impl ConnectionTracker {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    pub(crate) fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(
        &self,
        id: ConnectionId,
        address: Arc<Address>,
        created_at: Instant,
        terminator: Option<Arc<dyn Terminator>>,
    ) {
        let tracked = TrackedConnection {
            info: LiveConnection {
                id,
                address,
                created_at,
            },
            terminator,
        };
        self.live.lock().insert(id, tracked);
    }

    pub(crate) fn unregister(&self, id: ConnectionId) {
        self.live.lock().remove(&id);
    }

    pub(crate) fn live_connections(&self) -> Vec<LiveConnection> {
        let mut live = self
            .live
            .lock()
            .values()
            .map(|tracked| tracked.info.clone())
            .collect::<Vec<_>>();
        live.sort_by_key(|info| info.id);
        live
    }

    /// Returns `false` if the connection is unknown or cannot be terminated.
    pub(crate) fn terminate(&self, id: ConnectionId) -> bool {
        let terminator = self
            .live
            .lock()
            .get(&id)
            .and_then(|tracked| tracked.terminator.as_ref().map(Arc::clone));
        match terminator {
            None => false,
            Some(terminator) => {
                debug!("terminating {id} from outside the pool");
                terminator.terminate();
                true
            }
        }
    }
}
