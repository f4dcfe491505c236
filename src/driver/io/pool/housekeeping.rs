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

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use super::Pool;

#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

/// Background thread that periodically evicts expired idle connections
/// and purges aged routing tables.
///
/// The thread only holds a weak reference to the pool.
/// [`Housekeeper::stop()`] wakes it up and joins it.
#[derive(Debug)]
pub(crate) struct Housekeeper {
    signal: Arc<StopSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Housekeeper {
    /// `None` if the thread could not be spawned.
    /// The pool still works without housekeeping, idle connections are then only checked on
    /// acquisition.
    pub(crate) fn start(pool: Weak<Pool>, interval: Duration) -> Option<Self> {
        let signal = Arc::new(StopSignal::default());
        let handle = thread::Builder::new()
            .name(String::from("neo4j-routing-housekeeping"))
            .spawn({
                let signal = Arc::clone(&signal);
                move || Self::run(pool, interval, signal)
            });
        match handle {
            Ok(handle) => Some(Self {
                signal,
                handle: Mutex::new(Some(handle)),
            }),
            Err(err) => {
                warn!("failed to start housekeeping thread: {err}");
                None
            }
        }
    }

    fn run(pool: Weak<Pool>, interval: Duration, signal: Arc<StopSignal>) {
        debug!("housekeeping started with interval {interval:?}");
        loop {
            {
                let mut stopped = signal.stopped.lock();
                if !*stopped {
                    signal.cond.wait_for(&mut stopped, interval);
                }
                if *stopped {
                    break;
                }
            }
            let Some(pool) = pool.upgrade() else {
                break;
            };
            pool.housekeeping();
        }
        debug!("housekeeping stopped");
    }

    /// Stop the thread and wait for it to finish.
    ///
    /// Stopping more than once is a no-op.
    pub(crate) fn stop(&self) {
        {
            let mut stopped = self.signal.stopped.lock();
            *stopped = true;
            self.signal.cond.notify_all();
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("housekeeping thread panicked");
            }
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        self.stop();
    }
}
