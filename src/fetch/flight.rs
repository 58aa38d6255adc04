//! Single-flight coalescing for concurrent cache misses.
//!
//! An explicit in-flight map keyed by cache key: the first caller to
//! miss becomes the *leader* and performs the upstream fetch; everyone
//! else becomes a *follower* and awaits the leader's shared outcome
//! through a watch channel. At most one upstream call per key is ever in
//! flight.
//!
//! The leader publishes through [`FlightGuard::finish`]. If the leader's
//! future is dropped before finishing, the guard removes the map entry
//! and the closed channel tells followers the flight was abandoned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use super::Fetched;
use crate::{MuninError, Result};

/// Shared outcome of a flight. `Err(())` means the leader exhausted its
/// fallback chain; followers reconstruct the error from the key.
pub(crate) type FlightResult = std::result::Result<Fetched, ()>;

type Channel = watch::Receiver<Option<FlightResult>>;

/// Either the right to perform the fetch, or a handle to someone else's.
pub(crate) enum Flight {
    Leader(FlightGuard),
    Follower(Channel),
}

/// In-flight fetch registry.
pub(crate) struct FlightMap {
    inner: Arc<Mutex<HashMap<String, Channel>>>,
}

impl FlightMap {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join or start the flight for `key`.
    pub(crate) fn begin(&self, key: &str) -> Flight {
        let mut map = self.inner.lock().expect("flight map lock poisoned");
        if let Some(rx) = map.get(key) {
            return Flight::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        map.insert(key.to_owned(), rx);
        Flight::Leader(FlightGuard {
            key: key.to_owned(),
            tx,
            map: Arc::clone(&self.inner),
            finished: false,
        })
    }
}

/// Leadership of one in-flight fetch.
pub(crate) struct FlightGuard {
    key: String,
    tx: watch::Sender<Option<FlightResult>>,
    map: Arc<Mutex<HashMap<String, Channel>>>,
    finished: bool,
}

impl FlightGuard {
    /// Publish the outcome and release the key for future fetches.
    pub(crate) fn finish(mut self, outcome: FlightResult) {
        self.map
            .lock()
            .expect("flight map lock poisoned")
            .remove(&self.key);
        self.finished = true;
        let _ = self.tx.send(Some(outcome));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Leader dropped without finishing (cancelled mid-fetch): free the
        // key so later callers can retry. Dropping `tx` closes the channel
        // for any followers.
        if !self.finished {
            self.map
                .lock()
                .expect("flight map lock poisoned")
                .remove(&self.key);
        }
    }
}

/// Await a leader's shared outcome.
pub(crate) async fn await_shared(mut rx: Channel, key: &str) -> Result<Fetched> {
    loop {
        let outcome = rx.borrow_and_update().clone();
        if let Some(outcome) = outcome {
            return match outcome {
                Ok(fetched) => Ok(fetched),
                Err(()) => Err(MuninError::FallbackExhausted {
                    key: key.to_owned(),
                }),
            };
        }
        if rx.changed().await.is_err() {
            // Flight abandoned; nothing to share.
            return Err(MuninError::FallbackExhausted {
                key: key.to_owned(),
            });
        }
    }
}
