//! At-most-once concurrent fetch per key.
//!
//! The first caller for a key installs the fetch future; everyone arriving
//! while it is in flight attaches to the same future and observes the same
//! success value or the same error. The future is a [`Shared`] handle, so
//! it outlives any individual waiter: when every waiter has cancelled, the
//! fetch is suspended rather than lost, and the next caller for the key
//! resumes it. Completed flights are removed from the registry before the
//! result is delivered, so errors are never served to later callers.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

type Flight<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

pub struct SingleFlight<K, V, E> {
    flights: Arc<DashMap<K, Flight<V, E>, ahash::RandomState>>,
}

impl<K, V, E> Default for SingleFlight<K, V, E>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self { flights: Arc::new(DashMap::default()) }
    }
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `fetch` for `key`, or attaches to the flight already running
    /// for it. Returns the shared result and whether this caller started
    /// the fetch.
    pub async fn run<F, Fut>(&self, key: K, fetch: F) -> (Result<V, E>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (flight, first) = match self.flights.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let flights = Arc::clone(&self.flights);
                let fut = fetch();
                let flight = async move {
                    let result = fut.await;
                    flights.remove(&key);
                    result
                }
                .boxed()
                .shared();
                entry.insert(flight.clone());
                (flight, true)
            }
        };
        (flight.await, first)
    }

    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}
