// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Deduplication of concurrent identical operations.
//!
//! A mutex-guarded map from key to a shared in-flight future. The first caller
//! for a key spawns the work on its own task; later callers attach to the same
//! future. The work keeps running if every waiter goes away, and the map entry
//! is cleared by the task itself once the work completes.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

type Flight<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;
type FlightMap<K, V, E> = Arc<Mutex<HashMap<K, Flight<V, E>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // No invariant spans a panic here: entries are inserted and removed whole.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collapses concurrent calls for the same key into one execution.
pub struct SingleFlight<K, V, E> {
    in_flight: FlightMap<K, V, E>,
    abandoned: fn(&K, String) -> E,
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// `abandoned` builds the error handed to waiters if the work task panics.
    pub fn new(abandoned: fn(&K, String) -> E) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            abandoned,
        }
    }

    /// Run `work` for `key`, or wait for the run already in flight.
    ///
    /// `work` is only invoked by the caller that starts the flight.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.run_unless(key, || None, work).await
    }

    /// Like [`run`](Self::run), but first consults `settled` when no flight
    /// is in progress.
    ///
    /// `settled` runs under the flight map lock. Work that stores its result
    /// before finishing is therefore never repeated by a caller that raced
    /// with its completion.
    pub async fn run_unless<C, F, Fut>(&self, key: K, settled: C, work: F) -> Result<V, E>
    where
        C: FnOnce() -> Option<V>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let flight = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    if let Some(value) = settled() {
                        return Ok(value);
                    }

                    let map = Arc::clone(&self.in_flight);
                    let task_key = key.clone();
                    let work = work();
                    let task = tokio::spawn(async move {
                        let result = work.await;
                        lock(&map).remove(&task_key);
                        result
                    });

                    let abandoned = self.abandoned;
                    let flight_key = key.clone();
                    let flight = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(abandoned(&flight_key, e.to_string())),
                        }
                    }
                    .boxed()
                    .shared();

                    in_flight.insert(key, flight.clone());
                    flight
                }
            }
        };

        flight.await
    }

    /// Number of keys with work currently in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn abandoned(key: &String, reason: String) -> String {
        format!("{}: {}", key, reason)
    }

    #[tokio::test]
    async fn test_concurrent_calls_collapse() {
        let flights = Arc::new(SingleFlight::<String, u64, String>::new(abandoned));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let flights = Arc::clone(&flights);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                flights
                    .run("k".to_string(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_not_retained() {
        let flights = SingleFlight::<String, u64, String>::new(abandoned);

        let first = flights
            .run("k".to_string(), || async { Err("down".to_string()) })
            .await;
        assert_eq!(first, Err("down".to_string()));

        let second = flights.run("k".to_string(), || async { Ok(7) }).await;
        assert_eq!(second, Ok(7));
    }

    #[tokio::test]
    async fn test_work_survives_cancelled_waiter() {
        let flights = Arc::new(SingleFlight::<String, u64, String>::new(abandoned));
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&calls);
        let waiter = tokio::time::timeout(
            Duration::from_millis(10),
            flights.run("k".to_string(), move || async move {
                counted.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(1)
            }),
        )
        .await;
        assert!(waiter.is_err());

        // The second caller attaches to the still-running flight
        let result = flights
            .run("k".to_string(), || async { Ok(2) })
            .await;
        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settled_value_skips_work() {
        let flights = SingleFlight::<String, u64, String>::new(abandoned);
        let calls = AtomicUsize::new(0);

        let result = flights
            .run_unless("k".to_string(), || Some(9), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(1) }
            })
            .await;
        assert_eq!(result, Ok(9));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_settled_not_consulted_while_in_flight() {
        let flights = Arc::new(SingleFlight::<String, u64, String>::new(abandoned));

        let leader = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                flights
                    .run("k".to_string(), || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(3)
                    })
                    .await
            })
        };
        while flights.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let follower = flights
            .run_unless(
                "k".to_string(),
                || panic!("settled must not run while a flight exists"),
                || async { Ok(4) },
            )
            .await;
        assert_eq!(follower, Ok(3));
        assert_eq!(leader.await.unwrap(), Ok(3));
    }

    #[tokio::test]
    async fn test_panicking_work_reports_abandoned() {
        let flights = SingleFlight::<String, u64, String>::new(abandoned);
        let result = flights
            .run("k".to_string(), || async {
                let fail = true;
                if fail {
                    panic!("boom");
                }
                Ok(0)
            })
            .await;
        assert!(result.unwrap_err().starts_with("k: "));
    }
}
