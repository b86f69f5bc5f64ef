//! Keyed single-flight execution.
//!
//! A `Group` collapses concurrent calls with the same key onto one shared
//! future: the first caller runs the work, every concurrent caller awaits
//! the same result. Once the flight lands the key is cleared, so later
//! callers start a fresh flight.

use crate::error::{Result, StrataError};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

type SharedResult<T> = std::result::Result<T, Arc<StrataError>>;
type Flight<T> = Shared<BoxFuture<'static, SharedResult<T>>>;

pub struct Group<T: Clone> {
    inflight: Mutex<HashMap<String, Flight<T>>>,
}

impl<T: Clone> Default for Group<T> {
    fn default() -> Self {
        Self { inflight: Mutex::new(HashMap::new()) }
    }
}

impl<T: Clone + Send + Sync + 'static> Group<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` under `key`, deduplicating against concurrent calls.
    pub async fn run<F>(&self, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (flight, leader) = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get(key) {
                Some(flight) => (flight.clone(), false),
                None => {
                    let flight = fut.map(|r| r.map_err(Arc::new)).boxed().shared();
                    inflight.insert(key.to_string(), flight.clone());
                    (flight, true)
                }
            }
        };
        let res = flight.await;
        if leader {
            self.inflight.lock().unwrap().remove(key);
        }
        res.map_err(StrataError::Shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_calls_coalesce() {
        let group = Arc::new(Group::<usize>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let group = group.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                group
                    .run("key", async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let group = Group::<&'static str>::new();
        let a = group.run("a", async { Ok("a") }).await.unwrap();
        let b = group.run("b", async { Ok("b") }).await.unwrap();
        assert_eq!((a, b), ("a", "b"));
    }

    #[tokio::test]
    async fn test_error_propagates_to_all_callers() {
        let group = Arc::new(Group::<usize>::new());
        let g2 = group.clone();
        let first = tokio::spawn(async move {
            g2.run("key", async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(StrataError::Internal("nope".to_string()))
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = group.run("key", async { Ok(1) }).await;
        assert!(first.await.unwrap().is_err());
        assert!(second.is_err());
    }
}
