//! Request queues
//!
//! Two disciplines exist:
//! - a process-wide single-flight queue for Gemini (its API throttles
//!   aggressively under concurrent calls, so all Gemini traffic serializes)
//! - per-provider counting semaphores for local inference, where the
//!   concurrency limit is configurable and 0 means unbounded
//!
//! Tokio's `Semaphore` hands out permits in FIFO order, which gives the
//! queue its fairness guarantee.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::Semaphore;

/// A FIFO admission queue over an async operation
pub struct RequestQueue {
    semaphore: Option<Arc<Semaphore>>,
}

impl RequestQueue {
    /// One request at a time
    pub fn single_flight() -> Self {
        Self {
            semaphore: Some(Arc::new(Semaphore::new(1))),
        }
    }

    /// At most `limit` concurrent requests; 0 means unbounded
    pub fn with_concurrency(limit: usize) -> Self {
        Self {
            semaphore: (limit > 0).then(|| Arc::new(Semaphore::new(limit))),
        }
    }

    /// Run a future under the queue's admission control
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        match &self.semaphore {
            Some(semaphore) => {
                // The semaphore is never closed, so acquire cannot fail
                let _permit = semaphore.clone().acquire_owned().await.expect("queue closed");
                fut.await
            }
            None => fut.await,
        }
    }
}

/// Process-wide Gemini queue: every Gemini request in the process, across
/// all handlers, goes through this one single-flight gate.
pub fn gemini_queue() -> &'static RequestQueue {
    static QUEUE: OnceLock<RequestQueue> = OnceLock::new();
    QUEUE.get_or_init(RequestQueue::single_flight)
}

/// Per-provider local queues, created on first use with the configured
/// concurrency. Keyed by provider name so `ollama` and `lmstudio` throttle
/// independently.
pub fn local_queue(provider: &str, concurrency: usize) -> Arc<RequestQueue> {
    static QUEUES: OnceLock<Mutex<HashMap<String, Arc<RequestQueue>>>> = OnceLock::new();
    let queues = QUEUES.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = queues.lock().unwrap();
    map.entry(provider.to_string())
        .or_insert_with(|| Arc::new(RequestQueue::with_concurrency(concurrency)))
        .clone()
}
