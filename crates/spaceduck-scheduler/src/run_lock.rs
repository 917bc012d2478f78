use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Owned release handle for a conversation lane. Dropping it is the single
/// release.
pub type RunLockGuard = OwnedMutexGuard<()>;

/// Cooperative mutual exclusion keyed by conversation id. Acquisition order
/// is FIFO-fair per key; idle entries are kept (cleanup is not required for
/// correctness).
#[derive(Default)]
pub struct RunLockMap {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RunLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, conversation_id: &str) -> RunLockGuard {
        let lane = {
            let mut locks = self.locks.lock().expect("run lock map poisoned");
            locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lane.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn same_conversation_runs_serially() {
        let locks = Arc::new(RunLockMap::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("conv-a").await;
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn different_conversations_run_concurrently() {
        let locks = Arc::new(RunLockMap::new());
        let guard_a = locks.acquire("conv-a").await;
        // A second lane must not be blocked by the first.
        let acquired_b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("conv-b"))
            .await
            .is_ok();
        assert!(acquired_b);
        drop(guard_a);
    }
}
