//! Connection pool / pre-warmer.
//!
//! Opening an avatar media connection costs several round trips, so a small
//! number of connections are negotiated ahead of demand and parked here.
//! Pre-warming is opportunistic: the pool is bounded, newer negotiations
//! evict the oldest unconsumed entry (negotiated media parameters go stale),
//! and `take` hands each entry to exactly one caller. Callers finding the
//! pool empty retry with backoff rather than blocking.

use crate::synthesis::{PendingConnection, SynthesisService};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ConnectionPool {
    inner: Mutex<VecDeque<PendingConnection>>,
    capacity: usize,
    stale_after: Duration,
    negotiation_timeout: Duration,
    service: Arc<dyn SynthesisService>,
}

impl ConnectionPool {
    pub fn new(
        service: Arc<dyn SynthesisService>,
        capacity: usize,
        stale_after: Duration,
        negotiation_timeout: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity,
            stale_after,
            negotiation_timeout,
            service,
        }
    }

    /// Begins one negotiation in the background. On success the result lands
    /// in the pool; on failure or timeout only a log entry remains.
    pub fn prepare_one(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let negotiation = pool.service.begin_negotiation();
            match tokio::time::timeout(pool.negotiation_timeout, negotiation).await {
                Ok(Ok(conn)) => pool.push_ready(conn),
                Ok(Err(e)) => warn!(error = ?e, "Connection pre-warm failed."),
                Err(_) => warn!("Connection pre-warm timed out."),
            }
        });
    }

    fn push_ready(&self, conn: PendingConnection) {
        let mut queue = self.inner.lock().expect("pool lock poisoned");
        if queue.len() >= self.capacity {
            if let Some(evicted) = queue.pop_front() {
                debug!(id = %evicted.id, "Evicting oldest pre-warmed connection.");
            }
        }
        info!(id = %conn.id, "Pre-warmed connection ready.");
        queue.push_back(conn);
    }

    /// Removes and returns the oldest still-fresh entry, or `None` when
    /// nothing is ready yet. Each entry is returned at most once.
    pub fn take(&self) -> Option<PendingConnection> {
        let mut queue = self.inner.lock().expect("pool lock poisoned");
        while let Some(conn) = queue.pop_front() {
            if conn.ready_at.elapsed() > self.stale_after {
                debug!(id = %conn.id, "Discarding stale pre-warmed connection.");
                continue;
            }
            return Some(conn);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    fn push_for_test(&self, conn: PendingConnection) {
        self.push_ready(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::{BoundConnection, SessionParams, SynthesisTransport};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct NullTransport;

    #[async_trait]
    impl SynthesisTransport for NullTransport {
        async fn handshake(
            self: Box<Self>,
            _config_context: serde_json::Value,
        ) -> Result<BoundConnection> {
            anyhow::bail!("not bindable in pool tests")
        }
    }

    fn pending() -> PendingConnection {
        PendingConnection::new(vec![], Box::new(NullTransport))
    }

    struct NeverReadyService;

    #[async_trait]
    impl SynthesisService for NeverReadyService {
        async fn begin_negotiation(&self) -> Result<PendingConnection> {
            anyhow::bail!("no negotiation in tests")
        }
        async fn bind(
            &self,
            _conn: PendingConnection,
            _params: SessionParams,
        ) -> Result<BoundConnection> {
            anyhow::bail!("no bind in tests")
        }
    }

    fn test_pool(capacity: usize) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            Arc::new(NeverReadyService),
            capacity,
            Duration::from_secs(300),
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn take_on_empty_pool_returns_none() {
        let pool = test_pool(2);
        assert!(pool.take().is_none());
    }

    #[tokio::test]
    async fn take_returns_oldest_first() {
        let pool = test_pool(2);
        let first = pending();
        let first_id = first.id;
        pool.push_for_test(first);
        pool.push_for_test(pending());

        assert_eq!(pool.take().map(|c| c.id), Some(first_id));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn full_pool_evicts_oldest_entry() {
        let pool = test_pool(1);
        let old = pending();
        let old_id = old.id;
        pool.push_for_test(old);

        let fresh = pending();
        let fresh_id = fresh.id;
        pool.push_for_test(fresh);

        assert_eq!(pool.len(), 1);
        let taken = pool.take().expect("one entry should remain");
        assert_eq!(taken.id, fresh_id);
        assert_ne!(taken.id, old_id);
    }

    #[tokio::test]
    async fn stale_entries_are_discarded_on_take() {
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(NeverReadyService),
            2,
            Duration::from_millis(0),
            Duration::from_secs(1),
        ));
        pool.push_for_test(pending());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(pool.take().is_none());
        assert!(pool.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_takes_never_share_a_connection() {
        let pool = test_pool(8);
        // Fill beyond what the takers will drain.
        let mut queue = pool.inner.lock().unwrap();
        for _ in 0..8 {
            queue.push_back(pending());
        }
        drop(queue);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.take().map(|c| c.id)
            }));
        }

        let mut seen = HashSet::new();
        let mut taken = 0;
        for handle in handles {
            if let Some(id) = handle.await.unwrap() {
                assert!(seen.insert(id), "connection {id} handed out twice");
                taken += 1;
            }
        }
        assert_eq!(taken, 8);
        assert!(pool.is_empty());
    }
}
