use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

const WAIT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct WorkState {
    running: usize,
    // (priority, seq): premium=0 sorts before free=1, FIFO within a tier.
    waiting: BTreeSet<(u8, u64)>,
}

/// Internal execution gate for borrowed-session transfers: a priority queue
/// where premium requests never wait behind a backlog of free requests, and
/// free requests among themselves stay fair via the monotonic sequence.
pub struct WorkQueue {
    capacity: usize,
    state: Mutex<WorkState>,
    notify: Notify,
    seq: AtomicU64,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(WorkState::default()),
            notify: Notify::new(),
            seq: AtomicU64::new(1),
        }
    }

    pub fn running(&self) -> usize {
        self.state.lock().expect("work queue mutex poisoned").running
    }

    pub async fn acquire(&self, priority: u8, cancel: &CancellationToken) -> Result<()> {
        let key = {
            let mut state = self.state.lock().expect("work queue mutex poisoned");
            if state.running < self.capacity && state.waiting.is_empty() {
                state.running += 1;
                return Ok(());
            }
            let key = (priority, self.seq.fetch_add(1, Ordering::Relaxed));
            state.waiting.insert(key);
            key
        };

        loop {
            {
                let mut state = self.state.lock().expect("work queue mutex poisoned");
                if state.waiting.first() == Some(&key) && state.running < self.capacity {
                    state.waiting.remove(&key);
                    state.running += 1;
                    return Ok(());
                }
            }

            if cancel.is_cancelled() {
                self.remove(key);
                return Err(Error::Cancelled);
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(WAIT_TICK) => {}
                _ = cancel.cancelled() => {
                    self.remove(key);
                    return Err(Error::Cancelled);
                }
            }
        }
    }

    pub fn release(&self) {
        let mut state = self.state.lock().expect("work queue mutex poisoned");
        state.running = state.running.saturating_sub(1);
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().expect("work queue mutex poisoned");
        state.running = 0;
        state.waiting.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    fn remove(&self, key: (u8, u64)) {
        let mut state = self.state.lock().expect("work queue mutex poisoned");
        state.waiting.remove(&key);
        drop(state);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn premium_overtakes_queued_free_work() {
        let wq = Arc::new(WorkQueue::new(1));
        let cancel = CancellationToken::new();
        wq.acquire(1, &cancel).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));

        // Two free waiters enqueue first, then one premium.
        let mut handles = Vec::new();
        for (tag, priority) in [("free_a", 1u8), ("free_b", 1), ("prem", 0)] {
            let wq = Arc::clone(&wq);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                wq.acquire(priority, &cancel).await.unwrap();
                order.lock().unwrap().push(tag);
                wq.release();
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        wq.release();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["prem", "free_a", "free_b"]);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_the_line() {
        let wq = Arc::new(WorkQueue::new(1));
        let head = CancellationToken::new();
        wq.acquire(1, &head).await.unwrap();

        let cancel = CancellationToken::new();
        let wq2 = Arc::clone(&wq);
        let c = cancel.clone();
        let waiter = tokio::spawn(async move { wq2.acquire(1, &c).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));

        wq.release();
        assert_eq!(wq.running(), 0);
    }
}
