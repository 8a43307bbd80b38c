use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

/// Position report for a waiting ticket: (position, running, total waiting).
pub type QueueUpdateFn<'a> = &'a (dyn Fn(&str, usize, usize, usize) + Send + Sync);

const WAIT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Ticket {
    id: u64,
    user_id: i64,
    link: String,
    #[allow(dead_code)]
    created_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    running: usize,
    waiters: VecDeque<Ticket>,
}

/// Global FIFO admission gate for free-user downloads. At most `capacity`
/// slots run concurrently; waiters are served in strict arrival order and
/// can be withdrawn by cancellation without disturbing the others.
pub struct DownloadQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    next_ticket: AtomicU64,
}

impl DownloadQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn running(&self) -> usize {
        self.state.lock().expect("queue mutex poisoned").running
    }

    pub fn waiting(&self) -> usize {
        self.state
            .lock()
            .expect("queue mutex poisoned")
            .waiters
            .len()
    }

    /// Suspends until a slot is granted. While waiting, `on_update` is
    /// invoked about once per second with the ticket's queue position, and
    /// `cancel` is re-checked so a withdrawal never blocks the line.
    pub async fn acquire(
        &self,
        user_id: i64,
        link: &str,
        on_update: QueueUpdateFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ticket_id = {
            let mut state = self.state.lock().expect("queue mutex poisoned");
            if state.running < self.capacity && state.waiters.is_empty() {
                state.running += 1;
                return Ok(());
            }
            let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
            state.waiters.push_back(Ticket {
                id,
                user_id,
                link: link.to_string(),
                created_at: Instant::now(),
            });
            debug!(event = "queue.wait", user_id, ticket = id, "queue.wait");
            id
        };

        loop {
            {
                let mut state = self.state.lock().expect("queue mutex poisoned");
                let Some(position) = state.waiters.iter().position(|t| t.id == ticket_id) else {
                    // Removed by cancel_user/reset while we slept.
                    return Err(Error::Cancelled);
                };
                if position == 0 && state.running < self.capacity {
                    state.waiters.pop_front();
                    state.running += 1;
                    debug!(event = "queue.grant", user_id, ticket = ticket_id, "queue.grant");
                    return Ok(());
                }
                on_update(link, position + 1, state.running, state.waiters.len());
            }

            if cancel.is_cancelled() {
                self.remove_ticket(ticket_id);
                return Err(Error::Cancelled);
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(WAIT_TICK) => {}
                _ = cancel.cancelled() => {
                    self.remove_ticket(ticket_id);
                    return Err(Error::Cancelled);
                }
            }
        }
    }

    fn remove_ticket(&self, ticket_id: u64) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.waiters.retain(|t| t.id != ticket_id);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Frees one running slot and wakes every waiter; releasing can make
    /// several waiters' predicates re-checkable at once after cancellations,
    /// so notify-one is not enough.
    pub fn release(&self) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.running = state.running.saturating_sub(1);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Removes all of a user's waiting tickets. Their suspended `acquire`
    /// calls observe the removal and resolve to `Cancelled`.
    pub fn cancel_user(&self, user_id: i64) -> usize {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        let before = state.waiters.len();
        state.waiters.retain(|t| t.user_id != user_id);
        let removed = before - state.waiters.len();
        drop(state);
        if removed > 0 {
            debug!(event = "queue.cancel_user", user_id, removed, "queue.cancel_user");
            self.notify.notify_waiters();
        }
        removed
    }

    /// Hard-clears all state; used at process startup so no stale waiter
    /// survives a restart.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.running = 0;
        state.waiters.clear();
        drop(state);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn no_update() -> impl Fn(&str, usize, usize, usize) + Send + Sync {
        |_, _, _, _| {}
    }

    #[tokio::test]
    async fn grants_immediately_under_capacity() {
        let queue = DownloadQueue::new(2);
        let cancel = CancellationToken::new();
        queue.acquire(1, "a", &no_update(), &cancel).await.unwrap();
        queue.acquire(2, "b", &no_update(), &cancel).await.unwrap();
        assert_eq!(queue.running(), 2);
        assert_eq!(queue.waiting(), 0);
    }

    #[tokio::test]
    async fn serves_waiters_fifo() {
        let queue = Arc::new(DownloadQueue::new(1));
        let cancel = CancellationToken::new();
        queue.acquire(0, "head", &no_update(), &cancel).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for user in 1..=3i64 {
            let queue = Arc::clone(&queue);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                queue
                    .acquire(user, "w", &|_, _, _, _| {}, &cancel)
                    .await
                    .unwrap();
                order.lock().unwrap().push(user);
                queue.release();
            }));
            // Deterministic arrival order.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        queue.release();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn running_never_exceeds_capacity() {
        let queue = Arc::new(DownloadQueue::new(2));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for user in 0..8i64 {
            let queue = Arc::clone(&queue);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                queue
                    .acquire(user, "x", &|_, _, _, _| {}, &cancel)
                    .await
                    .unwrap();
                peak.fetch_max(queue.running(), Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(10)).await;
                queue.release();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::Relaxed) <= 2);
        assert_eq!(queue.running(), 0);
    }

    #[tokio::test]
    async fn cancel_user_removes_exactly_their_ticket() {
        let queue = Arc::new(DownloadQueue::new(1));
        let cancel = CancellationToken::new();
        queue.acquire(0, "head", &no_update(), &cancel).await.unwrap();

        let q1 = Arc::clone(&queue);
        let waiter_1 = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            q1.acquire(1, "w1", &|_, _, _, _| {}, &cancel).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let q2 = Arc::clone(&queue);
        let waiter_2 = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            q2.acquire(2, "w2", &|_, _, _, _| {}, &cancel).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.waiting(), 2);

        assert_eq!(queue.cancel_user(1), 1);
        assert!(matches!(waiter_1.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(queue.waiting(), 1);

        // User 2 is unaffected and gets the slot on release.
        queue.release();
        waiter_2.await.unwrap().unwrap();
        assert_eq!(queue.running(), 1);
    }

    #[tokio::test]
    async fn waiting_acquire_observes_token_cancel() {
        let queue = Arc::new(DownloadQueue::new(1));
        let head = CancellationToken::new();
        queue.acquire(0, "head", &no_update(), &head).await.unwrap();

        let cancel = CancellationToken::new();
        let q = Arc::clone(&queue);
        let c = cancel.clone();
        let waiter = tokio::spawn(async move {
            q.acquire(1, "w", &|_, _, _, _| {}, &c).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(queue.waiting(), 0);
    }
}
