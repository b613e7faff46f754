use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::ExecutionError;

const QUEUE_CLOSED: &str = "runspace handle queue";

/// Single-slot async hand-off queue.
///
/// At most one item is buffered. Dequeuers are served strictly in arrival order; an item
/// released while dequeuers are waiting goes straight to the oldest one without ever
/// touching the slot.
pub struct AsyncWaitQueue<T> {
    state: Mutex<QueueState<T>>,
    next_waiter_id: AtomicU64,
    space_available: Notify,
}

struct QueueState<T> {
    item: Option<T>,
    waiters: VecDeque<Waiter<T>>,
    closed: bool,
}

struct Waiter<T> {
    id: u64,
    tx: oneshot::Sender<T>,
}

impl<T> QueueState<T> {
    /// Hands `item` to the oldest live waiter, or parks it in the slot.
    fn offer(&mut self, mut item: T) -> Result<(), T> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(item) {
                Ok(()) => {
                    trace!(target: "queue", waiter = waiter.id, "item handed to waiter");
                    return Ok(());
                }
                // The waiter gave up; try the next one.
                Err(back) => item = back,
            }
        }

        if self.item.is_some() {
            return Err(item);
        }
        self.item = Some(item);
        Ok(())
    }
}

impl<T> Default for AsyncWaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AsyncWaitQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                item: None,
                waiters: VecDeque::new(),
                closed: false,
            }),
            next_waiter_id: AtomicU64::new(0),
            space_available: Notify::new(),
        }
    }

    pub fn with_item(item: T) -> Self {
        let queue = Self::new();
        queue.state.lock().item = Some(item);
        queue
    }

    /// Enqueues without waiting; gives the item back if the slot is occupied.
    pub fn try_enqueue(&self, item: T) -> Result<(), T> {
        self.state.lock().offer(item)
    }

    /// Enqueues, waiting for the slot to drain if it is occupied.
    pub async fn enqueue(&self, mut item: T) {
        loop {
            let notified = self.space_available.notified();
            match self.try_enqueue(item) {
                Ok(()) => return,
                Err(back) => item = back,
            }
            notified.await;
        }
    }

    pub fn try_dequeue(&self) -> Option<T> {
        let item = {
            let mut state = self.state.lock();
            if state.closed { None } else { state.item.take() }
        };
        if item.is_some() {
            self.space_available.notify_waiters();
        }
        item
    }

    /// Waits for an item. Cancelling `cancel` fails only this waiter and leaves the queue
    /// as it was.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<T, ExecutionError> {
        let pending = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ExecutionError::ChannelClosed(QUEUE_CLOSED));
            }
            if let Some(item) = state.item.take() {
                drop(state);
                self.space_available.notify_waiters();
                return Ok(item);
            }

            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            let (tx, rx) = oneshot::channel();
            let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            state.waiters.push_back(Waiter { id, tx });
            trace!(target: "queue", waiter = id, position = state.waiters.len(), "waiting for item");

            PendingDequeue {
                queue: self,
                id,
                rx,
                completed: false,
            }
        };

        pending.wait(cancel).await
    }

    /// Stops serving dequeuers. Every waiter fails with `ChannelClosed` and later dequeues
    /// fail immediately. Items can still be put back, so outstanding leases release cleanly.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let failed = state.waiters.len();
        // Dropping the senders fails the waiting receivers.
        state.waiters.clear();
        trace!(target: "queue", failed, "queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn has_item(&self) -> bool {
        self.state.lock().item.is_some()
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// A registered dequeuer. Dropping it before it received an item unregisters it, and
/// passes on an item that raced in just before the drop.
struct PendingDequeue<'a, T> {
    queue: &'a AsyncWaitQueue<T>,
    id: u64,
    rx: oneshot::Receiver<T>,
    completed: bool,
}

impl<T> PendingDequeue<'_, T> {
    async fn wait(mut self, cancel: &CancellationToken) -> Result<T, ExecutionError> {
        tokio::select! {
            biased;
            received = &mut self.rx => {
                self.completed = true;
                received.map_err(|_| ExecutionError::ChannelClosed(QUEUE_CLOSED))
            }
            () = cancel.cancelled() => {
                trace!(target: "queue", waiter = self.id, "dequeue cancelled");
                Err(ExecutionError::Cancelled)
            }
        }
    }
}

impl<T> Drop for PendingDequeue<'_, T> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        let mut state = self.queue.state.lock();
        state.waiters.retain(|waiter| waiter.id != self.id);
        self.rx.close();
        if let Ok(item) = self.rx.try_recv() {
            if state.offer(item).is_err() {
                error!(target: "queue", waiter = self.id, "dropped an item while unregistering a cancelled waiter");
                debug_assert!(false, "single-slot queue held two items");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[tokio::test]
    async fn dequeue_takes_the_buffered_item() {
        let queue = AsyncWaitQueue::with_item(7);
        let token = CancellationToken::new();
        assert_eq!(queue.dequeue(&token).await.unwrap(), 7);
        assert!(!queue.has_item());
    }

    #[tokio::test]
    async fn second_enqueue_is_rejected_while_full() {
        let queue = AsyncWaitQueue::new();
        assert!(queue.try_enqueue(1).is_ok());
        assert_eq!(queue.try_enqueue(2), Err(2));
    }

    #[tokio::test]
    async fn blocked_enqueue_completes_after_dequeue() {
        let queue = Arc::new(AsyncWaitQueue::with_item(1));
        let enqueuer = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.enqueue(2).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!enqueuer.is_finished());

        assert_eq!(queue.try_dequeue(), Some(1));
        tokio::time::timeout(Duration::from_secs(1), enqueuer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.try_dequeue(), Some(2));
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_queue_unchanged() {
        let queue = Arc::new(AsyncWaitQueue::<u32>::new());
        let token = CancellationToken::new();

        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            let token = token.clone();
            async move { queue.dequeue(&token).await }
        });

        while queue.waiter_count() == 0 {
            tokio::task::yield_now().await;
        }
        token.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ExecutionError::Cancelled)));
        assert_eq!(queue.waiter_count(), 0);

        queue.try_enqueue(5).unwrap();
        assert!(queue.has_item());
    }

    #[tokio::test]
    async fn already_cancelled_token_fails_fast() {
        let queue = AsyncWaitQueue::<u32>::new();
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            queue.dequeue(&token).await,
            Err(ExecutionError::Cancelled)
        ));
        assert_eq!(queue.waiter_count(), 0);
    }

    #[tokio::test]
    async fn closing_fails_waiters_and_keeps_returned_items_out_of_reach() {
        let queue = Arc::new(AsyncWaitQueue::<u32>::new());
        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.dequeue(&CancellationToken::new()).await }
        });
        while queue.waiter_count() == 0 {
            tokio::task::yield_now().await;
        }

        queue.close();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(ExecutionError::ChannelClosed(_))
        ));

        queue.try_enqueue(3).unwrap();
        assert!(queue.has_item());
        assert_eq!(queue.try_dequeue(), None);
        assert!(matches!(
            queue.dequeue(&CancellationToken::new()).await,
            Err(ExecutionError::ChannelClosed(_))
        ));
    }
}
