use std::{collections::VecDeque, future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::oneshot,
    time::{timeout_at, Instant},
};

/// An item the queue can hand out. Eligibility is re-checked lazily, only
/// when the item reaches the front of the queue.
pub trait Matchable {
    fn accepts_work(&self) -> bool;
}

impl<T: Matchable + ?Sized> Matchable for Arc<T> {
    fn accepts_work(&self) -> bool {
        (**self).accepts_work()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsumeError {
    #[error("Timeout error: no item available after {0:?}")]
    Timeout(Duration),

    #[error("matching queue was dropped")]
    Closed,
}

struct PendingRequest<T> {
    id: u64,
    tx: oneshot::Sender<T>,
}

struct Queues<T> {
    next_request_id: u64,
    items: VecDeque<T>,
    requests: VecDeque<PendingRequest<T>>,
}

impl<T: Matchable> Queues<T> {
    fn evict_stale(&mut self) {
        while self.items.front().is_some_and(|item| !item.accepts_work()) {
            self.items.pop_front();
        }
    }

    /// Pairs the oldest request with the oldest eligible item until one side
    /// runs out. Stale items are only discarded when they are about to be
    /// matched.
    fn fulfill(&mut self) {
        self.evict_stale();
        while !self.items.is_empty() && !self.requests.is_empty() {
            let (Some(request), Some(item)) = (self.requests.pop_front(), self.items.pop_front())
            else {
                return;
            };
            if let Err(item) = request.tx.send(item) {
                // The consumer went away, the item goes to the next request.
                self.items.push_front(item);
            }
            if !self.requests.is_empty() {
                self.evict_stale();
            }
        }
    }

    fn remove_request(&mut self, id: u64) -> bool {
        match self.requests.iter().position(|r| r.id == id) {
            Some(pos) => {
                self.requests.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Receiving side of one `consume` call. Dropping it before the item was
/// taken withdraws the request, or returns an already matched item to the
/// front of the queue.
struct PendingConsume<T: Matchable> {
    id: u64,
    rx: oneshot::Receiver<T>,
    queues: Arc<Mutex<Queues<T>>>,
    settled: bool,
}

impl<T: Matchable> Drop for PendingConsume<T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut queues = self.queues.lock();
        if queues.remove_request(self.id) {
            return;
        }
        self.rx.close();
        if let Ok(item) = self.rx.try_recv() {
            queues.items.push_front(item);
            queues.fulfill();
        }
    }
}

/// FIFO broker pairing available items with requests for one.
pub struct MatchingQueue<T> {
    queues: Arc<Mutex<Queues<T>>>,
}

impl<T> MatchingQueue<T>
where
    T: Matchable + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(Queues {
                next_request_id: 0,
                items: VecDeque::new(),
                requests: VecDeque::new(),
            })),
        }
    }

    pub fn add(&self, item: T) {
        let mut queues = self.queues.lock();
        queues.items.push_back(item);
        queues.fulfill();
    }

    /// Registers a request immediately and returns a future resolving to
    /// the matched item. A request that times out is removed from the queue
    /// and never resolves afterwards.
    pub fn consume(&self, timeout: Duration) -> impl Future<Output = Result<T, ConsumeError>> + Send + 'static {
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut queues = self.queues.lock();
            let id = queues.next_request_id;
            queues.next_request_id += 1;
            queues.requests.push_back(PendingRequest { id, tx });
            queues.fulfill();
            id
        };

        let mut pending = PendingConsume {
            id,
            rx,
            queues: self.queues.clone(),
            settled: false,
        };
        async move {
            let result = match timeout_at(deadline, &mut pending.rx).await {
                Ok(Ok(item)) => Ok(item),
                Ok(Err(_)) => Err(ConsumeError::Closed),
                Err(_) => {
                    let removed = pending.queues.lock().remove_request(pending.id);
                    if removed {
                        Err(ConsumeError::Timeout(timeout))
                    } else {
                        // Matched right as the deadline passed.
                        pending.rx.try_recv().map_err(|_| ConsumeError::Closed)
                    }
                }
            };
            pending.settled = true;
            result
        }
    }

    pub fn items_len(&self) -> usize {
        self.queues.lock().items.len()
    }

    pub fn requests_len(&self) -> usize {
        self.queues.lock().requests.len()
    }
}

impl<T> Default for MatchingQueue<T>
where
    T: Matchable + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures::future::join_all;
    use tokio::time;

    use super::*;

    #[derive(Clone)]
    struct Item {
        id: u32,
        accepts: Arc<AtomicBool>,
    }

    impl Item {
        fn new(id: u32) -> Self {
            Self {
                id,
                accepts: Arc::new(AtomicBool::new(true)),
            }
        }

        fn switch_off(&self) {
            self.accepts.store(false, Ordering::SeqCst);
        }
    }

    impl Matchable for Item {
        fn accepts_work(&self) -> bool {
            self.accepts.load(Ordering::SeqCst)
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(20);

    #[tokio::test]
    async fn test_add_and_consume() {
        let queue = MatchingQueue::new();

        queue.add(Item::new(0));
        assert_eq!(queue.items_len(), 1);
        assert_eq!(queue.consume(TIMEOUT).await.unwrap().id, 0);
        assert_eq!(queue.items_len(), 0);
        assert_eq!(queue.requests_len(), 0);

        let pending = queue.consume(TIMEOUT);
        assert_eq!(queue.requests_len(), 1);
        queue.add(Item::new(1));
        assert_eq!(pending.await.unwrap().id, 1);
        assert_eq!(queue.items_len(), 0);
        assert_eq!(queue.requests_len(), 0);
    }

    #[tokio::test]
    async fn test_consume_timeout_removes_request() {
        time::pause();
        let queue = MatchingQueue::<Item>::new();

        let pending = queue.consume(TIMEOUT);
        assert_eq!(queue.requests_len(), 1);

        assert_eq!(pending.await.err(), Some(ConsumeError::Timeout(TIMEOUT)));
        assert_eq!(queue.requests_len(), 0);

        // A late item stays available instead of resolving the dead request.
        queue.add(Item::new(0));
        assert_eq!(queue.items_len(), 1);
    }

    #[tokio::test]
    async fn test_deadline_starts_at_request_time() {
        time::pause();
        let queue = MatchingQueue::<Item>::new();

        let pending = queue.consume(Duration::from_secs(5));
        time::advance(Duration::from_secs(6)).await;
        assert!(matches!(pending.await, Err(ConsumeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_stale_front_item_is_skipped() {
        let queue = MatchingQueue::new();
        let items: Vec<Item> = (0..4).map(Item::new).collect();
        for item in &items {
            queue.add(item.clone());
        }
        items[0].switch_off();
        assert_eq!(queue.items_len(), 4);

        assert_eq!(queue.consume(TIMEOUT).await.unwrap().id, 1);
        assert_eq!(queue.consume(TIMEOUT).await.unwrap().id, 2);
        assert_eq!(queue.consume(TIMEOUT).await.unwrap().id, 3);
        assert_eq!(queue.items_len(), 0);
        assert_eq!(queue.requests_len(), 0);
    }

    #[tokio::test]
    async fn test_eligibility_checked_only_at_front() {
        let queue = MatchingQueue::new();
        let items: Vec<Item> = (0..4).map(Item::new).collect();
        for item in &items {
            queue.add(item.clone());
        }
        items[0].switch_off();
        items[1].switch_off();
        items[3].switch_off();

        assert_eq!(queue.consume(TIMEOUT).await.unwrap().id, 2);
        // Item 3 is stale but has not reached the front yet.
        assert_eq!(queue.items_len(), 1);

        let pending = queue.consume(TIMEOUT);
        assert_eq!(queue.items_len(), 0);
        assert_eq!(queue.requests_len(), 1);
        queue.add(Item::new(4));
        assert_eq!(pending.await.unwrap().id, 4);
    }

    #[tokio::test]
    async fn test_requests_resolve_in_arrival_order() {
        let queue = MatchingQueue::new();

        let pending: Vec<_> = (0..3).map(|_| queue.consume(TIMEOUT)).collect();
        assert_eq!(queue.requests_len(), 3);
        for id in 0..4 {
            queue.add(Item::new(id));
        }

        let ids: Vec<u32> = join_all(pending)
            .await
            .into_iter()
            .map(|item| item.unwrap().id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(queue.items_len(), 1);
    }

    #[tokio::test]
    async fn test_item_of_dropped_request_is_kept() {
        let queue = MatchingQueue::new();

        let abandoned = queue.consume(TIMEOUT);
        let waiting = queue.consume(TIMEOUT);
        drop(abandoned);

        queue.add(Item::new(7));
        assert_eq!(waiting.await.unwrap().id, 7);
        assert_eq!(queue.requests_len(), 0);
    }

    #[tokio::test]
    async fn test_matched_item_returns_when_request_dropped() {
        let queue = MatchingQueue::new();

        let abandoned = queue.consume(TIMEOUT);
        queue.add(Item::new(7));
        assert_eq!(queue.items_len(), 0);
        drop(abandoned);
        assert_eq!(queue.items_len(), 1);
        assert_eq!(queue.requests_len(), 0);

        assert_eq!(queue.consume(TIMEOUT).await.unwrap().id, 7);
    }

    #[tokio::test]
    async fn test_matched_item_goes_to_next_waiting_request() {
        let queue = MatchingQueue::new();

        let abandoned = queue.consume(TIMEOUT);
        let waiting = queue.consume(TIMEOUT);
        queue.add(Item::new(3));
        drop(abandoned);

        assert_eq!(waiting.await.unwrap().id, 3);
        assert_eq!(queue.items_len(), 0);
    }

    #[tokio::test]
    async fn test_interleaved_items_never_handed_twice() {
        let queue = MatchingQueue::new();
        let mut pending = Vec::new();
        for id in 0..10 {
            if id % 3 == 0 {
                queue.add(Item::new(id));
            }
            pending.push(queue.consume(TIMEOUT));
        }
        for id in 10..20 {
            queue.add(Item::new(id));
        }

        let ids: Vec<u32> = join_all(pending)
            .await
            .into_iter()
            .map(|item| item.unwrap().id)
            .collect();
        assert_eq!(ids, vec![0, 3, 6, 9, 10, 11, 12, 13, 14, 15]);
        assert_eq!(queue.items_len(), 4);
    }
}
