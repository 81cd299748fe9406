// Copyright (c) The fast-fstests Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The shared work queue.
//!
//! A FIFO of [`WorkItem`]s with a blocking pop. The queue tracks items in
//! flight separately from items queued: a worker that sees an empty queue
//! must keep waiting while another worker's item may still be re-enqueued,
//! and may only exit once every item has been finalized.

use crate::test_case::WorkItem;
use std::{
    collections::VecDeque,
    sync::Mutex,
};
use tokio::sync::Notify;

#[derive(Debug)]
struct QueueInner {
    deque: VecDeque<WorkItem>,
    /// Items not yet finalized (queued, running, or awaiting requeue).
    outstanding: usize,
    cancelled: bool,
}

/// The dispatcher's shared FIFO work queue.
#[derive(Debug)]
pub(crate) struct WorkQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl WorkQueue {
    pub(crate) fn new(items: Vec<WorkItem>) -> Self {
        let outstanding = items.len();
        Self {
            inner: Mutex::new(QueueInner {
                deque: items.into(),
                outstanding,
                cancelled: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Pops the next item in queue order, waiting while the queue is empty
    /// but items are still in flight. Returns `None` once every item has been
    /// finalized, or after cancellation.
    pub(crate) async fn pop(&self) -> Option<WorkItem> {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            // Arm the waiter before checking, so a push between the check and
            // the await still wakes us.
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if inner.cancelled {
                    return None;
                }
                if let Some(item) = inner.deque.pop_front() {
                    return Some(item);
                }
                if inner.outstanding == 0 {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Re-enqueues an item at the front, ahead of never-attempted items.
    pub(crate) fn requeue_front(&self, item: WorkItem) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.deque.push_front(item);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Re-enqueues an item at the back.
    pub(crate) fn requeue_back(&self, item: WorkItem) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.deque.push_back(item);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Marks one in-flight item finalized, waking idle workers so they can
    /// exit once the queue is drained.
    pub(crate) fn finalize_one(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.outstanding = inner.outstanding.saturating_sub(1);
        let done = inner.outstanding == 0;
        drop(inner);
        if done {
            self.notify.notify_waiters();
        }
    }

    /// Cancels the queue, draining and returning items that were never
    /// dispatched. Subsequent pops return `None`.
    pub(crate) fn cancel(&self) -> Vec<WorkItem> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.cancelled = true;
        let drained: Vec<WorkItem> = inner.deque.drain(..).collect();
        inner.outstanding = inner.outstanding.saturating_sub(drained.len());
        drop(inner);
        self.notify.notify_waiters();
        drained
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.inner.lock().expect("queue lock poisoned").cancelled
    }

    /// Items not yet finalized.
    pub(crate) fn outstanding(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_case::{TestCase, TestId, TestStatus, Verdict};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug)]
    struct NamedTest(TestId);

    impl TestCase for NamedTest {
        fn id(&self) -> &TestId {
            &self.0
        }

        fn iteration(&self) -> u32 {
            1
        }

        fn command(&self) -> String {
            String::new()
        }

        fn classify(&self, _exit_code: Option<i32>, _stdout: &[u8], _stderr: &[u8]) -> Verdict {
            Verdict::new(TestStatus::Passed)
        }
    }

    fn item(name: &str) -> WorkItem {
        WorkItem::new(Arc::new(NamedTest(TestId::new(name))))
    }

    fn queue(names: &[&str]) -> WorkQueue {
        WorkQueue::new(names.iter().map(|name| item(name)).collect())
    }

    #[tokio::test]
    async fn pops_in_fifo_order() {
        let queue = queue(&["a", "b", "c"]);
        for expected in ["a", "b", "c"] {
            let item = queue.pop().await.unwrap();
            assert_eq!(item.test_id().as_str(), expected);
            queue.finalize_one();
        }
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn front_requeue_takes_priority() {
        let queue = queue(&["a", "b"]);
        let first = queue.pop().await.unwrap();
        assert_eq!(first.test_id().as_str(), "a");
        queue.requeue_front(first);
        assert_eq!(queue.pop().await.unwrap().test_id().as_str(), "a");
    }

    #[tokio::test]
    async fn empty_queue_with_an_item_in_flight_keeps_waiting() {
        let queue = Arc::new(queue(&["a"]));
        let in_flight = queue.pop().await.unwrap();

        // A second worker must not exit: "a" may yet be re-enqueued.
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        queue.requeue_back(in_flight);
        let item = waiter.await.unwrap().unwrap();
        assert_eq!(item.test_id().as_str(), "a");

        queue.finalize_one();
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn finalizing_the_last_item_releases_waiters() {
        let queue = Arc::new(queue(&["a"]));
        let in_flight = queue.pop().await.unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(in_flight);
        queue.finalize_one();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_drains_pending_items() {
        let queue = queue(&["a", "b", "c"]);
        let _running = queue.pop().await.unwrap();
        let drained = queue.cancel();
        assert_eq!(
            drained
                .iter()
                .map(|item| item.test_id().as_str())
                .collect::<Vec<_>>(),
            ["b", "c"]
        );
        assert!(queue.is_cancelled());
        assert!(queue.pop().await.is_none());
        // The in-flight item is still accounted for.
        assert_eq!(queue.outstanding(), 1);
    }
}
