//! The bounded ingress queue. `tokio::sync::mpsc` blocks a full sender
//! rather than dropping, so the drop policy is implemented here at the push
//! site instead, guaranteeing the receiver never blocks the socket loop.

use crate::config::DropPolicy;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

pub struct QueueItem {
    pub bytes: Vec<u8>,
    pub src_ip: Option<String>,
}

pub struct IngressQueue {
    capacity: usize,
    policy: DropPolicy,
    inner: Mutex<VecDeque<QueueItem>>,
    notify: Notify,
}

impl IngressQueue {
    pub fn new(capacity: usize, policy: DropPolicy) -> Self {
        IngressQueue {
            capacity,
            policy,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    /// Never blocks. Returns `true` if an item was dropped to make room.
    pub fn push(&self, item: QueueItem) -> bool {
        let mut dropped = false;
        {
            let mut q = self.inner.lock().expect("queue mutex poisoned");
            if q.len() >= self.capacity {
                match self.policy {
                    DropPolicy::DropOldest => {
                        q.pop_front();
                        q.push_back(item);
                    }
                    DropPolicy::DropNew => {
                        // keep the N oldest; the new item is discarded
                    }
                }
                dropped = true;
            } else {
                q.push_back(item);
            }
        }
        self.notify.notify_one();
        dropped
    }

    fn try_pop(&self) -> Option<QueueItem> {
        self.inner.lock().expect("queue mutex poisoned").pop_front()
    }

    pub async fn pop(&self) -> QueueItem {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(tag: u8) -> QueueItem {
        QueueItem {
            bytes: vec![tag],
            src_ip: None,
        }
    }

    #[test]
    fn drop_oldest_keeps_the_n_newest() {
        let q = IngressQueue::new(4, DropPolicy::DropOldest);
        let mut drops = 0;
        for i in 0..6u8 {
            if q.push(item(i)) {
                drops += 1;
            }
        }
        assert_eq!(drops, 2);
        let remaining: Vec<u8> = (0..4).map(|_| q.try_pop().unwrap().bytes[0]).collect();
        assert_eq!(remaining, vec![2, 3, 4, 5]);
    }

    #[test]
    fn drop_new_keeps_the_n_oldest() {
        let q = IngressQueue::new(4, DropPolicy::DropNew);
        let mut drops = 0;
        for i in 0..6u8 {
            if q.push(item(i)) {
                drops += 1;
            }
        }
        assert_eq!(drops, 2);
        let remaining: Vec<u8> = (0..4).map(|_| q.try_pop().unwrap().bytes[0]).collect();
        assert_eq!(remaining, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn pop_waits_for_a_push() {
        let q = std::sync::Arc::new(IngressQueue::new(4, DropPolicy::DropOldest));
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        q.push(item(42));
        let popped = handle.await.unwrap();
        assert_eq!(popped.bytes, vec![42]);
    }
}
