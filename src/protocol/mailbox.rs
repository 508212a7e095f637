//! Per-agent priority mailbox.
//!
//! Each agent owns one mailbox guarded by its own lock, so traffic to
//! unrelated agents never contends. Delivery order is strictly by priority,
//! FIFO within equal priority.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use super::message::Message;

/// Heap entry: higher priority first, then lower arrival sequence first.
#[derive(Debug)]
struct Queued {
    seq: u64,
    message: Message,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// An agent's inbound queue.
#[derive(Debug)]
pub struct Mailbox {
    agent_id: String,
    heap: Mutex<BinaryHeap<Queued>>,
    seq: AtomicU64,
    total_received: AtomicU64,
    notify: Notify,
}

impl Mailbox {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            total_received: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Enqueue a message and wake one waiting receiver.
    pub fn push(&self, message: Message) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::debug!(
            agent = %self.agent_id,
            message_id = %message.id,
            priority = %message.priority,
            "Queued message"
        );
        self.heap.lock().push(Queued { seq, message });
        self.total_received.fetch_add(1, AtomicOrdering::Relaxed);
        self.notify.notify_one();
    }

    /// Pop up to `limit` messages, highest priority first.
    pub fn pop_batch(&self, limit: usize) -> Vec<Message> {
        let mut heap = self.heap.lock();
        let take = limit.min(heap.len());
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(entry) = heap.pop() {
                out.push(entry.message);
            }
        }
        out
    }

    /// Wait until at least one message is available or `timeout` elapses,
    /// then pop up to `limit` messages.
    pub async fn recv(&self, limit: usize, timeout: Duration) -> Vec<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent push is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.pop_batch(limit);
            if !batch.is_empty() {
                return batch;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Vec::new();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    pub fn stats(&self) -> MailboxStats {
        MailboxStats {
            agent_id: self.agent_id.clone(),
            queued: self.len(),
            total_received: self.total_received.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Mailbox statistics.
#[derive(Debug, Clone, Serialize)]
pub struct MailboxStats {
    pub agent_id: String,
    pub queued: usize,
    pub total_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EventType, Priority};
    use serde_json::json;

    fn msg(priority: i64, n: u32) -> Message {
        Message::new(EventType::TaskRequest, "engine", json!({ "n": n }))
            .to("coder")
            .with_priority(Priority::new(priority))
    }

    #[test]
    fn test_priority_before_arrival() {
        let mailbox = Mailbox::new("coder");
        for n in 0..5 {
            mailbox.push(msg(3, n));
        }
        mailbox.push(msg(9, 99));

        let first = mailbox.pop_batch(1);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].priority.value(), 9);
        assert_eq!(mailbox.len(), 5);
    }

    #[test]
    fn test_higher_priority_first_in_either_order() {
        let mailbox = Mailbox::new("coder");
        mailbox.push(msg(9, 1));
        mailbox.push(msg(3, 2));
        let first = mailbox.pop_batch(1);
        assert_eq!(first[0].payload["n"], 1);

        mailbox.push(msg(3, 3));
        mailbox.push(msg(9, 4));
        let order: Vec<u64> = mailbox
            .pop_batch(10)
            .iter()
            .map(|m| m.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![4, 2, 3]);
    }

    #[test]
    fn test_fifo_within_priority() {
        let mailbox = Mailbox::new("coder");
        mailbox.push(msg(9, 1));
        mailbox.push(msg(3, 2));
        mailbox.push(msg(3, 3));
        mailbox.push(msg(3, 4));

        let order: Vec<u64> = mailbox
            .pop_batch(10)
            .iter()
            .map(|m| m.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
        assert!(mailbox.is_empty());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let mailbox = std::sync::Arc::new(Mailbox::new("coder"));
        let rx = mailbox.clone();
        let handle = tokio::spawn(async move { rx.recv(4, Duration::from_secs(5)).await });

        tokio::task::yield_now().await;
        mailbox.push(msg(5, 7));

        let got = handle.await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload["n"], 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_times_out_empty() {
        let mailbox = Mailbox::new("coder");
        let got = mailbox.recv(1, Duration::from_millis(200)).await;
        assert!(got.is_empty());
        assert_eq!(mailbox.stats().total_received, 0);
    }
}
