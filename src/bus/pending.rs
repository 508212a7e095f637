//! Pending-response table.
//!
//! Requests marked `requires_response` are tracked here until a message
//! whose `correlation_id` equals the request id passes through the bus, or
//! until the entry outlives the response TTL. Guarded by its own lock,
//! independent of the mailboxes.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::protocol::Message;

struct PendingEntry {
    request: Message,
    registered_at: DateTime<Utc>,
    waiter: Option<oneshot::Sender<Message>>,
}

#[derive(Default)]
pub struct PendingResponses {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request. Re-tracking an id keeps the original entry.
    pub fn track(&self, request: &Message) {
        self.track_at(request, Utc::now());
    }

    pub fn track_at(&self, request: &Message, at: DateTime<Utc>) {
        self.entries
            .lock()
            .entry(request.id.clone())
            .or_insert_with(|| PendingEntry {
                request: request.clone(),
                registered_at: at,
                waiter: None,
            });
    }

    /// Track a request and get a receiver for its reply.
    pub fn track_with_waiter(&self, request: &Message) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(request.id.clone())
            .or_insert_with(|| PendingEntry {
                request: request.clone(),
                registered_at: Utc::now(),
                waiter: None,
            });
        entry.waiter = Some(tx);
        rx
    }

    /// Resolve the request `correlation_id` with `response`.
    ///
    /// Returns the original request when it was pending.
    pub fn resolve(&self, correlation_id: &str, response: &Message) -> Option<Message> {
        let entry = self.entries.lock().remove(correlation_id)?;
        if let Some(waiter) = entry.waiter {
            // The waiter may have given up already.
            let _ = waiter.send(response.clone());
        }
        Some(entry.request)
    }

    pub fn remove(&self, request_id: &str) -> Option<Message> {
        self.entries.lock().remove(request_id).map(|e| e.request)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.lock().contains_key(request_id)
    }

    /// Drop entries older than `ttl`, returning the expired requests.
    pub fn purge_expired(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<Message> {
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now - e.registered_at > ttl)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .map(|e| e.request)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventType;
    use serde_json::json;

    fn request() -> Message {
        Message::new(EventType::Coordination, "engine", json!({}))
            .to("coder")
            .requiring_response()
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let pending = PendingResponses::new();
        let req = request();
        let rx = pending.track_with_waiter(&req);

        let reply = req.reply("coder", EventType::TaskResponse, json!({"ok": true}));
        let resolved = pending.resolve(&req.id, &reply).unwrap();
        assert_eq!(resolved.id, req.id);
        assert_eq!(rx.await.unwrap().id, reply.id);
        assert!(pending.is_empty());

        assert!(pending.resolve(&req.id, &reply).is_none());
    }

    #[test]
    fn test_purge_after_ttl() {
        let pending = PendingResponses::new();
        let old = request();
        let fresh = request();
        let now = Utc::now();
        pending.track_at(&old, now - Duration::seconds(3601));
        pending.track_at(&fresh, now - Duration::seconds(10));

        let expired = pending.purge_expired(now, Duration::seconds(3600));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old.id);
        assert!(pending.contains(&fresh.id));
        assert_eq!(pending.len(), 1);
    }
}
