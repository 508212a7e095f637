//! Prioritized message bus.
//!
//! Direct sends go to the target's priority mailbox, or straight to its live
//! connection when the priority is above the immediate threshold. Transport
//! failures are retried with exponential backoff and then dead-lettered
//! exactly once. Sends to unregistered ids fail synchronously and never
//! touch the dead-letter store.

pub mod dead_letter;
pub mod pending;
pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BusConfig;
use crate::error::{DeliveryError, DeliveryErrorKind, Error, Result};
use crate::events::{BusEvent, EventHub};
use crate::protocol::{generate_id, EventType, Mailbox, Message, Priority};
use crate::registry::AgentRegistry;

pub use dead_letter::{DeadLetter, DeadLetterStore, InMemoryDeadLetters, JsonlDeadLetters};
pub use pending::PendingResponses;
pub use transport::{Connection, TransportError};

/// What happened to a successfully accepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    /// Pushed over a live connection, or consumed as a tracked reply.
    Delivered,
    /// Sitting in a mailbox, or handed to the retry path.
    Queued,
}

#[derive(Debug, Default)]
struct BusStats {
    total: AtomicU64,
    delivered: AtomicU64,
    queued: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageStats {
    pub total_messages: u64,
    pub delivered: u64,
    pub queued: u64,
    pub failed_deliveries: u64,
    pub retries: u64,
    pub dead_lettered: u64,
}

/// State shared with background retry tasks.
#[derive(Clone)]
struct Delivery {
    connections: Arc<DashMap<String, Arc<dyn Connection>>>,
    dead_letters: Arc<dyn DeadLetterStore>,
    retrying: Arc<DashMap<String, u32>>,
    events: EventHub,
    stats: Arc<BusStats>,
    max_attempts: u32,
    base_delay: Duration,
}

impl Delivery {
    fn live_connection(&self, agent_id: &str) -> Option<Arc<dyn Connection>> {
        self.connections
            .get(agent_id)
            .map(|c| c.value().clone())
            .filter(|c| c.is_live())
    }

    async fn push_once(&self, agent_id: &str, message: &Message) -> std::result::Result<(), TransportError> {
        match self.live_connection(agent_id) {
            Some(conn) => conn.push(message).await,
            None => Err(TransportError::new("no live connection")),
        }
    }

    /// Delay before attempt `attempt` (2-based): base, 2*base, 4*base, ...
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(2))
    }

    /// Keep retrying after `failed` attempts, dead-lettering on exhaustion.
    async fn retry(self, agent_id: String, message: Message, mut failed: u32, mut reason: TransportError) -> bool {
        self.retrying.insert(message.id.clone(), failed);

        while failed < self.max_attempts {
            let attempt = failed + 1;
            tokio::time::sleep(self.backoff(attempt)).await;
            self.stats.retried.fetch_add(1, Ordering::Relaxed);

            match self.push_once(&agent_id, &message).await {
                Ok(()) => {
                    self.retrying.remove(&message.id);
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(message_id = %message.id, attempt, "Delivered on retry");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        message_id = %message.id,
                        agent = %agent_id,
                        attempt,
                        error = %e,
                        "Transient delivery failure"
                    );
                    failed = attempt;
                    reason = e;
                    self.retrying.insert(message.id.clone(), failed);
                }
            }
        }

        self.retrying.remove(&message.id);
        self.dead_letter(message, reason, failed).await;
        false
    }

    async fn dead_letter(&self, message: Message, reason: TransportError, attempts: u32) {
        let letter = DeadLetter::new(message.clone(), reason.to_string(), attempts);
        // Stores may do file I/O.
        let store = self.dead_letters.clone();
        let stored = tokio::task::spawn_blocking(move || store.insert(letter))
            .await
            .map_err(|e| Error::Other(format!("dead-letter task failed: {}", e)))
            .and_then(|inserted| inserted);
        match stored {
            Ok(true) => {
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    message_id = %message.id,
                    target = ?message.target_agent,
                    attempts,
                    "Message dead-lettered"
                );
                self.events.publish(BusEvent::DeliveryFailed {
                    message: message.clone(),
                    kind: DeliveryErrorKind::TransientTransportFailure,
                });
                self.events.publish(BusEvent::DeadLettered { message, attempts });
            }
            Ok(false) => {
                tracing::debug!(message_id = %message.id, "Message already dead-lettered");
            }
            Err(e) => {
                tracing::error!(message_id = %message.id, "Failed to store dead letter: {}", e);
            }
        }
    }
}

pub struct MessageBus {
    registry: Arc<AgentRegistry>,
    mailboxes: DashMap<String, Arc<Mailbox>>,
    pending: PendingResponses,
    delivery: Delivery,
    config: BusConfig,
}

impl MessageBus {
    pub fn new(
        registry: Arc<AgentRegistry>,
        dead_letters: Arc<dyn DeadLetterStore>,
        events: EventHub,
        config: BusConfig,
    ) -> Self {
        let delivery = Delivery {
            connections: Arc::new(DashMap::new()),
            dead_letters,
            retrying: Arc::new(DashMap::new()),
            events,
            stats: Arc::new(BusStats::default()),
            max_attempts: config.max_delivery_attempts.max(1),
            base_delay: config.retry_base_delay(),
        };
        Self {
            registry,
            mailboxes: DashMap::new(),
            pending: PendingResponses::new(),
            delivery,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventHub {
        &self.delivery.events
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterStore> {
        &self.delivery.dead_letters
    }

    pub fn pending(&self) -> &PendingResponses {
        &self.pending
    }

    /// Send one message.
    ///
    /// An absent `target_agent` fans the message out to subscribers of its
    /// event type. A message correlated with a tracked request resolves it;
    /// a reply addressed to no registered agent stops there.
    pub async fn send(&self, message: Message) -> Result<SendOutcome> {
        self.registry.record_heartbeat(&message.source_agent);

        if let Some(correlation_id) = message.correlation_id.as_deref() {
            if let Some(request) = self.pending.resolve(correlation_id, &message) {
                tracing::debug!(request_id = %request.id, response_id = %message.id, "Correlated response");
                self.delivery.events.publish(BusEvent::ResponseReceived {
                    request,
                    response: message.clone(),
                });
                let addressed_to_agent = message
                    .target_agent
                    .as_deref()
                    .is_some_and(|t| self.registry.contains(t));
                if !addressed_to_agent {
                    self.delivery.stats.total.fetch_add(1, Ordering::Relaxed);
                    self.delivery.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    return Ok(SendOutcome::Delivered);
                }
            }
        }

        if message.target_agent.is_none() {
            let recipients = self.registry.subscribers(&message.event_type);
            self.fan_out(message, &recipients).await;
            return Ok(SendOutcome::Queued);
        }

        self.deliver(message).await
    }

    /// Direct delivery of an addressed message.
    async fn deliver(&self, message: Message) -> Result<SendOutcome> {
        self.delivery.stats.total.fetch_add(1, Ordering::Relaxed);
        let Some(target) = message.target_agent.clone() else {
            return Err(Error::Transport("message has no target".to_string()));
        };

        if !self.registry.contains(&target) {
            self.delivery.stats.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(message_id = %message.id, %target, "Send to unknown agent");
            self.delivery.events.publish(BusEvent::DeliveryFailed {
                message: message.clone(),
                kind: DeliveryErrorKind::UnknownTarget,
            });
            return Err(DeliveryError::unknown_target(&message.id, target).into());
        }

        if message.requires_response {
            self.pending.track(&message);
        }

        if message.priority.value() > self.config.immediate_priority_threshold {
            if let Some(conn) = self.delivery.live_connection(&target) {
                match conn.push(&message).await {
                    Ok(()) => {
                        self.delivery.stats.delivered.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(message_id = %message.id, %target, "Pushed immediately");
                        return Ok(SendOutcome::Delivered);
                    }
                    Err(e) => {
                        tracing::warn!(
                            message_id = %message.id,
                            %target,
                            attempt = 1,
                            error = %e,
                            "Transient delivery failure"
                        );
                        self.spawn_retry(target, message, 1, e);
                        return Ok(SendOutcome::Queued);
                    }
                }
            }
        }

        self.enqueue(&target, message);
        Ok(SendOutcome::Queued)
    }

    /// Broadcast to every subscriber of `event_type` not in `exclude`.
    ///
    /// Returns the recipient ids.
    pub async fn broadcast(
        &self,
        source_agent: &str,
        event_type: EventType,
        payload: Value,
        exclude: &[String],
    ) -> Vec<String> {
        let recipients: Vec<String> = self
            .registry
            .subscribers(&event_type)
            .into_iter()
            .filter(|id| !exclude.contains(id))
            .collect();

        let base = Message::new(event_type, source_agent, payload)
            .with_priority(Priority::new(self.config.broadcast_priority as i64));
        self.fan_out(base, &recipients).await;
        recipients
    }

    /// Send one copy of `base` to each recipient. Every copy gets a fresh id
    /// and shares one correlation id. Returns the ids of accepted copies.
    pub async fn fan_out(&self, mut base: Message, recipients: &[String]) -> Vec<String> {
        if base.correlation_id.is_none() {
            base.correlation_id = Some(generate_id());
        }

        let mut sent = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let copy = base.fork_for(recipient);
            let id = copy.id.clone();
            match self.deliver(copy).await {
                Ok(_) => sent.push(id),
                Err(e) => tracing::debug!(agent = %recipient, "Skipping broadcast recipient: {}", e),
            }
        }
        sent
    }

    /// Pop up to `limit` messages for `agent_id`, highest priority first.
    pub fn receive(&self, agent_id: &str, limit: usize) -> Vec<Message> {
        self.registry.record_heartbeat(agent_id);
        match self.mailboxes.get(agent_id).map(|m| m.value().clone()) {
            Some(mailbox) => mailbox.pop_batch(limit),
            None => Vec::new(),
        }
    }

    /// Like [`receive`](Self::receive) but waits up to `timeout` for a message.
    pub async fn receive_wait(&self, agent_id: &str, limit: usize, timeout: Duration) -> Vec<Message> {
        if !self.registry.contains(agent_id) {
            return Vec::new();
        }
        self.registry.record_heartbeat(agent_id);
        self.mailbox(agent_id).recv(limit, timeout).await
    }

    /// Send a request and wait for its correlated reply.
    pub async fn request(&self, message: Message, timeout: Duration) -> Result<Message> {
        let message = message.requiring_response();
        let id = message.id.clone();
        let target = message.target_agent.clone();
        let rx = self.pending.track_with_waiter(&message);

        if let Err(e) = self.send(message).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) | Err(_) => {
                self.pending.remove(&id);
                Err(DeliveryError::response_timeout(id, target).into())
            }
        }
    }

    /// Purge tracked requests older than the response TTL.
    pub fn purge_expired_responses(&self, now: DateTime<Utc>) -> Vec<Message> {
        let expired = self.pending.purge_expired(now, self.config.response_ttl());
        for request in &expired {
            tracing::warn!(
                request_id = %request.id,
                target = ?request.target_agent,
                "Response never arrived, purging"
            );
            self.delivery.events.publish(BusEvent::ResponseExpired {
                request: request.clone(),
            });
        }
        expired
    }

    /// Push a queued message over the target's live connection, retrying
    /// inline. Used by transport pumps.
    pub async fn deliver_via_transport(&self, message: Message) -> Result<SendOutcome> {
        let target = message
            .target_agent
            .clone()
            .ok_or_else(|| Error::Transport("message has no target".to_string()))?;

        match self.delivery.push_once(&target, &message).await {
            Ok(()) => {
                self.delivery.stats.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(SendOutcome::Delivered)
            }
            Err(e) => {
                tracing::warn!(message_id = %message.id, %target, attempt = 1, error = %e, "Transient delivery failure");
                if self.delivery.clone().retry(target, message, 1, e).await {
                    Ok(SendOutcome::Delivered)
                } else {
                    Ok(SendOutcome::Queued)
                }
            }
        }
    }

    pub fn attach_connection(&self, agent_id: &str, connection: Arc<dyn Connection>) {
        tracing::info!(agent = %agent_id, connection = %connection.id(), "Attached live connection");
        let id = connection.id().to_string();
        if let Some(previous) = self
            .delivery
            .connections
            .insert(agent_id.to_string(), connection)
        {
            if previous.id() != id {
                previous.close();
            }
        }
    }

    /// Detach and close an agent's connection.
    pub fn detach_connection(&self, agent_id: &str) -> Option<Arc<dyn Connection>> {
        let (_, conn) = self.delivery.connections.remove(agent_id)?;
        conn.close();
        tracing::info!(agent = %agent_id, connection = %conn.id(), "Detached live connection");
        Some(conn)
    }

    /// Detach only if `connection_id` is still the agent's connection.
    pub fn detach_connection_if(&self, agent_id: &str, connection_id: &str) -> bool {
        let removed = self
            .delivery
            .connections
            .remove_if(agent_id, |_, c| c.id() == connection_id);
        if let Some((_, conn)) = &removed {
            conn.close();
        }
        removed.is_some()
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.delivery.live_connection(agent_id).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.delivery
            .connections
            .iter()
            .filter(|c| c.value().is_live())
            .count()
    }

    /// Drop an agent's mailbox and connection.
    pub fn remove_agent(&self, agent_id: &str) {
        self.mailboxes.remove(agent_id);
        self.detach_connection(agent_id);
    }

    pub fn mailbox(&self, agent_id: &str) -> Arc<Mailbox> {
        self.mailboxes
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mailbox::new(agent_id)))
            .clone()
    }

    pub fn queued_for(&self, agent_id: &str) -> usize {
        self.mailboxes.get(agent_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn queued_total(&self) -> usize {
        self.mailboxes.iter().map(|m| m.len()).sum()
    }

    pub fn retrying_count(&self) -> usize {
        self.delivery.retrying.len()
    }

    pub fn stats(&self) -> MessageStats {
        let s = &self.delivery.stats;
        MessageStats {
            total_messages: s.total.load(Ordering::Relaxed),
            delivered: s.delivered.load(Ordering::Relaxed),
            queued: s.queued.load(Ordering::Relaxed),
            failed_deliveries: s.failed.load(Ordering::Relaxed),
            retries: s.retried.load(Ordering::Relaxed),
            dead_lettered: s.dead_lettered.load(Ordering::Relaxed),
        }
    }

    fn enqueue(&self, target: &str, message: Message) {
        self.mailbox(target).push(message);
        self.delivery.stats.queued.fetch_add(1, Ordering::Relaxed);
    }

    fn spawn_retry(&self, target: String, message: Message, failed: u32, reason: TransportError) {
        let delivery = self.delivery.clone();
        delivery.retrying.insert(message.id.clone(), failed);
        tokio::spawn(delivery.retry(target, message, failed, reason));
    }
}

#[cfg(test)]
mod tests {
    use super::transport::testing::RecordingConnection;
    use super::*;
    use crate::registry::{AgentRegistration, CapabilityTaxonomy};
    use serde_json::json;

    fn setup() -> (Arc<AgentRegistry>, MessageBus) {
        let registry = Arc::new(AgentRegistry::new(CapabilityTaxonomy::new()));
        let bus = MessageBus::new(
            registry.clone(),
            Arc::new(InMemoryDeadLetters::new()),
            EventHub::default(),
            BusConfig::default(),
        );
        (registry, bus)
    }

    fn register(registry: &AgentRegistry, id: &str) {
        registry
            .register(AgentRegistration::new(id, &["backend"], 5))
            .unwrap();
    }

    fn task(target: &str, priority: i64) -> Message {
        Message::new(EventType::TaskRequest, "engine", json!({"p": priority}))
            .to(target)
            .with_priority(Priority::new(priority))
    }

    #[tokio::test]
    async fn test_priority_nine_received_first() {
        let (registry, bus) = setup();
        register(&registry, "A");

        for _ in 0..5 {
            assert_eq!(bus.send(task("A", 3)).await.unwrap(), SendOutcome::Queued);
        }
        bus.send(task("A", 9)).await.unwrap();

        let got = bus.receive("A", 1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].priority.value(), 9);
        assert_eq!(bus.queued_for("A"), 5);
    }

    #[tokio::test]
    async fn test_unknown_target_fails_without_dead_letter() {
        let (_registry, bus) = setup();
        let mut events = bus.events().subscribe();

        let err = bus.send(task("D", 9)).await.unwrap_err();
        match err {
            Error::Delivery(e) => assert_eq!(e.kind, DeliveryErrorKind::UnknownTarget),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(bus.dead_letters().is_empty());
        assert_eq!(bus.stats().failed_deliveries, 1);
        assert!(matches!(
            events.drain().as_slice(),
            [BusEvent::DeliveryFailed { kind: DeliveryErrorKind::UnknownTarget, .. }]
        ));
    }

    #[tokio::test]
    async fn test_high_priority_pushes_live_connection() {
        let (registry, bus) = setup();
        register(&registry, "A");
        let conn = Arc::new(RecordingConnection::new("c1", 0));
        bus.attach_connection("A", conn.clone());

        assert_eq!(bus.send(task("A", 8)).await.unwrap(), SendOutcome::Delivered);
        assert_eq!(bus.send(task("A", 5)).await.unwrap(), SendOutcome::Queued);
        assert_eq!(conn.pushed.lock().len(), 1);
        assert_eq!(bus.queued_for("A"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_after_three_attempts() {
        let (registry, bus) = setup();
        register(&registry, "A");
        let conn = Arc::new(RecordingConnection::new("c1", u32::MAX));
        bus.attach_connection("A", conn.clone());

        let message = task("A", 9);
        let id = message.id.clone();
        assert_eq!(bus.send(message).await.unwrap(), SendOutcome::Queued);
        assert_eq!(bus.retrying_count(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(conn.attempts(), 3);
        assert_eq!(bus.dead_letters().len(), 1);
        assert!(bus.dead_letters().contains(&id));
        assert_eq!(bus.retrying_count(), 0);
        assert_eq!(bus.queued_for("A"), 0);
        assert_eq!(bus.stats().dead_lettered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_transient_failure() {
        let (registry, bus) = setup();
        register(&registry, "A");
        let conn = Arc::new(RecordingConnection::new("c1", 1));
        bus.attach_connection("A", conn.clone());

        bus.send(task("A", 9)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(conn.attempts(), 2);
        assert_eq!(conn.pushed.lock().len(), 1);
        assert!(bus.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_fresh_ids_shared_correlation() {
        let (registry, bus) = setup();
        for id in ["a", "b", "c"] {
            register(&registry, id);
        }

        let recipients = bus
            .broadcast("engine", EventType::StatusUpdate, json!({"x": 1}), &["c".to_string()])
            .await;
        assert_eq!(recipients, vec!["a", "b"]);

        let a = bus.receive("a", 10);
        let b = bus.receive("b", 10);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_ne!(a[0].id, b[0].id);
        assert_eq!(a[0].correlation_id, b[0].correlation_id);
        assert_eq!(a[0].priority, Priority::BROADCAST);
        assert_eq!(bus.queued_for("c"), 0);
    }

    #[tokio::test]
    async fn test_request_resolves_on_reply() {
        let (registry, bus) = setup();
        register(&registry, "A");
        let bus = Arc::new(bus);

        let responder = bus.clone();
        tokio::spawn(async move {
            let inbox = responder.receive_wait("A", 1, Duration::from_secs(5)).await;
            let reply = inbox[0].reply("A", EventType::TaskResponse, json!({"done": true}));
            responder.send(reply).await.unwrap();
        });

        let reply = bus
            .request(task("A", 5), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply.payload["done"], true);
        assert!(bus.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let (registry, bus) = setup();
        register(&registry, "A");

        let err = bus
            .request(task("A", 5), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "response_timeout");
        assert!(bus.pending().is_empty());
    }

    #[tokio::test]
    async fn test_expired_responses_purged() {
        let (registry, bus) = setup();
        register(&registry, "A");
        bus.send(task("A", 5).requiring_response()).await.unwrap();
        assert_eq!(bus.pending().len(), 1);

        let later = Utc::now() + chrono::Duration::seconds(3601);
        let expired = bus.purge_expired_responses(later);
        assert_eq!(expired.len(), 1);
        assert!(bus.pending().is_empty());
    }

    #[tokio::test]
    async fn test_remove_agent_closes_connection() {
        let (registry, bus) = setup();
        register(&registry, "A");
        let conn = Arc::new(RecordingConnection::new("c1", 0));
        bus.attach_connection("A", conn.clone());
        bus.send(task("A", 1)).await.unwrap();

        bus.remove_agent("A");
        assert!(!conn.is_live());
        assert_eq!(bus.queued_total(), 0);
        assert_eq!(bus.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_reach_jsonl_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead.jsonl");
        let registry = Arc::new(AgentRegistry::new(CapabilityTaxonomy::new()));
        let bus = MessageBus::new(
            registry.clone(),
            Arc::new(JsonlDeadLetters::open(&path).unwrap()),
            EventHub::default(),
            BusConfig::default(),
        );
        register(&registry, "A");
        bus.attach_connection("A", Arc::new(RecordingConnection::new("c1", u32::MAX)));

        let message = task("A", 9);
        let id = message.id.clone();
        bus.send(message).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(bus.stats().dead_lettered, 1);
        let reopened = JsonlDeadLetters::open(&path).unwrap();
        assert!(reopened.contains(&id));
        assert_eq!(reopened.list().unwrap().len(), 1);
    }
}
