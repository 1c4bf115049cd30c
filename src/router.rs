//! Data-plane router: address resolution, sends with topic fan-out, and
//! settlement.
//!
//! Each queue and each topic subscription gets a `MessageStore`. When
//! multiple receivers read the same queue or the same subscription, each
//! message is delivered to exactly **one** of them (competing consumers).
//!
//! Topics themselves have no store — sending to a topic evaluates every
//! subscription's rules against the message and deposits one independent
//! copy per matching subscription.
//!
//! Addresses are case-sensitive: `"queue"`, `"topic"`,
//! `"topic/subscriptions/sub"`, and any of those with the
//! `/$deadletterqueue` suffix for the entity's DLQ.

use std::sync::Arc;

use tracing::debug;

use crate::entity::Namespace;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::store::{
    DlqStore, Envelope, LockToken, MessageStore, SequenceNumber, SettlementOutcome,
};

/// Suffix addressing an entity's dead-letter queue.
pub const DLQ_SUFFIX: &str = "/$deadletterqueue";

/// Live message counts for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityCounts {
    pub active: usize,
    pub locked: usize,
    pub deferred: usize,
    pub dead_letter: usize,
}

/// What an address resolved to.
enum Target {
    /// A queue or subscription store.
    Entity(Arc<MessageStore>),
    /// An entity's dead-letter queue.
    DeadLetter(Arc<DlqStore>),
}

/// Data-plane facade over a [`Namespace`]. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    namespace: Arc<Namespace>,
}

impl Router {
    pub fn new(namespace: Arc<Namespace>) -> Self {
        Self { namespace }
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    /// Sends a message to a queue or topic.
    ///
    /// Queues accept the message directly. Topics evaluate every
    /// subscription's rules first and deposit one independent copy per
    /// matching subscription (a subscription takes at most one copy no
    /// matter how many of its rules match). Returns how many stores
    /// accepted the message; zero matching subscriptions drops the message
    /// silently and returns 0.
    ///
    /// A session-required target rejects messages without a `session_id`
    /// with [`Error::SessionRequired`].
    pub async fn send(&self, address: &str, message: Message) -> Result<usize> {
        if let Ok(queue) = self.namespace.get_queue(address).await {
            if queue.options().requires_session && message.session_id.is_none() {
                return Err(Error::SessionRequired(address.to_string()));
            }
            queue.store().enqueue(message).await;
            return Ok(1);
        }

        if let Ok(topic) = self.namespace.get_topic(address).await {
            if topic.options().requires_session && message.session_id.is_none() {
                return Err(Error::SessionRequired(address.to_string()));
            }
            // Evaluate all rules before any deposit, so a session rejection
            // cannot leave a partial fan-out behind.
            let mut matched = Vec::new();
            for sub in topic.subscriptions().await {
                if sub.matches(&message).await {
                    if sub.options().requires_session && message.session_id.is_none() {
                        return Err(Error::SessionRequired(sub.store().name().to_string()));
                    }
                    matched.push(sub);
                }
            }
            if matched.is_empty() {
                debug!(topic = address, "no subscription matched, message dropped");
                return Ok(0);
            }
            let count = matched.len();
            for sub in matched {
                sub.store().enqueue(message.clone()).await;
            }
            debug!(topic = address, count, "message fanned out");
            return Ok(count);
        }

        // Subscription paths are receive addresses, not send targets.
        Err(Error::NotFound(address.to_string()))
    }

    /// Pure read of up to `count` messages at the address (DLQ addresses
    /// included). Never affects state or delivery counts.
    pub async fn peek(&self, address: &str, count: usize) -> Result<Vec<Envelope>> {
        match self.resolve(address).await? {
            Target::Entity(store) => Ok(store.peek(count).await),
            Target::DeadLetter(dlq) => Ok(dlq.peek(count).await),
        }
    }

    /// Receives up to `count` messages with peek-lock semantics.
    /// Session-required entities reject plain receives.
    pub async fn receive(&self, address: &str, count: usize) -> Result<Vec<Envelope>> {
        match self.resolve(address).await? {
            Target::Entity(store) => {
                if store.config().requires_session {
                    return Err(Error::SessionRequired(address.to_string()));
                }
                Ok(store.receive(count).await)
            }
            Target::DeadLetter(dlq) => Ok(dlq.receive(count).await),
        }
    }

    /// Receives up to `count` messages belonging to one session.
    pub async fn receive_session(
        &self,
        address: &str,
        session_id: &str,
        count: usize,
    ) -> Result<Vec<Envelope>> {
        let store = self.entity_store(address).await?;
        Ok(store.receive_session(session_id, count).await)
    }

    /// Completes a locked message.
    pub async fn complete(&self, address: &str, lock_token: LockToken) -> Result<()> {
        match self.resolve(address).await? {
            Target::Entity(store) => store.complete(lock_token).await,
            Target::DeadLetter(dlq) => dlq.complete(lock_token).await,
        }
    }

    /// Abandons a locked message. On a normal entity this may dead-letter
    /// instead once the delivery count hits the maximum; on a DLQ address it
    /// only unlocks.
    pub async fn abandon(&self, address: &str, lock_token: LockToken) -> Result<SettlementOutcome> {
        match self.resolve(address).await? {
            Target::Entity(store) => store.abandon(lock_token).await,
            Target::DeadLetter(dlq) => {
                dlq.abandon(lock_token).await?;
                Ok(SettlementOutcome::Abandoned)
            }
        }
    }

    /// Defers a locked message for later retrieval by sequence number.
    pub async fn defer(&self, address: &str, lock_token: LockToken) -> Result<SequenceNumber> {
        self.entity_store(address).await?.defer(lock_token).await
    }

    /// Retrieves a deferred message by sequence number, locking it.
    pub async fn receive_deferred(
        &self,
        address: &str,
        sequence_number: SequenceNumber,
    ) -> Result<Envelope> {
        self.entity_store(address)
            .await?
            .receive_deferred(sequence_number)
            .await
    }

    /// Moves a locked message to the entity's DLQ with an explicit reason.
    pub async fn dead_letter(
        &self,
        address: &str,
        lock_token: LockToken,
        reason: &str,
        description: &str,
    ) -> Result<()> {
        self.entity_store(address)
            .await?
            .dead_letter(lock_token, reason, description)
            .await
    }

    /// Extends a lock by one lock duration.
    pub async fn renew_lock(&self, address: &str, lock_token: LockToken) -> Result<()> {
        self.entity_store(address).await?.renew_lock(lock_token).await
    }

    /// Pure read of an entity's dead-letter queue.
    pub async fn peek_dead_letter(&self, address: &str, count: usize) -> Result<Vec<Envelope>> {
        let store = self.entity_store(address).await?;
        Ok(store.dlq().peek(count).await)
    }

    /// Peek-lock receive from an entity's dead-letter queue.
    pub async fn receive_dead_letter(&self, address: &str, count: usize) -> Result<Vec<Envelope>> {
        let store = self.entity_store(address).await?;
        Ok(store.dlq().receive(count).await)
    }

    /// Live counts for a queue or subscription.
    pub async fn counts(&self, address: &str) -> Result<EntityCounts> {
        let store = self.entity_store(address).await?;
        Ok(EntityCounts {
            active: store.active_count().await,
            locked: store.locked_count().await,
            deferred: store.deferred_count().await,
            dead_letter: store.dlq().len().await,
        })
    }

    /// Resolves an address to its store. The `/$deadletterqueue` suffix
    /// resolves to the base entity's DLQ.
    async fn resolve(&self, address: &str) -> Result<Target> {
        if let Some(base) = strip_dlq_suffix(address) {
            let store = self.entity_store(base).await?;
            return Ok(Target::DeadLetter(store.dlq().clone()));
        }
        Ok(Target::Entity(self.entity_store(address).await?))
    }

    /// Resolves a queue or subscription-path address to its message store.
    /// Topic addresses are send targets only and do not resolve here.
    async fn entity_store(&self, address: &str) -> Result<Arc<MessageStore>> {
        if let Ok(queue) = self.namespace.get_queue(address).await {
            return Ok(queue.store().clone());
        }
        if let Some((topic, sub)) = split_subscription_path(address) {
            let sub = self.namespace.get_subscription(topic, sub).await?;
            return Ok(sub.store().clone());
        }
        Err(Error::NotFound(address.to_string()))
    }
}

/// Strips the `/$deadletterqueue` suffix, returning the base address.
/// The suffix is a protocol constant and matches case-insensitively even
/// though entity names do not.
fn strip_dlq_suffix(address: &str) -> Option<&str> {
    let Some(split) = address.len().checked_sub(DLQ_SUFFIX.len()) else {
        return None;
    };
    if !address.is_char_boundary(split) {
        return None;
    }
    let (base, tail) = address.split_at(split);
    if tail.eq_ignore_ascii_case(DLQ_SUFFIX) {
        Some(base)
    } else {
        None
    }
}

/// Splits `topic/subscriptions/sub` into its topic and subscription parts.
fn split_subscription_path(address: &str) -> Option<(&str, &str)> {
    let mut parts = address.splitn(3, '/');
    let topic = parts.next()?;
    let marker = parts.next()?;
    let sub = parts.next()?;
    if marker == "subscriptions" && !topic.is_empty() && !sub.is_empty() {
        Some((topic, sub))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{QueueOptions, SubscriptionOptions, TopicOptions};
    use crate::filter::Filter;

    async fn test_router() -> Router {
        let ns = Arc::new(Namespace::new());
        ns.create_queue("queue-a", QueueOptions::default()).await.unwrap();
        ns.create_queue("queue-b", QueueOptions::default()).await.unwrap();
        ns.create_topic("topic-x", TopicOptions::default()).await.unwrap();
        ns.create_subscription("topic-x", "sub-1", SubscriptionOptions::default())
            .await
            .unwrap();
        ns.create_subscription("topic-x", "sub-2", SubscriptionOptions::default())
            .await
            .unwrap();
        Router::new(ns)
    }

    fn test_message(body: &str) -> Message {
        Message::builder().body(body.to_string()).build()
    }

    #[tokio::test]
    async fn test_send_to_queue() {
        let router = test_router().await;
        assert_eq!(router.send("queue-a", test_message("hello")).await.unwrap(), 1);

        let batch = router.receive("queue-a", 1).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(&batch[0].message.body[..], b"hello");
    }

    #[tokio::test]
    async fn test_send_unknown_address() {
        let router = test_router().await;
        assert!(matches!(
            router.send("nonexistent", test_message("x")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_topic_fanout_to_all_default_subscriptions() {
        let router = test_router().await;
        assert_eq!(router.send("topic-x", test_message("fanout")).await.unwrap(), 2);

        for sub in ["topic-x/subscriptions/sub-1", "topic-x/subscriptions/sub-2"] {
            let batch = router.receive(sub, 1).await.unwrap();
            assert_eq!(batch.len(), 1, "{sub} should hold a copy");
            assert_eq!(&batch[0].message.body[..], b"fanout");
        }
    }

    #[tokio::test]
    async fn test_fanout_copies_are_independent() {
        let router = test_router().await;
        router.send("topic-x", test_message("copy")).await.unwrap();

        let b1 = router.receive("topic-x/subscriptions/sub-1", 1).await.unwrap();
        router
            .complete("topic-x/subscriptions/sub-1", b1[0].lock_token().unwrap())
            .await
            .unwrap();

        // Completing sub-1's copy leaves sub-2's untouched.
        let counts = router.counts("topic-x/subscriptions/sub-2").await.unwrap();
        assert_eq!(counts.active, 1);
    }

    #[tokio::test]
    async fn test_fanout_no_match_drops_silently() {
        let ns = Arc::new(Namespace::new());
        ns.create_topic("events", TopicOptions::default()).await.unwrap();
        ns.create_subscription("events", "picky", SubscriptionOptions::default())
            .await
            .unwrap();
        ns.delete_rule("events", "picky", crate::entity::DEFAULT_RULE_NAME)
            .await
            .unwrap();
        ns.create_rule(
            "events",
            "picky",
            "high-only",
            Filter::sql("priority = 'high'").unwrap(),
        )
        .await
        .unwrap();
        let router = Router::new(ns);

        let sent = router.send("events", test_message("boring")).await.unwrap();
        assert_eq!(sent, 0);
        let counts = router.counts("events/subscriptions/picky").await.unwrap();
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    async fn test_fanout_deposit_once_with_overlapping_rules() {
        let ns = Arc::new(Namespace::new());
        ns.create_topic("events", TopicOptions::default()).await.unwrap();
        ns.create_subscription("events", "sub", SubscriptionOptions::default())
            .await
            .unwrap();
        // $Default plus a SQL rule both match — still one copy.
        ns.create_rule("events", "sub", "extra", Filter::sql("priority = 'high'").unwrap())
            .await
            .unwrap();
        let router = Router::new(ns);

        let msg = Message::builder().user_property("priority", "high").build();
        assert_eq!(router.send("events", msg).await.unwrap(), 1);
        let counts = router.counts("events/subscriptions/sub").await.unwrap();
        assert_eq!(counts.active, 1);
    }

    #[tokio::test]
    async fn test_send_to_subscription_path_rejected() {
        let router = test_router().await;
        assert!(matches!(
            router
                .send("topic-x/subscriptions/sub-1", test_message("x"))
                .await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dlq_address_resolution() {
        let router = test_router().await;
        router.send("queue-a", test_message("doomed")).await.unwrap();
        let batch = router.receive("queue-a", 1).await.unwrap();
        router
            .dead_letter("queue-a", batch[0].lock_token().unwrap(), "TestReason", "test")
            .await
            .unwrap();

        let dlq = router.peek("queue-a/$deadletterqueue", 10).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].dead_letter_reason.as_deref(), Some("TestReason"));
        assert_eq!(dlq[0].dead_letter_source.as_deref(), Some("queue-a"));

        // Suffix casing is not significant.
        let dlq = router.peek("queue-a/$DeadLetterQueue", 10).await.unwrap();
        assert_eq!(dlq.len(), 1);
    }

    #[tokio::test]
    async fn test_dlq_receive_and_complete() {
        let router = test_router().await;
        router.send("queue-a", test_message("doomed")).await.unwrap();
        let batch = router.receive("queue-a", 1).await.unwrap();
        router
            .dead_letter("queue-a", batch[0].lock_token().unwrap(), "Bad", "")
            .await
            .unwrap();

        let batch = router.receive_dead_letter("queue-a", 1).await.unwrap();
        assert_eq!(batch.len(), 1);
        router
            .complete("queue-a/$deadletterqueue", batch[0].lock_token().unwrap())
            .await
            .unwrap();
        assert!(router.peek_dead_letter("queue-a", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_required_enforcement() {
        let ns = Arc::new(Namespace::new());
        ns.create_queue(
            "sessions",
            QueueOptions {
                requires_session: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        ns.create_topic(
            "session-topic",
            TopicOptions {
                requires_session: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let router = Router::new(ns);

        assert!(matches!(
            router.send("sessions", test_message("no-session")).await,
            Err(Error::SessionRequired(_))
        ));
        assert!(matches!(
            router.send("session-topic", test_message("no-session")).await,
            Err(Error::SessionRequired(_))
        ));

        let msg = Message::builder().body("hi").session_id("s-1").build();
        router.send("sessions", msg).await.unwrap();

        assert!(matches!(
            router.receive("sessions", 1).await,
            Err(Error::SessionRequired(_))
        ));

        let batch = router.receive_session("sessions", "s-1", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(router
            .receive_session("sessions", "s-2", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_counts() {
        let router = test_router().await;
        router.send("queue-b", test_message("one")).await.unwrap();
        router.send("queue-b", test_message("two")).await.unwrap();
        router.receive("queue-b", 1).await.unwrap();

        let counts = router.counts("queue-b").await.unwrap();
        assert_eq!(
            counts,
            EntityCounts {
                active: 1,
                locked: 1,
                deferred: 0,
                dead_letter: 0
            }
        );
    }

    #[test]
    fn test_split_subscription_path() {
        assert_eq!(
            split_subscription_path("t/subscriptions/s"),
            Some(("t", "s"))
        );
        assert_eq!(split_subscription_path("t/Subscriptions/s"), None);
        assert_eq!(split_subscription_path("t/s"), None);
        assert_eq!(split_subscription_path("queue"), None);
    }

    #[test]
    fn test_strip_dlq_suffix() {
        assert_eq!(strip_dlq_suffix("q/$deadletterqueue"), Some("q"));
        assert_eq!(strip_dlq_suffix("q/$DeadLetterQueue"), Some("q"));
        assert_eq!(
            strip_dlq_suffix("t/subscriptions/s/$deadletterqueue"),
            Some("t/subscriptions/s")
        );
        assert_eq!(strip_dlq_suffix("q"), None);
    }
}
