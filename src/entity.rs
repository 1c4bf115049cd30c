//! Namespace entity model: queues, topics, subscriptions, and rules.
//!
//! A [`Namespace`] is the management plane. Queues and topics live in one
//! flat, case-sensitive address space — a queue and a topic cannot share a
//! name. Topics own subscriptions; subscriptions own rules; every queue and
//! subscription owns a `MessageStore` (and through it a DLQ).
//!
//! Entity maps are read-mostly, so they sit behind `RwLock` while the
//! per-store mutexes carry the message-level contention.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::message::Message;
use crate::store::{EntityConfig, MessageStore};

/// Name of the rule installed on every new subscription.
pub const DEFAULT_RULE_NAME: &str = "$Default";

/// Maximum number of rules on one subscription.
pub const MAX_RULES_PER_SUBSCRIPTION: usize = 100;

/// Properties of a queue, fixed at creation.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub lock_duration: Duration,
    pub max_delivery_count: u32,
    /// Default TTL applied to messages that carry none. `None` = no expiry.
    pub default_message_ttl: Option<Duration>,
    /// Dead-letter TTL-expired messages instead of discarding them.
    pub dead_lettering_on_message_expiration: bool,
    /// Receives must name a session; sends must carry a `session_id`.
    pub requires_session: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            max_delivery_count: 10,
            default_message_ttl: None,
            dead_lettering_on_message_expiration: false,
            requires_session: false,
        }
    }
}

impl QueueOptions {
    fn entity_config(&self) -> EntityConfig {
        EntityConfig {
            lock_duration: self.lock_duration,
            max_delivery_count: self.max_delivery_count,
            default_message_ttl_ms: self
                .default_message_ttl
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(0),
            dead_lettering_on_expiration: self.dead_lettering_on_message_expiration,
            requires_session: self.requires_session,
        }
    }
}

/// Properties of a topic. Topics retain no messages, so these are metadata
/// carried through to introspection.
#[derive(Debug, Clone)]
pub struct TopicOptions {
    pub max_size_in_megabytes: u32,
    /// Sends to this topic must carry a `session_id`.
    pub requires_session: bool,
    pub support_ordering: bool,
}

impl Default for TopicOptions {
    fn default() -> Self {
        Self {
            max_size_in_megabytes: 1024,
            requires_session: false,
            support_ordering: false,
        }
    }
}

/// Properties of a subscription. Same delivery knobs as a queue.
pub type SubscriptionOptions = QueueOptions;

/// A named filter on a subscription.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub filter: Filter,
}

/// A queue entity: options plus its message store.
pub struct Queue {
    name: String,
    options: QueueOptions,
    store: Arc<MessageStore>,
}

impl Queue {
    fn new(name: &str, options: QueueOptions) -> Self {
        let store = Arc::new(MessageStore::new(name, options.entity_config()));
        Self {
            name: name.to_string(),
            options,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }
}

/// A subscription entity: options, message store, and its rule set.
pub struct Subscription {
    topic: String,
    name: String,
    options: SubscriptionOptions,
    store: Arc<MessageStore>,
    rules: RwLock<Vec<Rule>>,
    /// Count of rule evaluations that failed at fan-out time.
    filter_failures: AtomicU64,
}

impl Subscription {
    fn new(topic: &str, name: &str, options: SubscriptionOptions) -> Self {
        let path = format!("{topic}/subscriptions/{name}");
        let store = Arc::new(MessageStore::new(path, options.entity_config()));
        Self {
            topic: topic.to_string(),
            name: name.to_string(),
            options,
            store,
            rules: RwLock::new(vec![Rule {
                name: DEFAULT_RULE_NAME.to_string(),
                filter: Filter::True,
            }]),
            filter_failures: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Snapshot of this subscription's rules.
    pub async fn rules(&self) -> Vec<Rule> {
        self.rules.read().await.clone()
    }

    /// How many rule evaluations have failed during fan-out.
    pub fn filter_failures(&self) -> u64 {
        self.filter_failures.load(Ordering::Relaxed)
    }

    /// True if any rule matches the message (deposit-once). An evaluation
    /// error counts against this subscription only — it is logged, recorded,
    /// and treated as a non-match for that rule.
    pub async fn matches(&self, message: &Message) -> bool {
        let rules = self.rules.read().await;
        for rule in rules.iter() {
            match rule.filter.matches(message) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => {
                    self.filter_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        topic = %self.topic,
                        subscription = %self.name,
                        rule = %rule.name,
                        error = %err,
                        "rule evaluation failed, treating as non-match"
                    );
                }
            }
        }
        false
    }

    async fn add_rule(&self, name: &str, filter: Filter) -> Result<()> {
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.name == name) {
            return Err(Error::AlreadyExists(format!(
                "{}/subscriptions/{}/rules/{name}",
                self.topic, self.name
            )));
        }
        if rules.len() >= MAX_RULES_PER_SUBSCRIPTION {
            return Err(Error::RuleLimitExceeded(format!(
                "{}/subscriptions/{}",
                self.topic, self.name
            )));
        }
        rules.push(Rule {
            name: name.to_string(),
            filter,
        });
        Ok(())
    }

    async fn remove_rule(&self, name: &str) -> Result<()> {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.name != name);
        if rules.len() == before {
            return Err(Error::NotFound(format!(
                "{}/subscriptions/{}/rules/{name}",
                self.topic, self.name
            )));
        }
        Ok(())
    }
}

/// A topic entity: metadata plus its subscriptions. Topics retain no
/// messages of their own.
pub struct Topic {
    name: String,
    options: TopicOptions,
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
}

impl Topic {
    fn new(name: &str, options: TopicOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &TopicOptions {
        &self.options
    }

    /// Snapshot of the topic's subscriptions.
    pub async fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.read().await.values().cloned().collect()
    }
}

/// Introspection snapshot of a queue.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub name: String,
    pub options: QueueOptions,
    pub active_count: usize,
    pub locked_count: usize,
    pub deferred_count: usize,
    pub dead_letter_count: usize,
}

/// Introspection snapshot of a topic.
#[derive(Debug, Clone)]
pub struct TopicInfo {
    pub name: String,
    pub options: TopicOptions,
    pub subscription_count: usize,
}

/// Introspection snapshot of a subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub topic: String,
    pub name: String,
    pub options: SubscriptionOptions,
    pub active_count: usize,
    pub locked_count: usize,
    pub deferred_count: usize,
    pub dead_letter_count: usize,
    pub rule_count: usize,
    pub filter_failures: u64,
}

/// The namespace: management plane over a flat address space of queues and
/// topics.
#[derive(Default)]
pub struct Namespace {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    // --- queues ---

    /// Creates a queue. Fails `AlreadyExists` if any entity (queue or topic)
    /// uses the name.
    pub async fn create_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        validate_entity_name(name)?;
        let mut queues = self.queues.write().await;
        if queues.contains_key(name) || self.topics.read().await.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        queues.insert(name.to_string(), Arc::new(Queue::new(name, options)));
        info!(queue = name, "queue created");
        Ok(())
    }

    pub async fn get_queue(&self, name: &str) -> Result<Arc<Queue>> {
        self.queues
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Deletes a queue, discarding all messages and locks.
    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut queues = self.queues.write().await;
        queues
            .remove(name)
            .map(|_| info!(queue = name, "queue deleted"))
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub async fn queue_info(&self, name: &str) -> Result<QueueInfo> {
        let queue = self.get_queue(name).await?;
        Ok(queue_info(&queue).await)
    }

    pub async fn list_queues(&self) -> Vec<QueueInfo> {
        let queues: Vec<_> = self.queues.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(queues.len());
        for queue in queues {
            infos.push(queue_info(&queue).await);
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    // --- topics ---

    pub async fn create_topic(&self, name: &str, options: TopicOptions) -> Result<()> {
        validate_entity_name(name)?;
        // Queue map first, then topic map, same order as create_queue.
        let queues = self.queues.read().await;
        let mut topics = self.topics.write().await;
        if queues.contains_key(name) || topics.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        topics.insert(name.to_string(), Arc::new(Topic::new(name, options)));
        info!(topic = name, "topic created");
        Ok(())
    }

    pub async fn get_topic(&self, name: &str) -> Result<Arc<Topic>> {
        self.topics
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Deletes a topic with all its subscriptions and their messages.
    pub async fn delete_topic(&self, name: &str) -> Result<()> {
        let mut topics = self.topics.write().await;
        topics
            .remove(name)
            .map(|_| info!(topic = name, "topic deleted"))
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub async fn topic_info(&self, name: &str) -> Result<TopicInfo> {
        let topic = self.get_topic(name).await?;
        let subscription_count = topic.subscriptions.read().await.len();
        Ok(TopicInfo {
            name: topic.name.clone(),
            options: topic.options.clone(),
            subscription_count,
        })
    }

    pub async fn list_topics(&self) -> Vec<TopicInfo> {
        let topics: Vec<_> = self.topics.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(topics.len());
        for topic in topics {
            let subscription_count = topic.subscriptions.read().await.len();
            infos.push(TopicInfo {
                name: topic.name.clone(),
                options: topic.options.clone(),
                subscription_count,
            });
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    // --- subscriptions ---

    /// Creates a subscription under a topic, installing the `$Default`
    /// TrueFilter rule.
    pub async fn create_subscription(
        &self,
        topic: &str,
        name: &str,
        options: SubscriptionOptions,
    ) -> Result<()> {
        validate_entity_name(name)?;
        let topic_ref = self.get_topic(topic).await?;
        let mut subscriptions = topic_ref.subscriptions.write().await;
        if subscriptions.contains_key(name) {
            return Err(Error::AlreadyExists(format!(
                "{topic}/subscriptions/{name}"
            )));
        }
        subscriptions.insert(
            name.to_string(),
            Arc::new(Subscription::new(topic, name, options)),
        );
        info!(topic, subscription = name, "subscription created");
        Ok(())
    }

    pub async fn get_subscription(&self, topic: &str, name: &str) -> Result<Arc<Subscription>> {
        let topic_ref = self.get_topic(topic).await?;
        let subscriptions = topic_ref.subscriptions.read().await;
        subscriptions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{topic}/subscriptions/{name}")))
    }

    /// Deletes a subscription, discarding its messages.
    pub async fn delete_subscription(&self, topic: &str, name: &str) -> Result<()> {
        let topic_ref = self.get_topic(topic).await?;
        let mut subscriptions = topic_ref.subscriptions.write().await;
        subscriptions
            .remove(name)
            .map(|_| info!(topic, subscription = name, "subscription deleted"))
            .ok_or_else(|| Error::NotFound(format!("{topic}/subscriptions/{name}")))
    }

    pub async fn subscription_info(&self, topic: &str, name: &str) -> Result<SubscriptionInfo> {
        let sub = self.get_subscription(topic, name).await?;
        Ok(subscription_info(&sub).await)
    }

    pub async fn list_subscriptions(&self, topic: &str) -> Result<Vec<SubscriptionInfo>> {
        let topic_ref = self.get_topic(topic).await?;
        let subs: Vec<_> = topic_ref.subscriptions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(subs.len());
        for sub in subs {
            infos.push(subscription_info(&sub).await);
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    // --- rules ---

    /// Adds a rule to a subscription. The filter is already compiled and
    /// validated by [`Filter::sql`] / [`Filter::correlation`], so this only
    /// enforces name uniqueness and the per-subscription rule limit.
    pub async fn create_rule(
        &self,
        topic: &str,
        subscription: &str,
        name: &str,
        filter: Filter,
    ) -> Result<()> {
        validate_entity_name(name)?;
        let sub = self.get_subscription(topic, subscription).await?;
        sub.add_rule(name, filter).await?;
        debug!(topic, subscription, rule = name, "rule created");
        Ok(())
    }

    pub async fn get_rule(&self, topic: &str, subscription: &str, name: &str) -> Result<Rule> {
        let sub = self.get_subscription(topic, subscription).await?;
        let rules = sub.rules.read().await;
        rules
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("{topic}/subscriptions/{subscription}/rules/{name}"))
            })
    }

    /// Removes a rule. Removing every rule (the `$Default` one included)
    /// leaves the subscription matching nothing.
    pub async fn delete_rule(&self, topic: &str, subscription: &str, name: &str) -> Result<()> {
        let sub = self.get_subscription(topic, subscription).await?;
        sub.remove_rule(name).await?;
        debug!(topic, subscription, rule = name, "rule deleted");
        Ok(())
    }

    pub async fn list_rules(&self, topic: &str, subscription: &str) -> Result<Vec<Rule>> {
        let sub = self.get_subscription(topic, subscription).await?;
        Ok(sub.rules().await)
    }

    // --- maintenance ---

    /// Every message store in the namespace (queues plus subscriptions).
    pub async fn all_stores(&self) -> Vec<Arc<MessageStore>> {
        let mut stores = Vec::new();
        for queue in self.queues.read().await.values() {
            stores.push(queue.store.clone());
        }
        let topics: Vec<_> = self.topics.read().await.values().cloned().collect();
        for topic in topics {
            for sub in topic.subscriptions.read().await.values() {
                stores.push(sub.store.clone());
            }
        }
        stores
    }

    /// Runs one expiry pass over every store: expired locks released or
    /// dead-lettered, TTL-expired messages removed.
    pub async fn sweep_expired(&self) -> (usize, usize, usize) {
        let mut released = 0;
        let mut dead_lettered = 0;
        let mut purged = 0;
        for store in self.all_stores().await {
            let (r, d) = store.expire_locks().await;
            released += r;
            dead_lettered += d;
            purged += store.purge_expired().await;
        }
        if released + dead_lettered + purged > 0 {
            debug!(released, dead_lettered, purged, "expiry sweep");
        }
        (released, dead_lettered, purged)
    }

    /// Spawns a background task sweeping expired locks and TTLs every
    /// `period`. Dropping the returned handle does not stop the task; abort
    /// it to stop sweeping.
    pub fn spawn_expiry_sweeper(
        self: &Arc<Self>,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let namespace = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                namespace.sweep_expired().await;
            }
        })
    }
}

async fn queue_info(queue: &Queue) -> QueueInfo {
    QueueInfo {
        name: queue.name.clone(),
        options: queue.options.clone(),
        active_count: queue.store.active_count().await,
        locked_count: queue.store.locked_count().await,
        deferred_count: queue.store.deferred_count().await,
        dead_letter_count: queue.store.dlq().len().await,
    }
}

async fn subscription_info(sub: &Subscription) -> SubscriptionInfo {
    SubscriptionInfo {
        topic: sub.topic.clone(),
        name: sub.name.clone(),
        options: sub.options.clone(),
        active_count: sub.store.active_count().await,
        locked_count: sub.store.locked_count().await,
        deferred_count: sub.store.deferred_count().await,
        dead_letter_count: sub.store.dlq().len().await,
        rule_count: sub.rules.read().await.len(),
        filter_failures: sub.filter_failures(),
    }
}

fn validate_entity_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("entity name must not be empty".to_string()));
    }
    if name.contains('/') {
        return Err(Error::Config(format!(
            "entity name '{name}' must not contain '/'"
        )));
    }
    Ok(())
}
