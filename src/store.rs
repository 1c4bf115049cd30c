//! Message store with peek-lock delivery, deferral, and dead-letter queues.
//!
//! Each queue and subscription gets a `MessageStore` that holds messages with
//! broker metadata (sequence number, enqueued time, delivery count, lock
//! state). A received message is locked for the entity's lock duration and
//! must be settled — completed, abandoned, deferred, or dead-lettered —
//! before the lock expires. An expired lock returns the message to Active,
//! or moves it to the DLQ once the delivery count reaches the entity maximum.
//!
//! ## DLQ Architecture
//!
//! Each `MessageStore` holds an `Arc<DlqStore>`. The `DlqStore` is a
//! separate, simpler type that has no nested DLQ — dead-lettered messages
//! are terminal. This avoids recursive types entirely.
//!
//! ## Concurrency
//!
//! All mutation goes through one `tokio::sync::Mutex` per store, so enqueue,
//! receive, settlement, and the expiry sweep are linearizable per store
//! while independent stores proceed in parallel. Every settlement verifies
//! the lock token *and* that the lock is still unexpired under the mutex;
//! of a racing consumer and sweeper, whoever acquires the mutex first wins
//! and the loser observes [`Error::LockLost`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::Message;

/// Unique identifier for a locked message, used for settlement.
pub type LockToken = Uuid;

/// Monotonically increasing sequence number assigned to each enqueued message.
pub type SequenceNumber = u64;

/// Dead-letter reason recorded when the delivery count reaches the maximum.
pub const REASON_MAX_DELIVERY: &str = "MaxDeliveryCountExceeded";
/// Dead-letter reason recorded when a message's TTL elapses.
pub const REASON_TTL_EXPIRED: &str = "TTLExpiredException";

/// State of a message in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageState {
    /// Available for delivery.
    Active,
    /// Locked by a consumer. Contains the lock token and expiry instant.
    Locked {
        lock_token: LockToken,
        locked_until: Instant,
    },
    /// Set aside by `defer`; retrievable only by sequence number.
    Deferred,
}

/// A message with broker-assigned metadata.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: Message,
    /// Broker-assigned sequence number (monotonically increasing per store).
    pub sequence_number: SequenceNumber,
    /// When the message was enqueued (as milliseconds since UNIX epoch).
    pub enqueued_time_utc: u64,
    /// Number of lock acquisitions so far.
    pub delivery_count: u32,
    pub state: MessageState,
    /// Optional TTL. If set, the message expires at `enqueued_time_utc + ttl_ms`.
    pub ttl_ms: Option<u64>,
    /// Path of the entity the message was dead-lettered from. Set only on
    /// envelopes living in a DLQ.
    pub dead_letter_source: Option<String>,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_description: Option<String>,
}

impl Envelope {
    /// Returns true if this message has expired based on the current time.
    pub fn is_expired(&self, now_epoch_ms: u64) -> bool {
        match self.ttl_ms {
            Some(ttl) if ttl > 0 => now_epoch_ms >= self.enqueued_time_utc.saturating_add(ttl),
            _ => false,
        }
    }

    /// The live lock token, if this message is currently locked.
    pub fn lock_token(&self) -> Option<LockToken> {
        match &self.state {
            MessageState::Locked { lock_token, .. } => Some(*lock_token),
            _ => None,
        }
    }
}

/// Configuration for a message store entity.
#[derive(Debug, Clone)]
pub struct EntityConfig {
    /// How long a received message stays locked.
    pub lock_duration: Duration,
    /// Max lock acquisitions before auto-dead-lettering.
    pub max_delivery_count: u32,
    /// Default message TTL in milliseconds. 0 = no expiry.
    pub default_message_ttl_ms: u64,
    /// Whether to dead-letter expired messages (true) or discard them (false).
    pub dead_lettering_on_expiration: bool,
    /// Whether receive operations must name a session.
    pub requires_session: bool,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            max_delivery_count: 10,
            default_message_ttl_ms: 0,
            dead_lettering_on_expiration: false,
            requires_session: false,
        }
    }
}

/// What `abandon` did with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// Back to Active, available for redelivery.
    Abandoned,
    /// Delivery count had reached the maximum; moved to the DLQ instead.
    DeadLettered,
}

/// Inner mutable state shared by both store types.
struct StoreInner {
    /// Message queue in enqueue order (active, locked, and deferred).
    messages: VecDeque<Envelope>,
    /// Index from lock token to sequence number for fast settlement lookup.
    lock_index: HashMap<LockToken, SequenceNumber>,
}

impl StoreInner {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            lock_index: HashMap::new(),
        }
    }

    /// Locks up to `count` Active messages in enqueue order, optionally
    /// restricted to one session. Each lock increments the delivery count.
    fn lock_available(
        &mut self,
        count: usize,
        session_id: Option<&str>,
        lock_duration: Duration,
    ) -> Vec<Envelope> {
        let mut locked = Vec::new();
        let locked_until = Instant::now() + lock_duration;
        for envelope in self.messages.iter_mut() {
            if locked.len() >= count {
                break;
            }
            if envelope.state != MessageState::Active {
                continue;
            }
            if let Some(session) = session_id {
                if envelope.message.session_id.as_deref() != Some(session) {
                    continue;
                }
            }
            let lock_token = Uuid::new_v4();
            envelope.state = MessageState::Locked {
                lock_token,
                locked_until,
            };
            envelope.delivery_count += 1;
            self.lock_index.insert(lock_token, envelope.sequence_number);
            locked.push(envelope.clone());
        }
        locked
    }

    /// Finds the position of the message holding a still-valid lock for
    /// `token`, removing the index entry. Stale entries (expired lock, or
    /// the message was re-locked under a new token) are dropped.
    fn take_valid_lock(&mut self, token: LockToken) -> Option<usize> {
        let seq = self.lock_index.remove(&token)?;
        let idx = self
            .messages
            .iter()
            .position(|e| e.sequence_number == seq)?;
        match &self.messages[idx].state {
            MessageState::Locked {
                lock_token,
                locked_until,
            } if *lock_token == token && Instant::now() < *locked_until => Some(idx),
            _ => None,
        }
    }

    /// Returns expired locks to Active, removing their index entries.
    /// Returns how many locks were released.
    fn release_expired_locks(&mut self) -> usize {
        let now = Instant::now();
        let mut expired_tokens = Vec::new();
        for envelope in self.messages.iter_mut() {
            if let MessageState::Locked {
                lock_token,
                locked_until,
            } = &envelope.state
            {
                if now >= *locked_until {
                    expired_tokens.push(*lock_token);
                    envelope.state = MessageState::Active;
                }
            }
        }
        for token in &expired_tokens {
            self.lock_index.remove(token);
        }
        expired_tokens.len()
    }
}

// ---------------------------------------------------------------------------
// DlqStore — a simple store for dead-lettered messages (no nested DLQ)
// ---------------------------------------------------------------------------

/// A dead-letter queue store. Simpler than `MessageStore` — no nested DLQ,
/// no TTL processing, no deferral, no auto-dead-lettering. Messages here are
/// terminal until explicitly completed.
pub struct DlqStore {
    inner: Mutex<StoreInner>,
    next_sequence: AtomicU64,
    lock_duration: Duration,
}

impl DlqStore {
    pub fn new(lock_duration: Duration) -> Self {
        Self {
            inner: Mutex::new(StoreInner::new()),
            next_sequence: AtomicU64::new(1),
            lock_duration,
        }
    }

    /// Enqueues an existing envelope, resetting its state and assigning a
    /// fresh sequence number in this store's space.
    pub async fn enqueue_envelope(&self, mut envelope: Envelope) {
        envelope.sequence_number = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        envelope.state = MessageState::Active;
        envelope.ttl_ms = None; // DLQ messages don't expire
        let mut inner = self.inner.lock().await;
        inner.messages.push_back(envelope);
    }

    /// Pure read of up to `count` messages in enqueue order.
    pub async fn peek(&self, count: usize) -> Vec<Envelope> {
        let inner = self.inner.lock().await;
        inner.messages.iter().take(count).cloned().collect()
    }

    /// Locks and returns up to `count` messages (peek-lock).
    pub async fn receive(&self, count: usize) -> Vec<Envelope> {
        let mut inner = self.inner.lock().await;
        inner.release_expired_locks();
        inner.lock_available(count, None, self.lock_duration)
    }

    /// Removes a locked message.
    pub async fn complete(&self, lock_token: LockToken) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.take_valid_lock(lock_token) {
            Some(idx) => {
                inner.messages.remove(idx);
                Ok(())
            }
            None => Err(Error::LockLost(lock_token)),
        }
    }

    /// Unlocks a message, making it available again. No further
    /// dead-lettering from here.
    pub async fn abandon(&self, lock_token: LockToken) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.take_valid_lock(lock_token) {
            Some(idx) => {
                inner.messages[idx].state = MessageState::Active;
                Ok(())
            }
            None => Err(Error::LockLost(lock_token)),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.messages.is_empty()
    }
}

// ---------------------------------------------------------------------------
// MessageStore — the main message store for queues and subscriptions
// ---------------------------------------------------------------------------

/// A message store for a single queue or subscription.
///
/// Thread-safe and supports multiple concurrent consumers (competing
/// consumers): each Active message is locked by exactly one receiver.
pub struct MessageStore {
    /// Entity path, recorded as `dead_letter_source` on dead-lettered copies.
    entity_name: String,
    inner: Mutex<StoreInner>,
    /// Monotonically increasing sequence number generator.
    next_sequence: AtomicU64,
    config: EntityConfig,
    /// Dead-letter queue for this entity.
    dlq: Arc<DlqStore>,
}

impl MessageStore {
    pub fn new(entity_name: impl Into<String>, config: EntityConfig) -> Self {
        let dlq = Arc::new(DlqStore::new(config.lock_duration));
        Self {
            entity_name: entity_name.into(),
            inner: Mutex::new(StoreInner::new()),
            next_sequence: AtomicU64::new(1),
            config,
            dlq,
        }
    }

    pub fn name(&self) -> &str {
        &self.entity_name
    }

    pub fn config(&self) -> &EntityConfig {
        &self.config
    }

    /// The DLQ store for this entity.
    pub fn dlq(&self) -> &Arc<DlqStore> {
        &self.dlq
    }

    /// Enqueues a message into the store.
    ///
    /// Assigns a sequence number and enqueued timestamp, state Active. The
    /// message's own TTL wins over the entity default.
    pub async fn enqueue(&self, message: Message) -> SequenceNumber {
        let seq = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let msg_ttl = message
            .time_to_live
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let ttl_ms = msg_ttl.or(if self.config.default_message_ttl_ms > 0 {
            Some(self.config.default_message_ttl_ms)
        } else {
            None
        });

        let envelope = Envelope {
            message,
            sequence_number: seq,
            enqueued_time_utc: epoch_ms(),
            delivery_count: 0,
            state: MessageState::Active,
            ttl_ms,
            dead_letter_source: None,
            dead_letter_reason: None,
            dead_letter_description: None,
        };

        let mut inner = self.inner.lock().await;
        inner.messages.push_back(envelope);
        debug!(entity = %self.entity_name, seq, "message enqueued");
        seq
    }

    /// Pure read of up to `count` messages in enqueue order. Never changes
    /// state, delivery counts, or locks, and sees locked and deferred
    /// messages too.
    pub async fn peek(&self, count: usize) -> Vec<Envelope> {
        let inner = self.inner.lock().await;
        inner.messages.iter().take(count).cloned().collect()
    }

    /// Locks and returns up to `count` Active messages in enqueue order
    /// (peek-lock). Non-blocking: returns fewer (or none) when nothing is
    /// Active. Expired locks and TTLs are processed first, so a receiver
    /// never observes a message that should already be gone.
    pub async fn receive(&self, count: usize) -> Vec<Envelope> {
        self.receive_inner(count, None).await
    }

    /// Like [`receive`](Self::receive), restricted to one session's messages.
    pub async fn receive_session(&self, session_id: &str, count: usize) -> Vec<Envelope> {
        self.receive_inner(count, Some(session_id)).await
    }

    async fn receive_inner(&self, count: usize, session_id: Option<&str>) -> Vec<Envelope> {
        let (locked, dead) = {
            let mut inner = self.inner.lock().await;
            let (_, mut dead) = self.sweep_locks(&mut inner);
            let (_, expired) = self.sweep_ttl(&mut inner);
            dead.extend(expired);
            let locked = inner.lock_available(count, session_id, self.config.lock_duration);
            (locked, dead)
        };
        // DLQ enqueue happens outside the store mutex.
        self.deposit_dead_letters(dead).await;
        locked
    }

    /// Completes a locked message, removing it permanently.
    pub async fn complete(&self, lock_token: LockToken) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.take_valid_lock(lock_token) {
            Some(idx) => {
                let seq = inner.messages[idx].sequence_number;
                inner.messages.remove(idx);
                debug!(entity = %self.entity_name, seq, "message completed");
                Ok(())
            }
            None => Err(Error::LockLost(lock_token)),
        }
    }

    /// Abandons a locked message, returning it to Active.
    ///
    /// If the delivery count has reached `max_delivery_count`, the message is
    /// dead-lettered instead.
    pub async fn abandon(&self, lock_token: LockToken) -> Result<SettlementOutcome> {
        let dead = {
            let mut inner = self.inner.lock().await;
            let idx = inner
                .take_valid_lock(lock_token)
                .ok_or(Error::LockLost(lock_token))?;
            if inner.messages[idx].delivery_count >= self.config.max_delivery_count {
                inner.messages.remove(idx)
            } else {
                inner.messages[idx].state = MessageState::Active;
                return Ok(SettlementOutcome::Abandoned);
            }
        };
        if let Some(envelope) = dead {
            warn!(
                entity = %self.entity_name,
                seq = envelope.sequence_number,
                delivery_count = envelope.delivery_count,
                "max delivery count reached, dead-lettering"
            );
            self.dlq
                .enqueue_envelope(self.stamp_dead_letter(
                    envelope,
                    REASON_MAX_DELIVERY,
                    "abandoned at max delivery count",
                ))
                .await;
        }
        Ok(SettlementOutcome::DeadLettered)
    }

    /// Defers a locked message. It stops participating in normal receives;
    /// only [`receive_deferred`](Self::receive_deferred) can retrieve it.
    pub async fn defer(&self, lock_token: LockToken) -> Result<SequenceNumber> {
        let mut inner = self.inner.lock().await;
        match inner.take_valid_lock(lock_token) {
            Some(idx) => {
                inner.messages[idx].state = MessageState::Deferred;
                let seq = inner.messages[idx].sequence_number;
                debug!(entity = %self.entity_name, seq, "message deferred");
                Ok(seq)
            }
            None => Err(Error::LockLost(lock_token)),
        }
    }

    /// Retrieves a deferred message by sequence number, locking it again.
    pub async fn receive_deferred(&self, sequence_number: SequenceNumber) -> Result<Envelope> {
        let mut inner = self.inner.lock().await;
        let lock_duration = self.config.lock_duration;
        let envelope = inner
            .messages
            .iter_mut()
            .find(|e| e.sequence_number == sequence_number && e.state == MessageState::Deferred)
            .ok_or_else(|| {
                Error::NotFound(format!("deferred message with sequence {sequence_number}"))
            })?;
        let lock_token = Uuid::new_v4();
        envelope.state = MessageState::Locked {
            lock_token,
            locked_until: Instant::now() + lock_duration,
        };
        envelope.delivery_count += 1;
        let result = envelope.clone();
        inner.lock_index.insert(lock_token, sequence_number);
        Ok(result)
    }

    /// Dead-letters a locked message with an explicit reason.
    pub async fn dead_letter(
        &self,
        lock_token: LockToken,
        reason: &str,
        description: &str,
    ) -> Result<()> {
        let envelope = {
            let mut inner = self.inner.lock().await;
            let idx = inner
                .take_valid_lock(lock_token)
                .ok_or(Error::LockLost(lock_token))?;
            inner.messages.remove(idx)
        };
        if let Some(envelope) = envelope {
            let seq = envelope.sequence_number;
            self.dlq
                .enqueue_envelope(self.stamp_dead_letter(envelope, reason, description))
                .await;
            debug!(entity = %self.entity_name, seq, reason, "message dead-lettered");
        }
        Ok(())
    }

    /// Extends the lock on a message by one full lock duration.
    pub async fn renew_lock(&self, lock_token: LockToken) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let lock_duration = self.config.lock_duration;
        if let Some(&seq) = inner.lock_index.get(&lock_token) {
            if let Some(envelope) = inner
                .messages
                .iter_mut()
                .find(|e| e.sequence_number == seq)
            {
                if let MessageState::Locked {
                    lock_token: lt,
                    locked_until,
                } = &mut envelope.state
                {
                    if *lt == lock_token && now < *locked_until {
                        *locked_until = now + lock_duration;
                        return Ok(());
                    }
                }
            }
        }
        Err(Error::LockLost(lock_token))
    }

    /// Explicit expiry sweep over locks: each expired lock transitions the
    /// message back to Active, or to the DLQ once the delivery count has
    /// reached the maximum. Returns `(released, dead_lettered)`.
    pub async fn expire_locks(&self) -> (usize, usize) {
        let (released, dead) = {
            let mut inner = self.inner.lock().await;
            self.sweep_locks(&mut inner)
        };
        let dead_lettered = dead.len();
        self.deposit_dead_letters(dead).await;
        (released, dead_lettered)
    }

    /// TTL sweep: removes expired Active messages, dead-lettering or
    /// discarding them per configuration. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let (discarded, dead) = {
            let mut inner = self.inner.lock().await;
            self.sweep_ttl(&mut inner)
        };
        let removed = discarded + dead.len();
        self.deposit_dead_letters(dead).await;
        removed
    }

    /// Number of messages available for delivery.
    pub async fn active_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .messages
            .iter()
            .filter(|e| e.state == MessageState::Active)
            .count()
    }

    /// Number of currently locked messages.
    pub async fn locked_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .messages
            .iter()
            .filter(|e| matches!(e.state, MessageState::Locked { .. }))
            .count()
    }

    /// Number of deferred messages.
    pub async fn deferred_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .messages
            .iter()
            .filter(|e| e.state == MessageState::Deferred)
            .count()
    }

    /// Total messages in the store, all states, DLQ excluded.
    pub async fn total_count(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    /// Releases expired locks, then removes messages whose delivery count
    /// has reached the maximum for dead-lettering. Returns the count of
    /// locks released back to Active plus the removed envelopes. Must be
    /// called while holding the store mutex; DLQ enqueue happens outside.
    fn sweep_locks(&self, inner: &mut StoreInner) -> (usize, Vec<Envelope>) {
        let expired = inner.release_expired_locks();
        if expired == 0 {
            return (0, Vec::new());
        }
        let mut dead = Vec::new();
        let mut idx = 0;
        while idx < inner.messages.len() {
            let envelope = &inner.messages[idx];
            let over_limit = envelope.state == MessageState::Active
                && envelope.delivery_count >= self.config.max_delivery_count
                && envelope.delivery_count > 0;
            if over_limit {
                if let Some(envelope) = inner.messages.remove(idx) {
                    warn!(
                        entity = %self.entity_name,
                        seq = envelope.sequence_number,
                        delivery_count = envelope.delivery_count,
                        "lock expired at max delivery count, dead-lettering"
                    );
                    dead.push(self.stamp_dead_letter(
                        envelope,
                        REASON_MAX_DELIVERY,
                        "lock expired at max delivery count",
                    ));
                }
                continue;
            }
            idx += 1;
        }
        (expired - dead.len(), dead)
    }

    /// Removes TTL-expired Active messages. Returns the discard count plus
    /// the envelopes headed for the DLQ. Must be called while holding the
    /// store mutex; DLQ enqueue happens outside.
    fn sweep_ttl(&self, inner: &mut StoreInner) -> (usize, Vec<Envelope>) {
        let now_ms = epoch_ms();
        let mut discarded = 0;
        let mut dead = Vec::new();
        let mut idx = 0;
        while idx < inner.messages.len() {
            let envelope = &inner.messages[idx];
            if envelope.state == MessageState::Active && envelope.is_expired(now_ms) {
                if let Some(envelope) = inner.messages.remove(idx) {
                    if self.config.dead_lettering_on_expiration {
                        dead.push(self.stamp_dead_letter(
                            envelope,
                            REASON_TTL_EXPIRED,
                            "message expired",
                        ));
                    } else {
                        discarded += 1;
                        debug!(
                            entity = %self.entity_name,
                            seq = envelope.sequence_number,
                            "expired message discarded"
                        );
                    }
                }
                continue;
            }
            idx += 1;
        }
        (discarded, dead)
    }

    fn stamp_dead_letter(
        &self,
        mut envelope: Envelope,
        reason: &str,
        description: &str,
    ) -> Envelope {
        envelope.dead_letter_source = Some(self.entity_name.clone());
        envelope.dead_letter_reason = Some(reason.to_string());
        envelope.dead_letter_description = Some(description.to_string());
        envelope
    }

    /// Deposits collected envelopes into the DLQ. Called outside the store
    /// mutex so the two stores never nest their locks.
    async fn deposit_dead_letters(&self, dead: Vec<Envelope>) {
        for envelope in dead {
            self.dlq.enqueue_envelope(envelope).await;
        }
    }
}

/// Returns current time as milliseconds since UNIX epoch.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
