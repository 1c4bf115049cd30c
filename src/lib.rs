//! In-memory message broker engine with queue/topic/subscription semantics.
//!
//! This crate is the engine behind a local Service Bus emulator: it owns the
//! entity model (queues, topics, subscriptions, rules), the per-message
//! delivery state machine (peek-lock, complete, abandon, defer, dead-letter,
//! redelivery), and the rule-based routing layer that fans messages from a
//! topic out to matching subscriptions.
//!
//! A transport layer (AMQP, HTTP, ...) is expected to sit on top and map its
//! wire protocol onto the [`Namespace`] management operations and the
//! [`Router`] data-plane operations. All state is in-memory for the lifetime
//! of the process.

pub mod config;
pub mod entity;
pub mod error;
pub mod filter;
pub mod message;
pub mod router;
pub mod store;

pub use config::Topology;
pub use entity::{Namespace, QueueOptions, SubscriptionOptions, TopicOptions};
pub use error::{Error, Result};
pub use filter::{CorrelationFilter, Filter};
pub use message::{Message, PropertyValue};
pub use router::{EntityCounts, Router};
pub use store::{Envelope, LockToken, MessageState, SequenceNumber, SettlementOutcome};
