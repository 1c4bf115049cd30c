//! YAML topology seeding.
//!
//! A topology file declares queues, topics, subscriptions, and rules so a
//! whole namespace can be stood up declaratively:
//!
//! ```yaml
//! queues:
//!   - name: "orders"
//!     max_delivery_count: 5
//! topics:
//!   - name: "events"
//!     subscriptions:
//!       - name: "premium"
//!         rules:
//!           - name: "tier"
//!             filter:
//!               type: sql
//!               expression: "customer_tier = 'premium'"
//! ```
//!
//! All per-entity properties are optional and fall back to the
//! [`QueueOptions`]/[`SubscriptionOptions`] defaults.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::entity::{Namespace, QueueOptions, SubscriptionOptions, TopicOptions};
use crate::error::{Error, Result};
use crate::filter::{CorrelationFilter, Filter};

/// Per-entity delivery settings shared by queue and subscription declarations.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EntitySettings {
    pub lock_duration_secs: Option<u64>,
    pub max_delivery_count: Option<u32>,
    pub default_message_ttl_secs: Option<u64>,
    pub dead_lettering_on_message_expiration: Option<bool>,
    pub requires_session: Option<bool>,
}

impl EntitySettings {
    fn options(&self) -> QueueOptions {
        let defaults = QueueOptions::default();
        QueueOptions {
            lock_duration: self
                .lock_duration_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_duration),
            max_delivery_count: self.max_delivery_count.unwrap_or(defaults.max_delivery_count),
            default_message_ttl: self.default_message_ttl_secs.map(Duration::from_secs),
            dead_lettering_on_message_expiration: self
                .dead_lettering_on_message_expiration
                .unwrap_or(defaults.dead_lettering_on_message_expiration),
            requires_session: self.requires_session.unwrap_or(defaults.requires_session),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    pub name: String,
    #[serde(flatten)]
    pub settings: EntitySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TopicConfig {
    pub name: String,
    pub max_size_in_megabytes: Option<u32>,
    pub requires_session: Option<bool>,
    pub support_ordering: Option<bool>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubscriptionConfig {
    pub name: String,
    #[serde(flatten)]
    pub settings: EntitySettings,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuleConfig {
    pub name: String,
    pub filter: FilterConfig,
}

/// A filter declaration. SQL filters compile at seeding time; correlation
/// filters validate their limits.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FilterConfig {
    Sql {
        expression: String,
    },
    Correlation {
        correlation_id: Option<String>,
        message_id: Option<String>,
        to: Option<String>,
        reply_to: Option<String>,
        label: Option<String>,
        session_id: Option<String>,
        content_type: Option<String>,
        #[serde(default)]
        properties: HashMap<String, String>,
    },
}

impl FilterConfig {
    /// Compiles the declaration into a runtime [`Filter`].
    pub fn build(&self) -> Result<Filter> {
        match self {
            FilterConfig::Sql { expression } => Filter::sql(expression),
            FilterConfig::Correlation {
                correlation_id,
                message_id,
                to,
                reply_to,
                label,
                session_id,
                content_type,
                properties,
            } => Filter::correlation(CorrelationFilter {
                correlation_id: correlation_id.clone(),
                message_id: message_id.clone(),
                to: to.clone(),
                reply_to: reply_to.clone(),
                label: label.clone(),
                session_id: session_id.clone(),
                content_type: content_type.clone(),
                properties: properties.clone(),
            }),
        }
    }
}

/// Declarative namespace topology.
#[derive(Debug, Deserialize, Clone)]
pub struct Topology {
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

impl Topology {
    /// Loads a topology from a YAML file.
    pub fn load(path: &str) -> Result<Self> {
        let mut file =
            File::open(path).map_err(|e| Error::Config(format!("cannot open '{path}': {e}")))?;
        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|e| Error::Config(format!("cannot read '{path}': {e}")))?;
        Self::from_yaml(&content)
    }

    /// Parses a topology from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))
    }
}

impl Namespace {
    /// Seeds a namespace from a topology. Declared rules replace the
    /// `$Default` rule; a subscription without rules keeps it.
    pub async fn from_topology(topology: &Topology) -> Result<Arc<Self>> {
        let namespace = Arc::new(Namespace::new());

        for queue in &topology.queues {
            namespace
                .create_queue(&queue.name, queue.settings.options())
                .await?;
        }

        for topic in &topology.topics {
            let defaults = TopicOptions::default();
            namespace
                .create_topic(
                    &topic.name,
                    TopicOptions {
                        max_size_in_megabytes: topic
                            .max_size_in_megabytes
                            .unwrap_or(defaults.max_size_in_megabytes),
                        requires_session: topic
                            .requires_session
                            .unwrap_or(defaults.requires_session),
                        support_ordering: topic
                            .support_ordering
                            .unwrap_or(defaults.support_ordering),
                    },
                )
                .await?;

            for sub in &topic.subscriptions {
                namespace
                    .create_subscription(&topic.name, &sub.name, sub.settings.options())
                    .await?;
                if !sub.rules.is_empty() {
                    namespace
                        .delete_rule(&topic.name, &sub.name, crate::entity::DEFAULT_RULE_NAME)
                        .await?;
                    for rule in &sub.rules {
                        let filter = rule.filter.build()?;
                        namespace
                            .create_rule(&topic.name, &sub.name, &rule.name, filter)
                            .await?;
                    }
                }
            }
        }

        Ok(namespace)
    }
}
