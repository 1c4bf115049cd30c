//! Subscription rule filters.
//!
//! Two filter kinds plus the implicit default:
//! - [`Filter::Sql`] — a boolean expression over system and user properties,
//!   compiled once at rule creation into an AST and evaluated per message.
//! - [`Filter::Correlation`] — exact-match conjunction over a fixed set of
//!   system fields plus up to ten user properties. Noticeably cheaper than a
//!   SQL filter: no parsing, no coercion, just string equality.
//! - [`Filter::True`] — matches everything; the `$Default` rule uses it.

mod eval;
mod lexer;
mod parser;

use std::collections::HashMap;

pub use eval::EvalError;
pub use parser::MAX_EXPRESSION_LEN;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::filter::parser::Expr;

/// Maximum number of user-property entries on a correlation filter.
pub const MAX_CORRELATION_PROPERTIES: usize = 10;
/// Maximum length of a correlation property name, in characters.
pub const MAX_CORRELATION_NAME_LEN: usize = 128;
/// Maximum length of a correlation value (system fields included), in
/// characters.
pub const MAX_CORRELATION_VALUE_LEN: usize = 256;

/// A compiled SQL filter: the original expression plus its AST.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFilter {
    expression: String,
    ast: Expr,
}

impl SqlFilter {
    /// Compiles an expression. Fails with [`Error::FilterSyntax`] on
    /// malformed input, unmatched parentheses, or an expression over
    /// [`MAX_EXPRESSION_LEN`] characters.
    pub fn compile(expression: &str) -> Result<Self> {
        let ast = parser::parse(expression)?;
        Ok(Self {
            expression: expression.to_string(),
            ast,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Evaluates the compiled AST against one message.
    pub fn matches(&self, msg: &Message) -> std::result::Result<bool, EvalError> {
        eval::evaluate(&self.ast, msg)
    }
}

/// An exact-match filter: every specified field must be present on the
/// message and string-equal to the specified value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrelationFilter {
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub label: Option<String>,
    pub session_id: Option<String>,
    pub content_type: Option<String>,
    /// User-property entries, matched against the message's user properties
    /// by canonical string form.
    pub properties: HashMap<String, String>,
}

impl CorrelationFilter {
    /// Checks the size limits. Called at rule creation; a violating filter
    /// never becomes a rule.
    pub fn validate(&self) -> Result<()> {
        if self.properties.len() > MAX_CORRELATION_PROPERTIES {
            return Err(Error::FilterLimitExceeded(format!(
                "{} properties, maximum is {MAX_CORRELATION_PROPERTIES}",
                self.properties.len()
            )));
        }
        for (name, value) in &self.properties {
            if name.chars().count() > MAX_CORRELATION_NAME_LEN {
                let prefix: String = name.chars().take(32).collect();
                return Err(Error::FilterLimitExceeded(format!(
                    "property name '{prefix}...' exceeds {MAX_CORRELATION_NAME_LEN} characters"
                )));
            }
            if value.chars().count() > MAX_CORRELATION_VALUE_LEN {
                return Err(Error::FilterLimitExceeded(format!(
                    "value for property '{name}' exceeds {MAX_CORRELATION_VALUE_LEN} characters"
                )));
            }
        }
        for field in [
            &self.correlation_id,
            &self.message_id,
            &self.to,
            &self.reply_to,
            &self.label,
            &self.session_id,
            &self.content_type,
        ]
        .into_iter()
        .flatten()
        {
            if field.chars().count() > MAX_CORRELATION_VALUE_LEN {
                return Err(Error::FilterLimitExceeded(format!(
                    "field value exceeds {MAX_CORRELATION_VALUE_LEN} characters"
                )));
            }
        }
        Ok(())
    }

    /// Pure conjunction: each configured field must match exactly.
    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(expected) = &self.correlation_id {
            if msg.correlation_id.as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        if let Some(expected) = &self.message_id {
            if msg.message_id.as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        if let Some(expected) = &self.to {
            if msg.to.as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        if let Some(expected) = &self.reply_to {
            if msg.reply_to.as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        if let Some(expected) = &self.label {
            if msg.label.as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        if let Some(expected) = &self.session_id {
            if msg.session_id.as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        if let Some(expected) = &self.content_type {
            if msg.content_type.as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        for (key, expected) in &self.properties {
            let actual = msg.user_property(key).map(|v| v.as_text());
            if actual.as_deref() != Some(expected.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A rule's filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Always matches. The implicit default for new subscriptions.
    True,
    Sql(SqlFilter),
    Correlation(CorrelationFilter),
}

impl Filter {
    /// Compiles a SQL filter expression.
    pub fn sql(expression: &str) -> Result<Self> {
        Ok(Filter::Sql(SqlFilter::compile(expression)?))
    }

    /// Validates and wraps a correlation filter.
    pub fn correlation(filter: CorrelationFilter) -> Result<Self> {
        filter.validate()?;
        Ok(Filter::Correlation(filter))
    }

    /// Evaluates this filter against one message.
    pub fn matches(&self, msg: &Message) -> std::result::Result<bool, EvalError> {
        match self {
            Filter::True => Ok(true),
            Filter::Sql(f) => f.matches(msg),
            Filter::Correlation(f) => Ok(f.matches(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlation(label: Option<&str>, props: &[(&str, &str)]) -> CorrelationFilter {
        CorrelationFilter {
            label: label.map(|s| s.to_string()),
            properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_correlation_label_and_property_conjunction() {
        let filter = correlation(Some("order.created"), &[("customer_tier", "premium")]);

        let matching = Message::builder()
            .label("order.created")
            .user_property("customer_tier", "premium")
            .build();
        assert!(filter.matches(&matching));

        let wrong_label = Message::builder()
            .label("order.shipped")
            .user_property("customer_tier", "premium")
            .build();
        assert!(!filter.matches(&wrong_label));

        let missing_prop = Message::builder().label("order.created").build();
        assert!(!filter.matches(&missing_prop));
    }

    #[test]
    fn test_correlation_missing_system_field_fails_match() {
        let filter = CorrelationFilter {
            correlation_id: Some("c-1".to_string()),
            ..Default::default()
        };
        let msg = Message::builder().build();
        assert!(!filter.matches(&msg));
    }

    #[test]
    fn test_correlation_non_string_property_matches_by_text() {
        let filter = correlation(None, &[("quantity", "150")]);
        let msg = Message::builder().user_property("quantity", 150i64).build();
        assert!(filter.matches(&msg));
    }

    #[test]
    fn test_empty_correlation_filter_matches_everything() {
        let filter = CorrelationFilter::default();
        assert!(filter.matches(&Message::builder().build()));
    }

    #[test]
    fn test_correlation_limits() {
        let mut too_many = CorrelationFilter::default();
        for i in 0..11 {
            too_many
                .properties
                .insert(format!("p{i}"), "v".to_string());
        }
        assert!(matches!(
            too_many.validate(),
            Err(Error::FilterLimitExceeded(_))
        ));

        let long_name = correlation(None, &[(&"n".repeat(129), "v")]);
        assert!(long_name.validate().is_err());

        let long_value = correlation(None, &[("n", &"v".repeat(257))]);
        assert!(long_value.validate().is_err());

        let long_field = CorrelationFilter {
            label: Some("l".repeat(257)),
            ..Default::default()
        };
        assert!(long_field.validate().is_err());

        assert!(correlation(Some("ok"), &[("n", "v")]).validate().is_ok());
    }

    #[test]
    fn test_correlation_limits_count_characters_not_bytes() {
        // 101 characters but 201 bytes: within the name limit.
        let accented_name = format!("a{}", "é".repeat(100));
        assert!(correlation(None, &[(&accented_name, "v")]).validate().is_ok());

        // 129 characters of multibyte text: over the limit, reported as an
        // error rather than a panic mid-character.
        let over_name = "é".repeat(129);
        assert!(matches!(
            Filter::correlation(correlation(None, &[(&over_name, "v")])),
            Err(Error::FilterLimitExceeded(_))
        ));

        // Values follow the same rule.
        assert!(correlation(None, &[("n", &"é".repeat(256))]).validate().is_ok());
        assert!(correlation(None, &[("n", &"é".repeat(257))]).validate().is_err());
        let field = CorrelationFilter {
            label: Some("é".repeat(256)),
            ..Default::default()
        };
        assert!(field.validate().is_ok());
    }

    #[test]
    fn test_true_filter_matches() {
        assert!(Filter::True.matches(&Message::builder().build()).unwrap());
    }

    #[test]
    fn test_sql_filter_compile_and_match() {
        let filter = Filter::sql("priority = 'high'").unwrap();
        let msg = Message::builder().user_property("priority", "high").build();
        assert!(filter.matches(&msg).unwrap());
    }

    #[test]
    fn test_sql_filter_compile_failure_carries_position() {
        let err = Filter::sql("priority = AND").unwrap_err();
        assert!(matches!(err, Error::FilterSyntax { .. }));
    }
}
