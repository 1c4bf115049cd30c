//! AST evaluation against a single message's property set.
//!
//! A reference to a property the message doesn't carry resolves to a null
//! marker: every comparison against it is false and only `IS NULL` is true.
//! Cross-type comparisons coerce the string side to the other side's type;
//! booleans coerce against the strings `"true"`/`"false"`.
//!
//! Evaluation can fail (e.g. ordering a boolean); such failures are reported
//! to the router, which isolates them per subscription instead of failing
//! the publish.

use crate::filter::parser::{CompareOp, Expr, Literal, Operand, SystemProperty};
use crate::message::{Message, PropertyValue};

/// A filter failed at evaluation time (as opposed to compile time).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("filter evaluation failed: {0}")]
pub struct EvalError(pub String);

/// Resolved operand value. `Null` marks a missing property.
#[derive(Debug, Clone, PartialEq)]
enum Val {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

pub(crate) fn evaluate(expr: &Expr, msg: &Message) -> Result<bool, EvalError> {
    match expr {
        Expr::And(l, r) => Ok(evaluate(l, msg)? && evaluate(r, msg)?),
        Expr::Or(l, r) => Ok(evaluate(l, msg)? || evaluate(r, msg)?),
        Expr::Not(inner) => Ok(!evaluate(inner, msg)?),
        Expr::Compare { op, lhs, rhs } => {
            compare(*op, resolve(lhs, msg), resolve(rhs, msg))
        }
        Expr::In {
            operand,
            list,
            negated,
        } => {
            let value = resolve(operand, msg);
            if value == Val::Null {
                return Ok(false);
            }
            let mut member = false;
            for lit in list {
                if compare(CompareOp::Eq, value.clone(), literal_val(lit))? {
                    member = true;
                    break;
                }
            }
            Ok(member != *negated)
        }
        Expr::Like {
            operand,
            pattern,
            negated,
        } => match resolve(operand, msg) {
            Val::Null => Ok(false),
            Val::Str(text) => Ok(like_match(&text, pattern) != *negated),
            other => Err(EvalError(format!(
                "LIKE requires a string operand, got {other:?}"
            ))),
        },
        Expr::IsNull { operand, negated } => {
            Ok((resolve(operand, msg) == Val::Null) != *negated)
        }
    }
}

fn literal_val(lit: &Literal) -> Val {
    match lit {
        Literal::Str(s) => Val::Str(s.clone()),
        Literal::Int(n) => Val::Int(*n),
        Literal::Float(x) => Val::Float(*x),
        Literal::Bool(b) => Val::Bool(*b),
    }
}

fn resolve(operand: &Operand, msg: &Message) -> Val {
    match operand {
        Operand::Literal(lit) => literal_val(lit),
        Operand::User(name) => match msg.user_property(name) {
            Some(PropertyValue::String(s)) => Val::Str(s.clone()),
            Some(PropertyValue::Int(n)) => Val::Int(*n),
            Some(PropertyValue::Float(x)) => Val::Float(*x),
            Some(PropertyValue::Bool(b)) => Val::Bool(*b),
            None => Val::Null,
        },
        Operand::System(prop) => {
            let field = match prop {
                SystemProperty::MessageId => &msg.message_id,
                SystemProperty::Label => &msg.label,
                SystemProperty::ContentType => &msg.content_type,
                SystemProperty::CorrelationId => &msg.correlation_id,
                SystemProperty::SessionId => &msg.session_id,
                SystemProperty::ReplyTo => &msg.reply_to,
                SystemProperty::To => &msg.to,
                // Broker-assigned properties don't exist yet when rules run
                // during topic fan-out (the copy hasn't been enqueued).
                SystemProperty::DeliveryCount
                | SystemProperty::EnqueuedTimeUtc
                | SystemProperty::SequenceNumber => return Val::Null,
            };
            match field {
                Some(s) => Val::Str(s.clone()),
                None => Val::Null,
            }
        }
    }
}

/// Applies a comparison with the coercion rules.
fn compare(op: CompareOp, lhs: Val, rhs: Val) -> Result<bool, EvalError> {
    use Val::*;
    match (lhs, rhs) {
        (Null, _) | (_, Null) => Ok(false),

        (Int(a), Int(b)) => Ok(cmp_ord(op, a.cmp(&b))),
        (Int(a), Float(b)) => Ok(cmp_f64(op, a as f64, b)),
        (Float(a), Int(b)) => Ok(cmp_f64(op, a, b as f64)),
        (Float(a), Float(b)) => Ok(cmp_f64(op, a, b)),

        (Str(a), Str(b)) => Ok(cmp_ord(op, a.cmp(&b))),

        // String vs number: coerce the string side to a number; an
        // unparseable string compares false.
        (Str(s), Int(n)) => Ok(coerce_num(&s).is_some_and(|x| cmp_f64(op, x, n as f64))),
        (Str(s), Float(x)) => Ok(coerce_num(&s).is_some_and(|a| cmp_f64(op, a, x))),
        (Int(n), Str(s)) => Ok(coerce_num(&s).is_some_and(|x| cmp_f64(op, n as f64, x))),
        (Float(x), Str(s)) => Ok(coerce_num(&s).is_some_and(|b| cmp_f64(op, x, b))),

        (Bool(a), Bool(b)) => cmp_eq_only(op, a == b),
        (Bool(b), Str(s)) => cmp_eq_only(op, s == b.to_string()),
        (Str(s), Bool(b)) => cmp_eq_only(op, s == b.to_string()),
        (Bool(_), Int(_) | Float(_)) | (Int(_) | Float(_), Bool(_)) => cmp_eq_only(op, false),
    }
}

fn coerce_num(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok()
}

fn cmp_ord(op: CompareOp, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CompareOp::Eq => ord == Equal,
        CompareOp::Ne => ord != Equal,
        CompareOp::Lt => ord == Less,
        CompareOp::Gt => ord == Greater,
        CompareOp::Le => ord != Greater,
        CompareOp::Ge => ord != Less,
    }
}

fn cmp_f64(op: CompareOp, a: f64, b: f64) -> bool {
    match op {
        CompareOp::Eq => a == b,
        CompareOp::Ne => a != b,
        CompareOp::Lt => a < b,
        CompareOp::Gt => a > b,
        CompareOp::Le => a <= b,
        CompareOp::Ge => a >= b,
    }
}

/// Booleans support equality only; ordering a boolean is an evaluation error.
fn cmp_eq_only(op: CompareOp, eq: bool) -> Result<bool, EvalError> {
    match op {
        CompareOp::Eq => Ok(eq),
        CompareOp::Ne => Ok(!eq),
        _ => Err(EvalError("ordering comparison on boolean".to_string())),
    }
}

/// `%` is the only wildcard and matches zero or more characters.
fn like_match(text: &str, pattern: &str) -> bool {
    let segments: Vec<&str> = pattern.split('%').collect();
    if segments.len() == 1 {
        return text == pattern;
    }

    let first = segments[0];
    if !text.starts_with(first) {
        return false;
    }
    let mut rest = &text[first.len()..];

    for seg in &segments[1..segments.len() - 1] {
        if seg.is_empty() {
            continue;
        }
        match rest.find(seg) {
            Some(idx) => rest = &rest[idx + seg.len()..],
            None => return false,
        }
    }

    rest.ends_with(segments[segments.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::parser::parse;

    fn eval(expression: &str, msg: &Message) -> bool {
        evaluate(&parse(expression).unwrap(), msg).unwrap()
    }

    fn order_message() -> Message {
        Message::builder()
            .label("order.created")
            .user_property("priority", "high")
            .user_property("quantity", 150i64)
            .user_property("ratio", 0.5)
            .user_property("express", true)
            .build()
    }

    #[test]
    fn test_eval_and_comparison() {
        let msg = order_message();
        assert!(eval("priority = 'high' AND quantity > 100", &msg));

        let low = Message::builder()
            .user_property("priority", "high")
            .user_property("quantity", 50i64)
            .build();
        assert!(!eval("priority = 'high' AND quantity > 100", &low));
    }

    #[test]
    fn test_eval_missing_property_null_semantics() {
        let msg = Message::builder().build();
        assert!(eval("absent IS NULL", &msg));
        assert!(!eval("absent IS NOT NULL", &msg));
        assert!(!eval("absent = 'x'", &msg));
        assert!(!eval("absent > 1", &msg));
        assert!(!eval("absent != 'x'", &msg));
        assert!(!eval("absent IN ('x')", &msg));
        assert!(!eval("absent LIKE 'x%'", &msg));
    }

    #[test]
    fn test_eval_string_number_coercion() {
        let msg = Message::builder()
            .user_property("count_text", "42")
            .user_property("count_num", 42i64)
            .build();
        assert!(eval("count_text = 42", &msg));
        assert!(eval("count_text > 40", &msg));
        assert!(eval("count_num = '42'", &msg));
        assert!(eval("count_num < '100'", &msg));
        // Unparseable string side compares false.
        let bad = Message::builder().user_property("count_text", "abc").build();
        assert!(!eval("count_text = 42", &bad));
        assert!(!eval("count_text < 42", &bad));
    }

    #[test]
    fn test_eval_bool_coercion_against_strings() {
        let msg = order_message();
        assert!(eval("express = true", &msg));
        assert!(eval("express = 'true'", &msg));
        assert!(eval("express != 'false'", &msg));
        assert!(!eval("express = 'false'", &msg));
    }

    #[test]
    fn test_eval_bool_ordering_is_error() {
        let msg = order_message();
        let expr = parse("express > false").unwrap();
        assert!(evaluate(&expr, &msg).is_err());
    }

    #[test]
    fn test_eval_int_float_comparison() {
        let msg = order_message();
        assert!(eval("ratio < 1", &msg));
        assert!(eval("quantity = 150.0", &msg));
    }

    #[test]
    fn test_eval_in_membership() {
        let msg = order_message();
        assert!(eval("priority IN ('low', 'high')", &msg));
        assert!(!eval("priority IN ('low', 'medium')", &msg));
        assert!(eval("priority NOT IN ('low', 'medium')", &msg));
        assert!(eval("quantity IN (100, 150)", &msg));
    }

    #[test]
    fn test_eval_like_wildcards() {
        let msg = order_message();
        assert!(eval("sys.Label LIKE 'order%'", &msg));
        assert!(eval("sys.Label LIKE '%created'", &msg));
        assert!(eval("sys.Label LIKE '%der.cre%'", &msg));
        assert!(eval("sys.Label LIKE 'order%created'", &msg));
        assert!(!eval("sys.Label LIKE 'invoice%'", &msg));
        assert!(eval("sys.Label NOT LIKE 'invoice%'", &msg));
        assert!(eval("sys.Label LIKE 'order.created'", &msg));
    }

    #[test]
    fn test_eval_sys_properties() {
        let msg = Message::builder()
            .message_id("m-1")
            .correlation_id("c-9")
            .session_id("s-1")
            .content_type("application/json")
            .to("dest")
            .reply_to("origin")
            .label("evt")
            .build();
        assert!(eval("sys.MessageId = 'm-1'", &msg));
        assert!(eval("sys.CorrelationId = 'c-9'", &msg));
        assert!(eval("sys.SessionId = 's-1'", &msg));
        assert!(eval("sys.ContentType = 'application/json'", &msg));
        assert!(eval("sys.To = 'dest'", &msg));
        assert!(eval("sys.ReplyTo = 'origin'", &msg));
        assert!(eval("sys.Label = 'evt'", &msg));
        // Broker-assigned properties are null before enqueue.
        assert!(eval("sys.SequenceNumber IS NULL", &msg));
        assert!(!eval("sys.DeliveryCount = 0", &msg));
    }

    #[test]
    fn test_eval_not_logic() {
        let msg = order_message();
        assert!(eval("NOT priority = 'low'", &msg));
        assert!(!eval("NOT (priority = 'high' OR quantity > 100)", &msg));
    }

    #[test]
    fn test_like_match_edges() {
        assert!(like_match("abc", "%"));
        assert!(like_match("", "%"));
        assert!(like_match("abc", "a%c"));
        assert!(!like_match("ab", "a%c"));
        assert!(like_match("abc", "%%"));
        assert!(!like_match("abc", "abcd"));
    }
}
