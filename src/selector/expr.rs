//! Selector expression tree and evaluation
//!
//! Evaluation uses three-valued logic: `Value::Null` stands for "unknown".

use std::cmp::Ordering;

use crate::protocol::{HeaderValue, Message};

/// Runtime value of a selector operand
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::Float(_) => "number",
            Value::Str(_) => "string",
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn truth(&self) -> Result<Option<bool>, String> {
        match self {
            Value::Bool(b) => Ok(Some(*b)),
            Value::Null => Ok(None),
            other => Err(format!("expected a boolean, got {}", other.type_name())),
        }
    }
}

impl From<Option<bool>> for Value {
    fn from(b: Option<bool>) -> Self {
        b.map(Value::Bool).unwrap_or(Value::Null)
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Parsed selector expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Header(String),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Value>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: String,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
}

fn header_value(value: &HeaderValue, name: &str) -> Result<Value, String> {
    match value {
        HeaderValue::Bool(b) => Ok(Value::Bool(*b)),
        HeaderValue::Int(i) => Ok(Value::Int(*i)),
        HeaderValue::Float(f) => Ok(Value::Float(*f)),
        HeaderValue::Str(s) => Ok(Value::Str(s.clone())),
        HeaderValue::List(_) => Err(format!("header '{}' is a list", name)),
    }
}

fn negate(value: Option<bool>, negated: bool) -> Value {
    if negated {
        value.map(|b| !b).into()
    } else {
        value.into()
    }
}

/// Order two non-null values, or fail on incompatible types
fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<Option<bool>, String> {
    if matches!(left, Value::Null) || matches!(right, Value::Null) {
        return Ok(None);
    }

    let ordering = match (left, right) {
        (Value::Str(a), Value::Str(b)) => {
            if !matches!(op, CmpOp::Eq | CmpOp::Ne) {
                return Err("strings only support = and <>".to_string());
            }
            a.cmp(b)
        }
        (Value::Bool(a), Value::Bool(b)) => {
            if !matches!(op, CmpOp::Eq | CmpOp::Ne) {
                return Err("booleans only support = and <>".to_string());
            }
            a.cmp(b)
        }
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => match a.partial_cmp(&b) {
                Some(ordering) => ordering,
                None => return Ok(None),
            },
            _ => {
                return Err(format!(
                    "cannot compare {} with {}",
                    left.type_name(),
                    right.type_name()
                ))
            }
        },
    };

    Ok(Some(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    }))
}

/// SQL LIKE with `%` (any run) and `_` (one character)
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    let (mut t, mut p) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((bp, bt)) = backtrack {
            p = bp + 1;
            t = bt + 1;
            backtrack = Some((bp, bt + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '%')
}

impl Expr {
    /// Evaluate against a message; `Err` carries a reason for the failure
    pub fn evaluate(&self, message: &Message) -> Result<Value, String> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Header(name) => match message.header(name) {
                Some(value) => header_value(value, name),
                None => Ok(Value::Null),
            },
            Expr::Compare(op, left, right) => {
                let left = left.evaluate(message)?;
                let right = right.evaluate(message)?;
                Ok(compare(*op, &left, &right)?.into())
            }
            Expr::And(left, right) => {
                let left = left.evaluate(message)?.truth()?;
                if left == Some(false) {
                    return Ok(Value::Bool(false));
                }
                let right = right.evaluate(message)?.truth()?;
                Ok(match (left, right) {
                    (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                }
                .into())
            }
            Expr::Or(left, right) => {
                let left = left.evaluate(message)?.truth()?;
                if left == Some(true) {
                    return Ok(Value::Bool(true));
                }
                let right = right.evaluate(message)?.truth()?;
                Ok(match (left, right) {
                    (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                }
                .into())
            }
            Expr::Not(inner) => Ok(inner.evaluate(message)?.truth()?.map(|b| !b).into()),
            Expr::IsNull { expr, negated } => {
                let is_null = matches!(expr.evaluate(message)?, Value::Null);
                Ok(Value::Bool(is_null != *negated))
            }
            Expr::In {
                expr,
                list,
                negated,
            } => {
                let value = expr.evaluate(message)?;
                if matches!(value, Value::Null) {
                    return Ok(Value::Null);
                }
                let mut found = false;
                for item in list {
                    if compare(CmpOp::Eq, &value, item)? == Some(true) {
                        found = true;
                        break;
                    }
                }
                Ok(negate(Some(found), *negated))
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => match expr.evaluate(message)? {
                Value::Null => Ok(Value::Null),
                Value::Str(s) => Ok(negate(Some(like(&s, pattern)), *negated)),
                other => Err(format!("LIKE needs a string, got {}", other.type_name())),
            },
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let value = expr.evaluate(message)?;
                let low = low.evaluate(message)?;
                let high = high.evaluate(message)?;
                let above = compare(CmpOp::Ge, &value, &low)?;
                let below = compare(CmpOp::Le, &value, &high)?;
                let within = match (above, below) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                };
                Ok(negate(within, *negated))
            }
        }
    }

    /// Whether the node can yield a boolean; header types are only known
    /// at evaluation time
    pub(crate) fn is_condition(&self) -> bool {
        !matches!(self, Expr::Literal(v) if !matches!(v, Value::Bool(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like() {
        assert!(like("ABC", "ABC"));
        assert!(like("ABC", "A%"));
        assert!(like("ABC", "%C"));
        assert!(like("ABC", "%B%"));
        assert!(like("ABC", "A_C"));
        assert!(like("", "%"));
        assert!(like("AXXBXXC", "A%B%C"));
        assert!(!like("ABC", "A_"));
        assert!(!like("ABC", "B%"));
        assert!(!like("AB", "A%C"));
    }

    #[test]
    fn test_compare_numbers() {
        assert_eq!(
            compare(CmpOp::Lt, &Value::Int(1), &Value::Float(1.5)),
            Ok(Some(true))
        );
        assert_eq!(
            compare(CmpOp::Eq, &Value::Null, &Value::Int(1)),
            Ok(None)
        );
        assert!(compare(CmpOp::Eq, &Value::Str("1".into()), &Value::Int(1)).is_err());
    }
}
