//! Message selectors
//!
//! A selector is a predicate over a message's headers, attached to a
//! subscription. Evaluation is pluggable through [`SelectorFactory`]; the
//! default [`HeaderSelectorFactory`] understands a small SQL92-style grammar:
//!
//! ```text
//! priority > 3 AND region IN ('eu', 'us')
//! symbol LIKE 'AB%' OR urgent = TRUE
//! NOT (category IS NULL)
//! ```
//!
//! Identifiers name headers. A missing header is NULL, and any comparison
//! involving NULL is unknown, which does not match.

mod expr;
mod parser;

use std::fmt;
use std::sync::Arc;

use crate::protocol::{Message, MessagingError};

pub use expr::{Expr, Value};

/// Selector compilation and evaluation errors
#[derive(Debug, Clone, PartialEq)]
pub enum SelectorError {
    /// Expression could not be parsed
    Parse {
        expression: String,
        position: usize,
        reason: String,
    },
    /// Expression parsed but could not be evaluated against a message
    Evaluation { expression: String, reason: String },
}

impl fmt::Display for SelectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse {
                expression,
                position,
                reason,
            } => write!(
                f,
                "selector '{}' invalid at offset {}: {}",
                expression, position, reason
            ),
            Self::Evaluation { expression, reason } => {
                write!(f, "selector '{}' failed to evaluate: {}", expression, reason)
            }
        }
    }
}

impl std::error::Error for SelectorError {}

impl From<SelectorError> for MessagingError {
    fn from(e: SelectorError) -> Self {
        match e {
            SelectorError::Parse {
                expression, reason, ..
            }
            | SelectorError::Evaluation { expression, reason } => {
                MessagingError::BadSelector { expression, reason }
            }
        }
    }
}

/// A compiled predicate over messages
pub trait Selector: Send + Sync + fmt::Debug {
    /// Source text the selector was compiled from
    fn expression(&self) -> &str;

    /// Whether the message satisfies the selector
    fn matches(&self, message: &Message) -> Result<bool, SelectorError>;
}

/// Compiles selector expressions
pub trait SelectorFactory: Send + Sync {
    fn compile(&self, expression: &str) -> Result<Arc<dyn Selector>, SelectorError>;
}

/// Selector compiled by [`HeaderSelectorFactory`]
#[derive(Debug)]
pub struct CompiledSelector {
    expression: String,
    predicate: Expr,
}

impl CompiledSelector {
    pub fn parse(expression: &str) -> Result<Self, SelectorError> {
        let predicate = parser::parse(expression)?;
        Ok(Self {
            expression: expression.to_string(),
            predicate,
        })
    }

    pub fn predicate(&self) -> &Expr {
        &self.predicate
    }
}

impl Selector for CompiledSelector {
    fn expression(&self) -> &str {
        &self.expression
    }

    fn matches(&self, message: &Message) -> Result<bool, SelectorError> {
        match self.predicate.evaluate(message) {
            Ok(Value::Bool(b)) => Ok(b),
            Ok(Value::Null) => Ok(false),
            Ok(other) => Err(SelectorError::Evaluation {
                expression: self.expression.clone(),
                reason: format!("expected a boolean, got {}", other.type_name()),
            }),
            Err(reason) => Err(SelectorError::Evaluation {
                expression: self.expression.clone(),
                reason,
            }),
        }
    }
}

/// Selector that could not be compiled when it was registered
///
/// Adapters that manage their own subscriptions validate selectors in their
/// own dialect, so the expression is kept and every evaluation fails, which
/// dispatch treats as "does not match".
#[derive(Debug)]
pub struct UnparsedSelector {
    error: SelectorError,
    expression: String,
}

impl UnparsedSelector {
    pub fn new(expression: &str, error: SelectorError) -> Self {
        Self {
            error,
            expression: expression.to_string(),
        }
    }
}

impl Selector for UnparsedSelector {
    fn expression(&self) -> &str {
        &self.expression
    }

    fn matches(&self, _message: &Message) -> Result<bool, SelectorError> {
        Err(self.error.clone())
    }
}

/// Default factory for the header expression grammar
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderSelectorFactory;

impl SelectorFactory for HeaderSelectorFactory {
    fn compile(&self, expression: &str) -> Result<Arc<dyn Selector>, SelectorError> {
        Ok(Arc::new(CompiledSelector::parse(expression)?))
    }
}
