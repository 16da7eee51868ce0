//! Expression language used in policy conditions and outputs
//!
//! Expressions read a JSON fact document. Root identifiers resolve to `let`
//! bindings first and to top-level fact keys second; missing paths evaluate
//! to `null` rather than failing, so `has(namespace.labels["team"])` is the
//! idiomatic presence check.
//!
//! ```text
//! has(env_label) && lower(env_label) in ["production", "staging"]
//! startswith(namespace.name, "prod-") || namespace.labels["tier"] == "1"
//! severity_score + environment_score >= 6
//! ```

mod eval;
mod lexer;
mod parser;

use serde_json::Value;
use thiserror::Error;

pub use eval::{Evaluator, Scope, DEFAULT_STEP_BUDGET};
pub use parser::parse;

/// Errors from parsing or evaluating an expression
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    /// Source text is not a valid expression
    #[error("syntax error at offset {offset}: {message}")]
    Syntax {
        /// Byte offset of the offending token
        offset: usize,
        /// What was wrong
        message: String,
    },

    /// Evaluation failed (type mismatch, division by zero, ...)
    #[error("{0}")]
    Eval(String),

    /// Evaluation exceeded its step budget
    #[error("evaluation exceeded step budget of {0}")]
    BudgetExceeded(u64),

    /// Evaluation was cancelled by the caller
    #[error("evaluation cancelled")]
    Cancelled,
}

impl ExprError {
    pub(crate) fn syntax(offset: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            offset,
            message: message.into(),
        }
    }

    pub(crate) fn eval(message: impl Into<String>) -> Self {
        Self::Eval(message.into())
    }
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Constant value
    Literal(Value),
    /// Root lookup: `let` binding, then fact key
    Ident(String),
    /// `expr.name`
    Field(Box<Expr>, String),
    /// `expr[index]`
    Index(Box<Expr>, Box<Expr>),
    /// `[a, b, ...]`
    List(Vec<Expr>),
    /// `{"k": v, ...}`
    Map(Vec<(String, Expr)>),
    /// Prefix operator
    Unary(UnaryOp, Box<Expr>),
    /// Infix operator
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Built-in function call
    Call(Function, Vec<Expr>),
}

impl Expr {
    /// Root identifiers referenced anywhere in the expression
    pub fn identifiers(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ident(name) => out.push(name),
            Expr::Field(inner, _) => inner.collect_identifiers(out),
            Expr::Index(inner, index) => {
                inner.collect_identifiers(out);
                index.collect_identifiers(out);
            }
            Expr::List(items) | Expr::Call(_, items) => {
                items.iter().for_each(|i| i.collect_identifiers(out))
            }
            Expr::Map(entries) => entries.iter().for_each(|(_, v)| v.collect_identifiers(out)),
            Expr::Unary(_, inner) => inner.collect_identifiers(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_identifiers(out);
                rhs.collect_identifiers(out);
            }
        }
    }
}

/// Prefix operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `!`
    Not,
    /// `-`
    Neg,
}

/// Infix operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `||`
    Or,
    /// `&&`
    And,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `in`
    In,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
}

/// Built-in functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// `has(x)`: x is neither null nor an empty string
    Has,
    /// `startswith(s, prefix)`
    StartsWith,
    /// `endswith(s, suffix)`
    EndsWith,
    /// `contains(haystack, needle)`: substring, list element or map key
    Contains,
    /// `lower(s)`
    Lower,
    /// `upper(s)`
    Upper,
    /// `coalesce(a, b, ...)`: first non-null argument
    Coalesce,
    /// `len(x)`: characters, list items or map keys
    Len,
    /// `split(s, sep)`
    Split,
    /// `trimprefix(s, prefix)`
    TrimPrefix,
    /// `str(x)`: string form of a scalar
    Str,
}

impl Function {
    /// Look up a function by its source name
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "has" => Self::Has,
            "startswith" => Self::StartsWith,
            "endswith" => Self::EndsWith,
            "contains" => Self::Contains,
            "lower" => Self::Lower,
            "upper" => Self::Upper,
            "coalesce" => Self::Coalesce,
            "len" => Self::Len,
            "split" => Self::Split,
            "trimprefix" => Self::TrimPrefix,
            "str" => Self::Str,
            _ => return None,
        })
    }

    /// Source name of the function
    pub fn name(&self) -> &'static str {
        match self {
            Self::Has => "has",
            Self::StartsWith => "startswith",
            Self::EndsWith => "endswith",
            Self::Contains => "contains",
            Self::Lower => "lower",
            Self::Upper => "upper",
            Self::Coalesce => "coalesce",
            Self::Len => "len",
            Self::Split => "split",
            Self::TrimPrefix => "trimprefix",
            Self::Str => "str",
        }
    }

    pub(crate) fn check_arity(&self, got: usize) -> Result<(), String> {
        let ok = match self {
            Self::Has | Self::Lower | Self::Upper | Self::Len | Self::Str => got == 1,
            Self::StartsWith
            | Self::EndsWith
            | Self::Contains
            | Self::Split
            | Self::TrimPrefix => got == 2,
            Self::Coalesce => got >= 1,
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "{}() does not take {got} argument{}",
                self.name(),
                if got == 1 { "" } else { "s" }
            ))
        }
    }
}
