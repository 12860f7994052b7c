//! Query syntax tree consumed by the authorizer and the store.
//!
//! The tree is deliberately small: it keeps exactly what tenant scoping and
//! shard selection need (selector kind, metric name, matcher name, operator
//! and value) and the shape of everything else so a walk can reach every
//! selector. [`crate::promql`] builds it from PromQL text.
//!
//! # Example
//!
//! ```rust
//! use metric_store::ast::{Expr, Selector};
//! use metric_store::query::MatchOp;
//!
//! // rate(cpu{source_id="app-1"}[5m])
//! let expr = Expr::call(
//!     "rate",
//!     vec![Expr::matrix(
//!         Selector::metric("cpu").with("source_id", MatchOp::Equal, "app-1"),
//!         std::time::Duration::from_secs(300),
//!     )],
//! );
//! assert_eq!(expr.selectors().count(), 1);
//! ```

use std::time::Duration;

use crate::query::MatchOp;

/// A `name op value` matcher as written in the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    /// Label name.
    pub name: String,
    /// Comparison operator.
    pub op: MatchOp,
    /// Literal value or pattern.
    pub value: String,
}

impl Matcher {
    /// Creates a matcher.
    pub fn new(name: impl Into<String>, op: MatchOp, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op,
            value: value.into(),
        }
    }
}

/// The series-selecting part of a vector or matrix selector.
///
/// `matchers` apply to every alternative. When `or_matchers` is non-empty the
/// selector is a union: each inner list, combined with `matchers`, selects
/// series independently (`{a="1" or b="2"}`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    /// Metric name written before the braces, if any.
    pub metric_name: Option<String>,
    /// Matchers shared by every alternative.
    pub matchers: Vec<Matcher>,
    /// Alternative matcher groups.
    pub or_matchers: Vec<Vec<Matcher>>,
}

impl Selector {
    /// A selector with only a metric name.
    pub fn metric(name: impl Into<String>) -> Self {
        Self {
            metric_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Adds a shared matcher.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, op: MatchOp, value: impl Into<String>) -> Self {
        self.matchers.push(Matcher::new(name, op, value));
        self
    }

    /// Adds an alternative matcher group.
    #[must_use]
    pub fn or(mut self, group: Vec<Matcher>) -> Self {
        self.or_matchers.push(group);
        self
    }

    /// Every alternative as a complete conjunction of matchers.
    ///
    /// A plain selector has exactly one group.
    pub fn matcher_groups(&self) -> Vec<Vec<&Matcher>> {
        if self.or_matchers.is_empty() {
            return vec![self.matchers.iter().collect()];
        }
        self.or_matchers
            .iter()
            .map(|alt| self.matchers.iter().chain(alt).collect())
            .collect()
    }
}

/// A query expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `metric{...}`
    VectorSelector(Selector),
    /// `metric{...}[range]`
    MatrixSelector {
        /// The selected series.
        selector: Selector,
        /// Lookback window.
        range: Duration,
    },
    /// `sum by (...) (expr)` and friends.
    Aggregate {
        /// Aggregation operator, e.g. `sum`.
        op: String,
        /// Aggregated expression.
        expr: Box<Expr>,
        /// Parameter for `topk`, `quantile`, ...
        param: Option<Box<Expr>>,
    },
    /// `lhs op rhs`
    Binary {
        /// Operator, e.g. `+` or `and`.
        op: String,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// `-expr`
    Unary(Box<Expr>),
    /// `(expr)`
    Paren(Box<Expr>),
    /// `expr[range:step]`
    Subquery {
        /// Inner expression.
        expr: Box<Expr>,
        /// Lookback window.
        range: Duration,
        /// Resolution, if given.
        step: Option<Duration>,
    },
    /// `func(args...)`
    Call {
        /// Function name.
        func: String,
        /// Arguments in order.
        args: Vec<Expr>,
    },
    /// A number.
    NumberLiteral(f64),
    /// A string.
    StringLiteral(String),
}

impl Expr {
    /// Wraps a vector selector.
    pub fn vector(selector: Selector) -> Self {
        Self::VectorSelector(selector)
    }

    /// Wraps a matrix selector.
    pub fn matrix(selector: Selector, range: Duration) -> Self {
        Self::MatrixSelector { selector, range }
    }

    /// A function call.
    pub fn call(func: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::Call {
            func: func.into(),
            args,
        }
    }

    /// A binary operation.
    pub fn binary(op: impl Into<String>, lhs: Expr, rhs: Expr) -> Self {
        Self::Binary {
            op: op.into(),
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// An aggregation without parameter.
    pub fn aggregate(op: impl Into<String>, expr: Expr) -> Self {
        Self::Aggregate {
            op: op.into(),
            expr: Box::new(expr),
            param: None,
        }
    }

    /// Every selector in the tree, in pre-order.
    pub fn selectors(&self) -> impl Iterator<Item = &Selector> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            while let Some(node) = stack.pop() {
                let children = node.children();
                stack.extend(children.into_iter().rev());
                if let Some(selector) = node.selector() {
                    return Some(selector);
                }
            }
            None
        })
    }
}

/// What a tree walker needs from a query node.
///
/// The authorizer depends only on this trait, so any grammar that can expose
/// selector matchers and child nodes can be scoped.
pub trait QueryNode {
    /// The selector, if this node selects series.
    fn selector(&self) -> Option<&Selector>;

    /// Direct children, left to right.
    fn children(&self) -> Vec<&Self>;
}

impl QueryNode for Expr {
    fn selector(&self) -> Option<&Selector> {
        match self {
            Self::VectorSelector(selector) | Self::MatrixSelector { selector, .. } => {
                Some(selector)
            }
            _ => None,
        }
    }

    fn children(&self) -> Vec<&Self> {
        match self {
            Self::Aggregate { expr, param, .. } => param
                .iter()
                .map(Box::as_ref)
                .chain(std::iter::once(expr.as_ref()))
                .collect(),
            Self::Binary { lhs, rhs, .. } => vec![lhs.as_ref(), rhs.as_ref()],
            Self::Unary(expr) | Self::Paren(expr) | Self::Subquery { expr, .. } => {
                vec![expr.as_ref()]
            }
            Self::Call { args, .. } => args.iter().collect(),
            Self::VectorSelector(_)
            | Self::MatrixSelector { .. }
            | Self::NumberLiteral(_)
            | Self::StringLiteral(_) => Vec::new(),
        }
    }
}
