//! PromQL front end.
//!
//! Parses query text with `promql-parser` and lowers the result into the
//! crate's [`crate::ast::Expr`], which is what the authorizer and the store work on.
//! Modifiers that do not affect which series are selected (`offset`, `@`,
//! `by`/`without`, vector matching) are dropped during lowering.

use std::collections::BTreeSet;

use promql_parser::label::{MatchOp as PromMatchOp, Matcher as PromMatcher, Matchers};
use promql_parser::parser::{self, Expr as PromExpr, VectorSelector};

use crate::ast::{Expr, Matcher, Selector};
use crate::auth::QueryAuthorizer;
use crate::error::AuthError;
use crate::query::MatchOp;

/// Parses PromQL text into a query tree.
///
/// # Errors
///
/// Returns [`AuthError::Parse`] for invalid PromQL, or
/// [`AuthError::UnsupportedExpression`] for parser extensions.
pub fn parse(query: &str) -> Result<Expr, AuthError> {
    let expr = parser::parse(query).map_err(AuthError::Parse)?;
    lower(expr)
}

/// Parses `query` and returns the source ids it reads.
///
/// # Errors
///
/// Any error from [`parse`] or [`QueryAuthorizer::extract_source_ids`].
pub fn extract_source_ids(query: &str) -> Result<BTreeSet<String>, AuthError> {
    QueryAuthorizer::default().extract_source_ids(&parse(query)?)
}

fn lower(expr: PromExpr) -> Result<Expr, AuthError> {
    Ok(match expr {
        PromExpr::VectorSelector(vs) => Expr::VectorSelector(lower_selector(vs)),
        PromExpr::MatrixSelector(ms) => Expr::MatrixSelector {
            selector: lower_selector(ms.vs),
            range: ms.range,
        },
        PromExpr::Aggregate(agg) => Expr::Aggregate {
            op: agg.op.to_string(),
            expr: Box::new(lower(*agg.expr)?),
            param: agg.param.map(|p| lower(*p).map(Box::new)).transpose()?,
        },
        PromExpr::Binary(bin) => Expr::Binary {
            op: bin.op.to_string(),
            lhs: Box::new(lower(*bin.lhs)?),
            rhs: Box::new(lower(*bin.rhs)?),
        },
        PromExpr::Unary(unary) => Expr::Unary(Box::new(lower(*unary.expr)?)),
        PromExpr::Paren(paren) => Expr::Paren(Box::new(lower(*paren.expr)?)),
        PromExpr::Subquery(sub) => Expr::Subquery {
            expr: Box::new(lower(*sub.expr)?),
            range: sub.range,
            step: sub.step,
        },
        PromExpr::Call(call) => Expr::Call {
            func: call.func.name.to_string(),
            args: call
                .args
                .args
                .into_iter()
                .map(|arg| lower(*arg))
                .collect::<Result<_, _>>()?,
        },
        PromExpr::NumberLiteral(lit) => Expr::NumberLiteral(lit.val),
        PromExpr::StringLiteral(lit) => Expr::StringLiteral(lit.val),
        other => return Err(AuthError::UnsupportedExpression(other.to_string())),
    })
}

fn lower_selector(vs: VectorSelector) -> Selector {
    let Matchers {
        matchers,
        or_matchers,
        ..
    } = vs.matchers;
    Selector {
        metric_name: vs.name,
        matchers: matchers.into_iter().map(lower_matcher).collect(),
        or_matchers: or_matchers
            .into_iter()
            .map(|group| group.into_iter().map(lower_matcher).collect())
            .collect(),
    }
}

fn lower_matcher(m: PromMatcher) -> Matcher {
    let op = match m.op {
        PromMatchOp::Equal => MatchOp::Equal,
        PromMatchOp::NotEqual => MatchOp::NotEqual,
        PromMatchOp::Re(_) => MatchOp::Regex,
        PromMatchOp::NotRe(_) => MatchOp::NotRegex,
    };
    Matcher::new(m.name, op, m.value)
}
