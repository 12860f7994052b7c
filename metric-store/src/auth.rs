//! Tenant scoping for queries.
//!
//! Every series-selecting term of a query must be pinned to one or more
//! tenants by an exact, non-empty `source_id` equality matcher. The
//! [`QueryAuthorizer`] walks a parsed query, collects those tenants and
//! rejects queries that could read beyond them:
//!
//! - a regex matcher (`=~`, `!~`) on `source_id` yields
//!   [`AuthError::RegexNotAllowed`];
//! - a selector, or any `or` alternative of one, without a scoping matcher
//!   yields [`AuthError::UnscopedSelector`].
//!
//! Negative equality (`source_id!="x"`) selects every other tenant, so it
//! never scopes a term.
//!
//! # Example
//!
//! ```rust
//! use metric_store::ast::{Expr, Selector};
//! use metric_store::auth::QueryAuthorizer;
//! use metric_store::query::MatchOp;
//!
//! let expr = Expr::binary(
//!     "+",
//!     Expr::vector(Selector::metric("cpu").with("source_id", MatchOp::Equal, "app-1")),
//!     Expr::vector(Selector::metric("cpu").with("source_id", MatchOp::Equal, "app-2")),
//! );
//! let ids = QueryAuthorizer::default().extract_source_ids(&expr).unwrap();
//! assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["app-1", "app-2"]);
//! ```

use std::collections::BTreeSet;

use crate::ast::QueryNode;
use crate::error::AuthError;
use crate::point::SOURCE_ID_LABEL;
use crate::query::MatchOp;

/// Extracts and checks the tenants a query reads.
#[derive(Debug, Clone)]
pub struct QueryAuthorizer {
    scope_label: String,
}

impl Default for QueryAuthorizer {
    fn default() -> Self {
        Self::new(SOURCE_ID_LABEL)
    }
}

impl QueryAuthorizer {
    /// An authorizer that scopes on `scope_label`.
    pub fn new(scope_label: impl Into<String>) -> Self {
        Self {
            scope_label: scope_label.into(),
        }
    }

    /// The label that identifies a tenant.
    pub fn scope_label(&self) -> &str {
        &self.scope_label
    }

    /// Returns every tenant the query reads, deduplicated and sorted.
    ///
    /// Nodes are visited in pre-order and the first violation wins. On
    /// success the set is never empty: a query that selects no series at all
    /// (a bare literal) is unscoped too.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RegexNotAllowed`] or
    /// [`AuthError::UnscopedSelector`] as described in the module docs.
    pub fn extract_source_ids<N: QueryNode>(&self, root: &N) -> Result<BTreeSet<String>, AuthError> {
        let mut ids = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if let Some(selector) = node.selector() {
                for group in selector.matcher_groups() {
                    let mut scoped = false;
                    for matcher in group.into_iter().filter(|m| m.name == self.scope_label) {
                        match matcher.op {
                            MatchOp::Regex | MatchOp::NotRegex => {
                                return Err(AuthError::RegexNotAllowed);
                            }
                            MatchOp::Equal if !matcher.value.is_empty() => {
                                ids.insert(matcher.value.clone());
                                scoped = true;
                            }
                            MatchOp::Equal | MatchOp::NotEqual => {}
                        }
                    }
                    if !scoped {
                        return Err(AuthError::UnscopedSelector);
                    }
                }
            }
            let children = node.children();
            stack.extend(children.into_iter().rev());
        }
        if ids.is_empty() {
            return Err(AuthError::UnscopedSelector);
        }
        Ok(ids)
    }

    /// Checks that every tenant the query reads is in `allowed`.
    ///
    /// Returns the tenants read on success.
    ///
    /// # Errors
    ///
    /// Any error from [`QueryAuthorizer::extract_source_ids`], or
    /// [`AuthError::Forbidden`] naming the first (in sorted order) tenant
    /// outside `allowed`.
    pub fn authorize<N, S>(&self, root: &N, allowed: &[S]) -> Result<BTreeSet<String>, AuthError>
    where
        N: QueryNode,
        S: AsRef<str>,
    {
        let ids = self.extract_source_ids(root)?;
        if let Some(denied) = ids
            .iter()
            .find(|id| !allowed.iter().any(|a| a.as_ref() == id.as_str()))
        {
            tracing::debug!(source_id = %denied, "query denied");
            return Err(AuthError::Forbidden {
                source_id: denied.clone(),
            });
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ast::{Expr, Matcher, Selector};

    fn scoped(metric: &str, source: &str) -> Selector {
        Selector::metric(metric).with("source_id", MatchOp::Equal, source)
    }

    fn extract(expr: &Expr) -> Result<Vec<String>, AuthError> {
        QueryAuthorizer::default()
            .extract_source_ids(expr)
            .map(|ids| ids.into_iter().collect())
    }

    #[test]
    fn test_single_selector() {
        let expr = Expr::vector(scoped("cpu", "app-1"));
        assert_eq!(extract(&expr).unwrap(), vec!["app-1"]);
    }

    #[test]
    fn test_ids_are_deduplicated() {
        let expr = Expr::binary(
            "/",
            Expr::vector(scoped("a", "x")),
            Expr::binary("+", Expr::vector(scoped("b", "x")), Expr::vector(scoped("c", "y"))),
        );
        assert_eq!(extract(&expr).unwrap(), vec!["x", "y"]);
    }

    #[test]
    fn test_nested_functions_and_aggregations() {
        let expr = Expr::aggregate(
            "sum",
            Expr::call(
                "rate",
                vec![Expr::matrix(scoped("http", "svc"), Duration::from_secs(300))],
            ),
        );
        assert_eq!(extract(&expr).unwrap(), vec!["svc"]);
    }

    #[test]
    fn test_regex_rejected() {
        for op in [MatchOp::Regex, MatchOp::NotRegex] {
            let expr = Expr::vector(Selector::metric("cpu").with("source_id", op, "app-.*"));
            assert_eq!(extract(&expr), Err(AuthError::RegexNotAllowed));
        }
    }

    #[test]
    fn test_regex_rejected_even_with_equality() {
        let expr = Expr::vector(
            scoped("cpu", "app-1").with("source_id", MatchOp::Regex, "app-.*"),
        );
        assert_eq!(extract(&expr), Err(AuthError::RegexNotAllowed));
    }

    #[test]
    fn test_regex_on_other_labels_allowed() {
        let expr = Expr::vector(scoped("cpu", "app-1").with("env", MatchOp::Regex, "prod|dev"));
        assert_eq!(extract(&expr).unwrap(), vec!["app-1"]);
    }

    #[test]
    fn test_unscoped_terms_rejected() {
        let cases = [
            Expr::vector(Selector::metric("cpu")),
            Expr::vector(Selector::metric("cpu").with("source_id", MatchOp::Equal, "")),
            Expr::vector(Selector::metric("cpu").with("source_id", MatchOp::NotEqual, "a")),
            Expr::binary("+", Expr::vector(scoped("a", "x")), Expr::vector(Selector::metric("b"))),
        ];
        for expr in &cases {
            assert_eq!(extract(expr), Err(AuthError::UnscopedSelector), "{expr:?}");
        }
    }

    #[test]
    fn test_each_or_alternative_must_be_scoped() {
        let both = Selector::metric("cpu")
            .or(vec![Matcher::new("source_id", MatchOp::Equal, "a")])
            .or(vec![Matcher::new("source_id", MatchOp::Equal, "b")]);
        assert_eq!(extract(&Expr::vector(both)).unwrap(), vec!["a", "b"]);

        let one = Selector::metric("cpu")
            .or(vec![Matcher::new("source_id", MatchOp::Equal, "a")])
            .or(vec![Matcher::new("env", MatchOp::Equal, "prod")]);
        assert_eq!(extract(&Expr::vector(one)), Err(AuthError::UnscopedSelector));
    }

    #[test]
    fn test_literal_only_query_is_unscoped() {
        assert_eq!(
            extract(&Expr::NumberLiteral(1.0)),
            Err(AuthError::UnscopedSelector)
        );
        let expr = Expr::binary("*", Expr::vector(scoped("a", "x")), Expr::NumberLiteral(2.0));
        assert_eq!(extract(&expr).unwrap(), vec!["x"]);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            AuthError::RegexNotAllowed.to_string(),
            "regular expressions are unavailable on source ids"
        );
        assert_eq!(
            AuthError::UnscopedSelector.to_string(),
            "one or more terms lack a sourceId"
        );
    }

    #[test]
    fn test_authorize_checks_allowed_set() {
        let expr = Expr::binary(
            "+",
            Expr::vector(scoped("a", "x")),
            Expr::vector(scoped("b", "y")),
        );
        let auth = QueryAuthorizer::default();
        assert!(auth.authorize(&expr, &["x", "y", "z"]).is_ok());
        assert_eq!(
            auth.authorize(&expr, &["x"]),
            Err(AuthError::Forbidden {
                source_id: "y".to_string()
            })
        );
    }

    #[test]
    fn test_custom_scope_label() {
        let expr = Expr::vector(Selector::metric("cpu").with("tenant", MatchOp::Equal, "t1"));
        let ids = QueryAuthorizer::new("tenant").extract_source_ids(&expr).unwrap();
        assert!(ids.contains("t1"));
    }
}
