//! Label matchers and query result types.
//!
//! A store query is a time range plus a conjunction of [`LabelMatcher`]s.
//! Results come back as a [`SeriesSet`]: one [`Series`] per matching series
//! key, each with its samples merged across shards and sorted by time.

use std::fmt;

use regex::Regex;
use serde::Serialize;

use crate::error::QueryError;
use crate::series::SeriesKey;

/// How a matcher compares a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MatchOp {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `=~`, anchored at both ends
    Regex,
    /// `!~`, anchored at both ends
    NotRegex,
}

impl MatchOp {
    /// Whether this operator takes a regular expression.
    pub fn is_regex(self) -> bool {
        matches!(self, Self::Regex | Self::NotRegex)
    }
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Regex => "=~",
            Self::NotRegex => "!~",
        })
    }
}

/// A single `name op value` constraint on a series.
#[derive(Debug, Clone)]
pub struct LabelMatcher {
    name: String,
    op: MatchOp,
    value: String,
    regex: Option<Regex>,
}

impl LabelMatcher {
    /// Builds a matcher, compiling the pattern for regex operators.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidRegex`] if the pattern does not compile.
    pub fn new(
        name: impl Into<String>,
        op: MatchOp,
        value: impl Into<String>,
    ) -> Result<Self, QueryError> {
        let name = name.into();
        let value = value.into();
        let regex = if op.is_regex() {
            let anchored = format!("^(?:{value})$");
            Some(Regex::new(&anchored).map_err(|e| QueryError::InvalidRegex {
                label: name.clone(),
                pattern: value.clone(),
                source: e,
            })?)
        } else {
            None
        };
        Ok(Self {
            name,
            op,
            value,
            regex,
        })
    }

    /// `name = value`
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Equal,
            value: value.into(),
            regex: None,
        }
    }

    /// `name != value`
    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::NotEqual,
            value: value.into(),
            regex: None,
        }
    }

    /// The label name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The operator.
    pub fn op(&self) -> MatchOp {
        self.op
    }

    /// The raw value or pattern.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Tests a series against this matcher.
    pub fn matches(&self, key: &SeriesKey) -> bool {
        let actual = key.label(&self.name);
        match (self.op, &self.regex) {
            (MatchOp::Equal, _) => actual == self.value,
            (MatchOp::NotEqual, _) => actual != self.value,
            (MatchOp::Regex, Some(re)) => re.is_match(actual),
            (MatchOp::NotRegex, Some(re)) => !re.is_match(actual),
            (MatchOp::Regex | MatchOp::NotRegex, None) => false,
        }
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

/// One timestamped value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// The value.
    pub value: f64,
}

/// All samples of one series within a query range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    /// Which series.
    pub key: SeriesKey,
    /// Samples sorted by timestamp.
    pub samples: Vec<Sample>,
}

/// The result of a store query, ordered by series key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesSet {
    /// Matching series.
    pub series: Vec<Series>,
}

impl SeriesSet {
    /// Number of series.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// Whether no series matched.
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Total samples across all series.
    pub fn sample_count(&self) -> usize {
        self.series.iter().map(|s| s.samples.len()).sum()
    }

    /// Iterates the series.
    pub fn iter(&self) -> std::slice::Iter<'_, Series> {
        self.series.iter()
    }
}

impl IntoIterator for SeriesSet {
    type Item = Series;
    type IntoIter = std::vec::IntoIter<Series>;

    fn into_iter(self) -> Self::IntoIter {
        self.series.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::Point;

    fn key(env: &str) -> SeriesKey {
        SeriesKey::from_point(&Point::new("app-1", "http_requests", 0, 0.0).with_label("env", env))
    }

    #[test]
    fn test_equality_matchers() {
        assert!(LabelMatcher::equal("env", "prod").matches(&key("prod")));
        assert!(!LabelMatcher::equal("env", "prod").matches(&key("staging")));
        assert!(LabelMatcher::not_equal("env", "prod").matches(&key("staging")));
        assert!(LabelMatcher::equal("__name__", "http_requests").matches(&key("prod")));
    }

    #[test]
    fn test_missing_label_matches_empty() {
        assert!(LabelMatcher::equal("zone", "").matches(&key("prod")));
        assert!(LabelMatcher::not_equal("zone", "a").matches(&key("prod")));
    }

    #[test]
    fn test_regex_is_anchored() {
        let m = LabelMatcher::new("env", MatchOp::Regex, "pro").unwrap();
        assert!(!m.matches(&key("prod")));

        let m = LabelMatcher::new("env", MatchOp::Regex, "prod|staging").unwrap();
        assert!(m.matches(&key("prod")));
        assert!(m.matches(&key("staging")));

        let m = LabelMatcher::new("env", MatchOp::NotRegex, "stag.*").unwrap();
        assert!(m.matches(&key("prod")));
        assert!(!m.matches(&key("staging")));
    }

    #[test]
    fn test_invalid_regex() {
        let err = LabelMatcher::new("env", MatchOp::Regex, "(").unwrap_err();
        assert!(matches!(err, QueryError::InvalidRegex { .. }));
    }

    #[test]
    fn test_display() {
        let m = LabelMatcher::new("env", MatchOp::NotRegex, "a.*").unwrap();
        assert_eq!(m.to_string(), r#"env!~"a.*""#);
    }
}
