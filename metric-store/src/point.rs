//! Point and batch types: the unit of ingestion.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Label name that scopes a point to a tenant.
pub const SOURCE_ID_LABEL: &str = "source_id";

/// Reserved matcher name that addresses a series' metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A single timestamped measurement.
///
/// Labels are kept in a sorted map so two points built with the same labels
/// in a different order compare equal and encode identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Tenant the point belongs to.
    pub source_id: String,
    /// Metric name, e.g. `cpu`.
    pub metric_name: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Sample value.
    pub value: f64,
    /// Additional dimensions. A `source_id` entry here is shadowed by the field.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Point {
    /// Creates a point with no extra labels.
    pub fn new(
        source_id: impl Into<String>,
        metric_name: impl Into<String>,
        timestamp: i64,
        value: f64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            metric_name: metric_name.into(),
            timestamp,
            value,
            labels: BTreeMap::new(),
        }
    }

    /// Adds a label, returning the updated point.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// An ordered group of points sent as one frame.
///
/// Points need not be in timestamp order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch {
    /// The points, in send order.
    pub points: Vec<Point>,
}

impl Batch {
    /// Creates a batch from points.
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Number of points in the batch.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the batch carries no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl From<Vec<Point>> for Batch {
    fn from(points: Vec<Point>) -> Self {
        Self::new(points)
    }
}

impl FromIterator<Point> for Batch {
    fn from_iter<I: IntoIterator<Item = Point>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
