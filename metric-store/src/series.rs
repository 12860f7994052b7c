//! Series identity and the per-shard series index.
//!
//! A series is one metric name plus one full label set, `source_id`
//! included. Every shard keeps a [`SeriesIndex`] that assigns dense ids to
//! the series it has seen, so samples can be stored in columns and matchers
//! are evaluated once per series rather than once per point.
//!
//! # Example
//!
//! ```rust
//! use metric_store::point::Point;
//! use metric_store::series::{SeriesIndex, SeriesKey};
//!
//! let mut index = SeriesIndex::new();
//! let key = SeriesKey::from_point(&Point::new("app-1", "cpu", 0, 1.0).with_label("env", "prod"));
//! let id = index.get_or_insert(&key);
//! assert_eq!(index.get_or_insert(&key), id);
//! assert_eq!(key.label("source_id"), "app-1");
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::point::{METRIC_NAME_LABEL, Point, SOURCE_ID_LABEL};
use crate::query::LabelMatcher;

/// Dense id of a series within one shard.
pub type SeriesId = u32;

/// Identity of a time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    /// The metric name.
    pub metric_name: String,
    /// All labels, sorted, including `source_id`.
    pub labels: BTreeMap<String, String>,
}

impl SeriesKey {
    /// Builds the key a point is stored under.
    ///
    /// The point's `source_id` field overrides any `source_id` label.
    pub fn from_point(point: &Point) -> Self {
        let mut labels = point.labels.clone();
        labels.insert(SOURCE_ID_LABEL.to_string(), point.source_id.clone());
        Self {
            metric_name: point.metric_name.clone(),
            labels,
        }
    }

    /// Value of a label, with `__name__` resolving to the metric name.
    ///
    /// Absent labels read as the empty string, so `{env=""}` selects series
    /// without an `env` label.
    pub fn label(&self, name: &str) -> &str {
        if name == METRIC_NAME_LABEL {
            return &self.metric_name;
        }
        self.labels.get(name).map_or("", String::as_str)
    }

    /// The tenant this series belongs to.
    pub fn source_id(&self) -> &str {
        self.label(SOURCE_ID_LABEL)
    }

    /// Approximate heap footprint, used for index size reporting.
    pub fn size_bytes(&self) -> usize {
        self.metric_name.len()
            + self
                .labels
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// Assigns ids to series and answers matcher lookups.
#[derive(Debug, Clone, Default)]
pub struct SeriesIndex {
    ids: HashMap<SeriesKey, SeriesId>,
    keys: Vec<SeriesKey>,
}

impl SeriesIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `key`, assigning the next one if it is new.
    pub fn get_or_insert(&mut self, key: &SeriesKey) -> SeriesId {
        if let Some(&id) = self.ids.get(key) {
            return id;
        }
        // Shards rotate long before four billion series.
        #[allow(clippy::cast_possible_truncation)]
        let id = self.keys.len() as SeriesId;
        self.keys.push(key.clone());
        self.ids.insert(key.clone(), id);
        id
    }

    /// Looks up an existing series.
    pub fn get(&self, key: &SeriesKey) -> Option<SeriesId> {
        self.ids.get(key).copied()
    }

    /// The key for an id.
    pub fn key(&self, id: SeriesId) -> Option<&SeriesKey> {
        self.keys.get(id as usize)
    }

    /// Ids of every series satisfying all `matchers`.
    pub fn select(&self, matchers: &[LabelMatcher]) -> Vec<SeriesId> {
        self.keys
            .iter()
            .zip(0..)
            .filter(|(key, _)| matchers.iter().all(|m| m.matches(key)))
            .map(|(_, id)| id)
            .collect()
    }

    /// Number of distinct series.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the index holds no series.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterates keys in id order.
    pub fn keys(&self) -> impl Iterator<Item = &SeriesKey> {
        self.keys.iter()
    }

    /// Distinct metric names.
    pub fn metric_names(&self) -> BTreeSet<&str> {
        self.keys.iter().map(|k| k.metric_name.as_str()).collect()
    }

    /// Approximate heap footprint of the keys.
    pub fn size_bytes(&self) -> usize {
        self.keys.iter().map(SeriesKey::size_bytes).sum()
    }
}
