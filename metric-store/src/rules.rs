//! Client for the external rules API.
//!
//! Rule managers group recording and alerting rules per tenant. This module
//! only talks to the API that owns them; evaluating rules is out of scope.
//!
//! This module is only available when the `remote-rules` feature is enabled.
//!
//! # Example
//!
//! ```rust,no_run
//! use metric_store::rules::{RemoteRuleManager, RuleManager, RuleManagerConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RuleManagerConfig::new("http://localhost:8080");
//! let rules = RemoteRuleManager::new(config)?;
//! rules.create_manager("app-metrics", Some("http://alertmanager:9093"))?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::error::RuleError;

/// Operations on remote rule managers.
pub trait RuleManager {
    /// Creates a manager.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::AlreadyExists`] if the id is taken, or another
    /// [`RuleError`] if the request fails.
    fn create_manager(&self, id: &str, alertmanager_url: Option<&str>) -> Result<(), RuleError>;

    /// Deletes a manager and all its rule groups.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError`] if the request fails.
    fn delete_manager(&self, id: &str) -> Result<(), RuleError>;

    /// Creates or replaces a rule group in a manager.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError`] if the request fails.
    fn upsert_rule_group(&self, manager_id: &str, group: &RuleGroup) -> Result<(), RuleError>;
}

/// A named set of rules evaluated together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGroup {
    /// Group name, unique within a manager.
    pub name: String,
    /// Evaluation interval, e.g. `"1m"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// The rules.
    pub rules: Vec<Rule>,
}

/// A recording or alerting rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Output series name for a recording rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    /// Alert name for an alerting rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    /// PromQL expression.
    pub expr: String,
    /// How long the condition must hold before an alert fires.
    #[serde(default, rename = "for", skip_serializing_if = "Option::is_none")]
    pub for_duration: Option<String>,
    /// Extra labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Alert annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Serialize)]
struct ManagerData<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    alertmanager_url: Option<&'a str>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    title: String,
}

/// Connection settings for [`RemoteRuleManager`].
#[derive(Debug, Clone)]
pub struct RuleManagerConfig {
    /// Base URL of the rules API, e.g. `http://localhost:8080`.
    pub base_url: String,
    /// Path prefix before `/rules`, e.g. `/private`.
    pub path_prefix: String,
    /// HTTP timeout per request.
    pub timeout: Duration,
    /// Extra HTTP headers (e.g., for authentication).
    pub headers: Vec<(String, String)>,
    /// Whether to honor `HTTP_PROXY`-style environment variables.
    pub system_proxy: bool,
}

impl RuleManagerConfig {
    /// Creates a config with a 10s timeout and no prefix.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path_prefix: String::new(),
            timeout: Duration::from_secs(10),
            headers: Vec::new(),
            system_proxy: true,
        }
    }

    /// Sets the path prefix.
    #[must_use]
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = prefix.into();
        self
    }

    /// Adds an HTTP header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the HTTP timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enables or disables proxies taken from the environment.
    #[must_use]
    pub fn with_system_proxy(mut self, enabled: bool) -> Self {
        self.system_proxy = enabled;
        self
    }
}

/// [`RuleManager`] backed by the rules HTTP API.
#[derive(Debug, Clone)]
pub struct RemoteRuleManager {
    config: RuleManagerConfig,
    client: Client,
}

impl RemoteRuleManager {
    /// Builds the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::ClientCreate`] if the client cannot be built.
    pub fn new(config: RuleManagerConfig) -> Result<Self, RuleError> {
        let mut builder = Client::builder().timeout(config.timeout);
        if !config.system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| RuleError::ClientCreate { source: e })?;
        Ok(Self { config, client })
    }

    /// Joins `segments` onto the base URL and prefix, percent-encoding each.
    fn url(&self, segments: &[&str]) -> Result<Url, RuleError> {
        let base = format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.path_prefix
        );
        let invalid = |reason: String| RuleError::InvalidUrl {
            url: base.clone(),
            reason,
        };
        let mut url = Url::parse(&base).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn send(&self, request: RequestBuilder) -> Result<(StatusCode, String), RuleError> {
        let request = self
            .config
            .headers
            .iter()
            .fold(request, |r, (name, value)| r.header(name, value));
        let response: Response = request
            .send()
            .map_err(|e| RuleError::Transport { source: e })?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| RuleError::Transport { source: e })?;
        Ok((status, body))
    }
}

impl RuleManager for RemoteRuleManager {
    fn create_manager(&self, id: &str, alertmanager_url: Option<&str>) -> Result<(), RuleError> {
        let payload = Envelope {
            data: ManagerData {
                id,
                alertmanager_url,
            },
        };
        let url = self.url(&["rules", "manager"])?;
        let (status, body) = self.send(self.client.post(url).json(&payload))?;
        classify_create_response(id, status.as_u16(), &body)?;
        tracing::info!(manager = id, "created rule manager");
        Ok(())
    }

    fn delete_manager(&self, id: &str) -> Result<(), RuleError> {
        let url = self.url(&["rules", "manager", id])?;
        let (status, body) = self.send(self.client.delete(url))?;
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }
        tracing::info!(manager = id, "deleted rule manager");
        Ok(())
    }

    fn upsert_rule_group(&self, manager_id: &str, group: &RuleGroup) -> Result<(), RuleError> {
        let url = self.url(&["rules", "manager", manager_id, "group"])?;
        let payload = Envelope { data: group };
        let (status, body) = self.send(self.client.post(url).json(&payload))?;
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }
        tracing::debug!(manager = manager_id, group = %group.name, "upserted rule group");
        Ok(())
    }
}

/// Maps a create-manager response to a result.
///
/// A success status whose body still carries errors is treated as a
/// conflict: the API reports duplicate managers that way.
///
/// # Errors
///
/// Returns [`RuleError::AlreadyExists`] for 409 or a success status with an
/// error body, and [`RuleError::Api`] for any other failure status.
pub fn classify_create_response(id: &str, status: u16, body: &str) -> Result<(), RuleError> {
    if status == StatusCode::CONFLICT.as_u16() {
        return Err(RuleError::AlreadyExists { id: id.to_string() });
    }
    if (200..300).contains(&status) {
        let errors = parse_errors(body);
        if errors.errors.is_empty() {
            return Ok(());
        }
        tracing::warn!(
            manager = id,
            status,
            title = %errors.errors[0].title,
            "rules API reported errors on a success status"
        );
        return Err(RuleError::AlreadyExists { id: id.to_string() });
    }
    Err(api_error(status, body))
}

fn parse_errors(body: &str) -> ErrorBody {
    serde_json::from_str(body).unwrap_or_default()
}

fn api_error(status: u16, body: &str) -> RuleError {
    let title = parse_errors(body)
        .errors
        .into_iter()
        .map(|e| e.title)
        .find(|t| !t.is_empty())
        .unwrap_or_else(|| body.trim().to_string());
    RuleError::Api { status, title }
}
