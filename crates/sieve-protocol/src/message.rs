//! Control request and response types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Requests accepted on the control socket, dispatched on `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Reload configuration and replace the named workers.
    ///
    /// An empty list means every worker that was added or removed.
    UpdateFilters {
        #[serde(default)]
        filters: Vec<String>,
    },

    /// Collect a status document from every worker.
    Monitor {
        /// Process fields to sample instead of the configured ones
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proc_stats: Option<Vec<String>>,
    },

    /// Any other or missing `type`; answered with an empty object.
    #[serde(other)]
    Unknown,
}

impl ControlRequest {
    /// Interprets a received document. Never fails: anything that is not
    /// a well formed known request is `Unknown`.
    pub fn from_value(doc: Value) -> Self {
        serde_json::from_value(doc).unwrap_or(Self::Unknown)
    }

    /// Creates an update request.
    pub fn update_filters(filters: Vec<String>) -> Self {
        Self::UpdateFilters { filters }
    }

    /// Creates a monitor request.
    pub fn monitor(proc_stats: Option<Vec<String>>) -> Self {
        Self::Monitor { proc_stats }
    }
}

/// A per-worker failure reported by an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterError {
    pub filter: String,
    pub error: String,
}

impl FilterError {
    pub fn new(filter: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            error: error.into(),
        }
    }
}

/// Answer to `update_filters`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum UpdateResponse {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "KO")]
    Ko { errors: Vec<FilterError> },
}

impl UpdateResponse {
    /// OK when no worker failed, KO with the failures otherwise.
    pub fn from_errors(errors: Vec<FilterError>) -> Self {
        if errors.is_empty() {
            Self::Ok
        } else {
            Self::Ko { errors }
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Answer to `monitor`: worker name to status document.
pub type MonitorReport = Map<String, Value>;

/// Status document for a worker whose monitoring socket cannot be reached.
pub fn unreachable_status() -> Value {
    let mut doc = Map::new();
    doc.insert("status".to_string(), Value::String("error".to_string()));
    Value::Object(doc)
}

/// Answer to an unknown request.
pub fn empty_response() -> Value {
    Value::Object(Map::new())
}
