//! HMR payloads delivered by the connection

use crate::{ModuleError, Result};
use serde::{Deserialize, Serialize};

/// Kind of a single hot update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateKind {
    /// A module update
    JsUpdate,
    /// A stylesheet update
    CssUpdate,
}

/// One module affected by an `update` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    /// Update kind
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    /// Module owning the accept callbacks
    pub path: String,
    /// Module that changed and gets re-executed
    pub accepted_path: String,
    /// Server timestamp of the change
    #[serde(default)]
    pub timestamp: u64,
    /// Whether importers must re-import explicitly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_import_required: Option<bool>,
    /// Extra files invalidated together with the accepted module
    #[serde(default, alias = "ssrInvalidates", skip_serializing_if = "Vec::is_empty")]
    pub invalidates: Vec<String>,
}

impl Update {
    /// A module update where `path` accepts `accepted_path`
    pub fn js(path: impl Into<String>, accepted_path: impl Into<String>) -> Self {
        Self {
            kind: UpdateKind::JsUpdate,
            path: path.into(),
            accepted_path: accepted_path.into(),
            timestamp: 0,
            explicit_import_required: None,
            invalidates: Vec::new(),
        }
    }
}

/// Error reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error message
    pub message: String,
    /// Stack trace, when available
    #[serde(default)]
    pub stack: String,
}

/// A message from the HMR connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HmrPayload {
    /// The connection was (re)established
    Connected,

    /// Modules changed and should be hot updated
    Update {
        /// Affected modules, in server order
        updates: Vec<Update>,
    },

    /// An application-defined event
    Custom {
        /// Event name
        event: String,
        /// Event data
        #[serde(default)]
        data: serde_json::Value,
    },

    /// Every entry point must be re-executed
    FullReload {
        /// Originating page path
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        /// File whose change triggered the reload
        #[serde(default, rename = "triggeredBy", skip_serializing_if = "Option::is_none")]
        triggered_by: Option<String>,
    },

    /// Modules are no longer imported and should be dropped
    Prune {
        /// Module ids to drop
        paths: Vec<String>,
    },

    /// The server failed to process a change
    Error {
        /// The error
        err: ErrorPayload,
    },
}

const PAYLOAD_TYPES: &[&str] = &["connected", "update", "custom", "full-reload", "prune", "error"];

impl HmrPayload {
    /// Decode a payload from its JSON wire form
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ModuleError::Hmr {
                message: format!("malformed payload: {}", e),
            })?;

        let kind = value
            .get("type")
            .and_then(|kind| kind.as_str())
            .unwrap_or_default()
            .to_string();
        if !PAYLOAD_TYPES.contains(&kind.as_str()) {
            return Err(ModuleError::UnknownPayload {
                message: format!("unrecognized payload type {:?}", kind),
            });
        }

        serde_json::from_value(value).map_err(|e| ModuleError::Hmr {
            message: format!("malformed {} payload: {}", kind, e),
        })
    }

    /// Encode this payload to its JSON wire form
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ModuleError::Hmr {
            message: e.to_string(),
        })
    }
}
