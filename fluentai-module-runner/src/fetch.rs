//! Fetch results and the fetch-function seam

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// How an externalized module is authored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleKind {
    /// Declares its exports statically
    Module,
    /// Attaches its exports to a single object at run time
    DynamicObject,
    /// Provided by the host itself
    Builtin,
    /// Delivered over the network
    Network,
}

/// What the build pipeline decided for a request id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FetchResult {
    /// Left untransformed; the runner loads it natively
    External {
        /// Opaque location handed to the runner
        externalize: String,
        /// Authoring convention, when known
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        kind: Option<ModuleKind>,
    },

    /// Transformed code to execute in the runtime
    Inline {
        /// Transformed code
        #[serde(default)]
        code: Option<String>,
        /// Original file path
        #[serde(default)]
        file: Option<String>,
    },
}

impl FetchResult {
    /// An externalized result
    pub fn external(locator: impl Into<String>, kind: Option<ModuleKind>) -> Self {
        FetchResult::External {
            externalize: locator.into(),
            kind,
        }
    }

    /// A transformed-code result
    pub fn inline(code: impl Into<String>, file: impl Into<String>) -> Self {
        FetchResult::Inline {
            code: Some(code.into()),
            file: Some(file.into()),
        }
    }

    /// Original file path, if the pipeline reported one
    pub fn file(&self) -> Option<&str> {
        match self {
            FetchResult::Inline { file, .. } => file.as_deref(),
            FetchResult::External { .. } => None,
        }
    }

    /// Transformed code, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            FetchResult::Inline { code, .. } => code.as_deref(),
            FetchResult::External { .. } => None,
        }
    }

    /// Whether the module is loaded natively by the runner
    pub fn is_externalized(&self) -> bool {
        matches!(self, FetchResult::External { .. })
    }

    /// Module kind of an externalized result
    pub fn kind(&self) -> Option<ModuleKind> {
        match self {
            FetchResult::External { kind, .. } => *kind,
            FetchResult::Inline { .. } => None,
        }
    }
}

/// A fetch result bound to its canonical module id
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResult {
    /// Canonical module id
    pub id: String,
    /// The pipeline's decision
    pub result: FetchResult,
}

impl ResolvedResult {
    /// Whether the module is loaded natively by the runner
    pub fn is_externalized(&self) -> bool {
        self.result.is_externalized()
    }
}

/// Resolves request ids to transformed code or externalization decisions.
///
/// Must be idempotent for a given `(id, importer)` pair.
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    /// Fetch the module for `id`, as requested by `importer`
    async fn fetch_module(&self, id: &str, importer: Option<&str>) -> Result<FetchResult>;
}

#[async_trait]
impl<F, Fut> ModuleFetcher for F
where
    F: Fn(String, Option<String>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<FetchResult>> + Send + 'static,
{
    async fn fetch_module(&self, id: &str, importer: Option<&str>) -> Result<FetchResult> {
        (self)(id.to_string(), importer.map(str::to_string)).await
    }
}
