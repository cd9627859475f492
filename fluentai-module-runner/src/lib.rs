//! FluentAi Module Runner
//!
//! This crate executes modules that an external build pipeline has already
//! transformed, without relying on a native module loader:
//! - Concurrent loads of one module share a single execution
//! - Import edges are discovered at run time and drive selective invalidation
//! - Circular imports observe partially initialized namespaces
//! - Hot module reload payloads are applied strictly in order
//!
//! ```no_run
//! use fluentai_module_runner::{FetchResult, Runtime, RuntimeOptions, ScriptRunner};
//!
//! # async fn demo() -> fluentai_module_runner::Result<()> {
//! let fetcher = |id: String, _importer: Option<String>| async move {
//!     Ok::<_, fluentai_module_runner::ModuleError>(FetchResult::inline(
//!         r#"[{"op": "export", "name": "answer", "value": 42}]"#,
//!         id,
//!     ))
//! };
//! let runtime = Runtime::new(RuntimeOptions::new(fetcher), ScriptRunner::new());
//! let exports = runtime.execute_entrypoint("/main.ts").await?;
//! assert_eq!(exports.get_json("answer")?, Some(serde_json::json!(42)));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod context;
pub mod error;
pub mod fetch;
pub mod hmr;
pub mod runner;
pub mod runtime;
pub mod source_map;
pub mod utils;
pub mod value;

pub use cache::{ModuleCache, ModuleEntry, PendingExecution};
pub use context::{ImportMeta, ImportMetadata, ModuleContext};
pub use error::{ModuleError, Result};
pub use fetch::{FetchResult, ModuleFetcher, ModuleKind, ResolvedResult};
pub use hmr::{HmrClient, HmrConnection, HmrPayload, HotContext, MemoryConnection};
pub use runner::{ModuleRunner, NativeRunner, ScriptRunner};
pub use runtime::{Runtime, RuntimeOptions};
pub use source_map::DecodedMap;
pub use value::{ModuleValue, Namespace};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Module runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Project root; paths under it become root-relative module ids
    pub root: String,

    /// Values exposed through `import.meta.env`, on top of the defaults
    pub environment_variables: FxHashMap<String, serde_json::Value>,

    /// Warn when a module takes longer than this to load
    pub slow_module_threshold_ms: Option<u64>,

    /// Module ids containing this fragment survive a full reload
    pub dependency_boundary: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: "/".to_string(),
            environment_variables: FxHashMap::default(),
            slow_module_threshold_ms: Some(2000),
            dependency_boundary: "node_modules".to_string(),
        }
    }
}
