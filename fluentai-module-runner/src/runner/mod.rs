//! Pluggable module runners
//!
//! A runner executes one unit of transformed code against a
//! [`ModuleContext`] and loads modules the build pipeline left
//! untransformed. Two runners ship with the crate:
//!
//! - [`NativeRunner`]: module bodies are Rust closures registered by code key
//! - [`ScriptRunner`]: module code is a JSON statement list

pub mod interop;
pub mod native;
pub mod script;

pub use native::NativeRunner;
pub use script::{ScriptRunner, Statement};

use crate::context::{ImportMetadata, ModuleContext};
use crate::fetch::ResolvedResult;
use crate::value::Namespace;
use crate::Result;
use async_trait::async_trait;

/// Executes modules inside a host sandbox
#[async_trait]
pub trait ModuleRunner: Send + Sync {
    /// Execute transformed `code`.
    ///
    /// Mutations of `context.exports` become the module's public exports.
    /// The export object must only be frozen once execution completes.
    async fn run_module(&self, context: ModuleContext, code: &str) -> Result<()>;

    /// Load an externalized module through the host's own mechanism
    async fn run_external_module(&self, locator: &str, metadata: &ImportMetadata) -> Result<Namespace>;

    /// Adapt an imported namespace before the importer sees it
    fn process_import(
        &self,
        namespace: Namespace,
        _fetched: &ResolvedResult,
        _metadata: &ImportMetadata,
    ) -> Result<Namespace> {
        Ok(namespace)
    }
}
