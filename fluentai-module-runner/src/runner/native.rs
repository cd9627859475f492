//! Runner whose modules are Rust closures

use crate::context::{ImportMetadata, ModuleContext};
use crate::fetch::ResolvedResult;
use crate::runner::{interop, ModuleRunner};
use crate::value::Namespace;
use crate::{ModuleError, Result};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::trace;

/// A module body
pub type ModuleBody = Arc<dyn Fn(ModuleContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Executes module bodies registered under the code string the fetch
/// function returns for them.
///
/// Clones share their registries, so bodies may be registered after the
/// runner has been handed to a runtime.
#[derive(Clone, Default)]
pub struct NativeRunner {
    modules: Arc<RwLock<FxHashMap<String, ModuleBody>>>,
    externals: Arc<RwLock<FxHashMap<String, Namespace>>>,
}

impl NativeRunner {
    /// Create a runner with empty registries
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the body executed for `code`
    pub fn register<F, Fut>(&self, code: &str, body: F)
    where
        F: Fn(ModuleContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let body: ModuleBody = Arc::new(move |context| body(context).boxed());
        self.modules.write().insert(code.to_string(), body);
    }

    /// Provide the namespace of an externalized module
    pub fn provide(&self, locator: &str, namespace: Namespace) {
        self.externals.write().insert(locator.to_string(), namespace);
    }
}

#[async_trait]
impl ModuleRunner for NativeRunner {
    async fn run_module(&self, context: ModuleContext, code: &str) -> Result<()> {
        let body = self.modules.read().get(code).cloned().ok_or_else(|| {
            ModuleError::execution(&context.module_id, format!("no module body registered for {:?}", code))
        })?;

        let exports = context.exports.clone();
        body(context).await?;
        exports.freeze();
        Ok(())
    }

    async fn run_external_module(&self, locator: &str, _metadata: &ImportMetadata) -> Result<Namespace> {
        trace!("Loading external module {}", locator);
        self.externals
            .read()
            .get(locator)
            .cloned()
            .ok_or_else(|| ModuleError::ExternalNotFound {
                locator: locator.to_string(),
            })
    }

    fn process_import(
        &self,
        namespace: Namespace,
        fetched: &ResolvedResult,
        metadata: &ImportMetadata,
    ) -> Result<Namespace> {
        interop::process_import(namespace, fetched, metadata)
    }
}
