//! The context a runner executes module code against

use crate::hmr::{HmrClient, HotContext};
use crate::value::{ModuleValue, Namespace};
use crate::{ModuleError, Result};
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// How a module requested one of its imports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportMetadata {
    /// Named bindings the importer reads, when known
    pub imported_names: Option<Vec<String>>,
    /// Whether the import is deferred
    pub is_dynamic_import: bool,
    /// Whether the module is executed as an entry point
    pub entrypoint: bool,
}

impl ImportMetadata {
    /// A static import reading the given names
    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            imported_names: Some(names.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// A deferred import
    pub fn dynamic() -> Self {
        Self {
            is_dynamic_import: true,
            ..Self::default()
        }
    }

    /// Requested names, empty when none were declared
    pub fn names(&self) -> &[String] {
        self.imported_names.as_deref().unwrap_or_default()
    }
}

/// Future returned by import functions
pub type ImportFuture = BoxFuture<'static, Result<Namespace>>;

/// Imports a dependency of the executing module
pub type ImportFn = Arc<dyn Fn(String, ImportMetadata) -> ImportFuture + Send + Sync>;

/// Imports a dependency lazily, resolving relative specifiers against the
/// executing module
pub type DynamicImportFn = Arc<dyn Fn(String) -> ImportFuture + Send + Sync>;

/// Merges another module's bindings into the executing module's exports
pub type ExportAllFn = Arc<dyn Fn(&ModuleValue) + Send + Sync>;

#[derive(Clone)]
struct HotSlot {
    client: HmrClient,
    owner: String,
    context: Arc<OnceCell<HotContext>>,
}

/// Module metadata (`import.meta`)
#[derive(Clone)]
pub struct ImportMeta {
    /// Absolute path of the module file
    pub filename: String,
    /// Directory of the module file
    pub dirname: String,
    /// `file://` URL of the module file
    pub url: String,
    /// Environment variables
    pub env: Arc<serde_json::Map<String, Value>>,
    hot: Option<HotSlot>,
}

impl ImportMeta {
    /// Metadata for a module at `filename`
    pub fn new(
        filename: impl Into<String>,
        dirname: impl Into<String>,
        url: impl Into<String>,
        env: Arc<serde_json::Map<String, Value>>,
    ) -> Self {
        Self {
            filename: filename.into(),
            dirname: dirname.into(),
            url: url.into(),
            env,
            hot: None,
        }
    }

    /// Enable `hot` for the module `owner`
    pub fn with_hot(mut self, client: HmrClient, owner: impl Into<String>) -> Self {
        self.hot = Some(HotSlot {
            client,
            owner: owner.into(),
            context: Arc::new(OnceCell::new()),
        });
        self
    }

    /// The module's HMR handle, created on first access. `None` when hot
    /// reload is disabled.
    pub fn hot(&self) -> Option<HotContext> {
        let slot = self.hot.as_ref()?;
        let context = slot.context.get_or_init(|| {
            debug!("Creating hot context for {}", slot.owner);
            HotContext::new(&slot.client, &slot.owner)
        });
        Some(context.clone())
    }

    /// Read an environment variable
    pub fn env_var(&self, key: &str) -> Option<&Value> {
        self.env.get(key)
    }

    /// Resolution of specifiers at run time is not available
    pub fn resolve(&self, _specifier: &str) -> Result<String> {
        Err(ModuleError::Unsupported {
            feature: "import.meta.resolve".to_string(),
        })
    }

    /// Glob imports must be expanded by the build pipeline
    pub fn glob(&self, _pattern: &str) -> Result<Namespace> {
        Err(ModuleError::Unsupported {
            feature: "import.meta.glob".to_string(),
        })
    }
}

impl fmt::Debug for ImportMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportMeta")
            .field("filename", &self.filename)
            .field("dirname", &self.dirname)
            .field("url", &self.url)
            .field("hot", &self.hot.is_some())
            .finish()
    }
}

/// Everything a runner hands to module code
#[derive(Clone)]
pub struct ModuleContext {
    /// Canonical id of the executing module
    pub module_id: String,
    /// The module's export object
    pub exports: Namespace,
    /// Static import function
    pub import: ImportFn,
    /// Dynamic import function
    pub dynamic_import: DynamicImportFn,
    /// Export-all helper bound to `exports`
    pub export_all: ExportAllFn,
    /// `import.meta`
    pub meta: ImportMeta,
}

impl ModuleContext {
    /// Import a dependency for its side effects or whole namespace
    pub async fn import_module(&self, dep: &str) -> Result<Namespace> {
        (self.import)(dep.to_string(), ImportMetadata::default()).await
    }

    /// Import a dependency, declaring the bindings read from it
    pub async fn import_named(&self, dep: &str, names: &[&str]) -> Result<Namespace> {
        (self.import)(dep.to_string(), ImportMetadata::named(names.iter().copied())).await
    }

    /// Import a dependency lazily
    pub async fn import_dynamic(&self, dep: &str) -> Result<Namespace> {
        (self.dynamic_import)(dep.to_string()).await
    }

    /// Re-export every binding of `source`
    pub fn export_all_from(&self, source: &ModuleValue) {
        (self.export_all)(source)
    }

    /// Define an export
    pub fn export(&self, name: &str, value: impl Into<ModuleValue>) -> Result<()> {
        self.exports.set(name, value)
    }
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("module_id", &self.module_id)
            .field("exports", &self.exports)
            .field("meta", &self.meta)
            .finish()
    }
}
