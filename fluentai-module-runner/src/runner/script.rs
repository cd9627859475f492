//! Runner for JSON statement-list modules

use crate::context::{ImportMetadata, ModuleContext};
use crate::fetch::ResolvedResult;
use crate::runner::{interop, ModuleRunner};
use crate::value::{ModuleValue, Namespace};
use crate::{ModuleError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

/// One statement of a transformed module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Statement {
    /// Import a dependency and bind it locally
    Import {
        /// Request id of the dependency
        from: String,
        /// Local binding, defaults to `from`
        #[serde(rename = "as", default)]
        alias: Option<String>,
        /// Named bindings read from the dependency
        #[serde(default)]
        names: Vec<String>,
    },

    /// Import a dependency lazily and bind it locally
    DynamicImport {
        /// Specifier, relative to this module or absolute
        from: String,
        /// Local binding, defaults to `from`
        #[serde(rename = "as", default)]
        alias: Option<String>,
    },

    /// Export a value
    Export {
        /// Export name
        name: String,
        /// Exported value
        value: serde_json::Value,
    },

    /// Export a live binding of an imported module
    Reexport {
        /// Export name
        name: String,
        /// Local binding of the imported module
        from: String,
        /// Binding read from the imported module, defaults to `name`
        #[serde(default)]
        binding: Option<String>,
    },

    /// Re-export every binding of an imported module
    ExportAll {
        /// Local binding of the imported module
        from: String,
    },

    /// Accept hot updates of this module, or of the listed dependencies
    Accept {
        /// Dependencies to accept; empty accepts this module itself
        #[serde(default)]
        deps: Vec<String>,
    },

    /// Fail execution
    Fail {
        /// Error message
        message: String,
    },
}

/// Parse module code into statements
pub fn parse(module_id: &str, code: &str) -> Result<Vec<Statement>> {
    serde_json::from_str(code).map_err(|e| ModuleError::InvalidScript {
        id: module_id.to_string(),
        source: Arc::new(e),
    })
}

/// Executes modules written as JSON statement lists
#[derive(Clone, Default)]
pub struct ScriptRunner {
    externals: Arc<RwLock<FxHashMap<String, Namespace>>>,
}

impl ScriptRunner {
    /// Create a runner with no external modules
    pub fn new() -> Self {
        Self::default()
    }

    /// Provide the namespace of an externalized module
    pub fn provide(&self, locator: &str, namespace: Namespace) {
        self.externals.write().insert(locator.to_string(), namespace);
    }

    async fn execute(&self, context: &ModuleContext, statements: Vec<Statement>) -> Result<()> {
        let mut bindings: FxHashMap<String, Namespace> = FxHashMap::default();
        let binding = |bindings: &FxHashMap<String, Namespace>, name: &str| {
            bindings.get(name).cloned().ok_or_else(|| {
                ModuleError::execution(&context.module_id, format!("unknown import binding '{}'", name))
            })
        };

        for statement in statements {
            trace!("{}: {:?}", context.module_id, statement);
            match statement {
                Statement::Import { from, alias, names } => {
                    let metadata = if names.is_empty() {
                        ImportMetadata::default()
                    } else {
                        ImportMetadata::named(names)
                    };
                    let ns = (context.import)(from.clone(), metadata).await?;
                    bindings.insert(alias.unwrap_or(from), ns);
                }
                Statement::DynamicImport { from, alias } => {
                    let ns = (context.dynamic_import)(from.clone()).await?;
                    bindings.insert(alias.unwrap_or(from), ns);
                }
                Statement::Export { name, value } => {
                    context.exports.set(&name, value)?;
                }
                Statement::Reexport { name, from, binding: key } => {
                    let source = binding(&bindings, &from)?;
                    let key = key.unwrap_or_else(|| name.clone());
                    context.exports.define_live(&name, &source, &key)?;
                }
                Statement::ExportAll { from } => {
                    let source = binding(&bindings, &from)?;
                    context.export_all_from(&ModuleValue::Namespace(source));
                }
                Statement::Accept { deps } => match context.meta.hot() {
                    Some(hot) if deps.is_empty() => hot.accept(),
                    Some(hot) => hot.accept_deps(deps, |_| Ok(())),
                    None => trace!("{}: hot reload disabled, accept ignored", context.module_id),
                },
                Statement::Fail { message } => {
                    return Err(ModuleError::execution(&context.module_id, message));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ModuleRunner for ScriptRunner {
    async fn run_module(&self, context: ModuleContext, code: &str) -> Result<()> {
        let statements = parse(&context.module_id, code)?;
        self.execute(&context, statements).await?;
        context.exports.freeze();
        Ok(())
    }

    async fn run_external_module(&self, locator: &str, _metadata: &ImportMetadata) -> Result<Namespace> {
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
