//! Module runner error types

use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// Type alias for module runner results
pub type Result<T> = std::result::Result<T, ModuleError>;

/// A shareable underlying error.
///
/// Errors are cloned to every waiter of a shared execution, so sources are
/// reference counted rather than owned.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Errors that can occur while fetching, executing or hot-updating modules
#[derive(Error, Debug, Clone)]
pub enum ModuleError {
    /// The fetch function could not resolve a request id
    #[error("Failed to fetch module {id}: {source}")]
    Fetch {
        /// The request id passed to the fetch function
        id: String,
        /// The underlying fetch error
        #[source]
        source: SharedError,
    },

    /// A non-externalized fetch result carried no code
    #[error("Failed to load \"{id}\"{}", .importer.as_ref().map(|i| format!(" imported from {}", i)).unwrap_or_default())]
    LoadFailed {
        /// The request id that failed to load
        id: String,
        /// The module that requested it, when known
        importer: Option<String>,
    },

    /// The runner failed while executing module code
    #[error("Error executing module {id}: {message}")]
    Execution {
        /// Module id being executed
        id: String,
        /// Error message
        message: String,
    },

    /// Module code handed to a runner could not be interpreted
    #[error("Invalid module script for {id}: {source}")]
    InvalidScript {
        /// Module id whose code is malformed
        id: String,
        /// The underlying decode error
        #[source]
        source: SharedError,
    },

    /// An externalized module could not be provided by the host
    #[error("External module not found: {locator}")]
    ExternalNotFound {
        /// The opaque locator of the external module
        locator: String,
    },

    /// A named import is missing from a dynamic-export-object module
    #[error(
        "Named export '{name}' not found. The requested module '{module}' attaches its exports at run time, which may not support all of them as named exports ({})",
        .missing.join(", ")
    )]
    NamedExportNotFound {
        /// The last missing binding
        name: String,
        /// Module that was expected to contain the export
        module: String,
        /// Every requested binding that was absent
        missing: Vec<String>,
    },

    /// A guarded namespace was read for a binding it does not provide
    #[error("The requested module '{module}' does not provide an export named '{name}'")]
    ExportNotProvided {
        /// Name of the missing export
        name: String,
        /// Module that was read
        module: String,
    },

    /// A binding was written after its namespace was frozen
    #[error("Cannot define export '{name}' on a frozen namespace")]
    FrozenNamespace {
        /// Name of the rejected binding
        name: String,
    },

    /// An `import.meta` feature that this runtime does not provide
    #[error("\"{feature}\" is not supported")]
    Unsupported {
        /// The unsupported feature
        feature: String,
    },

    /// A source map could not be decoded
    #[error("Source map error in module {id}: {message}")]
    SourceMap {
        /// Module id owning the source map
        id: String,
        /// Error message
        message: String,
    },

    /// An HMR payload used an unrecognized variant
    #[error("Unknown HMR payload: {message}")]
    UnknownPayload {
        /// Decoder message
        message: String,
    },

    /// Error raised while processing hot updates
    #[error("HMR error: {message}")]
    Hmr {
        /// Error message
        message: String,
    },

    /// The runtime was closed and accepts no more requests
    #[error("Module runtime has been closed")]
    RuntimeClosed,
}

impl ModuleError {
    /// Wrap an arbitrary fetch failure for the given request id
    pub fn fetch<E>(id: impl Into<String>, error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Fetch {
            id: id.into(),
            source: Arc::new(error),
        }
    }

    /// Construct an execution error for the given module id
    pub fn execution(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            id: id.into(),
            message: message.into(),
        }
    }
}
