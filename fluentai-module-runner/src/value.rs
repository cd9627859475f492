//! Live module namespaces and the values they hold

use crate::cache::PendingExecution;
use crate::{ModuleError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Binding name that marks a namespace as converted from another export
/// convention. Never copied by export-all.
pub const MODULE_KIND_MARKER: &str = "__esModule";

/// A value reachable from a module namespace
#[derive(Clone)]
pub enum ModuleValue {
    /// Plain data
    Value(serde_json::Value),

    /// Another module's namespace object
    Namespace(Namespace),

    /// An execution that has not settled yet
    Pending(PendingExecution),
}

impl ModuleValue {
    /// The plain data, if this is a data value
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ModuleValue::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The namespace, if this is a namespace value
    pub fn as_namespace(&self) -> Option<&Namespace> {
        match self {
            ModuleValue::Namespace(ns) => Some(ns),
            _ => None,
        }
    }

    /// Snapshot this value as JSON. Pending values become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ModuleValue::Value(value) => value.clone(),
            ModuleValue::Namespace(ns) => ns.to_json(),
            ModuleValue::Pending(_) => serde_json::Value::Null,
        }
    }
}

impl fmt::Debug for ModuleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleValue::Value(value) => f.debug_tuple("Value").field(value).finish(),
            ModuleValue::Namespace(ns) => f.debug_tuple("Namespace").field(ns).finish(),
            ModuleValue::Pending(_) => f.write_str("Pending"),
        }
    }
}

impl From<serde_json::Value> for ModuleValue {
    fn from(value: serde_json::Value) -> Self {
        ModuleValue::Value(value)
    }
}

impl From<Namespace> for ModuleValue {
    fn from(ns: Namespace) -> Self {
        ModuleValue::Namespace(ns)
    }
}

/// Computes a binding's current value on every read
pub type Getter = Arc<dyn Fn() -> ModuleValue + Send + Sync>;

#[derive(Clone)]
enum Binding {
    Value(ModuleValue),
    /// Reads `key` of `source` on every access
    Live { source: Namespace, key: String },
    Getter(Getter),
}

struct NamespaceInner {
    bindings: RwLock<BTreeMap<String, Binding>>,
    frozen: AtomicBool,
}

/// A module's export object.
///
/// Cloning yields another handle to the same object; use
/// [`Namespace::ptr_eq`] for identity. Bindings may be plain values, live
/// re-exports of another namespace, or getters, so importers always observe
/// the exporter's current state.
#[derive(Clone)]
pub struct Namespace {
    inner: Arc<NamespaceInner>,
    /// Module id reported when a guarded view is read for a missing binding
    guard: Option<Arc<str>>,
}

impl Namespace {
    /// Create an empty, unfrozen namespace
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NamespaceInner {
                bindings: RwLock::new(BTreeMap::new()),
                frozen: AtomicBool::new(false),
            }),
            guard: None,
        }
    }

    /// Build a namespace from plain data bindings
    pub fn from_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<String>,
    {
        let ns = Self::new();
        {
            let mut bindings = ns.inner.bindings.write();
            for (name, value) in values {
                bindings.insert(name.into(), Binding::Value(ModuleValue::Value(value)));
            }
        }
        ns
    }

    /// Whether two handles refer to the same export object
    pub fn ptr_eq(a: &Namespace, b: &Namespace) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    fn install(&self, name: &str, binding: Binding) -> Result<()> {
        if self.is_frozen() {
            return Err(ModuleError::FrozenNamespace {
                name: name.to_string(),
            });
        }
        self.inner.bindings.write().insert(name.to_string(), binding);
        Ok(())
    }

    /// Define or replace a binding with a fixed value
    pub fn set(&self, name: &str, value: impl Into<ModuleValue>) -> Result<()> {
        self.install(name, Binding::Value(value.into()))
    }

    /// Define a binding that forwards to `key` of `source` on every read
    pub fn define_live(&self, name: &str, source: &Namespace, key: &str) -> Result<()> {
        self.install(
            name,
            Binding::Live {
                source: source.clone(),
                key: key.to_string(),
            },
        )
    }

    /// Define a binding whose value is computed on every read
    pub fn define_getter<F>(&self, name: &str, getter: F) -> Result<()>
    where
        F: Fn() -> ModuleValue + Send + Sync + 'static,
    {
        self.install(name, Binding::Getter(Arc::new(getter)))
    }

    /// Read a binding.
    ///
    /// Returns `Ok(None)` for an absent binding, except on a guarded view,
    /// where an absent binding is an [`ModuleError::ExportNotProvided`].
    pub fn get(&self, name: &str) -> Result<Option<ModuleValue>> {
        // Clone out of the lock: live bindings may read back into this namespace
        let binding = self.inner.bindings.read().get(name).cloned();
        match binding {
            Some(Binding::Value(value)) => Ok(Some(value)),
            Some(Binding::Live { source, key }) => source.get(&key),
            Some(Binding::Getter(getter)) => Ok(Some(getter())),
            None => match &self.guard {
                Some(module) => Err(ModuleError::ExportNotProvided {
                    name: name.to_string(),
                    module: module.to_string(),
                }),
                None => Ok(None),
            },
        }
    }

    /// Read a binding as plain data
    pub fn get_json(&self, name: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.get(name)?.map(|value| value.to_json()))
    }

    /// Whether a binding with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.inner.bindings.read().contains_key(name)
    }

    /// Binding names in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.inner.bindings.read().keys().cloned().collect()
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.inner.bindings.read().len()
    }

    /// Whether the namespace has no bindings
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject any further binding definitions. Existing live bindings keep
    /// forwarding.
    pub fn freeze(&self) {
        self.inner.frozen.store(true, Ordering::Release);
    }

    /// Whether the namespace has been frozen
    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::Acquire)
    }

    /// A view of the same export object whose reads of absent bindings fail
    pub fn guarded(&self, module_id: &str) -> Namespace {
        Namespace {
            inner: self.inner.clone(),
            guard: Some(Arc::from(module_id)),
        }
    }

    /// Whether reads of absent bindings fail on this view
    pub fn is_guarded(&self) -> bool {
        self.guard.is_some()
    }

    /// Merge every binding of `source` into this namespace as live bindings.
    ///
    /// Primitives, arrays and pending values are ignored, as is merging a
    /// namespace into itself. `default` and the module-kind marker are never
    /// copied. A binding that cannot be installed is skipped.
    pub fn export_all(&self, source: &ModuleValue) {
        match source {
            ModuleValue::Namespace(ns) => {
                if Namespace::ptr_eq(self, ns) {
                    return;
                }
                for key in ns.keys() {
                    if is_reserved_export(&key) {
                        continue;
                    }
                    if let Err(e) = self.define_live(&key, ns, &key) {
                        trace!("Skipped re-export of {}: {}", key, e);
                    }
                }
            }
            ModuleValue::Value(serde_json::Value::Object(map)) => {
                for (key, value) in map {
                    if is_reserved_export(key) {
                        continue;
                    }
                    if let Err(e) = self.set(key, value.clone()) {
                        trace!("Skipped re-export of {}: {}", key, e);
                    }
                }
            }
            ModuleValue::Value(_) | ModuleValue::Pending(_) => {}
        }
    }

    /// Snapshot every readable binding as a JSON object
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for key in self.keys() {
            if let Ok(Some(value)) = self.get(&key) {
                map.insert(key, value.to_json());
            }
        }
        serde_json::Value::Object(map)
    }
}

fn is_reserved_export(name: &str) -> bool {
    name == "default" || name == MODULE_KIND_MARKER
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("keys", &self.keys())
            .field("frozen", &self.is_frozen())
            .field("guard", &self.guard)
            .finish()
    }
}
