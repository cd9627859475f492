//! Module caching system

use crate::fetch::ResolvedResult;
use crate::source_map::{self, DecodedMap};
use crate::utils::{clean_url, normalize_module_id, with_trailing_slash};
use crate::value::Namespace;
use crate::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, trace};

/// A shared handle to one module execution.
///
/// Every clone observes the same execution and the same outcome. Dropping a
/// handle never cancels the execution; the next waiter resumes driving it.
#[derive(Clone)]
pub struct PendingExecution {
    inner: Shared<BoxFuture<'static, Result<Namespace>>>,
}

impl PendingExecution {
    /// Wrap an execution future
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Namespace>> + Send + 'static,
    {
        Self {
            inner: future.boxed().shared(),
        }
    }

    /// Wait for the execution to settle
    pub async fn wait(&self) -> Result<Namespace> {
        self.inner.clone().await
    }

    /// The outcome, if the execution already settled
    pub fn peek(&self) -> Option<Result<Namespace>> {
        self.inner.peek().cloned()
    }
}

#[derive(Default)]
struct EntryState {
    pending: Option<PendingExecution>,
    exports: Option<Namespace>,
    evaluated: bool,
    meta: Option<ResolvedResult>,
    source_map: Option<Arc<DecodedMap>>,
    imports: FxHashSet<String>,
    importers: FxHashSet<String>,
}

/// Execution state of one module id.
///
/// Entries are shared: every caller referencing the same id mutates the
/// same entry.
#[derive(Default)]
pub struct ModuleEntry {
    state: Mutex<EntryState>,
}

impl ModuleEntry {
    /// The in-flight or settled execution handle
    pub fn pending(&self) -> Option<PendingExecution> {
        self.state.lock().pending.clone()
    }

    /// Record the execution handle
    pub fn set_pending(&self, pending: PendingExecution) {
        self.state.lock().pending = Some(pending);
    }

    /// The current execution handle, or the one `start` creates when there
    /// is none. Starting resets the evaluated flag.
    pub fn pending_or_start<F>(&self, start: F) -> PendingExecution
    where
        F: FnOnce() -> PendingExecution,
    {
        let mut state = self.state.lock();
        if let Some(pending) = &state.pending {
            return pending.clone();
        }
        let pending = start();
        state.pending = Some(pending.clone());
        state.evaluated = false;
        pending
    }

    /// The (possibly partially populated) export object
    pub fn exports(&self) -> Option<Namespace> {
        self.state.lock().exports.clone()
    }

    /// Record the export object
    pub fn set_exports(&self, exports: Namespace) {
        self.state.lock().exports = Some(exports);
    }

    /// Whether the last execution finished, successfully or not
    pub fn is_evaluated(&self) -> bool {
        self.state.lock().evaluated
    }

    /// Mark the execution as finished or restarted
    pub fn set_evaluated(&self, evaluated: bool) {
        self.state.lock().evaluated = evaluated;
    }

    /// The resolved fetch result
    pub fn meta(&self) -> Option<ResolvedResult> {
        self.state.lock().meta.clone()
    }

    /// Record the resolved fetch result
    pub fn set_meta(&self, meta: ResolvedResult) {
        self.state.lock().meta = Some(meta);
    }

    /// The memoized decoded source map
    pub fn source_map(&self) -> Option<Arc<DecodedMap>> {
        self.state.lock().source_map.clone()
    }

    fn set_source_map(&self, map: Arc<DecodedMap>) {
        self.state.lock().source_map = Some(map);
    }

    /// Module ids this module imports
    pub fn imports(&self) -> Vec<String> {
        self.state.lock().imports.iter().cloned().collect()
    }

    /// Module ids importing this module
    pub fn importers(&self) -> Vec<String> {
        self.state.lock().importers.iter().cloned().collect()
    }

    /// Record that this module imports `id`
    pub fn add_import(&self, id: &str) {
        self.state.lock().imports.insert(id.to_string());
    }

    /// Record that `id` imports this module
    pub fn add_importer(&self, id: &str) {
        self.state.lock().importers.insert(id.to_string());
    }

    /// Whether `id` imports this module
    pub fn has_importer(&self, id: &str) -> bool {
        self.state.lock().importers.contains(id)
    }

    /// Whether some module this one imports also imports it back
    pub fn has_circular_import(&self) -> bool {
        let state = self.state.lock();
        state.imports.iter().any(|id| state.importers.contains(id))
    }

    /// Reset to the unexecuted state, keeping importers
    fn reset(&self) {
        let mut state = self.state.lock();
        state.evaluated = false;
        state.meta = None;
        state.source_map = None;
        state.pending = None;
        state.exports = None;
        // Importers survive so the next evaluation still knows its dependents
        state.imports.clear();
    }
}

impl fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ModuleEntry")
            .field("evaluated", &state.evaluated)
            .field("pending", &state.pending.is_some())
            .field("exports", &state.exports)
            .field("meta", &state.meta)
            .field("imports", &state.imports)
            .field("importers", &state.importers)
            .finish()
    }
}

/// Thread-safe module cache keyed by canonical module id
#[derive(Debug, Clone)]
pub struct ModuleCache {
    root: Arc<str>,
    modules: Arc<RwLock<FxHashMap<String, Arc<ModuleEntry>>>>,
}

impl ModuleCache {
    /// Create an empty cache whose ids are relative to `root`
    pub fn new(root: &str) -> Self {
        Self {
            root: Arc::from(with_trailing_slash(root)),
            modules: Arc::new(RwLock::new(FxHashMap::default())),
        }
    }

    /// The root ids are made relative to, with a trailing slash
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Normalize a file path or raw id into a canonical module id
    pub fn normalize(&self, file: &str) -> String {
        normalize_module_id(file, &self.root)
    }

    /// Get the entry for a canonical id, creating it on first access
    pub fn get_by_module_id(&self, id: &str) -> Arc<ModuleEntry> {
        if let Some(entry) = self.modules.read().get(id) {
            trace!("Cache hit for module: {}", id);
            return entry.clone();
        }
        self.modules
            .write()
            .entry(id.to_string())
            .or_insert_with(|| {
                trace!("Created cache entry for module: {}", id);
                Arc::new(ModuleEntry::default())
            })
            .clone()
    }

    /// Normalize `file`, then get or create its entry
    pub fn get(&self, file: &str) -> Arc<ModuleEntry> {
        self.get_by_module_id(&self.normalize(file))
    }

    /// Whether an entry exists for the normalized `file`
    pub fn contains(&self, file: &str) -> bool {
        self.contains_module_id(&self.normalize(file))
    }

    /// Whether an entry exists for a canonical id
    pub fn contains_module_id(&self, id: &str) -> bool {
        self.modules.read().contains_key(id)
    }

    /// Remove the entry for a canonical id
    pub fn delete_by_module_id(&self, id: &str) -> bool {
        let removed = self.modules.write().remove(id).is_some();
        if removed {
            debug!("Removed module from cache: {}", id);
        }
        removed
    }

    /// Normalize `file`, then remove its entry
    pub fn delete(&self, file: &str) -> bool {
        self.delete_by_module_id(&self.normalize(file))
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.modules.write().clear();
        debug!("Cleared module cache");
    }

    /// All canonical ids currently cached
    pub fn keys(&self) -> Vec<String> {
        self.modules.read().keys().cloned().collect()
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reset one entry in place so it executes again on next reference
    pub fn invalidate(&self, file: &str) {
        self.get(file).reset();
    }

    /// Whether `imported_by` transitively imports `imported_id`
    pub fn is_imported(&self, imported_id: &str, imported_by: &str) -> bool {
        let imported_by = self.normalize(imported_by);
        let mut seen = FxHashSet::default();
        self.is_imported_from(&self.normalize(imported_id), &imported_by, &mut seen)
    }

    fn is_imported_from(
        &self,
        imported_id: &str,
        imported_by: &str,
        seen: &mut FxHashSet<String>,
    ) -> bool {
        if imported_id == imported_by {
            return true;
        }
        if !seen.insert(imported_id.to_string()) {
            return false;
        }

        let Some(entry) = self.modules.read().get(imported_id).cloned() else {
            return false;
        };
        if entry.has_importer(imported_by) {
            return true;
        }
        entry
            .importers()
            .iter()
            .any(|importer| self.is_imported_from(importer, imported_by, seen))
    }

    /// Remove `ids` and every module that transitively imports them
    pub fn invalidate_dep_tree<I, S>(&self, ids: I) -> FxHashSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut invalidated = FxHashSet::default();
        let mut stack: Vec<String> = ids.into_iter().map(|id| self.normalize(id.as_ref())).collect();

        while let Some(id) = stack.pop() {
            if !invalidated.insert(id.clone()) {
                continue;
            }
            let entry = self.modules.write().remove(&id);
            if let Some(entry) = entry {
                stack.extend(entry.importers());
            }
        }

        debug!("Invalidated {} dependent modules", invalidated.len());
        invalidated
    }

    /// Remove `ids` and every module they transitively import
    pub fn invalidate_sub_dep_tree<I, S>(&self, ids: I) -> FxHashSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut invalidated = FxHashSet::default();
        let mut stack: Vec<String> = ids.into_iter().map(|id| self.normalize(id.as_ref())).collect();

        while let Some(id) = stack.pop() {
            if !invalidated.insert(id.clone()) {
                continue;
            }
            let children: Vec<String> = self
                .modules
                .read()
                .iter()
                .filter(|(_, entry)| entry.has_importer(&id))
                .map(|(key, _)| key.clone())
                .collect();
            stack.extend(children);
            self.modules.write().remove(&id);
        }

        debug!("Invalidated {} dependency modules", invalidated.len());
        invalidated
    }

    /// Decode and memoize the inline source map of a module's code
    pub fn get_source_map(&self, file: &str) -> Result<Option<Arc<DecodedMap>>> {
        let id = self.normalize(file);
        let entry = self.get_by_module_id(&id);
        if let Some(map) = entry.source_map() {
            return Ok(Some(map));
        }

        let Some(meta) = entry.meta() else {
            return Ok(None);
        };
        let Some(encoded) = meta.result.code().and_then(source_map::extract_inline_map) else {
            return Ok(None);
        };
        let base_file = meta
            .result
            .file()
            .unwrap_or_else(|| clean_url(&id))
            .to_string();

        let map = Arc::new(DecodedMap::from_base64(&id, encoded, &base_file)?);
        entry.set_source_map(map.clone());
        Ok(Some(map))
    }
}
