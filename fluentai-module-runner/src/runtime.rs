//! The module runtime: fetching, caching and executing modules

use crate::cache::{ModuleCache, PendingExecution};
use crate::context::{DynamicImportFn, ExportAllFn, ImportFn, ImportMeta, ImportMetadata, ModuleContext};
use crate::fetch::{FetchResult, ModuleFetcher, ModuleKind, ResolvedResult};
use crate::hmr::{create_hmr_handler, HmrClient, HmrConnection, Update};
use crate::runner::ModuleRunner;
use crate::utils::{
    clean_url, posix_dirname, posix_path_to_file_href, posix_resolve, slash, unwrap_id,
    with_trailing_slash, wrap_id,
};
use crate::value::Namespace;
use crate::{ModuleError, Result, RuntimeConfig};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Everything needed to build a [`Runtime`] besides its runner
pub struct RuntimeOptions {
    config: RuntimeConfig,
    fetcher: Arc<dyn ModuleFetcher>,
    hmr: Option<Arc<dyn HmrConnection>>,
    module_cache: Option<ModuleCache>,
    stubs: FxHashMap<String, Namespace>,
}

impl RuntimeOptions {
    /// Options resolving modules through `fetcher`
    pub fn new(fetcher: impl ModuleFetcher + 'static) -> Self {
        Self {
            config: RuntimeConfig::default(),
            fetcher: Arc::new(fetcher),
            hmr: None,
            module_cache: None,
            stubs: FxHashMap::default(),
        }
    }

    /// Replace the configuration
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the project root
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.config.root = root.into();
        self
    }

    /// Enable hot reload over `connection`
    pub fn hmr(mut self, connection: impl HmrConnection + 'static) -> Self {
        self.hmr = Some(Arc::new(connection));
        self
    }

    /// Use an existing module cache
    pub fn module_cache(mut self, cache: ModuleCache) -> Self {
        self.module_cache = Some(cache);
        self
    }

    /// Answer requests for `request_id` with `namespace` without executing
    /// anything
    pub fn stub(mut self, request_id: impl Into<String>, namespace: Namespace) -> Self {
        self.stubs.insert(request_id.into(), namespace);
        self
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    root: String,
    fetcher: Arc<dyn ModuleFetcher>,
    runner: Arc<dyn ModuleRunner>,
    module_cache: ModuleCache,
    hmr_client: RwLock<Option<HmrClient>>,
    entrypoints: Mutex<Vec<String>>,
    id_to_url: RwLock<FxHashMap<String, String>>,
    file_to_ids: RwLock<FxHashMap<String, Vec<String>>>,
    env: Arc<serde_json::Map<String, Value>>,
    stubs: FxHashMap<String, Namespace>,
    closed: AtomicBool,
}

/// Executes modules produced by an external build pipeline.
///
/// Cloning yields another handle to the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

/// A runtime reference that does not keep it alive
#[derive(Clone)]
pub(crate) struct WeakRuntime(Weak<RuntimeInner>);

impl WeakRuntime {
    pub(crate) fn upgrade(&self) -> Option<Runtime> {
        self.0.upgrade().map(|inner| Runtime { inner })
    }
}

impl Runtime {
    /// Create a runtime executing modules with `runner`
    pub fn new(options: RuntimeOptions, runner: impl ModuleRunner + 'static) -> Self {
        let RuntimeOptions {
            config,
            fetcher,
            hmr,
            module_cache,
            stubs,
        } = options;

        let root = with_trailing_slash(&config.root);
        let module_cache = module_cache.unwrap_or_else(|| ModuleCache::new(&root));
        let env = Arc::new(build_env(&config));

        let inner = Arc::new_cyclic(|weak: &Weak<RuntimeInner>| {
            let hmr_client = hmr.as_ref().map(|connection| {
                let runtime = WeakRuntime(weak.clone());
                HmrClient::new(
                    connection.clone(),
                    Arc::new(move |update: Update| {
                        let runtime = runtime.clone();
                        async move {
                            match runtime.upgrade() {
                                Some(runtime) => runtime.import_updated_module(update).await,
                                None => Err(ModuleError::RuntimeClosed),
                            }
                        }
                        .boxed()
                    }),
                )
            });

            RuntimeInner {
                config,
                root,
                fetcher,
                runner: Arc::new(runner),
                module_cache,
                hmr_client: RwLock::new(hmr_client),
                entrypoints: Mutex::new(Vec::new()),
                id_to_url: RwLock::new(FxHashMap::default()),
                file_to_ids: RwLock::new(FxHashMap::default()),
                env,
                stubs,
                closed: AtomicBool::new(false),
            }
        });

        if let Some(connection) = hmr {
            connection.on_update(create_hmr_handler(WeakRuntime(Arc::downgrade(&inner))));
        }

        Runtime { inner }
    }

    /// Execute a module and return its exports.
    ///
    /// Accepts a file path, a server path or an id relative to the root.
    pub async fn execute_url(&self, url: &str) -> Result<Namespace> {
        let url = self.normalize_entry_url(url);
        let fetched = self.cached_module(&url, None).await?;
        self.cached_request(url, fetched, Vec::new(), ImportMetadata::default())
            .await
    }

    /// Execute a module as an entry point. Entry points are re-executed on
    /// a full reload.
    pub async fn execute_entrypoint(&self, url: &str) -> Result<Namespace> {
        let url = self.normalize_entry_url(url);
        let fetched = self.cached_module(&url, None).await?;
        let metadata = ImportMetadata {
            entrypoint: true,
            ..ImportMetadata::default()
        };
        self.cached_request(url, fetched, Vec::new(), metadata).await
    }

    /// Reset every cache, entry point and HMR registration
    pub fn clear_cache(&self) {
        self.inner.module_cache.clear();
        self.inner.id_to_url.write().clear();
        self.inner.file_to_ids.write().clear();
        self.inner.entrypoints.lock().clear();
        if let Some(client) = self.hmr_client() {
            client.clear();
        }
        debug!("Cleared runtime caches");
    }

    /// Clear every cache and stop accepting requests and hot updates.
    /// The HMR connection itself is left open.
    pub fn close(&self) {
        self.clear_cache();
        *self.inner.hmr_client.write() = None;
        self.inner.closed.store(true, Ordering::Release);
        info!("Module runtime closed");
    }

    /// Whether [`Runtime::close`] was called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The module cache
    pub fn module_cache(&self) -> &ModuleCache {
        &self.inner.module_cache
    }

    /// The HMR client, when hot reload is enabled and the runtime is open
    pub fn hmr_client(&self) -> Option<HmrClient> {
        self.inner.hmr_client.read().clone()
    }

    /// Registered entry points, in registration order
    pub fn entrypoints(&self) -> Vec<String> {
        self.inner.entrypoints.lock().clone()
    }

    /// The runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Drop cached modules ahead of a full reload, keeping dependencies
    /// outside the project and externalized modules
    pub(crate) fn clear_for_full_reload(&self) {
        let cache = &self.inner.module_cache;
        let boundary = self.inner.config.dependency_boundary.as_str();
        for id in cache.keys() {
            let externalized = cache
                .get_by_module_id(&id)
                .meta()
                .is_some_and(|meta| meta.is_externalized());
            let keep = externalized || (!boundary.is_empty() && id.contains(boundary));
            if !keep {
                cache.delete_by_module_id(&id);
            }
        }
    }

    /// Invalidate the accepted module of an update and re-execute it
    async fn import_updated_module(&self, update: Update) -> Result<Namespace> {
        self.inner.module_cache.invalidate(&update.accepted_path);
        if !update.invalidates.is_empty() {
            self.invalidate_files(&update.invalidates);
        }
        self.execute_url(&update.accepted_path).await
    }

    fn invalidate_files(&self, files: &[String]) {
        let cache = &self.inner.module_cache;
        for file in files {
            let ids = self.inner.file_to_ids.read().get(file).cloned();
            match ids {
                Some(ids) => ids.iter().for_each(|id| cache.invalidate(id)),
                None if cache.contains(file) => cache.invalidate(file),
                None => trace!("Nothing cached for invalidated file {}", file),
            }
        }
    }

    // Unlike `ModuleCache::normalize`, entry urls are resolved further by
    // the fetch function, so virtual ids are wrapped rather than kept
    fn normalize_entry_url(&self, url: &str) -> String {
        if url.starts_with('.') {
            return url.to_string();
        }
        let url = slash(url.strip_prefix("file://").unwrap_or(url));
        let root = &self.inner.root;
        if let Some(rest) = url.strip_prefix(root.as_str()) {
            return format!("/{}", rest);
        }
        if url.starts_with('/') {
            url
        } else {
            wrap_id(&url)
        }
    }

    fn add_entrypoint(&self, module_id: &str) {
        let mut entrypoints = self.inner.entrypoints.lock();
        if !entrypoints.iter().any(|id| id == module_id) {
            entrypoints.push(module_id.to_string());
        }
    }

    /// Resolve a request id to its fetch result, reusing a cached one
    async fn cached_module(&self, id: &str, importer: Option<&str>) -> Result<ResolvedResult> {
        if self.is_closed() {
            return Err(ModuleError::RuntimeClosed);
        }

        let cache = &self.inner.module_cache;
        let known = self.inner.id_to_url.read().get(id).cloned();
        if let Some(module_id) = known {
            if let Some(meta) = cache.get_by_module_id(&module_id).meta() {
                return Ok(meta);
            }
        }

        debug!("Fetching {}", id);
        // Established external patterns and stubs never reach the fetcher
        let result = if id.starts_with("data:") || self.inner.stubs.contains_key(id) {
            FetchResult::external(id, Some(ModuleKind::Builtin))
        } else {
            self.inner.fetcher.fetch_module(id, importer).await?
        };

        // Base the module id on the resolved file so that differently
        // spelled requests share one entry
        let query = id.split('?').nth(1).map(|q| format!("?{}", q)).unwrap_or_default();
        let file = result.file().map(str::to_string);
        let full_file = match &file {
            Some(file) => format!("{}{}", file, query),
            None => id.to_string(),
        };
        let module_id = cache.normalize(&full_file);

        let resolved = ResolvedResult {
            id: module_id.clone(),
            result,
        };
        cache.get_by_module_id(&module_id).set_meta(resolved.clone());

        if let Some(file) = file {
            let mut file_to_ids = self.inner.file_to_ids.write();
            let ids = file_to_ids.entry(file).or_default();
            if !ids.contains(&module_id) {
                ids.push(module_id.clone());
            }
        }

        let mut id_to_url = self.inner.id_to_url.write();
        id_to_url.insert(id.to_string(), module_id.clone());
        id_to_url.insert(unwrap_id(id), module_id);
        Ok(resolved)
    }

    /// Return a module's exports, executing it at most once
    fn cached_request(
        &self,
        id: String,
        fetched: ResolvedResult,
        callstack: Vec<String>,
        metadata: ImportMetadata,
    ) -> BoxFuture<'static, Result<Namespace>> {
        let this = self.clone();
        async move {
            let module_id = fetched.id.clone();
            if metadata.entrypoint {
                this.add_entrypoint(&module_id);
            }

            let entry = this.inner.module_cache.get_by_module_id(&module_id);
            if let Some(importer) = callstack.last() {
                entry.add_importer(importer);
            }

            // A module already on the stack, or one whose own imports import
            // it back, is part of a cycle: hand out its partial exports
            if callstack.contains(&module_id) || entry.has_circular_import() {
                if let Some(exports) = entry.exports() {
                    trace!("Circular import of {}", module_id);
                    return this.process_import(exports, &fetched, &metadata);
                }
            }

            let threshold_ms = this.inner.config.slow_module_threshold_ms;
            let stack = callstack.clone();
            let pending = entry.pending_or_start(|| {
                PendingExecution::new(this.direct_request(id, fetched.clone(), callstack, metadata.clone()))
            });
            let _timer = SlowModuleTimer::for_pending(&pending, threshold_ms, &module_id, &stack);
            let result = pending.wait().await;
            entry.set_evaluated(true);
            this.process_import(result?, &fetched, &metadata)
        }
        .boxed()
    }

    fn process_import(
        &self,
        namespace: Namespace,
        fetched: &ResolvedResult,
        metadata: &ImportMetadata,
    ) -> Result<Namespace> {
        self.inner.runner.process_import(namespace, fetched, metadata)
    }

    /// Execute a module unconditionally
    fn direct_request(
        &self,
        id: String,
        fetched: ResolvedResult,
        callstack: Vec<String>,
        metadata: ImportMetadata,
    ) -> BoxFuture<'static, Result<Namespace>> {
        let this = self.clone();
        async move {
            let module_id = fetched.id.clone();
            let mut callstack = callstack;
            callstack.push(module_id.clone());
            let callstack = Arc::new(callstack);

            let entry = this.inner.module_cache.get_by_module_id(&module_id);

            if let Some(stub) = this.inner.stubs.get(&id) {
                trace!("Using stub for {}", id);
                entry.set_exports(stub.clone());
                return Ok(stub.clone());
            }

            let (code, file) = match &fetched.result {
                FetchResult::External { externalize, .. } => {
                    debug!("Externalizing {}", externalize);
                    let exports = this
                        .inner
                        .runner
                        .run_external_module(externalize, &metadata)
                        .await?;
                    entry.set_exports(exports.clone());
                    return Ok(exports);
                }
                FetchResult::Inline { code, file } => (code.clone(), file.clone()),
            };

            let Some(code) = code else {
                let importer = callstack.len().checked_sub(2).map(|idx| callstack[idx].clone());
                return Err(ModuleError::LoadFailed { id, importer });
            };

            let module_path = clean_url(file.as_deref().unwrap_or(&module_id)).to_string();
            let href = posix_path_to_file_href(&module_path);
            let mut meta = ImportMeta::new(
                module_path.clone(),
                posix_dirname(&module_path),
                href.clone(),
                this.inner.env.clone(),
            );
            if let Some(client) = this.hmr_client() {
                meta = meta.with_hot(client, module_id.clone());
            }

            let exports = Namespace::new();
            entry.set_exports(exports.clone());

            let context = this.module_context(&id, &module_id, exports.clone(), meta, callstack);
            debug!("Executing {}", href);
            this.inner.runner.run_module(context, &code).await?;
            Ok(exports)
        }
        .boxed()
    }

    fn module_context(
        &self,
        id: &str,
        module_id: &str,
        exports: Namespace,
        meta: ImportMeta,
        callstack: Arc<Vec<String>>,
    ) -> ModuleContext {
        let import: ImportFn = {
            let this = self.clone();
            let module_id = module_id.to_string();
            let callstack = callstack.clone();
            Arc::new(move |dep: String, metadata: ImportMetadata| {
                this.request(dep, module_id.clone(), callstack.clone(), metadata)
            })
        };

        let dynamic_import: DynamicImportFn = {
            let import = import.clone();
            let base = posix_dirname(id);
            Arc::new(move |dep: String| {
                let dep = if dep.starts_with('.') {
                    posix_resolve(&[base.as_str(), dep.as_str()])
                } else {
                    dep
                };
                import(dep, ImportMetadata::dynamic())
            })
        };

        let export_all: ExportAllFn = {
            let exports = exports.clone();
            Arc::new(move |source| exports.export_all(source))
        };

        ModuleContext {
            module_id: module_id.to_string(),
            exports,
            import,
            dynamic_import,
            export_all,
            meta,
        }
    }

    /// Import `dep` on behalf of `importer`, recording the graph edge
    fn request(
        &self,
        dep: String,
        importer: String,
        callstack: Arc<Vec<String>>,
        metadata: ImportMetadata,
    ) -> BoxFuture<'static, Result<Namespace>> {
        let this = self.clone();
        async move {
            let fetched = this.cached_module(&dep, Some(&importer)).await?;
            let cache = &this.inner.module_cache;
            cache.get_by_module_id(&fetched.id).add_importer(&importer);
            cache.get_by_module_id(&importer).add_import(&fetched.id);

            this.cached_request(dep, fetched, callstack.to_vec(), metadata).await
        }
        .boxed()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("root", &self.inner.root)
            .field("modules", &self.inner.module_cache.len())
            .field("entrypoints", &self.entrypoints())
            .field("hmr", &self.hmr_client().is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn build_env(config: &RuntimeConfig) -> serde_json::Map<String, Value> {
    let mut env = serde_json::Map::new();
    env.insert("BASE_URL".to_string(), Value::from("/"));
    env.insert("MODE".to_string(), Value::from("development"));
    env.insert("DEV".to_string(), Value::Bool(true));
    env.insert("PROD".to_string(), Value::Bool(false));
    env.insert("SSR".to_string(), Value::Bool(true));
    for (key, value) in &config.environment_variables {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Logs a warning when a module takes longer than the threshold to load.
/// Never cancels the load.
struct SlowModuleTimer(Option<JoinHandle<()>>);

impl SlowModuleTimer {
    /// Arm the timer only while `pending` has yet to settle
    fn for_pending(
        pending: &PendingExecution,
        threshold_ms: Option<u64>,
        module_id: &str,
        callstack: &[String],
    ) -> Self {
        if pending.peek().is_some() {
            return Self(None);
        }
        Self::start(threshold_ms, module_id, callstack)
    }

    fn start(threshold_ms: Option<u64>, module_id: &str, callstack: &[String]) -> Self {
        let Some(threshold_ms) = threshold_ms else {
            return Self(None);
        };
        let Ok(handle) = Handle::try_current() else {
            return Self(None);
        };

        let module_id = module_id.to_string();
        let stack = callstack
            .iter()
            .chain(std::iter::once(&module_id))
            .rev()
            .map(|id| format!("  - {}", id))
            .collect::<Vec<_>>()
            .join("\n");

        Self(Some(handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(threshold_ms)).await;
            warn!(
                "Module {} takes over {}ms to load.\nstack:\n{}",
                module_id, threshold_ms, stack
            );
        })))
    }
}

impl Drop for SlowModuleTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}
