//! Client-side HMR state: hot modules, callbacks and event listeners

use crate::hmr::connection::HmrConnection;
use crate::hmr::payload::Update;
use crate::value::Namespace;
use crate::Result;
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives the re-executed namespaces of an accept callback's
/// dependencies, `None` for dependencies that were not updated
pub type AcceptCallback = Arc<dyn Fn(Vec<Option<Namespace>>) -> Result<()> + Send + Sync>;

/// Dispose and prune callbacks receive the module's persistent data
pub type DataCallback = Arc<dyn Fn(&HotData) + Send + Sync>;

/// Custom event listener
pub type Listener = Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>;

/// Invalidates and re-executes the accepted module of an update
pub type ImportUpdatedModule =
    Arc<dyn Fn(Update) -> BoxFuture<'static, Result<Namespace>> + Send + Sync>;

/// Handle returned when registering a listener, used to remove it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Data a module keeps across its own hot updates
#[derive(Clone, Default)]
pub struct HotData {
    values: Arc<Mutex<serde_json::Map<String, Value>>>,
}

impl HotData {
    /// Read a value
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    /// Store a value
    pub fn set(&self, key: &str, value: Value) {
        self.values.lock().insert(key.to_string(), value);
    }

    /// Remove a value
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.lock().remove(key)
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl fmt::Debug for HotData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HotData").field(&*self.values.lock()).finish()
    }
}

#[derive(Clone)]
struct HotCallback {
    deps: Vec<String>,
    callback: AcceptCallback,
}

#[derive(Default)]
struct ClientState {
    hot_modules: FxHashMap<String, Vec<HotCallback>>,
    dispose: FxHashMap<String, DataCallback>,
    prune: FxHashMap<String, DataCallback>,
    data: FxHashMap<String, HotData>,
    listeners: FxHashMap<String, Vec<(ListenerId, Listener)>>,
    owner_listeners: FxHashMap<String, Vec<(String, ListenerId)>>,
}

/// Buffers outgoing messages until the connection is ready
pub struct HmrMessenger {
    connection: Arc<dyn HmrConnection>,
    queue: Mutex<Vec<String>>,
}

impl HmrMessenger {
    fn new(connection: Arc<dyn HmrConnection>) -> Self {
        Self {
            connection,
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Queue a message and try to flush
    pub fn send(&self, message: String) {
        self.queue.lock().push(message);
        self.flush();
    }

    /// Send every buffered message if the connection is ready
    pub fn flush(&self) {
        if !self.connection.is_ready() {
            return;
        }
        let messages = std::mem::take(&mut *self.queue.lock());
        for message in messages {
            self.connection.send(message);
        }
    }

    /// Number of messages waiting for the connection
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

struct ClientInner {
    state: Mutex<ClientState>,
    messenger: HmrMessenger,
    import_updated_module: ImportUpdatedModule,
    next_listener: AtomicU64,
}

/// Registry of hot modules and event listeners for one runtime
#[derive(Clone)]
pub struct HmrClient {
    inner: Arc<ClientInner>,
}

/// Accept callbacks ready to run once every update of a payload is fetched
struct PendingApply {
    callbacks: Vec<HotCallback>,
    accepted_path: String,
    logged_path: String,
    module: Option<Namespace>,
}

impl PendingApply {
    fn apply(self) -> Result<()> {
        for HotCallback { deps, callback } in &self.callbacks {
            let modules = deps
                .iter()
                .map(|dep| (*dep == self.accepted_path).then(|| self.module.clone()).flatten())
                .collect();
            callback(modules)?;
        }
        debug!("Hot updated: {}", self.logged_path);
        Ok(())
    }
}

impl HmrClient {
    /// Create a client sending through `connection`
    pub fn new(connection: Arc<dyn HmrConnection>, import_updated_module: ImportUpdatedModule) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                state: Mutex::new(ClientState::default()),
                messenger: HmrMessenger::new(connection),
                import_updated_module,
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    /// The outgoing message buffer
    pub fn messenger(&self) -> &HmrMessenger {
        &self.inner.messenger
    }

    /// Call every listener of `event`. Listener failures are logged and do
    /// not stop the remaining listeners.
    pub fn notify_listeners(&self, event: &str, data: &Value) {
        let listeners: Vec<Listener> = self
            .inner
            .state
            .lock()
            .listeners
            .get(event)
            .map(|listeners| listeners.iter().map(|(_, listener)| listener.clone()).collect())
            .unwrap_or_default();

        for listener in listeners {
            if let Err(e) = listener(data) {
                warn!("Listener for {} failed: {}", event, e);
            }
        }
    }

    /// Re-execute every update, then run the qualifying accept callbacks in
    /// update order
    pub async fn queue_updates(&self, updates: Vec<Update>) -> Result<()> {
        let fetched = join_all(updates.into_iter().map(|update| self.fetch_update(update))).await;
        for apply in fetched.into_iter().flatten() {
            apply.apply()?;
        }
        Ok(())
    }

    async fn fetch_update(&self, update: Update) -> Option<PendingApply> {
        let is_self_update = update.path == update.accepted_path;
        let (callbacks, disposer) = {
            let state = self.inner.state.lock();
            // Not loaded yet, or never registered a hot callback
            let callbacks = state.hot_modules.get(&update.path)?;
            let qualified: Vec<HotCallback> = callbacks
                .iter()
                .filter(|callback| callback.deps.contains(&update.accepted_path))
                .cloned()
                .collect();
            (qualified, state.dispose.get(&update.accepted_path).cloned())
        };

        let mut module = None;
        if is_self_update || !callbacks.is_empty() {
            if let Some(disposer) = disposer {
                disposer(&self.data(&update.accepted_path));
            }
            let accepted_path = update.accepted_path.clone();
            match (self.inner.import_updated_module)(update.clone()).await {
                Ok(namespace) => module = Some(namespace),
                Err(e) => warn!(
                    "Failed to reload {}: {}. This could be due to syntax errors or importing non-existent modules.",
                    accepted_path, e
                ),
            }
        }

        let logged_path = if is_self_update {
            update.path.clone()
        } else {
            format!("{} via {}", update.accepted_path, update.path)
        };
        Some(PendingApply {
            callbacks,
            accepted_path: update.accepted_path,
            logged_path,
            module,
        })
    }

    /// Run dispose callbacks, then prune callbacks, of modules no longer
    /// imported
    pub fn prune_paths(&self, paths: &[String]) {
        for path in paths {
            let disposer = self.inner.state.lock().dispose.get(path).cloned();
            if let Some(disposer) = disposer {
                disposer(&self.data(path));
            }
        }
        for path in paths {
            let pruner = self.inner.state.lock().prune.get(path).cloned();
            if let Some(pruner) = pruner {
                pruner(&self.data(path));
            }
        }
    }

    /// Persistent data of a module
    pub fn data(&self, owner: &str) -> HotData {
        self.inner
            .state
            .lock()
            .data
            .entry(owner.to_string())
            .or_default()
            .clone()
    }

    /// Whether `owner` ever registered an accept callback
    pub fn is_hot_module(&self, owner: &str) -> bool {
        self.inner.state.lock().hot_modules.contains_key(owner)
    }

    /// Number of listeners registered for `event`
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .state
            .lock()
            .listeners
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Drop every callback, listener and piece of module data
    pub fn clear(&self) {
        *self.inner.state.lock() = ClientState::default();
    }

    /// Drop the stale callbacks and listeners of a re-executed module
    pub(crate) fn reset_owner(&self, owner: &str) {
        let mut state = self.inner.state.lock();
        state.data.entry(owner.to_string()).or_default();
        if let Some(callbacks) = state.hot_modules.get_mut(owner) {
            callbacks.clear();
        }

        let stale = state.owner_listeners.insert(owner.to_string(), Vec::new());
        for (event, id) in stale.unwrap_or_default() {
            remove_listener_entry(&mut state.listeners, &event, id);
        }
    }

    pub(crate) fn register_accept(&self, owner: &str, deps: Vec<String>, callback: AcceptCallback) {
        self.inner
            .state
            .lock()
            .hot_modules
            .entry(owner.to_string())
            .or_default()
            .push(HotCallback { deps, callback });
    }

    pub(crate) fn set_dispose(&self, owner: &str, callback: DataCallback) {
        self.inner.state.lock().dispose.insert(owner.to_string(), callback);
    }

    pub(crate) fn set_prune(&self, owner: &str, callback: DataCallback) {
        self.inner.state.lock().prune.insert(owner.to_string(), callback);
    }

    pub(crate) fn add_listener(&self, owner: &str, event: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        let mut state = self.inner.state.lock();
        state
            .listeners
            .entry(event.to_string())
            .or_default()
            .push((id, listener));
        state
            .owner_listeners
            .entry(owner.to_string())
            .or_default()
            .push((event.to_string(), id));
        id
    }

    pub(crate) fn remove_listener(&self, owner: &str, event: &str, id: ListenerId) -> bool {
        let mut state = self.inner.state.lock();
        if let Some(owned) = state.owner_listeners.get_mut(owner) {
            owned.retain(|(e, l)| !(e == event && *l == id));
        }
        remove_listener_entry(&mut state.listeners, event, id)
    }
}

fn remove_listener_entry(
    listeners: &mut FxHashMap<String, Vec<(ListenerId, Listener)>>,
    event: &str,
    id: ListenerId,
) -> bool {
    let Some(registered) = listeners.get_mut(event) else {
        return false;
    };
    let before = registered.len();
    registered.retain(|(l, _)| *l != id);
    let removed = registered.len() != before;
    if registered.is_empty() {
        listeners.remove(event);
    }
    removed
}

impl fmt::Debug for HmrClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("HmrClient")
            .field("hot_modules", &state.hot_modules.keys().collect::<Vec<_>>())
            .field("listeners", &state.listeners.keys().collect::<Vec<_>>())
            .field("pending_messages", &self.inner.messenger.pending())
            .finish()
    }
}
