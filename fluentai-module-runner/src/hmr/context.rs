//! The per-module HMR handle exposed as `import.meta.hot`

use crate::hmr::client::{HmrClient, HotData, ListenerId};
use crate::hmr::INVALIDATE_EVENT;
use crate::value::Namespace;
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Hot module API bound to one module id.
///
/// Creating a context for an owner drops the accept callbacks and
/// listeners registered by the owner's previous execution.
#[derive(Clone, Debug)]
pub struct HotContext {
    client: HmrClient,
    owner: Arc<str>,
}

impl HotContext {
    /// Create the context of `owner`
    pub fn new(client: &HmrClient, owner: &str) -> Self {
        client.reset_owner(owner);
        Self {
            client: client.clone(),
            owner: Arc::from(owner),
        }
    }

    /// Module id this context belongs to
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Data kept across this module's hot updates
    pub fn data(&self) -> HotData {
        self.client.data(&self.owner)
    }

    /// Accept updates of this module without a callback
    pub fn accept(&self) {
        self.accept_self(|_| Ok(()));
    }

    /// Accept updates of this module
    pub fn accept_self<F>(&self, callback: F)
    where
        F: Fn(Option<Namespace>) -> Result<()> + Send + Sync + 'static,
    {
        self.accept_deps(vec![self.owner.to_string()], move |mut modules| {
            callback(modules.pop().flatten())
        });
    }

    /// Accept updates of one dependency
    pub fn accept_dep<F>(&self, dep: &str, callback: F)
    where
        F: Fn(Option<Namespace>) -> Result<()> + Send + Sync + 'static,
    {
        self.accept_deps(vec![dep.to_string()], move |mut modules| {
            callback(modules.pop().flatten())
        });
    }

    /// Accept updates of several dependencies. The callback receives one
    /// slot per dependency, filled for the dependency that was updated.
    pub fn accept_deps<F>(&self, deps: Vec<String>, callback: F)
    where
        F: Fn(Vec<Option<Namespace>>) -> Result<()> + Send + Sync + 'static,
    {
        self.client.register_accept(&self.owner, deps, Arc::new(callback));
    }

    /// Accept updates of this module that only change the named exports.
    ///
    /// Export names matter to the server's propagation only.
    pub fn accept_exports<F>(&self, _names: &[&str], callback: F)
    where
        F: Fn(Option<Namespace>) -> Result<()> + Send + Sync + 'static,
    {
        self.accept_self(callback);
    }

    /// Run before this module is replaced
    pub fn dispose<F>(&self, callback: F)
    where
        F: Fn(&HotData) + Send + Sync + 'static,
    {
        self.client.set_dispose(&self.owner, Arc::new(callback));
    }

    /// Run when this module is no longer imported
    pub fn prune<F>(&self, callback: F)
    where
        F: Fn(&HotData) + Send + Sync + 'static,
    {
        self.client.set_prune(&self.owner, Arc::new(callback));
    }

    /// Ask for this update to propagate to importers instead
    pub fn invalidate(&self, message: &str) {
        let data = json!({ "path": &*self.owner, "message": message });
        self.client.notify_listeners(INVALIDATE_EVENT, &data);
        self.send(INVALIDATE_EVENT, data);
        if message.is_empty() {
            debug!("Invalidate {}", self.owner);
        } else {
            debug!("Invalidate {}: {}", self.owner, message);
        }
    }

    /// Listen to an event
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        self.client.add_listener(&self.owner, event, Arc::new(listener))
    }

    /// Remove a listener registered through this module
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.client.remove_listener(&self.owner, event, id)
    }

    /// Send a custom event to the server
    pub fn send(&self, event: &str, data: Value) {
        let message = json!({ "type": "custom", "event": event, "data": data });
        self.client.messenger().send(message.to_string());
    }
}
