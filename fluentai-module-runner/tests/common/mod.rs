//! Shared helpers for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use fluentai_module_runner::fetch::{FetchResult, ModuleFetcher, ModuleKind};
use fluentai_module_runner::utils::clean_url;
use fluentai_module_runner::{ModuleError, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Fetcher serving a fixed table of modules and recording every request
#[derive(Clone, Default)]
pub struct TestFetcher {
    modules: Arc<Mutex<FxHashMap<String, FetchResult>>>,
    requests: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl TestFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `code` for `id`, resolving to the file `id`
    pub fn inline(&self, id: &str, code: &str) -> &Self {
        self.modules
            .lock()
            .insert(id.to_string(), FetchResult::inline(code, id));
        self
    }

    /// Serve an externalized module for `id`
    pub fn external(&self, id: &str, locator: &str, kind: Option<ModuleKind>) -> &Self {
        self.modules
            .lock()
            .insert(id.to_string(), FetchResult::external(locator, kind));
        self
    }

    /// Serve a result without code for `id`
    pub fn empty(&self, id: &str) -> &Self {
        self.modules.lock().insert(
            id.to_string(),
            FetchResult::Inline {
                code: None,
                file: Some(id.to_string()),
            },
        );
        self
    }

    /// Number of fetches for `id`
    pub fn fetch_count(&self, id: &str) -> usize {
        self.requests.lock().iter().filter(|(r, _)| r == id).count()
    }

    /// Every `(id, importer)` fetched so far
    pub fn requests(&self) -> Vec<(String, Option<String>)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModuleFetcher for TestFetcher {
    async fn fetch_module(&self, id: &str, importer: Option<&str>) -> Result<FetchResult> {
        self.requests
            .lock()
            .push((id.to_string(), importer.map(str::to_string)));

        let result = self.modules.lock().get(clean_url(id)).cloned();
        result.ok_or_else(|| {
            ModuleError::fetch(
                id,
                std::io::Error::new(std::io::ErrorKind::NotFound, format!("no module {}", id)),
            )
        })
    }
}

/// Execution counts per module
#[derive(Clone, Default)]
pub struct Counter {
    counts: Arc<Mutex<FxHashMap<String, usize>>>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one execution, returning the new count
    pub fn hit(&self, id: &str) -> usize {
        let mut counts = self.counts.lock();
        let count = counts.entry(id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn get(&self, id: &str) -> usize {
        self.counts.lock().get(id).copied().unwrap_or(0)
    }
}

/// Route `tracing` output through the test harness
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
