//! Dispatch of HMR payloads against a runtime

use crate::hmr::connection::UpdateHandler;
use crate::hmr::payload::{HmrPayload, UpdateKind};
use crate::hmr::queue::UpdateQueue;
use crate::hmr::{
    AFTER_UPDATE_EVENT, BEFORE_FULL_RELOAD_EVENT, BEFORE_PRUNE_EVENT, BEFORE_UPDATE_EVENT, ERROR_EVENT,
};
use crate::runtime::{Runtime, WeakRuntime};
use crate::utils::unwrap_id;
use crate::Result;
use futures::future::FutureExt;
use std::sync::Arc;
use tracing::{debug, error};

/// Apply one payload to `runtime`.
///
/// Payloads are dropped when hot reload is disabled or the runtime was
/// closed.
pub async fn handle_hmr_payload(runtime: &Runtime, payload: HmrPayload) -> Result<()> {
    let Some(client) = runtime.hmr_client() else {
        return Ok(());
    };
    if runtime.is_closed() {
        return Ok(());
    }

    match payload {
        HmrPayload::Connected => {
            debug!("HMR connected");
            client.messenger().flush();
        }
        HmrPayload::Update { updates } => {
            let data = serde_json::json!({ "type": "update", "updates": &updates });
            client.notify_listeners(BEFORE_UPDATE_EVENT, &data);

            let mut js_updates = Vec::with_capacity(updates.len());
            for mut update in updates {
                match update.kind {
                    UpdateKind::JsUpdate => {
                        // Modules are cached by their full path, without the
                        // virtual id prefix
                        update.accepted_path = unwrap_id(&update.accepted_path);
                        update.path = unwrap_id(&update.path);
                        js_updates.push(update);
                    }
                    UpdateKind::CssUpdate => {
                        error!("CSS hot updates are not supported by the module runtime: {}", update.path);
                    }
                }
            }
            client.queue_updates(js_updates).await?;

            client.notify_listeners(AFTER_UPDATE_EVENT, &data);
        }
        HmrPayload::Custom { event, data } => {
            client.notify_listeners(&event, &data);
        }
        HmrPayload::FullReload { path, triggered_by } => {
            let entrypoints = runtime.entrypoints();
            let targets: Vec<String> = match &triggered_by {
                Some(file) => entrypoints
                    .into_iter()
                    .filter(|entry| runtime.module_cache().is_imported(file, entry))
                    .collect(),
                None => entrypoints,
            };
            if targets.is_empty() {
                return Ok(());
            }

            debug!("Program reload");
            let data = serde_json::json!({ "type": "full-reload", "path": path, "triggeredBy": triggered_by });
            client.notify_listeners(BEFORE_FULL_RELOAD_EVENT, &data);
            runtime.clear_for_full_reload();

            for id in targets {
                runtime.execute_url(&id).await?;
            }
        }
        HmrPayload::Prune { paths } => {
            let data = serde_json::json!({ "type": "prune", "paths": &paths });
            client.notify_listeners(BEFORE_PRUNE_EVENT, &data);
            client.prune_paths(&paths);
            for path in &paths {
                runtime.module_cache().delete(path);
            }
        }
        HmrPayload::Error { err } => {
            let data = serde_json::json!({ "type": "error", "err": &err });
            client.notify_listeners(ERROR_EVENT, &data);
            error!("Internal server error\n{}\n{}", err.message, err.stack);
        }
    }
    Ok(())
}

/// Build the connection handler of a runtime. Payloads are processed one
/// at a time in arrival order.
pub(crate) fn create_hmr_handler(runtime: WeakRuntime) -> UpdateHandler {
    let queue = Arc::new(UpdateQueue::new());
    Arc::new(move |payload: HmrPayload| {
        let runtime = runtime.clone();
        queue
            .enqueue(async move {
                match runtime.upgrade() {
                    Some(runtime) => handle_hmr_payload(&runtime, payload).await,
                    None => Ok(()),
                }
            })
            .boxed()
    })
}
