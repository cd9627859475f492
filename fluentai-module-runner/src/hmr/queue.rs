//! Strict FIFO execution of hot-update tasks

use crate::{ModuleError, Result};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

struct Job {
    task: BoxFuture<'static, Result<()>>,
    done: oneshot::Sender<Result<()>>,
}

/// Runs submitted tasks one at a time, in submission order.
///
/// A task may enqueue further tasks; those run after every task submitted
/// before them. The worker is spawned on the current Tokio runtime when the
/// first task is submitted.
#[derive(Default)]
pub struct UpdateQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl UpdateQueue {
    /// Create an idle queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a task. It is queued immediately; the returned future resolves
    /// with the task's own result once it has run.
    pub fn enqueue<F>(&self, task: F) -> impl Future<Output = Result<()>> + Send + 'static
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let submitted = self.submit(task.boxed());
        async move {
            match submitted {
                Ok(done) => done.await.unwrap_or_else(|_| {
                    Err(ModuleError::Hmr {
                        message: "update queue worker stopped".to_string(),
                    })
                }),
                Err(e) => Err(e),
            }
        }
    }

    fn submit(&self, task: BoxFuture<'static, Result<()>>) -> Result<oneshot::Receiver<Result<()>>> {
        let (done, receiver) = oneshot::channel();
        let mut sender = self.sender.lock();

        let mut job = Job { task, done };
        if let Some(tx) = sender.as_ref() {
            match tx.send(job) {
                Ok(()) => return Ok(receiver),
                // The worker's runtime went away; start a new one below
                Err(mpsc::error::SendError(rejected)) => job = rejected,
            }
        }

        let handle = Handle::try_current().map_err(|_| ModuleError::Hmr {
            message: "hot updates require a running Tokio runtime".to_string(),
        })?;
        let (tx, jobs) = mpsc::unbounded_channel();
        handle.spawn(run_worker(jobs));
        debug!("Started HMR update worker");

        tx.send(job).map_err(|_| ModuleError::Hmr {
            message: "update queue worker stopped".to_string(),
        })?;
        *sender = Some(tx);
        Ok(receiver)
    }
}

async fn run_worker(mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(Job { task, done }) = jobs.recv().await {
        let result = AssertUnwindSafe(task)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ModuleError::Hmr {
                    message: format!("update task panicked: {}", panic_message(&*panic)),
                })
            });
        if done.send(result).is_err() {
            trace!("Update result dropped: submitter stopped waiting");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
