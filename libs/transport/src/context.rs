//! Execution context
//!
//! One dedicated OS thread driving a single-threaded tokio runtime. All
//! socket I/O of a client or a server is multiplexed on it; other threads
//! hand work over through [`IoContext::handle`]. Stopping the context drops
//! the runtime, which abandons every task still running on it.

use crate::error::{Result, TransportError};
use std::fmt;
use std::thread::{self, JoinHandle};
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub struct IoContext {
    name: String,
    handle: Handle,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl IoContext {
    /// Build the runtime and start the thread that drives it
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TransportError::runtime_with_source("Failed to build runtime", e))?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                runtime.block_on(async {
                    // Sender dropped or fired: either way we are done.
                    let _ = shutdown_rx.await;
                });
                // Dropping the runtime here cancels every remaining task.
            })
            .map_err(|e| TransportError::runtime_with_source("Failed to spawn context thread", e))?;

        debug!(context = %name, "Execution context started");

        Ok(Self {
            name,
            handle,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Handle for scheduling tasks onto the context
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the runtime and join its thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                // Called from a task on this context; the thread exits on its own.
                return;
            }
            if thread.join().is_err() {
                warn!(context = %self.name, "Execution context thread panicked");
            }
            debug!(context = %self.name, "Execution context stopped");
        }
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoContext")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}
