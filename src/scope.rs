//! Scoped cleanup for test resources.

use crate::config::MockConfig;
use crate::error::HarnessError;
use crate::mock::MockEndpoint;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

type CleanupFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

enum Cleanup {
    Sync(Box<dyn FnOnce() -> anyhow::Result<()> + Send>),
    Async(CleanupFuture),
}

struct Action {
    name: String,
    cleanup: Cleanup,
}

/// Runs registered cleanup actions in reverse order when closed or dropped.
///
/// Failures are logged and never returned; later actions still run.
#[derive(Default)]
pub struct ResourceScope {
    actions: Vec<Action>,
    closed: bool,
}

impl ResourceScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous cleanup action.
    pub fn defer<F>(&mut self, name: impl Into<String>, cleanup: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.push(name.into(), Cleanup::Sync(Box::new(cleanup)));
    }

    /// Register an asynchronous cleanup action.
    pub fn defer_async<F>(&mut self, name: impl Into<String>, cleanup: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.push(name.into(), Cleanup::Async(Box::pin(cleanup)));
    }

    fn push(&mut self, name: String, cleanup: Cleanup) {
        debug!(resource = %name, "Cleanup registered");
        self.closed = false;
        self.actions.push(Action { name, cleanup });
    }

    /// Start a mock endpoint whose teardown is owned by this scope.
    pub async fn mock_endpoint(
        &mut self,
        config: MockConfig,
    ) -> Result<Arc<MockEndpoint>, HarnessError> {
        let endpoint = Arc::new(MockEndpoint::start(config).await?);
        let owned = Arc::clone(&endpoint);
        self.defer_async(format!("mock endpoint {}", endpoint.addr()), async move {
            owned.teardown().await;
            Ok(())
        });
        Ok(endpoint)
    }

    /// Number of pending cleanup actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Run every pending action, newest first. Idempotent.
    pub async fn close(&mut self) {
        while let Some(Action { name, cleanup }) = self.actions.pop() {
            let outcome = match cleanup {
                Cleanup::Sync(cleanup) => cleanup(),
                Cleanup::Async(cleanup) => cleanup.await,
            };
            match outcome {
                Ok(()) => debug!(resource = %name, "Cleanup done"),
                Err(err) => warn!(resource = %name, error = %err, "Cleanup failed"),
            }
        }
        self.closed = true;
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        if self.actions.is_empty() {
            return;
        }
        let runtime = tokio::runtime::Handle::try_current().ok();
        while let Some(Action { name, cleanup }) = self.actions.pop() {
            match cleanup {
                Cleanup::Sync(cleanup) => {
                    if let Err(err) = cleanup() {
                        warn!(resource = %name, error = %err, "Cleanup failed");
                    }
                }
                Cleanup::Async(cleanup) => match &runtime {
                    Some(handle) => {
                        handle.spawn(async move {
                            if let Err(err) = cleanup.await {
                                warn!(resource = %name, error = %err, "Cleanup failed");
                            }
                        });
                    }
                    None => warn!(resource = %name, "No runtime available, cleanup skipped"),
                },
            }
        }
    }
}
