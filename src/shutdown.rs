//! Shutdown manager for graceful termination.
//!
//! Shutdown starts either on ctrl-c or when any task cancels the shared
//! token (the sync loop does so on a fatal error).

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Manages graceful shutdown of the daemon's tasks
pub struct ShutdownManager {
    /// Token to signal shutdown to all tasks
    cancel_token: CancellationToken,
    /// Handles to all spawned tasks
    task_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    /// Get a clone of the cancellation token for spawning tasks
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Register a task handle for shutdown coordination
    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    pub fn register_all(&mut self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.task_handles.extend(handles);
    }

    /// Wait for ctrl-c or cancellation, then give tasks 10s to finish.
    pub async fn wait_for_shutdown(mut self) {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => tracing::info!("🛑 Shutdown signal received"),
                    Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
                }
            }
            _ = self.cancel_token.cancelled() => {
                tracing::info!("🛑 Shutdown requested");
            }
        }

        // Signal all tasks to stop
        self.cancel_token.cancel();

        let timeout = tokio::time::Duration::from_secs(10);
        let shutdown_tasks = std::pin::pin!(async {
            for handle in self.task_handles.drain(..) {
                let _ = handle.await;
            }
        });

        match tokio::time::timeout(timeout, shutdown_tasks).await {
            Ok(_) => {
                tracing::info!("✓ All tasks shut down gracefully");
            }
            Err(_) => {
                tracing::warn!("⏱️  Shutdown timeout: Some tasks did not complete");
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
