use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

/// A bounded pool of workers on the tokio runtime.
///
/// At most `size` submitted tasks run at once; the rest wait for a permit in
/// submission order. Submission never blocks and never rejects.
#[derive(Clone)]
pub struct WorkerPool {
    name: &'static str,
    size: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name,
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    #[cfg(test)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently idle.
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn spawn<F, T>(&self, task: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        let name = self.name;
        tokio::spawn(async move {
            // the semaphore is never closed
            let _permit = permits.acquire_owned().await;
            debug!(pool = name, "worker started");
            task.await
        })
    }
}
