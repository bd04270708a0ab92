use std::future::Future;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to a background task started with [`BackgroundWorker::spawn`].
///
/// The task receives a stop signal it is expected to `select!` on. Dropping the
/// handle signals and aborts; [`BackgroundWorker::stop`] signals and waits.
pub struct BackgroundWorker {
    name: &'static str,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub fn spawn<F, Fut>(name: &'static str, task: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = oneshot::channel();
        let join_handle = tokio::spawn(task(stop_rx));
        debug!(worker = name, "background worker started");
        Self {
            name,
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            if let Err(err) = join_handle.await {
                warn!(worker = self.name, error = %err, "background worker join failed");
            }
        }
        debug!(worker = self.name, "background worker stopped");
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn stop_waits_for_the_task() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let worker = BackgroundWorker::spawn("test", move |stop_rx| async move {
            let _ = stop_rx.await;
            flag.store(true, Ordering::SeqCst);
        });

        worker.stop().await;
        assert!(finished.load(Ordering::SeqCst));
    }
}
