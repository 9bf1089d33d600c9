//! Handle on the background generation task.

use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
use tokio::{task::JoinHandle, sync::Notify};

/// A handle for managing the background task that runs the generation loop.
///
/// The task observes `running` between steps and sleeps on `notifier` while
/// idle. Dropping the handle asks the task to stop; it finishes the step in
/// flight and exits.
pub(crate) struct WorkerHandle {
    running: Arc<AtomicBool>,
    /// Becomes `None` once [`WorkerHandle::join`] has awaited the task
    handle: Option<JoinHandle<()>>,
    notifier: Arc<Notify>,
}

impl WorkerHandle {
    /// Spawns the task built by `task` from the shared running flag and notifier.
    pub(crate) fn new<F>(task: F) -> Self
    where
        F: FnOnce(Arc<AtomicBool>, Arc<Notify>) -> JoinHandle<()>,
    {
        let running = Arc::new(AtomicBool::new(true));
        let notifier = Arc::new(Notify::new());
        let handle = task(running.clone(), notifier.clone());

        Self {
            running,
            handle: Some(handle),
            notifier,
        }
    }

    /// Wakes the task so it looks at the waiting queue.
    pub(crate) fn notify(&self) {
        self.notifier.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Asks the task to stop after its current step.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.notify_one();
    }

    /// Stops the task and waits for it to exit.
    pub(crate) async fn join(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
