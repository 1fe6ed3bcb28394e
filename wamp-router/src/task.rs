//! Long-lived task scaffolding: cooperative shutdown, abort-on-drop join
//! handles and a registry joining everything on close.

use std::future::Future;

use async_trait::async_trait;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct ShutdownHandle(tokio::sync::watch::Sender<()>);

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = tokio::sync::watch::channel(());
        (Self(sender), ShutdownSignal(receiver))
    }

    pub fn signal(&self) {
        let _ = self.0.send(());
    }

    /// Resolves once every `ShutdownSignal` clone has been dropped, i.e.
    /// every task observing the signal has terminated.
    pub async fn all_closed(&self) {
        self.0.closed().await;
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal(tokio::sync::watch::Receiver<()>);

impl ShutdownSignal {
    pub async fn wait(&mut self) {
        let _ = self.0.changed().await;
    }
}

/// Aborts the running task when dropped.
#[must_use]
pub struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        ChildTask(tokio::task::spawn(future))
    }

    pub async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    /// Immediately abort the task.
    pub fn abort(&self) {
        self.0.abort();
    }

    /// Drop without aborting the task.
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> From<JoinHandle<T>> for ChildTask<T> {
    fn from(value: JoinHandle<T>) -> Self {
        Self(value)
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

/// A named long-lived unit of the router.
#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output;
}

pub fn spawn_task<T>(task: T, shutdown_signal: ShutdownSignal) -> ChildTask<T::Output>
where
    T: Task + Send + 'static,
    T::Output: 'static,
{
    ChildTask(tokio::task::spawn(task.run(shutdown_signal)))
}

/// Registry of the spawned long-lived tasks sharing one shutdown signal.
///
/// The router registers every realm, server and monitor task here and joins
/// them all before `close()` returns.
pub struct TaskSet {
    inner: Vec<ChildTask<anyhow::Result<()>>>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
}

impl TaskSet {
    pub fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
        TaskSet {
            inner: Vec::new(),
            shutdown_handle,
            shutdown_signal,
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown_signal.clone()
    }

    pub fn register<T>(&mut self, task: T)
    where
        T: Task<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = T::NAME;
        let child = spawn_task(task, self.shutdown_signal.clone());
        tracing::debug!(task = name, "Task registered");
        self.inner.push(child);
    }

    /// Signals shutdown and joins every registered task, logging failures.
    pub async fn shut_down(self) {
        let TaskSet {
            inner,
            shutdown_handle,
            shutdown_signal,
        } = self;
        drop(shutdown_signal);

        shutdown_handle.signal();

        for child in inner {
            match child.join().await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => tracing::error!(error = format!("{error:#}"), "A task failed"),
                Err(error) => tracing::error!(%error, "Something went very wrong with a task"),
            }
        }
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    struct WaitsForShutdown {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Task for WaitsForShutdown {
        type Output = anyhow::Result<()>;

        const NAME: &'static str = "waits for shutdown";

        async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
            shutdown_signal.wait().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn task_set_joins_tasks_on_shutdown() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut tasks = TaskSet::new();
        tasks.register(WaitsForShutdown {
            stopped: Arc::clone(&stopped),
        });

        tasks.shut_down().await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn aborting_a_child_task_cancels_it() {
        let child = ChildTask::spawn(async {
            futures::future::pending::<()>().await;
        });
        child.abort();
        let err = child.join().await.expect_err("task should have been cancelled");
        assert!(err.is_cancelled());
    }
}
