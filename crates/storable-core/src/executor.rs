//! Where blocking cell work runs
//!
//! Backend reads, writes, conversions and migration are submitted as jobs to
//! an [`Executor`]. Results come back through a oneshot channel, so awaiting
//! them does not tie callers to a particular async runtime.

use crate::error::ExecutorError;
use crossbeam::channel::{self, Sender};
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tokio::runtime::Handle;

/// Unit of work submitted to an executor
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs cell jobs
pub trait Executor: Send + Sync {
    /// Submit a job
    ///
    /// # Errors
    /// Returns `ExecutorError` if the job cannot be accepted.
    fn execute(&self, job: Job) -> Result<(), ExecutorError>;
}

impl<E> Executor for Arc<E>
where
    E: Executor + ?Sized,
{
    #[inline]
    fn execute(&self, job: Job) -> Result<(), ExecutorError> {
        (**self).execute(job)
    }
}

/// One dedicated worker thread, jobs run in submission order
///
/// A panicking job is logged and the worker moves on to the next one. The
/// worker exits once the executor is dropped and the queue drains.
pub struct SequentialExecutor {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
}

impl SequentialExecutor {
    /// Spawn the worker thread
    ///
    /// # Errors
    /// Returns the I/O error if the thread cannot be spawned.
    pub fn new(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = channel::unbounded::<Job>();

        thread::Builder::new().name(name.clone()).spawn(move || {
            for job in receiver {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    tracing::error!(
                        worker = %thread::current().name().unwrap_or("storable"),
                        panic = %panic_message(payload.as_ref()),
                        "cell job panicked"
                    );
                }
            }
        })?;

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
        })
    }

    /// Worker thread name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop accepting jobs; queued jobs still run
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }
}

impl Executor for SequentialExecutor {
    fn execute(&self, job: Job) -> Result<(), ExecutorError> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(ExecutorError::Shutdown)?;
        sender.send(job).map_err(|_| ExecutorError::Shutdown)
    }
}

impl fmt::Debug for SequentialExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialExecutor")
            .field("name", &self.name)
            .field("open", &self.sender.lock().is_some())
            .finish()
    }
}

/// Runs each job inline on the submitting thread
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateExecutor;

impl ImmediateExecutor {
    /// Create executor
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Executor for ImmediateExecutor {
    fn execute(&self, job: Job) -> Result<(), ExecutorError> {
        job();
        Ok(())
    }
}

/// Runs jobs on the tokio blocking pool
///
/// Jobs may run concurrently and complete in any order.
#[derive(Debug, Clone, Default)]
pub struct BlockingExecutor {
    runtime: Option<Handle>,
}

impl BlockingExecutor {
    /// Create executor bound to the current runtime, if any
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            runtime: Handle::try_current().ok(),
        }
    }

    /// Create executor bound to `runtime`
    #[inline]
    #[must_use]
    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            runtime: Some(runtime),
        }
    }
}

impl Executor for BlockingExecutor {
    fn execute(&self, job: Job) -> Result<(), ExecutorError> {
        let runtime = Handle::try_current()
            .ok()
            .or_else(|| self.runtime.clone())
            .ok_or(ExecutorError::NoRuntime)?;
        // Dropped join handle detaches the job
        drop(runtime.spawn_blocking(job));
        Ok(())
    }
}

/// Submit `job` and await its result
///
/// The job is submitted immediately; the returned future only waits.
pub(crate) fn submit<R, F>(
    executor: &dyn Executor,
    job: F,
) -> impl Future<Output = Result<R, ExecutorError>> + Send + 'static
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    let submitted = executor.execute(Box::new(move || {
        // Receiver gone means the caller stopped waiting
        let _ = sender.send(job());
    }));

    async move {
        submitted?;
        receiver.await.map_err(|_| ExecutorError::Dropped)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
