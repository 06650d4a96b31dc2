//! Workers: sequential task queues running on the tokio thread pool
//!
//! A worker drains its queue one job at a time, so every job posted to the
//! same worker runs in submission order and never overlaps another. Jobs
//! posted to different workers run concurrently.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Name of the worker shared by services that do not ask for another one
pub const DEFAULT_WORKER: &str = "default";

/// Handle to a sequential task queue
#[derive(Clone)]
pub struct Worker {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Job>,
}

impl Worker {
    /// Spawn a new worker loop on the current tokio runtime
    pub fn spawn(name: &str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let name: Arc<str> = Arc::from(name);

        let loop_name = name.clone();
        tokio::spawn(async move {
            log::debug!("[{}] Worker started", loop_name);
            while let Some(job) = rx.recv().await {
                if AssertUnwindSafe(job()).catch_unwind().await.is_err() {
                    log::error!("[{}] Job panicked", loop_name);
                }
            }
            log::debug!("[{}] Worker stopped", loop_name);
        });

        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker loop still accepts jobs
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a job without waiting for it
    pub fn post<F, Fut>(&self, job: F) -> Result<(), WorkerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tx
            .send(Box::new(move || job().boxed()))
            .map_err(|_| WorkerError::Closed(self.name.to_string()))
    }

    /// Queue a job now and return a future resolving to its result
    pub fn submit<F, Fut, T>(&self, job: F) -> Pending<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let posted = self.post(move || async move {
            let _ = tx.send(job().await);
        });

        match posted {
            Ok(()) => Pending {
                worker: self.name.clone(),
                rx: Some(rx),
            },
            Err(_) => Pending {
                worker: self.name.clone(),
                rx: None,
            },
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("name", &self.name).finish()
    }
}

/// Result of a job submitted to a worker
#[must_use = "the job runs regardless, but its result is only observable by awaiting"]
pub struct Pending<T> {
    worker: Arc<str>,
    rx: Option<oneshot::Receiver<T>>,
}

impl<T> Unpin for Pending<T> {}

impl<T> Future for Pending<T> {
    type Output = Result<T, WorkerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let worker = self.worker.clone();
        match self.rx.as_mut() {
            None => Poll::Ready(Err(WorkerError::Closed(worker.to_string()))),
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.map_err(|_| WorkerError::Dropped(worker.to_string()))),
        }
    }
}

/// Named workers, created on demand
pub struct Workers {
    default: Worker,
    named: RwLock<HashMap<String, Worker>>,
}

impl Workers {
    pub fn new() -> Self {
        Self::with_default(DEFAULT_WORKER)
    }

    /// Workers whose default queue is called `name`
    pub fn with_default(name: &str) -> Self {
        Self {
            default: Worker::spawn(name),
            named: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_worker(&self) -> Worker {
        self.default.clone()
    }

    /// Get a named worker, spawning it on first use
    pub fn get_or_spawn(&self, name: &str) -> Worker {
        if name == DEFAULT_WORKER || name == self.default.name() {
            return self.default_worker();
        }

        if let Some(worker) = self
            .named
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return worker.clone();
        }

        self.named
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| Worker::spawn(name))
            .clone()
    }

    /// Names of the workers created so far, default excluded
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .named
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }

    /// Drop the named workers; their loops end once in-flight jobs complete
    pub fn clear(&self) {
        self.named
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for Workers {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors raised when talking to a worker
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker '{0}' is closed")]
    Closed(String),

    #[error("Worker '{0}' dropped the job before completing it")]
    Dropped(String),
}
