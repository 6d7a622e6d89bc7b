//! Fire-and-forget background jobs.
//!
//! Request handlers hand side effects (mail, observer pushes) to a bounded
//! queue. A single worker drains it and runs every job on its own task,
//! with a semaphore capping how many run at once. Failures are logged here
//! and never reach the code that submitted the job.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

/// Error type returned by background jobs.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

struct Job {
    label: &'static str,
    run: BoxFuture<'static, Result<(), JobError>>,
}

/// Handle for submitting background jobs. Cheap to clone.
#[derive(Clone)]
pub struct Background {
    tx: mpsc::Sender<Job>,
}

impl Background {
    /// Start the worker. `capacity` bounds the queue, `concurrency` the
    /// number of jobs running at the same time.
    pub fn start(capacity: usize, concurrency: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        tokio::spawn(run_worker(rx, Arc::new(Semaphore::new(concurrency))));
        Self { tx }
    }

    /// Queue a job. When the queue is full the job is dropped with a warning.
    pub fn spawn<F>(&self, label: &'static str, fut: F)
    where
        F: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let job = Job {
            label,
            run: Box::pin(fut),
        };

        if let Err(e) = self.tx.try_send(job) {
            match e {
                mpsc::error::TrySendError::Full(job) => {
                    tracing::warn!(task = job.label, "Background queue full, dropping job");
                }
                mpsc::error::TrySendError::Closed(job) => {
                    tracing::error!(task = job.label, "Background worker stopped, dropping job");
                }
            }
        }
    }
}

async fn run_worker(mut rx: mpsc::Receiver<Job>, semaphore: Arc<Semaphore>) {
    while let Some(job) = rx.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = job.run.await {
                tracing::error!(task = job.label, "Background job failed: {}", e);
            }
        });
    }
}
