//! Worker pool: a small set of tasks draining one job queue.
//!
//! DHT listen callbacks and request handlers enqueue here instead of
//! doing I/O inline; each job runs to completion on one worker.
//! Shutdown closes the queue and joins every worker.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub(crate) type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

const QUEUE_DEPTH: usize = 256;

pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = rx.lock().await;
                            rx.recv().await
                        };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    tracing::trace!(worker, "worker drained");
                })
            })
            .collect();

        Self { tx, handles }
    }

    /// Enqueue a job. Returns false if the engine is shutting down.
    pub async fn submit<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx.send(Box::pin(job)).await.is_ok()
    }

    /// A handle for submitting jobs without holding the pool itself.
    pub(crate) fn sender(&self) -> mpsc::Sender<Job> {
        self.tx.clone()
    }

    /// Close the queue and join all workers (remaining jobs finish).
    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn jobs_run_to_completion() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            assert!(
                pool.submit(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await
            );
        }
        pool.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails_gracefully() {
        let pool = WorkerPool::new(1);
        let tx = pool.tx.clone();
        pool.shutdown().await;
        assert!(tx.send(Box::pin(async {})).await.is_err());
    }
}
