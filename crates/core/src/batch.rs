use std::future::Future;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::{Error, Result};

#[derive(Debug)]
pub struct BatchOutcome<T, R> {
    pub item: T,
    pub result: Result<R>,
}

impl<T, R> BatchOutcome<T, R> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs work items in consecutive fixed-size chunks. Every member of a chunk
/// gets its own task; the next chunk is only started once the whole chunk
/// has settled (plus `pause`). Failures and panics stay confined to their
/// own item.
pub struct BoundedBatchRunner<T> {
    pending: std::vec::IntoIter<T>,
    concurrency: usize,
    pause: Duration,
    batches_started: usize,
}

impl<T> BoundedBatchRunner<T>
where
    T: Clone,
{
    pub fn new(items: Vec<T>, concurrency: usize, pause: Duration) -> Self {
        Self {
            pending: items.into_iter(),
            concurrency: concurrency.max(1),
            pause,
            batches_started: 0,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Settles the next chunk and returns its outcomes in input order, or
    /// `None` once every item has been handed out.
    pub async fn next_batch<R, F, Fut>(&mut self, work: &F) -> Option<Vec<BatchOutcome<T, R>>>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        if self.pending.as_slice().is_empty() {
            return None;
        }
        if self.batches_started > 0 && !self.pause.is_zero() {
            tokio::time::sleep(self.pause).await;
        }

        let chunk: Vec<T> = self.pending.by_ref().take(self.concurrency).collect();
        let batch_no = self.batches_started;
        self.batches_started += 1;

        let mut workers = JoinSet::new();
        for (slot, item) in chunk.iter().cloned().enumerate() {
            let fut = work(item);
            workers.spawn(async move { (slot, fut.await) });
        }

        let mut settled: Vec<Option<Result<R>>> = (0..chunk.len()).map(|_| None).collect();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((slot, res)) => settled[slot] = Some(res),
                Err(e) => {
                    error!(
                        event = "batch.worker_failed",
                        batch_no = batch_no as u64,
                        error = %e,
                        "batch.worker_failed"
                    );
                }
            }
        }

        let outcomes: Vec<BatchOutcome<T, R>> = chunk
            .into_iter()
            .zip(settled)
            .map(|(item, res)| BatchOutcome {
                item,
                result: res.unwrap_or_else(|| {
                    Err(Error::Task {
                        message: "worker task panicked".to_string(),
                    })
                }),
            })
            .collect();

        debug!(
            event = "batch.settled",
            batch_no = batch_no as u64,
            size = outcomes.len() as u64,
            failed = outcomes.iter().filter(|o| !o.is_success()).count() as u64,
            "batch.settled"
        );
        Some(outcomes)
    }

    /// Drives every chunk and returns all outcomes in input order.
    pub async fn run<R, F, Fut>(mut self, work: F) -> Vec<BatchOutcome<T, R>>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let mut out = Vec::with_capacity(self.remaining());
        while let Some(batch) = self.next_batch(&work).await {
            out.extend(batch);
        }
        out
    }
}
