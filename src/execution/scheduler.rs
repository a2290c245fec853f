//! Bounded worker pool for sibling and loop fan-out
//!
//! Each fan-out point builds its own scheduler. Results come back in
//! dispatch order regardless of completion order.

use crate::core::error::ExecutionError;
use futures::future::BoxFuture;
use std::any::Any;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// A unit of work handed to the pool
pub type Job<T> = BoxFuture<'static, Result<T, ExecutionError>>;

/// Strategy for scheduling jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingStrategy {
    /// One job at a time, in order
    #[default]
    Sequential,

    /// Every job at once
    Parallel,

    /// Limited parallelism (max N concurrent jobs)
    LimitedParallel(usize),
}

pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
    cancel: CancellationToken,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a job on its own task so a panic becomes an error
async fn guarded<T: Send + 'static>(job: Job<T>) -> Result<T, ExecutionError> {
    match tokio::spawn(job).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            error!("Worker panicked: {}", message);
            Err(ExecutionError::Panicked(message))
        }
        Err(_) => Err(ExecutionError::Cancelled),
    }
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy, cancel: CancellationToken) -> Self {
        Self { strategy, cancel }
    }

    /// Workers started for `jobs` jobs
    pub fn worker_count(&self, jobs: usize) -> usize {
        let limit = match self.strategy {
            SchedulingStrategy::Sequential => 1,
            SchedulingStrategy::Parallel => jobs,
            SchedulingStrategy::LimitedParallel(max) => max.min(jobs),
        };
        limit.max(1)
    }

    /// Run every job and collect results in dispatch order.
    ///
    /// Cancellation is checked before each dispatch; jobs never dispatched
    /// report `Cancelled`.
    pub async fn run_all<T: Send + 'static>(&self, jobs: Vec<Job<T>>) -> Vec<Result<T, ExecutionError>> {
        let total = jobs.len();
        let workers = self.worker_count(total);
        let mut results: Vec<Option<Result<T, ExecutionError>>> = (0..total).map(|_| None).collect();

        let mut pending = jobs.into_iter().enumerate();
        let mut running = JoinSet::new();

        loop {
            while running.len() < workers && !self.cancel.is_cancelled() {
                match pending.next() {
                    Some((index, job)) => {
                        running.spawn(async move { (index, guarded(job).await) });
                    }
                    None => break,
                }
            }

            match running.join_next().await {
                Some(Ok((index, result))) => results[index] = Some(result),
                Some(Err(e)) => error!("Worker task failed: {}", e),
                None => break,
            }
        }

        results
            .into_iter()
            .map(|result| result.unwrap_or(Err(ExecutionError::Cancelled)))
            .collect()
    }
}
