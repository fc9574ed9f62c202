//! Run-once pool of loop bodies that are re-invoked until cancelled.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt as _;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};

/// One iteration of a worker loop. Receives the worker's cancellation token.
pub type LoopBody = Box<dyn FnMut(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

/// Box a closure returning a future into a [`LoopBody`].
pub fn loop_body<F, Fut>(mut f: F) -> LoopBody
where
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |cancel| f(cancel).boxed())
}

/// How a worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Its token was cancelled between iterations.
    Cancelled,
    /// An iteration reported an interruption.
    Interrupted,
    /// Shutdown aborted it mid-iteration.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub name: String,
    pub exit: WorkerExit,
}

struct Worker {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<WorkerExit>,
}

pub struct WorkerPool {
    started: AtomicBool,
    workers: Mutex<Vec<Worker>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Start one task per named loop body. Must be called from within a tokio
    /// runtime, and only once per pool.
    pub fn run(&self, bodies: Vec<(String, LoopBody)>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::illegal_state("Worker pool already running"));
        }

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for (name, body) in bodies {
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(drive(name.clone(), body, cancel.clone()));
            log::info!("Started worker {}", name);
            workers.push(Worker {
                name,
                cancel,
                handle,
            });
        }
        Ok(())
    }

    /// Whether each worker's task has ended, by name.
    pub fn finished(&self) -> Vec<(String, bool)> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers
            .iter()
            .map(|w| (w.name.clone(), w.handle.is_finished()))
            .collect()
    }

    /// Cancel every worker, give each up to `grace` to return on its own, then
    /// abort whatever is still running.
    pub async fn shutdown(&self, grace: Duration) -> Vec<WorkerReport> {
        let workers: Vec<Worker> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *workers)
        };

        for worker in &workers {
            worker.cancel.cancel();
        }

        let mut reports = Vec::with_capacity(workers.len());
        for mut worker in workers {
            let exit = match tokio::time::timeout(grace, &mut worker.handle).await {
                Ok(Ok(exit)) => exit,
                Ok(Err(e)) => {
                    log::error!("Worker {} ended abnormally: {}", worker.name, e);
                    WorkerExit::Aborted
                }
                Err(_) => {
                    worker.handle.abort();
                    match worker.handle.await {
                        Ok(exit) => exit,
                        Err(_) => WorkerExit::Aborted,
                    }
                }
            };
            log::info!("Worker {} stopped: {:?}", worker.name, exit);
            reports.push(WorkerReport {
                name: worker.name,
                exit,
            });
        }
        reports
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep for `duration`, or report an interruption if `cancel` fires first.
pub async fn pause(cancel: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AppError::interrupted()),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

async fn drive(name: String, mut body: LoopBody, cancel: CancellationToken) -> WorkerExit {
    while !cancel.is_cancelled() {
        let iteration = AssertUnwindSafe(body(cancel.clone())).catch_unwind().await;
        match iteration {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_interrupted() => {
                log::warn!("Worker {} interrupted, stopping", name);
                cancel.cancel();
                return WorkerExit::Interrupted;
            }
            Ok(Err(e)) => log::error!("Worker {} iteration failed: {}", name, e),
            Err(_) => log::error!("Worker {} iteration panicked", name),
        }
    }
    WorkerExit::Cancelled
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;
    use crate::error::ErrorKind;

    fn counting(counter: &Arc<AtomicUsize>) -> LoopBody {
        let counter = Arc::clone(counter);
        loop_body(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn second_run_is_illegal() {
        let pool = WorkerPool::new();
        pool.run(Vec::new()).unwrap();
        let err = pool.run(Vec::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[tokio::test]
    async fn shutdown_stops_invoking_bodies() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new();
        pool.run(vec![("count".to_string(), counting(&counter))])
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let reports = pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].exit, WorkerExit::Cancelled);

        let after = counter.load(Ordering::SeqCst);
        assert!(after > 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn errors_do_not_stop_the_loop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let body_counter = Arc::clone(&counter);
        let pool = WorkerPool::new();
        pool.run(vec![(
            "flaky".to_string(),
            loop_body(move |_| {
                let counter = Arc::clone(&body_counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    if n < 3 {
                        Err(AppError::other("transient"))
                    } else {
                        Ok(())
                    }
                }
            }),
        )])
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(counter.load(Ordering::SeqCst) > 3);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[allow(clippy::panic)]
    #[tokio::test]
    async fn panicking_iteration_is_absorbed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let body_counter = Arc::clone(&counter);
        let pool = WorkerPool::new();
        pool.run(vec![(
            "buggy".to_string(),
            loop_body(move |_| {
                let counter = Arc::clone(&body_counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    if n == 0 {
                        panic!("first iteration bug");
                    }
                    Ok(())
                }
            }),
        )])
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(counter.load(Ordering::SeqCst) > 1);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn interruption_ends_only_that_worker() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new();
        pool.run(vec![
            (
                "interrupted".to_string(),
                loop_body(|_| async { Err(AppError::interrupted()) }),
            ),
            ("steady".to_string(), counting(&counter)),
        ])
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let finished = pool.finished();
        assert_eq!(
            finished,
            [("interrupted".to_string(), true), ("steady".to_string(), false)]
        );

        let reports = pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(reports[0].exit, WorkerExit::Interrupted);
        assert_eq!(reports[1].exit, WorkerExit::Cancelled);
    }

    #[tokio::test]
    async fn stuck_worker_is_aborted_after_grace() {
        let pool = WorkerPool::new();
        pool.run(vec![(
            "stuck".to_string(),
            loop_body(|_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }),
        )])
        .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let reports = pool.shutdown(Duration::from_millis(20)).await;
        assert_eq!(reports[0].exit, WorkerExit::Aborted);
    }
}
