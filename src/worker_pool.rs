//! Bounded parallel execution of I/O-bound work, tied to the submitter's work-unit context.

use std::time::Duration;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::instrument;

use crate::{run_tracker::RunTracker, workunit::{Label, WorkUnit}};

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("failed to build worker pool with {0} threads: {1}")]
    Build(usize, rayon::ThreadPoolBuildError),
    #[error("task panicked")]
    TaskPanicked,
}

/// A bounded pool of worker threads. The system is I/O bound (compilation happens in a
/// subprocess), so OS threads via a `rayon` pool are sufficient; no async runtime is needed.
pub struct WorkerPool {
    pool: ThreadPool,
    shutdown_hooks: std::sync::Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl WorkerPool {
    pub fn new(num_threads: usize) -> Result<Self, WorkerPoolError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("mosaic-worker-{i}"))
            .build()
            .map_err(|err| WorkerPoolError::Build(num_threads, err))?;
        Ok(Self { pool, shutdown_hooks: std::sync::Mutex::new(Vec::new()) })
    }

    pub fn register_shutdown_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        self.shutdown_hooks.lock().unwrap().push(hook);
    }

    /// Dispatches `f` over every item of `args`, each running inside a new child work unit
    /// (under `parent`) named `workunit_name` when non-empty, and blocks until every task has
    /// completed. Results are returned in input order; the first error encountered is
    /// propagated to the caller once all tasks have finished. Zero-length input short-circuits
    /// without touching the pool. Each task's timings are folded into `run_tracker`.
    #[instrument(level = "debug", skip(self, parent, run_tracker, args, f))]
    pub fn submit_work_and_wait<T, R, E, F>(
        &self,
        parent: &WorkUnit,
        workunit_name: &str,
        run_tracker: &RunTracker,
        args: Vec<T>,
        f: F,
    ) -> Result<Vec<R>, E>
    where
        T: Send,
        R: Send,
        E: Send,
        F: Fn(T, &WorkUnit) -> Result<R, E> + Send + Sync,
    {
        if args.is_empty() {
            return Ok(Vec::new());
        }

        self.pool.install(|| {
            use rayon::prelude::*;
            args.into_par_iter()
                .map(|arg| {
                    let unit = if workunit_name.is_empty() {
                        parent.clone()
                    } else {
                        parent.child(workunit_name, [Label::Tool])
                    };
                    unit.start();
                    let result = f(arg, &unit);
                    let outcome = if result.is_ok() {
                        crate::workunit::Outcome::Success
                    } else {
                        crate::workunit::Outcome::Failure
                    };
                    unit.set_outcome(outcome);
                    record_timings(&unit, run_tracker);
                    result
                })
                .collect()
        })
    }

    /// Fire-and-forget variant: submits every argument but does not block. `callback` runs on
    /// the worker thread once its task completes. Each task's timings are folded into
    /// `run_tracker` once it finishes.
    pub fn submit_async_work<T, F>(
        &self,
        parent: &WorkUnit,
        workunit_name: &str,
        run_tracker: std::sync::Arc<RunTracker>,
        args: Vec<T>,
        f: F,
    ) where
        T: Send + 'static,
        F: Fn(T, &WorkUnit) + Send + Sync + 'static,
    {
        let parent = parent.clone();
        let workunit_name = workunit_name.to_string();
        self.pool.spawn(move || {
            use rayon::prelude::*;
            args.into_par_iter().for_each(|arg| {
                let unit = if workunit_name.is_empty() {
                    parent.clone()
                } else {
                    parent.child(&workunit_name, [Label::Tool])
                };
                unit.start();
                f(arg, &unit);
                record_timings(&unit, &run_tracker);
            });
        });
    }

    /// Drains in-flight work, then runs every registered shutdown hook in registration order.
    pub fn shutdown(self) {
        let hooks = std::mem::take(&mut *self.shutdown_hooks.lock().unwrap());
        drop(self.pool);
        for hook in hooks {
            hook();
        }
    }
}

/// Ends `unit`, routing its cumulative duration and self time into the run tracker's two
/// separate aggregates instead of discarding them.
fn record_timings(unit: &WorkUnit, run_tracker: &RunTracker) {
    let mut cumulative =
        |path: &str, d: Duration, is_tool: bool| run_tracker.cumulative_timings.add_timing(path, d, is_tool);
    let mut self_timings =
        |path: &str, d: Duration, is_tool: bool| run_tracker.self_timings.add_timing(path, d, is_tool);
    unit.end(&mut cumulative, &mut self_timings);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn submit_work_and_wait_preserves_order() {
        let pool = WorkerPool::new(4).unwrap();
        let root = WorkUnit::root("all");
        let dir = tempfile::tempdir().unwrap();
        let tracker = RunTracker::new(dir.path()).unwrap();
        let results: Vec<i32> = pool
            .submit_work_and_wait(&root, "square", &tracker, vec![1, 2, 3, 4], |x, _unit| {
                Ok::<_, ()>(x * x)
            })
            .unwrap();
        assert_eq!(results, vec![1, 4, 9, 16]);
    }

    #[test]
    fn empty_input_short_circuits() {
        let pool = WorkerPool::new(4).unwrap();
        let root = WorkUnit::root("all");
        let dir = tempfile::tempdir().unwrap();
        let tracker = RunTracker::new(dir.path()).unwrap();
        let results: Vec<i32> = pool
            .submit_work_and_wait(&root, "noop", &tracker, vec![], |x: i32, _| Ok::<_, ()>(x))
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn an_error_propagates() {
        let pool = WorkerPool::new(2).unwrap();
        let root = WorkUnit::root("all");
        let dir = tempfile::tempdir().unwrap();
        let tracker = RunTracker::new(dir.path()).unwrap();
        let result: Result<Vec<i32>, &'static str> =
            pool.submit_work_and_wait(&root, "fail", &tracker, vec![1, 2, 3], |x, _| {
                if x == 2 {
                    Err("boom")
                } else {
                    Ok(x)
                }
            });
        assert!(result.is_err());
    }

    #[test]
    fn shutdown_hooks_run_in_order() {
        let pool = WorkerPool::new(2).unwrap();
        let order = Arc::new(AtomicUsize::new(0));
        let o1 = order.clone();
        pool.register_shutdown_hook(Box::new(move || {
            o1.store(1, Ordering::SeqCst);
        }));
        pool.shutdown();
        assert_eq!(order.load(Ordering::SeqCst), 1);
    }
}
