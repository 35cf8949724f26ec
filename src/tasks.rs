//! Ordered execution of named sync tasks
//!
//! Tasks run strictly in registration order. The first failure stops the run
//! and is returned wrapped with the task name; later tasks are not attempted.

use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics;

/// A sync task borrowing the shared context for the duration of its run
pub type TaskFn<C> = for<'c> fn(&'c mut C) -> BoxFuture<'c, Result<()>>;

pub struct TaskRunner<C> {
    kind: &'static str,
    tasks: Vec<(&'static str, TaskFn<C>)>,
    durations: Vec<(&'static str, Duration)>,
}

impl<C: Send> TaskRunner<C> {
    /// `kind` labels duration metrics (e.g. "Backend")
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            tasks: Vec::new(),
            durations: Vec::new(),
        }
    }

    pub fn add_task(&mut self, name: &'static str, task: TaskFn<C>) -> &mut Self {
        self.tasks.push((name, task));
        self
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _)| *name).collect()
    }

    /// Wall-clock time of each task that ran during the last `run`
    pub fn durations(&self) -> &[(&'static str, Duration)] {
        &self.durations
    }

    pub async fn run(&mut self, ctx: &mut C) -> Result<()> {
        self.durations.clear();

        for &(name, task) in self.tasks.iter() {
            let started = Instant::now();
            let outcome = task(&mut *ctx).await;
            let elapsed = started.elapsed();

            self.durations.push((name, elapsed));
            metrics::TASK_DURATION
                .with_label_values(&[self.kind, name])
                .observe(elapsed.as_secs_f64());

            match outcome {
                Ok(()) => {
                    debug!(task = %name, elapsed_ms = elapsed.as_millis() as u64, "Task completed");
                }
                Err(e) => {
                    warn!(task = %name, error = %e, "Task failed");
                    return Err(e.in_task(name));
                }
            }
        }

        Ok(())
    }
}
