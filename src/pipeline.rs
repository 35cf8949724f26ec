//! Resumable multi-step pipelines
//!
//! A pipeline is rebuilt on every reconcile. Each step decides from durable
//! state (resource status, existing cluster objects) whether it is already
//! complete, so a walk after a restart resumes at the first incomplete step.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::metrics;

#[async_trait]
pub trait Step<C: Send + Sync>: Send + Sync {
    /// Unique name within a pipeline
    fn identifier(&self) -> &str;

    /// Do the step's work. `Some(delay)` asks to be called again later.
    async fn execute(&self, ctx: &mut C) -> Result<Option<Duration>>;

    async fn completed(&self, ctx: &C) -> Result<bool>;
}

pub struct PipelineBuilder<C> {
    steps: Vec<Box<dyn Step<C>>>,
    identifiers: HashSet<String>,
    requeue_after: Duration,
}

impl<C: Send + Sync> PipelineBuilder<C> {
    /// `requeue_after` is used when a step has run but is not complete yet
    pub fn new(requeue_after: Duration) -> Self {
        Self {
            steps: Vec::new(),
            identifiers: HashSet::new(),
            requeue_after,
        }
    }

    pub fn add_step(mut self, step: impl Step<C> + 'static) -> Result<Self> {
        if !self.identifiers.insert(step.identifier().to_string()) {
            return Err(Error::DuplicateStep(step.identifier().to_string()));
        }
        self.steps.push(Box::new(step));
        Ok(self)
    }

    pub fn build(self) -> Pipeline<C> {
        Pipeline {
            steps: self.steps,
            requeue_after: self.requeue_after,
        }
    }
}

pub struct Pipeline<C> {
    steps: Vec<Box<dyn Step<C>>>,
    requeue_after: Duration,
}

impl<C: Send + Sync> Pipeline<C> {
    pub fn identifiers(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.identifier()).collect()
    }

    pub fn step(&self, identifier: &str) -> Option<&dyn Step<C>> {
        self.steps
            .iter()
            .find(|s| s.identifier() == identifier)
            .map(|s| s.as_ref())
    }

    /// Walk the steps in order, skipping completed ones
    ///
    /// Stops at the first error, at the first requested requeue, or at the
    /// first step still incomplete after executing. `Ok(None)` means every
    /// step is complete.
    pub async fn execute(&self, ctx: &mut C) -> Result<Option<Duration>> {
        for step in &self.steps {
            let id = step.identifier();
            if step.completed(ctx).await? {
                debug!(step = %id, "Step already completed");
                continue;
            }

            info!(step = %id, "Executing step");
            metrics::PIPELINE_STEPS.with_label_values(&[id]).inc();

            let requeue = step.execute(ctx).await.map_err(|e| e.in_task(id))?;
            if let Some(after) = requeue {
                debug!(step = %id, after_secs = after.as_secs(), "Step requested requeue");
                return Ok(Some(after));
            }

            if !step.completed(ctx).await? {
                debug!(step = %id, "Step not completed yet");
                return Ok(Some(self.requeue_after));
            }
        }

        Ok(None)
    }

    pub async fn completed(&self, ctx: &C) -> Result<bool> {
        for step in &self.steps {
            if !step.completed(ctx).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
