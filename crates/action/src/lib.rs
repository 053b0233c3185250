//! Drover action pipeline: ordered named steps with compensating rollback.
//!
//! Actions run strictly in order and each receives the previous action's result.
//! When a forward step fails, every action that already completed is asked to
//! undo its work, newest first, and the original failure is returned.
//! Compensation is best-effort: a failing `backward` is recorded as an
//! [`Advisory`] and the remaining actions are still unwound.

#![forbid(unsafe_code)]

use drover_core::Advisory;
use metrics::counter;
use tracing::{debug, error, warn};

/// Context handed to [`Action::forward`].
pub struct FwContext<'a, A, R> {
    pub args: &'a A,
    /// Result of the previous action, `None` for the first one.
    pub previous: Option<&'a R>,
    pub advisories: &'a mut Vec<Advisory>,
}

/// Context handed to [`Action::backward`].
pub struct BwContext<'a, A, R> {
    pub args: &'a A,
    /// What this action's own forward returned.
    pub fw_result: &'a R,
    pub advisories: &'a mut Vec<Advisory>,
}

#[async_trait::async_trait]
pub trait Action<A, R, E>: Send + Sync
where
    A: Sync,
    R: Send + Sync,
    E: Send,
{
    fn name(&self) -> &'static str;

    async fn forward(&self, ctx: FwContext<'_, A, R>) -> Result<R, E>;

    /// Undo a completed forward. Irreversible actions keep the default.
    async fn backward(&self, _ctx: BwContext<'_, A, R>) -> Result<(), E> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct PipelineOutcome<R> {
    /// Result of the last action, `None` for an empty pipeline.
    pub result: Option<R>,
    pub advisories: Vec<Advisory>,
}

/// Forward failure of one action, reported after rollback finished.
#[derive(Debug)]
pub struct PipelineError<E> {
    pub action: &'static str,
    pub cause: E,
    /// Actions whose forward had completed before the failure (all were unwound).
    pub completed: Vec<&'static str>,
    pub advisories: Vec<Advisory>,
}

impl<E: std::fmt::Display> std::fmt::Display for PipelineError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.cause)
    }
}

impl<E> std::error::Error for PipelineError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

pub struct Pipeline<A, R, E>
where
    A: Sync,
    R: Send + Sync,
    E: Send,
{
    actions: Vec<Box<dyn Action<A, R, E>>>,
}

impl<A, R, E> Default for Pipeline<A, R, E>
where
    A: Sync,
    R: Send + Sync,
    E: Send,
{
    fn default() -> Self {
        Self { actions: Vec::new() }
    }
}

impl<A, R, E> Pipeline<A, R, E>
where
    A: Sync,
    R: Send + Sync,
    E: Send + std::fmt::Display,
{
    pub fn push(mut self, action: impl Action<A, R, E> + 'static) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.actions.iter().map(|a| a.name()).collect()
    }

    pub async fn execute(&self, args: &A) -> Result<PipelineOutcome<R>, PipelineError<E>> {
        let mut advisories = Vec::new();
        let mut done: Vec<(usize, R)> = Vec::with_capacity(self.actions.len());
        for (idx, action) in self.actions.iter().enumerate() {
            let name = action.name();
            debug!(action = name, "forward");
            let previous = done.last().map(|(_, r)| r);
            let ctx = FwContext { args, previous, advisories: &mut advisories };
            match action.forward(ctx).await {
                Ok(r) => {
                    counter!("pipeline_forward_ok", 1u64, "action" => name);
                    done.push((idx, r));
                }
                Err(cause) => {
                    counter!("pipeline_forward_err", 1u64, "action" => name);
                    error!(action = name, error = %cause, "forward failed; rolling back");
                    let completed = done.iter().map(|(i, _)| self.actions[*i].name()).collect();
                    self.unwind(args, &done, &mut advisories).await;
                    return Err(PipelineError { action: name, cause, completed, advisories });
                }
            }
        }
        Ok(PipelineOutcome { result: done.pop().map(|(_, r)| r), advisories })
    }

    async fn unwind(&self, args: &A, done: &[(usize, R)], advisories: &mut Vec<Advisory>) {
        for (idx, fw_result) in done.iter().rev() {
            let action = &self.actions[*idx];
            let name = action.name();
            debug!(action = name, "backward");
            let ctx = BwContext { args, fw_result, advisories: &mut *advisories };
            if let Err(e) = action.backward(ctx).await {
                counter!("pipeline_backward_err", 1u64, "action" => name);
                warn!(action = name, error = %e, "backward failed; continuing rollback");
                advisories.push(Advisory::new(name, &e));
            }
        }
    }
}
