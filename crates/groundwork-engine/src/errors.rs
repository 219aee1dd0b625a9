//! Engine error model.
//!
//! `StepError` distinguishes the failure modes of step execution the same
//! way the cancellation policy does: an apply failure has already been
//! surfaced through the post-step event and must not be logged again; a
//! delete-protected failure never tears the deployment down; everything
//! else cancels unless continue-on-error is set.

use groundwork_types::urn::Urn;

/// Raised by a delete step when the resource is protected. No provider
/// mutation was attempted, so the deployment always continues past these
/// and reports them all in a single run.
#[derive(Debug, thiserror::Error)]
#[error("resource {urn} is protected and cannot be deleted")]
pub struct DeleteProtectedError {
    pub urn: Urn,
}

/// Error raised while executing a step of a chain.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The step's `apply` reported an error. The error has already been
    /// surfaced via the post-step event; callers must not report it
    /// again. The underlying provider error is reachable via `source()`.
    #[error("step application failed: {source}")]
    ApplyFailed {
        #[source]
        source: anyhow::Error,
    },

    /// The pre-step event callback failed. Fatal to the chain.
    #[error("pre-step event returned an error: {source}")]
    PreStepEvent {
        #[source]
        source: anyhow::Error,
    },

    /// The post-step event callback failed. Fatal to the chain.
    #[error("post-step event returned an error: {source}")]
    PostStepEvent {
        #[source]
        source: anyhow::Error,
    },

    /// Several view steps of one parent failed.
    #[error("{}", join_messages(.0))]
    Multiple(Vec<StepError>),

    /// Host-side failure (channel teardown, poisoned lock).
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl StepError {
    /// Whether this error was already reported through the post-step
    /// event and must not be logged by the caller.
    #[must_use]
    pub fn already_reported(&self) -> bool {
        matches!(self, Self::ApplyFailed { .. })
    }

    /// Whether a [`DeleteProtectedError`] is anywhere in this error,
    /// forcing continue-on-error semantics.
    #[must_use]
    pub fn is_delete_protected(&self) -> bool {
        match self {
            Self::ApplyFailed { source } => source
                .chain()
                .any(|cause| cause.is::<DeleteProtectedError>()),
            Self::Multiple(errs) => errs.iter().any(StepError::is_delete_protected),
            _ => false,
        }
    }
}

fn join_messages(errs: &[StepError]) -> String {
    errs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error raised while servicing a register-resource-outputs event.
#[derive(Debug, thiserror::Error)]
pub enum RegisterOutputsError {
    /// No pending-output entry exists for the URN; the planner never
    /// applied a registration-bearing step for it.
    #[error("cannot complete resource '{urn}' whose registration isn't pending")]
    NotPending { urn: Urn },

    /// A deployment plan is in force but records no entry for the URN.
    #[error("no plan for resource {urn}")]
    NoPlanEntry { urn: Urn },

    /// The registered outputs do not satisfy the recorded plan.
    #[error("resource {urn} violates plan: {reason}")]
    PlanViolation { urn: Urn, reason: String },

    /// An after-hook for a component resource failed.
    #[error("resource hook failed: {source}")]
    Hook {
        #[source]
        source: anyhow::Error,
    },

    /// Host-side failure (poisoned lock).
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}
