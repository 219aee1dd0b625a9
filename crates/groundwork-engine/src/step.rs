//! The step model: one resource mutation with a pre/apply/post lifecycle.
//!
//! Steps arrive from the planner already grouped into chains (totally
//! ordered) and antichains (mutually independent); the executor never
//! re-derives ordering. A step that is *logical* and carries a new state
//! produces a registered resource and must be followed by a
//! register-resource-outputs event before its chain can be considered
//! retired.

use std::sync::Arc;

use async_trait::async_trait;
use groundwork_types::urn::Urn;

use crate::resource::ResourceState;

/// The kind of mutation a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepOp {
    Create,
    Update,
    Delete,
    Replace,
    Read,
    ReadReplacement,
    /// Diagnostic-only step used for worker parallelism; it bypasses
    /// lifecycle events and pending-output registration.
    Diff,
    Same,
    Import,
    Remove,
}

impl StepOp {
    /// Stable lowercase name used in log lines.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Read => "read",
            Self::ReadReplacement => "read-replacement",
            Self::Diff => "diff",
            Self::Same => "same",
            Self::Import => "import",
            Self::Remove => "remove",
        }
    }

    /// Whether steps of this kind are diagnostic-only.
    #[must_use]
    pub fn is_diagnostic(self) -> bool {
        matches!(self, Self::Diff)
    }

    /// Whether this kind discovers an external resource rather than
    /// mutating a managed one.
    #[must_use]
    pub fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadReplacement)
    }
}

impl std::fmt::Display for StepOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-reported status of a step application, threaded to the
/// post-step event even when the application failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepStatus {
    #[default]
    Ok,
    PartialFailure,
    Unknown,
}

/// Callback that retires a step, unblocking chains that wait on it.
pub type StepComplete = Box<dyn FnOnce() + Send>;

/// Everything `Step::apply` reports back to the executor.
pub struct StepApply {
    /// Provider-reported resource status.
    pub status: StepStatus,
    /// Invoked after the post-step event has recorded the step's results,
    /// allowing dependent chains to proceed.
    pub complete: Option<StepComplete>,
    /// The application error, if any. The executor routes it through the
    /// post-step event before wrapping it in the already-reported
    /// sentinel.
    pub error: Option<anyhow::Error>,
}

impl StepApply {
    /// A successful application with no completion callback.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: StepStatus::Ok,
            complete: None,
            error: None,
        }
    }

    /// A failed application.
    #[must_use]
    pub fn failed(error: anyhow::Error) -> Self {
        Self {
            status: StepStatus::Ok,
            complete: None,
            error: Some(error),
        }
    }
}

/// One unit of work: a resource mutation with identity, old and new
/// state, and an apply operation.
#[async_trait]
pub trait Step: Send + Sync {
    /// The kind of mutation this step performs.
    fn op(&self) -> StepOp;

    /// Stable identity of the resource this step mutates.
    fn urn(&self) -> &Urn;

    /// State being replaced or deleted, if any.
    fn old(&self) -> Option<Arc<ResourceState>>;

    /// State being created or updated, if any.
    fn new(&self) -> Option<Arc<ResourceState>>;

    /// Whether this step produces a registered resource, requiring an
    /// output-registration event before its chain retires.
    fn logical(&self) -> bool;

    /// Perform the mutation against the provider.
    async fn apply(&self) -> StepApply;

    /// Mark the step as failed under continue-on-error. Default: no-op.
    fn fail(&self) {}
}

/// A sequence of steps that must execute serially in index order.
pub type Chain = Vec<Arc<dyn Step>>;

/// A set of mutually independent steps, executable concurrently.
pub type Antichain = Vec<Arc<dyn Step>>;
