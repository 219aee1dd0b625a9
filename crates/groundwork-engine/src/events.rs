//! Event seams between the executor and its collaborators.
//!
//! The event sink is how the rest of the engine observes step execution:
//! the pre-step callback returns an opaque payload that the executor
//! threads verbatim to the matching post-step callback. The snapshot
//! manager typically lives behind this seam, which is why a post-step
//! failure is fatal to the chain.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use groundwork_types::property::PropertyMap;
use groundwork_types::urn::Urn;

use crate::step::{Step, StepStatus};

/// Opaque context returned by the pre-step event and passed verbatim to
/// the post-step event.
pub type EventPayload = Box<dyn Any + Send>;

/// Callbacks raised around step execution and output registration.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Raised before a step is applied. The returned payload is threaded
    /// to [`on_step_post`](EventSink::on_step_post).
    async fn on_step_pre(&self, step: &Arc<dyn Step>) -> anyhow::Result<EventPayload>;

    /// Raised after a step has been applied, successfully or not. This is
    /// where apply errors are recorded and surfaced; the executor wraps
    /// them in the already-reported sentinel afterwards.
    async fn on_step_post(
        &self,
        payload: EventPayload,
        step: &Arc<dyn Step>,
        status: StepStatus,
        error: Option<&anyhow::Error>,
    ) -> anyhow::Result<()>;

    /// Raised after a resource's outputs have been registered.
    async fn on_resource_outputs(&self, step: &Arc<dyn Step>) -> anyhow::Result<()>;
}

/// A request to finalize the outputs of a previously applied logical
/// step. Serviced synchronously on the caller's task, not a worker.
pub trait RegisterResourceOutputsEvent: Send + Sync {
    /// URN of the resource whose outputs are being registered.
    fn urn(&self) -> &Urn;

    /// The outputs to record.
    fn outputs(&self) -> PropertyMap;

    /// Signal the originator that the event has been serviced.
    fn done(&self);
}

/// Arguments passed to a resource's after-hooks.
pub struct HookArgs<'a> {
    pub urn: &'a Urn,
    pub id: Option<&'a str>,
    pub ty: &'a str,
    pub new_inputs: &'a PropertyMap,
    pub old_inputs: Option<&'a PropertyMap>,
    pub new_outputs: &'a PropertyMap,
    pub old_outputs: Option<&'a PropertyMap>,
}

/// Runner for user-registered resource lifecycle hooks.
///
/// For component resources the after-create and after-update hooks fire
/// at output registration, once the resource's outputs are final.
#[async_trait]
pub trait ResourceHooks: Send + Sync {
    /// Run the named hooks in order, stopping at the first failure.
    async fn run_hooks(&self, names: &[String], args: HookArgs<'_>) -> anyhow::Result<()>;
}
