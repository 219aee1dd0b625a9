//! View-step dispatcher.
//!
//! The resource-status collaborator may publish additional "view" steps
//! for a resource while its parent step is being applied. The dispatcher
//! buffers them per parent URN; the executor drains the buffer exactly
//! once per parent step — before the post-step event for deletes, after
//! it for everything else — and re-enters step execution for each view in
//! publication order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use groundwork_types::urn::Urn;

use crate::events::EventPayload;
use crate::step::Step;

/// A view step buffered for later execution, with the pre-step payload it
/// was published with.
pub struct PublishedView {
    pub step: Arc<dyn Step>,
    pub payload: EventPayload,
}

/// Buffers view steps per parent URN until the executor drains them.
#[derive(Default)]
pub struct ViewDispatcher {
    buffered: Mutex<HashMap<Urn, Vec<PublishedView>>>,
}

impl ViewDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a view step keyed on its parent's URN.
    ///
    /// # Errors
    ///
    /// Fails if the buffer lock was poisoned by a panicked thread.
    pub fn publish(&self, parent: Urn, view: PublishedView) -> anyhow::Result<()> {
        self.buffered
            .lock()
            .map_err(|_| anyhow!("view dispatcher lock poisoned"))?
            .entry(parent)
            .or_default()
            .push(view);
        Ok(())
    }

    /// Remove and return the views buffered for a parent, in publication
    /// order. Returns an empty list when none were published.
    ///
    /// # Errors
    ///
    /// Fails if the buffer lock was poisoned by a panicked thread.
    pub fn release(&self, parent: &Urn) -> anyhow::Result<Vec<PublishedView>> {
        Ok(self
            .buffered
            .lock()
            .map_err(|_| anyhow!("view dispatcher lock poisoned"))?
            .remove(parent)
            .unwrap_or_default())
    }
}
