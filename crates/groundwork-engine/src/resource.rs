//! Live resource state.
//!
//! Unlike the serialized [`ResourceV3`](groundwork_types::ResourceV3)
//! wire shape, a live state is mutated while the deployment runs: the
//! executor rewrites outputs at apply time and again at output
//! registration, while other subsystems (snapshot serialization in
//! particular) may read concurrently. Output fields are therefore guarded
//! by the state's own mutex.

use std::sync::Mutex;

use anyhow::anyhow;
use groundwork_types::deployment::ResourceV3;
use groundwork_types::property::{PropertyMap, PropertyValue};
use groundwork_types::urn::Urn;

use crate::deployment::DiagSink;

/// Mutable record of one resource during a deployment.
#[derive(Debug)]
pub struct ResourceState {
    pub urn: Urn,
    /// Provider-assigned identity, if any.
    pub id: Option<String>,
    /// Resource type token.
    pub ty: String,
    /// Whether the resource is provider-managed (custom) as opposed to a
    /// component aggregating children.
    pub custom: bool,
    /// Input properties; fixed once the planner emits the step.
    pub inputs: PropertyMap,
    /// Output properties. Guarded because outputs are rewritten during
    /// apply and registration while snapshot serialization reads them.
    pub outputs: Mutex<PropertyMap>,
    /// Output names the user asked to promote to secret.
    pub additional_secret_outputs: Vec<String>,
    /// Capability flag: the resource must be refreshed before updating.
    /// Drives schema-version selection when persisting snapshots.
    pub refresh_before_update: bool,
    /// Hook names to run after a component resource's create completes.
    pub after_create_hooks: Vec<String>,
    /// Hook names to run after a component resource's update completes.
    pub after_update_hooks: Vec<String>,
}

impl ResourceState {
    /// A minimal state with the given URN and everything else empty.
    #[must_use]
    pub fn new(urn: impl Into<Urn>) -> Self {
        Self {
            urn: urn.into(),
            id: None,
            ty: String::new(),
            custom: false,
            inputs: PropertyMap::new(),
            outputs: Mutex::new(PropertyMap::new()),
            additional_secret_outputs: Vec::new(),
            refresh_before_update: false,
            after_create_hooks: Vec::new(),
            after_update_hooks: Vec::new(),
        }
    }

    /// Clone the current outputs.
    ///
    /// # Errors
    ///
    /// Fails if the output lock was poisoned by a panicked thread.
    pub fn outputs(&self) -> anyhow::Result<PropertyMap> {
        Ok(self
            .outputs
            .lock()
            .map_err(|_| anyhow!("resource state output lock poisoned"))?
            .clone())
    }

    /// Replace the outputs wholesale. Intentionally overwrites whatever
    /// is there, since otherwise deleting an output would have no effect.
    ///
    /// # Errors
    ///
    /// Fails if the output lock was poisoned by a panicked thread.
    pub fn set_outputs(&self, outputs: PropertyMap) -> anyhow::Result<()> {
        *self
            .outputs
            .lock()
            .map_err(|_| anyhow!("resource state output lock poisoned"))? = outputs;
        Ok(())
    }

    /// Enforce output secretness after a successful apply, under the
    /// state's own lock:
    ///
    /// 1. every output listed in `additional_secret_outputs` is promoted
    ///    to secret — except `id`, which can never be secret (warn and
    ///    skip);
    /// 2. any output sharing a name with a secret input is preemptively
    ///    marked secret so the input cannot leak through it.
    ///
    /// # Errors
    ///
    /// Fails if the output lock was poisoned by a panicked thread.
    pub fn apply_secret_promotions(&self, diag: &dyn DiagSink) -> anyhow::Result<()> {
        let mut outputs = self
            .outputs
            .lock()
            .map_err(|_| anyhow!("resource state output lock poisoned"))?;

        for key in &self.additional_secret_outputs {
            if key == "id" {
                diag.warning(&self.urn, "the 'id' property cannot be made secret");
                continue;
            }
            if let Some(value) = outputs.get_mut(key) {
                value.make_secret();
            }
        }

        for (key, out) in outputs.iter_mut() {
            if out.is_secret() {
                continue;
            }
            if self.inputs.get(key).is_some_and(PropertyValue::is_secret) {
                out.make_secret();
            }
        }

        Ok(())
    }

    /// Serialize to the wire shape.
    ///
    /// # Errors
    ///
    /// Fails if the output lock was poisoned by a panicked thread.
    pub fn to_wire(&self) -> anyhow::Result<ResourceV3> {
        Ok(ResourceV3 {
            urn: self.urn.clone(),
            custom: self.custom,
            delete: false,
            id: self.id.clone(),
            ty: self.ty.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs()?,
            additional_secret_outputs: self.additional_secret_outputs.clone(),
            refresh_before_update: self.refresh_before_update,
        })
    }
}
