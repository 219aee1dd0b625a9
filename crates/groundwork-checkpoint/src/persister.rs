//! The snapshot persister.
//!
//! Called by the executor's event sink at each commit point. Every save
//! serializes the snapshot canonically, negotiates the schema version
//! against the service's advertised capabilities, picks one of the three
//! wire forms (regular, verbatim, delta), and ships it. The diff
//! baseline advances only on success, so a failed save retries against
//! the previous baseline and produces an identical wire payload.

use serde_json::value::RawValue;

use groundwork_engine::deployment::Snapshot;
use groundwork_types::deployment::{
    DeploymentV3, DEPLOYMENT_SCHEMA_VERSION_3, DEPLOYMENT_SCHEMA_VERSION_4,
};
use groundwork_types::wire::{
    PatchCheckpointDeltaRequest, PatchCheckpointRequest, PatchCheckpointVerbatimRequest,
};

use crate::capabilities::CapabilitySet;
use crate::diff::DeploymentDiffState;
use crate::errors::Result;
use crate::serialize::{marshal_deployment, serialize_snapshot};
use crate::transport::ServiceClient;

/// Persists successive deployment snapshots for one update.
///
/// Not reentrant: `save` takes `&mut self` and callers (typically the
/// snapshot-manager event sink) must serialize calls.
#[derive(Debug)]
pub struct SnapshotPersister {
    client: ServiceClient,
    capabilities: CapabilitySet,
    diff_state: Option<DeploymentDiffState>,
}

impl SnapshotPersister {
    /// Construct a persister by fetching the service's capabilities.
    ///
    /// # Errors
    ///
    /// Surfaces capability-fetch failures; callers may retry.
    pub async fn connect(client: ServiceClient) -> Result<Self> {
        let response = client.get_capabilities().await?;
        let capabilities = CapabilitySet::parse(&response);
        tracing::debug!(
            delta = capabilities.delta_checkpoint_uploads.is_some(),
            schema_version = capabilities.deployment_schema_version,
            "negotiated service capabilities"
        );
        Ok(Self::with_capabilities(client, capabilities))
    }

    /// Construct a persister with an already-negotiated capability set.
    #[must_use]
    pub fn with_capabilities(client: ServiceClient, capabilities: CapabilitySet) -> Self {
        let diff_state = capabilities
            .delta_checkpoint_uploads
            .map(|config| DeploymentDiffState::new(config.checkpoint_cutoff_size_bytes));
        Self {
            client,
            capabilities,
            diff_state,
        }
    }

    /// Persist a snapshot.
    ///
    /// # Errors
    ///
    /// Surfaces serialization and transport failures. On failure the
    /// in-memory baseline is not advanced; a subsequent identical call
    /// produces a byte-identical body (modulo sequence number).
    pub async fn save(&mut self, snapshot: &Snapshot) -> Result<()> {
        let deployment = serialize_snapshot(snapshot)?;
        let (version, features) = self.choose_schema(&deployment);
        let marshaled = marshal_deployment(&deployment, version, &features)?;

        match &mut self.diff_state {
            Some(diff_state) => {
                let sequence_number = diff_state.next_sequence_number();
                if diff_state.should_diff(&marshaled) {
                    let delta = diff_state.diff(&marshaled)?;
                    tracing::debug!(
                        sequence_number,
                        edits = delta.edits.len(),
                        "saving delta checkpoint"
                    );
                    self.client
                        .patch_checkpoint_delta(&PatchCheckpointDeltaRequest {
                            version,
                            checkpoint_hash: delta.checkpoint_hash,
                            sequence_number,
                            deployment_delta: delta.edits,
                        })
                        .await?;
                } else {
                    // The first eligible write per update always ships
                    // verbatim to establish the diff baseline.
                    tracing::debug!(
                        sequence_number,
                        bytes = marshaled.size(),
                        "saving verbatim checkpoint"
                    );
                    self.client
                        .patch_checkpoint_verbatim(&PatchCheckpointVerbatimRequest {
                            version,
                            untyped_deployment: RawValue::from_string(marshaled.raw.clone())?,
                            sequence_number,
                        })
                        .await?;
                }
                diff_state.saved(marshaled);
            }
            None => {
                tracing::debug!(bytes = marshaled.size(), "saving regular checkpoint");
                self.client
                    .patch_checkpoint(&PatchCheckpointRequest {
                        is_invalid: false,
                        version,
                        features: (!features.is_empty()).then_some(features),
                        deployment: RawValue::from_string(marshaled.deployment_json.clone())?,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Pick the wire schema: version 4 with its feature-tag list iff the
    /// service advertised schema version 4 and the snapshot uses any
    /// version-4 feature; version 3 otherwise. Under version 3 the
    /// feature tags are dropped, but per-resource fields set by those
    /// features still ride inside the payload.
    fn choose_schema(&self, deployment: &DeploymentV3) -> (i32, Vec<String>) {
        let features: Vec<String> = deployment.feature_tags().into_iter().collect();
        if !features.is_empty()
            && self
                .capabilities
                .supports_schema_version(DEPLOYMENT_SCHEMA_VERSION_4)
        {
            (DEPLOYMENT_SCHEMA_VERSION_4, features)
        } else {
            (DEPLOYMENT_SCHEMA_VERSION_3, Vec::new())
        }
    }
}
