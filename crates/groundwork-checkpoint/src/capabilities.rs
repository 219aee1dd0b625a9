//! Capability negotiation.
//!
//! The persister fetches the service's capability list once at
//! construction and distills it into the two capabilities it acts on:
//! delta checkpoint uploads (with a cutoff size) and the accepted
//! deployment schema version. Unknown capabilities are ignored, and a
//! configuration blob that fails to parse is treated as if the
//! capability were absent.

use groundwork_types::wire::{
    ApiCapabilityConfig, CapabilitiesResponse, DeltaCheckpointUploadsConfig,
    DeploymentSchemaVersionConfig, CAPABILITY_DELTA_CHECKPOINT_UPLOADS,
    CAPABILITY_DEPLOYMENT_SCHEMA_VERSION,
};

/// Parsed view of the service capabilities the persister cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    /// Delta checkpoint uploads, with the configured cutoff size.
    pub delta_checkpoint_uploads: Option<DeltaCheckpointUploadsConfig>,
    /// Highest deployment schema version the service advertises.
    pub deployment_schema_version: Option<i32>,
}

impl CapabilitySet {
    /// Distill a raw capabilities response.
    #[must_use]
    pub fn parse(response: &CapabilitiesResponse) -> Self {
        let mut set = Self::default();
        for capability in &response.capabilities {
            set.absorb(capability);
        }
        set
    }

    fn absorb(&mut self, capability: &ApiCapabilityConfig) {
        match capability.capability.as_str() {
            CAPABILITY_DELTA_CHECKPOINT_UPLOADS => {
                match serde_json::from_str::<DeltaCheckpointUploadsConfig>(
                    capability.configuration.get(),
                ) {
                    Ok(config) => self.delta_checkpoint_uploads = Some(config),
                    Err(err) => {
                        tracing::warn!(
                            capability = capability.capability,
                            "ignoring malformed capability configuration: {err}"
                        );
                    }
                }
            }
            CAPABILITY_DEPLOYMENT_SCHEMA_VERSION => {
                match serde_json::from_str::<DeploymentSchemaVersionConfig>(
                    capability.configuration.get(),
                ) {
                    Ok(config) => self.deployment_schema_version = Some(config.version),
                    Err(err) => {
                        tracing::warn!(
                            capability = capability.capability,
                            "ignoring malformed capability configuration: {err}"
                        );
                    }
                }
            }
            _ => {}
        }
    }

    /// Whether the service accepts deployment schema `version`.
    #[must_use]
    pub fn supports_schema_version(&self, version: i32) -> bool {
        self.deployment_schema_version
            .is_some_and(|advertised| advertised >= version)
    }
}
