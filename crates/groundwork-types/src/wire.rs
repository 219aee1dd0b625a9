//! Service API request and response bodies.
//!
//! These shapes mirror the coordination service's checkpoint endpoints:
//! a capabilities handshake plus three `PATCH` forms for persisting a
//! snapshot (regular, verbatim, and delta). Field names are fixed by the
//! service contract.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Capability name: the service accepts delta checkpoint uploads.
pub const CAPABILITY_DELTA_CHECKPOINT_UPLOADS: &str = "delta-checkpoint-uploads";

/// Capability name: the service advertises a deployment schema version.
pub const CAPABILITY_DEPLOYMENT_SCHEMA_VERSION: &str = "deployment-schema-version";

/// One capability advertised by the service, with an opaque
/// configuration blob interpreted per capability.
#[derive(Debug, Deserialize)]
pub struct ApiCapabilityConfig {
    pub capability: String,
    #[serde(default)]
    pub version: Option<i32>,
    pub configuration: Box<RawValue>,
}

/// Response body of `GET /api/capabilities`.
#[derive(Debug, Default, Deserialize)]
pub struct CapabilitiesResponse {
    #[serde(default)]
    pub capabilities: Vec<ApiCapabilityConfig>,
}

/// Configuration blob of the delta-checkpoint-uploads capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaCheckpointUploadsConfig {
    /// Serialized snapshots at or above this size become eligible for
    /// delta transport.
    pub checkpoint_cutoff_size_bytes: u64,
}

/// Configuration blob of the deployment-schema-version capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSchemaVersionConfig {
    pub version: i32,
}

/// Body of `PATCH .../checkpoint`: the full deployment as a JSON blob,
/// schema-tagged. The service may reformat how this checkpoint is
/// persisted.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchCheckpointRequest {
    pub is_invalid: bool,
    pub version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
    pub deployment: Box<RawValue>,
}

/// Body of `PATCH .../checkpointverbatim`: the exact bytes of an
/// `UntypedDeployment` envelope, persisted verbatim so that later delta
/// requests can compute textual diffs against it.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchCheckpointVerbatimRequest {
    pub version: i32,
    pub untyped_deployment: Box<RawValue>,
    /// Idempotency key incremented by the client on every PATCH within
    /// the same update.
    pub sequence_number: u64,
}

/// Body of `PATCH .../checkpointdelta`: a textual diff against the
/// last-saved deployment, plus the SHA-256 the service must observe after
/// applying it.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchCheckpointDeltaRequest {
    pub version: i32,
    /// Lowercase-hex SHA-256 of the UTF-8 bytes of the post-apply
    /// deployment JSON.
    pub checkpoint_hash: String,
    /// Idempotency key incremented by the client on every PATCH within
    /// the same update.
    pub sequence_number: u64,
    pub deployment_delta: Vec<TextEdit>,
}

/// One edit of a deployment delta: replace `base[start..end]` with
/// `text`. Offsets are byte offsets into the UTF-8 text of the previous
/// baseline; edits in a delta are sorted and non-overlapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEdit {
    pub start: usize,
    pub end: usize,
    pub text: String,
}
