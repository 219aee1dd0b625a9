//! Canonical snapshot serialization.
//!
//! The delta protocol diffs and hashes raw JSON bytes, so serialization
//! must be byte-stable across identical logical snapshots. The pinned
//! canonical form is: map keys sorted lexicographically (values are
//! routed through `serde_json::Value`, whose object representation is a
//! `BTreeMap`), two-space indentation, and `serde_json`'s stable number
//! formatting. Changing any of these invalidates saved baselines.

use serde::Serialize;

use groundwork_engine::deployment::Snapshot;
use groundwork_types::deployment::DeploymentV3;

use crate::errors::{CheckpointError, Result};

/// Serialize any value to the pinned canonical JSON form.
///
/// # Errors
///
/// Returns [`CheckpointError::Serialize`] if the value cannot be
/// represented as JSON.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string_pretty(&value)?)
}

/// Convert a live snapshot into its wire shape, reading each resource's
/// outputs under that resource's own lock.
///
/// # Errors
///
/// Returns [`CheckpointError::State`] if a resource state lock was
/// poisoned.
pub fn serialize_snapshot(snapshot: &Snapshot) -> Result<DeploymentV3> {
    let mut resources = Vec::with_capacity(snapshot.resources.len());
    for state in &snapshot.resources {
        resources.push(state.to_wire().map_err(CheckpointError::State)?);
    }
    Ok(DeploymentV3 {
        manifest: snapshot.manifest.clone(),
        secrets_providers: snapshot.secrets_providers.clone(),
        resources,
        metadata: snapshot.metadata.clone(),
    })
}

/// A deployment marshaled to its canonical wire text, ready to ship
/// verbatim or to diff against a baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarshaledDeployment {
    /// Canonical JSON of the full versioned envelope
    /// (`{version, features?, deployment}`). This is the text the delta
    /// protocol diffs and hashes.
    pub raw: String,
    /// Schema version of the envelope.
    pub version: i32,
    /// Feature tags carried by the envelope; empty under version 3.
    pub features: Vec<String>,
    /// Canonical JSON of the inner deployment document alone, used by
    /// the regular (non-delta) checkpoint body.
    pub deployment_json: String,
}

impl MarshaledDeployment {
    /// Size in bytes of the envelope text, compared against the delta
    /// cutoff.
    #[must_use]
    pub fn size(&self) -> usize {
        self.raw.len()
    }
}

/// Marshal a deployment document into a schema-tagged envelope.
///
/// Note that per-resource fields set by version-4 features (for example
/// `refreshBeforeUpdate`) are emitted even when `version` is 3: the
/// information rides inside the version-3 payload, and only the envelope
/// feature tags are dropped by a downgrade.
///
/// # Errors
///
/// Returns [`CheckpointError::Serialize`] on serialization failure.
pub fn marshal_deployment(
    deployment: &DeploymentV3,
    version: i32,
    features: &[String],
) -> Result<MarshaledDeployment> {
    let deployment_value = serde_json::to_value(deployment)?;
    let deployment_json = serde_json::to_string_pretty(&deployment_value)?;

    let mut envelope = serde_json::Map::new();
    envelope.insert("version".to_string(), version.into());
    if !features.is_empty() {
        envelope.insert("features".to_string(), features.into());
    }
    envelope.insert("deployment".to_string(), deployment_value);
    let raw = serde_json::to_string_pretty(&serde_json::Value::Object(envelope))?;

    Ok(MarshaledDeployment {
        raw,
        version,
        features: features.to_vec(),
        deployment_json,
    })
}
