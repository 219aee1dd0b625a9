//! Serialized deployment snapshot shapes.
//!
//! A snapshot persisted to the coordination service is an
//! [`UntypedDeployment`] envelope: a schema version, an optional list of
//! feature tags, and the deployment document itself. Schema version 3 is
//! the baseline; version 4 adds the outer `features` list and permits
//! per-resource fields gated on those features.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::property::PropertyMap;
use crate::urn::Urn;

/// Baseline snapshot schema version.
pub const DEPLOYMENT_SCHEMA_VERSION_3: i32 = 3;

/// Snapshot schema version carrying feature tags.
pub const DEPLOYMENT_SCHEMA_VERSION_4: i32 = 4;

/// Feature tag declared when any resource sets `refresh_before_update`.
pub const FEATURE_REFRESH_BEFORE_UPDATE: &str = "refreshBeforeUpdate";

/// Snapshot sidecar metadata: when and by what the snapshot was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestV1 {
    /// Wall-clock time the snapshot was taken.
    pub time: DateTime<Utc>,
    /// Magic number verifying the writer.
    pub magic: String,
    /// Version of the engine that wrote the snapshot.
    pub version: String,
}

impl Default for ManifestV1 {
    fn default() -> Self {
        Self {
            time: DateTime::UNIX_EPOCH,
            magic: String::new(),
            version: String::new(),
        }
    }
}

/// Secrets manifest: which provider encrypts secret property values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsProvidersV1 {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
}

/// One serialized resource state.
///
/// Optional fields are omitted when unset so that small snapshots stay
/// small and byte-stable. `refresh_before_update` is a version-4 feature
/// field; it is emitted whenever set, even under a version-3 envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceV3 {
    pub urn: Urn,
    #[serde(default, skip_serializing_if = "is_false")]
    pub custom: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "PropertyMap::is_empty")]
    pub inputs: PropertyMap,
    #[serde(default, skip_serializing_if = "PropertyMap::is_empty")]
    pub outputs: PropertyMap,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_secret_outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub refresh_before_update: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !*b
}

/// The deployment document: ordered resource states plus sidecar metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentV3 {
    #[serde(default)]
    pub manifest: ManifestV1,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_providers: Option<SecretsProvidersV1>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceV3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl DeploymentV3 {
    /// The set of version-4 feature tags this deployment actually uses.
    ///
    /// An empty set means the deployment is representable as schema
    /// version 3 without loss.
    #[must_use]
    pub fn feature_tags(&self) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        if self.resources.iter().any(|r| r.refresh_before_update) {
            tags.insert(FEATURE_REFRESH_BEFORE_UPDATE.to_string());
        }
        tags
    }
}

/// Versioned envelope around a serialized deployment document.
///
/// `deployment` is kept as raw JSON so that the byte-exact form chosen by
/// the writer survives decoding, which the delta protocol depends on.
#[derive(Debug, Deserialize)]
pub struct UntypedDeployment {
    pub version: i32,
    #[serde(default)]
    pub features: Option<Vec<String>>,
    pub deployment: Box<RawValue>,
}
