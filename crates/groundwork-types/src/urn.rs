//! Resource and deployment identifiers.
//!
//! A [`Urn`] is the stable identity of a resource for the lifetime of a
//! stack. Its textual form is
//! `urn:gw:<stack>::<project>::<type>::<name>`; the type segment is what
//! the engine inspects to recognize the root stack resource.

use serde::{Deserialize, Serialize};

/// Type token carried by the root stack resource of every deployment.
pub const ROOT_STACK_TYPE: &str = "groundwork:groundwork:Stack";

/// Stable, unique resource identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

impl Urn {
    /// Create a URN from its raw textual form.
    #[must_use]
    pub fn new(urn: impl Into<String>) -> Self {
        Self(urn.into())
    }

    /// Assemble a URN from its parts.
    #[must_use]
    pub fn from_parts(stack: &str, project: &str, ty: &str, name: &str) -> Self {
        Self(format!("urn:gw:{stack}::{project}::{ty}::{name}"))
    }

    /// Borrow the raw textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The type segment of the URN, or `""` for a malformed URN.
    #[must_use]
    pub fn ty(&self) -> &str {
        self.0.split("::").nth(2).unwrap_or("")
    }

    /// The name segment of the URN, or `""` for a malformed URN.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.split("::").nth(3).unwrap_or("")
    }

    /// Whether this URN identifies the root stack resource.
    #[must_use]
    pub fn is_root_stack(&self) -> bool {
        self.ty() == ROOT_STACK_TYPE
    }
}

impl std::fmt::Display for Urn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for Urn {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Fully qualified stack identity on the coordination service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackId {
    pub owner: String,
    pub project: String,
    pub stack: String,
}

impl std::fmt::Display for StackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.project, self.stack)
    }
}

/// Opaque identifier of one update within a stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateId(String);

impl UpdateId {
    /// Create a new update identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UpdateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
