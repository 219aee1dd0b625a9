//! Shared Groundwork wire and deployment model types.
//!
//! This crate sits at the bottom of the workspace dependency graph: both the
//! step executor (`groundwork-engine`) and the checkpoint persister
//! (`groundwork-checkpoint`) depend on the identifiers, property values, and
//! service API bodies defined here.

#![warn(clippy::pedantic)]

pub mod deployment;
pub mod property;
pub mod urn;
pub mod wire;

// Top-level re-exports for convenience.
pub use deployment::{DeploymentV3, ManifestV1, ResourceV3, UntypedDeployment};
pub use property::{PropertyMap, PropertyValue};
pub use urn::{StackId, UpdateId, Urn};
