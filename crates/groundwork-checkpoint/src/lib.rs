//! Checkpoint persistence for the Groundwork engine.
//!
//! Converts successive deployment snapshots into the coordination
//! service's verbatim-or-delta checkpoint protocol: snapshots are
//! serialized to canonical JSON, schema versions are negotiated through a
//! capabilities handshake, and large snapshots ship as Myers-style text
//! deltas against the last-saved baseline, verified by SHA-256.

#![warn(clippy::pedantic)]

pub mod capabilities;
pub mod diff;
pub mod errors;
pub mod persister;
pub mod serialize;
pub mod transport;

// Re-export the public API surface.
pub use capabilities::CapabilitySet;
pub use diff::{apply_edits, DeploymentDiffState};
pub use errors::{CheckpointError, Result};
pub use persister::SnapshotPersister;
pub use serialize::MarshaledDeployment;
pub use transport::{ServiceClient, TokenSource, UpdateIdentifier};
