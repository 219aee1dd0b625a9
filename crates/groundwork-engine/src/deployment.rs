//! Deployment-scoped context shared by the executor and its workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use groundwork_types::deployment::{ManifestV1, SecretsProvidersV1};
use groundwork_types::property::PropertyMap;
use groundwork_types::urn::Urn;

use crate::events::{EventSink, ResourceHooks};
use crate::resource::ResourceState;
use crate::views::ViewDispatcher;

/// Degree of parallelism of the step executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    /// A single worker drains the queue sequentially.
    Serial,
    /// A fixed pool of workers shares the queue.
    Bounded(u32),
    /// A dispatcher launches each chain on a fresh one-shot worker. Used
    /// when the planner has already serialized the partial order
    /// externally.
    Unbounded,
}

impl Parallelism {
    /// Number of resident workers to spawn; the unbounded dispatcher
    /// counts as one.
    #[must_use]
    pub fn worker_count(self) -> u32 {
        match self {
            Self::Serial => 1,
            Self::Bounded(n) => n.max(1),
            Self::Unbounded => 1,
        }
    }
}

/// Options fixed for the lifetime of one deployment.
#[derive(Debug, Clone, Copy)]
pub struct DeploymentOptions {
    pub parallelism: Parallelism,
    /// Keep applying independent chains after a step fails.
    pub continue_on_error: bool,
    pub dry_run: bool,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            parallelism: Parallelism::Serial,
            continue_on_error: false,
            dry_run: false,
        }
    }
}

/// Recorded plan for one resource, checked at output registration.
///
/// The plan records the outputs the planner expects the resource to end
/// up with; keys present in the plan must match the registered outputs
/// exactly.
#[derive(Debug, Default)]
pub struct ResourcePlan {
    pub expected_outputs: Option<PropertyMap>,
}

impl ResourcePlan {
    /// Check registered outputs against the plan.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the first mismatch.
    pub fn check_outputs(&self, outputs: &PropertyMap) -> Result<(), String> {
        let Some(expected) = &self.expected_outputs else {
            return Ok(());
        };
        for (key, want) in expected {
            match outputs.get(key) {
                Some(got) if got == want => {}
                Some(_) => return Err(format!("output '{key}' differs from the planned value")),
                None => return Err(format!("planned output '{key}' is missing")),
            }
        }
        Ok(())
    }
}

/// Per-resource plans recorded by the planner.
#[derive(Debug, Default)]
pub struct DeploymentPlan {
    pub resource_plans: HashMap<Urn, ResourcePlan>,
}

/// Diagnostics channel for user-facing warnings and errors that must not
/// surface through an operation's error return.
pub trait DiagSink: Send + Sync {
    fn error(&self, urn: &Urn, message: &str);
    fn warning(&self, urn: &Urn, message: &str);
}

/// Default diagnostics sink: forwards to `tracing`.
#[derive(Debug, Default)]
pub struct TracingDiag;

impl DiagSink for TracingDiag {
    fn error(&self, urn: &Urn, message: &str) {
        tracing::error!(urn = %urn, "{message}");
    }

    fn warning(&self, urn: &Urn, message: &str) {
        tracing::warn!(urn = %urn, "{message}");
    }
}

/// Diagnostics sink that records messages, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingDiag {
    errors: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
}

impl RecordingDiag {
    /// Errors recorded so far.
    ///
    /// # Panics
    ///
    /// Panics if the lock was poisoned.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    /// Warnings recorded so far.
    ///
    /// # Panics
    ///
    /// Panics if the lock was poisoned.
    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().unwrap().clone()
    }
}

impl DiagSink for RecordingDiag {
    fn error(&self, urn: &Urn, message: &str) {
        self.errors.lock().unwrap().push(format!("{urn}: {message}"));
    }

    fn warning(&self, urn: &Urn, message: &str) {
        self.warnings
            .lock()
            .unwrap()
            .push(format!("{urn}: {message}"));
    }
}

/// Everything deployment-scoped the executor needs: options, event and
/// hook seams, the plan, and the process-wide resource registries.
pub struct Deployment {
    pub options: DeploymentOptions,
    pub events: Option<Arc<dyn EventSink>>,
    pub hooks: Option<Arc<dyn ResourceHooks>>,
    pub plan: Option<DeploymentPlan>,
    /// States from the previous snapshot, keyed by URN.
    pub olds: HashMap<Urn, Arc<ResourceState>>,
    /// Planner-managed states registered during this deployment.
    pub news: Mutex<HashMap<Urn, Arc<ResourceState>>>,
    /// Externally discovered states (reads) registered during this
    /// deployment.
    pub reads: Mutex<HashMap<Urn, Arc<ResourceState>>>,
    /// Side channel publishing view steps keyed on their parent URN.
    pub resource_status: ViewDispatcher,
    pub diag: Arc<dyn DiagSink>,
}

impl Deployment {
    /// A deployment with the given options and no collaborators attached.
    #[must_use]
    pub fn new(options: DeploymentOptions) -> Self {
        Self {
            options,
            events: None,
            hooks: None,
            plan: None,
            olds: HashMap::new(),
            news: Mutex::new(HashMap::new()),
            reads: Mutex::new(HashMap::new()),
            resource_status: ViewDispatcher::new(),
            diag: Arc::new(TracingDiag),
        }
    }

    /// Outputs of the previous state of `urn`, if any.
    #[must_use]
    pub fn old_outputs(&self, urn: &Urn) -> Option<PropertyMap> {
        self.olds.get(urn).and_then(|old| old.outputs().ok())
    }
}

/// A point-in-time picture of the deployment: the ordered resource states
/// plus sidecar metadata, handed to the persister at each commit point.
#[derive(Default)]
pub struct Snapshot {
    pub manifest: ManifestV1,
    pub secrets_providers: Option<SecretsProvidersV1>,
    pub resources: Vec<Arc<ResourceState>>,
    pub metadata: Option<serde_json::Value>,
}
