//! The step executor.
//!
//! Takes chains from the planner and executes them, possibly in parallel.
//! Chains are a simplification of the full dependency DAG: the planner
//! can only emit a chain once all of its dependencies have resolved, so
//! any chain handed to the executor is already ready to run.
//!
//! Workers continuously pull from the incoming-chain queue. A worker
//! exits when the queue is closed by [`StepExecutor::signal_completion`]
//! or when the deployment is cancelled — either by a failing step in
//! another worker or by an external coordinator.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};

use anyhow::anyhow;
use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, watch, RwLock, RwLockWriteGuard};
use tokio::task::JoinHandle;

use groundwork_types::urn::Urn;

use crate::deployment::{Deployment, Parallelism};
use crate::errors::{RegisterOutputsError, StepError};
use crate::events::{EventPayload, EventSink, HookArgs, RegisterResourceOutputsEvent};
use crate::step::{Antichain, Chain, Step, StepApply, StepOp};

/// Worker id used in log lines for synchronous operations.
const SYNCHRONOUS_WORKER: i32 = -1;
/// Worker id of the unbounded-parallelism dispatcher.
const INFINITE_WORKER: i32 = -2;

/// A request to execute a chain, paired with the signal closed when the
/// chain finishes (success, skip, or abort).
struct IncomingChain {
    chain: Chain,
    completion: watch::Sender<bool>,
}

/// Token completed when a submitted chain (or antichain) has finished
/// execution. Callers can use it to optionally wait synchronously.
#[derive(Debug, Clone)]
pub struct CompletionToken {
    rx: watch::Receiver<bool>,
}

impl CompletionToken {
    /// Block until the token is signalled or the given cancellation
    /// handle fires, whichever occurs first.
    pub async fn wait(&self, mut cancel: watch::Receiver<bool>) {
        let mut rx = self.rx.clone();
        tokio::select! {
            // An Err means the sender side was dropped without
            // completing, which only happens on teardown; unblock either
            // way.
            res = rx.wait_for(|done| *done) => drop(res),
            res = cancel.wait_for(|cancelled| *cancelled) => drop(res),
        }
    }

    /// Whether the chain has already finished.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }
}

/// The component of the engine responsible for taking steps and executing
/// them. Operates on the granularity of chains; see the module docs.
pub struct StepExecutor {
    deployment: Arc<Deployment>,

    /// True if errors should be ignored completely, without any handling
    /// or reporting. Used for imports and refreshes. Not the same as
    /// continue-on-error; if both are set, this takes precedence.
    ignore_errors: bool,

    /// Resources that have been applied but are pending a
    /// register-resource-outputs event. Exactly one entry per URN between
    /// apply completion and output registration.
    pending_news: Mutex<HashMap<Urn, Arc<dyn Step>>>,

    /// Freeze lock. Step application takes the read side; an external
    /// coordinator takes the write side to guarantee no step mutates
    /// state while a snapshot is being serialized. Protects snapshot
    /// consistency only.
    worker_lock: Arc<RwLock<()>>,

    chain_tx: Mutex<Option<mpsc::Sender<IncomingChain>>>,

    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,

    /// First error seen by the executor; set once, later errors are
    /// dropped with a debug log.
    saw_error: OnceCell<Arc<StepError>>,

    errored_steps: StdRwLock<Vec<Arc<dyn Step>>>,

    /// Stashed register-outputs event for the root stack resource, held
    /// until finalization so success/failure can drive output retention.
    stack_outputs_event: Mutex<Option<Box<dyn RegisterResourceOutputsEvent>>>,

    workers: Mutex<Vec<JoinHandle<()>>>,
    oneshot_counter: AtomicI32,
}

impl StepExecutor {
    /// Spawn an executor for the deployment. The degree of parallelism
    /// comes from the deployment options; `ignore_errors` is set by
    /// import and refresh paths.
    #[must_use]
    pub fn new(deployment: Arc<Deployment>, ignore_errors: bool) -> Arc<Self> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (chain_tx, chain_rx) = mpsc::channel(1);

        let executor = Arc::new(Self {
            deployment: deployment.clone(),
            ignore_errors,
            pending_news: Mutex::new(HashMap::new()),
            worker_lock: Arc::new(RwLock::new(())),
            chain_tx: Mutex::new(Some(chain_tx)),
            cancel_tx,
            cancel_rx,
            saw_error: OnceCell::new(),
            errored_steps: StdRwLock::new(Vec::new()),
            stack_outputs_event: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            oneshot_counter: AtomicI32::new(0),
        });

        let queue = Arc::new(tokio::sync::Mutex::new(chain_rx));
        let mut handles = Vec::new();
        match deployment.options.parallelism {
            Parallelism::Unbounded => {
                handles.push(tokio::spawn(Self::worker(
                    executor.clone(),
                    INFINITE_WORKER,
                    true,
                    queue,
                )));
            }
            p => {
                for id in 0..p.worker_count() {
                    handles.push(tokio::spawn(Self::worker(
                        executor.clone(),
                        i32::try_from(id).unwrap_or(i32::MAX),
                        false,
                        queue.clone(),
                    )));
                }
            }
        }
        if let Ok(mut workers) = executor.workers.lock() {
            workers.extend(handles);
        }

        executor
    }

    /// A cancellation handle that fires when the deployment is cancelled.
    #[must_use]
    pub fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }

    /// Cancel the deployment, unblocking every worker at its next
    /// decision point. Steps already in flight run to completion.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Acquire the freeze lock, pausing step execution so a consistent
    /// snapshot can be taken. Execution resumes when the guard drops.
    pub async fn freeze(&self) -> RwLockWriteGuard<'_, ()> {
        self.worker_lock.write().await
    }

    /// Submit a chain for asynchronous execution. Execution begins as
    /// soon as a worker is available; the returned token completes when
    /// the chain finishes. If a cancellation is pending the chain is
    /// dropped and the token completes immediately.
    pub async fn execute_serial(&self, chain: Chain) -> CompletionToken {
        let (tx, rx) = watch::channel(false);

        let sender = match self.chain_tx.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            // Queue already closed: dropping the sender resolves waiters.
            drop(tx);
            return CompletionToken { rx };
        };

        let mut cancel = self.cancel_rx.clone();
        tokio::select! {
            // If the send fails the queue was closed; the request (and
            // its completion sender) is dropped, which resolves waiters.
            res = sender.send(IncomingChain { chain, completion: tx }) => drop(res),
            res = cancel.wait_for(|cancelled| *cancelled) => drop(res),
        }

        CompletionToken { rx }
    }

    /// Submit an antichain for parallel execution: each step is enqueued
    /// as a one-step chain, and the returned token completes when all of
    /// them have completed.
    pub async fn execute_parallel(&self, antichain: Antichain) -> CompletionToken {
        let (tx, rx) = watch::channel(false);

        let mut tokens = Vec::with_capacity(antichain.len());
        for step in antichain {
            tokens.push(self.execute_serial(vec![step]).await);
        }

        let cancel = self.cancel_rx.clone();
        tokio::spawn(async move {
            for token in tokens {
                token.wait(cancel.clone()).await;
            }
            let _ = tx.send(true);
        });

        CompletionToken { rx }
    }

    /// Service a register-resource-outputs event synchronously on the
    /// calling task.
    ///
    /// # Errors
    ///
    /// See [`RegisterOutputsError`]. Event-sink failures are routed to
    /// the diagnostics channel instead and cancel the deployment.
    pub async fn execute_register_resource_outputs(
        &self,
        event: Box<dyn RegisterResourceOutputsEvent>,
    ) -> Result<(), RegisterOutputsError> {
        self.register_resource_outputs(event, false, false).await
    }

    /// Finalize the stack outputs stashed during the deployment, if any.
    /// With `errored` set, old outputs are retained and new outputs are
    /// merged over them, since an absent output cannot safely be taken to
    /// mean it was deleted.
    ///
    /// # Errors
    ///
    /// See [`RegisterOutputsError`].
    pub async fn finalize_stack_outputs(&self, errored: bool) -> Result<(), RegisterOutputsError> {
        let event = self
            .stack_outputs_event
            .lock()
            .map_err(|_| anyhow!("stack outputs lock poisoned"))?
            .take();
        match event {
            Some(event) => self.register_resource_outputs(event, errored, true).await,
            None => Ok(()),
        }
    }

    /// The first error seen by the executor, if any.
    #[must_use]
    pub fn errored(&self) -> Option<Arc<StepError>> {
        self.saw_error.get().cloned()
    }

    /// Steps that failed under continue-on-error, in failure order.
    #[must_use]
    pub fn errored_steps(&self) -> Vec<Arc<dyn Step>> {
        self.errored_steps
            .read()
            .map(|steps| steps.clone())
            .unwrap_or_default()
    }

    /// Declare that no further chains will be enqueued. Workers drain the
    /// queue and exit.
    pub fn signal_completion(&self) {
        if let Ok(mut tx) = self.chain_tx.lock() {
            tx.take();
        }
    }

    /// Block until all workers (including one-shot workers) have exited.
    pub async fn wait_for_completion(&self) {
        tracing::debug!("waiting for worker tasks to exit");
        loop {
            let drained = match self.workers.lock() {
                Ok(mut workers) => std::mem::take(&mut *workers),
                Err(_) => return,
            };
            if drained.is_empty() {
                break;
            }
            for handle in drained {
                let _ = handle.await;
            }
        }
        tracing::debug!("worker tasks all exited");
    }

    //
    // Worker loop.
    //

    async fn worker(
        executor: Arc<Self>,
        worker_id: i32,
        launch_async: bool,
        queue: Arc<tokio::sync::Mutex<mpsc::Receiver<IncomingChain>>>,
    ) {
        tracing::debug!(worker = worker_id, "worker coming online");
        loop {
            let request = {
                let mut queue = queue.lock().await;
                let mut cancel = executor.cancel_rx.clone();
                tokio::select! {
                    request = queue.recv() => match request {
                        Some(request) => request,
                        None => {
                            tracing::debug!(worker = worker_id, "queue closed, worker exiting");
                            return;
                        }
                    },
                    _ = cancel.wait_for(|cancelled| *cancelled) => {
                        tracing::debug!(worker = worker_id, "worker exiting due to cancellation");
                        return;
                    }
                }
            };

            if launch_async {
                let oneshot_id = executor.oneshot_counter.fetch_add(1, Ordering::Relaxed);
                let oneshot = executor.clone();
                let handle = tokio::spawn(async move {
                    tracing::debug!(worker = oneshot_id, "launching oneshot worker");
                    oneshot.execute_chain(oneshot_id, request.chain).await;
                    let _ = request.completion.send(true);
                });
                if let Ok(mut workers) = executor.workers.lock() {
                    workers.push(handle);
                }
            } else {
                executor.execute_chain(worker_id, request.chain).await;
                let _ = request.completion.send(true);
            }
        }
    }

    /// Execute a chain one step at a time. If any step fails, or if the
    /// deployment is cancelled, the chain stops; remaining steps never
    /// run.
    async fn execute_chain(&self, worker_id: i32, chain: Chain) {
        for step in chain {
            if *self.cancel_rx.borrow() {
                tracing::debug!(
                    worker = worker_id,
                    op = %step.op(),
                    urn = %step.urn(),
                    "step canceled"
                );
                return;
            }

            // Take the read side of the freeze lock around each step so a
            // coordinator holding the write side observes no mutation.
            let result = {
                let _guard = self.worker_lock.read().await;
                self.execute_step(worker_id, &step).await
            };

            if let Err(err) = result {
                tracing::debug!(
                    worker = worker_id,
                    op = %step.op(),
                    urn = %step.urn(),
                    "step failed, signalling cancellation"
                );
                let already_reported = err.already_reported();
                let err = Arc::new(err);
                self.cancel_due_to_error(&err, Some(&step));
                if !already_reported {
                    // Apply errors were recorded by the post-step event;
                    // everything else is reported here.
                    self.deployment.diag.error(step.urn(), &err.to_string());
                }
                return;
            }
        }
    }

    fn cancel_due_to_error(&self, err: &Arc<StepError>, step: Option<&Arc<dyn Step>>) {
        if self.saw_error.set(err.clone()).is_err() {
            tracing::debug!(error = %err, "executor already recorded an error");
        }

        let mut continue_on_error = self.deployment.options.continue_on_error;
        if err.is_delete_protected() {
            continue_on_error = true;
        }

        if self.ignore_errors {
            // Treat the failure as if it did not happen.
        } else if continue_on_error {
            if let Some(step) = step {
                step.fail();
                if let Ok(mut errored) = self.errored_steps.write() {
                    errored.push(step.clone());
                }
            }
        } else {
            self.cancel();
        }
    }

    //
    // Step execution: (1) the pre-step event is raised, (2) the step is
    // applied, (3) the post-step event is raised. The pre-step event
    // returns an opaque payload passed verbatim to the post-step event.
    //

    async fn execute_step(&self, worker_id: i32, step: &Arc<dyn Step>) -> Result<(), StepError> {
        let mut payload: EventPayload = Box::new(());

        if let Some(events) = self.events_for(step) {
            payload = events.on_step_pre(step).await.map_err(|source| {
                tracing::debug!(
                    worker = worker_id,
                    op = %step.op(),
                    urn = %step.urn(),
                    "pre-step event failed: {source}"
                );
                StepError::PreStepEvent { source }
            })?;
        }

        self.continue_execute_step(payload, worker_id, step.clone())
            .await
    }

    fn continue_execute_step<'a>(
        &'a self,
        payload: EventPayload,
        worker_id: i32,
        step: Arc<dyn Step>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StepError>> + Send + 'a>> {
        Box::pin(async move {
            tracing::debug!(
                worker = worker_id,
                op = %step.op(),
                urn = %step.urn(),
                dry_run = self.deployment.options.dry_run,
                "applying step"
            );
            let StepApply {
                status,
                complete,
                error,
            } = step.apply().await;

            // Diagnostic steps exist only for worker parallelism; they
            // are invisible to the rest of the system.
            if step.op().is_diagnostic() {
                return Ok(());
            }

            if error.is_none() && step.logical() && step.new().is_some() {
                self.pending_news
                    .lock()
                    .map_err(|_| anyhow!("pending outputs lock poisoned"))?
                    .insert(step.urn().clone(), step.clone());
            }

            // Enforce output secretness and track the state so it can be
            // looked up by consumers resolving resource references. Replace
            // steps are skipped: their new side was already recorded by the
            // paired create, and mutating it again races the snapshot.
            if let Some(new_state) = step.new() {
                if step.op() != StepOp::Replace {
                    new_state
                        .apply_secret_promotions(self.deployment.diag.as_ref())
                        .map_err(StepError::Infrastructure)?;

                    let registry = if step.op().is_read() {
                        &self.deployment.reads
                    } else {
                        &self.deployment.news
                    };
                    registry
                        .lock()
                        .map_err(|_| anyhow!("resource registry lock poisoned"))?
                        .insert(new_state.urn.clone(), new_state.clone());
                }
            }

            let is_delete = step.op() == StepOp::Delete;

            // For deletes, child views must be executed and saved to state
            // before the post-step event persists this resource's result.
            if is_delete {
                self.execute_view_steps(worker_id, step.urn()).await?;
            }

            if let Some(events) = self.events_for(&step) {
                events
                    .on_step_post(payload, &step, status, error.as_ref())
                    .await
                    .map_err(|source| {
                        tracing::debug!(
                            worker = worker_id,
                            op = %step.op(),
                            urn = %step.urn(),
                            "post-step event failed: {source}"
                        );
                        StepError::PostStepEvent { source }
                    })?;
            }

            if !is_delete {
                self.execute_view_steps(worker_id, step.urn()).await?;
            }

            // Retiring the step allows chains that depend on it to
            // continue; the post-step event has saved its results.
            if let Some(complete) = complete {
                tracing::debug!(
                    worker = worker_id,
                    op = %step.op(),
                    urn = %step.urn(),
                    "step retired"
                );
                complete();
            }

            if let Some(source) = error {
                tracing::debug!(
                    worker = worker_id,
                    op = %step.op(),
                    urn = %step.urn(),
                    "step failed with an error: {source}"
                );
                return Err(StepError::ApplyFailed { source });
            }

            Ok(())
        })
    }

    /// Execute the view steps buffered for a parent, serially, in the
    /// order they were published. Errors are aggregated.
    async fn execute_view_steps(&self, worker_id: i32, parent: &Urn) -> Result<(), StepError> {
        let views = self
            .deployment
            .resource_status
            .release(parent)
            .map_err(StepError::Infrastructure)?;

        let mut errs = Vec::new();
        for view in views {
            if let Err(err) = self
                .continue_execute_step(view.payload, worker_id, view.step)
                .await
            {
                errs.push(err);
            }
        }
        if errs.is_empty() {
            Ok(())
        } else if errs.len() == 1 {
            Err(errs.swap_remove(0))
        } else {
            Err(StepError::Multiple(errs))
        }
    }

    fn events_for(&self, step: &Arc<dyn Step>) -> Option<Arc<dyn EventSink>> {
        if step.op().is_diagnostic() {
            None
        } else {
            self.deployment.events.clone()
        }
    }

    async fn register_resource_outputs(
        &self,
        event: Box<dyn RegisterResourceOutputsEvent>,
        errored: bool,
        finalizing: bool,
    ) -> Result<(), RegisterOutputsError> {
        let urn = event.urn().clone();

        if finalizing && !urn.is_root_stack() {
            return Err(RegisterOutputsError::Infrastructure(anyhow!(
                "expected a root stack urn, got {urn}"
            )));
        }

        // Stack outputs are finalized at the end of the deployment so
        // that success or failure can drive output retention; stash the
        // event until then.
        if !finalizing && urn.is_root_stack() {
            event.done();
            *self
                .stack_outputs_event
                .lock()
                .map_err(|_| anyhow!("stack outputs lock poisoned"))? = Some(event);
            return Ok(());
        }

        let step = self
            .pending_news
            .lock()
            .map_err(|_| anyhow!("pending outputs lock poisoned"))?
            .remove(&urn)
            .ok_or_else(|| RegisterOutputsError::NotPending { urn: urn.clone() })?;
        let new_state = step.new().ok_or_else(|| {
            RegisterOutputsError::Infrastructure(anyhow!("pending step for {urn} has no new state"))
        })?;

        let mut outputs = event.outputs();
        tracing::debug!(
            worker = SYNCHRONOUS_WORKER,
            urn = %urn,
            outputs = outputs.len(),
            "registered resource outputs"
        );

        // If the deployment errored, the absence of an output can't
        // safely be assumed to mean it was deleted: keep old outputs,
        // overwriting with new ones.
        if finalizing && errored {
            if let Some(old) = self.deployment.old_outputs(&urn) {
                let mut merged = old;
                merged.extend(outputs);
                outputs = merged;
            }
        }

        if let Some(plan) = &self.deployment.plan {
            let resource_plan = plan
                .resource_plans
                .get(&urn)
                .ok_or_else(|| RegisterOutputsError::NoPlanEntry { urn: urn.clone() })?;
            resource_plan
                .check_outputs(&outputs)
                .map_err(|reason| RegisterOutputsError::PlanViolation {
                    urn: urn.clone(),
                    reason,
                })?;
        }

        // Unconditionally overwrite the outputs; otherwise deleting an
        // output would have no effect.
        new_state
            .set_outputs(outputs)
            .map_err(RegisterOutputsError::Infrastructure)?;

        // Component resources run their after-hooks now that outputs are
        // final.
        if !new_state.custom {
            if let Some(hooks) = &self.deployment.hooks {
                let hook_names = match step.op() {
                    StepOp::Create => Some(&new_state.after_create_hooks),
                    StepOp::Update => Some(&new_state.after_update_hooks),
                    _ => None,
                };
                if let Some(names) = hook_names.filter(|names| !names.is_empty()) {
                    let old_state = step.old();
                    let new_outputs = new_state
                        .outputs()
                        .map_err(RegisterOutputsError::Infrastructure)?;
                    let old_outputs = old_state
                        .as_ref()
                        .map(|old| old.outputs())
                        .transpose()
                        .map_err(RegisterOutputsError::Infrastructure)?;
                    hooks
                        .run_hooks(
                            names,
                            HookArgs {
                                urn: &urn,
                                id: new_state.id.as_deref(),
                                ty: &new_state.ty,
                                new_inputs: &new_state.inputs,
                                old_inputs: old_state.as_ref().map(|old| &old.inputs),
                                new_outputs: &new_outputs,
                                old_outputs: old_outputs.as_ref(),
                            },
                        )
                        .await
                        .map_err(|source| RegisterOutputsError::Hook { source })?;
                }
            }
        }

        if let Some(events) = &self.deployment.events {
            if let Err(event_err) = events.on_resource_outputs(&step).await {
                // This event doesn't run on a worker, so its failure
                // can't abort a chain; report it through diagnostics and
                // cancel the deployment instead.
                tracing::debug!(urn = %urn, "register resource outputs failed: {event_err}");
                self.deployment.diag.error(
                    &urn,
                    &format!("resource complete event returned an error: {event_err}"),
                );
                self.cancel_due_to_error(
                    &Arc::new(StepError::Infrastructure(event_err)),
                    None,
                );
                return Ok(());
            }
        }

        if !finalizing {
            event.done();
        }
        Ok(())
    }
}
