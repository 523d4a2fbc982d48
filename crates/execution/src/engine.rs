//! The execution engine - drives one run's groups against the remote queue.

use crate::cache_control::CacheControlBus;
use crate::cleanup::CleanupEvaluator;
use crate::context::{ExecutionContext, RunSignals};
use crate::dependency::DependencyResolver;
use crate::error::{AdmissionError, GroupError};
use crate::host::{Backend, GraphHost, JobOutcome, SubmitReceipt};
use crate::lock::ExecutionLock;
use crate::selector::GroupSelector;
use groupflow_core::{
    CacheControlEvent, CacheControlMode, GroupFailure, RunId, RunRequest, RunStatus, StateUpdate,
};
use groupflow_state::StateManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Sampler node types used when the backend cannot be asked.
pub const DEFAULT_SAMPLER_NODE_TYPES: &[&str] = &[
    "KSampler",
    "KSamplerAdvanced",
    "SamplerCustom",
    "SamplerCustomAdvanced",
];

/// Configuration for the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay between queue-status polls
    pub poll_interval_ms: u64,
    /// Longest wait for one group's job to drain
    pub queue_wait_ceiling_secs: u64,
    /// How long a finished run's record stays queryable
    pub state_grace_period_secs: u64,
    /// Fallback sampler type list
    pub sampler_node_types: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            queue_wait_ceiling_secs: 3600,
            state_grace_period_secs: 60,
            sampler_node_types: DEFAULT_SAMPLER_NODE_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl EngineConfig {
    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the queue-wait ceiling.
    pub fn with_queue_wait_ceiling(mut self, ceiling: Duration) -> Self {
        self.queue_wait_ceiling_secs = ceiling.as_secs();
        self
    }

    /// Set the state grace period.
    pub fn with_state_grace_period(mut self, grace: Duration) -> Self {
        self.state_grace_period_secs = grace.as_secs();
        self
    }

    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Queue-wait ceiling as a duration.
    pub fn queue_wait_ceiling(&self) -> Duration {
        Duration::from_secs(self.queue_wait_ceiling_secs)
    }

    /// Grace period as a duration.
    pub fn state_grace_period(&self) -> Duration {
        Duration::from_secs(self.state_grace_period_secs)
    }
}

/// Outcome of a finished run, for display by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Run id
    pub run_id: RunId,
    /// Terminal status
    pub status: RunStatus,
    /// Groups that finished
    pub completed_groups: Vec<String>,
    /// Groups that failed
    pub failed_groups: Vec<GroupFailure>,
    /// Groups that did not run
    pub skipped_groups: Vec<String>,
    /// Wall time since admission
    pub elapsed: Duration,
    /// One-line summary
    pub message: String,
}

impl RunReport {
    /// Completed with no failed group.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed && self.failed_groups.is_empty()
    }
}

enum GroupOutcome {
    Completed,
    Skipped,
}

/// Releases the lock and forgets the run if a run future is dropped
/// before teardown.
struct RunRegistration<'a> {
    engine: &'a ExecutionEngine,
    run_id: RunId,
    armed: bool,
}

impl RunRegistration<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RunRegistration<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Run {} dropped before teardown, releasing lock", self.run_id);
            self.engine.lock.release(&self.run_id);
            self.engine.runs().remove(&self.run_id);
        }
    }
}

/// The group execution engine.
///
/// Runs one plan at a time:
/// ```text
/// Admit → Lock → for each group: Submit → Poll until drained → Cleanup → Teardown
/// ```
pub struct ExecutionEngine {
    session_id: String,
    config: EngineConfig,
    lock: Arc<ExecutionLock>,
    states: Arc<StateManager>,
    host: Arc<dyn GraphHost>,
    backend: Arc<dyn Backend>,
    cache_bus: Arc<CacheControlBus>,
    resolver: DependencyResolver,
    runs: Mutex<HashMap<RunId, RunSignals>>,
    sampler_types: RwLock<Vec<String>>,
}

impl ExecutionEngine {
    /// Create a new execution engine for a session.
    pub fn new(
        session_id: impl Into<String>,
        lock: Arc<ExecutionLock>,
        states: Arc<StateManager>,
        host: Arc<dyn GraphHost>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let config = EngineConfig::default();
        Self {
            session_id: session_id.into(),
            sampler_types: RwLock::new(config.sampler_node_types.clone()),
            config,
            lock,
            states,
            host,
            backend,
            cache_bus: Arc::new(CacheControlBus::new()),
            resolver: DependencyResolver::new(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.sampler_types = RwLock::new(config.sampler_node_types.clone());
        self.config = config;
        self
    }

    /// Share a cache-control bus.
    pub fn with_cache_bus(mut self, bus: Arc<CacheControlBus>) -> Self {
        self.cache_bus = bus;
        self
    }

    /// Session this engine accepts runs from.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The execution lock.
    pub fn lock(&self) -> &Arc<ExecutionLock> {
        &self.lock
    }

    /// The state store.
    pub fn states(&self) -> &Arc<StateManager> {
        &self.states
    }

    /// The cache-control bus.
    pub fn cache_bus(&self) -> &Arc<CacheControlBus> {
        &self.cache_bus
    }

    /// Sampler types currently in use.
    pub fn sampler_node_types(&self) -> Vec<String> {
        self.sampler_types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs admitted and not yet torn down.
    pub fn active_runs(&self) -> Vec<RunId> {
        self.runs().keys().cloned().collect()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<RunId, RunSignals>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the sampler type list from the backend, keeping the configured
    /// fallback when that fails.
    pub async fn initialize(&self) {
        let loaded = match self.backend.sampler_node_types().await {
            Ok(types) if !types.is_empty() => types,
            Ok(_) => {
                warn!("Backend returned no sampler node types, using defaults");
                return;
            }
            Err(e) => {
                warn!("Failed to load sampler node types, using defaults: {}", e);
                return;
            }
        };

        info!("Loaded {} sampler node types", loaded.len());
        *self
            .sampler_types
            .write()
            .unwrap_or_else(PoisonError::into_inner) = loaded;
    }

    /// Admit and execute a run to completion.
    ///
    /// Rejections return [`AdmissionError`] and leave nothing behind.
    /// Group failures, cancellation and interruption are reported through
    /// the returned [`RunReport`].
    pub async fn on_run_requested(&self, request: RunRequest) -> Result<RunReport, AdmissionError> {
        let RunRequest {
            run_id,
            plan,
            cache_control_signal,
            origin_id,
        } = request;

        let signals = RunSignals::new();
        {
            let mut runs = self.runs();
            if runs.contains_key(&run_id) {
                warn!("Rejected duplicate run {}", run_id);
                return Err(AdmissionError::Duplicate(run_id));
            }
            if origin_id != self.session_id {
                warn!(
                    "Rejected run {} from origin {} (session {})",
                    run_id, origin_id, self.session_id
                );
                return Err(AdmissionError::ForeignOrigin {
                    origin: origin_id,
                    session: self.session_id.clone(),
                });
            }
            plan.validate()?;
            if !self.lock.try_acquire(&run_id) {
                return Err(AdmissionError::Busy {
                    holder: self.lock.holder(),
                });
            }
            runs.insert(run_id.clone(), signals.clone());
        }

        let registration = RunRegistration {
            engine: self,
            run_id: run_id.clone(),
            armed: true,
        };

        self.cache_bus.load_signal(&cache_control_signal);
        let mut ctx = ExecutionContext::new(run_id, plan, origin_id, cache_control_signal, signals);

        // A finished record with the same id belongs to an earlier attempt.
        if let Some(previous) = self.states.get_state(&ctx.run_id).await {
            if previous.status.is_terminal() {
                self.states.clear_state(&ctx.run_id).await;
            }
        }
        self.states.create_state(&ctx.run_id, &ctx.plan).await;
        self.states
            .update_state(&ctx.run_id, StateUpdate::status(RunStatus::Running))
            .await;

        info!(
            "Run {} admitted: {} groups, cache control {:?}",
            ctx.run_id,
            ctx.plan.total_groups(),
            ctx.plan.cache_control_mode
        );

        let outcome = self.run_groups(&mut ctx).await;
        let report = self.finish(ctx, outcome).await;
        registration.disarm();
        Ok(report)
    }

    /// Run [`on_run_requested`](Self::on_run_requested) on a background task.
    pub fn spawn_run(self: &Arc<Self>, request: RunRequest) -> JoinHandle<Result<RunReport, AdmissionError>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.on_run_requested(request).await })
    }

    async fn run_groups(&self, ctx: &mut ExecutionContext) -> Result<(), GroupError> {
        let plan = Arc::clone(&ctx.plan);
        let partition = GroupSelector::new(self.host.as_ref()).partition(&plan);

        for (index, group) in plan.groups.iter().enumerate() {
            let name = &group.group_name;

            if let Some(muted) = partition.muted.iter().find(|m| m.index == index) {
                info!("Run {}: skipping group '{}' ({})", ctx.run_id, name, muted.reason);
                ctx.skipped_groups.push(name.clone());
                continue;
            }

            match self.execute_group(ctx, index).await {
                Ok(GroupOutcome::Completed) => {
                    info!("Run {}: group '{}' completed", ctx.run_id, name);
                    ctx.completed_groups.push(name.clone());
                    self.states
                        .update_state(&ctx.run_id, StateUpdate::completed(name.clone()))
                        .await;
                }
                Ok(GroupOutcome::Skipped) => {
                    ctx.skipped_groups.push(name.clone());
                }
                Err(err) if err.is_cancellation() => {
                    info!("Run {}: stopped in group '{}': {}", ctx.run_id, name, err);
                    return Err(err);
                }
                Err(err) => {
                    error!("Run {}: group '{}' failed: {}", ctx.run_id, name, err);
                    let failure = ctx.record_failure(name, &err);
                    self.leave_group(ctx).await;
                    let update = StateUpdate {
                        failed_group: Some(failure),
                        ..Default::default()
                    };
                    self.states.update_state(&ctx.run_id, update).await;

                    if plan.pause_on_error {
                        return Err(err);
                    }
                    info!("Run {}: continuing past failed group '{}'", ctx.run_id, name);
                }
            }
        }

        Ok(())
    }

    async fn execute_group(&self, ctx: &mut ExecutionContext, index: usize) -> Result<GroupOutcome, GroupError> {
        let plan = Arc::clone(&ctx.plan);
        let name = plan.groups[index].group_name.as_str();

        ctx.signals.check()?;
        info!(
            "Run {}: executing group '{}' ({}/{})",
            ctx.run_id,
            name,
            index + 1,
            plan.total_groups()
        );
        self.enter_group(ctx, name).await;

        let outputs = GroupSelector::new(self.host.as_ref()).output_nodes(name);
        if outputs.is_empty() {
            warn!("Run {}: group '{}' has no output nodes, skipping", ctx.run_id, name);
            self.leave_group(ctx).await;
            return Ok(GroupOutcome::Skipped);
        }

        let block_cache = plan.cache_control_mode == CacheControlMode::BlockUntilAllowed;
        if block_cache {
            self.set_group_cache(ctx, name, false);
        }

        let prompt = self.host.graph_to_prompt().await?;
        let job = self.resolver.restrict(&prompt, &outputs);
        if job.is_empty() {
            return Err(GroupError::EmptyJob);
        }

        ctx.signals.check()?;
        let receipt = ctx
            .signals
            .guard(self.backend.submit_job(&job))
            .await?
            .map_err(GroupError::Submit)?;
        debug!(
            "Run {}: submitted {} nodes for group '{}' (prompt {:?})",
            ctx.run_id,
            job.len(),
            name,
            receipt.prompt_id
        );

        self.wait_for_drain(ctx).await?;
        self.check_job_outcome(ctx, &receipt).await?;

        if block_cache {
            self.set_group_cache(ctx, name, true);
        }
        self.perform_group_cleanup(ctx, index).await?;
        self.leave_group(ctx).await;

        Ok(GroupOutcome::Completed)
    }

    /// Poll until the queue is empty, the ceiling passes, or a signal is raised.
    async fn wait_for_drain(&self, ctx: &ExecutionContext) -> Result<(), GroupError> {
        let ceiling = self.config.queue_wait_ceiling();
        let started = Instant::now();

        loop {
            ctx.signals.check()?;

            match ctx.signals.guard(self.backend.queue_status()).await? {
                Ok(status) if status.is_drained() => break,
                Ok(status) => debug!(
                    "Run {}: queue busy (running {}, pending {})",
                    ctx.run_id, status.running, status.pending
                ),
                Err(e) => warn!("Run {}: queue status check failed: {}", ctx.run_id, e),
            }

            let waited = started.elapsed();
            if waited >= ceiling {
                return Err(GroupError::Timeout { waited });
            }
            ctx.signals.sleep(self.config.poll_interval()).await?;
        }

        // An interruption can land between the last busy poll and the drain.
        ctx.signals.check()
    }

    /// A drained queue says nothing about how the job ended; ask the backend.
    async fn check_job_outcome(&self, ctx: &ExecutionContext, receipt: &SubmitReceipt) -> Result<(), GroupError> {
        let Some(prompt_id) = receipt.prompt_id.as_deref() else {
            return Ok(());
        };

        match ctx.signals.guard(self.backend.job_outcome(prompt_id)).await? {
            Ok(JobOutcome::Interrupted { reason }) => {
                warn!("Run {}: job {} interrupted by backend: {}", ctx.run_id, prompt_id, reason);
                ctx.signals.interrupt(reason);
            }
            Ok(JobOutcome::Finished) => {}
            Ok(JobOutcome::Unknown) => debug!("Run {}: backend has no record of job {}", ctx.run_id, prompt_id),
            Err(e) => warn!("Run {}: job outcome lookup failed for {}: {}", ctx.run_id, prompt_id, e),
        }
        ctx.signals.check()
    }

    async fn perform_group_cleanup(&self, ctx: &ExecutionContext, index: usize) -> Result<(), GroupError> {
        let Some(group) = ctx.plan.groups.get(index) else {
            return Ok(());
        };
        let sampler_types = self.sampler_node_types();
        let evaluator = CleanupEvaluator::new(self.host.as_ref(), self.backend.as_ref(), &sampler_types);

        let Some(request) = evaluator.resolve(&ctx.plan, index).await else {
            return Ok(());
        };

        info!(
            "Run {}: cleanup after '{}' (vram={}, ram={}, unload_models={})",
            ctx.run_id, request.group_name, request.clear_vram, request.clear_ram, request.unload_models
        );
        ctx.signals
            .guard(self.backend.cleanup_memory(&request))
            .await?
            .map_err(GroupError::Cleanup)?;

        let delay = group
            .cleanup_config
            .as_ref()
            .map(|c| c.delay())
            .unwrap_or_default();
        if !delay.is_zero() {
            debug!("Run {}: settling for {:?}", ctx.run_id, delay);
            ctx.signals.sleep(delay).await?;
        }
        Ok(())
    }

    fn set_group_cache(&self, ctx: &mut ExecutionContext, group_name: &str, enabled: bool) {
        let state = ctx.set_cache_enabled(group_name, enabled);
        self.cache_bus.publish(CacheControlEvent {
            run_id: ctx.run_id.clone(),
            group_name: group_name.to_string(),
            state,
        });
    }

    async fn enter_group(&self, ctx: &mut ExecutionContext, group_name: &str) {
        ctx.current_group = Some(group_name.to_string());
        self.states
            .update_state(&ctx.run_id, StateUpdate::current_group(Some(group_name.to_string())))
            .await;
        if let Err(e) = self.backend.set_current_group(Some(group_name)).await {
            warn!("Failed to announce current group '{}': {}", group_name, e);
        }
    }

    async fn leave_group(&self, ctx: &mut ExecutionContext) {
        if ctx.current_group.take().is_none() {
            return;
        }
        self.states
            .update_state(&ctx.run_id, StateUpdate::current_group(None))
            .await;
        if let Err(e) = self.backend.set_current_group(None).await {
            warn!("Failed to clear current group: {}", e);
        }
    }

    /// Teardown. Runs exactly once per admitted run.
    async fn finish(&self, mut ctx: ExecutionContext, outcome: Result<(), GroupError>) -> RunReport {
        let run_id = ctx.run_id.clone();
        let (status, error) = match &outcome {
            Ok(()) => (RunStatus::Completed, None),
            Err(e) if e.is_cancellation() => (RunStatus::Cancelled, Some(e.to_string())),
            Err(e) => (RunStatus::Failed, Some(e.to_string())),
        };

        let mut update = StateUpdate::status(status);
        update.current_group = Some(None);
        if let Some(error) = &error {
            update = update.with_error(error.clone());
        }
        let record = self.states.update_state(&run_id, update).await;
        // An interrupt may already have marked the record cancelled.
        let status = record.as_ref().map(|r| r.status).unwrap_or(status);

        ctx.current_group = None;

        // After a global cancel the lock may already belong to a newer run,
        // whose lock and current group are not ours to clear.
        match self.lock.holder().filter(|holder| *holder != run_id) {
            Some(holder) => debug!("Run {}: lock already taken over by run {}", run_id, holder),
            None => {
                if let Err(e) = self.backend.set_current_group(None).await {
                    warn!("Failed to clear current group: {}", e);
                }
                self.lock.release(&run_id);
            }
        }

        match self.backend.release_permission(&run_id).await {
            Ok(true) => debug!("Released backend permission for run {}", run_id),
            Ok(false) => debug!("Backend held no permission for run {}", run_id),
            Err(e) => warn!("Failed to release backend permission for run {}: {}", run_id, e),
        }

        self.runs().remove(&run_id);

        if let Some(end_time) = record.and_then(|r| r.end_time) {
            self.schedule_eviction(run_id.clone(), end_time);
        }

        let elapsed = ctx.elapsed();
        let message = summarize(&ctx, status, elapsed, error.as_deref());
        match status {
            RunStatus::Completed => info!("{}", message),
            _ => warn!("{}", message),
        }

        RunReport {
            run_id,
            status,
            completed_groups: ctx.completed_groups,
            failed_groups: ctx.failed_groups,
            skipped_groups: ctx.skipped_groups,
            elapsed,
            message,
        }
    }

    fn schedule_eviction(&self, run_id: RunId, end_time: groupflow_core::Time) {
        let states = Arc::clone(&self.states);
        let grace = self.config.state_grace_period();

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            // The id may have been reused by a newer run meanwhile.
            let unchanged = states
                .get_state(&run_id)
                .await
                .is_some_and(|s| s.end_time == Some(end_time));
            if unchanged && states.clear_state(&run_id).await {
                debug!("Evicted state of run {} after grace period", run_id);
            }
        });
    }

    /// Cancel every tracked run.
    ///
    /// Marks their records cancelled, force-releases the lock and releases
    /// backend permissions. Returns the affected run ids.
    pub async fn cancel_all(&self) -> Vec<RunId> {
        let tracked: Vec<(RunId, RunSignals)> = self
            .runs()
            .iter()
            .map(|(id, signals)| (id.clone(), signals.clone()))
            .collect();

        for (run_id, signals) in &tracked {
            info!("Cancelling run {}", run_id);
            signals.cancel();
        }
        for (run_id, _) in &tracked {
            let update = StateUpdate::status(RunStatus::Cancelled).with_error("Cancelled by interrupt");
            self.states.update_state(run_id, update).await;
        }

        self.lock.force_release();

        for (run_id, _) in &tracked {
            if let Err(e) = self.backend.release_permission(run_id).await {
                warn!("Failed to release backend permission for run {}: {}", run_id, e);
            }
        }

        tracked.into_iter().map(|(id, _)| id).collect()
    }

    /// Host-level abort: interrupt the backend, then cancel every run.
    pub async fn interrupt(&self) -> Vec<RunId> {
        if let Err(e) = self.backend.interrupt().await {
            warn!("Backend interrupt failed: {}", e);
        }
        self.cancel_all().await
    }

    /// The backend reported that the running job was aborted.
    ///
    /// Every tracked run stops at its next checkpoint and ends cancelled.
    pub fn report_remote_interruption(&self, reason: &str) -> usize {
        let runs = self.runs();
        for (run_id, signals) in runs.iter() {
            warn!("Run {} interrupted by backend: {}", run_id, reason);
            signals.interrupt(reason);
        }
        runs.len()
    }
}

fn summarize(ctx: &ExecutionContext, status: RunStatus, elapsed: Duration, error: Option<&str>) -> String {
    let mut message = format!(
        "Run {} {} in {:.1}s: {}/{} groups completed",
        ctx.run_id,
        status,
        elapsed.as_secs_f64(),
        ctx.completed_groups.len(),
        ctx.plan.total_groups()
    );
    if !ctx.failed_groups.is_empty() {
        message.push_str(&format!(", {} failed", ctx.failed_groups.len()));
    }
    if !ctx.skipped_groups.is_empty() {
        message.push_str(&format!(", {} skipped", ctx.skipped_groups.len()));
    }
    if let Some(error) = error {
        message.push_str(&format!(" ({})", error));
    }
    message
}
