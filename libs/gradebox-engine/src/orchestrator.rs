/// Execution Orchestrator - Request State Machine
///
/// **Stages (per request):**
/// `Queued → Scanning → (Rejected | Provisioning) → Compiling? →
///  Running(case 0..N) → Aggregating → Completed`
///
/// **Rules:**
/// - Validation and security rejections never touch a sandbox
/// - One sandbox per request, released exactly once on every path
/// - Compile (or syntax check) runs once; failure stops the request
/// - Cases run sequentially, in request order, against the same sandbox
/// - A case that times out, runs out of memory or crashes affects only
///   itself; a backend failure during a case marks only that case internal
/// - Cancellation kills the running case and skips the rest
///
/// This module knows nothing about scoring; it hands raw outcomes to the
/// evaluator.
use crate::error::EngineError;
use crate::evaluator::{aggregate, Aggregation, BlockingFailure, CaseRun};
use crate::registry::{CommandContext, LanguageProfile, LanguageRegistry};
use crate::request::{check_source, validate_request, RequestCaps};
use crate::sandbox::{
    CleanupReport, ExecOutcome, ExecSpec, ImageStatus, Provisioner, ProvisionerStatus, Sandbox,
    SandboxLease, Termination,
};
use crate::scanner::scan;
use gradebox_common::config::EngineConfig;
use gradebox_common::limits::effective_limits;
use gradebox_common::types::{
    CallerRole, ExecutionRequest, ExecutionResult, LanguageSummary, ResourceLimits,
    SecurityLevel, ValidationOutcome,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Compilers get at least this much memory regardless of the run limits.
pub const COMPILE_MEMORY_FLOOR_MB: u64 = 512;

/// Extra lifetime given to a sandbox beyond its summed stage budgets.
const SANDBOX_LIFETIME_SLACK: Duration = Duration::from_secs(30);

pub struct ExecutionEngine {
    registry: Arc<LanguageRegistry>,
    provisioner: Arc<dyn Provisioner>,
    permits: Arc<Semaphore>,
    max_sandboxes: usize,
    caps: RequestCaps,
    platform_ceiling: ResourceLimits,
    default_security_level: SecurityLevel,
    compile_timeout: Duration,
    watchdog_grace: Duration,
    drain_timeout: Duration,
}

/// What the compile and run stages produced for one request.
struct StageOutcome {
    runs: Vec<CaseRun>,
    blocking: Option<BlockingFailure>,
    cancelled: bool,
}

enum BuildStep {
    Ok,
    Failed(BlockingFailure),
    Cancelled,
}

impl ExecutionEngine {
    pub fn new(
        config: &EngineConfig,
        registry: Arc<LanguageRegistry>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        let max_sandboxes = config.max_sandboxes.max(1);
        Self {
            registry,
            provisioner,
            permits: Arc::new(Semaphore::new(max_sandboxes)),
            max_sandboxes,
            caps: RequestCaps::from(config),
            platform_ceiling: config.platform_ceiling,
            default_security_level: config.default_security_level,
            compile_timeout: Duration::from_secs(config.compile_timeout_secs),
            watchdog_grace: Duration::from_millis(config.watchdog_grace_ms),
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
        }
    }

    /// Connectivity check and image report; call once before serving.
    pub async fn init(&self) -> Result<ProvisionerStatus, EngineError> {
        let status = self.provisioner.init(&self.registry.profiles()).await?;
        for image in status.images.iter().filter(|i| !i.present) {
            warn!(
                language = %image.language,
                image = %image.image,
                message = image.message.as_deref().unwrap_or(""),
                "Sandbox image unavailable"
            );
        }
        info!(
            backend = %status.backend,
            ready = status.ready,
            languages = self.registry.len(),
            "Execution engine initialised"
        );
        Ok(status)
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn backend(&self) -> &'static str {
        self.provisioner.backend()
    }

    pub fn default_security_level(&self) -> SecurityLevel {
        self.default_security_level
    }

    pub fn platform_ceiling(&self) -> ResourceLimits {
        self.platform_ceiling
    }

    pub fn live_sandboxes(&self) -> usize {
        self.provisioner.live_sandboxes()
    }

    pub fn list_languages(&self) -> Vec<LanguageSummary> {
        self.registry.summaries()
    }

    pub async fn rebuild_language_images(
        &self,
        caller: CallerRole,
    ) -> Result<Vec<ImageStatus>, EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Forbidden);
        }
        info!("Rebuilding sandbox images");
        Ok(self.provisioner.rebuild_images(&self.registry.profiles()).await?)
    }

    pub async fn cleanup_orphaned_sandboxes(
        &self,
        caller: CallerRole,
    ) -> Result<CleanupReport, EngineError> {
        if !caller.is_admin() {
            return Err(EngineError::Forbidden);
        }
        self.sweep_orphans().await
    }

    /// Orphan sweep without a caller check, for startup.
    pub async fn sweep_orphans(&self) -> Result<CleanupReport, EngineError> {
        let report = self.provisioner.cleanup_orphans().await?;
        if !report.removed.is_empty() || !report.failed.is_empty() {
            info!(
                removed = report.removed.len(),
                failed = report.failed.len(),
                "Orphaned sandboxes swept"
            );
        }
        Ok(report)
    }

    /// Wait (bounded) until every sandbox permit is back, then refuse new
    /// ones. Returns false if the wait timed out.
    pub async fn drain(&self) -> bool {
        let all = self.max_sandboxes as u32;
        let drained = match tokio::time::timeout(self.drain_timeout, self.permits.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                permits.forget();
                true
            }
            Ok(Err(_)) => true,
            Err(_) => false,
        };
        self.permits.close();
        if drained {
            info!("Execution engine drained");
        } else {
            warn!(
                live = self.provisioner.live_sandboxes(),
                "Drain timed out with sandboxes still in use"
            );
        }
        drained
    }

    /// Run a request end to end. Never fails: every outcome, including
    /// backend trouble, is reported inside the result.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        caller: CallerRole,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let span = info_span!(
            "execute",
            request_id = %request.id,
            language = %request.language,
            security_level = %request.security_level,
        );
        self.execute_inner(request, caller, cancel).instrument(span).await
    }

    async fn execute_inner(
        &self,
        request: &ExecutionRequest,
        caller: CallerRole,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started_at = Instant::now();
        let mut agg = Aggregation {
            request_id: request.id,
            test_cases: &request.test_cases,
            runs: Vec::new(),
            blocking: Vec::new(),
            security_violations: Vec::new(),
            can_see_hidden: caller.can_see_hidden(),
            cancelled: false,
            elapsed: Duration::ZERO,
            peak_memory_kb: None,
            effective_limits: None,
            max_output_bytes: self.platform_ceiling.max_output_bytes as usize,
        };

        debug!(stage = "validating", "Validating request");
        let mut errors = validate_request(request, &self.caps);
        let profile = match self.registry.resolve(&request.language) {
            Ok(profile) => Some(profile),
            Err(e) => {
                errors.push(e.to_string());
                None
            }
        };
        let profile = match profile {
            Some(profile) if errors.is_empty() => profile,
            _ => {
                info!(stage = "rejected", errors = errors.len(), "Request failed validation");
                agg.blocking.push(BlockingFailure::Validation(errors));
                return finish(agg, started_at);
            }
        };

        debug!(stage = "scanning", "Scanning source");
        let verdict = scan(&request.source_code, &profile, request.security_level);
        for warning in &verdict.warnings {
            debug!(warning = %warning, "Scanner warning");
        }
        if !verdict.allowed {
            info!(
                stage = "rejected",
                violations = verdict.violations.len(),
                pattern_set = %verdict.pattern_set_version,
                "Submission rejected by scanner"
            );
            agg.security_violations = verdict.violations.clone();
            agg.blocking.push(BlockingFailure::Security(verdict.violations));
            return finish(agg, started_at);
        }

        let limits = effective_limits(
            request.resource_limits.as_ref(),
            &profile.default_limits,
            request.security_level,
            &self.platform_ceiling,
        );
        agg.effective_limits = Some(limits);
        agg.max_output_bytes = limits.max_output_bytes as usize;

        debug!(stage = "provisioning", "Waiting for a sandbox permit");
        let _permit = match self.wait_for_permit(cancel).await {
            Some(Ok(permit)) => permit,
            Some(Err(failure)) => {
                agg.blocking.push(failure);
                return finish(agg, started_at);
            }
            None => {
                info!("Request cancelled while queued for a sandbox");
                agg.cancelled = true;
                return finish(agg, started_at);
            }
        };

        let lifetime = self.sandbox_lifetime(&limits, request.test_cases.len());
        let sandbox = match self.provisioner.acquire(&profile, &limits, lifetime).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                let incident_id = Uuid::new_v4();
                error!(stage = "provisioning", %incident_id, error = ?e, "Sandbox provisioning failed");
                agg.blocking.push(BlockingFailure::Internal { incident_id });
                return finish(agg, started_at);
            }
        };
        let lease = SandboxLease::new(self.provisioner.clone(), sandbox);

        if let Some(sandbox) = lease.sandbox() {
            debug!(sandbox = %sandbox.id(), "Sandbox acquired");
            let stages = self
                .run_stages(sandbox, &profile, request, &limits, cancel)
                .await;
            agg.runs = stages.runs;
            agg.blocking.extend(stages.blocking);
            agg.cancelled = stages.cancelled;
            agg.peak_memory_kb = sandbox.peak_memory_kb().await;
        }

        if let Err(e) = lease.release().await {
            warn!(error = %e, "Sandbox release failed; left for orphan cleanup");
        }

        let result = finish(agg, started_at);
        info!(
            stage = "completed",
            execution_ms = result.execution_time_ms,
            passed = result.passed_tests,
            total = result.total_tests,
            score = result.score,
            failure_kind = result.failure_kind.map(|k| k.as_str()).unwrap_or("none"),
            "Execution finished"
        );
        result
    }

    async fn wait_for_permit(
        &self,
        cancel: &CancellationToken,
    ) -> Option<Result<OwnedSemaphorePermit, BlockingFailure>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => Some(permit.map_err(|_| {
                let incident_id = Uuid::new_v4();
                error!(%incident_id, "Sandbox permits closed; engine is draining");
                BlockingFailure::Internal { incident_id }
            })),
        }
    }

    fn sandbox_lifetime(&self, limits: &ResourceLimits, cases: usize) -> Duration {
        let per_case = Duration::from_secs(limits.wall_time_seconds) + self.watchdog_grace * 2;
        self.compile_timeout + per_case * cases as u32 + SANDBOX_LIFETIME_SLACK
    }

    async fn run_stages(
        &self,
        sandbox: &dyn Sandbox,
        profile: &LanguageProfile,
        request: &ExecutionRequest,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        let not_run = || request.test_cases.iter().map(|_| CaseRun::NotRun).collect();

        let file_name = profile.source_file_name(&request.source_code);
        let source_path = match sandbox.write_file(&file_name, &request.source_code).await {
            Ok(path) => path,
            Err(e) => {
                let incident_id = Uuid::new_v4();
                error!(stage = "provisioning", %incident_id, error = ?e, "Failed to write source");
                return StageOutcome {
                    runs: not_run(),
                    blocking: Some(BlockingFailure::Internal { incident_id }),
                    cancelled: false,
                };
            }
        };
        let class_name = profile.class_name(&request.source_code);
        let paths = sandbox.paths().clone();
        let run_ctx = CommandContext {
            source: &source_path,
            source_dir: &paths.source_dir,
            build_dir: &paths.build_dir,
            class_name: &class_name,
            memory_mb: limits.memory_mb,
        };

        match self.build(sandbox, profile, &run_ctx, limits, cancel).await {
            BuildStep::Ok => {}
            BuildStep::Failed(failure) => {
                return StageOutcome {
                    runs: not_run(),
                    blocking: Some(failure),
                    cancelled: false,
                }
            }
            BuildStep::Cancelled => {
                return StageOutcome {
                    runs: not_run(),
                    blocking: None,
                    cancelled: true,
                }
            }
        }

        let argv = run_ctx.render_argv(&profile.run);
        let env = profile.render_env(&run_ctx);
        let mut runs = Vec::with_capacity(request.test_cases.len());
        let mut cancelled = false;

        for case in &request.test_cases {
            if cancelled || cancel.is_cancelled() {
                cancelled = true;
                runs.push(CaseRun::NotRun);
                continue;
            }

            let spec = ExecSpec {
                argv: argv.clone(),
                env: env.clone(),
                stdin: case.input.clone(),
                wall_time: Duration::from_secs(limits.wall_time_seconds),
                cpu_time_seconds: limits.cpu_time_seconds,
                memory_mb: limits.memory_mb,
                max_output_bytes: limits.max_output_bytes as usize,
                max_open_files: limits.max_open_files + profile.runtime_fd_overhead,
                cancel: cancel.child_token(),
            };

            let run = match self.run_watched(sandbox, spec).await {
                Ok(outcome) => {
                    debug!(
                        stage = "running",
                        test_id = %case.id,
                        execution_ms = outcome.elapsed.as_millis() as u64,
                        termination = ?outcome.termination,
                        exit_code = ?outcome.exit_code,
                        "Test case finished"
                    );
                    if outcome.termination == Termination::Cancelled {
                        cancelled = true;
                    }
                    CaseRun::Finished(outcome)
                }
                Err(e) => {
                    let incident_id = Uuid::new_v4();
                    error!(
                        stage = "running",
                        test_id = %case.id,
                        %incident_id,
                        error = ?e,
                        "Sandbox failed while running a test case"
                    );
                    CaseRun::Internal { incident_id }
                }
            };
            runs.push(run);
        }

        StageOutcome {
            runs,
            blocking: None,
            cancelled,
        }
    }

    /// Compile, or syntax-check for interpreted languages.
    async fn build(
        &self,
        sandbox: &dyn Sandbox,
        profile: &LanguageProfile,
        run_ctx: &CommandContext<'_>,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> BuildStep {
        let Some(template) = profile.compile.as_ref().or(profile.syntax_check.as_ref()) else {
            return BuildStep::Ok;
        };
        if cancel.is_cancelled() {
            return BuildStep::Cancelled;
        }

        let memory_mb = limits.memory_mb.max(COMPILE_MEMORY_FLOOR_MB);
        let ctx = CommandContext {
            memory_mb,
            ..run_ctx.clone()
        };
        let spec = ExecSpec {
            argv: ctx.render_argv(template),
            env: profile.render_env(&ctx),
            stdin: String::new(),
            wall_time: self.compile_timeout,
            cpu_time_seconds: self.compile_timeout.as_secs().max(1),
            memory_mb,
            max_output_bytes: limits.max_output_bytes as usize,
            max_open_files: limits.max_open_files + profile.runtime_fd_overhead,
            cancel: cancel.child_token(),
        };

        // Compilers get the floor sandbox-wide too, then test cases go back
        // to the request's limit.
        let raised = memory_mb > limits.memory_mb;
        if raised {
            if let Err(e) = sandbox.set_memory_limit(memory_mb).await {
                let incident_id = Uuid::new_v4();
                error!(stage = "compiling", %incident_id, error = ?e, "Failed to raise sandbox memory for compilation");
                return BuildStep::Failed(BlockingFailure::Internal { incident_id });
            }
        }

        debug!(stage = "compiling", compiled = profile.is_compiled(), memory_mb, "Building submission");
        let result = self.run_watched(sandbox, spec).await;

        if raised {
            if let Err(e) = sandbox.set_memory_limit(limits.memory_mb).await {
                let incident_id = Uuid::new_v4();
                error!(stage = "compiling", %incident_id, error = ?e, "Failed to restore sandbox memory after compilation");
                return BuildStep::Failed(BlockingFailure::Internal { incident_id });
            }
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let incident_id = Uuid::new_v4();
                error!(stage = "compiling", %incident_id, error = ?e, "Sandbox failed during compilation");
                return BuildStep::Failed(BlockingFailure::Internal { incident_id });
            }
        };

        match outcome.termination {
            _ if outcome.success() => BuildStep::Ok,
            Termination::Cancelled => BuildStep::Cancelled,
            termination => {
                let timed_out = matches!(
                    termination,
                    Termination::WallTimeExceeded | Termination::CpuTimeExceeded
                );
                info!(stage = "compiling", ?termination, exit_code = ?outcome.exit_code, "Compilation failed");
                BuildStep::Failed(BlockingFailure::Compile {
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    timed_out,
                })
            }
        }
    }

    /// Run one exec under a watchdog that fires at wall time plus grace,
    /// independently of the backend's own timers.
    async fn run_watched(
        &self,
        sandbox: &dyn Sandbox,
        spec: ExecSpec,
    ) -> Result<ExecOutcome, crate::error::SandboxError> {
        let kill = spec.cancel.clone();
        // The backend's own watchdog fires at wall + grace; this one backs it up.
        let deadline = spec.wall_time + self.watchdog_grace * 2;
        let exec = sandbox.exec(spec);
        tokio::pin!(exec);

        tokio::select! {
            res = &mut exec => res,
            _ = tokio::time::sleep(deadline) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "Watchdog fired; killing sandbox process");
                kill.cancel();
                match tokio::time::timeout(self.watchdog_grace, &mut exec).await {
                    Ok(res) => res.map(|mut outcome| {
                        outcome.termination = Termination::WallTimeExceeded;
                        outcome.exit_code = None;
                        outcome
                    }),
                    Err(_) => Err(anyhow::anyhow!("sandbox did not stop after the watchdog fired").into()),
                }
            }
        }
    }

    /// Compile or syntax-check `source_code` without running anything.
    pub async fn validate(&self, source_code: &str, language: &str) -> ValidationOutcome {
        let mut errors = check_source(source_code, &self.caps);
        let profile = match self.registry.resolve(language) {
            Ok(profile) => profile,
            Err(e) => {
                errors.push(e.to_string());
                return invalid(errors, Vec::new());
            }
        };
        if !errors.is_empty() {
            return invalid(errors, Vec::new());
        }

        let verdict = scan(source_code, &profile, self.default_security_level);
        let mut warnings = verdict.warnings;
        if !verdict.allowed {
            return invalid(verdict.violations, warnings);
        }
        if profile.compile.is_none() && profile.syntax_check.is_none() {
            warnings.push(format!("{} has no syntax check; source was not compiled", profile.display_name));
            return ValidationOutcome {
                valid: true,
                errors,
                warnings,
            };
        }

        let limits = effective_limits(
            None,
            &profile.default_limits,
            self.default_security_level,
            &self.platform_ceiling,
        );
        let never = CancellationToken::new();
        let _permit = match self.wait_for_permit(&never).await {
            Some(Ok(permit)) => permit,
            _ => return invalid(vec!["engine is shutting down".to_string()], warnings),
        };

        let sandbox = match self
            .provisioner
            .acquire(&profile, &limits, self.compile_timeout + SANDBOX_LIFETIME_SLACK)
            .await
        {
            Ok(sandbox) => sandbox,
            Err(e) => {
                let incident_id = Uuid::new_v4();
                error!(%incident_id, error = ?e, "Sandbox provisioning failed during validation");
                return invalid(vec![format!("internal error, incident {}", incident_id)], warnings);
            }
        };
        let lease = SandboxLease::new(self.provisioner.clone(), sandbox);

        let step = match lease.sandbox() {
            Some(sandbox) => self.validate_in(sandbox, &profile, source_code, &limits).await,
            None => BuildStep::Ok,
        };
        if let Err(e) = lease.release().await {
            warn!(error = %e, "Sandbox release failed; left for orphan cleanup");
        }

        match step {
            BuildStep::Ok => ValidationOutcome {
                valid: true,
                errors,
                warnings,
            },
            BuildStep::Cancelled => invalid(vec!["validation cancelled".to_string()], warnings),
            BuildStep::Failed(BlockingFailure::Compile {
                stdout,
                stderr,
                timed_out,
            }) => {
                let detail = if timed_out {
                    "compilation exceeded its time limit".to_string()
                } else {
                    let text = if stderr.trim().is_empty() { stdout } else { stderr };
                    crate::evaluator::sanitize_output(text.trim_end(), limits.max_output_bytes as usize)
                };
                invalid(vec![detail], warnings)
            }
            BuildStep::Failed(BlockingFailure::Internal { incident_id }) => {
                invalid(vec![format!("internal error, incident {}", incident_id)], warnings)
            }
            BuildStep::Failed(_) => invalid(vec!["validation failed".to_string()], warnings),
        }
    }

    async fn validate_in(
        &self,
        sandbox: &dyn Sandbox,
        profile: &LanguageProfile,
        source_code: &str,
        limits: &ResourceLimits,
    ) -> BuildStep {
        let file_name = profile.source_file_name(source_code);
        let source_path = match sandbox.write_file(&file_name, source_code).await {
            Ok(path) => path,
            Err(e) => {
                let incident_id = Uuid::new_v4();
                error!(%incident_id, error = ?e, "Failed to write source during validation");
                return BuildStep::Failed(BlockingFailure::Internal { incident_id });
            }
        };
        let class_name = profile.class_name(source_code);
        let paths = sandbox.paths().clone();
        let ctx = CommandContext {
            source: &source_path,
            source_dir: &paths.source_dir,
            build_dir: &paths.build_dir,
            class_name: &class_name,
            memory_mb: limits.memory_mb,
        };
        self.build(sandbox, profile, &ctx, limits, &CancellationToken::new())
            .await
    }
}

fn invalid(errors: Vec<String>, warnings: Vec<String>) -> ValidationOutcome {
    ValidationOutcome {
        valid: false,
        errors,
        warnings,
    }
}

fn finish(mut agg: Aggregation<'_>, started_at: Instant) -> ExecutionResult {
    agg.elapsed = started_at.elapsed();
    aggregate(agg)
}
