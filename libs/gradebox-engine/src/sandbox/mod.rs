//! Sandbox abstraction
//!
//! A [`Provisioner`] creates one isolated environment per request and tears
//! it down again; a [`Sandbox`] is that environment. The orchestrator only
//! ever talks to these traits, so backends (containers, process jails, the
//! scripted fake used in tests) are interchangeable.
//!
//! Every sandbox exposes two directories:
//! - `source_dir`: writable, not executable; the submission and its stdin
//!   live here.
//! - `build_dir`: writable and executable; compiler output goes here.

pub mod docker;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
pub mod jail;

use crate::error::SandboxError;
use crate::registry::LanguageProfile;
use async_trait::async_trait;
use gradebox_common::config::{BackendKind, EngineConfig};
use gradebox_common::types::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPaths {
    pub source_dir: String,
    pub build_dir: String,
}

impl SandboxPaths {
    pub fn source_file(&self, name: &str) -> String {
        format!("{}/{}", self.source_dir, name)
    }
}

/// One process to run inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: String,
    pub wall_time: Duration,
    pub cpu_time_seconds: u64,
    /// Memory ceiling for this process; backends without a memory cgroup
    /// turn it into an address-space limit.
    pub memory_mb: u64,
    pub max_output_bytes: usize,
    pub max_open_files: u64,
    pub cancel: CancellationToken,
}

/// How the process ended, as seen by the isolation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    WallTimeExceeded,
    CpuTimeExceeded,
    MemoryExceeded,
    OutputLimitExceeded,
    Signaled(i32),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub termination: Termination,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub cpu_time_ms: Option<u64>,
    pub peak_memory_kb: Option<u64>,
}

impl ExecOutcome {
    pub fn exited(exit_code: i64, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            termination: Termination::Exited,
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            elapsed: Duration::ZERO,
            cpu_time_ms: None,
            peak_memory_kb: None,
        }
    }

    pub fn terminated(termination: Termination) -> Self {
        Self {
            termination,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
            cpu_time_ms: None,
            peak_memory_kb: None,
        }
    }

    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    fn paths(&self) -> &SandboxPaths;

    /// Write `content` to `name` inside the source directory and return the
    /// absolute path as seen from within the sandbox.
    async fn write_file(&self, name: &str, content: &str) -> Result<String, SandboxError>;

    async fn exec(&self, spec: ExecSpec) -> Result<ExecOutcome, SandboxError>;

    /// Move the sandbox-wide memory ceiling. Backends that only enforce the
    /// per-exec `ExecSpec::memory_mb` keep the default.
    async fn set_memory_limit(&self, _memory_mb: u64) -> Result<(), SandboxError> {
        Ok(())
    }

    /// Peak memory of the whole sandbox so far, when the backend can tell.
    async fn peak_memory_kb(&self) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageStatus {
    pub language: String,
    pub image: String,
    pub present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerStatus {
    pub backend: String,
    pub ready: bool,
    pub images: Vec<ImageStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Connectivity check and image report. Called once at startup.
    async fn init(&self, profiles: &[Arc<LanguageProfile>]) -> Result<ProvisionerStatus, SandboxError>;

    /// Create a sandbox for one request. `lifetime` bounds how long the
    /// sandbox may exist even if nobody releases it.
    async fn acquire(
        &self,
        profile: &LanguageProfile,
        limits: &ResourceLimits,
        lifetime: Duration,
    ) -> Result<Box<dyn Sandbox>, SandboxError>;

    async fn release(&self, sandbox: Box<dyn Sandbox>) -> Result<(), SandboxError>;

    async fn rebuild_images(
        &self,
        profiles: &[Arc<LanguageProfile>],
    ) -> Result<Vec<ImageStatus>, SandboxError>;

    /// Remove sandboxes left behind by a previous crash of this instance.
    async fn cleanup_orphans(&self) -> Result<CleanupReport, SandboxError>;

    fn live_sandboxes(&self) -> usize;
}

/// Owns an acquired sandbox until it is released. If the owning future is
/// dropped first (cancellation, panic), the drop hands the sandbox back to
/// the provisioner on a background task.
pub struct SandboxLease {
    provisioner: Arc<dyn Provisioner>,
    sandbox: Option<Box<dyn Sandbox>>,
}

impl SandboxLease {
    pub fn new(provisioner: Arc<dyn Provisioner>, sandbox: Box<dyn Sandbox>) -> Self {
        Self {
            provisioner,
            sandbox: Some(sandbox),
        }
    }

    pub fn sandbox(&self) -> Option<&dyn Sandbox> {
        self.sandbox.as_deref()
    }

    pub async fn release(mut self) -> Result<(), SandboxError> {
        match self.sandbox.take() {
            Some(sandbox) => self.provisioner.release(sandbox).await,
            None => Ok(()),
        }
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let Some(sandbox) = self.sandbox.take() else {
            return;
        };
        let provisioner = self.provisioner.clone();
        let id = sandbox.id().to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = provisioner.release(sandbox).await {
                        warn!(sandbox = %id, error = %e, "Deferred sandbox release failed");
                    }
                });
            }
            Err(_) => warn!(sandbox = %id, "Sandbox dropped outside a runtime; left for orphan cleanup"),
        }
    }
}

pub fn build_provisioner(config: &EngineConfig) -> Result<Arc<dyn Provisioner>, SandboxError> {
    match config.backend {
        BackendKind::Docker => Ok(Arc::new(docker::DockerProvisioner::connect(config)?)),
        BackendKind::Jail => Ok(Arc::new(jail::JailProvisioner::new(config)?)),
    }
}

/// Append until `buf` holds `max` bytes; false once anything was dropped.
pub(crate) fn push_capped(buf: &mut Vec<u8>, chunk: &[u8], max: usize) -> bool {
    let room = max.saturating_sub(buf.len());
    if chunk.len() <= room {
        buf.extend_from_slice(chunk);
        true
    } else {
        buf.extend_from_slice(&chunk[..room]);
        false
    }
}
