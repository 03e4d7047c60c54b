//! Scripted in-memory backend for tests.
//!
//! Every `exec` is answered by a handler closure; nothing is spawned. The
//! provisioner counts acquires and releases so callers can assert that each
//! request got exactly one sandbox back.

use super::{
    CleanupReport, ExecOutcome, ExecSpec, ImageStatus, Provisioner, ProvisionerStatus, Sandbox,
    SandboxPaths, Termination,
};
use crate::error::SandboxError;
use crate::registry::LanguageProfile;
use async_trait::async_trait;
use gradebox_common::types::ResourceLimits;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub enum FakeStep {
    Done(ExecOutcome),
    /// Block until cancelled or the wall time runs out.
    Hang,
    /// The backend itself fails.
    Fail(String),
}

/// Memory limits in the order the sandbox saw them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryEvent {
    /// Sandbox-wide ceiling, at acquire and on every change.
    Ceiling(u64),
    /// Per-exec limit handed to a command.
    Exec { program: String, memory_mb: u64 },
}

pub type FakeHandler = dyn Fn(&ExecSpec) -> FakeStep + Send + Sync;

#[derive(Default)]
pub struct FakeCounters {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub execs: AtomicUsize,
}

pub struct FakeProvisioner {
    handler: Arc<FakeHandler>,
    pub counters: Arc<FakeCounters>,
    pub fail_acquire: AtomicBool,
    written: Arc<Mutex<Vec<(String, String)>>>,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
    memory: Arc<Mutex<Vec<MemoryEvent>>>,
}

impl FakeProvisioner {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ExecSpec) -> FakeStep + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            counters: Arc::new(FakeCounters::default()),
            fail_acquire: AtomicBool::new(false),
            written: Arc::new(Mutex::new(Vec::new())),
            commands: Arc::new(Mutex::new(Vec::new())),
            memory: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Echo stdin back on stdout for every command.
    pub fn echo() -> Self {
        Self::new(|spec| FakeStep::Done(ExecOutcome::exited(0, spec.stdin.clone(), "")))
    }

    pub fn acquired(&self) -> usize {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::SeqCst)
    }

    pub fn execs(&self) -> usize {
        self.counters.execs.load(Ordering::SeqCst)
    }

    /// `(file name, content)` of every file written so far.
    pub fn written_files(&self) -> Vec<(String, String)> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// argv of every exec so far, in order.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn memory_events(&self) -> Vec<MemoryEvent> {
        self.memory.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

fn record<T>(log: &Mutex<Vec<T>>, item: T) {
    if let Ok(mut log) = log.lock() {
        log.push(item);
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    fn backend(&self) -> &'static str {
        "fake"
    }

    async fn init(&self, profiles: &[Arc<LanguageProfile>]) -> Result<ProvisionerStatus, SandboxError> {
        Ok(ProvisionerStatus {
            backend: self.backend().to_string(),
            ready: true,
            images: profiles
                .iter()
                .map(|p| ImageStatus {
                    language: p.id.to_string(),
                    image: p.image.clone(),
                    present: true,
                    message: None,
                })
                .collect(),
        })
    }

    async fn acquire(
        &self,
        _profile: &LanguageProfile,
        limits: &ResourceLimits,
        _lifetime: Duration,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(SandboxError::Provision("fake provisioning failure".to_string()));
        }
        let n = self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        record(&self.memory, MemoryEvent::Ceiling(limits.memory_mb));
        Ok(Box::new(FakeSandbox {
            id: format!("fake-{}", n),
            paths: SandboxPaths {
                source_dir: "/sandbox/src".to_string(),
                build_dir: "/sandbox/build".to_string(),
            },
            handler: self.handler.clone(),
            counters: self.counters.clone(),
            written: self.written.clone(),
            commands: self.commands.clone(),
            memory: self.memory.clone(),
        }))
    }

    async fn release(&self, _sandbox: Box<dyn Sandbox>) -> Result<(), SandboxError> {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rebuild_images(
        &self,
        profiles: &[Arc<LanguageProfile>],
    ) -> Result<Vec<ImageStatus>, SandboxError> {
        Ok(self.init(profiles).await?.images)
    }

    async fn cleanup_orphans(&self) -> Result<CleanupReport, SandboxError> {
        Ok(CleanupReport::default())
    }

    fn live_sandboxes(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

pub struct FakeSandbox {
    id: String,
    paths: SandboxPaths,
    handler: Arc<FakeHandler>,
    counters: Arc<FakeCounters>,
    written: Arc<Mutex<Vec<(String, String)>>>,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
    memory: Arc<Mutex<Vec<MemoryEvent>>>,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn paths(&self) -> &SandboxPaths {
        &self.paths
    }

    async fn write_file(&self, name: &str, content: &str) -> Result<String, SandboxError> {
        record(&self.written, (name.to_string(), content.to_string()));
        Ok(self.paths.source_file(name))
    }

    async fn set_memory_limit(&self, memory_mb: u64) -> Result<(), SandboxError> {
        record(&self.memory, MemoryEvent::Ceiling(memory_mb));
        Ok(())
    }

    async fn exec(&self, spec: ExecSpec) -> Result<ExecOutcome, SandboxError> {
        self.counters.execs.fetch_add(1, Ordering::SeqCst);
        record(&self.commands, spec.argv.clone());
        record(
            &self.memory,
            MemoryEvent::Exec {
                program: spec.argv.first().cloned().unwrap_or_default(),
                memory_mb: spec.memory_mb,
            },
        );
        match (self.handler)(&spec) {
            FakeStep::Done(outcome) => Ok(outcome),
            FakeStep::Fail(reason) => Err(SandboxError::Backend(anyhow::anyhow!(reason))),
            FakeStep::Hang => {
                let termination = tokio::select! {
                    _ = spec.cancel.cancelled() => Termination::Cancelled,
                    _ = tokio::time::sleep(spec.wall_time) => Termination::WallTimeExceeded,
                };
                let mut outcome = ExecOutcome::terminated(termination);
                outcome.elapsed = spec.wall_time;
                Ok(outcome)
            }
        }
    }
}
