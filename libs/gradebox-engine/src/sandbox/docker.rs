/// Docker sandbox backend
///
/// **Container Rules:**
/// - One container per request, kept alive by a bounded `sleep` so compile
///   and every test case share the same filesystem
/// - Runs as an unprivileged uid with all capabilities dropped,
///   `no-new-privileges`, no network and a read-only root filesystem
/// - Writable areas are tmpfs mounts: `/sandbox/src` (noexec),
///   `/sandbox/build` (exec, for compiler output) and `/tmp` (noexec)
/// - Memory, swap, CPU share, pids and open files are capped by the daemon
/// - Every container is labelled so a restarted engine can sweep orphans
///
/// **Per-process enforcement:**
/// Each exec runs under `timeout -s KILL` with CPU-time rlimits applied by
/// the wrapper shell. A host-side watchdog fires at wall time plus a grace
/// period. After every exec, however it ended, every sandbox process is
/// killed with `kill -KILL -1`, which inside the container's pid namespace
/// spares only the keepalive (pid 1), so background children never leak
/// into the next test case.

use super::{
    push_capped, CleanupReport, ExecOutcome, ExecSpec, ImageStatus, Provisioner,
    ProvisionerStatus, Sandbox, SandboxPaths, Termination,
};
use crate::error::SandboxError;
use crate::registry::LanguageProfile;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, UpdateContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use dashmap::DashMap;
use futures_util::stream::StreamExt;
use gradebox_common::config::EngineConfig;
use gradebox_common::types::ResourceLimits;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const LABEL_MANAGED: &str = "gradebox.managed";
pub const LABEL_OWNER: &str = "gradebox.owner";
pub const LABEL_LANGUAGE: &str = "gradebox.language";

const SOURCE_DIR: &str = "/sandbox/src";
const BUILD_DIR: &str = "/sandbox/build";
const STDIN_FILE: &str = "/sandbox/src/.stdin";

/// base64 characters per exec argument; stays well under MAX_ARG_STRLEN.
const WRITE_CHUNK_BYTES: usize = 96 * 1024;

/// pids used by the exec'd shell, `timeout` and the kill helper.
const WRAPPER_PIDS: u64 = 4;
const WRAPPER_FDS: u64 = 8;

const EXIT_TIMEOUT: i64 = 124;
const EXIT_SIGKILL: i64 = 137;
const EXIT_SIGXCPU: i64 = 152;

/// Container removal guard: used between create and the hand-off to the
/// caller so a failed start never leaks a container.
struct ContainerGuard {
    docker: Docker,
    container_id: Option<String>,
}

impl ContainerGuard {
    fn new(docker: Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id: Some(container_id),
        }
    }

    fn disarm(mut self) {
        self.container_id = None;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(container_id) = self.container_id.take() else {
            return;
        };
        let docker = self.docker.clone();
        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

pub struct DockerProvisioner {
    docker: Docker,
    owner: String,
    user: String,
    images_dir: PathBuf,
    grace: Duration,
    live: Arc<DashMap<String, Instant>>,
}

impl DockerProvisioner {
    pub fn connect(config: &EngineConfig) -> Result<Self, SandboxError> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self {
            docker,
            owner: config.instance_label.clone(),
            user: config.sandbox_user.clone(),
            images_dir: config.images_dir.clone(),
            grace: Duration::from_millis(config.watchdog_grace_ms),
            live: Arc::new(DashMap::new()),
        })
    }

    /// Make sure the image exists locally, pulling it when a registry has it.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, attempting pull");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = Box::pin(self.docker.create_image(options, None, None));
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                warn!(image = %image, error = %e, "Image pull failed");
                return Err(SandboxError::ImageMissing(image.to_string()));
            }
        }
        info!(image = %image, "Image pulled");
        Ok(())
    }

    fn labels(&self, profile: &LanguageProfile) -> HashMap<String, String> {
        HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_OWNER.to_string(), self.owner.clone()),
            (LABEL_LANGUAGE.to_string(), profile.id.to_string()),
        ])
    }

    fn dockerfile_path(&self, profile: &LanguageProfile) -> PathBuf {
        let file = Path::new(&profile.dockerfile)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&profile.dockerfile));
        self.images_dir.join(file)
    }

    async fn build_one(&self, profile: &LanguageProfile) -> anyhow::Result<()> {
        let path = self.dockerfile_path(profile);
        let dockerfile = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let context = dockerfile_context(&dockerfile)?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: profile.image.clone(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };
        let mut stream = Box::pin(self.docker.build_image(options, None, Some(context.into())));
        while let Some(item) = stream.next().await {
            let info = item.context("image build stream failed")?;
            if let Some(error) = info.error {
                return Err(anyhow!("build failed: {}", error));
            }
            if let Some(line) = info.stream {
                let line = line.trim();
                if !line.is_empty() {
                    debug!(image = %profile.image, "{}", line);
                }
            }
        }
        Ok(())
    }
}

/// Tar archive holding just the Dockerfile; the images need no other context.
fn dockerfile_context(dockerfile: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, "Dockerfile", dockerfile)
        .context("failed to build docker context")?;
    builder.into_inner().context("failed to finish docker context")
}

pub(crate) fn container_config(
    profile: &LanguageProfile,
    limits: &ResourceLimits,
    lifetime: Duration,
    user: &str,
    labels: HashMap<String, String>,
) -> Config<String> {
    let memory_bytes = (limits.memory_mb * 1024 * 1024) as i64;
    let nano_cpus = (profile.cpu_share * 1_000_000_000.0) as i64;
    let pids = limits.max_processes + profile.runtime_pid_overhead + WRAPPER_PIDS;
    let files = (limits.max_open_files + profile.runtime_fd_overhead + WRAPPER_FDS) as i64;

    let tmpfs = HashMap::from([
        (
            SOURCE_DIR.to_string(),
            "rw,noexec,nosuid,nodev,size=16m,mode=1777".to_string(),
        ),
        (
            BUILD_DIR.to_string(),
            "rw,exec,nosuid,nodev,size=256m,mode=1777".to_string(),
        ),
        (
            "/tmp".to_string(),
            "rw,noexec,nosuid,nodev,size=16m,mode=1777".to_string(),
        ),
    ]);

    Config {
        image: Some(profile.image.clone()),
        cmd: Some(vec![
            "sleep".to_string(),
            lifetime.as_secs().max(1).to_string(),
        ]),
        entrypoint: Some(vec![]),
        user: Some(user.to_string()),
        working_dir: Some(BUILD_DIR.to_string()),
        labels: Some(labels),
        network_disabled: Some(true),
        attach_stdout: Some(false),
        attach_stderr: Some(false),
        host_config: Some(HostConfig {
            memory: Some(memory_bytes),
            memory_swap: Some(memory_bytes),
            nano_cpus: Some(nano_cpus),
            pids_limit: Some(pids as i64),
            ulimits: Some(vec![
                ResourcesUlimits {
                    name: Some("nofile".to_string()),
                    soft: Some(files),
                    hard: Some(files),
                },
                ResourcesUlimits {
                    name: Some("core".to_string()),
                    soft: Some(0),
                    hard: Some(0),
                },
            ]),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            tmpfs: Some(tmpfs),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl Provisioner for DockerProvisioner {
    fn backend(&self) -> &'static str {
        "docker"
    }

    async fn init(&self, profiles: &[Arc<LanguageProfile>]) -> Result<ProvisionerStatus, SandboxError> {
        self.docker
            .ping()
            .await
            .map_err(|e| SandboxError::Provision(format!("docker daemon unreachable: {}", e)))?;

        let mut images = Vec::with_capacity(profiles.len());
        for profile in profiles {
            let present = self.docker.inspect_image(&profile.image).await.is_ok();
            if !present {
                warn!(image = %profile.image, language = %profile.id, "Sandbox image missing");
            }
            images.push(ImageStatus {
                language: profile.id.to_string(),
                image: profile.image.clone(),
                present,
                message: None,
            });
        }
        Ok(ProvisionerStatus {
            backend: self.backend().to_string(),
            ready: true,
            images,
        })
    }

    async fn acquire(
        &self,
        profile: &LanguageProfile,
        limits: &ResourceLimits,
        lifetime: Duration,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        self.ensure_image(&profile.image).await?;

        let name = format!("gradebox-{}-{}", profile.id, uuid::Uuid::new_v4());
        let config = container_config(profile, limits, lifetime, &self.user, self.labels(profile));
        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::Provision(format!("create container: {}", e)))?;
        let container_id = container.id;
        let guard = ContainerGuard::new(self.docker.clone(), container_id.clone());

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Provision(format!("start container: {}", e)))?;

        guard.disarm();
        self.live.insert(container_id.clone(), Instant::now());
        debug!(container = %container_id, language = %profile.id, "Sandbox container started");

        Ok(Box::new(DockerSandbox {
            docker: self.docker.clone(),
            container_id,
            paths: SandboxPaths {
                source_dir: SOURCE_DIR.to_string(),
                build_dir: BUILD_DIR.to_string(),
            },
            grace: self.grace,
            oom_reported: AtomicBool::new(false),
        }))
    }

    async fn release(&self, sandbox: Box<dyn Sandbox>) -> Result<(), SandboxError> {
        let container_id = sandbox.id().to_string();
        drop(sandbox);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        let result = self
            .docker
            .remove_container(&container_id, Some(options))
            .await
            .with_context(|| format!("failed to remove container {}", container_id));
        self.live.remove(&container_id);
        result?;
        debug!(container = %container_id, "Sandbox container removed");
        Ok(())
    }

    async fn rebuild_images(
        &self,
        profiles: &[Arc<LanguageProfile>],
    ) -> Result<Vec<ImageStatus>, SandboxError> {
        let mut report = Vec::with_capacity(profiles.len());
        for profile in profiles {
            info!(image = %profile.image, language = %profile.id, "Building sandbox image");
            let status = match self.build_one(profile).await {
                Ok(()) => ImageStatus {
                    language: profile.id.to_string(),
                    image: profile.image.clone(),
                    present: true,
                    message: None,
                },
                Err(e) => {
                    warn!(image = %profile.image, error = %e, "Image build failed");
                    ImageStatus {
                        language: profile.id.to_string(),
                        image: profile.image.clone(),
                        present: self.docker.inspect_image(&profile.image).await.is_ok(),
                        message: Some(format!("{:#}", e)),
                    }
                }
            };
            report.push(status);
        }
        Ok(report)
    }

    async fn cleanup_orphans(&self) -> Result<CleanupReport, SandboxError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![
                format!("{}=true", LABEL_MANAGED),
                format!("{}={}", LABEL_OWNER, self.owner),
            ],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("failed to list sandbox containers")?;

        let mut report = CleanupReport::default();
        for summary in containers {
            let Some(id) = summary.id else { continue };
            if self.live.contains_key(&id) {
                continue;
            }
            let options = RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            };
            match self.docker.remove_container(&id, Some(options)).await {
                Ok(()) => {
                    info!(container = %id, "Removed orphaned sandbox");
                    report.removed.push(id);
                }
                Err(e) => {
                    warn!(container = %id, error = %e, "Failed to remove orphaned sandbox");
                    report.failed.push(id);
                }
            }
        }
        Ok(report)
    }

    fn live_sandboxes(&self) -> usize {
        self.live.len()
    }
}

pub struct DockerSandbox {
    docker: Docker,
    container_id: String,
    paths: SandboxPaths,
    grace: Duration,
    /// The daemon's OOMKilled flag is sticky for the container's lifetime;
    /// only its first flip can be pinned on an exec.
    oom_reported: AtomicBool,
}

enum Interrupt {
    Watchdog,
    Cancelled,
    OutputCap,
}

impl DockerSandbox {
    /// Run a helper command to completion and return its exit code and output.
    async fn exec_simple(&self, cmd: Vec<String>) -> anyhow::Result<(i64, String)> {
        let exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("failed to create exec")?;

        let mut stderr = String::new();
        let started = self
            .docker
            .start_exec(&exec.id, Some(StartExecOptions::default()))
            .await
            .context("failed to start exec")?;
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                if let Ok(LogOutput::StdErr { message }) = chunk {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
            }
        }

        let code = self.exit_code(&exec.id).await?;
        Ok((code, stderr))
    }

    async fn exit_code(&self, exec_id: &str) -> anyhow::Result<i64> {
        for _ in 0..20 {
            let inspect = self
                .docker
                .inspect_exec(exec_id)
                .await
                .context("failed to inspect exec")?;
            if inspect.running != Some(true) {
                if let Some(code) = inspect.exit_code {
                    return Ok(code);
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Err(anyhow!("exec {} did not report an exit code", exec_id))
    }

    /// Write bytes to `path` through base64 chunks, so content never passes
    /// through a shell unquoted and no argument exceeds the kernel limit.
    async fn write_bytes(&self, path: &str, content: &[u8]) -> anyhow::Result<()> {
        let encoded = general_purpose::STANDARD.encode(content);
        let staging = format!("{}.b64", path);

        let chunks: Vec<&str> = if encoded.is_empty() {
            vec![""]
        } else {
            encoded
                .as_bytes()
                .chunks(WRITE_CHUNK_BYTES)
                .map(|c| std::str::from_utf8(c).unwrap_or_default())
                .collect()
        };

        for (idx, chunk) in chunks.iter().enumerate() {
            let redirect = if idx == 0 { ">" } else { ">>" };
            let script = format!("printf %s \"$1\" {} \"$2\"", redirect);
            let (code, stderr) = self
                .exec_simple(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    script,
                    "write".to_string(),
                    chunk.to_string(),
                    staging.clone(),
                ])
                .await?;
            if code != 0 {
                return Err(anyhow!("writing {} failed ({}): {}", path, code, stderr.trim()));
            }
        }

        let (code, stderr) = self
            .exec_simple(vec![
                "sh".to_string(),
                "-c".to_string(),
                "base64 -d \"$1\" > \"$2\" && rm -f \"$1\"".to_string(),
                "write".to_string(),
                staging,
                path.to_string(),
            ])
            .await?;
        if code != 0 {
            return Err(anyhow!("decoding {} failed ({}): {}", path, code, stderr.trim()));
        }
        Ok(())
    }

    /// Kill every process in the container except the keepalive.
    async fn kill_all(&self) {
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            "kill -KILL -1 2>/dev/null; true".to_string(),
        ];
        if let Err(e) = self.exec_simple(cmd).await {
            warn!(container = %self.container_id, error = %e, "Failed to kill sandbox processes");
        }
    }

    /// Whether the memory cgroup killed something since the last check.
    async fn fresh_oom_kill(&self) -> bool {
        let oom_killed = match self
            .docker
            .inspect_container(&self.container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                warn!(container = %self.container_id, error = %e, "Failed to inspect container state");
                false
            }
        };
        oom_killed && !self.oom_reported.swap(true, Ordering::SeqCst)
    }
}

/// Shell wrapper that applies per-process limits and hands over to the
/// program via `exec`, so the argv itself is never re-parsed by a shell.
pub(crate) fn wrapper_script(spec: &ExecSpec) -> String {
    let cpu = spec.cpu_time_seconds.max(1);
    format!(
        "ulimit -S -t {cpu}; ulimit -H -t {hard}; ulimit -n {files}; \
         exec timeout -s KILL {wall:.3}s \"$@\" < {stdin}",
        cpu = cpu,
        hard = cpu + 1,
        files = spec.max_open_files.max(3),
        wall = spec.wall_time.as_secs_f64(),
        stdin = STDIN_FILE,
    )
}

/// Map an exec's exit code to how it ended. 124 is `timeout` firing; 152 is
/// SIGXCPU from the soft CPU limit. A bare SIGKILL is the memory cgroup when
/// the daemon reports a fresh OOM kill; otherwise elapsed time decides
/// between the wall and hard CPU limits, and memory is the fallback.
pub(crate) fn classify_exit(
    code: i64,
    elapsed: Duration,
    spec: &ExecSpec,
    oom_killed: bool,
) -> Termination {
    match code {
        EXIT_TIMEOUT => Termination::WallTimeExceeded,
        EXIT_SIGXCPU => Termination::CpuTimeExceeded,
        EXIT_SIGKILL if oom_killed => Termination::MemoryExceeded,
        EXIT_SIGKILL if elapsed >= spec.wall_time => Termination::WallTimeExceeded,
        EXIT_SIGKILL if elapsed >= Duration::from_secs(spec.cpu_time_seconds) => {
            Termination::CpuTimeExceeded
        }
        EXIT_SIGKILL => Termination::MemoryExceeded,
        c if c > 128 && c < 160 => Termination::Signaled((c - 128) as i32),
        _ => Termination::Exited,
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.container_id
    }

    fn paths(&self) -> &SandboxPaths {
        &self.paths
    }

    async fn write_file(&self, name: &str, content: &str) -> Result<String, SandboxError> {
        if name.is_empty() || name.contains('/') {
            return Err(SandboxError::Backend(anyhow!("invalid file name '{}'", name)));
        }
        let path = self.paths.source_file(name);
        self.write_bytes(&path, content.as_bytes()).await?;
        Ok(path)
    }

    async fn exec(&self, spec: ExecSpec) -> Result<ExecOutcome, SandboxError> {
        self.write_bytes(STDIN_FILE, spec.stdin.as_bytes()).await?;

        let mut cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            wrapper_script(&spec),
            "sandbox".to_string(),
        ];
        cmd.extend(spec.argv.iter().cloned());
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    env: Some(env),
                    working_dir: Some(BUILD_DIR.to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("failed to create exec")?;

        let started_at = Instant::now();
        let started = self
            .docker
            .start_exec(&exec.id, Some(StartExecOptions::default()))
            .await
            .context("failed to start exec")?;
        let StartExecResults::Attached { mut output, .. } = started else {
            return Err(SandboxError::Backend(anyhow!("exec started detached")));
        };

        let cap = spec.max_output_bytes;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut interrupt = None;

        let watchdog = tokio::time::sleep(spec.wall_time + self.grace);
        tokio::pin!(watchdog);

        loop {
            tokio::select! {
                biased;
                _ = spec.cancel.cancelled() => {
                    interrupt = Some(Interrupt::Cancelled);
                    break;
                }
                _ = &mut watchdog => {
                    interrupt = Some(Interrupt::Watchdog);
                    break;
                }
                chunk = output.next() => match chunk {
                    Some(Ok(LogOutput::StdOut { message })) => {
                        if !push_capped(&mut stdout, &message, cap) {
                            interrupt = Some(Interrupt::OutputCap);
                            break;
                        }
                    }
                    Some(Ok(LogOutput::StdErr { message })) => {
                        if !push_capped(&mut stderr, &message, cap) {
                            interrupt = Some(Interrupt::OutputCap);
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.kill_all().await;
                        return Err(SandboxError::Backend(
                            anyhow!(e).context("exec output stream failed"),
                        ));
                    }
                    None => break,
                }
            }
        }
        drop(output);

        let elapsed = started_at.elapsed();
        let (termination, exit_code) = match interrupt {
            Some(reason) => {
                self.kill_all().await;
                let termination = match reason {
                    Interrupt::Watchdog => Termination::WallTimeExceeded,
                    Interrupt::Cancelled => Termination::Cancelled,
                    Interrupt::OutputCap => Termination::OutputLimitExceeded,
                };
                (termination, None)
            }
            None => {
                let code = self.exit_code(&exec.id).await?;
                let oom_killed = code == EXIT_SIGKILL && self.fresh_oom_kill().await;
                // Background children outlive a normal exit otherwise.
                self.kill_all().await;
                (classify_exit(code, elapsed, &spec, oom_killed), Some(code))
            }
        };

        Ok(ExecOutcome {
            termination,
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            elapsed,
            cpu_time_ms: None,
            peak_memory_kb: self.peak_memory_kb().await,
        })
    }

    async fn set_memory_limit(&self, memory_mb: u64) -> Result<(), SandboxError> {
        let bytes = (memory_mb * 1024 * 1024) as i64;
        self.docker
            .update_container(
                &self.container_id,
                UpdateContainerOptions::<String> {
                    memory: Some(bytes),
                    memory_swap: Some(bytes),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("failed to set memory limit to {} MB", memory_mb))?;
        debug!(container = %self.container_id, memory_mb, "Container memory limit updated");
        Ok(())
    }

    async fn peak_memory_kb(&self) -> Option<u64> {
        let options = Some(StatsOptions {
            stream: false,
            one_shot: true,
        });
        let mut stream = Box::pin(self.docker.stats(&self.container_id, options));
        match stream.next().await {
            Some(Ok(stats)) => stats
                .memory_stats
                .max_usage
                .or(stats.memory_stats.usage)
                .map(|bytes| bytes / 1024),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LanguageRegistry;
    use gradebox_common::limits::level_cap;
    use gradebox_common::types::{Language, SecurityLevel};
    use tokio_util::sync::CancellationToken;

    fn spec(wall_secs: u64, cpu_secs: u64) -> ExecSpec {
        ExecSpec {
            argv: vec!["python3".to_string(), "/sandbox/src/main.py".to_string()],
            env: vec![],
            stdin: String::new(),
            wall_time: Duration::from_secs(wall_secs),
            cpu_time_seconds: cpu_secs,
            memory_mb: 128,
            max_output_bytes: 1024,
            max_open_files: 16,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_classify_exit_codes() {
        let s = spec(10, 5);
        let early = Duration::from_millis(300);
        assert_eq!(classify_exit(0, early, &s, false), Termination::Exited);
        assert_eq!(classify_exit(1, early, &s, false), Termination::Exited);
        assert_eq!(classify_exit(124, early, &s, false), Termination::WallTimeExceeded);
        assert_eq!(classify_exit(152, early, &s, false), Termination::CpuTimeExceeded);
        assert_eq!(classify_exit(137, early, &s, false), Termination::MemoryExceeded);
        assert_eq!(classify_exit(137, Duration::from_secs(6), &s, false), Termination::CpuTimeExceeded);
        assert_eq!(classify_exit(137, Duration::from_secs(11), &s, false), Termination::WallTimeExceeded);
        assert_eq!(classify_exit(139, early, &s, false), Termination::Signaled(11));
    }

    #[test]
    fn test_oom_kill_beats_elapsed_time() {
        let s = spec(10, 5);
        // A slow allocator killed by the cgroup after the CPU budget's worth of time.
        assert_eq!(classify_exit(137, Duration::from_secs(6), &s, true), Termination::MemoryExceeded);
        assert_eq!(classify_exit(137, Duration::from_secs(11), &s, true), Termination::MemoryExceeded);
        // The flag only matters for a bare SIGKILL.
        assert_eq!(classify_exit(124, Duration::from_secs(11), &s, true), Termination::WallTimeExceeded);
        assert_eq!(classify_exit(0, Duration::from_secs(1), &s, true), Termination::Exited);
    }

    #[test]
    fn test_wrapper_script_limits() {
        let script = wrapper_script(&spec(2, 1));
        assert!(script.contains("ulimit -S -t 1;"));
        assert!(script.contains("ulimit -H -t 2;"));
        assert!(script.contains("ulimit -n 16;"));
        assert!(script.contains("timeout -s KILL 2.000s \"$@\""));
        assert!(script.ends_with(STDIN_FILE));
    }

    #[test]
    fn test_container_is_locked_down() {
        let registry = LanguageRegistry::builtin().unwrap();
        let java = registry.get(Language::Java).unwrap();
        let limits = level_cap(SecurityLevel::High);
        let config = container_config(
            &java,
            &limits,
            Duration::from_secs(120),
            "65534:65534",
            HashMap::new(),
        );

        assert_eq!(config.user.as_deref(), Some("65534:65534"));
        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(config.cmd, Some(vec!["sleep".to_string(), "120".to_string()]));

        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(
            host.pids_limit,
            Some((limits.max_processes + java.runtime_pid_overhead + WRAPPER_PIDS) as i64)
        );

        let tmpfs = host.tmpfs.unwrap();
        assert!(tmpfs[SOURCE_DIR].contains("noexec"));
        assert!(tmpfs[BUILD_DIR].contains(",exec,"));
    }

    #[test]
    fn test_dockerfile_context_is_a_tar() {
        let bytes = dockerfile_context(b"FROM scratch\n").unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["Dockerfile".to_string()]);
    }

    async fn python_sandbox() -> (DockerProvisioner, Box<dyn Sandbox>) {
        let config = EngineConfig::default();
        let provisioner = DockerProvisioner::connect(&config).unwrap();
        let registry = LanguageRegistry::builtin().unwrap();
        let python = registry.get(Language::Python).unwrap();
        let sandbox = provisioner
            .acquire(&python, &python.default_limits, Duration::from_secs(60))
            .await
            .unwrap();
        (provisioner, sandbox)
    }

    fn shell(script: &str) -> ExecSpec {
        let mut s = spec(5, 2);
        s.argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        s
    }

    #[tokio::test]
    #[ignore] // Requires Docker and the python image
    async fn test_background_children_die_with_their_exec() {
        let (provisioner, sandbox) = python_sandbox().await;

        let first = sandbox
            .exec(shell("sleep 300 >/dev/null 2>&1 & echo $! > /sandbox/build/bg; echo started"))
            .await
            .unwrap();
        assert_eq!(first.stdout, "started\n");

        let second = sandbox
            .exec(shell("kill -0 $(cat /sandbox/build/bg) 2>/dev/null && echo alive || echo gone"))
            .await
            .unwrap();
        assert_eq!(second.stdout, "gone\n");

        provisioner.release(sandbox).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Docker and the python image
    async fn test_memory_limit_can_be_raised_and_lowered() {
        let (provisioner, sandbox) = python_sandbox().await;
        sandbox.set_memory_limit(512).await.unwrap();

        let inspect = provisioner
            .docker
            .inspect_container(sandbox.id(), None::<InspectContainerOptions>)
            .await
            .unwrap();
        let host = inspect.host_config.unwrap();
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);

        sandbox.set_memory_limit(128).await.unwrap();
        let inspect = provisioner
            .docker
            .inspect_container(sandbox.id(), None::<InspectContainerOptions>)
            .await
            .unwrap();
        assert_eq!(inspect.host_config.unwrap().memory, Some(128 * 1024 * 1024));

        provisioner.release(sandbox).await.unwrap();
    }
}
