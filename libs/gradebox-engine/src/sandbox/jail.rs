//! Process-jail sandbox backend.
//!
//! No container runtime: each request gets a scratch directory under the
//! configured work root, a uid of its own leased from the configured range,
//! and every process is started through a pre-exec sequence that runs in the
//! forked child before `execve`:
//!
//! 1. `setsid()`, so the whole process tree can be killed as one group
//! 2. rlimits: address space, CPU (soft/hard), open files, file size, core
//!    dumps, and process count when the sandbox has its own uid
//! 3. fresh network and mount namespaces; in the mount namespace the base
//!    filesystem is read-only and the source directory is `noexec`
//! 4. `setgroups`/`setgid`/`setuid` to the leased identity
//! 5. `PR_SET_PDEATHSIG(SIGKILL)`, so nothing outlives the engine
//! 6. `PR_SET_NO_NEW_PRIVS`
//!
//! Sandbox roots are mode 0700 and owned by their own uid, so one sandbox
//! cannot reach another's files. Releasing a sandbox kills whatever still
//! runs under its uid before the uid goes back to the pool.
//!
//! Peak memory and CPU time come from the `wait4` rusage of the child. The
//! address-space limit counts reservations, not residency, so runtimes that
//! map large arenas up front (JVM, Go, Node, Mono) need the docker backend.

use super::{
    push_capped, CleanupReport, ExecOutcome, ExecSpec, ImageStatus, Provisioner,
    ProvisionerStatus, Sandbox, SandboxPaths, Termination,
};
use crate::error::SandboxError;
use crate::registry::LanguageProfile;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gradebox_common::config::EngineConfig;
use gradebox_common::types::ResourceLimits;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{chown, setgid, setgroups, setsid, setuid, Gid, Pid, Uid};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BASE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const MAX_FILE_BYTES: u64 = 64 * 1024 * 1024;
const READ_CHUNK: usize = 8192;

/// Exit statuses at or above this share of the memory limit count as OOM.
const MEMORY_EXCEEDED_RATIO: f64 = 0.9;

/// Runtime messages for a failed allocation. Only trusted when the process
/// was killed by a signal; a program that exits on its own picked its code.
const OOM_MARKERS: [&str; 4] = [
    "MemoryError",
    "std::bad_alloc",
    "out of memory",
    "Cannot allocate memory",
];

/// Per-sandbox identities carved out of the configured uid range.
struct UidPool {
    base_uid: u32,
    base_gid: Option<u32>,
    count: u32,
    leased: DashMap<u32, String>,
}

impl UidPool {
    /// Lease the first free uid for `sandbox`. Uids that `busy` reports as
    /// running processes are skipped, since they would eat into the
    /// per-uid process limit.
    fn lease<F>(&self, sandbox: &str, busy: F) -> Result<(u32, u32), SandboxError>
    where
        F: Fn(u32) -> bool,
    {
        let mut foreign = 0;
        for offset in 0..self.count {
            let uid = self.base_uid + offset;
            if self.leased.contains_key(&uid) {
                continue;
            }
            if busy(uid) {
                foreign += 1;
                continue;
            }
            if let Entry::Vacant(slot) = self.leased.entry(uid) {
                slot.insert(sandbox.to_string());
                let gid = self.base_gid.map(|g| g + offset).unwrap_or(uid);
                return Ok((uid, gid));
            }
        }
        Err(SandboxError::Provision(if foreign > 0 {
            format!("no free jail uid; {} uid(s) in the range run foreign processes", foreign)
        } else {
            "every jail uid is leased".to_string()
        }))
    }

    fn release(&self, uid: u32) {
        self.leased.remove(&uid);
    }
}

/// Whether any process on the host has `uid` as its real uid.
fn uid_has_processes(uid: u32) -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return false;
    };
    entries.flatten().any(|entry| {
        let name = entry.file_name();
        let is_pid = name
            .to_str()
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
        is_pid
            && std::fs::read_to_string(entry.path().join("status"))
                .ok()
                .and_then(|status| real_uid(&status))
                == Some(uid)
    })
}

fn real_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|ids| ids.split_whitespace().next())
        .and_then(|id| id.parse().ok())
}

/// SIGKILL every process running as `uid`, including ones that left the
/// session their exec started.
async fn kill_uid(uid: u32, gid: u32) -> Result<(), SandboxError> {
    let mut command = tokio::process::Command::new("/bin/true");
    command
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: the hook only issues raw syscalls.
    unsafe {
        command.pre_exec(move || {
            setgroups(&[])?;
            setgid(Gid::from_raw(gid))?;
            setuid(Uid::from_raw(uid))?;
            // pid -1 from an unprivileged uid reaches that uid's processes, never the caller.
            match kill(Pid::from_raw(-1), Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => Err(e.into()),
            }
        });
    }
    let status = command
        .status()
        .await
        .with_context(|| format!("failed to sweep uid {}", uid))?;
    if !status.success() {
        return Err(SandboxError::Backend(anyhow!("sweep of uid {} exited with {}", uid, status)));
    }
    Ok(())
}

struct LiveJail {
    root: PathBuf,
    identity: Option<(u32, u32)>,
}

pub struct JailProvisioner {
    work_root: PathBuf,
    uids: Option<Arc<UidPool>>,
    isolate_network: bool,
    isolate_filesystem: bool,
    require_dedicated_uid: bool,
    live: Arc<DashMap<String, LiveJail>>,
}

impl JailProvisioner {
    pub fn new(config: &EngineConfig) -> Result<Self, SandboxError> {
        let jail = &config.jail;
        let uids = match (jail.run_as_uid, jail.run_as_gid) {
            (Some(base_uid), base_gid) => {
                let count = jail.uid_count.unwrap_or(config.max_sandboxes as u32);
                if (count as usize) < config.max_sandboxes {
                    return Err(SandboxError::Provision(format!(
                        "jail uid range holds {} uid(s) but up to {} sandboxes may be live",
                        count, config.max_sandboxes
                    )));
                }
                let fits = |base: u32| base.checked_add(count).is_some();
                if !fits(base_uid) || !base_gid.map_or(true, fits) {
                    return Err(SandboxError::Provision(
                        "jail uid range overflows".to_string(),
                    ));
                }
                Some(Arc::new(UidPool {
                    base_uid,
                    base_gid,
                    count,
                    leased: DashMap::new(),
                }))
            }
            (None, Some(_)) => {
                return Err(SandboxError::Provision(
                    "jail gid configured without a uid".to_string(),
                ))
            }
            (None, None) => None,
        };
        if uids.is_some() && !Uid::effective().is_root() {
            return Err(SandboxError::Provision(
                "switching to a dedicated uid requires running as root".to_string(),
            ));
        }

        std::fs::create_dir_all(&jail.work_root)
            .with_context(|| format!("failed to create {}", jail.work_root.display()))?;
        if uids.is_some() {
            // Sandbox uids may enter their own root but not list their neighbours.
            std::fs::set_permissions(&jail.work_root, std::fs::Permissions::from_mode(0o711))
                .with_context(|| format!("failed to restrict {}", jail.work_root.display()))?;
        }

        Ok(Self {
            work_root: jail.work_root.clone(),
            uids,
            isolate_network: jail.isolate_network,
            isolate_filesystem: jail.isolate_filesystem,
            require_dedicated_uid: jail.require_dedicated_uid,
            live: Arc::new(DashMap::new()),
        })
    }

    async fn lease_identity(&self, id: &str) -> Result<Option<(u32, u32)>, SandboxError> {
        let Some(pool) = self.uids.clone() else {
            return Ok(None);
        };
        let id = id.to_string();
        let identity = tokio::task::spawn_blocking(move || pool.lease(&id, uid_has_processes))
            .await
            .context("uid lease task failed")??;
        Ok(Some(identity))
    }

    fn return_identity(&self, identity: Option<(u32, u32)>) {
        if let (Some(pool), Some((uid, _))) = (&self.uids, identity) {
            pool.release(uid);
        }
    }
}

/// Root and build dir belong to the sandbox uid; the source dir stays with
/// the engine so a submission cannot rewrite itself.
async fn prepare_dirs(root: &Path, identity: Option<(u32, u32)>) -> Result<(), SandboxError> {
    let layout = [
        (root.to_path_buf(), 0o700, true),
        (root.join("src"), 0o755, false),
        (root.join("build"), 0o700, true),
    ];
    for (dir, mode, owned) in layout {
        tokio::fs::create_dir(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("failed to set mode on {}", dir.display()))?;
        if let (true, Some((uid, gid))) = (owned, identity) {
            chown(dir.as_path(), Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
                .with_context(|| format!("failed to chown {}", dir.display()))?;
        }
    }
    Ok(())
}

#[async_trait]
impl Provisioner for JailProvisioner {
    fn backend(&self) -> &'static str {
        "jail"
    }

    async fn init(&self, profiles: &[Arc<LanguageProfile>]) -> Result<ProvisionerStatus, SandboxError> {
        let marker = self.work_root.join(".write-check");
        tokio::fs::write(&marker, b"ok")
            .await
            .with_context(|| format!("{} is not writable", self.work_root.display()))?;
        let _ = tokio::fs::remove_file(&marker).await;

        match &self.uids {
            None => warn!(
                "Jail runs without a uid range; sandboxes share one identity and the process-count limit is not enforced"
            ),
            Some(pool) => info!(
                base_uid = pool.base_uid,
                count = pool.count,
                filesystem = self.isolate_filesystem,
                "Jail uid range configured"
            ),
        }

        let images = profiles
            .iter()
            .map(|profile| {
                let tool = profile
                    .compile
                    .as_ref()
                    .and_then(|c| c.first())
                    .unwrap_or(&profile.run[0]);
                let present = find_on_path(tool).is_some();
                ImageStatus {
                    language: profile.id.to_string(),
                    image: tool.clone(),
                    present,
                    message: (!present).then(|| format!("'{}' not found on PATH", tool)),
                }
            })
            .collect();

        Ok(ProvisionerStatus {
            backend: self.backend().to_string(),
            ready: !self.require_dedicated_uid || self.uids.is_some(),
            images,
        })
    }

    async fn acquire(
        &self,
        profile: &LanguageProfile,
        limits: &ResourceLimits,
        _lifetime: Duration,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        if self.require_dedicated_uid && self.uids.is_none() {
            return Err(SandboxError::Provision(
                "jail requires a dedicated uid range (GRADEBOX_JAIL_UID)".to_string(),
            ));
        }

        let id = format!("jail-{}", uuid::Uuid::new_v4());
        let root = self.work_root.join(&id);
        let source_dir = root.join("src");
        let build_dir = root.join("build");

        let identity = self.lease_identity(&id).await?;
        if let Err(e) = prepare_dirs(&root, identity).await {
            let _ = remove_tree(&root).await;
            self.return_identity(identity);
            return Err(e);
        }
        self.live.insert(
            id.clone(),
            LiveJail {
                root: root.clone(),
                identity,
            },
        );
        debug!(sandbox = %id, language = %profile.id, uid = ?identity.map(|(uid, _)| uid), "Jail directory created");

        let mounts = (identity.is_some() && self.isolate_filesystem).then(|| MountPlan {
            source_dir: source_dir.clone(),
            build_dir: build_dir.clone(),
        });

        Ok(Box::new(JailSandbox {
            id,
            paths: SandboxPaths {
                source_dir: source_dir.display().to_string(),
                build_dir: build_dir.display().to_string(),
            },
            policy: JailPolicy {
                nproc: identity.map(|_| limits.max_processes + profile.runtime_pid_overhead),
                isolate_network: self.isolate_network,
                mounts,
                run_as: identity,
            },
            peak_kb: AtomicU64::new(0),
        }))
    }

    async fn release(&self, sandbox: Box<dyn Sandbox>) -> Result<(), SandboxError> {
        let id = sandbox.id().to_string();
        drop(sandbox);
        let (root, identity) = match self.live.remove(&id) {
            Some((_, live)) => (live.root, live.identity),
            None => (self.work_root.join(&id), None),
        };
        if let Some((uid, gid)) = identity {
            if let Err(e) = kill_uid(uid, gid).await {
                warn!(sandbox = %id, uid, error = %e, "Failed to sweep sandbox uid");
            }
        }
        let removed = remove_tree(&root).await;
        self.return_identity(identity);
        removed?;
        debug!(sandbox = %id, "Jail directory removed");
        Ok(())
    }

    async fn rebuild_images(
        &self,
        _profiles: &[Arc<LanguageProfile>],
    ) -> Result<Vec<ImageStatus>, SandboxError> {
        Err(SandboxError::Unsupported("image builds"))
    }

    async fn cleanup_orphans(&self) -> Result<CleanupReport, SandboxError> {
        let mut report = CleanupReport::default();
        let mut entries = tokio::fs::read_dir(&self.work_root)
            .await
            .with_context(|| format!("failed to list {}", self.work_root.display()))?;

        while let Some(entry) = entries.next_entry().await.context("failed to read work root")? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("jail-") || self.live.contains_key(&name) {
                continue;
            }
            match remove_tree(&entry.path()).await {
                Ok(()) => {
                    info!(sandbox = %name, "Removed orphaned jail directory");
                    report.removed.push(name);
                }
                Err(e) => {
                    warn!(sandbox = %name, error = %e, "Failed to remove orphaned jail directory");
                    report.failed.push(name);
                }
            }
        }
        Ok(report)
    }

    fn live_sandboxes(&self) -> usize {
        self.live.len()
    }
}

async fn remove_tree(path: &Path) -> Result<(), SandboxError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow!(e)
            .context(format!("failed to remove {}", path.display()))
            .into()),
    }
}

fn find_on_path(tool: &str) -> Option<PathBuf> {
    if tool.contains('{') {
        // Built artifact, only exists after compilation.
        return Some(PathBuf::from(tool));
    }
    if tool.contains('/') {
        let path = PathBuf::from(tool);
        return path.exists().then_some(path);
    }
    BASE_PATH
        .split(':')
        .map(|dir| Path::new(dir).join(tool))
        .find(|candidate| candidate.exists())
}

#[derive(Debug, Clone)]
struct MountPlan {
    source_dir: PathBuf,
    build_dir: PathBuf,
}

#[derive(Debug, Clone)]
struct JailPolicy {
    nproc: Option<u64>,
    isolate_network: bool,
    mounts: Option<MountPlan>,
    run_as: Option<(u32, u32)>,
}

/// Everything the forked child needs, built before the fork.
#[derive(Debug, Clone)]
struct ChildLimits {
    address_space: u64,
    cpu_soft: u64,
    cpu_hard: u64,
    nofile: u64,
    policy: JailPolicy,
    was_root: bool,
}

/// Runs between fork and exec.
fn enter_jail(limits: &ChildLimits) -> std::io::Result<()> {
    setsid()?;

    setrlimit(Resource::RLIMIT_AS, limits.address_space, limits.address_space)?;
    setrlimit(Resource::RLIMIT_CPU, limits.cpu_soft, limits.cpu_hard)?;
    setrlimit(Resource::RLIMIT_NOFILE, limits.nofile, limits.nofile)?;
    setrlimit(Resource::RLIMIT_FSIZE, MAX_FILE_BYTES, MAX_FILE_BYTES)?;
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    if let Some(nproc) = limits.policy.nproc {
        setrlimit(Resource::RLIMIT_NPROC, nproc, nproc)?;
    }

    let mut namespaces = CloneFlags::empty();
    if limits.policy.isolate_network {
        namespaces |= CloneFlags::CLONE_NEWNET;
        if !limits.was_root {
            namespaces |= CloneFlags::CLONE_NEWUSER;
        }
    }
    if limits.policy.mounts.is_some() {
        namespaces |= CloneFlags::CLONE_NEWNS;
    }
    if !namespaces.is_empty() {
        unshare(namespaces)?;
    }
    if let Some(plan) = &limits.policy.mounts {
        isolate_mounts(plan)?;
    }

    if let Some((uid, gid)) = limits.policy.run_as {
        setgroups(&[])?;
        setgid(Gid::from_raw(gid))?;
        setuid(Uid::from_raw(uid))?;
    }

    // After the identity switch, which clears the parent-death signal.
    nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)?;
    nix::sys::prctl::set_no_new_privs()?;
    Ok(())
}

/// Inside a fresh mount namespace: everything read-only except the build
/// dir, and nothing under the source dir can be executed.
fn isolate_mounts(plan: &MountPlan) -> nix::Result<()> {
    let none: Option<&str> = None;
    mount(none, "/", none, MsFlags::MS_REC | MsFlags::MS_PRIVATE, none)?;

    let hardened = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    let dirs = [
        (plan.source_dir.as_path(), MsFlags::MS_NOEXEC | MsFlags::MS_RDONLY),
        (plan.build_dir.as_path(), MsFlags::empty()),
    ];
    for (dir, extra) in dirs {
        mount(Some(dir), dir, none, MsFlags::MS_BIND, none)?;
        mount(
            none,
            dir,
            none,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | hardened | extra,
            none,
        )?;
    }

    mount(
        none,
        "/",
        none,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        none,
    )
}

/// Blocking wait for one child, with its resource usage.
fn wait_child(pid: i32) -> std::io::Result<(i32, libc::rusage)> {
    let mut status = 0;
    // SAFETY: rusage is plain data; wait4 fills it in.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: valid pointers to locals for the duration of the call.
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if rc == pid {
            return Ok((status, usage));
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn cpu_millis(usage: &libc::rusage) -> u64 {
    let micros = |tv: libc::timeval| tv.tv_sec as u64 * 1_000_000 + tv.tv_usec as u64;
    (micros(usage.ru_utime) + micros(usage.ru_stime)) / 1000
}

async fn read_capped<R>(mut reader: R, cap: usize, overflow: CancellationToken) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if !push_capped(&mut buf, &chunk[..n], cap) {
                    overflow.cancel();
                    break;
                }
            }
        }
    }
    buf
}

/// How a reaped child ended. `memory_kb` is the limit the process ran under.
pub(crate) fn classify_wait(
    status: WaitStatus,
    cpu_ms: u64,
    maxrss_kb: u64,
    stderr: &str,
    cpu_limit_secs: u64,
    memory_kb: u64,
) -> (Termination, Option<i64>) {
    let near_memory_limit = maxrss_kb as f64 >= memory_kb as f64 * MEMORY_EXCEEDED_RATIO;
    let reports_oom = OOM_MARKERS.iter().any(|m| stderr.contains(m));
    let cpu_exhausted = cpu_ms >= cpu_limit_secs * 1000;

    match status {
        WaitStatus::Exited(_, 0) => (Termination::Exited, Some(0)),
        WaitStatus::Exited(_, code) if near_memory_limit => {
            (Termination::MemoryExceeded, Some(code as i64))
        }
        WaitStatus::Exited(_, code) => (Termination::Exited, Some(code as i64)),
        WaitStatus::Signaled(_, Signal::SIGXCPU, _) => (Termination::CpuTimeExceeded, None),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) if cpu_exhausted => {
            (Termination::CpuTimeExceeded, None)
        }
        WaitStatus::Signaled(_, _, _) if near_memory_limit || reports_oom => {
            (Termination::MemoryExceeded, None)
        }
        WaitStatus::Signaled(_, signal, _) => (Termination::Signaled(signal as i32), None),
        _ => (Termination::Signaled(0), None),
    }
}

pub struct JailSandbox {
    id: String,
    paths: SandboxPaths,
    policy: JailPolicy,
    peak_kb: AtomicU64,
}

enum Interrupt {
    WallTime,
    Cancelled,
    OutputCap,
}

impl JailSandbox {
    fn child_limits(&self, spec: &ExecSpec) -> ChildLimits {
        let cpu = spec.cpu_time_seconds.max(1);
        ChildLimits {
            address_space: spec.memory_mb * 1024 * 1024,
            cpu_soft: cpu,
            cpu_hard: cpu + 1,
            nofile: spec.max_open_files.max(3),
            policy: self.policy.clone(),
            was_root: Uid::effective().is_root(),
        }
    }

    fn kill_group(pid: i32) {
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                warn!(pid, error = %e, "killpg failed");
            }
        }
    }
}

#[async_trait]
impl Sandbox for JailSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn paths(&self) -> &SandboxPaths {
        &self.paths
    }

    async fn write_file(&self, name: &str, content: &str) -> Result<String, SandboxError> {
        if name.is_empty() || name.contains('/') {
            return Err(SandboxError::Backend(anyhow!("invalid file name '{}'", name)));
        }
        let path = self.paths.source_file(name);
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write {}", path))?;
        // Engine-owned and read-only to the sandbox uid, whatever the umask.
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
            .await
            .with_context(|| format!("failed to set mode on {}", path))?;
        Ok(path)
    }

    async fn exec(&self, spec: ExecSpec) -> Result<ExecOutcome, SandboxError> {
        let Some((program, args)) = spec.argv.split_first() else {
            return Err(SandboxError::Backend(anyhow!("empty command")));
        };

        let limits = self.child_limits(&spec);
        let mut command = std::process::Command::new(program);
        command
            .args(args)
            .env_clear()
            .env("PATH", BASE_PATH)
            .env("HOME", &self.paths.build_dir)
            .env("LANG", "C.UTF-8")
            .env("TMPDIR", &self.paths.build_dir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.paths.build_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // SAFETY: enter_jail only issues raw syscalls and touches no locks or
        // allocator state shared with the parent.
        unsafe {
            command.pre_exec(move || enter_jail(&limits));
        }

        let started_at = Instant::now();
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", program))?;
        let pid = child.id() as i32;

        let stdin = child.stdin.take().map(tokio::process::ChildStdin::from_std);
        let stdout = child.stdout.take().map(tokio::process::ChildStdout::from_std);
        let stderr = child.stderr.take().map(tokio::process::ChildStderr::from_std);
        let (Some(Ok(mut stdin)), Some(Ok(stdout)), Some(Ok(stderr))) = (stdin, stdout, stderr)
        else {
            Self::kill_group(pid);
            let _ = tokio::task::spawn_blocking(move || wait_child(pid)).await;
            return Err(SandboxError::Backend(anyhow!("failed to attach child pipes")));
        };

        let input = spec.stdin.clone();
        let writer = tokio::spawn(async move {
            // The child may exit without reading; a broken pipe is expected.
            let _ = stdin.write_all(input.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });

        let overflow = CancellationToken::new();
        let cap = spec.max_output_bytes;
        let out_reader = tokio::spawn(read_capped(stdout, cap, overflow.clone()));
        let err_reader = tokio::spawn(read_capped(stderr, cap, overflow.clone()));

        let mut waiter = tokio::task::spawn_blocking(move || wait_child(pid));
        let wall = tokio::time::sleep(spec.wall_time);
        tokio::pin!(wall);

        let mut interrupt = None;
        let waited = tokio::select! {
            biased;
            res = &mut waiter => Some(res),
            _ = spec.cancel.cancelled() => { interrupt = Some(Interrupt::Cancelled); None }
            _ = overflow.cancelled() => { interrupt = Some(Interrupt::OutputCap); None }
            _ = &mut wall => { interrupt = Some(Interrupt::WallTime); None }
        };

        // Anything left in the group (background children included) goes now.
        Self::kill_group(pid);
        let waited = match waited {
            Some(res) => res,
            None => waiter.await,
        };
        let elapsed = started_at.elapsed();
        writer.abort();

        let (status, usage) = waited
            .context("wait task failed")?
            .context("wait4 failed")?;

        let collect = |handle: tokio::task::JoinHandle<Vec<u8>>| async move {
            match tokio::time::timeout(Duration::from_secs(1), handle).await {
                Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                _ => String::new(),
            }
        };
        let stdout = collect(out_reader).await;
        let stderr = collect(err_reader).await;

        let cpu_ms = cpu_millis(&usage);
        let maxrss_kb = usage.ru_maxrss.max(0) as u64;
        self.peak_kb.fetch_max(maxrss_kb, Ordering::Relaxed);

        let (termination, exit_code) = match interrupt {
            Some(Interrupt::Cancelled) => (Termination::Cancelled, None),
            Some(Interrupt::OutputCap) => (Termination::OutputLimitExceeded, None),
            Some(Interrupt::WallTime) => (Termination::WallTimeExceeded, None),
            None => {
                let status = WaitStatus::from_raw(Pid::from_raw(pid), status)
                    .context("unrecognised wait status")?;
                classify_wait(
                    status,
                    cpu_ms,
                    maxrss_kb,
                    &stderr,
                    spec.cpu_time_seconds,
                    spec.memory_mb * 1024,
                )
            }
        };

        Ok(ExecOutcome {
            termination,
            exit_code,
            stdout,
            stderr,
            elapsed,
            cpu_time_ms: Some(cpu_ms),
            peak_memory_kb: Some(maxrss_kb),
        })
    }

    async fn peak_memory_kb(&self) -> Option<u64> {
        match self.peak_kb.load(Ordering::Relaxed) {
            0 => None,
            kb => Some(kb),
        }
    }
}
