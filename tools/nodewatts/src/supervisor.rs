//! Spawning, polling and reclaiming the processes a session depends on.
//!
//! Every child is started through the configured shell in its own process
//! group so the whole subtree (shell, `node`, whatever `npm` forks) can be
//! signalled at once. Children are observed with `try_wait` only; the single
//! blocking entry point, [`ProcessSupervisor::run_blocking`], is itself a
//! polling loop with a hard deadline.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::unistd::{Uid, User};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const DEFAULT_GRACE: Duration = Duration::from_secs(2);
const READER_DRAIN: Duration = Duration::from_millis(500);
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

/// Where and as whom a command runs.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    pub user: Option<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub extra_path: Vec<PathBuf>,
}

impl ExecContext {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn extra_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extra_path.push(dir.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Starting,
    Running,
    Exited(i32),
    Terminated,
}

/// Opaque reference to a process owned by a [`ProcessSupervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessHandle(u32);

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.0
    }
}

#[derive(Debug)]
struct ManagedProcess {
    pid: u32,
    state: Liveness,
    child: Child,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    readers: Vec<JoinHandle<()>>,
}

/// What was left of a process after [`ProcessSupervisor::terminate_tree`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reclaimed {
    pub exit_code: Option<i32>,
    pub was_running: bool,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    shell: PathBuf,
    grace: Duration,
    interrupted: Arc<AtomicBool>,
    processes: BTreeMap<u32, ManagedProcess>,
}

impl ProcessSupervisor {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            grace: DEFAULT_GRACE,
            interrupted: Arc::new(AtomicBool::new(false)),
            processes: BTreeMap::new(),
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Share the flag an interrupt handler sets; blocking runs give up as
    /// soon as it flips.
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.processes.keys().copied().map(ProcessHandle).collect()
    }

    /// Launch `command` without waiting for it.
    pub fn spawn_background(&mut self, command: &str, ctx: &ExecContext) -> Result<ProcessHandle> {
        let process = self.spawn(command, ctx)?;
        let handle = ProcessHandle(process.pid);
        debug!(pid = process.pid, command, "spawned background process");
        self.processes.insert(process.pid, process);
        Ok(handle)
    }

    /// Run `command` to completion, reclaiming its tree if it outlives
    /// `timeout`.
    pub fn run_blocking(
        &mut self,
        command: &str,
        ctx: &ExecContext,
        timeout: Duration,
    ) -> Result<(String, String)> {
        let handle = self.spawn_background(command, ctx)?;
        let start = Instant::now();

        loop {
            match self.poll_liveness(handle)? {
                Liveness::Exited(code) => {
                    let mut process = self
                        .processes
                        .remove(&handle.0)
                        .ok_or_else(|| anyhow::anyhow!("process {} vanished", handle.0))?;
                    // Helpers the command forked into its group do not outlive it.
                    reclaim_tree(&mut process, self.grace);
                    let (stdout, stderr) = process.finish_output();
                    debug!(pid = handle.0, code, elapsed = ?start.elapsed(), "command finished");
                    if code == 0 {
                        return Ok((stdout, stderr));
                    }
                    return Err(Error::ProcessExecution {
                        command: command.to_string(),
                        exit_code: code,
                        stdout,
                        stderr,
                    });
                }
                Liveness::Terminated => {
                    return Err(anyhow::anyhow!("process {} reclaimed mid-run", handle.0).into())
                }
                Liveness::Starting | Liveness::Running => {}
            }

            if self.interrupted() {
                warn!(pid = handle.0, command, "interrupted, reclaiming blocking command");
                self.terminate_tree(handle);
                return Err(Error::Interrupted);
            }

            if start.elapsed() >= timeout {
                warn!(pid = handle.0, command, ?timeout, "command timed out");
                let reclaimed = self.terminate_tree(handle).unwrap_or_default();
                return Err(Error::ProcessTimeout {
                    command: command.to_string(),
                    timeout,
                    partial_stdout: reclaimed.stdout,
                    partial_stderr: reclaimed.stderr,
                });
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Non-blocking liveness check. Unknown handles (already reclaimed)
    /// report `Terminated`.
    pub fn poll_liveness(&mut self, handle: ProcessHandle) -> Result<Liveness> {
        let Some(process) = self.processes.get_mut(&handle.0) else {
            return Ok(Liveness::Terminated);
        };
        if let Liveness::Exited(code) = process.state {
            return Ok(Liveness::Exited(code));
        }
        let status = process
            .child
            .try_wait()
            .map_err(|e| anyhow::anyhow!("poll pid {}: {e}", process.pid))?;
        process.state = match status {
            Some(status) => Liveness::Exited(exit_status_code(status)),
            None => Liveness::Running,
        };
        Ok(process.state)
    }

    /// SIGTERM the process group and every descendant, wait out the grace
    /// period, then SIGKILL whatever is left. Returns `None` when the handle
    /// was already reclaimed.
    pub fn terminate_tree(&mut self, handle: ProcessHandle) -> Option<Reclaimed> {
        let mut process = self.processes.remove(&handle.0)?;
        let was_running = matches!(process.state, Liveness::Starting | Liveness::Running)
            && matches!(process.child.try_wait(), Ok(None));
        let exit_code = reclaim_tree(&mut process, self.grace);
        process.state = Liveness::Terminated;
        let (stdout, stderr) = process.finish_output();
        debug!(pid = handle.0, ?exit_code, was_running, "process tree reclaimed");
        Some(Reclaimed {
            exit_code,
            was_running,
            stdout,
            stderr,
        })
    }

    /// Reclaim everything still owned, newest first.
    pub fn terminate_all(&mut self) {
        let handles: Vec<_> = self.handles().into_iter().rev().collect();
        for handle in handles {
            self.terminate_tree(handle);
        }
    }

    fn spawn(&self, command: &str, ctx: &ExecContext) -> Result<ManagedProcess> {
        let mut cmd = self.build_command(command, ctx)?;
        let mut child = cmd.spawn().map_err(|e| Error::ProcessStart {
            command: command.to_string(),
            message: format!("spawn via {}", self.shell.display()),
            source: Some(e),
        })?;

        let stdout = OutputBuffer::default();
        let stderr = OutputBuffer::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push(stdout.drain_from(pipe));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(stderr.drain_from(pipe));
        }

        Ok(ManagedProcess {
            pid: child.id(),
            state: Liveness::Starting,
            child,
            stdout,
            stderr,
            readers,
        })
    }

    fn build_command(&self, command: &str, ctx: &ExecContext) -> Result<Command> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(&ctx.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        if let Some(user) = &ctx.user {
            let identity = resolve_identity(user).map_err(|message| Error::ProcessStart {
                command: command.to_string(),
                message,
                source: None,
            })?;
            cmd.env("HOME", &identity.home)
                .env("LOGNAME", user)
                .env("USER", user)
                .env("PWD", &ctx.cwd);
            if identity.uid != Uid::effective().as_raw() {
                cmd.uid(identity.uid).gid(identity.gid);
            }
        }

        for (key, value) in &ctx.env {
            cmd.env(key, value);
        }

        if !ctx.extra_path.is_empty() {
            let base = ctx
                .env
                .get("PATH")
                .map(std::ffi::OsString::from)
                .or_else(|| std::env::var_os("PATH"))
                .unwrap_or_default();
            let mut dirs: Vec<PathBuf> = std::env::split_paths(&base).collect();
            dirs.extend(ctx.extra_path.iter().cloned());
            let joined = std::env::join_paths(dirs).map_err(|e| Error::ProcessStart {
                command: command.to_string(),
                message: format!("invalid PATH entry: {e}"),
                source: None,
            })?;
            cmd.env("PATH", joined);
        }

        Ok(cmd)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if !self.processes.is_empty() {
            warn!(
                count = self.processes.len(),
                "supervisor dropped with live processes, reclaiming"
            );
            self.terminate_all();
        }
    }
}

impl ManagedProcess {
    /// Give the reader threads a bounded window to hit EOF, then snapshot.
    fn finish_output(mut self) -> (String, String) {
        let deadline = Instant::now() + READER_DRAIN;
        while Instant::now() < deadline && self.readers.iter().any(|r| !r.is_finished()) {
            thread::sleep(Duration::from_millis(10));
        }
        for reader in self.readers.drain(..) {
            if reader.is_finished() {
                let _ = reader.join();
            }
        }
        (self.stdout.snapshot(), self.stderr.snapshot())
    }
}

#[derive(Debug, Clone, Default)]
struct OutputBuffer(Arc<Mutex<Captured>>);

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    clipped: bool,
}

impl OutputBuffer {
    fn drain_from(&self, mut pipe: impl Read + Send + 'static) -> JoinHandle<()> {
        let buf = self.clone();
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut captured = buf.0.lock().unwrap_or_else(|e| e.into_inner());
                        let room = MAX_CAPTURE_BYTES.saturating_sub(captured.bytes.len());
                        if n > room {
                            captured.clipped = true;
                        }
                        captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
                    }
                }
            }
        })
    }

    fn snapshot(&self) -> String {
        let captured = self.0.lock().unwrap_or_else(|e| e.into_inner());
        let mut s = String::from_utf8_lossy(&captured.bytes).to_string();
        if captured.clipped {
            s.push_str("\n…(clipped)…\n");
        }
        s
    }
}

struct Identity {
    uid: u32,
    gid: u32,
    home: PathBuf,
}

fn resolve_identity(user: &str) -> std::result::Result<Identity, String> {
    match User::from_name(user) {
        Ok(Some(u)) => Ok(Identity {
            uid: u.uid.as_raw(),
            gid: u.gid.as_raw(),
            home: u.dir,
        }),
        Ok(None) => Err(format!("no such user: {user}")),
        Err(e) => Err(format!("look up user {user}: {e}")),
    }
}

/// Home directory of `user`, as the password database has it.
pub fn home_dir_of(user: &str) -> Option<PathBuf> {
    resolve_identity(user).ok().map(|i| i.home)
}

fn exit_status_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}

fn reclaim_tree(process: &mut ManagedProcess, grace: Duration) -> Option<i32> {
    let pgid = process.pid;
    let mut targets = descendants_of(pgid);
    let mut exit_code = match process.child.try_wait() {
        Ok(Some(status)) => Some(exit_status_code(status)),
        _ => None,
    };

    if exit_code.is_some() && !tree_alive(pgid, &targets) {
        return exit_code;
    }

    signal_tree(pgid, &targets, libc::SIGTERM);
    let deadline = Instant::now() + grace;
    loop {
        if exit_code.is_none() {
            if let Ok(Some(status)) = process.child.try_wait() {
                exit_code = Some(exit_status_code(status));
            }
        }
        if exit_code.is_some() && !tree_alive(pgid, &targets) {
            return exit_code;
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    warn!(pid = pgid, "process tree ignored SIGTERM, sending SIGKILL");
    targets.extend(group_members(pgid));
    signal_tree(pgid, &targets, libc::SIGKILL);
    if exit_code.is_none() {
        exit_code = process.child.wait().ok().map(exit_status_code);
    }

    let deadline = Instant::now() + grace;
    while tree_alive(pgid, &targets) && Instant::now() < deadline {
        thread::sleep(POLL_INTERVAL);
    }
    exit_code
}

fn signal_tree(pgid: u32, pids: &[u32], signal: libc::c_int) {
    unsafe {
        // Negative PID means process group.
        libc::kill(-(pgid as libc::pid_t), signal);
    }
    for pid in pids.iter().rev() {
        unsafe {
            libc::kill(*pid as libc::pid_t, signal);
        }
    }
}

fn tree_alive(pgid: u32, pids: &[u32]) -> bool {
    !group_members(pgid).is_empty() || pids.iter().any(|pid| pid_alive(*pid))
}

/// A pid counts as alive while it exists and is not a zombie.
pub fn pid_alive(pid: u32) -> bool {
    read_proc_stat(Path::new("/proc").join(pid.to_string()).join("stat").as_path())
        .map(|stat| !matches!(stat.state, 'Z' | 'X'))
        .unwrap_or(false)
}

/// Live, non-zombie members of process group `pgid`.
pub fn group_members(pgid: u32) -> Vec<u32> {
    proc_table()
        .into_iter()
        .filter(|s| s.pgrp == pgid && !matches!(s.state, 'Z' | 'X'))
        .map(|s| s.pid)
        .collect()
}

fn descendants_of(root: u32) -> Vec<u32> {
    let table = proc_table();
    let mut out = Vec::new();
    let mut seen: HashSet<u32> = HashSet::new();
    let mut queue = vec![root];
    seen.insert(root);
    while let Some(parent) = queue.pop() {
        for stat in table.iter().filter(|s| s.ppid == parent) {
            if seen.insert(stat.pid) {
                out.push(stat.pid);
                queue.push(stat.pid);
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcStat {
    pid: u32,
    state: char,
    ppid: u32,
    pgrp: u32,
}

fn proc_table() -> Vec<ProcStat> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.bytes().all(|b| b.is_ascii_digit()))
        })
        .filter_map(|e| read_proc_stat(&e.path().join("stat")))
        .collect()
}

fn read_proc_stat(path: &Path) -> Option<ProcStat> {
    parse_proc_stat(&fs::read_to_string(path).ok()?)
}

fn parse_proc_stat(text: &str) -> Option<ProcStat> {
    // Format: pid (comm) state ppid pgrp ...; comm may contain spaces and ')'.
    let open = text.find('(')?;
    let close = text.rfind(')')?;
    let pid = text[..open].trim().parse().ok()?;
    let mut fields = text.get(close + 1..)?.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some(ProcStat {
        pid,
        state,
        ppid,
        pgrp,
    })
}
