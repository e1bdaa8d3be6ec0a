//! The perf_event cgroup the sensor watches.
//!
//! The sensor is configured to monitor a cgroup by name, so there is exactly
//! one such cgroup per host. A crashed previous run can leave it behind;
//! `create` therefore removes any stale instance before making a fresh one.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const PERF_EVENT_ROOT: &str = "/sys/fs/cgroup/perf_event";
pub const SCOPE_NAME: &str = "system";
const PROCS_FILE: &str = "cgroup.procs";

#[derive(Debug)]
pub struct ResourceScope {
    root: PathBuf,
    name: String,
    members: Vec<u32>,
}

impl ResourceScope {
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            name: name.into(),
            members: Vec::new(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    /// PIDs attached through this handle, in attach order.
    pub fn members(&self) -> &[u32] {
        &self.members
    }

    pub fn exists(&self) -> bool {
        self.path().is_dir()
    }

    /// Create the scope, replacing a leftover instance if there is one.
    pub fn create(&mut self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(Error::ScopeInit {
                message: format!(
                    "{} not found; a mounted perf_event cgroup controller is required",
                    self.root.display()
                ),
                source: None,
            });
        }

        if self.exists() {
            warn!(path = %self.path().display(), "removing stale resource scope from a previous run");
            self.destroy().map_err(|e| Error::ScopeInit {
                message: format!("stale scope {} could not be removed: {e}", self.path().display()),
                source: None,
            })?;
        }

        fs::create_dir(self.path()).map_err(|e| Error::ScopeInit {
            message: format!("create {}", self.path().display()),
            source: Some(e),
        })?;
        self.members.clear();
        debug!(path = %self.path().display(), "resource scope created");
        Ok(())
    }

    pub fn attach(&mut self, pid: u32) -> Result<()> {
        if !self.exists() {
            return Err(Error::scope(
                format!("cannot attach {pid}: {} does not exist", self.path().display()),
                None,
            ));
        }
        append_pid(&self.path().join(PROCS_FILE), pid).map_err(|e| {
            Error::scope(format!("attach {pid} to {}", self.path().display()), Some(e))
        })?;
        self.members.push(pid);
        debug!(pid, scope = %self.name, "pid attached to resource scope");
        Ok(())
    }

    /// Remove the scope. Members still inside are moved back to the root
    /// first, since the kernel refuses to remove a populated cgroup.
    pub fn destroy(&mut self) -> Result<()> {
        let path = self.path();
        if !path.is_dir() {
            return Ok(());
        }

        let procs = path.join(PROCS_FILE);
        if let Ok(contents) = fs::read_to_string(&procs) {
            for pid in contents.lines().filter_map(|l| l.trim().parse::<u32>().ok()) {
                if let Err(e) = append_pid(&self.root.join(PROCS_FILE), pid) {
                    debug!(pid, error = %e, "could not evacuate pid from scope");
                }
            }
        }

        match fs::remove_dir(&path) {
            Ok(()) => {}
            // Not a cgroupfs mount: the membership file is an ordinary file.
            Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => {
                fs::remove_dir_all(&path)
                    .map_err(|e| Error::scope(format!("remove {}", path.display()), Some(e)))?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::scope(format!("remove {}", path.display()), Some(e)));
            }
        }
        self.members.clear();
        debug!(path = %path.display(), "resource scope destroyed");
        Ok(())
    }

    /// `destroy`, retried: a scope left behind blocks the next session.
    pub fn destroy_with_retry(&mut self, attempts: u32, delay: Duration) -> Result<()> {
        let attempts = attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match self.destroy() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "failed to destroy resource scope");
                    last = Some(e);
                    if attempt < attempts {
                        thread::sleep(delay);
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::scope("destroy failed", None)))
    }
}

fn append_pid(procs: &Path, pid: u32) -> std::io::Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(procs)?;
    writeln!(f, "{pid}")
}
