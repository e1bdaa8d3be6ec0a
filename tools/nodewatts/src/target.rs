//! Preparing the profiled project: the session temp directory, the agent's
//! npm packages, and the instrumented entry file.
//!
//! Everything done here is undone on teardown. The entry file is backed up
//! into the temp directory before it is rewritten, so the backup must be
//! restored before that directory is removed.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use nix::unistd::{chown, User};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::supervisor::{ExecContext, ProcessSupervisor};

/// Written by the agent once the server is listening; holds the node pid.
pub const READY_MARKER: &str = "PID.txt";

/// Aliased so they cannot collide with versions the project already uses.
pub const AGENT_PACKAGES: [&str; 2] = [
    "nw-zeromq@npm:zeromq@6.0.0-beta.6",
    "nw-prof@npm:v8-profiler-next",
];
pub const AGENT_ALIASES: [&str; 2] = ["nw-zeromq", "nw-prof"];

const NPM_TIMEOUT: Duration = Duration::from_secs(300);
const IMPORTS: &str = "imports.js";
const ES6_IMPORTS: &str = "es6-imports.js";
const SOCKET_SCRIPT: &str = "profiler-socket.js";

/// Recreate `path` empty and world-writable; the server runs as the project
/// user and must be able to write its readiness marker there.
pub fn prepare_tmp_dir(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => debug!(path = %path.display(), "removed previous temp directory"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("clear temp directory {}", path.display()))
                .into())
        }
    }
    fs::create_dir_all(path).with_context(|| format!("create temp directory {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o777))
        .with_context(|| format!("chmod 0777 {}", path.display()))?;
    Ok(())
}

pub fn remove_tmp_dir(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("remove temp directory {}", path.display()))
            .into()),
    }
}

/// Copy `backup` over `entry`, logging instead of failing so the caller's
/// own error is the one reported.
fn put_back(backup: &Path, entry: &Path) -> bool {
    match fs::copy(backup, entry) {
        Ok(_) => true,
        Err(e) => {
            warn!(
                entry = %entry.display(),
                backup = %backup.display(),
                error = %e,
                "could not restore entry file; copy the backup back by hand"
            );
            false
        }
    }
}

/// Server pid from the readiness marker. A marker that is missing, empty or
/// still being written reads as not ready.
pub fn read_ready_marker(tmp_dir: &Path) -> Option<u32> {
    let text = fs::read_to_string(tmp_dir.join(READY_MARKER)).ok()?;
    text.trim().parse().ok().filter(|&pid| pid > 0)
}

/// ES module projects need `import` statements instead of `require`.
pub fn is_es6_project(root: &Path) -> Result<bool> {
    let path = root.join("package.json");
    let text = fs::read_to_string(&path).map_err(|e| {
        Error::config(format!(
            "project root must contain a package.json ({}: {e})",
            path.display()
        ))
    })?;
    let package: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| Error::config(format!("parse {}: {e}", path.display())))?;
    Ok(package.get("type").and_then(|t| t.as_str()) == Some("module"))
}

/// An entry file with the agent spliced in.
#[derive(Debug)]
pub struct Instrumentation {
    entry: PathBuf,
    backup: PathBuf,
    owner: String,
    restored: bool,
}

impl Instrumentation {
    /// Back `entry` up into `tmp_dir`, then prepend the agent's imports and
    /// append its socket script.
    pub fn inject(entry: &Path, tmp_dir: &Path, agent_dir: &Path, es6: bool, owner: &str) -> Result<Self> {
        let file_name = entry
            .file_name()
            .ok_or_else(|| Error::config(format!("entry file {} has no file name", entry.display())))?;
        let imports_path = agent_dir.join(if es6 { ES6_IMPORTS } else { IMPORTS });
        let imports = fs::read_to_string(&imports_path)
            .with_context(|| format!("read agent imports {}", imports_path.display()))?;
        let socket_path = agent_dir.join(SOCKET_SCRIPT);
        let socket = fs::read_to_string(&socket_path)
            .with_context(|| format!("read agent script {}", socket_path.display()))?;
        let original = fs::read_to_string(entry).with_context(|| format!("read {}", entry.display()))?;

        let backup = tmp_dir.join(file_name);
        fs::copy(entry, &backup)
            .with_context(|| format!("back up {} to {}", entry.display(), backup.display()))?;

        let mut rewritten = String::with_capacity(imports.len() + original.len() + socket.len() + 1);
        rewritten.push_str(imports.trim_end_matches(['\r', '\n']));
        rewritten.push('\n');
        rewritten.push_str(&original);
        rewritten.push_str(&socket);

        let instrumentation = Self {
            entry: entry.to_path_buf(),
            backup,
            owner: owner.to_string(),
            restored: false,
        };
        if let Err(e) = fs::write(entry, rewritten) {
            // Half-written entry files are worse than none.
            put_back(&instrumentation.backup, entry);
            return Err(anyhow::Error::new(e)
                .context(format!("write instrumented {}", entry.display()))
                .into());
        }
        debug!(entry = %entry.display(), es6, "agent injected into entry file");
        Ok(instrumentation)
    }

    pub fn entry(&self) -> &Path {
        &self.entry
    }

    /// Put the original entry file back and hand it to the project user.
    pub fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        fs::copy(&self.backup, &self.entry).with_context(|| {
            format!(
                "restore {} from {}",
                self.entry.display(),
                self.backup.display()
            )
        })?;
        self.restored = true;
        if let Err(e) = fs::remove_file(&self.backup) {
            debug!(backup = %self.backup.display(), error = %e, "could not remove entry backup");
        }
        match User::from_name(&self.owner) {
            Ok(Some(user)) => {
                if let Err(e) = chown(&self.entry, Some(user.uid), Some(user.gid)) {
                    warn!(entry = %self.entry.display(), user = %self.owner, error = %e, "could not chown restored entry file");
                }
            }
            _ => warn!(user = %self.owner, "owner of restored entry file not found"),
        }
        debug!(entry = %self.entry.display(), "entry file restored");
        Ok(())
    }
}

pub fn install_agent_packages(supervisor: &mut ProcessSupervisor, ctx: &ExecContext) -> Result<()> {
    info!("installing temporary npm dependencies, this may take a moment");
    let command = format!("npm i -D {}", AGENT_PACKAGES.join(" "));
    let (stdout, _) = supervisor.run_blocking(&command, ctx, NPM_TIMEOUT)?;
    debug!(%stdout, "agent packages installed");
    Ok(())
}

pub fn uninstall_agent_packages(supervisor: &mut ProcessSupervisor, ctx: &ExecContext) -> Result<()> {
    info!("removing temporary npm dependencies");
    let command = format!("npm uninstall {}", AGENT_ALIASES.join(" "));
    supervisor.run_blocking(&command, ctx, NPM_TIMEOUT)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;
    use pretty_assertions::assert_eq;

    fn current_user() -> String {
        User::from_uid(Uid::current()).unwrap().unwrap().name
    }

    fn agent_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(IMPORTS), "const prof = require('nw-prof');\n\n").unwrap();
        fs::write(dir.path().join(ES6_IMPORTS), "import prof from 'nw-prof';\r\n").unwrap();
        fs::write(dir.path().join(SOCKET_SCRIPT), "\nprof.listen();\n").unwrap();
        dir
    }

    #[test]
    fn inject_then_restore() {
        let agent = agent_dir();
        let project = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let entry = project.path().join("server.js");
        fs::write(&entry, "app.listen(3000);\n").unwrap();

        let mut inst = Instrumentation::inject(&entry, tmp.path(), agent.path(), false, &current_user()).unwrap();
        assert_eq!(
            fs::read_to_string(&entry).unwrap(),
            "const prof = require('nw-prof');\napp.listen(3000);\n\nprof.listen();\n"
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join("server.js")).unwrap(),
            "app.listen(3000);\n"
        );

        inst.restore().unwrap();
        inst.restore().unwrap();
        assert_eq!(fs::read_to_string(&entry).unwrap(), "app.listen(3000);\n");
        assert!(!tmp.path().join("server.js").exists());
    }

    #[test]
    fn es6_uses_import_block() {
        let agent = agent_dir();
        let project = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let entry = project.path().join("main.mjs");
        fs::write(&entry, "x();\n").unwrap();
        Instrumentation::inject(&entry, tmp.path(), agent.path(), true, &current_user()).unwrap();
        assert!(fs::read_to_string(&entry)
            .unwrap()
            .starts_with("import prof from 'nw-prof';\nx();"));
    }

    #[test]
    fn missing_agent_scripts_leave_entry_untouched() {
        let project = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let entry = project.path().join("server.js");
        fs::write(&entry, "original").unwrap();
        let err = Instrumentation::inject(&entry, tmp.path(), &project.path().join("nope"), false, "root");
        assert!(err.is_err());
        assert_eq!(fs::read_to_string(&entry).unwrap(), "original");
    }

    #[test]
    fn detects_module_projects() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(is_es6_project(root.path()), Err(Error::Configuration { .. })));
        fs::write(root.path().join("package.json"), r#"{"name": "a"}"#).unwrap();
        assert!(!is_es6_project(root.path()).unwrap());
        fs::write(root.path().join("package.json"), r#"{"type": "module"}"#).unwrap();
        assert!(is_es6_project(root.path()).unwrap());
    }

    #[test]
    fn put_back_reports_a_missing_backup() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("index.js");
        let backup = dir.path().join("index.js.bak");
        fs::write(&entry, "half").unwrap();

        assert!(!put_back(&backup, &entry));
        assert_eq!(fs::read_to_string(&entry).unwrap(), "half");

        fs::write(&backup, "server()\n").unwrap();
        assert!(put_back(&backup, &entry));
        assert_eq!(fs::read_to_string(&entry).unwrap(), "server()\n");
    }

    #[test]
    fn ready_marker_needs_a_complete_pid() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(read_ready_marker(tmp.path()), None);
        fs::write(tmp.path().join(READY_MARKER), "").unwrap();
        assert_eq!(read_ready_marker(tmp.path()), None);
        fs::write(tmp.path().join(READY_MARKER), "12a").unwrap();
        assert_eq!(read_ready_marker(tmp.path()), None);
        fs::write(tmp.path().join(READY_MARKER), "4242\n").unwrap();
        assert_eq!(read_ready_marker(tmp.path()), Some(4242));
    }

    #[test]
    fn tmp_dir_is_recreated_empty() {
        let base = tempfile::tempdir().unwrap();
        let tmp = base.path().join("nodewatts");
        fs::create_dir_all(&tmp).unwrap();
        fs::write(tmp.join(READY_MARKER), "123").unwrap();

        prepare_tmp_dir(&tmp).unwrap();
        assert!(tmp.is_dir());
        assert_eq!(read_ready_marker(&tmp), None);
        let mode = fs::metadata(&tmp).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o777);

        remove_tmp_dir(&tmp).unwrap();
        remove_tmp_dir(&tmp).unwrap();
        assert!(!tmp.exists());
    }
}
