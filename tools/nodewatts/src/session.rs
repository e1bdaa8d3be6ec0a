//! One profiling session, start to finish.
//!
//! Every resource the session acquires is pushed onto a guard stack as soon
//! as it exists. Teardown pops the stack, so resources are released in the
//! reverse of acquisition order whatever phase the session stopped in:
//! sensor, server, entry file, npm packages, resource scope, temp directory.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::correlate::Correlator;
use crate::error::{Error, Result};
use crate::formula::{self, Formula, FormulaOutcome};
use crate::model::{CpuProfile, PowerSample};
use crate::report::{Report, ReportBuilder, SessionInfo};
use crate::scope::{ResourceScope, SCOPE_NAME};
use crate::sensor::Sensor;
use crate::store::{SampleStore, SqliteStore};
use crate::supervisor::{ExecContext, Liveness, ProcessHandle, ProcessSupervisor};
use crate::target::{self, Instrumentation};

const SCOPE_DESTROY_ATTEMPTS: u32 = 3;
const SCOPE_DESTROY_DELAY: Duration = Duration::from_millis(500);
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Initializing,
    ServerStarting,
    ServerReady,
    SensorStarting,
    Executing,
    Collected,
    Correlating,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Active(Phase),
    Failed { reason: String, cleanup_done: bool },
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
#[error("session failed while {phase:?}: {error}")]
pub struct SessionFailure {
    pub error: Error,
    pub phase: Phase,
    pub cleanup_done: bool,
}

impl SessionFailure {
    pub fn exit_code(&self) -> i32 {
        exit_code(&self.error, self.phase)
    }
}

/// Stable process exit code for `error` raised during `phase`.
pub fn exit_code(error: &Error, phase: Phase) -> i32 {
    let setup = phase == Phase::Initializing;
    let starting = matches!(phase, Phase::Initializing | Phase::ServerStarting);
    match error {
        Error::Interrupted => 130,
        Error::Configuration { .. } => 1,
        Error::ScopeInit { .. } | Error::Scope { .. } => 4,
        Error::Sensor { .. } => 5,
        Error::StartupTimeout { .. } => 3,
        Error::Store { .. } | Error::Unexpected(_) if setup => 2,
        Error::ProcessStart { .. } | Error::ProcessExecution { .. } | Error::ProcessTimeout { .. }
            if starting =>
        {
            3
        }
        Error::Unexpected(_) => 9,
        Error::Store { .. }
        | Error::ProcessStart { .. }
        | Error::ProcessExecution { .. }
        | Error::ProcessTimeout { .. }
        | Error::Formula { .. }
        | Error::Correlation { .. } => 6,
    }
}

#[derive(Debug)]
enum Guard {
    TempDir(PathBuf),
    Scope(ResourceScope),
    Dependencies(ExecContext),
    Instrumentation(Instrumentation),
    Server(ProcessHandle),
    Sensor(ProcessHandle),
}

pub struct SessionController {
    config: Config,
    supervisor: ProcessSupervisor,
    interrupted: Arc<AtomicBool>,
    session: Session,
    phase: Phase,
    profile_title: String,
    guards: Vec<Guard>,
    spawned: Vec<u32>,
}

impl SessionController {
    pub fn new(config: Config, interrupted: Arc<AtomicBool>) -> Self {
        let now = chrono::Local::now();
        let profile_title = now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
        let supervisor = ProcessSupervisor::new(&config.shell).with_interrupt_flag(interrupted.clone());
        Self {
            session: Session {
                id: format!("{}-{}", now.format("%Y%m%d%H%M%S"), std::process::id()),
                state: SessionState::Active(Phase::Idle),
                started_at: None,
                finished_at: None,
            },
            config,
            supervisor,
            interrupted,
            phase: Phase::Idle,
            profile_title,
            guards: Vec::new(),
            spawned: Vec::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn profile_title(&self) -> &str {
        &self.profile_title
    }

    /// PIDs of every background process this session launched.
    pub fn spawned_pids(&self) -> &[u32] {
        &self.spawned
    }

    pub fn run(&mut self, store: &mut dyn SampleStore) -> std::result::Result<Report, SessionFailure> {
        self.session.started_at = Some(Utc::now());
        info!(session = %self.session.id, title = %self.profile_title, "starting profiling session");

        let collected = self.collect(store);
        let teardown = self.teardown();
        let cleanup_done = teardown.is_ok();

        let result = match (collected, teardown) {
            (Ok(()), Ok(())) => self.process(store),
            (Ok(()), Err(scope_err)) => Err(scope_err),
            (Err(e), Err(scope_err)) => {
                error!(error = %scope_err, "resource scope could not be removed; remove it by hand before the next run");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        };
        self.session.finished_at = Some(Utc::now());

        match result {
            Ok(report) => {
                self.enter_unchecked(Phase::Complete);
                info!(report = %report.name, "profile generated");
                Ok(report)
            }
            Err(error) => {
                warn!(phase = ?self.phase, %error, cleanup_done, "session failed");
                self.session.state = SessionState::Failed {
                    reason: error.to_string(),
                    cleanup_done,
                };
                Err(SessionFailure {
                    error,
                    phase: self.phase,
                    cleanup_done,
                })
            }
        }
    }

    fn collect(&mut self, store: &mut dyn SampleStore) -> Result<()> {
        self.enter(Phase::Initializing)?;
        store.drop_raw_data()?;

        let tmp = self.config.tmp_path.clone();
        target::prepare_tmp_dir(&tmp)?;
        self.guards.push(Guard::TempDir(tmp.clone()));

        let mut scope = ResourceScope::new(&self.config.scope_root, SCOPE_NAME);
        scope.create()?;
        self.guards.push(Guard::Scope(scope));

        let project = self.project_context();
        if self.config.instrument_project {
            let es6 = self.config.es6_mode || target::is_es6_project(&self.config.project_root)?;
            target::install_agent_packages(&mut self.supervisor, &project)?;
            self.guards.push(Guard::Dependencies(project.clone()));
            let instrumentation = Instrumentation::inject(
                &self.config.entry_path(),
                &tmp,
                &self.config.agent_dir,
                es6,
                &self.config.user,
            )?;
            self.guards.push(Guard::Instrumentation(instrumentation));
        }

        self.enter(Phase::ServerStarting)?;
        let command = format!(
            "echo \"running server with node: $(command -v node)\" && {}",
            self.config.server_command
        );
        let server = self.supervisor.spawn_background(&command, &project)?;
        self.spawned.push(server.pid());
        self.guards.push(Guard::Server(server));
        let server_pid = self.wait_for_server(server)?;

        self.enter(Phase::ServerReady)?;
        self.scope_mut()
            .ok_or_else(|| Error::scope("resource scope missing after creation", None))?
            .attach(server_pid)?;

        self.enter(Phase::SensorStarting)?;
        let system = self.system_context();
        let sensor = Sensor::spawn(&mut self.supervisor, &self.config.sensor_command, &system)?;
        self.spawned.push(sensor.handle().pid());
        self.guards.push(Guard::Sensor(sensor.handle()));
        sensor.await_startup(&mut self.supervisor, self.config.sensor_startup_wait)?;

        self.enter(Phase::Executing)?;
        info!("running tests, this may take a moment");
        let runs = self.config.test_runs;
        for run in 1..=runs {
            self.check_interrupt()?;
            self.check_server(server)?;
            sensor.check(&mut self.supervisor)?;
            let ctx = if run == runs {
                project.clone().env("FINAL_RUN", "true")
            } else {
                project.clone()
            };
            debug!(run, runs, "test run");
            let (stdout, stderr) = self.supervisor.run_blocking(
                &self.config.workload_command,
                &ctx,
                self.config.test_runner_timeout,
            )?;
            debug!(run, %stdout, %stderr, "test run finished");
        }
        Ok(())
    }

    /// Poll for the readiness marker and return the pid it names.
    fn wait_for_server(&mut self, server: ProcessHandle) -> Result<u32> {
        let attempts = self.config.server_wait_attempts;
        for attempt in 1..=attempts {
            self.check_interrupt()?;
            if let Liveness::Exited(code) = self.supervisor.poll_liveness(server)? {
                let output = self.supervisor.terminate_tree(server).unwrap_or_default();
                return Err(Error::ProcessStart {
                    command: self.config.server_command.clone(),
                    message: format!(
                        "server exited with code {code} before it was ready\nstdout:\n{}\nstderr:\n{}",
                        output.stdout, output.stderr
                    ),
                    source: None,
                });
            }
            if let Some(pid) = target::read_ready_marker(&self.config.tmp_path) {
                debug!(attempt, pid, "server ready");
                return Ok(pid);
            }
            if attempt < attempts {
                self.sleep(self.config.server_poll_interval)?;
            }
        }
        info!("raise dev-serverWait to give the server longer to start");
        Err(Error::StartupTimeout {
            command: self.config.server_command.clone(),
            attempts,
        })
    }

    fn check_server(&mut self, server: ProcessHandle) -> Result<()> {
        match self.supervisor.poll_liveness(server)? {
            Liveness::Starting | Liveness::Running => Ok(()),
            Liveness::Exited(code) => {
                let output = self.supervisor.terminate_tree(server).unwrap_or_default();
                Err(Error::ProcessExecution {
                    command: self.config.server_command.clone(),
                    exit_code: code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                })
            }
            Liveness::Terminated => Err(anyhow::anyhow!("server process is no longer supervised").into()),
        }
    }

    /// Release everything on the guard stack. Only a scope that survives
    /// its retries is reported; every other failure is logged and skipped.
    fn teardown(&mut self) -> Result<()> {
        let mut scope_failure = None;
        // npm must still run after an interrupt.
        let mut cleanup = ProcessSupervisor::new(&self.config.shell);

        while let Some(guard) = self.guards.pop() {
            match guard {
                Guard::Sensor(handle) => {
                    if let Some(r) = self.supervisor.terminate_tree(handle) {
                        debug!(pid = handle.pid(), exit_code = ?r.exit_code, stderr = %r.stderr, "sensor stopped");
                        if !r.was_running {
                            warn!(exit_code = ?r.exit_code, "sensor had already exited; power data may be incomplete");
                        }
                    }
                }
                Guard::Server(handle) => {
                    if let Some(r) = self.supervisor.terminate_tree(handle) {
                        debug!(pid = handle.pid(), exit_code = ?r.exit_code, stdout = %r.stdout, stderr = %r.stderr, "server stopped");
                    }
                }
                Guard::Instrumentation(mut instrumentation) => {
                    if let Err(e) = instrumentation.restore() {
                        warn!(entry = %instrumentation.entry().display(), error = %e, "could not restore entry file");
                    }
                }
                Guard::Dependencies(ctx) => {
                    if let Err(e) = target::uninstall_agent_packages(&mut cleanup, &ctx) {
                        warn!(packages = ?target::AGENT_PACKAGES, error = %e, "temporary npm packages must be removed by hand");
                    }
                }
                Guard::Scope(mut scope) => {
                    if let Err(e) = scope.destroy_with_retry(SCOPE_DESTROY_ATTEMPTS, SCOPE_DESTROY_DELAY) {
                        scope_failure = Some(e);
                    }
                }
                Guard::TempDir(path) => {
                    if let Err(e) = target::remove_tmp_dir(&path) {
                        warn!(path = %path.display(), error = %e, "could not remove temp directory");
                    }
                }
            }
        }

        if !self.supervisor.handles().is_empty() {
            warn!("reclaiming processes left outside the guard stack");
            self.supervisor.terminate_all();
        }
        match scope_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn process(&mut self, store: &mut dyn SampleStore) -> Result<Report> {
        self.enter(Phase::Collected)?;
        let reports = formula::verify_sensor_data(store)?;
        debug!(reports, "sensor data present");
        let system = self.system_context();
        let outcome = Formula::new(&self.config.formula_command, self.config.formula_timeout)
            .run(&mut self.supervisor, &system)?;
        if outcome == FormulaOutcome::Cancelled && self.supervisor.interrupted() {
            return Err(Error::Interrupted);
        }

        self.enter(Phase::Correlating)?;
        info!("generating profile");
        let power = store.power_samples(&self.config.power_target)?;
        let profile = store.cpu_profile(&self.profile_title)?.ok_or_else(|| {
            Error::correlation(format!("no CPU profile titled {} was recorded", self.profile_title))
        })?;
        let correlation = Correlator::new(self.config.cpu_tdp).correlate(
            &profile.timeline(),
            profile.call_frame_nodes(),
            &power,
        )?;
        let report = ReportBuilder::new(&self.config.report_name, &self.profile_title, self.session_info())
            .build(correlation);

        store.save_report(&report)?;
        if let Some(path) = &self.config.database.export_path {
            if let Err(e) = export(path, &report, self.config.database.export_raw, &power, &profile) {
                warn!(path = %path.display(), error = %e, "could not export report");
            }
        }
        if let Err(e) = store.drop_raw_data() {
            warn!(error = %e, "could not drop raw session data");
        }
        Ok(report)
    }

    fn session_info(&self) -> SessionInfo {
        let now = Utc::now();
        SessionInfo {
            session_id: self.session.id.clone(),
            project_root: self.config.project_root.clone(),
            entry_file: self.config.entry_file.clone(),
            server_command: self.config.server_command.clone(),
            test_command: self.config.test_command.clone(),
            test_runs: self.config.test_runs,
            started_at: self.session.started_at.unwrap_or(now),
            collected_at: now,
        }
    }

    /// Context for project processes: the configured user, the agent's
    /// variables, and the nvm node on PATH.
    fn project_context(&self) -> ExecContext {
        let c = &self.config;
        let vars = BTreeMap::from([
            ("PROFILE_TITLE".to_string(), self.profile_title.clone()),
            ("TEST_SOCKET_PORT".to_string(), c.profiler_port.to_string()),
            ("NODEWATTS_DB_URI".to_string(), c.database.path.display().to_string()),
            ("NODEWATTS_TMP_PATH".to_string(), c.tmp_path.display().to_string()),
            ("TESTCMD".to_string(), c.test_command.clone()),
            (
                "ZMQ_INSTALLED_PATH".to_string(),
                c.project_root.join("node_modules").join("nw-zeromq").display().to_string(),
            ),
        ]);
        let mut ctx = ExecContext::new(&c.project_root).user(&c.user).envs(&vars);
        if let Some(dir) = &c.node_bin_dir {
            ctx = ctx.extra_path(dir);
        }
        ctx
    }

    /// Context for the sensor and formula, which run as the invoking user.
    fn system_context(&self) -> ExecContext {
        ExecContext::new(std::env::temp_dir())
    }

    fn scope_mut(&mut self) -> Option<&mut ResourceScope> {
        self.guards.iter_mut().find_map(|g| match g {
            Guard::Scope(scope) => Some(scope),
            _ => None,
        })
    }

    fn enter(&mut self, phase: Phase) -> Result<()> {
        self.check_interrupt()?;
        self.enter_unchecked(phase);
        Ok(())
    }

    fn enter_unchecked(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "session phase");
        self.phase = phase;
        self.session.state = SessionState::Active(phase);
    }

    fn check_interrupt(&self) -> Result<()> {
        if self.interrupted.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_interrupt()?;
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            thread::sleep(left.min(SLEEP_SLICE));
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if !self.guards.is_empty() {
            warn!("session dropped mid-flight, tearing down");
            if let Err(e) = self.teardown() {
                error!(error = %e, "teardown after drop left the resource scope behind");
            }
        }
    }
}

fn export(
    path: &std::path::Path,
    report: &Report,
    raw: bool,
    power: &[PowerSample],
    profile: &CpuProfile,
) -> Result<()> {
    let mut out = SqliteStore::open(path)?;
    out.save_report(report)?;
    if raw {
        out.insert_power(power)?;
        out.insert_profile(profile)?;
    }
    info!(path = %path.display(), raw, "report exported");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::model::{CallFrame, ProfileNode};
    use crate::store::{MemoryStore, ReportSummary};
    use crate::supervisor::{group_members, pid_alive};
    use nix::unistd::{Uid, User};
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::sync::atomic::Ordering;

    /// Keeps seeded data across the session's raw-data drops, and serves its
    /// profile under whatever title the session asks for.
    #[derive(Default)]
    struct FixtureStore {
        data: MemoryStore,
        profile: Option<CpuProfile>,
        drops: usize,
    }

    impl SampleStore for FixtureStore {
        fn drop_raw_data(&mut self) -> Result<()> {
            self.drops += 1;
            Ok(())
        }
        fn sensor_report_count(&self) -> Result<u64> {
            self.data.sensor_report_count()
        }
        fn power_samples(&self, target: &str) -> Result<Vec<PowerSample>> {
            self.data.power_samples(target)
        }
        fn cpu_profile(&self, _title: &str) -> Result<Option<CpuProfile>> {
            Ok(self.profile.clone())
        }
        fn save_report(&mut self, report: &Report) -> Result<()> {
            self.data.save_report(report)
        }
        fn reports(&self) -> Result<Vec<ReportSummary>> {
            self.data.reports()
        }
        fn load_report(&self, name: &str) -> Result<Option<Report>> {
            self.data.load_report(name)
        }
    }

    fn frame(id: u32, url: &str, children: Vec<u32>) -> ProfileNode {
        ProfileNode {
            id,
            call_frame: CallFrame {
                function_name: format!("f{id}"),
                url: url.into(),
                line_number: 1,
                column_number: 1,
            },
            hit_count: 1,
            children,
        }
    }

    fn seeded_store() -> FixtureStore {
        let mut store = FixtureStore::default();
        store.data.sensor_reports = 4;
        store.data.power = vec![
            PowerSample::new(90, "/node", 5.0),
            PowerSample::new(150, "/node", 7.0),
            PowerSample::new(300, "/node", 6.0),
            PowerSample::new(360, "/node", 8.0),
        ];
        store.profile = Some(CpuProfile {
            title: String::new(),
            start_time: 0,
            end_time: 400,
            nodes: vec![
                frame(1, "/proj/app.js", vec![2]),
                frame(2, "/proj/node_modules/express/index.js", vec![]),
            ],
            samples: vec![1, 2],
            time_deltas: vec![100, 240],
        });
        store
    }

    struct Fixture {
        dir: tempfile::TempDir,
        config: Config,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().join("project");
            let scope_root = dir.path().join("perf_event");
            fs::create_dir_all(&root).unwrap();
            fs::create_dir_all(&scope_root).unwrap();
            fs::write(root.join("index.js"), "server()\n").unwrap();
            let user = User::from_uid(Uid::current()).unwrap().unwrap().name;
            let config = Config {
                project_root: root,
                entry_file: "index.js".into(),
                user,
                cpu_tdp: 85.0,
                server_command: r#"echo $$ > "$NODEWATTS_TMP_PATH/PID.txt"; exec sleep 30"#.into(),
                test_command: "npm test".into(),
                test_runs: 3,
                node_bin_dir: None,
                es6_mode: false,
                report_name: "fixture".into(),
                database: DatabaseConfig {
                    path: dir.path().join("nw.db"),
                    export_path: None,
                    export_raw: false,
                },
                server_wait_attempts: 40,
                server_poll_interval: Duration::from_millis(50),
                sensor_startup_wait: Duration::from_millis(100),
                test_runner_timeout: Duration::from_secs(5),
                formula_timeout: Duration::from_secs(5),
                shell: "/bin/sh".into(),
                tmp_path: dir.path().join("tmp"),
                scope_root,
                agent_dir: dir.path().join("agent"),
                sensor_command: "exec sleep 30".into(),
                formula_command: "true".into(),
                workload_command: "true".into(),
                profiler_port: 9999,
                power_target: "/node".into(),
                instrument_project: false,
            };
            Self { dir, config }
        }

        fn run(self, store: &mut FixtureStore) -> (std::result::Result<Report, SessionFailure>, Vec<u32>, Self) {
            self.run_with_flag(store, Arc::new(AtomicBool::new(false)))
        }

        fn run_with_flag(
            self,
            store: &mut FixtureStore,
            flag: Arc<AtomicBool>,
        ) -> (std::result::Result<Report, SessionFailure>, Vec<u32>, Self) {
            let mut controller = SessionController::new(self.config.clone(), flag);
            let result = controller.run(store);
            let pids = controller.spawned_pids().to_vec();
            (result, pids, self)
        }

        fn assert_clean(&self, pids: &[u32]) {
            for &pid in pids {
                assert!(!pid_alive(pid), "pid {pid} survived");
                assert!(group_members(pid).is_empty(), "group {pid} survived");
            }
            assert!(!self.config.scope_root.join(SCOPE_NAME).exists(), "scope survived");
            assert!(!self.config.tmp_path.exists(), "temp dir survived");
        }
    }

    fn failure(result: std::result::Result<Report, SessionFailure>) -> SessionFailure {
        match result {
            Ok(report) => panic!("session unexpectedly produced {}", report.name),
            Err(f) => f,
        }
    }

    #[test]
    fn complete_session_builds_and_saves_report() {
        let mut store = seeded_store();
        let (result, pids, fx) = Fixture::new().run(&mut store);
        let report = result.unwrap();

        assert_eq!(pids.len(), 2);
        fx.assert_clean(&pids);
        assert_eq!(report.name, "fixture");
        let ticks: Vec<(i64, i64, f64)> = report
            .ticks
            .iter()
            .map(|t| (t.timestamp, t.power_timestamp, t.power))
            .collect();
        assert_eq!(ticks, vec![(100, 90, 5.0), (340, 360, 8.0)]);
        assert_eq!(report.categories.npm_dependency["express"], vec![2]);
        assert_eq!(store.data.saved.len(), 1);
        assert_eq!(store.drops, 2);

        // The server's pid went through the scope and was evacuated on destroy.
        let evacuated = fs::read_to_string(fx.config.scope_root.join("cgroup.procs")).unwrap();
        assert_eq!(evacuated.trim(), pids[0].to_string());
    }

    #[test]
    fn final_run_flag_only_on_last_repetition() {
        let mut fx = Fixture::new();
        let log = fx.dir.path().join("runs.log");
        fx.config.workload_command = format!("echo \"${{FINAL_RUN:-no}} $TESTCMD\" >> {}", log.display());
        let mut store = seeded_store();
        let (result, _, _fx) = fx.run(&mut store);
        result.unwrap();
        assert_eq!(
            fs::read_to_string(&log).unwrap(),
            "no npm test\nno npm test\ntrue npm test\n"
        );
    }

    #[test]
    fn scope_failure_tears_down_and_exits_4() {
        let mut fx = Fixture::new();
        fx.config.scope_root = fx.dir.path().join("no-controller");
        let (result, pids, fx) = fx.run(&mut seeded_store());
        let f = failure(result);
        assert!(matches!(f.error, Error::ScopeInit { .. }));
        assert_eq!(f.phase, Phase::Initializing);
        assert_eq!(f.exit_code(), 4);
        assert!(pids.is_empty());
        assert!(!fx.config.tmp_path.exists());
    }

    #[test]
    fn server_never_ready_exits_3() {
        let mut fx = Fixture::new();
        fx.config.server_command = "exec sleep 30".into();
        fx.config.server_wait_attempts = 3;
        let (result, pids, fx) = fx.run(&mut seeded_store());
        let f = failure(result);
        assert!(matches!(f.error, Error::StartupTimeout { attempts: 3, .. }));
        assert_eq!(f.exit_code(), 3);
        assert!(f.cleanup_done);
        fx.assert_clean(&pids);
    }

    #[test]
    fn server_crash_during_startup_exits_3() {
        let mut fx = Fixture::new();
        fx.config.server_command = "echo boom >&2; exit 7".into();
        let (result, pids, fx) = fx.run(&mut seeded_store());
        let f = failure(result);
        match &f.error {
            Error::ProcessStart { message, .. } => {
                assert!(message.contains("code 7"), "{message}");
                assert!(message.contains("boom"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.exit_code(), 3);
        fx.assert_clean(&pids);
    }

    #[test]
    fn server_pid_is_taken_once_marker_is_written() {
        let mut fx = Fixture::new();
        fx.config.server_command = r#"sh -c 'echo $$ > "$NODEWATTS_TMP_PATH/../server.pid"; : > "$NODEWATTS_TMP_PATH/PID.txt"; sleep 0.5; echo $$ > "$NODEWATTS_TMP_PATH/PID.txt"; exec sleep 30'"#.into();
        let (result, pids, fx) = fx.run(&mut seeded_store());
        result.unwrap();
        fx.assert_clean(&pids);

        let server: u32 = fs::read_to_string(fx.dir.path().join("server.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_ne!(server, pids[0]);
        let evacuated = fs::read_to_string(fx.config.scope_root.join("cgroup.procs")).unwrap();
        assert_eq!(evacuated.trim(), server.to_string());
    }

    #[test]
    fn empty_marker_is_not_ready() {
        let mut fx = Fixture::new();
        fx.config.server_command = r#": > "$NODEWATTS_TMP_PATH/PID.txt"; exec sleep 30"#.into();
        fx.config.server_wait_attempts = 3;
        let (result, pids, fx) = fx.run(&mut seeded_store());
        let f = failure(result);
        assert!(matches!(f.error, Error::StartupTimeout { attempts: 3, .. }));
        assert_eq!(f.exit_code(), 3);
        fx.assert_clean(&pids);
        assert!(!fx.config.scope_root.join("cgroup.procs").exists());
    }

    #[test]
    fn server_death_between_runs_exits_6() {
        let mut fx = Fixture::new();
        let log = fx.dir.path().join("runs.log");
        fx.config.workload_command = format!(
            r#"echo run >> {}; kill -TERM $(cat "$NODEWATTS_TMP_PATH/PID.txt"); sleep 0.2"#,
            log.display()
        );
        let (result, pids, fx) = fx.run(&mut seeded_store());
        let f = failure(result);
        assert!(matches!(f.error, Error::ProcessExecution { exit_code: 143, .. }));
        assert_eq!(f.phase, Phase::Executing);
        assert_eq!(f.exit_code(), 6);
        assert_eq!(fs::read_to_string(&log).unwrap(), "run\n");
        fx.assert_clean(&pids);
    }

    #[test]
    fn sensor_death_between_runs_exits_5() {
        let mut fx = Fixture::new();
        let sensor_pid = fx.dir.path().join("sensor.pid");
        let log = fx.dir.path().join("runs.log");
        fx.config.sensor_command = format!("echo $$ > {}; exec sleep 30", sensor_pid.display());
        fx.config.workload_command = format!(
            "echo run >> {}; kill -TERM $(cat {}); sleep 0.2",
            log.display(),
            sensor_pid.display()
        );
        let (result, pids, fx) = fx.run(&mut seeded_store());
        let f = failure(result);
        assert!(matches!(f.error, Error::Sensor { .. }));
        assert_eq!(f.phase, Phase::Executing);
        assert_eq!(f.exit_code(), 5);
        assert_eq!(fs::read_to_string(&log).unwrap(), "run\n");
        fx.assert_clean(&pids);
    }

    #[test]
    fn sensor_death_exits_5() {
        let mut fx = Fixture::new();
        fx.config.sensor_command = "exit 1".into();
        let (result, pids, fx) = fx.run(&mut seeded_store());
        let f = failure(result);
        assert!(matches!(f.error, Error::Sensor { .. }));
        assert_eq!(f.phase, Phase::SensorStarting);
        assert_eq!(f.exit_code(), 5);
        assert_eq!(pids.len(), 2);
        fx.assert_clean(&pids);
    }

    #[test]
    fn failing_workload_exits_6() {
        let mut fx = Fixture::new();
        fx.config.workload_command = "echo 2 failing >&2; exit 2".into();
        let (result, pids, fx) = fx.run(&mut seeded_store());
        let f = failure(result);
        assert!(matches!(f.error, Error::ProcessExecution { exit_code: 2, .. }));
        assert_eq!(f.phase, Phase::Executing);
        assert_eq!(f.exit_code(), 6);
        fx.assert_clean(&pids);
    }

    #[test]
    fn workload_timeout_exits_6() {
        let mut fx = Fixture::new();
        fx.config.workload_command = "echo started; exec sleep 30".into();
        fx.config.test_runner_timeout = Duration::from_millis(500);
        let (result, pids, fx) = fx.run(&mut seeded_store());
        let f = failure(result);
        match &f.error {
            Error::ProcessTimeout { partial_stdout, .. } => assert!(partial_stdout.contains("started")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.exit_code(), 6);
        fx.assert_clean(&pids);
    }

    #[test]
    fn interrupt_before_start_exits_130() {
        let flag = Arc::new(AtomicBool::new(true));
        let (result, pids, fx) = Fixture::new().run_with_flag(&mut seeded_store(), flag);
        let f = failure(result);
        assert!(matches!(f.error, Error::Interrupted));
        assert_eq!(f.exit_code(), 130);
        assert!(pids.is_empty());
        fx.assert_clean(&pids);
    }

    #[test]
    fn interrupt_during_workload_tears_everything_down() {
        let mut fx = Fixture::new();
        fx.config.workload_command = "exec sleep 30".into();
        fx.config.test_runner_timeout = Duration::from_secs(20);
        let flag = Arc::new(AtomicBool::new(false));
        let setter = {
            let flag = flag.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(800));
                flag.store(true, Ordering::SeqCst);
            })
        };
        let started = Instant::now();
        let (result, pids, fx) = fx.run_with_flag(&mut seeded_store(), flag);
        setter.join().unwrap();
        let f = failure(result);
        assert!(matches!(f.error, Error::Interrupted));
        assert_eq!(f.exit_code(), 130);
        assert!(started.elapsed() < Duration::from_secs(15));
        fx.assert_clean(&pids);
    }

    #[test]
    fn missing_sensor_data_is_formula_failure() {
        let mut store = seeded_store();
        store.data.sensor_reports = 0;
        let (result, pids, fx) = Fixture::new().run(&mut store);
        let f = failure(result);
        assert!(matches!(f.error, Error::Formula { .. }));
        assert_eq!(f.phase, Phase::Collected);
        assert_eq!(f.exit_code(), 6);
        fx.assert_clean(&pids);
        assert!(store.data.saved.is_empty());
    }

    #[test]
    fn missing_profile_is_correlation_failure() {
        let mut store = seeded_store();
        store.profile = None;
        let (result, _, _fx) = Fixture::new().run(&mut store);
        let f = failure(result);
        assert!(matches!(f.error, Error::Correlation { .. }));
        assert_eq!(f.exit_code(), 6);
    }

    #[test]
    fn report_is_exported_with_raw_data() {
        let mut fx = Fixture::new();
        let export_path = fx.dir.path().join("export.db");
        fx.config.database.export_path = Some(export_path.clone());
        fx.config.database.export_raw = true;
        let (result, _, _fx) = fx.run(&mut seeded_store());
        result.unwrap();

        let exported = SqliteStore::open(&export_path).unwrap();
        assert_eq!(exported.reports().unwrap().len(), 1);
        assert_eq!(exported.power_samples("/node").unwrap().len(), 4);
        assert!(exported.load_report("fixture").unwrap().is_some());
    }

    #[test]
    fn exit_codes_depend_on_phase() {
        let store_err = || Error::Store {
            message: "x".into(),
            source: None,
        };
        assert_eq!(exit_code(&store_err(), Phase::Initializing), 2);
        assert_eq!(exit_code(&store_err(), Phase::Correlating), 6);
        let unexpected = || Error::Unexpected(anyhow::anyhow!("x"));
        assert_eq!(exit_code(&unexpected(), Phase::Initializing), 2);
        assert_eq!(exit_code(&unexpected(), Phase::Executing), 9);
        let exec = || Error::ProcessExecution {
            command: "npm i".into(),
            exit_code: 1,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(exit_code(&exec(), Phase::Initializing), 3);
        assert_eq!(exit_code(&exec(), Phase::Executing), 6);
        let spawn = || Error::ProcessStart {
            command: "node server.js".into(),
            message: "spawn via /bin/sh".into(),
            source: None,
        };
        assert_eq!(exit_code(&spawn(), Phase::ServerStarting), 3);
        assert_eq!(exit_code(&spawn(), Phase::Executing), 6);
        assert_eq!(exit_code(&Error::config("x"), Phase::Idle), 1);
    }
}
