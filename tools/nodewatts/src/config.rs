//! Run configuration.
//!
//! The file format keeps the tool's historical keys (`rootDirectoryPath`,
//! `cpu-tdp`, `dev-serverWait`, ...). [`Config::load`] parses and validates it
//! once; everything past this module works with the typed [`Config`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::supervisor::home_dir_of;

pub const DEFAULT_TEST_RUNS: u32 = 3;
pub const DEFAULT_SERVER_WAIT_ATTEMPTS: u32 = 5;
pub const DEFAULT_SERVER_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_SENSOR_STARTUP_WAIT: Duration = Duration::from_secs(2);
pub const DEFAULT_TEST_RUNNER_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_FORMULA_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_SHELL: &str = "/bin/sh";
pub const DEFAULT_PROFILER_PORT: u16 = 9999;
pub const DEFAULT_AGENT_DIR: &str = "/usr/local/share/nodewatts/agent";
pub const DEFAULT_SENSOR_CONFIG: &str = "/etc/nodewatts/hwpc_config.json";
pub const DEFAULT_FORMULA_CONFIG: &str = "/etc/nodewatts/smartwatts_config.json";
pub const POWER_TARGET: &str = "/node";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(rename = "rootDirectoryPath")]
    root_directory_path: Option<PathBuf>,
    #[serde(rename = "entryFile")]
    entry_file: Option<PathBuf>,
    user: Option<String>,
    #[serde(rename = "cpu-tdp")]
    cpu_tdp: Option<f64>,
    commands: Option<RawCommands>,
    #[serde(rename = "testRuns")]
    test_runs: Option<u32>,
    #[serde(rename = "nvm-mode", default)]
    nvm_mode: bool,
    #[serde(rename = "nvm-node-version")]
    nvm_node_version: Option<String>,
    #[serde(rename = "es6-mode", default)]
    es6_mode: bool,
    #[serde(rename = "reportName")]
    report_name: Option<String>,
    #[serde(default)]
    database: RawDatabase,
    // Accepted for compatibility with older config files; the web UI is a
    // separate program.
    #[serde(default)]
    #[allow(dead_code)]
    visualize: Option<bool>,

    #[serde(rename = "dev-serverWait")]
    server_wait: Option<u32>,
    #[serde(rename = "dev-serverPollMillis")]
    server_poll_millis: Option<u64>,
    #[serde(rename = "dev-testRunnerTimeout")]
    test_runner_timeout: Option<u64>,
    #[serde(rename = "dev-subprocessShell")]
    subprocess_shell: Option<PathBuf>,
    #[serde(rename = "dev-nvmPathOverride")]
    nvm_path_override: Option<PathBuf>,
    #[serde(rename = "dev-enableSmartWattsLogs", default)]
    formula_verbose: bool,
    #[serde(rename = "dev-formulaTimeout")]
    formula_timeout: Option<u64>,
    #[serde(rename = "dev-tmpPath")]
    tmp_path: Option<PathBuf>,
    #[serde(rename = "dev-agentScriptsPath")]
    agent_scripts_path: Option<PathBuf>,
    #[serde(rename = "dev-sensorConfigPath")]
    sensor_config_path: Option<PathBuf>,
    #[serde(rename = "dev-formulaConfigPath")]
    formula_config_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCommands {
    #[serde(rename = "serverStart")]
    server_start: Option<String>,
    #[serde(rename = "runTests")]
    run_tests: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDatabase {
    path: Option<PathBuf>,
    #[serde(rename = "exportRawData", default)]
    export_raw_data: bool,
    #[serde(rename = "exportPath")]
    export_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// Second database the finished report is copied into.
    pub export_path: Option<PathBuf>,
    /// Also copy this session's power estimates and CPU profile.
    pub export_raw: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub project_root: PathBuf,
    /// Relative to `project_root`.
    pub entry_file: PathBuf,
    pub user: String,
    /// Upper bound on a plausible power estimate, watts.
    pub cpu_tdp: f64,
    pub server_command: String,
    pub test_command: String,
    pub test_runs: u32,
    /// Node binaries to put on PATH for every project process.
    pub node_bin_dir: Option<PathBuf>,
    pub es6_mode: bool,
    pub report_name: String,
    pub database: DatabaseConfig,
    pub server_wait_attempts: u32,
    pub server_poll_interval: Duration,
    pub sensor_startup_wait: Duration,
    pub test_runner_timeout: Duration,
    pub formula_timeout: Duration,
    pub shell: PathBuf,
    pub tmp_path: PathBuf,
    pub scope_root: PathBuf,
    pub agent_dir: PathBuf,
    pub sensor_command: String,
    pub formula_command: String,
    /// Command run once per test repetition; it drives `test_command`.
    pub workload_command: String,
    pub profiler_port: u16,
    pub power_target: String,
    /// Install the agent's npm packages and rewrite the entry file.
    pub instrument_project: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(text)
            .map_err(|e| Error::config(format!("config file must be valid JSON: {e}")))?;
        Self::from_raw(raw)
    }

    pub fn entry_path(&self) -> PathBuf {
        self.project_root.join(&self.entry_file)
    }

    /// External programs the session will invoke that cannot be found.
    /// `node` and `npm` are looked up in the nvm bin directory when one is
    /// configured.
    pub fn missing_tools(&self) -> Vec<String> {
        let mut wanted = vec![program_of(&self.sensor_command), program_of(&self.formula_command)];
        if self.instrument_project {
            wanted.extend(["node", "npm"]);
        }
        wanted
            .into_iter()
            .filter(|name| !name.is_empty())
            .filter(|name| match (&self.node_bin_dir, *name) {
                (Some(dir), "node" | "npm") => !dir.join(name).is_file(),
                _ => which::which(name).is_err(),
            })
            .map(str::to_string)
            .collect()
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let mut missing = Vec::new();
        if raw.root_directory_path.is_none() {
            missing.push("rootDirectoryPath");
        }
        if raw.entry_file.is_none() {
            missing.push("entryFile");
        }
        if raw.user.is_none() {
            missing.push("user");
        }
        if raw.cpu_tdp.is_none() {
            missing.push("cpu-tdp");
        }
        let commands = raw.commands.as_ref();
        if commands.and_then(|c| c.server_start.as_ref()).is_none() {
            missing.push("commands.serverStart");
        }
        if commands.and_then(|c| c.run_tests.as_ref()).is_none() {
            missing.push("commands.runTests");
        }
        if raw.nvm_mode && raw.nvm_node_version.is_none() && raw.nvm_path_override.is_none() {
            missing.push("nvm-node-version");
        }
        if !missing.is_empty() {
            return Err(Error::config(format!(
                "missing configuration fields: {}",
                missing.join(", ")
            )));
        }

        let project_root = raw.root_directory_path.unwrap_or_default();
        let entry_file = raw.entry_file.unwrap_or_default();
        let user = raw.user.unwrap_or_default();
        let cpu_tdp = raw.cpu_tdp.unwrap_or_default();
        let (server_command, test_command) = match raw.commands {
            Some(c) => (c.server_start.unwrap_or_default(), c.run_tests.unwrap_or_default()),
            None => Default::default(),
        };

        if !project_root.is_dir() {
            return Err(Error::config(format!(
                "rootDirectoryPath {} is not a directory",
                project_root.display()
            )));
        }
        if !project_root.join(&entry_file).is_file() {
            return Err(Error::config(format!(
                "entryFile {} does not exist under {}",
                entry_file.display(),
                project_root.display()
            )));
        }
        if !(cpu_tdp.is_finite() && cpu_tdp > 0.0) {
            return Err(Error::config("cpu-tdp must be a positive number of watts"));
        }
        if server_command.trim().is_empty() || test_command.trim().is_empty() {
            return Err(Error::config("commands.serverStart and commands.runTests must not be empty"));
        }
        let test_runs = raw.test_runs.unwrap_or(DEFAULT_TEST_RUNS);
        if test_runs == 0 {
            return Err(Error::config("testRuns must be at least 1"));
        }
        let server_wait_attempts = raw.server_wait.unwrap_or(DEFAULT_SERVER_WAIT_ATTEMPTS);
        if server_wait_attempts == 0 {
            return Err(Error::config("dev-serverWait must be at least 1"));
        }

        let home = home_dir_of(&user)
            .ok_or_else(|| Error::config(format!("user {user} does not exist")))?;

        let node_bin_dir = if raw.nvm_mode {
            Some(match raw.nvm_path_override {
                Some(dir) => {
                    if !dir.is_dir() {
                        return Err(Error::config(format!(
                            "dev-nvmPathOverride {} does not exist",
                            dir.display()
                        )));
                    }
                    dir
                }
                None => {
                    let version = raw.nvm_node_version.unwrap_or_default();
                    nvm_bin_dir(&home, &version)?
                }
            })
        } else {
            None
        };

        let shell = raw.subprocess_shell.unwrap_or_else(|| DEFAULT_SHELL.into());
        if !shell.exists() {
            return Err(Error::config(format!(
                "dev-subprocessShell {} does not exist",
                shell.display()
            )));
        }

        let data_dir = home.join(".local").join("share").join("nodewatts");
        let agent_dir = raw.agent_scripts_path.unwrap_or_else(|| DEFAULT_AGENT_DIR.into());
        let sensor_config = raw.sensor_config_path.unwrap_or_else(|| DEFAULT_SENSOR_CONFIG.into());
        let formula_config = raw.formula_config_path.unwrap_or_else(|| DEFAULT_FORMULA_CONFIG.into());

        Ok(Config {
            entry_file,
            user,
            cpu_tdp,
            test_runs,
            node_bin_dir,
            es6_mode: raw.es6_mode,
            report_name: raw
                .report_name
                .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()),
            database: DatabaseConfig {
                path: raw.database.path.unwrap_or_else(|| data_dir.join("nodewatts.db")),
                export_path: raw.database.export_path,
                export_raw: raw.database.export_raw_data,
            },
            server_wait_attempts,
            server_poll_interval: raw
                .server_poll_millis
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SERVER_POLL_INTERVAL),
            sensor_startup_wait: DEFAULT_SENSOR_STARTUP_WAIT,
            test_runner_timeout: raw
                .test_runner_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TEST_RUNNER_TIMEOUT),
            formula_timeout: raw
                .formula_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_FORMULA_TIMEOUT),
            shell,
            tmp_path: raw.tmp_path.unwrap_or_else(|| data_dir.join("tmp")),
            scope_root: crate::scope::PERF_EVENT_ROOT.into(),
            sensor_command: format!("hwpc-sensor --config-file {}", sensor_config.display()),
            formula_command: format!(
                "smartwatts --config-file {}{}",
                formula_config.display(),
                if raw.formula_verbose { " --verbose" } else { "" }
            ),
            workload_command: format!("node {}", agent_dir.join("test-runner.js").display()),
            agent_dir,
            profiler_port: DEFAULT_PROFILER_PORT,
            power_target: POWER_TARGET.into(),
            instrument_project: true,
            project_root,
            server_command,
            test_command,
        })
    }
}

fn program_of(command: &str) -> &str {
    command
        .split_whitespace()
        .find(|word| *word != "exec")
        .unwrap_or_default()
}

/// `~user/.nvm/versions/node/v<version>/bin`; the version must be a full
/// `major.minor.patch`.
pub fn nvm_bin_dir(home: &Path, version: &str) -> Result<PathBuf> {
    let version = version.trim_start_matches('v');
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.parse::<u32>().is_err()) {
        return Err(Error::config(format!(
            "nvm-node-version must be a full version like 18.12.1, got {version:?}"
        )));
    }
    let dir = home
        .join(".nvm")
        .join("versions")
        .join("node")
        .join(format!("v{version}"))
        .join("bin");
    if !dir.is_dir() {
        return Err(Error::config(format!(
            "could not locate nvm node install at {}",
            dir.display()
        )));
    }
    Ok(dir)
}
