use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure a profiling session can surface.
///
/// Variants are matched explicitly by the session controller to pick an exit
/// code; nothing relies on the order errors are caught in.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("resource scope unavailable: {message}")]
    ScopeInit {
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("resource scope error: {message}")]
    Scope {
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("failed to start `{command}`: {message}")]
    ProcessStart {
        command: String,
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("`{command}` did not signal readiness after {attempts} attempts")]
    StartupTimeout { command: String, attempts: u32 },

    #[error("`{command}` failed with exit code {exit_code}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    ProcessExecution {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("`{command}` timed out after {timeout:?}\nstdout before timeout:\n{partial_stdout}\nstderr before timeout:\n{partial_stderr}")]
    ProcessTimeout {
        command: String,
        timeout: Duration,
        partial_stdout: String,
        partial_stderr: String,
    },

    #[error("sensor failure: {message}")]
    Sensor { message: String },

    #[error("power formula failed: {message}")]
    Formula { message: String },

    #[error("correlation failed: {message}")]
    Correlation { message: String },

    #[error("data store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("interrupted")]
    Interrupted,

    #[error("unexpected error: {0:#}")]
    Unexpected(#[from] anyhow::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    pub fn scope(message: impl Into<String>, source: Option<io::Error>) -> Self {
        Error::Scope {
            message: message.into(),
            source,
        }
    }

    pub fn store(message: impl Into<String>, source: rusqlite::Error) -> Self {
        Error::Store {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn correlation(message: impl Into<String>) -> Self {
        Error::Correlation {
            message: message.into(),
        }
    }
}
