//! The power-estimation formula, run after collection to turn raw sensor
//! reports into per-target power estimates.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::store::SampleStore;
use crate::supervisor::{ExecContext, ProcessSupervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormulaOutcome {
    Completed,
    /// Stopped by SIGINT or SIGTERM. Whatever estimates it wrote are kept.
    Cancelled,
}

/// Exit codes of a shell whose child died of SIGINT/SIGTERM.
const CANCELLED_CODES: [i32; 2] = [128 + libc::SIGINT, 128 + libc::SIGTERM];

/// The formula has nothing to work with unless the sensor wrote reports.
pub fn verify_sensor_data(store: &dyn SampleStore) -> Result<u64> {
    let count = store.sensor_report_count()?;
    if count == 0 {
        return Err(Error::Formula {
            message: "raw sensor data was not saved: the sensor report collection is empty".into(),
        });
    }
    Ok(count)
}

#[derive(Debug, Clone)]
pub struct Formula {
    command: String,
    timeout: Duration,
}

impl Formula {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    pub fn run(&self, supervisor: &mut ProcessSupervisor, ctx: &ExecContext) -> Result<FormulaOutcome> {
        info!("computing process power model, this may take several minutes");
        match supervisor.run_blocking(&self.command, ctx, self.timeout) {
            Ok(_) => {
                info!("power modelling complete");
                Ok(FormulaOutcome::Completed)
            }
            Err(Error::Interrupted) => {
                warn!("power formula cancelled by interrupt");
                Ok(FormulaOutcome::Cancelled)
            }
            Err(Error::ProcessExecution { exit_code, .. }) if CANCELLED_CODES.contains(&exit_code) => {
                warn!(exit_code, "power formula was terminated");
                Ok(FormulaOutcome::Cancelled)
            }
            Err(Error::ProcessExecution { exit_code, stderr, .. }) => Err(Error::Formula {
                message: format!("exited with code {exit_code}: {}", stderr.trim()),
            }),
            Err(Error::ProcessTimeout { timeout, .. }) => Err(Error::Formula {
                message: format!("did not finish within {timeout:?}"),
            }),
            Err(Error::ProcessStart { message, .. }) => Err(Error::Formula { message }),
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn run(command: &str) -> Result<FormulaOutcome> {
        let mut sup = ProcessSupervisor::new("/bin/sh");
        Formula::new(command, Duration::from_secs(5)).run(&mut sup, &ExecContext::new(std::env::temp_dir()))
    }

    #[test]
    fn outcomes_by_exit() {
        assert_eq!(run("true").unwrap(), FormulaOutcome::Completed);
        assert_eq!(run("kill -TERM $$").unwrap(), FormulaOutcome::Cancelled);
        assert_eq!(run("exit 130").unwrap(), FormulaOutcome::Cancelled);
        assert!(matches!(run("echo bad model >&2; exit 1"), Err(Error::Formula { message }) if message.contains("bad model")));
    }

    #[test]
    fn missing_sensor_data_is_formula_error() {
        let mut store = MemoryStore::default();
        assert!(matches!(verify_sensor_data(&store), Err(Error::Formula { .. })));
        store.sensor_reports = 12;
        assert_eq!(verify_sensor_data(&store).unwrap(), 12);
    }
}
