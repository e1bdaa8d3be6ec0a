//! The hardware sensor process.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::supervisor::{ExecContext, Liveness, ProcessHandle, ProcessSupervisor};

const LIVENESS_CHECKS: u32 = 3;
const STARTUP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct Sensor {
    handle: ProcessHandle,
}

impl Sensor {
    pub fn spawn(supervisor: &mut ProcessSupervisor, command: &str, ctx: &ExecContext) -> Result<Self> {
        debug!(command, "starting hardware sensor");
        let handle = supervisor.spawn_background(command, ctx).map_err(|e| Error::Sensor {
            message: e.to_string(),
        })?;
        Ok(Self { handle })
    }

    /// Give the sensor `startup_wait` to fail. A sensor that exits during
    /// start-up cannot be retried within the session.
    pub fn await_startup(&self, supervisor: &mut ProcessSupervisor, startup_wait: Duration) -> Result<()> {
        let deadline = Instant::now() + startup_wait;
        while Instant::now() < deadline {
            if supervisor.interrupted() {
                return Err(Error::Interrupted);
            }
            thread::sleep(STARTUP_SLICE.min(deadline.saturating_duration_since(Instant::now())));
        }
        for _ in 0..LIVENESS_CHECKS {
            self.check(supervisor)?;
        }
        debug!(pid = self.handle.pid(), "sensor started");
        Ok(())
    }

    pub fn handle(&self) -> ProcessHandle {
        self.handle
    }

    /// Fails once the sensor process is no longer running.
    pub fn check(&self, supervisor: &mut ProcessSupervisor) -> Result<()> {
        match supervisor.poll_liveness(self.handle)? {
            Liveness::Starting | Liveness::Running => Ok(()),
            Liveness::Exited(code) => {
                let stderr = supervisor
                    .terminate_tree(self.handle)
                    .map(|r| r.stderr)
                    .unwrap_or_default();
                error!(pid = self.handle.pid(), code, %stderr, "sensor exited");
                Err(Error::Sensor {
                    message: format!("sensor exited with code {code}: {}", stderr.trim()),
                })
            }
            Liveness::Terminated => Err(Error::Sensor {
                message: "sensor is no longer supervised".into(),
            }),
        }
    }
}
