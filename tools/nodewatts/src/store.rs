//! Where the agent, the sensor and the formula leave their data, and where
//! finished reports are kept.
//!
//! Raw collections (`sensor_raw`, `power`, `profiles`) belong to a single
//! session and are dropped at its start and after its report is saved.
//! Reports are never dropped.

use std::collections::BTreeMap;
use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{CpuProfile, PowerSample};
use crate::report::Report;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub name: String,
    pub created_at: String,
}

pub trait SampleStore {
    fn drop_raw_data(&mut self) -> Result<()>;

    /// Number of raw sensor reports recorded this session.
    fn sensor_report_count(&self) -> Result<u64>;

    /// Power estimates for `target`, oldest first.
    fn power_samples(&self, target: &str) -> Result<Vec<PowerSample>>;

    fn cpu_profile(&self, title: &str) -> Result<Option<CpuProfile>>;

    fn save_report(&mut self, report: &Report) -> Result<()>;

    fn reports(&self) -> Result<Vec<ReportSummary>>;

    fn load_report(&self, name: &str) -> Result<Option<Report>>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sensor_raw (
    id INTEGER PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    sensor TEXT NOT NULL,
    target TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS power (
    id INTEGER PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    sensor TEXT NOT NULL,
    target TEXT NOT NULL,
    power REAL NOT NULL,
    metadata TEXT NOT NULL DEFAULT 'null'
);
CREATE INDEX IF NOT EXISTS power_target_ts ON power (target, timestamp);
CREATE TABLE IF NOT EXISTS profiles (
    title TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS reports (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    body TEXT NOT NULL
);
";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::Store {
                message: format!("create {}: {e}", parent.display()),
                source: None,
            })?;
        }
        let conn = Connection::open(&path)
            .map_err(|e| Error::store(format!("open {}", path.display()), e))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .map_err(|e| Error::store("init sqlite pragmas", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::store("ensure schema", e))?;
        Ok(Self { conn })
    }

    pub fn insert_power(&mut self, samples: &[PowerSample]) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| Error::store("begin power insert", e))?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO power (timestamp, sensor, target, power, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(|e| Error::store("prepare power insert", e))?;
            for s in samples {
                stmt.execute(params![
                    s.timestamp,
                    s.sensor,
                    s.target,
                    s.power,
                    s.metadata.to_string()
                ])
                .map_err(|e| Error::store("insert power sample", e))?;
            }
        }
        tx.commit().map_err(|e| Error::store("commit power insert", e))
    }

    pub fn insert_sensor_report(
        &mut self,
        timestamp: i64,
        sensor: &str,
        target: &str,
        body: &serde_json::Value,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sensor_raw (timestamp, sensor, target, body) VALUES (?1, ?2, ?3, ?4)",
                params![timestamp, sensor, target, body.to_string()],
            )
            .map_err(|e| Error::store("insert sensor report", e))?;
        Ok(())
    }

    pub fn insert_profile(&mut self, profile: &CpuProfile) -> Result<()> {
        let body = serde_json::to_string(profile).map_err(|e| Error::Store {
            message: format!("serialize profile: {e}"),
            source: None,
        })?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO profiles (title, body) VALUES (?1, ?2)",
                params![profile.title, body],
            )
            .map_err(|e| Error::store("insert profile", e))?;
        Ok(())
    }
}

impl SampleStore for SqliteStore {
    fn drop_raw_data(&mut self) -> Result<()> {
        self.conn
            .execute_batch("DELETE FROM sensor_raw; DELETE FROM power; DELETE FROM profiles;")
            .map_err(|e| Error::store("drop raw data", e))
    }

    fn sensor_report_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sensor_raw", [], |row| row.get(0))
            .map_err(|e| Error::store("count sensor reports", e))?;
        Ok(n.max(0) as u64)
    }

    fn power_samples(&self, target: &str) -> Result<Vec<PowerSample>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT timestamp, sensor, target, power, metadata FROM power
                 WHERE target = ?1 ORDER BY timestamp ASC, id ASC",
            )
            .map_err(|e| Error::store("prepare power query", e))?;
        let rows = stmt
            .query_map(params![target], |row| {
                let metadata: String = row.get(4)?;
                Ok(PowerSample {
                    timestamp: row.get(0)?,
                    sensor: row.get(1)?,
                    target: row.get(2)?,
                    power: row.get(3)?,
                    metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
                })
            })
            .map_err(|e| Error::store("query power samples", e))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::store("read power sample", e))
    }

    fn cpu_profile(&self, title: &str) -> Result<Option<CpuProfile>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM profiles WHERE title = ?1",
                params![title],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::store("query profile", e))?;
        body.map(|b| {
            serde_json::from_str(&b).map_err(|e| Error::Store {
                message: format!("parse profile {title}: {e}"),
                source: None,
            })
        })
        .transpose()
    }

    fn save_report(&mut self, report: &Report) -> Result<()> {
        let body = serde_json::to_string(report).map_err(|e| Error::Store {
            message: format!("serialize report: {e}"),
            source: None,
        })?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO reports (name, created_at, body) VALUES (?1, ?2, ?3)",
                params![report.name, report.created_at.to_rfc3339(), body],
            )
            .map_err(|e| Error::store("save report", e))?;
        Ok(())
    }

    fn reports(&self) -> Result<Vec<ReportSummary>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, created_at FROM reports ORDER BY created_at ASC")
            .map_err(|e| Error::store("prepare report listing", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ReportSummary {
                    name: row.get(0)?,
                    created_at: row.get(1)?,
                })
            })
            .map_err(|e| Error::store("list reports", e))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::store("read report row", e))
    }

    fn load_report(&self, name: &str) -> Result<Option<Report>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM reports WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::store("load report", e))?;
        body.map(|b| {
            serde_json::from_str(&b).map_err(|e| Error::Store {
                message: format!("parse report {name}: {e}"),
                source: None,
            })
        })
        .transpose()
    }
}

/// In-process store, used when nothing needs to outlive the run.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    pub sensor_reports: u64,
    pub power: Vec<PowerSample>,
    pub profiles: BTreeMap<String, CpuProfile>,
    pub saved: Vec<Report>,
}

impl SampleStore for MemoryStore {
    fn drop_raw_data(&mut self) -> Result<()> {
        self.sensor_reports = 0;
        self.power.clear();
        self.profiles.clear();
        Ok(())
    }

    fn sensor_report_count(&self) -> Result<u64> {
        Ok(self.sensor_reports)
    }

    fn power_samples(&self, target: &str) -> Result<Vec<PowerSample>> {
        let mut out: Vec<_> = self
            .power
            .iter()
            .filter(|s| s.target == target)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.timestamp);
        Ok(out)
    }

    fn cpu_profile(&self, title: &str) -> Result<Option<CpuProfile>> {
        Ok(self.profiles.get(title).cloned())
    }

    fn save_report(&mut self, report: &Report) -> Result<()> {
        self.saved.retain(|r| r.name != report.name);
        self.saved.push(report.clone());
        Ok(())
    }

    fn reports(&self) -> Result<Vec<ReportSummary>> {
        Ok(self
            .saved
            .iter()
            .map(|r| ReportSummary {
                name: r.name.clone(),
                created_at: r.created_at.to_rfc3339(),
            })
            .collect())
    }

    fn load_report(&self, name: &str) -> Result<Option<Report>> {
        Ok(self.saved.iter().find(|r| r.name == name).cloned())
    }
}
