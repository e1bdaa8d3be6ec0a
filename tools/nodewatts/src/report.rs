use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::correlate::{Categories, Correlation, CorrelationStats};
use crate::model::CallFrameNode;
use crate::stats;

/// Where and how the profiled data was collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub project_root: PathBuf,
    pub entry_file: PathBuf,
    pub server_command: String,
    pub test_command: String,
    pub test_runs: u32,
    pub started_at: DateTime<Utc>,
    pub collected_at: DateTime<Utc>,
}

/// One CPU sample and the power estimate it was attributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileTick {
    pub timestamp: i64,
    pub node_id: u32,
    pub power_timestamp: i64,
    pub power: f64,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub name: String,
    pub profile_title: String,
    pub created_at: DateTime<Utc>,
    pub session: SessionInfo,
    pub nodes: BTreeMap<u32, CallFrameNode>,
    pub categories: Categories,
    pub stats: CorrelationStats,
    /// Ticks in CPU-sample order.
    pub ticks: Vec<ProfileTick>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryTotal {
    pub label: String,
    pub nodes: usize,
    pub samples: usize,
    pub mean_power: Option<f64>,
}

impl Report {
    /// Per-category sample counts and mean attributed power, in a fixed
    /// order: runtime modules, packages, user code, system.
    pub fn category_totals(&self) -> Vec<CategoryTotal> {
        let mut out = Vec::new();
        for (key, ids) in &self.categories.node_core {
            out.push(self.total(key.clone(), ids));
        }
        for (key, ids) in &self.categories.npm_dependency {
            out.push(self.total(format!("npm:{key}"), ids));
        }
        if !self.categories.user_code.is_empty() {
            out.push(self.total("user-code".into(), &self.categories.user_code));
        }
        if !self.categories.system.is_empty() {
            out.push(self.total("system".into(), &self.categories.system));
        }
        out
    }

    fn total(&self, label: String, ids: &[u32]) -> CategoryTotal {
        let values: Vec<f64> = ids
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .flat_map(|n| n.power.iter().copied())
            .collect();
        CategoryTotal {
            label,
            nodes: ids.len(),
            samples: values.len(),
            mean_power: stats::mean(&values),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportBuilder {
    name: String,
    profile_title: String,
    session: SessionInfo,
    created_at: Option<DateTime<Utc>>,
}

impl ReportBuilder {
    pub fn new(name: impl Into<String>, profile_title: impl Into<String>, session: SessionInfo) -> Self {
        Self {
            name: name.into(),
            profile_title: profile_title.into(),
            session,
            created_at: None,
        }
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn build(self, correlation: Correlation) -> Report {
        let ticks = correlation
            .pairs
            .iter()
            .map(|p| ProfileTick {
                timestamp: p.cpu.timestamp,
                node_id: p.cpu.node_id,
                power_timestamp: p.power.timestamp,
                power: p.power.power,
                delta: p.delta,
            })
            .collect();
        Report {
            name: self.name,
            profile_title: self.profile_title,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            session: self.session,
            nodes: correlation.nodes,
            categories: correlation.categories,
            stats: correlation.stats,
            ticks,
        }
    }
}
