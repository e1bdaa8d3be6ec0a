//! Attributing power estimates to the call frames that were on-CPU.
//!
//! Every CPU sample is paired with the power estimate closest to it in time.
//! The power series is sorted, so the closest estimate is one of the two
//! neighbours of the sample's insertion point.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{CallFrameNode, CpuSample, PowerSample};
use crate::stats::{self, DistributionFit, IntervalStats, Summary};

pub const NODE_CORE_PREFIX: &str = "node:";
pub const PACKAGE_DIR: &str = "node_modules";
pub const DEFAULT_OUTLIER_CEILING: f64 = 85.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "kebab-case")]
pub enum SourceCategory {
    /// Runtime built-in, keyed by its module specifier (`node:http`).
    NodeCore(String),
    /// Installed package, keyed by package directory name.
    NpmDependency(String),
    UserCode,
    System,
}

pub fn classify(url: &str) -> SourceCategory {
    if url.is_empty() {
        return SourceCategory::System;
    }
    let segments: Vec<&str> = url.split('/').collect();
    if segments[0].starts_with(NODE_CORE_PREFIX) {
        return SourceCategory::NodeCore(segments[0].to_string());
    }
    if let Some(pos) = segments.iter().position(|s| *s == PACKAGE_DIR) {
        if let Some(name) = segments.get(pos + 1).filter(|s| !s.is_empty()) {
            return SourceCategory::NpmDependency(name.to_string());
        }
    }
    SourceCategory::UserCode
}

/// Drop estimates above `ceiling`; returns the survivors and how many were
/// dropped.
pub fn filter_outliers(samples: &[PowerSample], ceiling: f64) -> (Vec<PowerSample>, usize) {
    let kept: Vec<PowerSample> = samples
        .iter()
        .filter(|s| s.power <= ceiling)
        .cloned()
        .collect();
    let dropped = samples.len() - kept.len();
    (kept, dropped)
}

/// Index of the sample closest to `t` in a timestamp-sorted series. Exact
/// ties go to the earlier sample; `t` outside the series clamps to its ends.
pub fn nearest(series: &[PowerSample], t: i64) -> Option<usize> {
    if series.is_empty() {
        return None;
    }
    let pos = series.partition_point(|s| s.timestamp < t);
    if pos == 0 {
        return Some(0);
    }
    if pos == series.len() {
        return Some(series.len() - 1);
    }
    let before = t - series[pos - 1].timestamp;
    let after = series[pos].timestamp - t;
    if after < before {
        Some(pos)
    } else {
        Some(pos - 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedSample {
    pub cpu: CpuSample,
    pub power: PowerSample,
    /// |cpu.timestamp - power.timestamp|, microseconds.
    pub delta: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentStats {
    pub count: usize,
    pub min_delta: Option<i64>,
    pub max_delta: Option<i64>,
    pub avg_delta: Option<f64>,
    /// CPU samples that landed on an estimate an earlier sample already used.
    pub reused: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Categories {
    pub node_core: BTreeMap<String, Vec<u32>>,
    pub npm_dependency: BTreeMap<String, Vec<u32>>,
    pub user_code: Vec<u32>,
    pub system: Vec<u32>,
}

impl Categories {
    fn assign(&mut self, category: SourceCategory, node_id: u32) {
        let ids = match category {
            SourceCategory::NodeCore(key) => self.node_core.entry(key).or_default(),
            SourceCategory::NpmDependency(key) => self.npm_dependency.entry(key).or_default(),
            SourceCategory::UserCode => &mut self.user_code,
            SourceCategory::System => &mut self.system,
        };
        if !ids.contains(&node_id) {
            ids.push(node_id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationStats {
    pub cpu_samples: usize,
    pub outlier_ceiling: f64,
    pub dropped_outliers: usize,
    pub power_pre_filter: Summary,
    pub power_post_filter: Summary,
    pub pre_filter_fit: Option<DistributionFit>,
    pub post_filter_fit: Option<DistributionFit>,
    pub raw_assignments: AssignmentStats,
    pub filtered_assignments: AssignmentStats,
    pub power_intervals: IntervalStats,
    pub cpu_intervals: IntervalStats,
    pub sensor_start: Option<i64>,
    pub sensor_end: Option<i64>,
    /// CPU samples whose node id is absent from the profile's node list.
    pub orphan_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub pairs: Vec<MatchedSample>,
    pub nodes: BTreeMap<u32, CallFrameNode>,
    pub categories: Categories,
    pub stats: CorrelationStats,
}

#[derive(Debug, Clone)]
pub struct Correlator {
    ceiling: f64,
    fit_distributions: bool,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_OUTLIER_CEILING)
    }
}

impl Correlator {
    pub fn new(ceiling: f64) -> Self {
        Self {
            ceiling,
            fit_distributions: true,
        }
    }

    pub fn fit_distributions(mut self, enabled: bool) -> Self {
        self.fit_distributions = enabled;
        self
    }

    pub fn correlate(
        &self,
        cpu: &[CpuSample],
        nodes: Vec<CallFrameNode>,
        power: &[PowerSample],
    ) -> Result<Correlation> {
        if cpu.is_empty() {
            return Err(Error::correlation("no CPU samples were collected"));
        }
        if power.is_empty() {
            return Err(Error::correlation("no power samples were collected"));
        }

        let cpu = sorted_by_time(cpu, |s| s.timestamp, "cpu");
        let power = sorted_by_time(power, |s| s.timestamp, "power");

        let (filtered, dropped) = filter_outliers(&power, self.ceiling);
        if filtered.is_empty() {
            return Err(Error::correlation(format!(
                "all {} power samples exceeded the {} W ceiling",
                power.len(),
                self.ceiling
            )));
        }
        debug!(
            dropped,
            kept = filtered.len(),
            ceiling = self.ceiling,
            "filtered power outliers"
        );

        let raw_values: Vec<f64> = power.iter().map(|s| s.power).collect();
        let kept_values: Vec<f64> = filtered.iter().map(|s| s.power).collect();

        let raw_assignments = assignment_stats(&cpu, &power).0;
        let (filtered_assignments, pairs) = assignment_stats(&cpu, &filtered);

        let mut nodes: BTreeMap<u32, CallFrameNode> = nodes.into_iter().map(|n| (n.id, n)).collect();
        let mut categories = Categories::default();
        let mut orphan_samples = 0;
        for pair in &pairs {
            match nodes.get_mut(&pair.cpu.node_id) {
                Some(node) => {
                    node.power.push(pair.power.power);
                    categories.assign(classify(&node.url), node.id);
                }
                None => orphan_samples += 1,
            }
        }
        if orphan_samples > 0 {
            warn!(orphan_samples, "cpu samples reference unknown call frames");
        }

        let (pre_filter_fit, post_filter_fit) = if self.fit_distributions {
            (stats::best_fit(&raw_values), stats::best_fit(&kept_values))
        } else {
            (None, None)
        };

        let power_ts: Vec<i64> = power.iter().map(|s| s.timestamp).collect();
        let cpu_ts: Vec<i64> = cpu.iter().map(|s| s.timestamp).collect();

        let stats = CorrelationStats {
            cpu_samples: cpu.len(),
            outlier_ceiling: self.ceiling,
            dropped_outliers: dropped,
            power_pre_filter: Summary::of(&raw_values),
            power_post_filter: Summary::of(&kept_values),
            pre_filter_fit,
            post_filter_fit,
            raw_assignments,
            filtered_assignments,
            power_intervals: IntervalStats::of(&power_ts),
            cpu_intervals: IntervalStats::of(&cpu_ts),
            sensor_start: filtered.first().map(|s| s.timestamp),
            sensor_end: filtered.last().map(|s| s.timestamp),
            orphan_samples,
        };

        Ok(Correlation {
            pairs,
            nodes,
            categories,
            stats,
        })
    }
}

fn sorted_by_time<T: Clone>(items: &[T], key: impl Fn(&T) -> i64, series: &str) -> Vec<T> {
    let mut out = items.to_vec();
    if !items.windows(2).all(|w| key(&w[0]) <= key(&w[1])) {
        warn!(series, "samples arrived out of order, sorting");
        out.sort_by_key(|s| key(s));
    }
    out
}

fn assignment_stats(cpu: &[CpuSample], power: &[PowerSample]) -> (AssignmentStats, Vec<MatchedSample>) {
    let mut pairs = Vec::with_capacity(cpu.len());
    let mut used = vec![false; power.len()];
    let mut reused = 0;
    for sample in cpu {
        let Some(idx) = nearest(power, sample.timestamp) else {
            continue;
        };
        if std::mem::replace(&mut used[idx], true) {
            reused += 1;
        }
        pairs.push(MatchedSample {
            cpu: *sample,
            power: power[idx].clone(),
            delta: (sample.timestamp - power[idx].timestamp).abs(),
        });
    }

    let deltas: Vec<f64> = pairs.iter().map(|p| p.delta as f64).collect();
    let stats = AssignmentStats {
        count: pairs.len(),
        min_delta: pairs.iter().map(|p| p.delta).min(),
        max_delta: pairs.iter().map(|p| p.delta).max(),
        avg_delta: stats::mean(&deltas),
        reused,
    };
    (stats, pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn power(points: &[(i64, f64)]) -> Vec<PowerSample> {
        points
            .iter()
            .map(|&(ts, w)| PowerSample::new(ts, "/node", w))
            .collect()
    }

    fn node(id: u32, url: &str) -> CallFrameNode {
        CallFrameNode {
            id,
            url: url.to_string(),
            function_name: format!("fn{id}"),
            line_number: 0,
            children: vec![],
            power: vec![],
        }
    }

    #[test]
    fn classifies_by_url() {
        assert_eq!(classify("node:http"), SourceCategory::NodeCore("node:http".into()));
        assert_eq!(
            classify("/proj/node_modules/express/index.js"),
            SourceCategory::NpmDependency("express".into())
        );
        assert_eq!(classify("/proj/app.js"), SourceCategory::UserCode);
        assert_eq!(classify(""), SourceCategory::System);
        assert_eq!(
            classify("node:internal/streams/readable"),
            SourceCategory::NodeCore("node:internal".into())
        );
        assert_eq!(classify("/proj/node_modules/"), SourceCategory::UserCode);
    }

    #[test]
    fn outliers_above_ceiling_are_dropped_and_counted() {
        let samples = power(&[(1, 10.0), (2, 20.0), (3, 999.0), (4, 30.0)]);
        let (kept, dropped) = filter_outliers(&samples, 85.0);
        let values: Vec<f64> = kept.iter().map(|s| s.power).collect();
        assert_eq!(values, vec![10.0, 20.0, 30.0]);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn nearest_picks_smaller_delta_and_earlier_on_tie() {
        let series = power(&[(90, 5.0), (150, 7.0), (300, 6.0), (360, 8.0)]);
        assert_eq!(nearest(&series, 100), Some(0));
        assert_eq!(nearest(&series, 340), Some(3));
        assert_eq!(nearest(&series, 120), Some(0));
        assert_eq!(nearest(&series, 150), Some(1));
        assert_eq!(nearest(&series, 225), Some(1));
        assert_eq!(nearest(&series, 226), Some(2));
    }

    #[test]
    fn nearest_clamps_outside_the_series() {
        let series = power(&[(90, 5.0), (150, 7.0)]);
        assert_eq!(nearest(&series, -5), Some(0));
        assert_eq!(nearest(&series, 10_000), Some(1));
        assert_eq!(nearest(&[], 10), None);
    }

    #[test]
    fn nearest_is_minimal_for_every_timestamp_in_range() {
        let series = power(&[(3, 1.0), (8, 1.0), (9, 1.0), (20, 1.0), (21, 1.0), (40, 1.0)]);
        for t in 3..=40 {
            let got = nearest(&series, t).unwrap();
            let best = series
                .iter()
                .map(|s| (s.timestamp - t).abs())
                .min()
                .unwrap();
            let first_best = series
                .iter()
                .position(|s| (s.timestamp - t).abs() == best)
                .unwrap();
            assert_eq!(got, first_best, "t = {t}");
        }
    }

    #[test]
    fn end_to_end_attribution() {
        let cpu = vec![
            CpuSample { timestamp: 100, node_id: 1 },
            CpuSample { timestamp: 340, node_id: 2 },
        ];
        let nodes = vec![node(1, "/proj/app.js"), node(2, "/proj/node_modules/express/index.js")];
        let power = power(&[(90, 5.0), (150, 7.0), (300, 6.0), (360, 8.0)]);

        let result = Correlator::default().correlate(&cpu, nodes, &power).unwrap();

        let matched: Vec<(i64, i64, f64)> = result
            .pairs
            .iter()
            .map(|p| (p.cpu.timestamp, p.power.timestamp, p.power.power))
            .collect();
        assert_eq!(matched, vec![(100, 90, 5.0), (340, 360, 8.0)]);
        assert_eq!(result.nodes[&1].power, vec![5.0]);
        assert_eq!(result.nodes[&2].power, vec![8.0]);
        assert_eq!(result.categories.user_code, vec![1]);
        assert_eq!(result.categories.npm_dependency["express"], vec![2]);

        let a = &result.stats.filtered_assignments;
        assert_eq!(a.min_delta, Some(10));
        assert_eq!(a.max_delta, Some(20));
        assert_eq!(a.avg_delta, Some(15.0));
        assert_eq!(a.reused, 0);
        assert_eq!(result.stats.sensor_start, Some(90));
        assert_eq!(result.stats.sensor_end, Some(360));
    }

    #[test]
    fn filtered_outlier_is_never_matched() {
        let cpu = vec![CpuSample { timestamp: 150, node_id: 1 }];
        let power = power(&[(90, 5.0), (150, 999.0), (300, 6.0)]);
        let result = Correlator::default()
            .correlate(&cpu, vec![node(1, "")], &power)
            .unwrap();
        assert_eq!(result.pairs[0].power.timestamp, 90);
        assert_eq!(result.stats.dropped_outliers, 1);
        assert_eq!(result.stats.raw_assignments.min_delta, Some(0));
        assert_eq!(result.stats.power_pre_filter.count, 3);
        assert_eq!(result.stats.power_post_filter.count, 2);
        assert_eq!(result.categories.system, vec![1]);
    }

    #[test]
    fn reused_estimates_and_orphans_are_counted() {
        let cpu = vec![
            CpuSample { timestamp: 10, node_id: 1 },
            CpuSample { timestamp: 11, node_id: 1 },
            CpuSample { timestamp: 12, node_id: 7 },
        ];
        let result = Correlator::default()
            .fit_distributions(false)
            .correlate(&cpu, vec![node(1, "node:fs")], &power(&[(10, 3.0), (500, 4.0)]))
            .unwrap();
        assert_eq!(result.stats.filtered_assignments.reused, 2);
        assert_eq!(result.stats.orphan_samples, 1);
        assert_eq!(result.nodes[&1].power, vec![3.0, 3.0]);
        assert_eq!(result.categories.node_core["node:fs"], vec![1]);
    }

    #[test]
    fn empty_series_is_a_correlation_error() {
        let cpu = vec![CpuSample { timestamp: 1, node_id: 1 }];
        let c = Correlator::default();
        assert!(matches!(
            c.correlate(&cpu, vec![], &[]),
            Err(Error::Correlation { .. })
        ));
        assert!(matches!(
            c.correlate(&[], vec![], &power(&[(1, 1.0)])),
            Err(Error::Correlation { .. })
        ));
        assert!(matches!(
            c.correlate(&cpu, vec![], &power(&[(1, 900.0)])),
            Err(Error::Correlation { .. })
        ));
    }
}
