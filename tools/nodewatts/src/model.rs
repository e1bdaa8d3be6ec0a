//! Records produced by the external collaborators: power estimates written
//! by the formula, and V8 CPU profiles written by the in-target agent.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    /// Microseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub sensor: String,
    pub target: String,
    /// Watts.
    pub power: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl PowerSample {
    pub fn new(timestamp: i64, target: impl Into<String>, power: f64) -> Self {
        Self {
            timestamp,
            sensor: String::new(),
            target: target.into(),
            power,
            metadata: serde_json::Value::Null,
        }
    }
}

/// A profile as `v8-profiler-next` exports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuProfile {
    #[serde(default)]
    pub title: String,
    pub start_time: i64,
    #[serde(default)]
    pub end_time: i64,
    pub nodes: Vec<ProfileNode>,
    pub samples: Vec<u32>,
    pub time_deltas: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileNode {
    pub id: u32,
    pub call_frame: CallFrame,
    #[serde(default)]
    pub hit_count: u64,
    #[serde(default)]
    pub children: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub line_number: i64,
    #[serde(default)]
    pub column_number: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSample {
    /// Profile start time plus every delta up to this sample, microseconds.
    pub timestamp: i64,
    pub node_id: u32,
}

/// A call-frame node with the power values attributed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrameNode {
    pub id: u32,
    pub url: String,
    pub function_name: String,
    pub line_number: i64,
    pub children: Vec<u32>,
    pub power: Vec<f64>,
}

impl From<&ProfileNode> for CallFrameNode {
    fn from(node: &ProfileNode) -> Self {
        Self {
            id: node.id,
            url: node.call_frame.url.clone(),
            function_name: node.call_frame.function_name.clone(),
            line_number: node.call_frame.line_number,
            children: node.children.clone(),
            power: Vec::new(),
        }
    }
}

impl CpuProfile {
    /// Samples with cumulative timestamps. Sample `i` happened
    /// `time_deltas[0..=i]` after `start_time`.
    pub fn timeline(&self) -> Vec<CpuSample> {
        let mut ts = self.start_time;
        self.samples
            .iter()
            .zip(&self.time_deltas)
            .map(|(&node_id, &delta)| {
                ts += delta;
                CpuSample {
                    timestamp: ts,
                    node_id,
                }
            })
            .collect()
    }

    pub fn call_frame_nodes(&self) -> Vec<CallFrameNode> {
        self.nodes.iter().map(CallFrameNode::from).collect()
    }
}
