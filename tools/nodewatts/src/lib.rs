//! Power profiling for Node.js web servers.
//!
//! A session runs the target server inside a perf_event cgroup, records its
//! power draw with an external hardware sensor while the project's test
//! suite drives it, and attributes that power to the call frames the
//! in-process CPU profiler sampled.

pub mod config;
pub mod correlate;
pub mod error;
pub mod formula;
pub mod model;
pub mod report;
pub mod scope;
pub mod sensor;
pub mod session;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod target;

pub use error::{Error, Result};
