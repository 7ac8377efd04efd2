//! Probe scheduling: expanding the test plan into per-table tasks, running
//! them with bounded parallelism, and aggregating the results.

mod orchestrator;
mod results;

pub use orchestrator::{
    run_coverage_probes, run_tests, CancelFlag, ProbeRecord, RunOptions,
};
pub use results::{TestResult, TestResults};
