//! Projections of probe results: per-table coverage matrices and durable
//! snapshots with security-aware diffing.

mod coverage;
mod snapshot;

pub use coverage::{build_coverage, CoverageReport, TableCoverage};
pub use snapshot::{
    diff_snapshots, PolicySnapshot, SnapshotComparisonResult, SnapshotDelta,
    SNAPSHOT_FORMAT_VERSION,
};
