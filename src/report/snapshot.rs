use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Op;
use crate::error::{AuditError, Result};
use crate::probe::ProbeResultKind;
use crate::runner::TestResults;

/// Current snapshot file format version.
pub const SNAPSHOT_FORMAT_VERSION: &str = "1";

/// A run's probe matrix flattened for durable storage.
///
/// Persisted as pretty JSON over ordered maps: key order is stable across
/// round-trips and the file stays diffable by a human when the engine's own
/// diff output is not enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// Format version for forward compatibility.
    pub format_version: String,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
    /// `tableKey → scenario → op → outcome`.
    pub results: BTreeMap<String, BTreeMap<String, BTreeMap<Op, ProbeResultKind>>>,
}

impl PolicySnapshot {
    /// Reduce a test run to snapshot shape.
    pub fn from_test_results(results: &TestResults) -> Self {
        let mut matrix: BTreeMap<String, BTreeMap<String, BTreeMap<Op, ProbeResultKind>>> =
            BTreeMap::new();
        for result in &results.results {
            matrix
                .entry(result.table_key.clone())
                .or_default()
                .entry(result.scenario_name.clone())
                .or_default()
                .insert(result.op, result.actual);
        }
        PolicySnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION.to_string(),
            created_at: Utc::now(),
            results: matrix,
        }
    }

    /// Write the snapshot as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| {
            AuditError::Configuration(format!("Failed to serialize snapshot: {e}"))
        })?;
        std::fs::write(path, json).map_err(|e| {
            AuditError::Configuration(format!("Failed to write {}: {e}", path.display()))
        })
    }

    /// Read a snapshot back from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AuditError::Configuration(format!("Failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            AuditError::Configuration(format!("Invalid snapshot {}: {e}", path.display()))
        })
    }
}

/// One changed cell between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDelta {
    /// Table key of the changed cell.
    pub table_key: String,
    /// Scenario of the changed cell.
    pub scenario: String,
    /// Operation of the changed cell.
    pub op: Op,
    /// Previous outcome; `None` when the cell is new.
    pub previous: Option<ProbeResultKind>,
    /// Current outcome.
    pub current: ProbeResultKind,
}

impl fmt::Display for SnapshotDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.previous {
            Some(previous) => write!(
                f,
                "{} -> {} -> {} (changed from {} to {})",
                self.table_key, self.scenario, self.op, previous, self.current
            ),
            None => write!(
                f,
                "{} -> {} -> {} (newly introduced: {})",
                self.table_key, self.scenario, self.op, self.current
            ),
        }
    }
}

/// Classified differences between a previous and a current snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotComparisonResult {
    /// DENY → ALLOW transitions. Critical: something opened up.
    pub leaks: Vec<SnapshotDelta>,
    /// Any other change between known cells.
    pub regressions: Vec<SnapshotDelta>,
    /// Cells present now but absent before.
    pub newly_introduced: Vec<SnapshotDelta>,
}

impl SnapshotComparisonResult {
    /// True when nothing changed at all.
    pub fn is_identical(&self) -> bool {
        self.leaks.is_empty() && self.regressions.is_empty() && self.newly_introduced.is_empty()
    }

    /// Exit signal: leaks fail the run; everything else is informational.
    pub fn exit_code(&self) -> i32 {
        if self.leaks.is_empty() {
            0
        } else {
            1
        }
    }
}

/// Compare a previous snapshot against the current one.
///
/// Iterates the current matrix in key order, so the output is deterministic
/// for identical inputs.
pub fn diff_snapshots(
    previous: &PolicySnapshot,
    current: &PolicySnapshot,
) -> SnapshotComparisonResult {
    let mut comparison = SnapshotComparisonResult::default();

    for (table_key, scenarios) in &current.results {
        for (scenario, ops) in scenarios {
            for (op, current_kind) in ops {
                let previous_kind = previous
                    .results
                    .get(table_key)
                    .and_then(|s| s.get(scenario))
                    .and_then(|o| o.get(op))
                    .copied();

                let delta = SnapshotDelta {
                    table_key: table_key.clone(),
                    scenario: scenario.clone(),
                    op: *op,
                    previous: previous_kind,
                    current: *current_kind,
                };

                match previous_kind {
                    None => comparison.newly_introduced.push(delta),
                    Some(kind) if kind == *current_kind => {}
                    Some(ProbeResultKind::Deny) if *current_kind == ProbeResultKind::Allow => {
                        comparison.leaks.push(delta);
                    }
                    Some(_) => comparison.regressions.push(delta),
                }
            }
        }
    }

    comparison
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cells: &[(&str, &str, Op, ProbeResultKind)]) -> PolicySnapshot {
        let mut results: BTreeMap<String, BTreeMap<String, BTreeMap<Op, ProbeResultKind>>> =
            BTreeMap::new();
        for (table, scenario, op, kind) in cells {
            results
                .entry((*table).to_string())
                .or_default()
                .entry((*scenario).to_string())
                .or_default()
                .insert(*op, *kind);
        }
        PolicySnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION.to_string(),
            created_at: Utc::now(),
            results,
        }
    }

    #[test]
    fn deny_to_allow_is_a_leak_with_the_documented_text() {
        let previous = snapshot(&[("public.posts", "anonymous", Op::Select, ProbeResultKind::Deny)]);
        let current = snapshot(&[("public.posts", "anonymous", Op::Select, ProbeResultKind::Allow)]);

        let comparison = diff_snapshots(&previous, &current);
        assert_eq!(comparison.leaks.len(), 1);
        assert!(comparison.regressions.is_empty());
        assert!(!comparison.is_identical());
        assert_eq!(comparison.exit_code(), 1);
        assert_eq!(
            comparison.leaks[0].to_string(),
            "public.posts -> anonymous -> SELECT (changed from DENY to ALLOW)"
        );
    }

    #[test]
    fn allow_to_deny_is_a_regression_not_a_leak() {
        let previous = snapshot(&[("public.posts", "owner", Op::Update, ProbeResultKind::Allow)]);
        let current = snapshot(&[("public.posts", "owner", Op::Update, ProbeResultKind::Deny)]);

        let comparison = diff_snapshots(&previous, &current);
        assert!(comparison.leaks.is_empty());
        assert_eq!(comparison.regressions.len(), 1);
        assert_eq!(comparison.exit_code(), 0);
    }

    #[test]
    fn absent_previous_cell_is_newly_introduced() {
        let previous = snapshot(&[]);
        let current = snapshot(&[("public.posts", "anonymous", Op::Select, ProbeResultKind::Deny)]);

        let comparison = diff_snapshots(&previous, &current);
        assert_eq!(comparison.newly_introduced.len(), 1);
        assert!(comparison.leaks.is_empty());
        assert_eq!(
            comparison.newly_introduced[0].to_string(),
            "public.posts -> anonymous -> SELECT (newly introduced: DENY)"
        );
    }

    #[test]
    fn identical_snapshots_produce_no_deltas() {
        let cells = [
            ("public.posts", "anonymous", Op::Select, ProbeResultKind::Deny),
            ("public.todos", "owner", Op::Insert, ProbeResultKind::Allow),
        ];
        let comparison = diff_snapshots(&snapshot(&cells), &snapshot(&cells));
        assert!(comparison.is_identical());
        assert_eq!(comparison.exit_code(), 0);
    }

    #[test]
    fn diff_is_antisymmetric_on_allow_deny_transitions() {
        let a = snapshot(&[("public.posts", "anonymous", Op::Select, ProbeResultKind::Deny)]);
        let b = snapshot(&[("public.posts", "anonymous", Op::Select, ProbeResultKind::Allow)]);

        let forward = diff_snapshots(&a, &b);
        let backward = diff_snapshots(&b, &a);

        assert_eq!(forward.leaks.len(), 1);
        assert_eq!(backward.regressions.len(), 1);
        assert_eq!(forward.leaks[0].table_key, backward.regressions[0].table_key);
        assert_eq!(forward.leaks[0].op, backward.regressions[0].op);
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("temp dir should create");
        let path = dir.path().join("snapshot.json");

        let original = snapshot(&[
            ("public.posts", "anonymous", Op::Select, ProbeResultKind::Deny),
            ("public.todos", "owner", Op::Delete, ProbeResultKind::Skipped),
            ("storage:avatars", "anonymous", Op::Select, ProbeResultKind::Allow),
        ]);
        original.save(&path).expect("snapshot should save");

        let loaded = PolicySnapshot::load(&path).expect("snapshot should load");
        assert_eq!(loaded.format_version, SNAPSHOT_FORMAT_VERSION);
        assert_eq!(loaded.results, original.results);
        assert!(diff_snapshots(&original, &loaded).is_identical());
    }

    #[test]
    fn loading_garbage_reports_the_path() {
        let dir = tempfile::tempdir().expect("temp dir should create");
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "not json").expect("write should succeed");

        let err = PolicySnapshot::load(&path).expect_err("garbage should fail");
        assert!(err.to_string().contains("broken.json"));
    }
}
