use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::Op;
use crate::db::TableMeta;
use crate::probe::ProbeResultKind;
use crate::runner::ProbeRecord;

/// Observed access for one table, per caller kind and operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableCoverage {
    /// Whether RLS is enabled on the table.
    pub rls_enabled: bool,
    /// `anonymous` / `authenticated` → op → outcome.
    pub access: BTreeMap<String, BTreeMap<Op, ProbeResultKind>>,
}

/// The full access matrix, sorted by `(schema, name)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageReport {
    /// Per-table coverage keyed by `schema.name`.
    pub tables: BTreeMap<String, TableCoverage>,
    /// Critical findings attached to the matrix (RLS-disabled tables).
    pub critical_warnings: Vec<String>,
}

/// Project probe records into the coverage matrix.
///
/// Tables with RLS disabled were never probed; they get synthetic full-ALLOW
/// rows because grants alone gate them, plus a critical warning.
pub fn build_coverage(records: &[ProbeRecord], tables: &[TableMeta]) -> CoverageReport {
    let mut report = CoverageReport::default();

    for table in tables {
        let key = table.table_key();
        if !table.rls_enabled {
            let full_allow: BTreeMap<Op, ProbeResultKind> = Op::ALL
                .into_iter()
                .map(|op| (op, ProbeResultKind::Allow))
                .collect();
            let mut access = BTreeMap::new();
            access.insert("anonymous".to_string(), full_allow.clone());
            access.insert("authenticated".to_string(), full_allow);
            report.tables.insert(
                key.clone(),
                TableCoverage {
                    rls_enabled: false,
                    access,
                },
            );
            report
                .critical_warnings
                .push(format!("{key}: row-level security disabled, all access allowed"));
            continue;
        }

        report.tables.insert(
            key,
            TableCoverage {
                rls_enabled: true,
                access: BTreeMap::new(),
            },
        );
    }

    for record in records {
        let Some(coverage) = report.tables.get_mut(&record.table_key) else {
            continue;
        };
        coverage
            .access
            .entry(record.scenario_name.clone())
            .or_default()
            .insert(record.op, record.report.outcome.kind());
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeOutcome, ProbeReport};

    fn table(schema: &str, name: &str, rls_enabled: bool) -> TableMeta {
        TableMeta {
            schema: schema.to_string(),
            name: name.to_string(),
            rls_enabled,
            rls_forced: false,
            policies: Vec::new(),
        }
    }

    fn record(table_key: &str, scenario: &str, op: Op, outcome: ProbeOutcome) -> ProbeRecord {
        ProbeRecord {
            table_key: table_key.to_string(),
            scenario_name: scenario.to_string(),
            op,
            report: ProbeReport::plain(outcome),
            duration_ms: 1,
        }
    }

    #[test]
    fn rls_disabled_tables_get_synthetic_full_allow() {
        let tables = vec![table("public", "orders", false)];
        let report = build_coverage(&[], &tables);

        let coverage = &report.tables["public.orders"];
        assert!(!coverage.rls_enabled);
        for caller in ["anonymous", "authenticated"] {
            let row = &coverage.access[caller];
            assert_eq!(row.len(), 4);
            assert!(row.values().all(|kind| *kind == ProbeResultKind::Allow));
        }
        assert_eq!(report.critical_warnings.len(), 1);
        assert!(report.critical_warnings[0].contains("public.orders"));
    }

    #[test]
    fn probe_records_populate_the_matrix() {
        let tables = vec![table("public", "todos", true)];
        let records = vec![
            record("public.todos", "anonymous", Op::Select, ProbeOutcome::Deny),
            record("public.todos", "authenticated", Op::Select, ProbeOutcome::Allow),
            record(
                "public.todos",
                "authenticated",
                Op::Update,
                ProbeOutcome::Skipped {
                    reason: "no primary key".to_string(),
                },
            ),
        ];
        let report = build_coverage(&records, &tables);

        let coverage = &report.tables["public.todos"];
        assert!(coverage.rls_enabled);
        assert_eq!(
            coverage.access["anonymous"][&Op::Select],
            ProbeResultKind::Deny
        );
        assert_eq!(
            coverage.access["authenticated"][&Op::Select],
            ProbeResultKind::Allow
        );
        assert_eq!(
            coverage.access["authenticated"][&Op::Update],
            ProbeResultKind::Skipped
        );
        assert!(report.critical_warnings.is_empty());
    }

    #[test]
    fn tables_sort_by_schema_then_name() {
        let tables = vec![
            table("public", "zebra", true),
            table("app", "alpha", true),
            table("public", "alpha", true),
        ];
        let report = build_coverage(&[], &tables);
        let keys: Vec<&String> = report.tables.keys().collect();
        assert_eq!(keys, vec!["app.alpha", "public.alpha", "public.zebra"]);
    }
}
