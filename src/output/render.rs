use std::fmt::Write;

use crate::config::Expectation;
use crate::lint::{AuditResults, LintResults, Severity};
use crate::probe::ProbeResultKind;
use crate::report::{CoverageReport, SnapshotComparisonResult};
use crate::runner::{TestResult, TestResults};

/// Suggested corrective SQL for one failing probe.
pub fn suggest_fix(result: &TestResult) -> String {
    let table = &result.table_key;
    let op = result.op;
    match result.expected {
        Expectation::Deny => format!(
            "-- {table}: {op} succeeded for '{}' but was expected to be denied.\n\
             -- Tighten or add the {op} policy, e.g.:\n\
             -- CREATE POLICY \"{}_{}_own_rows\" ON {table} FOR {op} USING (auth.uid() = user_id);",
            result.scenario_name,
            table.replace(&['.', ':'][..], "_"),
            op.to_string().to_lowercase(),
        ),
        Expectation::Allow => format!(
            "-- {table}: {op} was denied for '{}' but was expected to succeed.\n\
             -- Add or broaden a {op} policy for this caller, e.g.:\n\
             -- CREATE POLICY \"{}_{}_access\" ON {table} FOR {op} TO authenticated USING (auth.uid() = user_id);",
            result.scenario_name,
            table.replace(&['.', ':'][..], "_"),
            op.to_string().to_lowercase(),
        ),
    }
}

/// Render a test run: counts first, then every non-passing probe.
pub fn render_test_results(results: &TestResults) -> String {
    let mut out = String::new();

    writeln!(
        out,
        "{} probes: {} passed, {} failed, {} errored, {} skipped ({} ms)",
        results.total,
        results.passed,
        results.failed,
        results.errored,
        results.skipped,
        results.duration_ms
    )
    .unwrap();

    for table in &results.rls_disabled_tables {
        writeln!(
            out,
            "CRITICAL: {table} has row-level security disabled; probes were not issued"
        )
        .unwrap();
    }

    for result in &results.results {
        if result.passed {
            continue;
        }
        let marker = match result.actual {
            ProbeResultKind::Error => "ERROR",
            ProbeResultKind::Skipped => "SKIP",
            _ if result.is_leak_candidate() => "LEAK",
            _ => "FAIL",
        };
        writeln!(
            out,
            "{marker}: {} / {} / {} expected {} got {}",
            result.table_key, result.scenario_name, result.op, result.expected, result.actual
        )
        .unwrap();
        if let Some(message) = &result.error_message {
            writeln!(out, "      {message}").unwrap();
        }
        if matches!(result.actual, ProbeResultKind::Allow | ProbeResultKind::Deny) {
            for line in suggest_fix(result).lines() {
                writeln!(out, "      {line}").unwrap();
            }
        }
    }

    out
}

/// Render lint findings grouped by severity.
pub fn render_lint_results(results: &LintResults) -> String {
    let mut out = String::new();
    writeln!(
        out,
        "{} findings: {} critical, {} high, {} medium, {} low",
        results.issues.len(),
        results.count_at(Severity::Critical),
        results.count_at(Severity::High),
        results.count_at(Severity::Medium),
        results.count_at(Severity::Low),
    )
    .unwrap();
    render_issues(&mut out, &results.issues);
    out
}

/// Render a full audit (lint + sensitive columns + RLS-disabled).
pub fn render_audit_results(results: &AuditResults) -> String {
    let mut out = String::new();
    writeln!(
        out,
        "{} findings: {} critical, {} high, {} medium, {} low",
        results.issues.len(),
        results.count_at(Severity::Critical),
        results.count_at(Severity::High),
        results.count_at(Severity::Medium),
        results.count_at(Severity::Low),
    )
    .unwrap();
    render_issues(&mut out, &results.issues);
    out
}

fn render_issues(out: &mut String, issues: &[crate::lint::LintIssue]) {
    for issue in issues {
        writeln!(
            out,
            "[{}] {} {}: {}",
            issue.severity, issue.check_id, issue.policy_fqn, issue.issue_text
        )
        .unwrap();
        if let Some(expression) = &issue.expression {
            writeln!(out, "      expression: {expression}").unwrap();
        }
        writeln!(out, "      fix: {}", issue.fix_hint).unwrap();
    }
}

/// Render the coverage matrix, one table per block.
pub fn render_coverage(report: &CoverageReport) -> String {
    let mut out = String::new();
    for warning in &report.critical_warnings {
        writeln!(out, "CRITICAL: {warning}").unwrap();
    }
    for (table_key, coverage) in &report.tables {
        writeln!(
            out,
            "{table_key} (rls {})",
            if coverage.rls_enabled { "enabled" } else { "DISABLED" }
        )
        .unwrap();
        for (caller, ops) in &coverage.access {
            let cells: Vec<String> = ops
                .iter()
                .map(|(op, kind)| format!("{op}={kind}"))
                .collect();
            writeln!(out, "  {caller}: {}", cells.join(" ")).unwrap();
        }
    }
    out
}

/// Render a snapshot comparison, leaks first.
pub fn render_diff(comparison: &SnapshotComparisonResult) -> String {
    let mut out = String::new();
    if comparison.is_identical() {
        writeln!(out, "Snapshots are identical").unwrap();
        return out;
    }

    for leak in &comparison.leaks {
        writeln!(out, "LEAK: {leak}").unwrap();
    }
    for regression in &comparison.regressions {
        writeln!(out, "CHANGE: {regression}").unwrap();
    }
    for introduced in &comparison.newly_introduced {
        writeln!(out, "NEW: {introduced}").unwrap();
    }
    writeln!(
        out,
        "{} leaks, {} changes, {} new entries",
        comparison.leaks.len(),
        comparison.regressions.len(),
        comparison.newly_introduced.len()
    )
    .unwrap();
    out
}
