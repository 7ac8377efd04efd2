//! Static policy linting: dangerous-pattern checks that never execute the
//! expressions they inspect.

mod checks;
mod sensitive;

pub use checks::{lint_tables, LintResults};
pub use sensitive::{scan_sensitive_columns, SensitiveColumnConfig};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::IntrospectionWarning;

/// Issue severity, ordered from worst to mildest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// A configuration that defeats RLS outright.
    Critical,
    /// A likely data exposure.
    High,
    /// A weak spot worth reviewing.
    Medium,
    /// Informational.
    Low,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::High => write!(f, "HIGH"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::Low => write!(f, "LOW"),
        }
    }
}

/// One finding from the linter, the sensitive-column scan, or the audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LintIssue {
    /// How bad it is.
    pub severity: Severity,
    /// Stable machine-readable check identifier.
    pub check_id: String,
    /// `schema.table.policy` (or `schema.table.column` for column findings).
    pub policy_fqn: String,
    /// Human-readable description of the finding.
    pub issue_text: String,
    /// The offending expression, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// What to do about it.
    pub fix_hint: String,
}

/// Combined static findings for an audit run: linter issues, sensitive
/// column exposures, and RLS-disabled tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditResults {
    /// All findings, sorted by severity then location.
    pub issues: Vec<LintIssue>,
}

impl AuditResults {
    /// Assemble an audit from its three finding sources.
    pub fn assemble(
        lint: LintResults,
        sensitive: Vec<LintIssue>,
        warnings: &[IntrospectionWarning],
    ) -> Self {
        let mut issues = lint.issues;
        issues.extend(sensitive);
        for warning in warnings {
            let IntrospectionWarning::RlsDisabled { schema, name } = warning;
            issues.push(LintIssue {
                severity: Severity::Critical,
                check_id: "RLS_DISABLED".to_string(),
                policy_fqn: format!("{schema}.{name}"),
                issue_text: format!(
                    "Row-level security is disabled on {schema}.{name}; grants alone gate access"
                ),
                expression: None,
                fix_hint: format!(
                    "ALTER TABLE {schema}.{name} ENABLE ROW LEVEL SECURITY;"
                ),
            });
        }
        issues.sort_by(|a, b| {
            a.severity
                .cmp(&b.severity)
                .then_with(|| a.policy_fqn.cmp(&b.policy_fqn))
                .then_with(|| a.check_id.cmp(&b.check_id))
        });
        AuditResults { issues }
    }

    /// True when any CRITICAL or HIGH finding is present (non-zero exit).
    pub fn has_blocking_issues(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.severity <= Severity::High)
    }

    /// Finding count at one severity.
    pub fn count_at(&self, severity: Severity) -> usize {
        self.issues
            .iter()
            .filter(|issue| issue.severity == severity)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_critical_first() {
        assert!(Severity::Critical < Severity::High);
        assert!(Severity::High < Severity::Medium);
        assert!(Severity::Medium < Severity::Low);
    }

    #[test]
    fn audit_includes_rls_disabled_as_critical() {
        let warnings = vec![IntrospectionWarning::RlsDisabled {
            schema: "public".to_string(),
            name: "orders".to_string(),
        }];
        let audit = AuditResults::assemble(LintResults::default(), Vec::new(), &warnings);
        assert_eq!(audit.issues.len(), 1);
        assert_eq!(audit.issues[0].check_id, "RLS_DISABLED");
        assert_eq!(audit.issues[0].severity, Severity::Critical);
        assert!(audit.has_blocking_issues());
    }

    #[test]
    fn blocking_requires_critical_or_high() {
        let audit = AuditResults {
            issues: vec![LintIssue {
                severity: Severity::Medium,
                check_id: "PERMISSIVE_FOR_ALL".to_string(),
                policy_fqn: "public.todos.p".to_string(),
                issue_text: String::new(),
                expression: None,
                fix_hint: String::new(),
            }],
        };
        assert!(!audit.has_blocking_issues());
        assert_eq!(audit.count_at(Severity::Medium), 1);
    }
}
