use serde::{Deserialize, Serialize};

use crate::db::{PolicyCommand, PolicyInfo, TableMeta};
use crate::lint::{LintIssue, Severity};

/// Linter findings over every policy in scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LintResults {
    /// Findings sorted by severity, then policy.
    pub issues: Vec<LintIssue>,
}

impl LintResults {
    /// True when any CRITICAL or HIGH finding is present.
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

/// True when the trimmed expression is the literal constant `true`.
///
/// Deliberately a literal comparison: the linter never parses SQL, so a
/// complex expression that merely evaluates to true is out of scope.
fn is_always_true(expression: &str) -> bool {
    matches!(expression.trim(), "true" | "(true)")
}

/// Run the five policy checks over every policy of every table in scope.
pub fn lint_tables(tables: &[TableMeta]) -> LintResults {
    let mut issues = Vec::new();
    for table in tables {
        for policy in &table.policies {
            let fqn = format!("{}.{}.{}", table.schema, table.name, policy.name);
            check_policy(&fqn, policy, &mut issues);
        }
    }
    issues.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then_with(|| a.policy_fqn.cmp(&b.policy_fqn))
            .then_with(|| a.check_id.cmp(&b.check_id))
    });
    LintResults { issues }
}

fn check_policy(fqn: &str, policy: &PolicyInfo, issues: &mut Vec<LintIssue>) {
    if let Some(using) = &policy.using_expression {
        if is_always_true(using) {
            issues.push(LintIssue {
                severity: Severity::Critical,
                check_id: "ALWAYS_TRUE_USING".to_string(),
                policy_fqn: fqn.to_string(),
                issue_text: "USING (true) grants unconditional row visibility".to_string(),
                expression: Some(using.clone()),
                fix_hint: "Replace the constant with a predicate tied to the caller, e.g. auth.uid() = user_id".to_string(),
            });
        }
    }

    if let Some(with_check) = &policy.with_check_expression {
        if is_always_true(with_check) {
            issues.push(LintIssue {
                severity: Severity::Critical,
                check_id: "ALWAYS_TRUE_WITH_CHECK".to_string(),
                policy_fqn: fqn.to_string(),
                issue_text: "WITH CHECK (true) accepts any written row".to_string(),
                expression: Some(with_check.clone()),
                fix_hint: "Constrain written rows to the caller, e.g. WITH CHECK (auth.uid() = user_id)".to_string(),
            });
        }
    }

    if policy.command == PolicyCommand::Select {
        if let Some(using) = &policy.using_expression {
            if !is_always_true(using) && !using.contains("auth.uid()") {
                issues.push(LintIssue {
                    severity: Severity::High,
                    check_id: "NO_AUTH_UID_CHECK".to_string(),
                    policy_fqn: fqn.to_string(),
                    issue_text: "SELECT policy does not reference auth.uid(); visibility is not tied to the caller".to_string(),
                    expression: Some(using.clone()),
                    fix_hint: "Verify the policy intentionally grants caller-independent visibility".to_string(),
                });
            }
        }
    }

    if policy.roles.iter().any(|role| role == "PUBLIC") {
        issues.push(LintIssue {
            severity: Severity::Medium,
            check_id: "PERMISSIVE_FOR_ALL".to_string(),
            policy_fqn: fqn.to_string(),
            issue_text: "Policy applies to all roles (TO PUBLIC)".to_string(),
            expression: None,
            fix_hint: "Scope the policy to the roles that need it, e.g. TO authenticated".to_string(),
        });
    }

    if matches!(policy.command, PolicyCommand::Insert | PolicyCommand::Update)
        && policy.using_expression.is_some()
        && policy.with_check_expression.is_none()
    {
        issues.push(LintIssue {
            severity: Severity::Medium,
            check_id: "MISSING_WITH_CHECK".to_string(),
            policy_fqn: fqn.to_string(),
            issue_text: format!(
                "{} policy has USING but no WITH CHECK; written rows are not validated",
                policy.command
            ),
            expression: policy.using_expression.clone(),
            fix_hint: "Add a WITH CHECK clause mirroring the USING predicate".to_string(),
        });
    }
}
