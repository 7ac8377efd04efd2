use std::collections::BTreeMap;

use regex::RegexSet;

use crate::db::ColumnGrant;
use crate::lint::{LintIssue, Severity};

/// Default column-name patterns that indicate sensitive data.
const DEFAULT_PATTERNS: [&str; 9] = [
    "password",
    "secret",
    "token",
    "ssn",
    "credit_card",
    "api_key",
    "private_key",
    "salary",
    "bank_account",
];

/// Name patterns the sensitive-column scan matches against.
#[derive(Debug, Clone)]
pub struct SensitiveColumnConfig {
    set: RegexSet,
}

impl SensitiveColumnConfig {
    /// The built-in pattern list plus any caller-supplied additions.
    ///
    /// Patterns match case-insensitively anywhere in the column name.
    pub fn with_extra_patterns(extra: &[String]) -> Result<Self, regex::Error> {
        let patterns: Vec<String> = DEFAULT_PATTERNS
            .iter()
            .map(|p| (*p).to_string())
            .chain(extra.iter().cloned())
            .map(|p| format!("(?i){p}"))
            .collect();
        Ok(SensitiveColumnConfig {
            set: RegexSet::new(patterns)?,
        })
    }

    /// True when the column name matches any configured pattern.
    pub fn matches(&self, column_name: &str) -> bool {
        self.set.is_match(column_name)
    }
}

impl Default for SensitiveColumnConfig {
    fn default() -> Self {
        Self::with_extra_patterns(&[]).expect("built-in patterns are valid regexes")
    }
}

/// Flag sensitive-looking columns readable by exposed roles.
///
/// One HIGH issue per column, naming every grantee that can read it.
pub fn scan_sensitive_columns(
    grants: &[ColumnGrant],
    config: &SensitiveColumnConfig,
) -> Vec<LintIssue> {
    let mut grantees_by_column: BTreeMap<(String, String, String), Vec<String>> = BTreeMap::new();
    for grant in grants {
        if !config.matches(&grant.column) {
            continue;
        }
        let key = (
            grant.schema.clone(),
            grant.table.clone(),
            grant.column.clone(),
        );
        let grantees = grantees_by_column.entry(key).or_default();
        if !grantees.contains(&grant.grantee) {
            grantees.push(grant.grantee.clone());
        }
    }

    grantees_by_column
        .into_iter()
        .map(|((schema, table, column), grantees)| LintIssue {
            severity: Severity::High,
            check_id: "SENSITIVE_COLUMN_EXPOSED".to_string(),
            policy_fqn: format!("{schema}.{table}.{column}"),
            issue_text: format!(
                "Sensitive-looking column '{column}' is readable by {}",
                grantees.join(", ")
            ),
            expression: None,
            fix_hint: format!(
                "REVOKE SELECT ({column}) ON {schema}.{table} FROM {};",
                grantees.join(", ")
            ),
        })
        .collect()
}
