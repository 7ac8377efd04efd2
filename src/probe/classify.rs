use crate::probe::{ProbeOutcome, ProbeReport};

/// How a database-reported error bears on a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorClass {
    /// SQLSTATE 42501, or a message naming `permission denied` or `policy`:
    /// the operation was blocked by RLS or grants.
    PolicyViolation,
    /// SQLSTATE 23505: the write-side check passed and the insert only
    /// collided with an existing key.
    DuplicateKey,
    /// The operation was attempted and failed for a non-policy reason.
    Other,
}

/// Classify a database error by SQLSTATE and message text.
pub fn classify_db_error(code: Option<&str>, message: &str) -> DbErrorClass {
    if code == Some("23505") {
        return DbErrorClass::DuplicateKey;
    }
    let lowered = message.to_ascii_lowercase();
    if code == Some("42501") || lowered.contains("permission denied") || lowered.contains("policy")
    {
        return DbErrorClass::PolicyViolation;
    }
    DbErrorClass::Other
}

/// Fold a driver error from an attempted operation into a probe report.
///
/// Database errors classify per the taxonomy; anything else (lost
/// connection, pool timeout, driver cancellation) means the probe itself
/// could not run and becomes `Error`.
pub(crate) fn report_from_sql_error(error: &sqlx::Error) -> ProbeReport {
    match error {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string());
            match classify_db_error(code.as_deref(), db.message()) {
                DbErrorClass::PolicyViolation => ProbeReport::plain(ProbeOutcome::Deny),
                DbErrorClass::DuplicateKey | DbErrorClass::Other => ProbeReport {
                    outcome: ProbeOutcome::Allow,
                    detail: Some(format_db_detail(code.as_deref(), db.message())),
                },
            }
        }
        other => ProbeReport::plain(ProbeOutcome::Error {
            reason: other.to_string(),
        }),
    }
}

fn format_db_detail(code: Option<&str>, message: &str) -> String {
    match code {
        Some(code) => format!("{message} (SQLSTATE {code})"),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_privilege_is_a_policy_violation() {
        assert_eq!(
            classify_db_error(Some("42501"), "permission denied for table todos"),
            DbErrorClass::PolicyViolation
        );
    }

    #[test]
    fn policy_wording_is_a_policy_violation_regardless_of_code() {
        assert_eq!(
            classify_db_error(
                Some("23514"),
                "new row violates row-level security policy for table \"todos\""
            ),
            DbErrorClass::PolicyViolation
        );
        assert_eq!(
            classify_db_error(None, "Permission denied"),
            DbErrorClass::PolicyViolation
        );
    }

    #[test]
    fn duplicate_key_outranks_message_scanning() {
        // 23505 means the write-side check already passed; the collision
        // text must not demote it to a policy violation.
        assert_eq!(
            classify_db_error(Some("23505"), "duplicate key value violates unique constraint"),
            DbErrorClass::DuplicateKey
        );
    }

    #[test]
    fn unrelated_errors_are_other() {
        assert_eq!(
            classify_db_error(Some("22P02"), "invalid input syntax for type uuid"),
            DbErrorClass::Other
        );
        assert_eq!(classify_db_error(None, "deadlock detected"), DbErrorClass::Other);
    }

    #[test]
    fn non_database_errors_become_probe_errors() {
        let report = report_from_sql_error(&sqlx::Error::PoolTimedOut);
        assert!(matches!(report.outcome, ProbeOutcome::Error { .. }));
        assert_eq!(report.detail, None);
    }
}
