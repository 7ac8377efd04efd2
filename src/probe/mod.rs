//! The probe engine: contained attempts of one SQL operation on one
//! relation under one simulated caller.

mod classify;
mod engine;
mod values;

pub use classify::{classify_db_error, DbErrorClass};
pub use engine::{fetch_table_shape, ProbeEngine, ProbeSubject, TableShape};
pub use values::{build_insert_sql, insert_value};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classified result of one probe.
///
/// `Error` and `Skipped` always carry a reason; `Allow` and `Deny` never do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The operation succeeded for this caller.
    Allow,
    /// The operation was blocked by policy (or saw no rows) for this caller.
    Deny,
    /// The probe could not be executed at all.
    Error {
        /// What prevented the probe from executing.
        reason: String,
    },
    /// The probe was not attempted for a structural reason.
    Skipped {
        /// Why the probe was structurally impossible.
        reason: String,
    },
}

impl ProbeOutcome {
    /// The bare classification, without any reason payload.
    pub fn kind(&self) -> ProbeResultKind {
        match self {
            ProbeOutcome::Allow => ProbeResultKind::Allow,
            ProbeOutcome::Deny => ProbeResultKind::Deny,
            ProbeOutcome::Error { .. } => ProbeResultKind::Error,
            ProbeOutcome::Skipped { .. } => ProbeResultKind::Skipped,
        }
    }

    /// The reason string for `Error`/`Skipped` outcomes.
    pub fn reason(&self) -> Option<&str> {
        match self {
            ProbeOutcome::Error { reason } | ProbeOutcome::Skipped { reason } => Some(reason),
            _ => None,
        }
    }
}

/// The four-way classification, as stored in results and snapshots.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeResultKind {
    /// Operation succeeded.
    Allow,
    /// Operation was denied by policy.
    Deny,
    /// Probe could not execute.
    Error,
    /// Probe was structurally impossible.
    Skipped,
}

impl fmt::Display for ProbeResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeResultKind::Allow => write!(f, "ALLOW"),
            ProbeResultKind::Deny => write!(f, "DENY"),
            ProbeResultKind::Error => write!(f, "ERROR"),
            ProbeResultKind::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// One probe's outcome plus any captured non-policy failure detail.
///
/// An operation that failed for non-policy reasons still classifies `Allow`;
/// the underlying error is preserved here so a stricter downstream consumer
/// can reclassify without re-probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    /// The classified outcome.
    pub outcome: ProbeOutcome,
    /// Underlying driver error for outcomes classified despite an error.
    pub detail: Option<String>,
}

impl ProbeReport {
    /// A report with no captured detail.
    pub fn plain(outcome: ProbeOutcome) -> Self {
        ProbeReport {
            outcome,
            detail: None,
        }
    }
}

/// Double-quote a SQL identifier for interpolation.
///
/// Schema, table, and column names are the only user-controlled input placed
/// into SQL text; everything else binds through placeholders.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{ident}\"")
}

/// Quote a schema-qualified relation.
pub(crate) fn quote_table(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_kind_and_reason_projection() {
        assert_eq!(ProbeOutcome::Allow.kind(), ProbeResultKind::Allow);
        assert_eq!(ProbeOutcome::Allow.reason(), None);
        assert_eq!(ProbeOutcome::Deny.reason(), None);

        let error = ProbeOutcome::Error {
            reason: "connection lost".to_string(),
        };
        assert_eq!(error.kind(), ProbeResultKind::Error);
        assert_eq!(error.reason(), Some("connection lost"));

        let skipped = ProbeOutcome::Skipped {
            reason: "no primary key".to_string(),
        };
        assert_eq!(skipped.kind(), ProbeResultKind::Skipped);
        assert_eq!(skipped.reason(), Some("no primary key"));
    }

    #[test]
    fn result_kind_displays_uppercase() {
        assert_eq!(ProbeResultKind::Allow.to_string(), "ALLOW");
        assert_eq!(ProbeResultKind::Skipped.to_string(), "SKIPPED");
    }

    #[test]
    fn identifiers_are_double_quoted() {
        assert_eq!(quote_ident("todos"), "\"todos\"");
        assert_eq!(quote_table("public", "todos"), "\"public\".\"todos\"");
    }
}
