//! Error taxonomy for connection, discovery, configuration, and probing.

/// Errors that abort a run.
///
/// The probe engine never returns these for an individual probe; probe
/// failures are folded into [`crate::probe::ProbeOutcome`]. Everything that
/// happens before probing (connecting, discovery, loading the test plan)
/// propagates through this type and stops the run.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The connection string could not be parsed as a `PostgreSQL` URL.
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// The database could not be reached or refused the login.
    #[error("database connection failed: {source}")]
    Connection {
        /// Original driver error.
        #[source]
        source: sqlx::Error,
    },

    /// The logged-in role holds a privilege that makes safe probing
    /// impossible (superuser, CREATE, or global DML).
    #[error("role '{role}' holds {privilege}; probing with it would bypass or escape RLS")]
    PrivilegeRejection {
        /// Name of the rejected role.
        role: String,
        /// Human-readable name of the offending privilege.
        privilege: String,
    },

    /// A system-catalog query failed during discovery.
    #[error("catalog query failed while {context}: {source}")]
    Catalog {
        /// What the introspector was doing when the query failed.
        context: String,
        /// Original driver error.
        #[source]
        source: sqlx::Error,
    },

    /// The policy configuration file is malformed or inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A probe failed outside the classifiable set and could not produce
    /// an outcome at all.
    #[error("probe failed: {0}")]
    Probe(String),
}

impl AuditError {
    /// Wrap a driver error raised by a catalog query.
    pub fn catalog(context: impl Into<String>, source: sqlx::Error) -> Self {
        AuditError::Catalog {
            context: context.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AuditError>;
