use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Row;

use crate::error::{AuditError, Result};

/// Default bound on the initial connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// One DML grant held by the logged-in role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableGrant {
    /// Schema of the granted table.
    pub schema: String,
    /// Name of the granted table.
    pub table: String,
    /// `INSERT`, `UPDATE`, or `DELETE`.
    pub privilege: String,
}

/// Privilege profile of the logged-in role, captured once at startup.
#[derive(Debug, Clone)]
pub struct PrivilegeProfile {
    /// Role name reported by `current_user`.
    pub role_name: String,
    /// True when `pg_roles.rolsuper` is set.
    pub is_superuser: bool,
    /// True when the role holds CREATE on the current database.
    pub has_create_privilege: bool,
    /// True when the role holds DML grants on `information_schema` tables,
    /// which only happens for roles with blanket DML everywhere.
    pub has_global_dml: bool,
    /// Schema-qualified DML grants the role does hold.
    pub table_privileges: Vec<TableGrant>,
}

impl PrivilegeProfile {
    /// The privilege that disqualifies this role from probing, if any.
    pub fn rejection_reason(&self) -> Option<&'static str> {
        if self.is_superuser {
            Some("superuser")
        } else if self.has_global_dml {
            Some("global DML privileges")
        } else if self.has_create_privilege {
            Some("CREATE on the current database")
        } else {
            None
        }
    }
}

/// Pooled connection plus the verified identity of the logged-in role.
///
/// Construction is the only path into probing: a context exists only after
/// the privilege profile has passed the rejection policy.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pool: PgPool,
    profile: PrivilegeProfile,
}

impl ConnectionContext {
    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The verified privilege profile.
    pub fn profile(&self) -> &PrivilegeProfile {
        &self.profile
    }
}

/// Open a pool sized to `parallelism` and verify the role is safe to probe with.
///
/// A superuser bypasses RLS entirely and would report false ALLOWs; a role
/// with CREATE or blanket DML can escape transactional containment. Either
/// condition is fatal, naming the offending privilege.
pub async fn connect(
    database_url: &str,
    parallelism: u32,
    connect_timeout: Duration,
) -> Result<ConnectionContext> {
    let options = PgConnectOptions::from_str(database_url)
        .map_err(|e| AuditError::InvalidConnectionString(e.to_string()))?;

    let pool = PgPoolOptions::new()
        .max_connections(parallelism.clamp(1, 10))
        .acquire_timeout(connect_timeout)
        .connect_with(options)
        .await
        .map_err(|source| AuditError::Connection { source })?;

    let profile = fetch_privilege_profile(&pool).await?;
    tracing::debug!(
        role = %profile.role_name,
        superuser = profile.is_superuser,
        create = profile.has_create_privilege,
        global_dml = profile.has_global_dml,
        dml_grants = profile.table_privileges.len(),
        "privilege profile collected"
    );

    if let Some(privilege) = profile.rejection_reason() {
        return Err(AuditError::PrivilegeRejection {
            role: profile.role_name.clone(),
            privilege: privilege.to_string(),
        });
    }

    Ok(ConnectionContext { pool, profile })
}

async fn fetch_privilege_profile(pool: &PgPool) -> Result<PrivilegeProfile> {
    let identity = sqlx::query(
        "SELECT current_user::text AS role_name,
                COALESCE((SELECT rolsuper FROM pg_roles WHERE rolname = current_user), false)
                    AS is_superuser,
                has_database_privilege(current_user, current_database(), 'CREATE')
                    AS has_create",
    )
    .fetch_one(pool)
    .await
    .map_err(|e| AuditError::catalog("reading the role identity", e))?;

    let role_name: String = identity.get("role_name");
    let is_superuser: bool = identity.get("is_superuser");
    let has_create_privilege: bool = identity.get("has_create");

    let grant_rows = sqlx::query(
        "SELECT table_schema::text AS table_schema,
                table_name::text AS table_name,
                privilege_type::text AS privilege_type
         FROM information_schema.role_table_grants
         WHERE grantee = current_user
           AND privilege_type IN ('INSERT', 'UPDATE', 'DELETE')
         ORDER BY table_schema, table_name, privilege_type",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| AuditError::catalog("listing DML grants", e))?;

    let table_privileges: Vec<TableGrant> = grant_rows
        .iter()
        .map(|row| TableGrant {
            schema: row.get("table_schema"),
            table: row.get("table_name"),
            privilege: row.get("privilege_type"),
        })
        .collect();

    let has_global_dml = table_privileges
        .iter()
        .any(|grant| grant.schema == "information_schema");

    Ok(PrivilegeProfile {
        role_name,
        is_superuser,
        has_create_privilege,
        has_global_dml,
        table_privileges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_profile() -> PrivilegeProfile {
        PrivilegeProfile {
            role_name: "rls_probe".to_string(),
            is_superuser: false,
            has_create_privilege: false,
            has_global_dml: false,
            table_privileges: vec![TableGrant {
                schema: "public".to_string(),
                table: "todos".to_string(),
                privilege: "INSERT".to_string(),
            }],
        }
    }

    #[test]
    fn clean_profile_is_accepted() {
        assert_eq!(clean_profile().rejection_reason(), None);
    }

    #[test]
    fn superuser_outranks_other_rejections() {
        let profile = PrivilegeProfile {
            is_superuser: true,
            has_create_privilege: true,
            has_global_dml: true,
            ..clean_profile()
        };
        assert_eq!(profile.rejection_reason(), Some("superuser"));
    }

    #[test]
    fn global_dml_and_create_are_each_fatal() {
        let global = PrivilegeProfile {
            has_global_dml: true,
            ..clean_profile()
        };
        assert_eq!(global.rejection_reason(), Some("global DML privileges"));

        let create = PrivilegeProfile {
            has_create_privilege: true,
            ..clean_profile()
        };
        assert_eq!(
            create.rejection_reason(),
            Some("CREATE on the current database")
        );
    }

    #[tokio::test]
    async fn invalid_connection_string_fails_before_io() {
        let err = connect("not a url", 4, DEFAULT_CONNECT_TIMEOUT)
            .await
            .expect_err("garbage URL should fail");
        assert!(matches!(err, AuditError::InvalidConnectionString(_)));
    }
}
