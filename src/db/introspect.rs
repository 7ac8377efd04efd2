use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::error::{AuditError, Result};

/// Schemas never probed or linted.
const SYSTEM_SCHEMAS: [&str; 3] = ["information_schema", "pg_catalog", "pg_toast"];

/// The command a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyCommand {
    /// Policy applies to SELECT queries only.
    Select,
    /// Policy applies to INSERT statements only.
    Insert,
    /// Policy applies to UPDATE statements only.
    Update,
    /// Policy applies to DELETE statements only.
    Delete,
    /// Policy applies to all DML commands.
    All,
}

impl PolicyCommand {
    /// Decode `pg_policy.polcmd`.
    pub fn from_polcmd(cmd: &str) -> Option<PolicyCommand> {
        match cmd {
            "r" => Some(PolicyCommand::Select),
            "a" => Some(PolicyCommand::Insert),
            "w" => Some(PolicyCommand::Update),
            "d" => Some(PolicyCommand::Delete),
            "*" => Some(PolicyCommand::All),
            _ => None,
        }
    }
}

impl fmt::Display for PolicyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyCommand::Select => write!(f, "SELECT"),
            PolicyCommand::Insert => write!(f, "INSERT"),
            PolicyCommand::Update => write!(f, "UPDATE"),
            PolicyCommand::Delete => write!(f, "DELETE"),
            PolicyCommand::All => write!(f, "ALL"),
        }
    }
}

/// One policy as decompiled from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInfo {
    /// Policy name.
    pub name: String,
    /// Command the policy restricts.
    pub command: PolicyCommand,
    /// Role names the policy applies to; catalog OID 0 renders as `PUBLIC`.
    pub roles: Vec<String>,
    /// Decompiled `USING` expression, if any.
    pub using_expression: Option<String>,
    /// Decompiled `WITH CHECK` expression, if any.
    pub with_check_expression: Option<String>,
}

/// One base table with its RLS flags and policies. Immutable after discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    /// Schema the table lives in.
    pub schema: String,
    /// Table name.
    pub name: String,
    /// True when RLS is enabled on the table.
    pub rls_enabled: bool,
    /// True when RLS is forced even for the table owner.
    pub rls_forced: bool,
    /// Policies attached to the table.
    pub policies: Vec<PolicyInfo>,
}

impl TableMeta {
    /// `schema.name` key used throughout configs, results, and snapshots.
    pub fn table_key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// One storage bucket. All buckets share the policies of `storage.objects`
/// and differ only in the `bucket_id` value used as the probe filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageBucketMeta {
    /// Bucket id used as the `bucket_id` filter value.
    pub bucket_id: String,
    /// Bucket display name.
    pub name: String,
    /// True for publicly readable buckets.
    pub is_public: bool,
    /// Policies attached to `storage.objects`.
    pub policies: Vec<PolicyInfo>,
}

/// Non-fatal finding surfaced during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntrospectionWarning {
    /// A table in scope has RLS disabled; grants alone gate access to it.
    RlsDisabled {
        /// Schema of the unprotected table.
        schema: String,
        /// Name of the unprotected table.
        name: String,
    },
}

impl fmt::Display for IntrospectionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntrospectionWarning::RlsDisabled { schema, name } => {
                write!(f, "table {schema}.{name} has row-level security disabled")
            }
        }
    }
}

/// One column of a table, as seen by the INSERT probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared data type from `information_schema.columns`.
    pub data_type: String,
    /// True when the column has a default and can be omitted from INSERT.
    pub has_default: bool,
    /// True when the column accepts NULL.
    pub is_nullable: bool,
}

/// A column readable by one of the exposed roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnGrant {
    /// Schema of the granted table.
    pub schema: String,
    /// Table the column belongs to.
    pub table: String,
    /// Column name.
    pub column: String,
    /// `anon`, `authenticated`, or `PUBLIC`.
    pub grantee: String,
}

fn schema_filter(include_system_schemas: bool) -> String {
    if include_system_schemas {
        format!(
            "n.nspname NOT IN ('{}')",
            SYSTEM_SCHEMAS.join("', '")
        )
    } else {
        "n.nspname = 'public'".to_string()
    }
}

/// Enumerate base tables in scope with their policies.
///
/// Returns the discovered tables plus a warning per table with RLS disabled.
/// Those tables stay in the result set so downstream consumers can report
/// them; the warnings exist so no caller can miss them silently.
pub async fn discover_tables(
    pool: &PgPool,
    include_system_schemas: bool,
) -> Result<(Vec<TableMeta>, Vec<IntrospectionWarning>)> {
    let sql = format!(
        "SELECT n.nspname::text AS schema,
                c.relname::text AS name,
                c.relrowsecurity AS rls_enabled,
                c.relforcerowsecurity AS rls_forced
         FROM pg_class c
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE c.relkind = 'r' AND {}
         ORDER BY n.nspname, c.relname",
        schema_filter(include_system_schemas)
    );
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .map_err(|e| AuditError::catalog("enumerating base tables", e))?;

    let mut policies_by_table = fetch_policies_in_scope(pool, include_system_schemas).await?;

    let mut tables = Vec::with_capacity(rows.len());
    let mut warnings = Vec::new();
    for row in rows {
        let schema: String = row.get("schema");
        let name: String = row.get("name");
        let rls_enabled: bool = row.get("rls_enabled");
        let rls_forced: bool = row.get("rls_forced");

        if !rls_enabled {
            warnings.push(IntrospectionWarning::RlsDisabled {
                schema: schema.clone(),
                name: name.clone(),
            });
        }

        let policies = policies_by_table
            .remove(&(schema.clone(), name.clone()))
            .unwrap_or_default();
        tables.push(TableMeta {
            schema,
            name,
            rls_enabled,
            rls_forced,
            policies,
        });
    }

    tracing::debug!(
        tables = tables.len(),
        rls_disabled = warnings.len(),
        "table discovery complete"
    );
    Ok((tables, warnings))
}

async fn fetch_policies_in_scope(
    pool: &PgPool,
    include_system_schemas: bool,
) -> Result<HashMap<(String, String), Vec<PolicyInfo>>> {
    let sql = format!(
        "SELECT n.nspname::text AS schema,
                c.relname::text AS table_name,
                pol.polname::text AS name,
                pol.polcmd::text AS command,
                CASE WHEN pol.polroles = '{{0}}'::oid[] THEN ARRAY['PUBLIC']
                     ELSE ARRAY(SELECT r.rolname::text FROM pg_roles r
                                WHERE r.oid = ANY(pol.polroles) ORDER BY r.rolname)
                END AS roles,
                pg_get_expr(pol.polqual, pol.polrelid) AS using_expression,
                pg_get_expr(pol.polwithcheck, pol.polrelid) AS with_check_expression
         FROM pg_policy pol
         JOIN pg_class c ON c.oid = pol.polrelid
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE {}
         ORDER BY n.nspname, c.relname, pol.polname",
        schema_filter(include_system_schemas)
    );
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .map_err(|e| AuditError::catalog("reading policies", e))?;

    let mut by_table: HashMap<(String, String), Vec<PolicyInfo>> = HashMap::new();
    for row in rows {
        let schema: String = row.get("schema");
        let table_name: String = row.get("table_name");
        let command_code: String = row.get("command");
        let Some(command) = PolicyCommand::from_polcmd(&command_code) else {
            tracing::warn!(%schema, %table_name, %command_code, "unrecognized polcmd, skipping");
            continue;
        };
        by_table.entry((schema, table_name)).or_default().push(PolicyInfo {
            name: row.get("name"),
            command,
            roles: row.get("roles"),
            using_expression: row.get("using_expression"),
            with_check_expression: row.get("with_check_expression"),
        });
    }
    Ok(by_table)
}

/// Enumerate storage buckets, if the `storage` schema exists at all.
///
/// A database without the Supabase storage extension simply yields an empty
/// list. The `storage.objects` policy set is fetched once and shared.
pub async fn discover_storage_buckets(pool: &PgPool) -> Result<Vec<StorageBucketMeta>> {
    let schema_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM pg_namespace WHERE nspname = 'storage')",
    )
    .fetch_one(pool)
    .await
    .map_err(|e| AuditError::catalog("checking for the storage schema", e))?;
    if !schema_exists {
        return Ok(Vec::new());
    }

    let rows = sqlx::query("SELECT id::text AS id, name::text AS name, public FROM storage.buckets ORDER BY name")
        .fetch_all(pool)
        .await
        .map_err(|e| AuditError::catalog("enumerating storage buckets", e))?;

    let objects_policies = fetch_table_policies(pool, "storage", "objects").await?;

    Ok(rows
        .iter()
        .map(|row| StorageBucketMeta {
            bucket_id: row.get("id"),
            name: row.get("name"),
            is_public: row.get("public"),
            policies: objects_policies.clone(),
        })
        .collect())
}

async fn fetch_table_policies(
    pool: &PgPool,
    schema: &str,
    table: &str,
) -> Result<Vec<PolicyInfo>> {
    let rows = sqlx::query(
        "SELECT pol.polname::text AS name,
                pol.polcmd::text AS command,
                CASE WHEN pol.polroles = '{0}'::oid[] THEN ARRAY['PUBLIC']
                     ELSE ARRAY(SELECT r.rolname::text FROM pg_roles r
                                WHERE r.oid = ANY(pol.polroles) ORDER BY r.rolname)
                END AS roles,
                pg_get_expr(pol.polqual, pol.polrelid) AS using_expression,
                pg_get_expr(pol.polwithcheck, pol.polrelid) AS with_check_expression
         FROM pg_policy pol
         JOIN pg_class c ON c.oid = pol.polrelid
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = $1 AND c.relname = $2
         ORDER BY pol.polname",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await
    .map_err(|e| AuditError::catalog(format!("reading policies on {schema}.{table}"), e))?;

    let mut policies = Vec::with_capacity(rows.len());
    for row in rows {
        let command_code: String = row.get("command");
        let Some(command) = PolicyCommand::from_polcmd(&command_code) else {
            continue;
        };
        policies.push(PolicyInfo {
            name: row.get("name"),
            command,
            roles: row.get("roles"),
            using_expression: row.get("using_expression"),
            with_check_expression: row.get("with_check_expression"),
        });
    }
    Ok(policies)
}

/// Columns of one table, in ordinal order.
pub async fn table_columns(pool: &PgPool, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
    let rows = sqlx::query(
        "SELECT column_name::text AS name,
                data_type::text AS data_type,
                (column_default IS NOT NULL) AS has_default,
                (is_nullable = 'YES') AS is_nullable
         FROM information_schema.columns
         WHERE table_schema = $1 AND table_name = $2
         ORDER BY ordinal_position",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await
    .map_err(|e| AuditError::catalog(format!("reading columns of {schema}.{table}"), e))?;

    Ok(rows
        .iter()
        .map(|row| ColumnInfo {
            name: row.get("name"),
            data_type: row.get("data_type"),
            has_default: row.get("has_default"),
            is_nullable: row.get("is_nullable"),
        })
        .collect())
}

/// Primary-key column names of one table, in key order. Empty when the
/// table has no primary key.
pub async fn primary_key_columns(
    pool: &PgPool,
    schema: &str,
    table: &str,
) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT kcu.column_name::text AS column_name
         FROM information_schema.table_constraints tc
         JOIN information_schema.key_column_usage kcu
           ON kcu.constraint_name = tc.constraint_name
          AND kcu.constraint_schema = tc.constraint_schema
         WHERE tc.constraint_type = 'PRIMARY KEY'
           AND tc.table_schema = $1 AND tc.table_name = $2
         ORDER BY kcu.ordinal_position",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await
    .map_err(|e| AuditError::catalog(format!("reading the primary key of {schema}.{table}"), e))?;

    Ok(rows.iter().map(|row| row.get("column_name")).collect())
}

/// Columns readable by `anon`, `authenticated`, or `PUBLIC`, via table-level
/// or column-level SELECT grants. Input to the sensitive-column scan.
pub async fn select_column_grants(
    pool: &PgPool,
    include_system_schemas: bool,
) -> Result<Vec<ColumnGrant>> {
    let schema_clause = if include_system_schemas {
        format!("NOT IN ('{}')", SYSTEM_SCHEMAS.join("', '"))
    } else {
        "= 'public'".to_string()
    };
    let sql = format!(
        "SELECT g.table_schema::text AS schema_name,
                g.table_name::text AS table_name,
                c.column_name::text AS column_name,
                g.grantee::text AS grantee
         FROM information_schema.role_table_grants g
         JOIN information_schema.columns c
           ON c.table_schema = g.table_schema AND c.table_name = g.table_name
         WHERE g.privilege_type = 'SELECT'
           AND g.grantee IN ('anon', 'authenticated', 'PUBLIC')
           AND g.table_schema {schema_clause}
         UNION
         SELECT cp.table_schema::text,
                cp.table_name::text,
                cp.column_name::text,
                cp.grantee::text
         FROM information_schema.column_privileges cp
         WHERE cp.privilege_type = 'SELECT'
           AND cp.grantee IN ('anon', 'authenticated', 'PUBLIC')
           AND cp.table_schema {schema_clause}
         ORDER BY 1, 2, 3, 4",
    );
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .map_err(|e| AuditError::catalog("reading column grants", e))?;

    Ok(rows
        .iter()
        .map(|row| ColumnGrant {
            schema: row.get("schema_name"),
            table: row.get("table_name"),
            column: row.get("column_name"),
            grantee: row.get("grantee"),
        })
        .collect())
}
