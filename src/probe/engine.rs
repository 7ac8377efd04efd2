use sqlx::postgres::{PgConnection, PgPool};
use sqlx::Row;

use crate::config::{Op, Scenario};
use crate::db::{self, ColumnInfo};
use crate::error::Result;
use crate::probe::classify::report_from_sql_error;
use crate::probe::values::build_insert_sql;
use crate::probe::{quote_ident, quote_table, ProbeOutcome, ProbeReport};

/// What a probe targets: a regular table, or one bucket's rows within
/// `storage.objects`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeSubject {
    /// A base table.
    Table {
        /// Schema of the table.
        schema: String,
        /// Name of the table.
        name: String,
    },
    /// One storage bucket, probed through `storage.objects` with a
    /// `bucket_id` filter.
    Bucket {
        /// The bucket id used as the filter value.
        bucket_id: String,
    },
}

impl ProbeSubject {
    /// Schema of the relation actually touched.
    pub fn schema(&self) -> &str {
        match self {
            ProbeSubject::Table { schema, .. } => schema,
            ProbeSubject::Bucket { .. } => "storage",
        }
    }

    /// Name of the relation actually touched.
    pub fn relation(&self) -> &str {
        match self {
            ProbeSubject::Table { name, .. } => name,
            ProbeSubject::Bucket { .. } => "objects",
        }
    }

    /// The `bucket_id` filter value for storage probes.
    pub fn bucket_filter(&self) -> Option<&str> {
        match self {
            ProbeSubject::Table { .. } => None,
            ProbeSubject::Bucket { bucket_id } => Some(bucket_id),
        }
    }
}

/// Column and primary-key layout of a probed relation.
///
/// Fetched once per relation by the orchestrator and shared across that
/// relation's scenarios, since the layout cannot change mid-run.
#[derive(Debug, Clone)]
pub struct TableShape {
    /// Columns in ordinal order.
    pub columns: Vec<ColumnInfo>,
    /// Primary-key column names; empty when the relation has none.
    pub primary_key: Vec<String>,
}

/// Fetch the shape of one relation.
pub async fn fetch_table_shape(pool: &PgPool, schema: &str, table: &str) -> Result<TableShape> {
    let columns = db::table_columns(pool, schema, table).await?;
    let primary_key = db::primary_key_columns(pool, schema, table).await?;
    Ok(TableShape {
        columns,
        primary_key,
    })
}

/// Executes contained probes against a pool.
///
/// Each probe runs on its own pooled connection inside one transaction:
/// identity is installed with transaction-local scope, the operation is
/// attempted under a savepoint, and both the savepoint and the transaction
/// are rolled back unconditionally. Either rollback alone guarantees no
/// persisted side-effects; doing both defends against driver-level bugs.
#[derive(Debug, Clone)]
pub struct ProbeEngine {
    pool: PgPool,
}

impl ProbeEngine {
    /// Build an engine over an already-gatekept pool.
    pub fn new(pool: PgPool) -> Self {
        ProbeEngine { pool }
    }

    /// Probe one `(subject, op)` pair under one scenario's claims.
    ///
    /// Never fails: every failure mode folds into the returned report.
    ///
    /// Boxed explicitly (rather than left as a plain `async fn`) to sidestep
    /// a rustc HRTB inference limitation: nesting this many independently
    /// elided reference parameters under a `&self` async method, then
    /// requiring the caller's future to be `Send` (via `tokio::spawn`),
    /// trips a false "implementation is not general enough" error.
    pub fn probe<'a>(
        &'a self,
        subject: &'a ProbeSubject,
        shape: &'a TableShape,
        op: Op,
        scenario: &'a Scenario,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ProbeReport> + Send + 'a>> {
        Box::pin(probe_inner(self.pool.clone(), subject, shape, op, scenario))
    }
}

async fn probe_inner<'a>(
    pool: PgPool,
    subject: &'a ProbeSubject,
    shape: &'a TableShape,
    op: Op,
    scenario: &'a Scenario,
) -> ProbeReport {
    // Mutations need a primary key to target a single row; without one
    // the probe cannot tell its own write apart from collateral damage.
    if matches!(op, Op::Update | Op::Delete) && shape.primary_key.is_empty() {
        return ProbeReport::plain(ProbeOutcome::Skipped {
            reason: "no primary key; mutation probe would be ambiguous".to_string(),
        });
    }

    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            return ProbeReport::plain(ProbeOutcome::Error {
                reason: format!("failed to begin probe transaction: {e}"),
            })
        }
    };

    if let Err(e) = Box::pin(install_identity(&mut *tx, scenario)).await {
        // The transaction drops here and rolls back on return.
        return ProbeReport::plain(ProbeOutcome::Error {
            reason: format!("failed to install probe identity: {e}"),
        });
    }

    if let Err(e) = Box::pin(sqlx::raw_sql("SAVEPOINT test_probe").execute(&mut *tx)).await {
        return ProbeReport::plain(ProbeOutcome::Error {
            reason: format!("failed to establish savepoint: {e}"),
        });
    }

    let report = match op {
        Op::Select => Box::pin(attempt_select(&mut *tx, subject)).await,
        Op::Insert => Box::pin(attempt_insert(&mut *tx, subject, shape)).await,
        Op::Update | Op::Delete => Box::pin(attempt_mutation(&mut *tx, subject, shape, op)).await,
    };

    if let Err(e) =
        Box::pin(sqlx::raw_sql("ROLLBACK TO SAVEPOINT test_probe").execute(&mut *tx)).await
    {
        tracing::warn!(error = %e, "savepoint rollback failed; transaction rollback still pending");
    }
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "transaction rollback failed; server aborts the transaction on disconnect");
    }

    tracing::trace!(
        subject = ?subject,
        op = %op,
        scenario = %scenario.name,
        outcome = %report.outcome.kind(),
        "probe complete"
    );
    report
}

/// Install the simulated caller inside the transaction.
///
/// Claims go into the `request.jwt.claims` GUC; the session role becomes
/// `authenticated` or `anon`; a non-authenticated claim role is also written
/// through the `role` GUC for policies that read that form. All three are
/// transaction-local and cannot leak to the next pool user.
async fn install_identity(
    tx: &mut PgConnection,
    scenario: &Scenario,
) -> std::result::Result<(), sqlx::Error> {
    let claims_json = serde_json::Value::Object(scenario.jwt_claims.clone()).to_string();
    sqlx::query("SELECT set_config('request.jwt.claims', $1, true)")
        .bind(&claims_json)
        .execute(&mut *tx)
        .await?;

    let set_role = format!("SET LOCAL ROLE {}", quote_ident(scenario.session_role()));
    sqlx::raw_sql(&set_role).execute(&mut *tx).await?;

    if let Some(role) = scenario.guc_role() {
        sqlx::query("SELECT set_config('role', $1, true)")
            .bind(role)
            .execute(&mut *tx)
            .await?;
    }
    Ok(())
}

async fn attempt_select(
    tx: &mut PgConnection,
    subject: &ProbeSubject,
) -> ProbeReport {
    let target = quote_table(subject.schema(), subject.relation());
    let result = match subject.bucket_filter() {
        Some(bucket_id) => {
            let sql = format!("SELECT * FROM {target} WHERE \"bucket_id\" = $1 LIMIT 1");
            sqlx::query(&sql).bind(bucket_id).fetch_all(&mut *tx).await
        }
        None => {
            let sql = format!("SELECT * FROM {target} LIMIT 1");
            sqlx::query(&sql).fetch_all(&mut *tx).await
        }
    };

    match result {
        Ok(rows) if rows.is_empty() => ProbeReport::plain(ProbeOutcome::Deny),
        Ok(_) => ProbeReport::plain(ProbeOutcome::Allow),
        Err(e) => report_from_sql_error(&e),
    }
}

async fn attempt_insert(
    tx: &mut PgConnection,
    subject: &ProbeSubject,
    shape: &TableShape,
) -> ProbeReport {
    let mut overrides: Vec<(&str, String)> = Vec::new();
    if let Some(bucket_id) = subject.bucket_filter() {
        overrides.push(("bucket_id", format!("'{}'", bucket_id.replace('\'', "''"))));
    }
    let sql = build_insert_sql(
        subject.schema(),
        subject.relation(),
        &shape.columns,
        &overrides,
    );

    match sqlx::query(&sql).execute(&mut *tx).await {
        Ok(_) => ProbeReport::plain(ProbeOutcome::Allow),
        Err(e) => report_from_sql_error(&e),
    }
}

async fn attempt_mutation(
    tx: &mut PgConnection,
    subject: &ProbeSubject,
    shape: &TableShape,
    op: Op,
) -> ProbeReport {
    let target = quote_table(subject.schema(), subject.relation());
    let pk = quote_ident(&shape.primary_key[0]);

    // Find one row visible under the active claims. An empty result cannot
    // be told apart from a deny, and a caller that cannot see a row cannot
    // modify it, so both classify DENY.
    let lookup = match subject.bucket_filter() {
        Some(bucket_id) => {
            let sql = format!(
                "SELECT {pk}::text AS pk_value FROM {target} WHERE \"bucket_id\" = $1 LIMIT 1"
            );
            sqlx::query(&sql)
                .bind(bucket_id)
                .fetch_optional(&mut *tx)
                .await
        }
        None => {
            let sql = format!("SELECT {pk}::text AS pk_value FROM {target} LIMIT 1");
            sqlx::query(&sql).fetch_optional(&mut *tx).await
        }
    };

    let row = match lookup {
        Ok(Some(row)) => row,
        Ok(None) => return ProbeReport::plain(ProbeOutcome::Deny),
        Err(e) => return report_from_sql_error(&e),
    };
    let pk_value: String = row.get("pk_value");

    let result = match (op, subject.bucket_filter()) {
        (Op::Update, None) => {
            let sql = format!("UPDATE {target} SET {pk} = {pk} WHERE {pk}::text = $1");
            sqlx::query(&sql).bind(&pk_value).execute(&mut *tx).await
        }
        (Op::Update, Some(bucket_id)) => {
            let sql = format!(
                "UPDATE {target} SET {pk} = {pk} WHERE {pk}::text = $1 AND \"bucket_id\" = $2"
            );
            sqlx::query(&sql)
                .bind(&pk_value)
                .bind(bucket_id)
                .execute(&mut *tx)
                .await
        }
        (Op::Delete, None) => {
            let sql = format!("DELETE FROM {target} WHERE {pk}::text = $1");
            sqlx::query(&sql).bind(&pk_value).execute(&mut *tx).await
        }
        (Op::Delete, Some(bucket_id)) => {
            let sql = format!(
                "DELETE FROM {target} WHERE {pk}::text = $1 AND \"bucket_id\" = $2"
            );
            sqlx::query(&sql)
                .bind(&pk_value)
                .bind(bucket_id)
                .execute(&mut *tx)
                .await
        }
        (Op::Select | Op::Insert, _) => unreachable!("mutation attempt called for {op}"),
    };

    match result {
        Ok(done) if done.rows_affected() > 0 => ProbeReport::plain(ProbeOutcome::Allow),
        Ok(_) => ProbeReport::plain(ProbeOutcome::Deny),
        Err(e) => report_from_sql_error(&e),
    }
}
