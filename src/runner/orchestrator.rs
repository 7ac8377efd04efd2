use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::{mpsc, Semaphore};

use crate::config::{Expectation, JwtClaims, Op, PolicyConfig, Scenario, TableTestSpec};
use crate::db::{
    self, ConnectionContext, IntrospectionWarning, StorageBucketMeta, TableMeta,
};
use crate::error::{AuditError, Result};
use crate::probe::{
    fetch_table_shape, ProbeEngine, ProbeOutcome, ProbeReport, ProbeSubject,
};
use crate::runner::results::{TestResult, TestResults};

/// Shared stop signal. Workers stop pulling tasks once it is set; in-flight
/// probes finish their rollback path before the worker exits.
pub type CancelFlag = Arc<AtomicBool>;

/// Caller-supplied knobs for a run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict the run to one table key (or bucket).
    pub target_table: Option<String>,
    /// Probe beyond the `public` schema.
    pub include_system_schemas: bool,
    /// Worker bound; clamped to `[1, 10]`.
    pub parallelism: u32,
    /// Probe as a real `auth.users` record instead of declared scenarios.
    pub as_user: Option<String>,
}

impl RunOptions {
    /// The parallelism actually applied.
    pub fn effective_parallelism(&self) -> u32 {
        self.parallelism.clamp(1, 10)
    }
}

/// One probe's raw outcome, before expectations are applied.
#[derive(Debug, Clone)]
pub struct ProbeRecord {
    /// Table key (or `storage:<bucket>`) the probe targeted.
    pub table_key: String,
    /// Scenario the probe ran under.
    pub scenario_name: String,
    /// Attempted operation.
    pub op: Op,
    /// Outcome plus captured detail.
    pub report: ProbeReport,
    /// Wall-clock duration of the probe.
    pub duration_ms: u64,
}

/// The scheduling unit: one relation with all its scenarios and ops.
///
/// Grouping per table lets the relation's shape be introspected once and
/// shared across every scenario that probes it.
struct TaskSpec {
    subject: ProbeSubject,
    table_key: String,
    probes: Vec<(Scenario, Vec<Op>)>,
}

struct Plan {
    tasks: Vec<TaskSpec>,
    /// Records produced without probing (e.g. configured tables that were
    /// never discovered).
    immediate: Vec<ProbeRecord>,
    expected: HashMap<(String, String, Op), Expectation>,
    rls_disabled: Vec<String>,
}

/// Run the declared test plan against the database.
pub async fn run_tests(
    ctx: &ConnectionContext,
    config: &PolicyConfig,
    options: &RunOptions,
    cancel: CancelFlag,
) -> Result<TestResults> {
    let started = Instant::now();
    let pool = ctx.pool().clone();

    let effective_config;
    let config = if let Some(user) = &options.as_user {
        effective_config = build_real_user_config(&pool, user, config, options).await?;
        &effective_config
    } else {
        config
    };

    let (tables, _warnings) = db::discover_tables(&pool, options.include_system_schemas).await?;
    let buckets = db::discover_storage_buckets(&pool).await?;

    let plan = build_plan(config, options, &tables, &buckets);
    let mut records = plan.immediate;
    records.extend(
        execute_tasks(
            ProbeEngine::new(pool.clone()),
            pool,
            plan.tasks,
            options.effective_parallelism(),
            cancel,
        )
        .await,
    );

    let results: Vec<TestResult> = records
        .into_iter()
        .filter_map(|record| {
            let key = (
                record.table_key.clone(),
                record.scenario_name.clone(),
                record.op,
            );
            let expected = *plan.expected.get(&key)?;
            let actual = record.report.outcome.kind();
            let error_message = record
                .report
                .outcome
                .reason()
                .map(str::to_string)
                .or(record.report.detail);
            Some(TestResult {
                table_key: record.table_key,
                scenario_name: record.scenario_name,
                op: record.op,
                expected,
                actual,
                passed: TestResult::expectation_met(expected, actual),
                error_message,
                duration_ms: record.duration_ms,
            })
        })
        .collect();

    Ok(TestResults::aggregate(
        results,
        plan.rls_disabled,
        started.elapsed().as_millis() as u64,
    ))
}

/// Probe every discovered RLS-enabled table as both built-in callers.
///
/// Feeds the coverage builder: anonymous (empty claims) and authenticated
/// (role claim plus a fresh `sub`) across all four operations. Tables with
/// RLS disabled are not probed; the coverage builder synthesizes their rows.
pub async fn run_coverage_probes(
    ctx: &ConnectionContext,
    options: &RunOptions,
    cancel: CancelFlag,
) -> Result<(Vec<ProbeRecord>, Vec<TableMeta>, Vec<IntrospectionWarning>)> {
    let pool = ctx.pool().clone();
    let (tables, warnings) = db::discover_tables(&pool, options.include_system_schemas).await?;

    let tasks: Vec<TaskSpec> = tables
        .iter()
        .filter(|table| table.rls_enabled)
        .filter(|table| match &options.target_table {
            Some(target) => table.table_key() == *target,
            None => true,
        })
        .map(|table| TaskSpec {
            subject: ProbeSubject::Table {
                schema: table.schema.clone(),
                name: table.name.clone(),
            },
            table_key: table.table_key(),
            probes: coverage_scenarios()
                .into_iter()
                .map(|scenario| (scenario, Op::ALL.to_vec()))
                .collect(),
        })
        .collect();

    let records = execute_tasks(
        ProbeEngine::new(pool.clone()),
        pool,
        tasks,
        options.effective_parallelism(),
        cancel,
    )
    .await;

    Ok((records, tables, warnings))
}

fn coverage_scenarios() -> Vec<Scenario> {
    let mut authenticated_claims = JwtClaims::new();
    authenticated_claims.insert(
        "role".to_string(),
        serde_json::Value::String("authenticated".to_string()),
    );
    authenticated_claims.insert(
        "sub".to_string(),
        serde_json::Value::String(uuid::Uuid::new_v4().to_string()),
    );
    vec![
        Scenario {
            name: "anonymous".to_string(),
            jwt_claims: JwtClaims::new(),
            expected: Default::default(),
        },
        Scenario {
            name: "authenticated".to_string(),
            jwt_claims: authenticated_claims,
            expected: Default::default(),
        },
    ]
}

fn build_plan(
    config: &PolicyConfig,
    options: &RunOptions,
    tables: &[TableMeta],
    buckets: &[StorageBucketMeta],
) -> Plan {
    let discovered: HashMap<String, &TableMeta> = tables
        .iter()
        .map(|table| (table.table_key(), table))
        .collect();
    let bucket_ids: HashMap<&str, &str> = buckets
        .iter()
        .map(|bucket| (bucket.name.as_str(), bucket.bucket_id.as_str()))
        .collect();

    let mut plan = Plan {
        tasks: Vec::new(),
        immediate: Vec::new(),
        expected: HashMap::new(),
        rls_disabled: Vec::new(),
    };

    for (table_key, spec) in &config.tables {
        if let Some(target) = &options.target_table {
            if table_key != target {
                continue;
            }
        }
        if !options.include_system_schemas && !table_key.starts_with("public.") {
            continue;
        }

        let probes = expand_probes(config, spec, table_key, &mut plan.expected);
        if probes.is_empty() {
            continue;
        }

        match discovered.get(table_key) {
            None => {
                skip_all(&mut plan.immediate, table_key, &probes, "table not found during discovery");
            }
            Some(table) if !table.rls_enabled => {
                // Probing an unprotected table would write through; the
                // observable semantic (full allow) needs no probe to learn.
                plan.rls_disabled.push(table_key.clone());
            }
            Some(table) => {
                plan.tasks.push(TaskSpec {
                    subject: ProbeSubject::Table {
                        schema: table.schema.clone(),
                        name: table.name.clone(),
                    },
                    table_key: table_key.clone(),
                    probes,
                });
            }
        }
    }

    for (bucket_name, spec) in &config.storage_buckets {
        let bucket_key = format!("storage:{bucket_name}");
        if let Some(target) = &options.target_table {
            if target != bucket_name && *target != bucket_key {
                continue;
            }
        }

        let table_spec = TableTestSpec {
            test_scenarios: spec.test_scenarios.clone(),
            custom_operations: spec.custom_operations.clone(),
        };
        let probes = expand_probes(config, &table_spec, &bucket_key, &mut plan.expected);
        if probes.is_empty() {
            continue;
        }

        match bucket_ids.get(bucket_name.as_str()) {
            None => {
                skip_all(&mut plan.immediate, &bucket_key, &probes, "bucket not found during discovery");
            }
            Some(bucket_id) => {
                plan.tasks.push(TaskSpec {
                    subject: ProbeSubject::Bucket {
                        bucket_id: (*bucket_id).to_string(),
                    },
                    table_key: bucket_key,
                    probes,
                });
            }
        }
    }

    plan
}

fn expand_probes(
    config: &PolicyConfig,
    spec: &TableTestSpec,
    table_key: &str,
    expected: &mut HashMap<(String, String, Op), Expectation>,
) -> Vec<(Scenario, Vec<Op>)> {
    let mut probes = Vec::new();
    for scenario in config.scenarios_for(spec) {
        let ops: Vec<Op> = scenario
            .expected
            .iter()
            .filter(|(op, _)| match &spec.custom_operations {
                Some(allowed) => allowed.contains(op),
                None => true,
            })
            .map(|(op, expectation)| {
                expected.insert(
                    (table_key.to_string(), scenario.name.clone(), *op),
                    *expectation,
                );
                *op
            })
            .collect();
        if !ops.is_empty() {
            probes.push((scenario, ops));
        }
    }
    probes
}

fn skip_all(
    immediate: &mut Vec<ProbeRecord>,
    table_key: &str,
    probes: &[(Scenario, Vec<Op>)],
    reason: &str,
) {
    for (scenario, ops) in probes {
        for op in ops {
            immediate.push(ProbeRecord {
                table_key: table_key.to_string(),
                scenario_name: scenario.name.clone(),
                op: *op,
                report: ProbeReport::plain(ProbeOutcome::Skipped {
                    reason: reason.to_string(),
                }),
                duration_ms: 0,
            });
        }
    }
}

/// Probe one table's task: fetch its shape, run every `(scenario, op)`
/// probe against it, and funnel the resulting bundle over `record_tx`.
async fn run_task(
    engine: ProbeEngine,
    pool: PgPool,
    task: TaskSpec,
    semaphore: Arc<Semaphore>,
    cancel: CancelFlag,
    record_tx: mpsc::UnboundedSender<Vec<ProbeRecord>>,
) {
    if cancel.load(Ordering::Acquire) {
        return;
    }
    let Ok(_permit) = semaphore.acquire().await else {
        return;
    };
    if cancel.load(Ordering::Acquire) {
        return;
    }

    let mut bundle = Vec::new();
    let shape = match fetch_table_shape(&pool, task.subject.schema(), task.subject.relation())
        .await
    {
        Ok(shape) => shape,
        Err(e) => {
            for (scenario, ops) in &task.probes {
                for op in ops {
                    bundle.push(ProbeRecord {
                        table_key: task.table_key.clone(),
                        scenario_name: scenario.name.clone(),
                        op: *op,
                        report: ProbeReport::plain(ProbeOutcome::Error {
                            reason: format!("failed to introspect relation: {e}"),
                        }),
                        duration_ms: 0,
                    });
                }
            }
            let _ = record_tx.send(bundle);
            return;
        }
    };

    'probing: for (scenario, ops) in &task.probes {
        for op in ops {
            if cancel.load(Ordering::Acquire) {
                break 'probing;
            }
            let start = Instant::now();
            let report = engine.probe(&task.subject, &shape, *op, scenario).await;
            bundle.push(ProbeRecord {
                table_key: task.table_key.clone(),
                scenario_name: scenario.name.clone(),
                op: *op,
                report,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }
    }

    let _ = record_tx.send(bundle);
}

/// Run per-table tasks through a bounded-parallel executor.
///
/// Workers acquire a semaphore permit per task, probe their bundle
/// sequentially, and funnel the finished bundle to the aggregator over a
/// channel. Ordering across tasks is not guaranteed; callers sort.
async fn execute_tasks(
    engine: ProbeEngine,
    pool: PgPool,
    tasks: Vec<TaskSpec>,
    parallelism: u32,
    cancel: CancelFlag,
) -> Vec<ProbeRecord> {
    let semaphore = Arc::new(Semaphore::new(parallelism as usize));
    let (record_tx, mut record_rx) = mpsc::unbounded_channel::<Vec<ProbeRecord>>();

    for task in tasks {
        let engine = engine.clone();
        let pool = pool.clone();
        let semaphore = Arc::clone(&semaphore);
        let cancel = Arc::clone(&cancel);
        let record_tx = record_tx.clone();

        tokio::spawn(run_task(engine, pool, task, semaphore, cancel, record_tx));
    }
    drop(record_tx);

    let mut records = Vec::new();
    while let Some(bundle) = record_rx.recv().await {
        records.extend(bundle);
    }
    records
}

/// Replace the declared plan with one diagnostic scenario per table, built
/// from a real `auth.users` record.
async fn build_real_user_config(
    pool: &PgPool,
    user: &str,
    config: &PolicyConfig,
    options: &RunOptions,
) -> Result<PolicyConfig> {
    let claims = lookup_user_claims(pool, user).await?;
    let scenario = Scenario {
        name: user.to_string(),
        jwt_claims: claims,
        expected: Op::ALL
            .into_iter()
            .map(|op| (op, Expectation::Allow))
            .collect(),
    };

    let tables = config
        .tables
        .keys()
        .filter(|key| match &options.target_table {
            Some(target) => *key == target,
            None => true,
        })
        .map(|key| {
            (
                key.clone(),
                TableTestSpec {
                    test_scenarios: vec![scenario.clone()],
                    custom_operations: None,
                },
            )
        })
        .collect();

    Ok(PolicyConfig {
        tables,
        storage_buckets: Default::default(),
        defaults: None,
    })
}

/// Find one `auth.users` record by email, then by stringified id, and
/// synthesize JWT claims from it.
async fn lookup_user_claims(pool: &PgPool, user: &str) -> Result<JwtClaims> {
    let by_email = sqlx::query(
        "SELECT id::text AS id, email::text AS email,
                COALESCE(role, 'authenticated')::text AS role,
                COALESCE(raw_app_meta_data, '{}'::jsonb) AS app_metadata
         FROM auth.users WHERE email = $1 LIMIT 1",
    )
    .bind(user)
    .fetch_optional(pool)
    .await
    .map_err(|e| AuditError::catalog("looking up auth.users by email", e))?;

    let row = match by_email {
        Some(row) => row,
        None => sqlx::query(
            "SELECT id::text AS id, email::text AS email,
                    COALESCE(role, 'authenticated')::text AS role,
                    COALESCE(raw_app_meta_data, '{}'::jsonb) AS app_metadata
             FROM auth.users WHERE id::text = $1 LIMIT 1",
        )
        .bind(user)
        .fetch_optional(pool)
        .await
        .map_err(|e| AuditError::catalog("looking up auth.users by id", e))?
        .ok_or_else(|| {
            AuditError::Configuration(format!("No auth.users record matches '{user}'"))
        })?,
    };

    let mut claims = JwtClaims::new();
    let id: String = row.get("id");
    claims.insert("sub".to_string(), serde_json::Value::String(id));
    if let Some(email) = row.get::<Option<String>, _>("email") {
        claims.insert("email".to_string(), serde_json::Value::String(email));
    }
    let role: String = row.get("role");
    claims.insert("role".to_string(), serde_json::Value::String(role));
    let app_metadata: serde_json::Value = row.get("app_metadata");
    claims.insert("app_metadata".to_string(), app_metadata);
    Ok(claims)
}
