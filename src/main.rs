//! CLI entry point for `rlsaudit`.

use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use rlsaudit::config::load_config;
use rlsaudit::db::{self, connect, ConnectionContext};
use rlsaudit::error::Result;
use rlsaudit::lint::{
    lint_tables, scan_sensitive_columns, AuditResults, SensitiveColumnConfig,
};
use rlsaudit::output;
use rlsaudit::report::{build_coverage, diff_snapshots, PolicySnapshot};
use rlsaudit::runner::{run_coverage_probes, run_tests, CancelFlag, RunOptions};

#[derive(Parser)]
#[command(
    name = "rlsaudit",
    about = "Audit and probe PostgreSQL Row-Level Security configurations"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Print verbose diagnostics
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Args)]
struct ConnectionArgs {
    /// PostgreSQL connection string
    #[arg(long)]
    db_url: String,

    /// Look beyond the public schema
    #[arg(long)]
    include_system_schemas: bool,
}

#[derive(Args)]
struct ProbeArgs {
    /// Policy configuration file (YAML or JSON)
    #[arg(long)]
    config: PathBuf,

    /// Restrict the run to one table key
    #[arg(long)]
    table: Option<String>,

    /// Parallel probe workers, between 1 and 10
    #[arg(long, default_value_t = 4)]
    parallelism: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Probe every declared scenario and compare against expectations
    Test {
        #[command(flatten)]
        connection: ConnectionArgs,
        #[command(flatten)]
        probe: ProbeArgs,
        /// Probe as a real auth.users record (email or id) instead
        #[arg(long)]
        as_user: Option<String>,
    },
    /// Statically lint policy expressions without probing
    Lint {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
    /// Lint plus sensitive-column and RLS-disabled findings
    Audit {
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Extra column-name regex patterns to treat as sensitive
        #[arg(long = "sensitive-pattern")]
        sensitive_patterns: Vec<String>,
    },
    /// Probe every discovered table as anonymous and authenticated
    Coverage {
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Restrict the run to one table key
        #[arg(long)]
        table: Option<String>,
        /// Parallel probe workers, between 1 and 10
        #[arg(long, default_value_t = 4)]
        parallelism: u32,
    },
    /// Run the test plan and persist the probe matrix
    Snapshot {
        #[command(flatten)]
        connection: ConnectionArgs,
        #[command(flatten)]
        probe: ProbeArgs,
        /// Where to write the snapshot
        #[arg(long, default_value = "rls-snapshot.json")]
        output: PathBuf,
    },
    /// Compare two snapshots and classify the differences
    Diff {
        /// The older snapshot
        previous: PathBuf,
        /// The newer snapshot
        current: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default_level = if verbose { "rlsaudit=debug" } else { "rlsaudit=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn cancel_on_ctrl_c() -> CancelFlag {
    let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling; in-flight probes finish their rollback first");
            flag.store(true, Ordering::Release);
        }
    });
    cancel
}

async fn connect_for(connection: &ConnectionArgs, parallelism: u32) -> Result<ConnectionContext> {
    connect(
        &connection.db_url,
        parallelism,
        db::DEFAULT_CONNECT_TIMEOUT,
    )
    .await
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Test {
            connection,
            probe,
            as_user,
        } => {
            let ctx = connect_for(&connection, probe.parallelism).await?;
            let config = load_config(&probe.config)?;
            let options = RunOptions {
                target_table: probe.table,
                include_system_schemas: connection.include_system_schemas,
                parallelism: probe.parallelism,
                as_user,
            };
            let results = run_tests(&ctx, &config, &options, cancel_on_ctrl_c()).await?;
            print!("{}", output::render_test_results(&results));
            Ok(results.exit_code())
        }
        Command::Lint { connection } => {
            let ctx = connect_for(&connection, 1).await?;
            let (tables, _warnings) =
                db::discover_tables(ctx.pool(), connection.include_system_schemas).await?;
            let results = lint_tables(&tables);
            print!("{}", output::render_lint_results(&results));
            Ok(i32::from(results.has_blocking_issues()))
        }
        Command::Audit {
            connection,
            sensitive_patterns,
        } => {
            let ctx = connect_for(&connection, 1).await?;
            let (tables, warnings) =
                db::discover_tables(ctx.pool(), connection.include_system_schemas).await?;
            let lint = lint_tables(&tables);

            let sensitive_config = SensitiveColumnConfig::with_extra_patterns(&sensitive_patterns)
                .map_err(|e| {
                    rlsaudit::error::AuditError::Configuration(format!(
                        "Invalid sensitive-column pattern: {e}"
                    ))
                })?;
            let grants =
                db::select_column_grants(ctx.pool(), connection.include_system_schemas).await?;
            let sensitive = scan_sensitive_columns(&grants, &sensitive_config);

            let results = AuditResults::assemble(lint, sensitive, &warnings);
            print!("{}", output::render_audit_results(&results));
            Ok(i32::from(results.has_blocking_issues()))
        }
        Command::Coverage {
            connection,
            table,
            parallelism,
        } => {
            let ctx = connect_for(&connection, parallelism).await?;
            let options = RunOptions {
                target_table: table,
                include_system_schemas: connection.include_system_schemas,
                parallelism,
                as_user: None,
            };
            let (records, tables, _warnings) =
                run_coverage_probes(&ctx, &options, cancel_on_ctrl_c()).await?;
            let report = build_coverage(&records, &tables);
            print!("{}", output::render_coverage(&report));
            Ok(0)
        }
        Command::Snapshot {
            connection,
            probe,
            output: output_path,
        } => {
            let ctx = connect_for(&connection, probe.parallelism).await?;
            let config = load_config(&probe.config)?;
            let options = RunOptions {
                target_table: probe.table,
                include_system_schemas: connection.include_system_schemas,
                parallelism: probe.parallelism,
                as_user: None,
            };
            let results = run_tests(&ctx, &config, &options, cancel_on_ctrl_c()).await?;
            let snapshot = PolicySnapshot::from_test_results(&results);
            snapshot.save(&output_path)?;
            println!(
                "Snapshot of {} probes written to {}",
                results.total,
                output_path.display()
            );
            Ok(results.exit_code())
        }
        Command::Diff { previous, current } => {
            let previous = PolicySnapshot::load(&previous)?;
            let current = PolicySnapshot::load(&current)?;
            let comparison = diff_snapshots(&previous, &current);
            print!("{}", output::render_diff(&comparison));
            Ok(comparison.exit_code())
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            process::exit(2);
        }
    }
}
