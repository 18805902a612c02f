use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pmis_sync::config::SyncConfig;
use pmis_sync::destination::{Destination, PgDestination};
use pmis_sync::engine::run_sync;
use pmis_sync::logging::{self, LogFormat};
use pmis_sync::schema::SchemaRegistry;
use pmis_sync::{Result, SyncError};
use tracing::info;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = match logging::init(&cli.verbosity, cli.log_format, cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(error) => return report_error(&error),
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => report_error(&error),
    }
}

fn report_error(error: &SyncError) -> ExitCode {
    eprintln!("{}", error.format_detailed());
    ExitCode::from(error.exit_code())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = SyncConfig::load(&cli.config)?;
    match cli.command {
        Command::Run(args) => {
            if let Some(source) = args.source {
                config.source.path = source;
            }
            if let Some(batch_size) = args.batch_size {
                config.sync.batch_size = batch_size;
            }
            config.validate()?;
            execute_run(&config, args.dry_run, args.output_json).await
        }
        Command::Check => execute_check(&config).await,
    }
}

async fn execute_run(config: &SyncConfig, dry_run: bool, output_json: bool) -> Result<()> {
    let mut destination = PgDestination::connect(&config.database).await?;
    let report = run_sync(&mut destination, &config.source.path, &config.sync, dry_run).await?;

    if output_json {
        println!("{}", report.to_json()?);
    } else {
        println!(
            "upserted {} rows, soft-deleted {} rows, cascaded {} rows across {} tables",
            report.rows_upserted(),
            report.rows_soft_deleted(),
            report.rows_cascaded(),
            report.tables.len()
        );
        for skipped in &report.skipped {
            println!("skipped {}: {}", skipped.table, skipped.reason);
        }
        for table in report.failed_tables() {
            println!("failed {table}, see log for details");
        }
    }
    Ok(())
}

async fn execute_check(config: &SyncConfig) -> Result<()> {
    let mut destination = PgDestination::connect(&config.database).await?;
    info!(db = destination.db_type(), "connected");

    let tables = config.sync.tables_to_reflect();
    let registry = SchemaRegistry::reflect(&mut destination, &tables).await?;
    for table in &tables {
        match registry.get(table) {
            Ok(descriptor) => println!(
                "ok       {} (key {}, {} columns)",
                table,
                descriptor.primary_key,
                descriptor.columns.len()
            ),
            Err(error) => println!("missing  {table}: {error}"),
        }
    }
    if !config.source.path.exists() {
        println!("source {} does not exist", config.source.path.display());
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "One-way synchronisation of a PMIS workbook into PostgreSQL."
)]
struct Cli {
    /// YAML configuration file.
    #[arg(long, global = true, default_value = "pmis-sync.yaml")]
    config: PathBuf,

    /// Log level: trace, debug, info, warn or error. RUST_LOG overrides it.
    #[arg(long, global = true, default_value = "info")]
    verbosity: String,

    /// Console log format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Also append the log to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Synchronise the workbook into the database.
    Run(RunArgs),
    /// Validate the configuration and reflect every configured table.
    Check,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Workbook to read instead of `source.path`.
    #[arg(long)]
    source: Option<PathBuf>,

    /// Rows per upsert batch instead of `sync.batch_size`.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Plan every table and log the changes without writing.
    #[arg(long)]
    dry_run: bool,

    /// Print the run report as JSON on stdout.
    #[arg(long)]
    output_json: bool,
}
