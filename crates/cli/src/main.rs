//! # pgshift
//!
//! Runs ordered, lock-aware schema migrations against PostgreSQL.
//!
//! ```bash
//! # Apply everything pending
//! pgshift up
//!
//! # Revert down to (but not including) a version
//! pgshift down 20240101000000
//!
//! # Scaffold a reversible migration
//! pgshift new add_email_to_users --reversible
//!
//! # Perform queued background migrations until interrupted
//! pgshift worker
//! ```
//!
//! Configuration is read from the environment (`DATABASE_URL`,
//! `PGSHIFT_MIGRATIONS_PATH`, `PGSHIFT_LOCK_WAIT_SECONDS`,
//! `PGSHIFT_ADVISORY_LOCK_ID`, `DISABLE_LOCK_RETRIES`); `--database-url` and
//! `--migrations` override it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, ArgMatches, Command};
use color_eyre::eyre::{Context as _, bail};
use pgshift::{
    BackfillRegistry, Config, Error, Executor, MigrationStatus, PgDriver, RunReport, StepReport,
    Worker,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

fn cli() -> Command {
    Command::new("pgshift")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Ordered, lock-aware PostgreSQL schema migrations")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("database-url")
                .long("database-url")
                .help("Database to migrate (defaults to DATABASE_URL)")
                .value_name("URL")
                .global(true),
        )
        .arg(
            Arg::new("migrations")
                .long("migrations")
                .help("Directory of SQL migrations (defaults to PGSHIFT_MIGRATIONS_PATH or ./migrations)")
                .value_name("DIR")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .subcommand(
            Command::new("up")
                .about("Apply pending migrations")
                .arg(target_arg("Stop after this version")),
        )
        .subcommand(
            Command::new("down")
                .about("Revert applied migrations, newest first")
                .arg(target_arg(
                    "Revert every migration newer than this version (defaults to only the latest)",
                )),
        )
        .subcommand(Command::new("status").about("List migrations and whether they are applied"))
        .subcommand(
            Command::new("apply")
                .about("Apply a single migration by version")
                .arg(
                    Arg::new("version")
                        .help("Version of the migration to apply")
                        .required(true)
                        .value_parser(clap::value_parser!(i64))
                        .index(1),
                ),
        )
        .subcommand(
            Command::new("new")
                .about("Create a new timestamped SQL migration")
                .arg(
                    Arg::new("name")
                        .help("Name of the migration, e.g. add_email_to_users")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::new("reversible")
                        .long("reversible")
                        .help("Create separate up and down files")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("worker")
                .about("Perform queued background migrations until interrupted")
                .arg(
                    Arg::new("sleep")
                        .long("sleep")
                        .help("Seconds to wait when the queue is empty")
                        .value_name("SECONDS")
                        .default_value("5")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("max-retries")
                        .long("max-retries")
                        .help("Attempts before a job is marked failed")
                        .value_name("N")
                        .default_value("20")
                        .value_parser(clap::value_parser!(i32)),
                ),
        )
}

fn target_arg(help: &'static str) -> Arg {
    Arg::new("target")
        .help(help)
        .value_parser(clap::value_parser!(i64))
        .index(1)
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let matches = cli().get_matches();
    tracing_common::setup_tracing("pgshift")?;

    let config = config(&matches)?;

    if let Some(("new", sub_matches)) = matches.subcommand() {
        let name = sub_matches
            .get_one::<String>("name")
            .map(String::as_str)
            .unwrap_or_default();
        let created = create_migration(
            &config.migrations_path,
            name,
            sub_matches.get_flag("reversible"),
        )?;
        for path in created {
            println!("Created {}", path.display());
        }
        return Ok(());
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { run(&matches, &config).await })
}

fn config(matches: &ArgMatches) -> color_eyre::Result<Config> {
    let mut config = Config::from_env().wrap_err("Invalid configuration in the environment")?;
    if let Some(url) = matches.get_one::<String>("database-url") {
        config.database_url = Some(url.clone());
    }
    if let Some(path) = matches.get_one::<PathBuf>("migrations") {
        config.migrations_path.clone_from(path);
    }
    Ok(config)
}

async fn connect(config: &Config) -> color_eyre::Result<PgDriver> {
    let url = config.database_url()?;
    PgDriver::connect(url)
        .await
        .wrap_err("Failed to connect to the database")
}

async fn run(matches: &ArgMatches, config: &Config) -> color_eyre::Result<()> {
    if let Some(("worker", sub_matches)) = matches.subcommand() {
        let sleep = sub_matches.get_one::<u64>("sleep").copied().unwrap_or(5);
        let max_retries = sub_matches.get_one::<i32>("max-retries").copied().unwrap_or(20);
        return run_worker(config, Duration::from_secs(sleep), max_retries).await;
    }

    // Load and validate every definition before touching the database.
    let executor = Executor::from_config(config).wrap_err_with(|| {
        format!(
            "Failed to load migrations from {}",
            config.migrations_path.display()
        )
    })?;
    let mut driver = connect(config).await?;

    let result = match matches.subcommand() {
        Some(("up", sub_matches)) => {
            let target = sub_matches.get_one::<i64>("target").copied();
            executor
                .up(&mut driver, target)
                .await
                .map(|report| print_report("Applied", &report))
        }
        Some(("down", sub_matches)) => {
            let target = sub_matches.get_one::<i64>("target").copied();
            executor
                .down(&mut driver, target)
                .await
                .map(|report| print_report("Reverted", &report))
        }
        Some(("apply", sub_matches)) => {
            let version = sub_matches.get_one::<i64>("version").copied().unwrap_or_default();
            match executor.apply_version(&mut driver, version).await {
                Ok(step) => {
                    print_step("Applied", &step);
                    Ok(())
                }
                Err(Error::AlreadyApplied(id)) => {
                    println!("{id} is already applied");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }
        Some(("status", _)) => executor.status(&mut driver).await.map(|entries| {
            for entry in entries {
                let state = match entry.status {
                    MigrationStatus::Up { applied_at } => {
                        format!("up    {}", applied_at.format("%Y-%m-%d %H:%M:%S"))
                    }
                    MigrationStatus::Down => format!("down  {:19}", ""),
                };
                let note = if entry.defined { "" } else { "  (no definition)" };
                println!("{state}  {}  {}{note}", entry.id.version, entry.id.name);
            }
        }),
        _ => unreachable!("Subcommand required"),
    };

    if let Err(err) = driver.close().await {
        tracing::warn!(error_msg = %err, "Failed to close the database connection");
    }
    Ok(result?)
}

fn print_step(verb: &str, step: &StepReport) {
    println!("{verb} {} ({:.2?})", step.id, step.duration);
    for skipped in &step.skipped {
        println!("  skipped {skipped}");
    }
}

fn print_report(verb: &str, report: &RunReport) {
    if report.is_empty() {
        println!("Nothing to do");
    }
    for step in &report.steps {
        print_step(verb, step);
    }
}

async fn run_worker(
    config: &Config,
    sleep_duration: Duration,
    max_retries: i32,
) -> color_eyre::Result<()> {
    let driver = connect(config).await?;
    let worker = Worker::new(driver, Arc::new(BackfillRegistry::new()))
        .sleep_duration(sleep_duration)
        .max_retries(max_retries);

    let shutdown_token = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown_token.clone()));

    info!(worker.id = %worker.id(), "Starting background migration worker");
    worker.run(shutdown_token).await?;
    info!("Worker shut down gracefully");
    Ok(())
}

async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(error_msg = %err, "Failed to create SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, initiating graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
    token.cancel();
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Writes `{timestamp}_{name}.sql`, or an `.up.sql`/`.down.sql` pair.
fn create_migration(dir: &Path, name: &str, reversible: bool) -> color_eyre::Result<Vec<PathBuf>> {
    if !valid_name(name) {
        bail!("Invalid migration name {name:?}: use lowercase letters, digits and underscores");
    }

    fs::create_dir_all(dir)
        .wrap_err_with(|| format!("Failed to create {}", dir.display()))?;

    let version = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let files = if reversible {
        vec![
            (format!("{version}_{name}.up.sql"), "-- Add up migration script here\n"),
            (format!("{version}_{name}.down.sql"), "-- Add down migration script here\n"),
        ]
    } else {
        vec![(
            format!("{version}_{name}.sql"),
            "-- Add migration script here\n-- Without a .down.sql file this migration is irreversible\n",
        )]
    };

    let mut created = Vec::with_capacity(files.len());
    for (file_name, contents) in files {
        let path = dir.join(file_name);
        if path.exists() {
            bail!("{} already exists", path.display());
        }
        fs::write(&path, contents).wrap_err_with(|| format!("Failed to write {}", path.display()))?;
        created.push(path);
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn migration_names_are_snake_case() {
        assert!(valid_name("add_email_to_users"));
        assert!(valid_name("v2_backfill"));
        assert!(!valid_name(""));
        assert!(!valid_name("Add Email"));
        assert!(!valid_name("drop-users"));
    }

    #[test]
    fn reversible_migrations_get_up_and_down_files() {
        let dir = tempfile::tempdir().unwrap();
        let created = create_migration(dir.path(), "add_email", true).unwrap();

        assert_eq!(created.len(), 2);
        let names: Vec<String> = created
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names[0].ends_with("_add_email.up.sql"));
        assert!(names[1].ends_with("_add_email.down.sql"));

        let loaded = pgshift::source::load_dir(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].is_reversible());
    }
}
