//! # backstop CLI
//!
//! Command-line front end for the backup subsystem.
//!
//! ## Usage
//! ```bash
//! # Write a settings file for the app in the current directory
//! backstop init --database instance/app.db
//!
//! # Take a FULL backup
//! backstop create --kind full
//!
//! # List archives, verifying each one
//! backstop list --verify
//!
//! # Restore only the database and signatures
//! backstop restore backup_full_20240310_020000.zip --scope data
//!
//! # Run the daily/periodic scheduler until Ctrl-C
//! backstop schedule
//! ```

use backstop::{
    utils::format_bytes, BackupError, BackupKind, BackupManager, BackupScheduler, RestoreScope, Result,
    ScheduleConfig, Settings, SourceLayout, VerificationStatus,
};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Backup and restore for the application's database, configuration and assets
#[derive(Parser)]
#[command(name = "backstop")]
#[command(version)]
#[command(about = "Verifiable backups and failure-safe restores of application state")]
#[command(long_about = None)]
struct Cli {
    /// Settings file
    #[arg(short, long, global = true, default_value = "backstop.json")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default settings file
    Init {
        /// Application root
        #[arg(long, default_value = ".")]
        app_root: PathBuf,

        /// Database path, relative to the application root
        #[arg(long, default_value = "instance/app.db")]
        database: PathBuf,

        /// Backup directory, relative to the application root
        #[arg(long, default_value = "backups")]
        backup_dir: PathBuf,

        /// Overwrite an existing settings file
        #[arg(long)]
        force: bool,
    },

    /// Create a backup
    #[command(alias = "new")]
    Create {
        /// What to capture
        #[arg(short, long, value_enum, default_value = "full")]
        kind: KindArg,

        /// File name prefix instead of backup_<kind>
        #[arg(short, long)]
        name: Option<String>,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// Restore from a backup
    #[command(alias = "rs")]
    Restore {
        /// Archive path or file name inside the backup directory
        archive: PathBuf,

        /// What to restore
        #[arg(short, long, value_enum, default_value = "full")]
        scope: ScopeArg,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// List backups
    #[command(alias = "ls")]
    List {
        /// Verify every archive
        #[arg(long)]
        verify: bool,

        /// Limit results
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Verify a backup
    Verify {
        /// Archive path or file name inside the backup directory
        archive: PathBuf,
    },

    /// Delete a backup
    #[command(alias = "rm")]
    Delete {
        /// Archive file name inside the backup directory
        archive: PathBuf,
    },

    /// Show backup statistics
    Stats,

    /// Check the backup directory, database and settings
    Health,

    /// Run scheduled backups until interrupted
    Schedule {
        /// Daily FULL backup time (HH:MM), overriding the settings file
        #[arg(long)]
        at: Option<String>,

        /// Hours between INCREMENTAL backups, overriding the settings file
        #[arg(long)]
        every: Option<u64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Full,
    Incremental,
    Data,
    Config,
}

impl From<KindArg> for BackupKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Full => BackupKind::Full,
            KindArg::Incremental => BackupKind::Incremental,
            KindArg::Data => BackupKind::Data,
            KindArg::Config => BackupKind::Config,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeArg {
    Full,
    Data,
    Config,
}

impl From<ScopeArg> for RestoreScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Full => RestoreScope::Full,
            ScopeArg::Data => RestoreScope::Data,
            ScopeArg::Config => RestoreScope::Config,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init {
            app_root,
            database,
            backup_dir,
            force,
        } => cmd_init(&cli.config, app_root, database, backup_dir, force),
        Commands::Create { kind, name, progress } => cmd_create(&cli.config, kind.into(), name, progress),
        Commands::Restore {
            archive,
            scope,
            progress,
        } => cmd_restore(&cli.config, &archive, scope.into(), progress),
        Commands::List { verify, limit } => cmd_list(&cli.config, verify, limit),
        Commands::Verify { archive } => cmd_verify(&cli.config, &archive),
        Commands::Delete { archive } => cmd_delete(&cli.config, &archive),
        Commands::Stats => cmd_stats(&cli.config),
        Commands::Health => cmd_health(&cli.config),
        Commands::Schedule { at, every } => cmd_schedule(&cli.config, at, every),
    }
}

fn open_manager(config: &Path) -> Result<BackupManager> {
    if !config.exists() {
        return Err(BackupError::InvalidConfiguration(format!(
            "{} not found, run `backstop init` first",
            config.display()
        )));
    }
    let settings = Settings::load(config)?;
    BackupManager::from_settings(&settings)
}

fn spinner(enabled: bool, message: &'static str) -> Option<ProgressBar> {
    if !enabled {
        return None;
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    Some(pb)
}

/// Write a settings file describing the application
fn cmd_init(config: &Path, app_root: PathBuf, database: PathBuf, backup_dir: PathBuf, force: bool) -> Result<()> {
    if config.exists() && !force {
        return Err(BackupError::InvalidConfiguration(format!(
            "{} already exists. Use --force to overwrite.",
            config.display()
        )));
    }

    let settings = Settings {
        backup_dir,
        layout: SourceLayout::new(app_root, database).with_log_pattern("logs/*.log"),
        schedule: Some(ScheduleConfig::default()),
        ..Default::default()
    };
    settings.validate()?;
    settings.save(config)?;

    let backup_dir = settings.layout.resolve(&settings.backup_dir);
    std::fs::create_dir_all(&backup_dir)?;

    println!("{} Wrote {}", "✓".green().bold(), config.display().to_string().cyan());
    println!("  Database: {}", settings.layout.database().display().to_string().cyan());
    println!("  Backups: {}", backup_dir.display().to_string().cyan());
    println!("\nNext steps:");
    println!("  - Add config files and trees to {}", config.display().to_string().yellow());
    println!("  - Take a first backup: {}", "backstop create --kind full".yellow());

    Ok(())
}

fn cmd_create(config: &Path, kind: BackupKind, name: Option<String>, show_progress: bool) -> Result<()> {
    let manager = open_manager(config)?;
    println!("{} {}", "Creating backup:".blue().bold(), kind);

    let progress = spinner(show_progress, "Capturing application state...");
    let result = manager.create_backup(kind, name.as_deref());
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    let created = result?;

    println!("{} Created {}", "✓".green().bold(), created.info.id.yellow().bold());
    if created.fell_back_to_full {
        println!("  {}", "No FULL backup found, performed FULL instead of INCREMENTAL".yellow());
    }
    println!("  Streams: {}", created.streams_written.to_string().cyan());
    println!("  Captured: {}", format_bytes(created.bytes_captured).cyan());
    println!("  Archive: {}", format_bytes(created.info.size_bytes).cyan());
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(created.duration_ms)).to_string().cyan()
    );
    for skipped in &created.skipped {
        println!("  {} {}", "Skipped:".yellow(), skipped);
    }
    for evicted in &created.evicted {
        println!("  {} {}", "Removed by retention:".dimmed(), evicted.display());
    }

    Ok(())
}

fn cmd_restore(config: &Path, archive: &Path, scope: RestoreScope, show_progress: bool) -> Result<()> {
    let manager = open_manager(config)?;
    println!(
        "{} {} ({})",
        "Restoring from".blue().bold(),
        archive.display().to_string().yellow(),
        scope
    );

    let progress = spinner(show_progress, "Restoring...");
    let result = manager.restore_backup(archive, scope);
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    let report = result?;

    if let Some(safety) = &report.safety_backup {
        println!("  Safety backup: {}", safety.display().to_string().cyan());
    }
    if !report.warnings.is_empty() {
        println!("\n{}", "Warnings:".yellow().bold());
        for warning in &report.warnings {
            println!("  - {}", warning.yellow());
        }
    }

    if report.is_success() {
        println!("{} Restore complete", "✓".green().bold());
        println!("  Files restored: {}", report.files_restored.to_string().cyan());
        println!("  Bytes written: {}", format_bytes(report.bytes_written).cyan());
        println!(
            "  Time: {}",
            format_duration(Duration::from_millis(report.duration_ms)).to_string().cyan()
        );
        return Ok(());
    }

    println!("{} Restore failed, live state rolled back", "✗".red().bold());
    for error in &report.rollback_errors {
        println!("  {} {}", "Rollback problem:".red(), error);
    }
    Err(BackupError::ValidationFailed(
        report.failure.unwrap_or_else(|| format!("{:?}", report.outcome)),
    ))
}

fn cmd_list(config: &Path, verify: bool, limit: Option<usize>) -> Result<()> {
    let manager = open_manager(config)?;
    let backups = if verify {
        manager.list_backups_verified()?
    } else {
        manager.list_backups()?
    };

    if backups.is_empty() {
        println!("{}", "No backups found".yellow());
        return Ok(());
    }

    println!("{}", "Backups (newest first):".blue().bold());
    for backup in backups.iter().take(limit.unwrap_or(usize::MAX)) {
        let status = match &backup.verification {
            VerificationStatus::Verified => "✓".green(),
            VerificationStatus::Failed(_) => "✗".red(),
            VerificationStatus::Unchecked => "·".dimmed(),
        };
        println!(
            "{} {} {} {} {}",
            status,
            backup.id.yellow(),
            backup.kind_label().cyan(),
            format_bytes(backup.size_bytes),
            backup
                .created_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
                .dimmed()
        );
        if let VerificationStatus::Failed(reason) = &backup.verification {
            println!("    {}", reason.red());
        }
    }

    Ok(())
}

fn cmd_verify(config: &Path, archive: &Path) -> Result<()> {
    let manager = open_manager(config)?;
    let start = Instant::now();
    let report = manager.verify_backup(archive)?;

    for check in &report.checks {
        let mark = if check.passed { "✓".green() } else { "✗".red() };
        match &check.detail {
            Some(detail) => println!("  {} {}: {}", mark, check.name, detail),
            None => println!("  {} {}", mark, check.name),
        }
    }
    for warning in &report.warnings {
        println!("  {} {}", "!".yellow(), warning);
    }
    println!("\n{}", report.summary());
    println!("{}", format!("Total time: {}", format_duration(start.elapsed())).dimmed());

    if report.is_valid() {
        Ok(())
    } else {
        report.into_result().map(|_| ())
    }
}

fn cmd_delete(config: &Path, archive: &Path) -> Result<()> {
    let manager = open_manager(config)?;
    manager.delete_backup(archive)?;
    println!("{} Deleted {}", "✓".green().bold(), archive.display().to_string().yellow());
    Ok(())
}

fn cmd_stats(config: &Path) -> Result<()> {
    let manager = open_manager(config)?;
    let stats = manager.statistics()?;

    println!("{}", "Backup statistics".blue().bold());
    println!("  Directory: {}", manager.backup_dir().display().to_string().cyan());
    println!("  Backups: {}", stats.total_backups.to_string().cyan());
    println!("  Total size: {}", format_bytes(stats.total_size_bytes).cyan());
    for (kind, count) in &stats.by_kind {
        println!("    {}: {}", kind, count);
    }
    if let Some(oldest) = stats.oldest {
        println!("  Oldest: {}", oldest.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"));
    }
    if let Some(newest) = stats.newest {
        println!("  Newest: {}", newest.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"));
    }
    println!("  Retention: keep {}", manager.config().max_backups);

    Ok(())
}

fn cmd_health(config: &Path) -> Result<()> {
    let manager = open_manager(config)?;
    let health = manager.health_check();

    let mark = |ok: bool| if ok { "✓".green() } else { "✗".red() };
    println!("  {} backup directory exists", mark(health.backup_dir_exists));
    println!("  {} backup directory writable", mark(health.backup_dir_writable));
    println!("  {} database present", mark(health.database_present));
    println!("  {} configuration valid", mark(health.config_valid));
    match health.free_space_bytes {
        Some(free) => println!("  {} {} free on the backup disk", mark(health.free_space_ok), format_bytes(free)),
        None => println!("  {} free space unknown", "?".yellow()),
    }
    println!("  {} backups on disk", health.backup_count);

    if health.healthy {
        println!("{} Healthy", "✓".green().bold());
        Ok(())
    } else {
        for issue in &health.issues {
            println!("  - {}", issue.yellow());
        }
        Err(BackupError::ValidationFailed(format!("{} health issue(s)", health.issues.len())))
    }
}

fn cmd_schedule(config: &Path, at: Option<String>, every: Option<u64>) -> Result<()> {
    let settings = Settings::load(config)?;
    let mut schedule = settings.schedule.clone().unwrap_or_default();
    if let Some(at) = at {
        schedule.daily_at = at;
    }
    if every.is_some() {
        schedule.incremental_every_hours = every;
    }
    schedule.validate()?;
    let manager = std::sync::Arc::new(BackupManager::from_settings(&settings)?);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        let mut scheduler = BackupScheduler::new(manager, schedule);
        scheduler.start()?;
        println!("{} {}", "✓".green().bold(), scheduler.status().message());
        println!("{}", "Press Ctrl-C to stop".dimmed());

        tokio::signal::ctrl_c().await?;
        scheduler.stop().await;
        println!("{} Scheduler stopped", "✓".green().bold());
        Ok::<(), BackupError>(())
    })
}
