use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use ticketvault::recovery::RecoveryManager;
use ticketvault::restore::{check_eligibility, RestoreResult};
use ticketvault::status::degradation;
use ticketvault::storage::{resolve_backing_path, BackingMode};
use ticketvault::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ticketvault")]
#[command(about = "Inspect and repair a resilient ticket store")]
#[command(version = "1.0.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace whose tickets are managed
    #[arg(long, short, global = true, env = "TICKETVAULT_WORKSPACE", default_value = ".")]
    workspace: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the status the store would start in, without opening it
    Status,

    /// Show which backing location would be used and why
    Resolve,

    /// Inspect or prune the recovery snapshot
    Recovery {
        #[command(subcommand)]
        action: RecoveryAction,
    },

    /// Check for or run a migration back to durable storage
    Restore {
        #[command(subcommand)]
        action: RestoreAction,
    },

    /// Keep the store open with autosave and restore polling until Ctrl-C
    Watch,
}

#[derive(Subcommand)]
enum RecoveryAction {
    /// Show the recovery snapshot
    Show,

    /// Delete stale backup and temp files
    Cleanup {
        /// Override the retention window (e.g. "3days", "12h")
        #[arg(long, value_parser = humantime::parse_duration)]
        older_than: Option<Duration>,
    },
}

#[derive(Subcommand)]
enum RestoreAction {
    /// Check whether a writable location is available
    Check,

    /// Migrate in-memory tickets to durable storage
    Run {
        /// Ignore the minimum fallback age and failure category
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("ticketvault=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ticketvault=warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .with_context(|| format!("Workspace {:?} does not exist", cli.workspace))?;
    let config = ResilienceConfig::load(&workspace)?;

    match cli.command {
        Commands::Status => show_status(&config, cli.json),
        Commands::Resolve => show_resolution(&config, cli.json),
        Commands::Recovery { action } => match action {
            RecoveryAction::Show => show_recovery(&config, cli.json),
            RecoveryAction::Cleanup { older_than } => cleanup_recovery(&config, older_than),
        },
        Commands::Restore { action } => match action {
            RestoreAction::Check => check_restore(&config, cli.json),
            RestoreAction::Run { force } => run_restore(config, force, cli.json).await,
        },
        Commands::Watch => watch(config).await,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to encode JSON output")?
    );
    Ok(())
}

fn describe(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "memory".to_string())
}

fn mode_label(mode: OperatingMode) -> colored::ColoredString {
    match mode {
        OperatingMode::Primary => "primary".green().bold(),
        OperatingMode::Fallback => "fallback".yellow().bold(),
        OperatingMode::Recovering => "recovering".red().bold(),
    }
}

fn show_status(config: &ResilienceConfig, json: bool) -> Result<()> {
    let inspection = inspect(config);
    if json {
        return print_json(&inspection);
    }

    let status = &inspection.status;
    println!("{}", "=".repeat(60));
    println!("Mode:        {}", mode_label(status.mode));
    println!("Health:      {}", status.health);
    println!("Location:    {}", describe(status.backing_location.as_deref()));
    println!("Reason:      {}", status.reason);
    println!("{}", "-".repeat(60));

    for (feature, available) in &status.available_features {
        let mark = if *available { "✓".green() } else { "✗".red() };
        println!("  {} {}", mark, feature);
    }

    if !inspection.degradations.is_empty() {
        println!("{}", "-".repeat(60));
        print!("{}", degradation::summary(status).yellow());
    }

    if inspection.pending_tickets + inspection.pending_deletions > 0 {
        println!("{}", "-".repeat(60));
        println!(
            "Snapshot:    {} tickets, {} deletions pending",
            inspection.pending_tickets, inspection.pending_deletions
        );
        match &inspection.held_by {
            Some(trigger) => println!(
                "             {} after {} failure at {}",
                "held in memory".red(),
                trigger.category,
                trigger.triggered_at.to_rfc3339()
            ),
            None => println!("             migrated when the store next opens"),
        }
    }
    println!("{}", "=".repeat(60));

    Ok(())
}

fn show_resolution(config: &ResilienceConfig, json: bool) -> Result<()> {
    let resolved = resolve_backing_path(&config.primary_path(), &config.alternate_paths());

    if json {
        return print_json(&resolved);
    }

    for probe in &resolved.probes {
        if probe.writable {
            println!("{} {}", "writable".green(), probe.path.display());
        } else {
            println!(
                "{} {} ({})",
                "rejected".red(),
                probe.path.display(),
                probe.reason.as_deref().unwrap_or("unknown")
            );
        }
    }

    let selected = match resolved.mode {
        BackingMode::Memory => "memory".yellow().bold(),
        BackingMode::Primary => resolved.mode.to_string().green().bold(),
        BackingMode::Alternate(_) => resolved.mode.to_string().yellow().bold(),
    };
    println!("Selected: {} - {}", selected, resolved.reason);
    Ok(())
}

fn show_recovery(config: &ResilienceConfig, json: bool) -> Result<()> {
    let manager = RecoveryManager::new(config.recovery_config());
    let snapshot = manager.load_recovery_data();
    let usable = manager.load_usable().is_some();

    if json {
        return print_json(&serde_json::json!({
            "stats": manager.stats(),
            "snapshot": snapshot,
            "usable": usable,
        }));
    }

    let Some(snapshot) = snapshot else {
        println!("No recovery snapshot at {}", manager.path().display());
        return Ok(());
    };

    let age = snapshot.age_at(chrono::Utc::now());
    println!("Snapshot:  {}", manager.path().display());
    println!("Version:   {}", snapshot.version);
    println!(
        "Taken:     {} ({} ago)",
        snapshot.timestamp.to_rfc3339(),
        humantime::format_duration(Duration::from_secs(age.as_secs()))
    );
    println!("Tickets:   {}", snapshot.ticket_count);
    if !snapshot.deleted_ids.is_empty() {
        println!("Deletions: {}", snapshot.deleted_ids.join(", "));
    }
    if let Some(trigger) = &snapshot.trigger {
        println!("Trigger:   {} ({})", trigger.category, trigger.error);
    }
    println!(
        "Usable:    {}",
        if usable { "yes".green() } else { "no".red() }
    );
    Ok(())
}

fn cleanup_recovery(config: &ResilienceConfig, older_than: Option<Duration>) -> Result<()> {
    let manager = RecoveryManager::new(config.recovery_config());
    let removed = match older_than {
        Some(retention) => manager.cleanup_older_than(retention)?,
        None => manager.cleanup()?,
    };
    println!("Removed {} stale recovery file(s)", removed);
    Ok(())
}

fn check_restore(config: &ResilienceConfig, json: bool) -> Result<()> {
    let check = check_eligibility(&config.restore_config());

    if json {
        return print_json(&check);
    }

    if check.can_restore {
        println!(
            "{} {} ({})",
            "Restore possible:".green().bold(),
            describe(check.target_path.as_deref()),
            check.reason
        );
    } else {
        println!("{} {}", "Restore not possible:".red().bold(), check.reason);
    }
    Ok(())
}

async fn run_restore(config: ResilienceConfig, force: bool, json: bool) -> Result<()> {
    let store = ResilientTicketStore::open(config).await?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]")
            .context("Invalid progress template")?,
    );
    spinner.set_message(format!("Migrating {} tickets", store.pending_count()));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result: RestoreResult = if force {
        store.force_restore().await
    } else {
        store.try_restore().await
    };
    spinner.finish_and_clear();

    if json {
        return print_json(&result);
    }

    if result.success {
        println!(
            "{} {} tickets to {} in {}",
            "Restored".green().bold(),
            result.items_migrated,
            describe(result.target_path.as_deref()),
            humantime::format_duration(Duration::from_millis(result.duration_ms))
        );
    } else {
        println!("{}", "Restore did not complete".red().bold());
        for error in &result.errors {
            println!("  - {}", error);
        }
        if !result.failed_ids.is_empty() {
            println!(
                "{} ticket(s) kept in the recovery snapshot",
                result.failed_ids.len()
            );
        }
    }

    store.shutdown();
    Ok(())
}

async fn watch(config: ResilienceConfig) -> Result<()> {
    let store = ResilientTicketStore::open(config).await?;

    let subscription = store.status_manager().on_status_change(|status| {
        println!(
            "{} {} -> {} ({})",
            status.mode_changed_at.format("%H:%M:%S"),
            mode_label(status.mode),
            describe(status.backing_location.as_deref()),
            status.reason
        );
        Ok(())
    });

    store.start_background_tasks();
    println!(
        "Watching {} in {} mode, Ctrl-C to stop",
        describe(store.status().backing_location.as_deref()),
        mode_label(store.status().mode)
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    subscription.unsubscribe();
    store.shutdown();
    Ok(())
}
