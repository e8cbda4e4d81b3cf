use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tinymerge_core::config::Settings;
use tinymerge_core::logging::init_logging;
use tinymerge_core::{CancelToken, Merger};

#[derive(Parser)]
#[command(
    name = "tinymerge",
    about = "Publish a staging directory into a live output directory, all or nothing"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to .tinymerge data directory
    #[arg(long, default_value = ".tinymerge")]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge a staging directory into an output directory
    Publish {
        /// Freshly generated tree
        staging: PathBuf,
        /// Live output directory
        output: PathBuf,
        /// Maximum filesystem operations in flight
        #[arg(long)]
        max_concurrency: Option<usize>,
        /// Give up (and roll back) after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Delete the staging directory after a successful merge
        #[arg(long)]
        remove_staging: bool,
    },
    /// Show the effective configuration
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run interactive setup wizard
    Setup,
}

fn settings_path(cli: &Cli) -> PathBuf {
    cli.data_dir.join("settings.json")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Publish {
            staging,
            output,
            max_concurrency,
            timeout_secs,
            remove_staging,
        } => {
            cmd_publish(
                &cli,
                staging,
                output,
                *max_concurrency,
                *timeout_secs,
                *remove_staging,
            )
            .await
        }
        Commands::Status { json } => cmd_status(&cli, *json).await,
        Commands::Setup => cmd_setup(&cli).await,
    }
}

async fn cmd_publish(
    cli: &Cli,
    staging: &Path,
    output: &Path,
    max_concurrency: Option<usize>,
    timeout_secs: Option<u64>,
    remove_staging: bool,
) -> anyhow::Result<()> {
    let mut settings = Settings::load_or_default(&settings_path(cli))
        .with_context(|| format!("loading {}", settings_path(cli).display()))?;
    if let Some(n) = max_concurrency {
        settings.merge.max_concurrency = n;
    }
    if timeout_secs.is_some() {
        settings.merge.timeout_secs = timeout_secs;
    }
    settings.validate()?;

    let log_dir = settings
        .logging
        .log_dir
        .clone()
        .unwrap_or_else(|| cli.data_dir.join("logs"));
    let _guard = init_logging(&log_dir, &settings.logging.filter)?;

    tracing::info!(
        staging = %staging.display(),
        output = %output.display(),
        max_concurrency = settings.merge.max_concurrency,
        "Publishing"
    );

    let merger = Merger::new(settings.merge.clone());
    let cancel = CancelToken::new();
    let run = merger.merge_with_cancel(staging, output, cancel.clone());
    tokio::pin!(run);

    let result = tokio::select! {
        res = &mut run => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling merge");
            cancel.cancel();
            run.await
        }
    };

    let report = result.with_context(|| {
        format!(
            "publishing {} into {}",
            staging.display(),
            output.display()
        )
    })?;

    println!("Published {} -> {}", staging.display(), output.display());
    println!("  Directories created: {}", report.summary.dirs_created);
    println!("  Files created:       {}", report.summary.files_created);
    println!("  Files overwritten:   {}", report.summary.files_overwritten);
    println!("  Files up to date:    {}", report.summary.files_skipped);
    println!("  Took:                {:?}", report.elapsed);

    if remove_staging {
        tokio::fs::remove_dir_all(staging)
            .await
            .with_context(|| format!("removing {}", staging.display()))?;
        tracing::info!(staging = %staging.display(), "Removed staging directory");
    }

    Ok(())
}

async fn cmd_status(cli: &Cli, json: bool) -> anyhow::Result<()> {
    let path = settings_path(cli);
    let found = path.exists();
    let settings = Settings::load_or_default(&path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }

    println!("TinyMerge Status");
    println!("================");
    println!();
    if found {
        println!("Configuration: {}", path.display());
    } else {
        println!("Configuration: Not found (using defaults)");
        println!("  Run 'tinymerge setup' to configure");
    }
    println!("  Max concurrency: {}", settings.merge.max_concurrency);
    println!(
        "  Backup directory: {}",
        settings.merge.backup_parent().display()
    );
    match settings.merge.timeout_secs {
        Some(secs) => println!("  Timeout: {}s", secs),
        None => println!("  Timeout: none"),
    }
    println!(
        "  Log directory: {}",
        settings
            .logging
            .log_dir
            .clone()
            .unwrap_or_else(|| cli.data_dir.join("logs"))
            .display()
    );
    println!("  Log filter: {}", settings.logging.filter);

    Ok(())
}

async fn cmd_setup(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.data_dir)?;
    let mut settings = Settings::load_or_default(&settings_path(cli))?;

    println!();
    println!("TinyMerge - Setup Wizard");
    println!("========================");
    println!();

    settings.merge.max_concurrency = dialoguer::Input::new()
        .with_prompt("Maximum concurrent file operations")
        .default(settings.merge.max_concurrency)
        .validate_with(|n: &usize| {
            if *n == 0 {
                Err("must be at least 1")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let backup_dir: String = dialoguer::Input::new()
        .with_prompt("Backup directory (empty for system temp)")
        .allow_empty(true)
        .default(
            settings
                .merge
                .backup_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        )
        .interact_text()?;
    settings.merge.backup_dir = if backup_dir.trim().is_empty() {
        None
    } else {
        Some(PathBuf::from(backup_dir.trim()))
    };

    let timeout: u64 = dialoguer::Input::new()
        .with_prompt("Merge timeout in seconds (0 for none)")
        .default(settings.merge.timeout_secs.unwrap_or(0))
        .interact_text()?;
    settings.merge.timeout_secs = (timeout > 0).then_some(timeout);

    let filters = vec!["info", "debug", "warn", "trace"];
    let filter_idx = dialoguer::Select::new()
        .with_prompt("Log level")
        .items(&filters)
        .default(0)
        .interact()?;
    settings.logging.filter = filters[filter_idx].to_string();

    settings.save(&settings_path(cli))?;

    println!();
    println!("Configuration saved to {}", settings_path(cli).display());
    println!();
    println!("Publish with: tinymerge publish <staging> <output>");
    println!();

    Ok(())
}
