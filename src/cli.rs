use anyhow::{Result, bail};
use clap::{Parser, Subcommand};

use crate::commands::{self, CommandReport};

#[derive(Parser)]
#[command(name = "dvsync")]
#[command(
    version,
    about = "Reconcile tabular archival metadata into a Dataverse repository",
    long_about = None
)]
struct Cli {
    /// Print the report as JSON
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile every input row against the repository (preview unless --commit)
    Sync(commands::sync::SyncArgs),

    /// Search-only identity resolution for rows that have no mapping yet
    Resolve(commands::resolve::ResolveArgs),

    /// Merge batch update logs into the base mapping table
    MergeMaps(commands::merge_maps::MergeMapsArgs),

    /// Build canonical fields and metadata blocks locally, without network
    Render(commands::render::RenderArgs),
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let status = if report.ok { "ok" } else { "failed" };
    println!("{}: {status}", report.command);
    for detail in &report.details {
        println!("  {detail}");
    }
    for issue in &report.issues {
        println!("  issue: {issue}");
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    crate::logging::init();

    let report = match cli.cmd {
        Commands::Sync(args) => commands::sync::run(&args)?,
        Commands::Resolve(args) => commands::resolve::run(&args)?,
        Commands::MergeMaps(args) => commands::merge_maps::run(&args)?,
        Commands::Render(args) => commands::render::run(&args)?,
    };

    print_report(&report, cli.json)?;
    if !report.ok {
        bail!("{} finished with {} issue(s)", report.command, report.issues.len());
    }
    Ok(())
}
