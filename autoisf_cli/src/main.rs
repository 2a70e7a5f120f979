use autoisf_core::audit::{DecisionSink, JsonlAuditLog};
use autoisf_core::policy::{fields, FieldKind};
use autoisf_core::*;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "autoisf")]
#[command(about = "autoISF sensitivity and dosing-safety decisions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble one decision from a cycle snapshot
    Decide {
        /// Snapshot JSON written by the scheduler
        #[arg(long)]
        snapshot: PathBuf,

        /// Dry run - show the decision without logging it
        #[arg(long)]
        dry_run: bool,

        /// Print the decision record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Roll up the audit log to CSV
    Rollup {
        /// Clean up processed audit logs after rollup
        #[arg(long)]
        cleanup: bool,
    },

    /// Show recent decisions
    History {
        /// How far back to look
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },

    /// Show the policy in effect
    Policy,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    autoisf_core::logging::init_with_level(&config.logging.level);

    if let Some(dir) = cli.data_dir {
        config.data.data_dir = dir;
    }
    tracing::debug!("Using data directory {:?}", config.data.data_dir);

    match cli.command {
        Commands::Decide {
            snapshot,
            dry_run,
            json,
        } => cmd_decide(&config, snapshot, dry_run, json),
        Commands::Rollup { cleanup } => cmd_rollup(&config, cleanup),
        Commands::History { hours } => cmd_history(&config, hours),
        Commands::Policy => cmd_policy(&config),
    }
}

fn cmd_decide(config: &Config, snapshot_path: PathBuf, dry_run: bool, json: bool) -> Result<()> {
    let record = match load_snapshot(&snapshot_path)? {
        Some(mut snapshot) => {
            // A policy embedded in the snapshot wins over the configured one
            if snapshot.policy.is_none() {
                snapshot.policy = Some(config.effective_policy()?);
            }
            assemble_decision(&snapshot)
        }
        None => DecisionRecord::neutral(chrono::Utc::now(), true, &config.effective_policy()?),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        display_decision(&record);
    }

    if dry_run {
        if !json {
            println!("\n[Dry run - not logging decision]");
        }
        return Ok(());
    }

    let mut log = JsonlAuditLog::new(config.audit_log_path());
    log.append(&record)?;
    if !json {
        println!("\n✓ Decision logged");
    }
    Ok(())
}

fn cmd_rollup(config: &Config, cleanup: bool) -> Result<()> {
    let log_path = config.audit_log_path();
    let csv_path = config.csv_path();

    if !log_path.exists() {
        println!("No audit log found - nothing to roll up.");
        return Ok(());
    }

    let count = autoisf_core::csv_rollup::audit_to_csv_and_archive(&log_path, &csv_path)?;
    println!("✓ Rolled up {} decisions to CSV", count);
    println!("  CSV: {}", csv_path.display());

    if cleanup {
        if let Some(dir) = log_path.parent() {
            let cleaned = autoisf_core::csv_rollup::cleanup_processed_logs(dir)?;
            if cleaned > 0 {
                println!("✓ Cleaned up {} processed audit logs", cleaned);
            }
        }
    }
    Ok(())
}

fn cmd_history(config: &Config, hours: i64) -> Result<()> {
    let records = load_recent_decisions(&config.audit_log_path(), hours)?;
    if records.is_empty() {
        println!("No decisions in the last {} hours.", hours);
        return Ok(());
    }

    for record in &records {
        let glucose = record
            .glucose
            .map_or_else(|| "   -".to_string(), |g| format!("{:>4.0}", g));
        let basal = record
            .basal_override
            .as_ref()
            .map_or_else(String::new, |o| {
                format!("  {} {:.2} U/hr {:.0}m", o.kind_name(), o.rate(), o.duration_minutes())
            });
        println!(
            "{}  BG {}  ratio {:.2}  SMB {}{}",
            record.timestamp.format("%Y-%m-%d %H:%M"),
            glucose,
            record.sensitivity_ratio,
            if record.smb_enabled { "on " } else { "off" },
            basal
        );
    }

    if let Some(o) = autoisf_core::history::last_override(&records) {
        println!("\nLast basal override: {}", o.kind_name());
    }
    Ok(())
}

fn cmd_policy(config: &Config) -> Result<()> {
    let policy = config.effective_policy()?;

    let mut section = "";
    for field in fields() {
        if field.section != section {
            section = field.section;
            println!("\n[{}]", section);
        }
        let unit = match &field.kind {
            FieldKind::Decimal { unit, .. } => *unit,
            FieldKind::Toggle => "",
        };
        println!(
            "  {:<36} {:>8} {:<6} {}",
            field.key,
            (field.read)(&policy).to_string(),
            unit,
            field.label
        );
    }

    let errors = policy.validate();
    if !errors.is_empty() {
        println!("\nOut of range:");
        for error in errors {
            println!("  - {}", error);
        }
    }
    Ok(())
}

fn display_decision(record: &DecisionRecord) {
    println!("\n╭─────────────────────────────────────────╮");
    println!("│  autoISF DECISION");
    println!("╰─────────────────────────────────────────╯");
    println!();
    if let Some(glucose) = record.glucose {
        println!("  Glucose: {:.0} mg/dL", glucose);
    }
    println!("  Sensitivity ratio: {:.2}", record.sensitivity_ratio);
    if let Some(isf) = record.adjusted_isf {
        println!("  Adjusted ISF: {:.1}", isf);
    }
    for c in &record.per_factor_breakdown {
        if c.active {
            println!("    {:<10} {:.2}", c.name(), c.ratio);
        }
    }
    println!(
        "  SMB: {} (delivery ratio {:.2}, max {:.0}/{:.0} min)",
        if record.smb_enabled { "enabled" } else { "disabled" },
        record.smb_delivery_ratio,
        record.max_smb_basal_minutes,
        record.max_uam_smb_basal_minutes
    );
    match &record.basal_override {
        Some(o) => println!(
            "  Basal override: {} {:.2} U/hr for {:.0} min",
            o.kind_name(),
            o.rate(),
            o.duration_minutes()
        ),
        None => println!("  Basal override: none"),
    }
    println!();
    println!("  Reasons:");
    for reason in &record.reason_trail {
        println!("  → {}", reason);
    }
}
