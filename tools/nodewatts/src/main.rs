use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use nodewatts::config::Config;
use nodewatts::report::Report;
use nodewatts::session::SessionController;
use nodewatts::store::{SampleStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "nodewatts")]
#[command(about = "Power profiling for Node.js web servers", long_about = None)]
struct Cli {
    /// Log at debug level. `RUST_LOG` takes precedence when set.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Profile a server while its test suite runs, and store the report.
    Run {
        /// JSON configuration file.
        #[arg(long)]
        config_file: PathBuf,

        /// Also write the finished report as JSON to this path.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// List stored reports.
    Reports {
        /// Report database. Defaults to `~/.local/share/nodewatts/nodewatts.db`.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Emit JSON to stdout instead of human-readable text.
        #[arg(long)]
        json: bool,
    },

    /// Print a stored report.
    Show {
        name: String,

        #[arg(long)]
        db: Option<PathBuf>,

        /// Emit the full report as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    #[cfg(unix)]
    unsafe {
        // Restore default SIGPIPE so `nodewatts reports | head` exits quietly.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Run { config_file, output } => return run(&config_file, output.as_deref()),
        Command::Reports { db, json } => list_reports(db, json).context("list reports"),
        Command::Show { name, db, json } => show(&name, db, json).context("show report"),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run(config_file: &Path, output: Option<&Path>) -> ExitCode {
    let config = match Config::load(config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };
    if !nix::unistd::Uid::effective().is_root() {
        error!("nodewatts must run as root to monitor system power");
        return ExitCode::from(1);
    }
    let missing = config.missing_tools();
    if !missing.is_empty() {
        error!(?missing, "required programs not found on PATH");
        return ExitCode::from(1);
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        if let Err(e) = ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        }) {
            warn!(error = %e, "failed to install interrupt handler");
        }
    }

    let mut store = match SqliteStore::open(&config.database.path) {
        Ok(store) => store,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };

    info!("configuration valid, starting nodewatts");
    let mut controller = SessionController::new(config, interrupted);
    match controller.run(&mut store) {
        Ok(report) => {
            if let Some(path) = output {
                if let Err(e) = write_report(path, &report) {
                    warn!("{e:#}");
                }
            }
            print_human(&report);
            ExitCode::SUCCESS
        }
        Err(failure) => {
            error!("{}", failure.error);
            ExitCode::from(u8::try_from(failure.exit_code()).unwrap_or(9))
        }
    }
}

fn write_report(path: &Path, report: &Report) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("serialize report")?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    eprintln!("Wrote report to {}", path.display());
    Ok(())
}

fn open_store(db: Option<PathBuf>) -> Result<SqliteStore> {
    let path = match db {
        Some(path) => path,
        None => std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".local/share/nodewatts/nodewatts.db"))
            .context("HOME is not set; pass --db")?,
    };
    SqliteStore::open(&path).with_context(|| format!("open {}", path.display()))
}

fn list_reports(db: Option<PathBuf>, json: bool) -> Result<()> {
    let store = open_store(db)?;
    let reports = store.reports()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }
    if reports.is_empty() {
        println!("no reports");
    }
    for r in reports {
        println!("{}  {}", r.created_at, r.name);
    }
    Ok(())
}

fn show(name: &str, db: Option<PathBuf>, json: bool) -> Result<()> {
    let store = open_store(db)?;
    let report = store
        .load_report(name)?
        .with_context(|| format!("no report named {name:?}"))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_human(&report);
    }
    Ok(())
}

fn print_human(report: &Report) {
    let stats = &report.stats;
    println!("nodewatts report {}", report.name);
    println!("  created: {}", report.created_at.to_rfc3339());
    println!("  project: {}", report.session.project_root.display());
    println!("  tests: {} x {}", report.session.test_runs, report.session.test_command);

    println!("\nsamples:");
    println!("  cpu: {}", stats.cpu_samples);
    println!(
        "  power: {} ({} above {} W dropped)",
        stats.power_pre_filter.count, stats.dropped_outliers, stats.outlier_ceiling
    );
    if let (Some(mean), Some(median)) = (stats.power_post_filter.mean, stats.power_post_filter.median) {
        println!("  power mean/median: {mean:.2} / {median:.2} W");
    }
    if let Some(avg) = stats.filtered_assignments.avg_delta {
        println!(
            "  match distance avg: {avg:.0} us, reused estimates: {}",
            stats.filtered_assignments.reused
        );
    }

    println!("\ncategories:");
    for total in report.category_totals() {
        match total.mean_power {
            Some(mean) => println!("  {:<32} {:>6} samples  {mean:>8.2} W", total.label, total.samples),
            None => println!("  {:<32} {:>6} samples", total.label, total.samples),
        }
    }
}
