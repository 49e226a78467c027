//! Sheetline - formula-driven sheets materialized into SQLite

mod definition;
mod error;
mod output;
mod settings;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use sheetline_core::{ActiveContext, Filter, MemoryProvider, ModelProvider, Session, SheetlineError, Warnings};

use crate::definition::SheetDefinition;
use crate::output::{OutputFormat, write_rows};

#[derive(Parser)]
#[command(name = "sheetline", version, about = "Define, activate and compute formula-driven sheets.")]
struct Cli {
    /// SQLite database (defaults to sheetline.db in the data directory).
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Config file (defaults to config.toml in the config directory).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// JSON document of in-memory models backing model datasets.
    #[arg(long, global = true, value_name = "PATH")]
    models: Option<PathBuf>,

    /// Rhai script of functions formulas may call (can be repeated).
    #[arg(short = 'f', long = "functions", global = true, value_name = "FILE")]
    functions: Vec<PathBuf>,

    /// Log at debug level, overriding SHEETLINE_LOG.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database.
    Init,
    /// Create or replace a draft sheet from a TOML definition.
    Define { file: PathBuf },
    /// Print the severity of each formula.
    Check { alias: String },
    /// Provision a new table revision and compute it.
    Activate {
        alias: String,
        /// Proceed even if migrating rows drops columns.
        #[arg(long)]
        accept_loss: bool,
    },
    /// Rebuild the current table from the dataset.
    Compute { alias: String },
    /// Move a sheet back to draft.
    Draft { alias: String },
    /// Cancel a sheet.
    Cancel { alias: String },
    /// Print the rows of a sheet.
    Show {
        alias: String,
        /// Filter as JSON, e.g. '[["x", ">", 1]]'.
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Markdown)]
        format: OutputFormat,
    },
    /// Drop tables no sheet uses any more.
    Reap {
        #[arg(long, default_value_t = 1)]
        days: u32,
    },
    /// List sheets.
    Sheets,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("SHEETLINE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_session(cli: &Cli) -> anyhow::Result<Session> {
    let mut config = settings::load_config(cli.config.as_deref())?;
    config.functions.extend(cli.functions.iter().cloned());
    let provider = match &cli.models {
        Some(path) => {
            let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let provider = MemoryProvider::from_json(&content).with_context(|| format!("parsing {}", path.display()))?;
            Some(Arc::new(provider) as Arc<dyn ModelProvider>)
        }
        None => None,
    };
    let db = match &cli.db {
        Some(path) => path.clone(),
        None => settings::default_db_path().ok_or_else(|| anyhow!("no data directory, pass --db"))?,
    };
    if let Some(parent) = db.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    debug!(db = %db.display(), functions = config.functions.len(), "opening session");
    Ok(Session::open(&db, config, provider)?)
}

fn define(session: &Session, file: &Path) -> anyhow::Result<()> {
    let def = SheetDefinition::load(file)?;
    let dataset = def.dataset_source(session)?;
    let sheet = session.define(
        &def.to_new_sheet(),
        dataset.as_ref().map(|(name, source)| (name.as_str(), source)),
    )?;
    info!(sheet = %sheet.alias, revision = sheet.revision, "defined");
    println!("Defined {} ({} formulas)", sheet.alias, sheet.formulas.len());
    Ok(())
}

fn activate(session: &Session, alias: &str, accept_loss: bool) -> anyhow::Result<()> {
    let warnings = if accept_loss {
        Warnings::accept_all()
    } else {
        Warnings::new()
    };
    let report = match session.activate(alias, &warnings) {
        Ok(report) => report,
        Err(SheetlineError::UserWarning { key, message }) => {
            debug!(sheet = alias, warning = %key, "activation needs acknowledgement");
            return Err(anyhow!("{}\nRun again with --accept-loss to proceed.", message));
        }
        Err(SheetlineError::FormulaErrors(checks)) => {
            for check in &checks {
                eprintln!("{}: {}", check.alias, describe(check));
            }
            return Err(anyhow!("{} formula(s) prevent activation", checks.len()));
        }
        Err(e) => return Err(e.into()),
    };
    print!("Activated {} as {}", alias, report.table.name);
    if let Some(copy) = &report.copy {
        print!(", copied {} rows", copy.rows);
    }
    if let Some(compute) = &report.compute {
        print!(", computed {} rows", compute.rows);
    }
    println!();
    Ok(())
}

fn describe(check: &sheetline_engine::engine::FormulaCheck) -> String {
    match &check.message {
        Some(message) => format!("{} ({})", check.severity, message),
        None => check.severity.to_string(),
    }
}

fn show(
    session: &Session,
    alias: &str,
    filter: Option<&str>,
    limit: Option<usize>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let sheet = session.sheet(alias)?;
    let ctx = ActiveContext::sheet(sheet.id);
    let conn = session.connection();
    let filter = Filter::parse(filter.unwrap_or(""))?;
    let ids = session.records().search(conn, &ctx, &filter, 0, limit, &[])?;
    debug!(sheet = alias, rows = ids.len(), "matched rows");
    let rows = session.records().read(conn, &ctx, &ids, None)?;
    let columns: Vec<String> = session
        .records()
        .fields(conn, &ctx)?
        .into_iter()
        .filter(|f| f.stored)
        .map(|f| f.name)
        .collect();
    let stdout = std::io::stdout();
    write_rows(&mut stdout.lock(), format, &columns, &rows)?;
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let session = open_session(&cli)?;
    match &cli.command {
        Command::Init => println!("Database ready"),
        Command::Define { file } => define(&session, file)?,
        Command::Check { alias } => {
            for check in session.check(alias)? {
                println!("{}\t{}", check.alias, describe(&check));
            }
        }
        Command::Activate { alias, accept_loss } => activate(&session, alias, *accept_loss)?,
        Command::Compute { alias } => {
            let report = session.compute(alias)?;
            info!(sheet = %alias, rows = report.rows, "computed");
            println!(
                "Computed {} rows in {} batches ({:.2}s)",
                report.rows,
                report.batches,
                report.elapsed.as_secs_f64()
            );
        }
        Command::Draft { alias } => {
            session.draft(alias)?;
            println!("{} is draft", alias);
        }
        Command::Cancel { alias } => {
            session.cancel(alias)?;
            println!("{} is canceled", alias);
        }
        Command::Show {
            alias,
            filter,
            limit,
            format,
        } => show(&session, alias, filter.as_deref(), *limit, *format)?,
        Command::Reap { days } => {
            let removed = session.reap(*days)?;
            info!(days = *days, removed = removed.len(), "reaped tables");
            for name in &removed {
                println!("Dropped {}", name);
            }
            println!("Removed {} tables", removed.len());
        }
        Command::Sheets => {
            for sheet in session.sheets()? {
                println!("{}\t{}\t{}\t{}", sheet.alias, sheet.state, sheet.revision, sheet.name);
            }
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
