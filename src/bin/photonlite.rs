//! PhotonLite admin tool
//!
//! Inspection and maintenance of a database directory:
//! - list tables and storage statistics
//! - dump a table as JSON lines, in primary or index order
//! - read the replication journal
//! - compact the database file, drop tables
//!
//! # Examples
//!
//! ```bash
//! photonlite --data-dir data/app tables
//! photonlite --data-dir data/app dump people --index by_name --limit 10
//! photonlite --data-dir data/app journal --after 120
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use photonlite::{Database, DatabaseConfig, Query};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PhotonLite - embedded document store
#[derive(Parser, Debug)]
#[command(name = "photonlite")]
#[command(version = photonlite::VERSION)]
#[command(about = "Inspect and maintain a PhotonLite database", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database directory
    #[arg(long, global = true, default_value = "data/photonlite", env = "PHOTONLITE_DATA")]
    data_dir: PathBuf,

    /// TOML configuration file
    #[arg(long, global = true, env = "PHOTONLITE_CONFIG")]
    config: Option<PathBuf>,

    /// Also write logs to daily files in this directory
    #[arg(long, global = true, env = "PHOTONLITE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List tables
    Tables {
        /// Include the database's own keyspaces
        #[arg(long)]
        system: bool,
    },

    /// Show storage and per-table statistics
    Stats,

    /// Print documents as JSON lines
    Dump(DumpArgs),

    /// Print replication journal entries as JSON lines
    Journal {
        /// Only entries after this sequence number
        #[arg(long, default_value = "0")]
        after: u64,

        /// Maximum number of entries
        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// Release free pages and shrink the database file
    Compact,

    /// Drop a table and its indexes
    Drop {
        /// Table name
        name: String,

        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct DumpArgs {
    /// Table name
    table: String,

    /// Walk in this index's order
    #[arg(short, long)]
    index: Option<String>,

    /// Maximum number of documents
    #[arg(short, long)]
    limit: Option<usize>,

    /// Walk from the end
    #[arg(short, long)]
    reverse: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // keep the file writer's guard alive until exit
    let _guard = setup_logging(&cli)?;

    let config = DatabaseConfig::load(cli.config.as_deref())
        .with_context(|| "Failed to load configuration")?;
    let db = Database::open(&cli.data_dir, config)
        .with_context(|| format!("Failed to open database at {}", cli.data_dir.display()))?;

    let result = match cli.command {
        Commands::Tables { system } => tables_command(&db, system),
        Commands::Stats => stats_command(&db),
        Commands::Dump(args) => dump_command(&db, args),
        Commands::Journal { after, limit } => journal_command(&db, after, limit),
        Commands::Compact => compact_command(&db),
        Commands::Drop { name, force } => drop_command(&db, &name, force),
    };

    db.close()?;
    result
}

/// Console logging on stderr plus optional daily log files
fn setup_logging(cli: &Cli) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);
    let filter = EnvFilter::from_default_env().add_directive(log_level.into());
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(!cli.no_color);

    match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "photonlite.log");
            let (writer, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(console)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(console).with(filter).init();
            Ok(None)
        }
    }
}

fn tables_command(db: &Database, system: bool) -> anyhow::Result<()> {
    let names = db.tables(system)?;
    if names.is_empty() {
        println!("No tables.");
    } else {
        for name in names {
            println!("{}", name);
        }
    }
    Ok(())
}

fn stats_command(db: &Database) -> anyhow::Result<()> {
    println!("Path:       {}", db.path().display());
    println!("Map size:   {} bytes", db.map_size()?);
    println!("Used:       {} bytes", db.storage_used()?);
    println!("Allocated:  {} bytes", db.storage_allocated()?);
    println!("Journal:    {}", if db.config().replication { "on" } else { "off" });

    for name in db.tables(false)? {
        let table = db.table(&name)?;
        let settings = table.settings();
        let (records, used) = db.read(|scope| Ok((table.records(scope)?, table.storage_used(scope)?)))?;
        println!();
        println!("Table: {}", name);
        println!("  Documents:   {}", records);
        println!("  Used:        {} bytes", used);
        println!("  Codec:       {}", settings.codec.name());
        println!("  Compression: {}", settings.compression.name());
        println!("  Created:     {}", settings.created_at.to_rfc3339());
        for index in table.index_names() {
            let Some(config) = table.index_config(&index) else {
                continue;
            };
            let key = config
                .key
                .clone()
                .or_else(|| config.func.clone().map(|f| format!("fn:{}", f)))
                .unwrap_or_default();
            let kind = if config.dupsort { "dup" } else { "unique" };
            println!("  Index {} ({}): {}", index, kind, key);
        }
    }
    Ok(())
}

fn dump_command(db: &Database, args: DumpArgs) -> anyhow::Result<()> {
    if !db.exists(&args.table)? {
        anyhow::bail!("No such table: {}", args.table);
    }
    let table = db.table(&args.table)?;

    let mut query = Query::new().reverse(args.reverse);
    if let Some(index) = &args.index {
        query = query.index(index.clone());
    }
    if let Some(limit) = args.limit {
        query = query.limit(limit);
    }

    let count = db.read(|scope| {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let mut count = 0usize;
        for doc in table.find(scope, query.clone())? {
            let doc = doc?;
            let line = serde_json::json!({ "oid": doc.oid, "doc": doc.content });
            writeln!(out, "{}", line)?;
            count += 1;
        }
        Ok(count)
    })?;
    info!(table = %args.table, count, "Dumped table");
    Ok(())
}

fn journal_command(db: &Database, after: u64, limit: usize) -> anyhow::Result<()> {
    let entries = db.journal(after, limit)?;
    if entries.is_empty() && !db.config().replication {
        eprintln!("Replication is off; the journal is not being written.");
    }
    for entry in entries {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

fn compact_command(db: &Database) -> anyhow::Result<()> {
    let before = db.storage_allocated()?;
    db.compact()?;
    let after = db.storage_allocated()?;
    println!("Compacted: {} -> {} bytes", before, after);
    Ok(())
}

fn drop_command(db: &Database, name: &str, force: bool) -> anyhow::Result<()> {
    if !force {
        print!("Drop table '{}'? (yes/no): ", name);
        std::io::stdout().flush()?;
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if input.trim().to_lowercase() != "yes" {
            println!("Aborted.");
            return Ok(());
        }
    }
    db.drop(name)?;
    println!("Dropped table '{}'", name);
    Ok(())
}
