//! CLI for the tally telemetry store.
//!
//! Provides commands for querying, maintaining and feeding a tally database.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tally::{
    Aggregate, Collector, Direction, Ingest, MemoryQueue, Order, Period, Sample, SqliteStorage,
    Storage, TallyConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// tally — Buffered application telemetry with multi-period rollups.
#[derive(Parser)]
#[command(name = "tally", version, about)]
struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding `storage.path` from the configuration.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Delete rows past their retention.
    Trim,

    /// Delete all rows, or all rows of the given types.
    Purge {
        /// Types to purge; everything when omitted.
        #[arg(long = "type")]
        types: Vec<String>,
    },

    /// Store samples from a JSON Lines file through the offloaded queue.
    Digest {
        /// File with one serialized sample per line.
        input: PathBuf,
    },

    /// Show the latest values of a type.
    Values {
        /// Value type.
        kind: String,

        /// Restrict to these keys.
        #[arg(long = "key")]
        keys: Vec<String>,
    },

    /// Per-key aggregates of one type over a period.
    Aggregate {
        /// Entry type.
        kind: String,

        /// Aggregates to compute, comma separated.
        #[arg(long, value_delimiter = ',', default_value = "count")]
        aggregates: Vec<Aggregate>,

        /// Trailing period.
        #[arg(long, default_value = "hour")]
        period: Period,

        /// Aggregate to sort by; the first one when omitted.
        #[arg(long)]
        order_by: Option<Aggregate>,

        #[command(flatten)]
        order: OrderArgs,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// One aggregate per key, several types side by side.
    Types {
        /// Entry types.
        #[arg(required = true)]
        types: Vec<String>,

        /// Aggregate to compute.
        #[arg(long, default_value = "count")]
        aggregate: Aggregate,

        /// Trailing period.
        #[arg(long, default_value = "hour")]
        period: Period,

        /// Type to sort by; the first one when omitted.
        #[arg(long)]
        order_by: Option<String>,

        #[command(flatten)]
        order: OrderArgs,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// One aggregate per type across all keys.
    Total {
        /// Entry types.
        #[arg(required = true)]
        types: Vec<String>,

        /// Aggregate to compute.
        #[arg(long, default_value = "count")]
        aggregate: Aggregate,

        /// Trailing period.
        #[arg(long, default_value = "hour")]
        period: Period,
    },

    /// Zero-filled bucket series per key and type, as JSON.
    Graph {
        /// Entry types.
        #[arg(required = true)]
        types: Vec<String>,

        /// Aggregate to chart.
        #[arg(long, default_value = "count")]
        aggregate: Aggregate,

        /// Period whose buckets are charted.
        #[arg(long, default_value = "hour")]
        period: Period,
    },

    /// Record one entry now.
    Record {
        /// Entry type.
        kind: String,

        /// Entry key.
        key: String,

        /// Measured value.
        #[arg(long)]
        value: Option<i64>,

        /// Rollups the entry feeds, comma separated.
        #[arg(long, value_delimiter = ',', default_value = "count")]
        aggregates: Vec<Aggregate>,

        /// Feed rollups only; skip the raw entries table.
        #[arg(long)]
        only_buckets: bool,
    },

    /// Set one value now.
    Set {
        /// Value type.
        kind: String,

        /// Value key.
        key: String,

        /// The snapshot.
        value: String,
    },
}

/// Ordering flags shared by listings.
#[derive(clap::Args)]
struct OrderArgs {
    /// Sort direction.
    #[arg(long, default_value = "desc")]
    direction: DirectionArg,

    /// Maximum number of keys.
    #[arg(long, default_value = "101")]
    limit: usize,
}

impl From<&OrderArgs> for Order {
    fn from(args: &OrderArgs) -> Self {
        Order {
            direction: match args.direction {
                DirectionArg::Asc => Direction::Asc,
                DirectionArg::Desc => Direction::Desc,
            },
            limit: args.limit,
        }
    }
}

/// Sort direction.
#[derive(Clone, ValueEnum)]
enum DirectionArg {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// Output format for listings.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of objects.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> CliResult {
    let config = load_config(cli.config.as_deref(), cli.db)?;
    let clock = tally::clock::system();
    let storage = Arc::new(SqliteStorage::open(&config.storage.path, &config, clock.clone())?);

    match cli.command {
        Commands::Trim => cmd_trim(storage.as_ref()),
        Commands::Purge { types } => cmd_purge(storage.as_ref(), &types),
        Commands::Digest { input } => cmd_digest(&config, storage, &input),
        Commands::Values { kind, keys } => cmd_values(storage.as_ref(), &kind, &keys),
        Commands::Aggregate {
            kind,
            aggregates,
            period,
            order_by,
            order,
            format,
        } => cmd_aggregate(
            storage.as_ref(),
            &kind,
            &aggregates,
            period,
            order_by,
            (&order).into(),
            &format,
        ),
        Commands::Types {
            types,
            aggregate,
            period,
            order_by,
            order,
            format,
        } => cmd_types(
            storage.as_ref(),
            &types,
            aggregate,
            period,
            order_by.as_deref(),
            (&order).into(),
            &format,
        ),
        Commands::Total {
            types,
            aggregate,
            period,
        } => cmd_total(storage.as_ref(), &types, aggregate, period),
        Commands::Graph {
            types,
            aggregate,
            period,
        } => cmd_graph(storage.as_ref(), &types, aggregate, period),
        Commands::Record {
            kind,
            key,
            value,
            aggregates,
            only_buckets,
        } => {
            let ingest = Ingest::from_config(&config, storage, MemoryQueue::new(), clock.clone())?;
            let mut collector = Collector::from_config(&config, Arc::new(ingest), clock);
            {
                let mut entry = collector.record(kind, key, value);
                for aggregate in aggregates {
                    entry.aggregate(aggregate);
                }
                if only_buckets {
                    entry.only_buckets();
                }
            }
            println!("ingested {}", collector.ingest());
            Ok(())
        }
        Commands::Set { kind, key, value } => {
            let ingest = Ingest::from_config(&config, storage, MemoryQueue::new(), clock.clone())?;
            let mut collector = Collector::from_config(&config, Arc::new(ingest), clock);
            collector.set(kind, key, value);
            println!("ingested {}", collector.ingest());
            Ok(())
        }
    }
}

/// Loads the configuration file (or defaults) and applies `--db`.
fn load_config(path: Option<&Path>, db: Option<PathBuf>) -> Result<TallyConfig, tally::TallyError> {
    let mut config = match path {
        Some(path) => TallyConfig::from_path(path)?,
        None => TallyConfig::default(),
    };
    if let Some(db) = db {
        config.storage.path = db;
    }
    config.validate()?;
    Ok(config)
}

fn type_refs(types: &[String]) -> Vec<&str> {
    types.iter().map(String::as_str).collect()
}

/// Implements `tally trim`.
fn cmd_trim(storage: &dyn Storage) -> CliResult {
    let stats = storage.trim()?;
    info!(
        values = stats.values,
        entries = stats.entries,
        aggregates = stats.aggregates,
        "trim complete"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Implements `tally purge [--type T]...`.
fn cmd_purge(storage: &dyn Storage, types: &[String]) -> CliResult {
    if types.is_empty() {
        storage.purge(None)?;
        info!("purged all types");
    } else {
        storage.purge(Some(type_refs(types).as_slice()))?;
        info!(types = ?types, "purged types");
    }
    Ok(())
}

/// Implements `tally digest <input>`.
///
/// Each line is a serialized sample. Lines are queued and then drained into
/// storage in `storage.chunk` batches.
fn cmd_digest(config: &TallyConfig, storage: Arc<SqliteStorage>, input: &Path) -> CliResult {
    let file = std::fs::File::open(input)
        .map_err(|e| format!("failed to open '{}': {e}", input.display()))?;

    let mut samples = Vec::new();
    for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let sample: Sample = serde_json::from_str(&line)
            .map_err(|e| format!("line {}: {e}", n + 1))?;
        samples.push(sample);
    }

    let queue = MemoryQueue::new();
    queue.push(samples)?;

    let clock = tally::clock::system();
    let mut offloaded = config.clone();
    offloaded.ingest.driver = "offloaded".to_string();
    let ingest = Ingest::from_config(&offloaded, storage.clone(), queue, clock.clone())?;
    let mut collector = Collector::from_config(config, Arc::new(ingest), clock);

    let digested = collector.digest(storage.as_ref())?;
    info!(digested, input = %input.display(), "digest complete");
    println!("digested {digested}");
    Ok(())
}

/// Implements `tally values <type> [--key K]...`.
fn cmd_values(storage: &dyn Storage, kind: &str, keys: &[String]) -> CliResult {
    let keys = type_refs(keys);
    let filter = if keys.is_empty() { None } else { Some(keys.as_slice()) };
    let values = storage.values(kind, filter)?;
    println!("{}", serde_json::to_string_pretty(&values)?);
    Ok(())
}

/// Implements `tally aggregate <type>`.
fn cmd_aggregate(
    storage: &dyn Storage,
    kind: &str,
    aggregates: &[Aggregate],
    period: Period,
    order_by: Option<Aggregate>,
    order: Order,
    format: &OutputFormat,
) -> CliResult {
    let rows = storage.aggregate(kind, aggregates, period, order_by, order)?;

    match format {
        OutputFormat::Csv => {
            let header: Vec<&str> = aggregates.iter().map(|a| a.as_str()).collect();
            let cells = rows.iter().map(|row| {
                let cells: Vec<String> = aggregates.iter().map(|a| cell(row.get(*a))).collect();
                (row.key.as_str(), cells)
            });
            write_table(std::io::stdout().lock(), &header, cells)?;
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    Ok(())
}

/// Implements `tally types <type>...`.
fn cmd_types(
    storage: &dyn Storage,
    types: &[String],
    aggregate: Aggregate,
    period: Period,
    order_by: Option<&str>,
    order: Order,
    format: &OutputFormat,
) -> CliResult {
    let refs = type_refs(types);
    let rows = storage.aggregate_types(&refs, aggregate, period, order_by, order)?;

    match format {
        OutputFormat::Csv => {
            let cells = rows.iter().map(|row| {
                let cells: Vec<String> = refs.iter().map(|t| cell(row.get(t))).collect();
                (row.key.as_str(), cells)
            });
            write_table(std::io::stdout().lock(), &refs, cells)?;
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    Ok(())
}

/// Implements `tally total <type>...`.
fn cmd_total(
    storage: &dyn Storage,
    types: &[String],
    aggregate: Aggregate,
    period: Period,
) -> CliResult {
    let totals = storage.aggregate_total(&type_refs(types), aggregate, period)?;
    println!("{}", serde_json::to_string_pretty(&totals)?);
    Ok(())
}

/// Implements `tally graph <type>...`.
fn cmd_graph(
    storage: &dyn Storage,
    types: &[String],
    aggregate: Aggregate,
    period: Period,
) -> CliResult {
    let graph = storage.graph(&type_refs(types), aggregate, period)?;
    println!("{}", serde_json::to_string_pretty(&graph)?);
    Ok(())
}

fn cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Writes a `key,<columns>...` table; fields are quoted where needed.
fn write_table<'a, W: Write>(
    out: W,
    columns: &[&str],
    rows: impl IntoIterator<Item = (&'a str, Vec<String>)>,
) -> CliResult {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(std::iter::once("key").chain(columns.iter().copied()))?;
    for (key, cells) in rows {
        writer.write_record(std::iter::once(key.to_string()).chain(cells))?;
    }
    writer.flush()?;
    Ok(())
}
