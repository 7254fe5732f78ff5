//! CLI tool for inspecting and copying robot datasets.

mod error;

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use clap::{Parser, Subcommand};
use log::debug;
use robo_dataset_core::{
    dataset::{RODataset, Row},
    multi_row::ROMultiRowDataset,
    row_sampler::DeltaTimestampSamplerConfig,
};
use serde::Serialize;
use serde_json::json;
use snafu::{ResultExt, ensure};

use crate::error::{
    CliResult, ConfigJsonSnafu, ConfigMissingSnafu, CopyDatasetSnafu, EncodeSnafu,
    InvalidRangeSnafu, OpenDatasetSnafu, OutputSnafu, ReadDatasetSnafu, SampleSnafu,
};

#[derive(Debug, Subcommand)]
enum Command {
    /// Print manifest and metadata summary as one JSON object
    Info {
        #[arg(long)]
        dataset: PathBuf,
    },

    /// Print every episode as a JSON line
    Episodes {
        #[arg(long)]
        dataset: PathBuf,
    },

    /// Print frame rows as JSON lines
    Row {
        #[arg(long)]
        dataset: PathBuf,

        /// Repeatable row index; order and repeats are kept
        #[arg(long = "index", required = true)]
        index: Vec<usize>,

        /// Repeatable feature column; default is all columns
        #[arg(long = "column")]
        column: Vec<String>,

        /// Attach episode, robot, task and instruction to each row
        #[arg(long, default_value_t = false)]
        meta: bool,
    },

    /// Print rows with delta-timestamp sampling as JSON lines
    Sample {
        #[arg(long)]
        dataset: PathBuf,

        /// JSON file holding a DeltaTimestampSamplerConfig
        #[arg(long)]
        config: PathBuf,

        /// Repeatable anchor row index
        #[arg(long = "index", required = true)]
        index: Vec<usize>,
    },

    /// Write a (projected, row-ranged) copy of a dataset
    Copy {
        #[arg(long)]
        dataset: PathBuf,

        /// Target directory; must not exist or be empty
        #[arg(long)]
        out: PathBuf,

        /// Repeatable feature column to keep; default is all columns
        #[arg(long = "column")]
        column: Vec<String>,

        /// First row to copy
        #[arg(long)]
        start: Option<usize>,

        /// One past the last row to copy
        #[arg(long)]
        end: Option<usize>,

        /// Print elapsed time for the copy
        #[arg(long, default_value_t = false)]
        timing: bool,
    },
}

#[derive(Debug, Parser)]
#[command(name = "robo-dataset", version, about)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

struct CopyArgs {
    dataset: PathBuf,
    out: PathBuf,
    column: Vec<String>,
    start: Option<usize>,
    end: Option<usize>,
    timing: bool,
}

fn print_json_line<T: Serialize>(out: &mut impl Write, value: &T) -> CliResult<()> {
    serde_json::to_writer(&mut *out, value).context(EncodeSnafu)?;
    writeln!(out).context(OutputSnafu)
}

fn print_rows(rows: Vec<Row>) -> CliResult<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for row in rows {
        print_json_line(&mut out, &row.to_json())?;
    }
    out.flush().context(OutputSnafu)
}

async fn open_dataset(dataset: &Path, meta: bool) -> CliResult<RODataset> {
    RODataset::open(dataset, meta)
        .await
        .context(OpenDatasetSnafu {
            dataset: dataset.display().to_string(),
        })
}

async fn cmd_info(dataset: &Path) -> CliResult<()> {
    let ds = open_dataset(dataset, false).await?;
    let counts = ds.meta_counts().context(ReadDatasetSnafu {
        dataset: dataset.display().to_string(),
    })?;
    let manifest = ds.manifest();
    let info = json!({
        "path": ds.path(),
        "format_version": manifest.format_version,
        "database_driver": manifest.database_driver,
        "rows": manifest.row_count,
        "episodes": manifest.episode_count,
        "shards": manifest.shards.len(),
        "max_shard_size": manifest.max_shard_size,
        "created_at": manifest.created_at,
        "columns": ds.column_names(),
        "meta": counts,
    });
    print_json_line(&mut io::stdout().lock(), &info)
}

async fn cmd_episodes(dataset: &Path) -> CliResult<()> {
    let ds = open_dataset(dataset, false).await?;
    let episodes = ds.episodes().context(ReadDatasetSnafu {
        dataset: dataset.display().to_string(),
    })?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for episode in &episodes {
        print_json_line(&mut out, episode)?;
    }
    out.flush().context(OutputSnafu)
}

async fn cmd_row(
    dataset: &Path,
    index: Vec<usize>,
    column: Vec<String>,
    meta: bool,
) -> CliResult<()> {
    let read_ctx = || ReadDatasetSnafu {
        dataset: dataset.display().to_string(),
    };
    let mut ds = open_dataset(dataset, meta).await?;
    if !column.is_empty() {
        ds = ds.select_columns(&column).context(read_ctx())?;
    }
    let batch = ds.get_batch(index).context(read_ctx())?;
    print_rows(batch.into_rows())
}

async fn cmd_sample(dataset: &Path, config: &Path, index: Vec<usize>) -> CliResult<()> {
    let raw = tokio::fs::read_to_string(config)
        .await
        .context(ConfigMissingSnafu {
            path: config.display().to_string(),
        })?;
    let sampler: DeltaTimestampSamplerConfig =
        serde_json::from_str(&raw).context(ConfigJsonSnafu {
            path: config.display().to_string(),
        })?;
    debug!("sampler config: {sampler:?}");

    let ds = open_dataset(dataset, false).await?;
    let multi = ROMultiRowDataset::from_dataset(ds, sampler).context(SampleSnafu)?;
    let batch = multi.get_batch(index).context(SampleSnafu)?;
    print_rows(batch.into_rows())
}

async fn cmd_copy(args: CopyArgs) -> CliResult<()> {
    let started = Instant::now();
    let read_ctx = || ReadDatasetSnafu {
        dataset: args.dataset.display().to_string(),
    };
    let mut ds = open_dataset(&args.dataset, false).await?;
    if !args.column.is_empty() {
        ds = ds.select_columns(&args.column).context(read_ctx())?;
    }
    if args.start.is_some() || args.end.is_some() {
        let len = ds.len();
        let start = args.start.unwrap_or(0);
        let end = args.end.unwrap_or(len);
        ensure!(start <= end && end <= len, InvalidRangeSnafu { start, end, len });
        ds = ds.select(start..end).context(read_ctx())?;
    }

    ds.save_to_disk(&args.out).await.context(CopyDatasetSnafu {
        dst: args.out.display().to_string(),
    })?;

    if args.timing {
        println!(
            "Copied {} rows to {} (elapsed_ms: {})",
            ds.len(),
            args.out.display(),
            started.elapsed().as_millis()
        );
    } else {
        println!("Copied {} rows to {}", ds.len(), args.out.display());
    }
    Ok(())
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Info { dataset } => cmd_info(&dataset).await,

        Command::Episodes { dataset } => cmd_episodes(&dataset).await,

        Command::Row {
            dataset,
            index,
            column,
            meta,
        } => cmd_row(&dataset, index, column, meta).await,

        Command::Sample {
            dataset,
            config,
            index,
        } => cmd_sample(&dataset, &config, index).await,

        Command::Copy {
            dataset,
            out,
            column,
            start,
            end,
            timing,
        } => {
            cmd_copy(CopyArgs {
                dataset,
                out,
                column,
                start,
                end,
                timing,
            })
            .await
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
