use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use trainstore::{worker, Config, FsStore, IngestStats};

#[derive(Parser)]
#[command(name = "ingest-firehose")]
#[command(about = "Ingest one firehose file into the rewarded-decision partition store")]
struct Cli {
    /// Filesystem root backing the train bucket (defaults to $TRAIN_BUCKET as a path)
    #[arg(long)]
    train_root: Option<PathBuf>,

    /// Filesystem root backing the firehose bucket (defaults to $FIREHOSE_BUCKET as a path)
    #[arg(long)]
    firehose_root: Option<PathBuf>,

    /// Firehose file key to process (overrides $INCOMING_FIREHOSE_S3_KEY)
    #[arg(long)]
    incoming_key: Option<String>,

    /// Process every incoming file under this prefix that the node
    /// selection rule assigns to $AWS_BATCH_JOB_ARRAY_INDEX, instead of
    /// the single configured key
    #[arg(long, conflicts_with = "incoming_key")]
    incoming_prefix: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(key) = cli.incoming_key {
        config.incoming_firehose_key = key;
    }

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if config.debug { "debug" } else { "info" }),
    )
    .init();

    worker::install_signal_handlers();

    let train_root = cli
        .train_root
        .unwrap_or_else(|| PathBuf::from(&config.train_bucket));
    let firehose_root = cli
        .firehose_root
        .unwrap_or_else(|| PathBuf::from(&config.firehose_bucket));
    let train = FsStore::open(train_root)?;
    let firehose = FsStore::open(firehose_root)?;

    let stats = IngestStats::default();
    let result = match &cli.incoming_prefix {
        Some(prefix) => worker::run_node(&config, &firehose, &train, &stats, prefix),
        None => worker::run(&config, &firehose, &train, &stats),
    };
    println!("{stats}");
    result
}
