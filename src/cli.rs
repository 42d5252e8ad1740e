use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "coinmatch",
    version,
    about = "CoinSnap inventory ingestion and Numista catalogue reconciliation"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load a CoinSnap CSV export into the coin table, deduplicated by
    /// natural key with occurrence counts.
    Ingest(IngestArgs),
    /// Search Numista for every coin below the match threshold and store
    /// candidate matches.
    Reconcile(ReconcileArgs),
    /// Report manifest and database state.
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    #[arg(long, default_value = ".cache/coinmatch")]
    pub data_root: PathBuf,

    /// CSV export to ingest; defaults to the newest CoinSnap export in
    /// ~/Downloads, falling back to ./snap-export.csv.
    #[arg(long)]
    pub csv_path: Option<PathBuf>,

    #[arg(long)]
    pub db_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ReconcileArgs {
    #[arg(long, default_value = ".cache/coinmatch")]
    pub data_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Coins with at least this many stored matches are skipped.
    #[arg(long, default_value_t = 1)]
    pub min_matches: i64,

    /// Stop after this many coins, for partial runs.
    #[arg(long)]
    pub max_items: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/coinmatch")]
    pub data_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    pub min_matches: i64,
}
