use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::db;
use crate::model::{IngestRunManifest, ReconcileRunManifest};

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.data_root.join("manifests");
    let ingest_manifest_path = manifest_dir.join("ingest_run.json");
    let reconcile_manifest_path = manifest_dir.join("reconcile_run.json");
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.data_root.join("coins.sqlite"));

    info!(data_root = %args.data_root.display(), "status requested");

    if ingest_manifest_path.exists() {
        let manifest: IngestRunManifest = read_manifest(&ingest_manifest_path)?;
        info!(
            run_id = %manifest.run_id,
            status = %manifest.status,
            updated_at = %manifest.updated_at,
            csv = %manifest.paths.csv_path,
            rows_read = manifest.counts.rows_read,
            coins_inserted = manifest.counts.coins_inserted,
            coins_updated = manifest.counts.coins_updated,
            "last ingest run"
        );
    } else {
        warn!(path = %ingest_manifest_path.display(), "ingest run manifest missing");
    }

    if reconcile_manifest_path.exists() {
        let manifest: ReconcileRunManifest = read_manifest(&reconcile_manifest_path)?;
        info!(
            run_id = %manifest.run_id,
            status = %manifest.status,
            updated_at = %manifest.updated_at,
            coins_processed = manifest.counts.coins_processed,
            matches_inserted = manifest.counts.matches_inserted,
            halt_reason = %manifest.halt_reason.unwrap_or_default(),
            "last reconcile run"
        );
    } else {
        warn!(path = %reconcile_manifest_path.display(), "reconcile run manifest missing");
    }

    if db_path.exists() {
        let connection = Connection::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;

        let coins = db::count_rows(&connection, "SELECT COUNT(*) FROM coin").unwrap_or(0);
        let matches = db::count_rows(&connection, "SELECT COUNT(*) FROM match").unwrap_or(0);
        let verified =
            db::count_rows(&connection, "SELECT COUNT(*) FROM match WHERE verified = 1")
                .unwrap_or(0);
        let below_threshold = count_below_threshold(&connection, args.min_matches).unwrap_or(0);

        info!(
            path = %db_path.display(),
            coins,
            matches,
            verified,
            min_matches = args.min_matches,
            coins_needing_matches = below_threshold,
            "database status"
        );
    } else {
        warn!(path = %db_path.display(), "database file missing");
    }

    Ok(())
}

fn read_manifest<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn count_below_threshold(connection: &Connection, min_matches: i64) -> Result<i64> {
    let count = connection.query_row(
        "SELECT COUNT(*) FROM (
           SELECT c.id
           FROM coin c
           LEFT JOIN match m ON m.coin_id = c.id
           GROUP BY c.id
           HAVING COUNT(m.id) < ?1
         )",
        [min_matches],
        |row| row.get(0),
    )?;
    Ok(count)
}
