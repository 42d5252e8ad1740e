use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

use crate::cli::IngestArgs;
use crate::csv::{CoinRow, parse_batch};
use crate::db;
use crate::model::{IngestCounts, IngestPaths, IngestRunManifest};
use crate::util::{ensure_directory, now_utc_string, sha256_file, utc_compact_string, write_json_pretty};

pub fn run(args: IngestArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let data_root = args.data_root.clone();
    let manifest_dir = data_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let csv_path = args.csv_path.clone().unwrap_or_else(find_default_export);
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| data_root.join("coins.sqlite"));

    info!(
        run_id = %run_id,
        csv = %csv_path.display(),
        db = %db_path.display(),
        "starting ingest"
    );

    let csv_sha256 = sha256_file(&csv_path)?;
    let raw = fs::read(&csv_path)
        .with_context(|| format!("failed to read {}", csv_path.display()))?;
    let rows = parse_batch(&String::from_utf8_lossy(&raw));
    if rows.is_empty() {
        bail!("no data rows in {}", csv_path.display());
    }

    let mut connection = db::open(&db_path)?;
    let stats = upsert_coins(&mut connection, &rows)?;
    let coins_total = db::count_rows(&connection, "SELECT COUNT(*) FROM coin")?;

    info!(
        rows = rows.len(),
        unique = stats.unique_coins,
        inserted = stats.inserted,
        updated = stats.updated,
        total = coins_total,
        "ingest completed"
    );

    let manifest = IngestRunManifest {
        manifest_version: 1,
        run_id,
        db_schema_version: db::DB_SCHEMA_VERSION.to_string(),
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        command: render_command(&args, &csv_path),
        csv_sha256,
        paths: IngestPaths {
            data_root: data_root.display().to_string(),
            manifest_dir: manifest_dir.display().to_string(),
            csv_path: csv_path.display().to_string(),
            db_path: db_path.display().to_string(),
        },
        counts: IngestCounts {
            rows_read: rows.len(),
            unique_coins: stats.unique_coins,
            coins_inserted: stats.inserted,
            coins_updated: stats.updated,
            coins_total,
        },
        warnings: Vec::new(),
        notes: vec![
            "Occurrence counts are strictly non-decreasing across re-ingests.".to_string(),
        ],
    };

    let manifest_path = manifest_dir.join("ingest_run.json");
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote ingest run manifest");

    Ok(())
}

/// Natural key with nulls normalized to the same sentinels the unique
/// index uses, so in-memory grouping and the store agree on identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CoinKey {
    issuer: String,
    year: String,
    denomination: String,
    catalog_number: i64,
    mintmark: String,
    subject: String,
}

fn natural_key(row: &CoinRow) -> CoinKey {
    CoinKey {
        issuer: row.issuer.clone(),
        year: row.year.clone(),
        denomination: row.denomination.clone(),
        catalog_number: row.catalog_number.unwrap_or(-1),
        mintmark: row.mintmark.clone().unwrap_or_default(),
        subject: row.subject.clone().unwrap_or_default(),
    }
}

#[derive(Debug, Default)]
pub struct UpsertStats {
    pub unique_coins: usize,
    pub inserted: usize,
    pub updated: usize,
}

/// Deduplicate one batch by natural key and upsert it in a single
/// transaction. The first row seen per key supplies the attribute values;
/// `occurrences` is updated only when the batch count exceeds the stored
/// one, so a smaller re-import never shrinks it.
pub fn upsert_coins(connection: &mut Connection, rows: &[CoinRow]) -> Result<UpsertStats> {
    let mut key_order: Vec<CoinKey> = Vec::new();
    let mut batch_counts: HashMap<CoinKey, i64> = HashMap::new();
    let mut representatives: HashMap<CoinKey, &CoinRow> = HashMap::new();

    for row in rows {
        let key = natural_key(row);
        match batch_counts.get_mut(&key) {
            Some(count) => *count += 1,
            None => {
                key_order.push(key.clone());
                batch_counts.insert(key.clone(), 1);
                representatives.insert(key, row);
            }
        }
    }

    let mut stats = UpsertStats {
        unique_coins: key_order.len(),
        ..UpsertStats::default()
    };

    let tx = connection.transaction()?;
    {
        let mut select = tx.prepare(
            "SELECT id, occurrences FROM coin
             WHERE issuer = ?1 AND year = ?2 AND denomination = ?3
               AND COALESCE(catalog_number, -1) = ?4
               AND COALESCE(mintmark, '') = ?5
               AND COALESCE(subject, '') = ?6",
        )?;
        let mut insert = tx.prepare(
            "INSERT INTO coin (issuer, year, denomination, catalog_number, mintmark,
                               subject, occurrences, composition, weight, diameter, thickness)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        let mut update = tx.prepare("UPDATE coin SET occurrences = ?1 WHERE id = ?2")?;

        for key in &key_order {
            let row = representatives[key];
            let batch_count = batch_counts[key];

            let existing: Option<(i64, i64)> = select
                .query_row(
                    params![
                        key.issuer,
                        key.year,
                        key.denomination,
                        key.catalog_number,
                        key.mintmark,
                        key.subject
                    ],
                    |found| Ok((found.get(0)?, found.get(1)?)),
                )
                .optional()?;

            match existing {
                None => {
                    insert.execute(params![
                        row.issuer,
                        row.year,
                        row.denomination,
                        row.catalog_number,
                        row.mintmark,
                        row.subject,
                        batch_count,
                        row.composition,
                        row.weight,
                        row.diameter,
                        row.thickness,
                    ])?;
                    stats.inserted += 1;
                }
                Some((coin_id, stored_count)) => {
                    if batch_count > stored_count {
                        update.execute(params![batch_count, coin_id])?;
                        stats.updated += 1;
                    }
                }
            }
        }
    }
    tx.commit()?;

    Ok(stats)
}

/// Newest CoinSnap export in ~/Downloads by modification time; fall back
/// to a file next to the working directory.
fn find_default_export() -> PathBuf {
    let fallback = PathBuf::from("snap-export.csv");

    let Some(home) = std::env::var_os("HOME") else {
        return fallback;
    };
    let downloads = Path::new(&home).join("Downloads");
    let Ok(entries) = fs::read_dir(&downloads) else {
        return fallback;
    };

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|name| name.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if !name.starts_with("CoinSnap-Exported-all") || !name.ends_with(".csv") {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) else {
            continue;
        };
        if newest.as_ref().is_none_or(|(ts, _)| modified > *ts) {
            newest = Some((modified, path));
        }
    }

    newest.map(|(_, path)| path).unwrap_or(fallback)
}

fn render_command(args: &IngestArgs, csv_path: &Path) -> String {
    let mut command = vec![
        "coinmatch".to_string(),
        "ingest".to_string(),
        "--data-root".to_string(),
        args.data_root.display().to_string(),
        "--csv-path".to_string(),
        csv_path.display().to_string(),
    ];

    if let Some(path) = &args.db_path {
        command.push("--db-path".to_string());
        command.push(path.display().to_string());
    }

    command.join(" ")
}
