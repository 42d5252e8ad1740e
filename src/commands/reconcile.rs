use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::{info, warn};

use crate::cli::ReconcileArgs;
use crate::db;
use crate::extract::{Candidate, extract_candidates};
use crate::fetch::{HttpFetcher, PageFetcher, RetryPolicy};
use crate::model::{ReconcileCounts, ReconcilePaths, ReconcileRunManifest};
use crate::query::build_search_url;
use crate::util::{ensure_directory, now_utc_string, utc_compact_string, write_json_pretty};

pub fn run(args: ReconcileArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let data_root = args.data_root.clone();
    let manifest_dir = data_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| data_root.join("coins.sqlite"));

    info!(run_id = %run_id, db = %db_path.display(), "starting reconcile");

    let mut connection = db::open(&db_path)?;
    let fetcher = HttpFetcher::new(RetryPolicy::default())?;
    let options = ReconcileOptions {
        min_matches: args.min_matches,
        max_items: args.max_items,
        ..ReconcileOptions::default()
    };

    let outcome = reconcile_coins(&mut connection, &fetcher, &options)?;
    let matches_total = db::count_rows(&connection, "SELECT COUNT(*) FROM match")?;

    let status = if outcome.halt_reason.is_some() {
        "halted"
    } else {
        "completed"
    };

    info!(
        pending = outcome.counts.coins_pending,
        processed = outcome.counts.coins_processed,
        inserted = outcome.counts.matches_inserted,
        total = matches_total,
        status,
        "reconcile finished"
    );

    let manifest = ReconcileRunManifest {
        manifest_version: 1,
        run_id,
        db_schema_version: db::DB_SCHEMA_VERSION.to_string(),
        status: status.to_string(),
        started_at,
        updated_at: now_utc_string(),
        command: render_command(&args),
        min_matches: args.min_matches,
        halt_reason: outcome.halt_reason,
        paths: ReconcilePaths {
            data_root: data_root.display().to_string(),
            manifest_dir: manifest_dir.display().to_string(),
            db_path: db_path.display().to_string(),
        },
        counts: ReconcileCounts {
            matches_total,
            ..outcome.counts
        },
        warnings: Vec::new(),
        notes: vec![
            "Candidate inserts use insert-or-ignore; verified flags are never overwritten."
                .to_string(),
        ],
    };

    let manifest_path = manifest_dir.join("reconcile_run.json");
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote reconcile run manifest");

    Ok(())
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub min_matches: i64,
    pub max_items: Option<usize>,
    /// Pause between successive coins' primary requests.
    pub politeness_delay: Duration,
    /// Pause before the one fallback request without a catalogue number.
    pub fallback_delay: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            min_matches: 1,
            max_items: None,
            politeness_delay: Duration::from_secs(2),
            fallback_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub counts: ReconcileCounts,
    pub halt_reason: Option<String>,
}

#[derive(Debug)]
struct PendingCoin {
    id: i64,
    issuer: String,
    year: String,
    denomination: String,
    catalog_number: Option<i64>,
}

/// Drive query building, fetching and extraction for every coin below the
/// match threshold, in ascending id order. A terminal fetch failure halts
/// the whole run so it can be resumed later without re-querying coins that
/// already have matches; the in-progress coin gets nothing written.
pub fn reconcile_coins(
    connection: &mut Connection,
    fetcher: &dyn PageFetcher,
    options: &ReconcileOptions,
) -> Result<ReconcileOutcome> {
    let pending = pending_coins(connection, options.min_matches, options.max_items)?;
    let mut outcome = ReconcileOutcome::default();
    outcome.counts.coins_pending = pending.len();

    if pending.is_empty() {
        info!("all coins already have enough matches");
        return Ok(outcome);
    }

    info!(pending = pending.len(), "coins need catalogue lookups");

    for (index, coin) in pending.iter().enumerate() {
        if index > 0 {
            thread::sleep(options.politeness_delay);
        }

        let reference = coin
            .catalog_number
            .map(|number| format!("KM# {number}"))
            .unwrap_or_default();
        let url = build_search_url(&coin.issuer, &coin.denomination, &coin.year, &reference);

        info!(
            coin_id = coin.id,
            issuer = %coin.issuer,
            denomination = %coin.denomination,
            year = %coin.year,
            url = %url,
            "searching catalogue"
        );

        let html = match fetcher.fetch_page(&url) {
            Ok(html) => html,
            Err(err) => {
                outcome.halt_reason = Some(halt(coin.id, &err));
                break;
            }
        };
        let mut hits = extract_candidates(&html)?;

        // A catalogue-number search that finds nothing gets exactly one
        // retry with the number dropped from the query.
        if hits.is_empty() && !reference.is_empty() {
            outcome.counts.fallback_queries += 1;
            let fallback_url =
                build_search_url(&coin.issuer, &coin.denomination, &coin.year, "");
            info!(
                coin_id = coin.id,
                url = %fallback_url,
                "no results with catalogue number, retrying without"
            );
            thread::sleep(options.fallback_delay);

            match fetcher.fetch_page(&fallback_url) {
                Ok(html) => hits = extract_candidates(&html)?,
                Err(err) => {
                    outcome.halt_reason = Some(halt(coin.id, &err));
                    break;
                }
            }
        }

        if hits.is_empty() {
            info!(coin_id = coin.id, "no candidates found");
        } else {
            let inserted = insert_candidates(connection, coin.id, &hits)?;
            info!(
                coin_id = coin.id,
                candidates = hits.len(),
                inserted,
                "stored candidate matches"
            );
            outcome.counts.candidates_found += hits.len();
            outcome.counts.matches_inserted += inserted;
        }

        outcome.counts.coins_processed += 1;
    }

    Ok(outcome)
}

fn halt(coin_id: i64, err: &anyhow::Error) -> String {
    warn!(
        coin_id,
        error = %err,
        "terminal fetch failure, stopping reconcile; re-run to resume where it left off"
    );
    format!("fetch failed for coin {coin_id}: {err}")
}

fn pending_coins(
    connection: &Connection,
    min_matches: i64,
    max_items: Option<usize>,
) -> Result<Vec<PendingCoin>> {
    let mut statement = connection.prepare(
        "SELECT c.id, c.issuer, c.year, c.denomination, c.catalog_number,
                COUNT(m.id) AS match_count
         FROM coin c
         LEFT JOIN match m ON m.coin_id = c.id
         GROUP BY c.id
         HAVING match_count < ?1
         ORDER BY c.id",
    )?;

    let mut coins = Vec::new();
    let mut found = statement.query([min_matches])?;
    while let Some(row) = found.next()? {
        if max_items.is_some_and(|limit| coins.len() >= limit) {
            break;
        }
        coins.push(PendingCoin {
            id: row.get(0)?,
            issuer: row.get(1)?,
            year: row.get(2)?,
            denomination: row.get(3)?,
            catalog_number: row.get(4)?,
        });
    }

    Ok(coins)
}

/// One transaction per coin. A pre-existing (coin, numista_id) pair is a
/// benign no-op, which also keeps its manually set verified flag intact.
fn insert_candidates(
    connection: &mut Connection,
    coin_id: i64,
    hits: &[Candidate],
) -> Result<usize> {
    let tx = connection.transaction()?;
    let mut inserted = 0;
    {
        let mut statement = tx.prepare(
            "INSERT OR IGNORE INTO match (coin_id, numista_id, verified, category, catalog_number, title)
             VALUES (?1, ?2, 0, ?3, ?4, ?5)",
        )?;
        for hit in hits {
            inserted += statement.execute(params![
                coin_id,
                hit.numista_id,
                hit.category,
                hit.catalog_number,
                hit.title,
            ])?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

fn render_command(args: &ReconcileArgs) -> String {
    let mut command = vec![
        "coinmatch".to_string(),
        "reconcile".to_string(),
        "--data-root".to_string(),
        args.data_root.display().to_string(),
        "--min-matches".to_string(),
        args.min_matches.to_string(),
    ];

    if let Some(path) = &args.db_path {
        command.push("--db-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(limit) = args.max_items {
        command.push("--max-items".to_string());
        command.push(limit.to_string());
    }

    command.join(" ")
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use anyhow::bail;

    use super::*;

    struct FakeFetcher {
        responses: RefCell<Vec<Result<String>>>,
        requested: RefCell<Vec<String>>,
    }

    impl FakeFetcher {
        fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: RefCell::new(responses),
                requested: RefCell::new(Vec::new()),
            }
        }
    }

    impl PageFetcher for FakeFetcher {
        fn fetch_page(&self, url: &str) -> Result<String> {
            self.requested.borrow_mut().push(url.to_string());
            let mut responses = self.responses.borrow_mut();
            if responses.is_empty() {
                bail!("no scripted response left")
            }
            responses.remove(0)
        }
    }

    fn zero_delay(min_matches: i64) -> ReconcileOptions {
        ReconcileOptions {
            min_matches,
            max_items: None,
            politeness_delay: Duration::ZERO,
            fallback_delay: Duration::ZERO,
        }
    }

    fn result_page(ids: &[i64]) -> String {
        let mut page = String::from("<html><body>");
        for id in ids {
            page.push_str(&format!(
                "<div class=\"description_piece\">\
                   <a href=\"/catalogue/pieces{id}.html\">Coin {id}</a>\
                   <em>Coins &gt; Standard circulation coins</em>\
                   <p>KM# {id}</p>\
                 </div>"
            ));
        }
        page.push_str("</body></html>");
        page
    }

    fn seed_coin(connection: &Connection, issuer: &str, catalog_number: Option<i64>) -> i64 {
        connection
            .execute(
                "INSERT INTO coin (issuer, year, denomination, catalog_number)
                 VALUES (?1, '1900', '1 kopek', ?2)",
                params![issuer, catalog_number],
            )
            .unwrap();
        connection.last_insert_rowid()
    }

    fn match_count(connection: &Connection) -> i64 {
        db::count_rows(connection, "SELECT COUNT(*) FROM match").unwrap()
    }

    #[test]
    fn candidates_are_persisted_per_pending_coin() {
        let mut connection = db::open_in_memory().unwrap();
        seed_coin(&connection, "Russia", None);
        let fetcher = FakeFetcher::new(vec![Ok(result_page(&[101, 102]))]);

        let outcome = reconcile_coins(&mut connection, &fetcher, &zero_delay(1)).unwrap();

        assert!(outcome.halt_reason.is_none());
        assert_eq!(outcome.counts.coins_processed, 1);
        assert_eq!(outcome.counts.matches_inserted, 2);
        assert_eq!(match_count(&connection), 2);
    }

    #[test]
    fn terminal_fetch_failure_halts_without_partial_writes() {
        let mut connection = db::open_in_memory().unwrap();
        seed_coin(&connection, "Russia", None);
        seed_coin(&connection, "Italy", None);
        let fetcher = FakeFetcher::new(vec![Err(anyhow::anyhow!("exhausted retries"))]);

        let outcome = reconcile_coins(&mut connection, &fetcher, &zero_delay(1)).unwrap();

        assert!(outcome.halt_reason.is_some());
        assert_eq!(outcome.counts.coins_pending, 2);
        assert_eq!(outcome.counts.coins_processed, 0);
        assert_eq!(match_count(&connection), 0);
        // The second coin was never queried.
        assert_eq!(fetcher.requested.borrow().len(), 1);
    }

    #[test]
    fn empty_result_with_catalog_number_falls_back_exactly_once() {
        let mut connection = db::open_in_memory().unwrap();
        seed_coin(&connection, "Papal States", Some(38));
        let fetcher = FakeFetcher::new(vec![
            Ok("<html><body>no results</body></html>".to_string()),
            Ok(result_page(&[7])),
        ]);

        let outcome = reconcile_coins(&mut connection, &fetcher, &zero_delay(1)).unwrap();

        assert_eq!(outcome.counts.fallback_queries, 1);
        assert_eq!(outcome.counts.matches_inserted, 1);

        let requested = fetcher.requested.borrow();
        assert_eq!(requested.len(), 2);
        assert!(requested[0].contains("&no=38&"));
        assert!(requested[1].contains("&no=&"));
    }

    #[test]
    fn empty_result_without_catalog_number_does_not_fall_back() {
        let mut connection = db::open_in_memory().unwrap();
        seed_coin(&connection, "Russia", None);
        let fetcher = FakeFetcher::new(vec![Ok("<html></html>".to_string())]);

        let outcome = reconcile_coins(&mut connection, &fetcher, &zero_delay(1)).unwrap();

        assert_eq!(outcome.counts.fallback_queries, 0);
        assert_eq!(outcome.counts.coins_processed, 1);
        assert_eq!(fetcher.requested.borrow().len(), 1);
    }

    #[test]
    fn fallback_fetch_failure_also_halts() {
        let mut connection = db::open_in_memory().unwrap();
        seed_coin(&connection, "Papal States", Some(38));
        seed_coin(&connection, "Italy", None);
        let fetcher = FakeFetcher::new(vec![
            Ok("<html></html>".to_string()),
            Err(anyhow::anyhow!("exhausted retries")),
        ]);

        let outcome = reconcile_coins(&mut connection, &fetcher, &zero_delay(1)).unwrap();

        assert!(outcome.halt_reason.is_some());
        assert_eq!(outcome.counts.coins_processed, 0);
        assert_eq!(fetcher.requested.borrow().len(), 2);
    }

    #[test]
    fn existing_match_is_ignored_and_verified_flag_survives() {
        let mut connection = db::open_in_memory().unwrap();
        let coin_id = seed_coin(&connection, "Russia", None);
        connection
            .execute(
                "INSERT INTO match (coin_id, numista_id, verified, title)
                 VALUES (?1, 101, 1, 'hand checked')",
                [coin_id],
            )
            .unwrap();

        // min_matches of 2 keeps the coin pending despite its one match.
        let fetcher = FakeFetcher::new(vec![Ok(result_page(&[101]))]);
        let outcome = reconcile_coins(&mut connection, &fetcher, &zero_delay(2)).unwrap();

        assert_eq!(outcome.counts.matches_inserted, 0);
        let (verified, title): (i64, String) = connection
            .query_row(
                "SELECT verified, title FROM match WHERE coin_id = ?1 AND numista_id = 101",
                [coin_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(verified, 1);
        assert_eq!(title, "hand checked");
    }

    #[test]
    fn satisfied_coins_are_skipped() {
        let mut connection = db::open_in_memory().unwrap();
        let satisfied = seed_coin(&connection, "Russia", None);
        connection
            .execute(
                "INSERT INTO match (coin_id, numista_id) VALUES (?1, 55)",
                [satisfied],
            )
            .unwrap();
        seed_coin(&connection, "Italy", None);

        let fetcher = FakeFetcher::new(vec![Ok(result_page(&[9]))]);
        let outcome = reconcile_coins(&mut connection, &fetcher, &zero_delay(1)).unwrap();

        assert_eq!(outcome.counts.coins_pending, 1);
        let requested = fetcher.requested.borrow();
        assert_eq!(requested.len(), 1);
        assert!(requested[0].contains("Italy"));
    }

    #[test]
    fn max_items_caps_the_run() {
        let mut connection = db::open_in_memory().unwrap();
        seed_coin(&connection, "Russia", None);
        seed_coin(&connection, "Italy", None);
        seed_coin(&connection, "France", None);

        let options = ReconcileOptions {
            max_items: Some(2),
            ..zero_delay(1)
        };
        let fetcher = FakeFetcher::new(vec![
            Ok(result_page(&[1])),
            Ok(result_page(&[2])),
        ]);
        let outcome = reconcile_coins(&mut connection, &fetcher, &options).unwrap();

        assert_eq!(outcome.counts.coins_pending, 2);
        assert_eq!(outcome.counts.coins_processed, 2);
    }
}
