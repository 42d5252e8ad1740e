use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestPaths {
    pub data_root: String,
    pub manifest_dir: String,
    pub csv_path: String,
    pub db_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestCounts {
    pub rows_read: usize,
    pub unique_coins: usize,
    pub coins_inserted: usize,
    pub coins_updated: usize,
    pub coins_total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub csv_sha256: String,
    pub paths: IngestPaths,
    pub counts: IngestCounts,
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilePaths {
    pub data_root: String,
    pub manifest_dir: String,
    pub db_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileCounts {
    pub coins_pending: usize,
    pub coins_processed: usize,
    pub fallback_queries: usize,
    pub candidates_found: usize,
    pub matches_inserted: usize,
    pub matches_total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    /// "completed", or "halted" after a terminal fetch failure. A halted
    /// run is safely resumable: persisted state is idempotent.
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub min_matches: i64,
    pub halt_reason: Option<String>,
    pub paths: ReconcilePaths,
    pub counts: ReconcileCounts,
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}
