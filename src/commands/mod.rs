pub mod ingest;
pub mod reconcile;
pub mod status;
