// Card Analyzer - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod analysis;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod normalizer;
pub mod query;
pub mod validation;

// Re-export commonly used types
pub use analysis::{Analysis, AnalysisOutcome, CardAnalyzer};
pub use clock::{Clock, FixedClock, SystemClock, YearMonth};
pub use collaborators::{BlobUploader, CardExtractor, LocalBlobStore, SidecarExtractor};
pub use config::Config;
pub use db::{setup_database, CardRecord, CardStore};
pub use error::{AnalysisError, QueryError, StoreError};
pub use export::{write_query_csv, write_records_csv};
pub use normalizer::{
    CandidateFields, CardField, Expiry, FieldNormalizer, NamePolicy, RawExtraction,
};
pub use query::{QueryGateway, QueryResult, QueryRow};
pub use validation::{luhn_valid, CardValidator, FieldFailure, Rule, Verdict};

use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins; otherwise `info`
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(filter)
        .try_init();
}
