// ⚠️ Error taxonomy
// None of these are fatal: each one goes back to the caller with a reason.

use crate::normalizer::{mask_card_number, CandidateFields};
use crate::validation::Verdict;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("card {} already exists (id {existing_id})", mask_card_number(.card_number))]
    DuplicateKey {
        card_number: String,
        existing_id: i64,
    },

    #[error("record was not validated: {0}")]
    NotValidated(String),

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error, PartialEq)]
pub enum QueryError {
    /// Rejected before anything ran
    #[error("validation error: {0}")]
    Validation(String),

    /// Approved text that SQLite could not run
    #[error("execution error: {0}")]
    Execution(String),
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("error uploading image to blob storage")]
    Upload,

    #[error("unable to analyze card")]
    Extraction,

    #[error("invalid card: {}", .verdict.summary())]
    Invalid {
        fields: CandidateFields,
        verdict: Verdict,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
