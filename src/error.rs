use thiserror::Error;

use crate::compliance::ComplianceError;
use crate::model::Id;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("database connection lock poisoned")]
    Poisoned,
}

/// Why a submission was refused. Only input, duplicate and persistence
/// failures abort a submission; enrichment problems never reach this type.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Id },
    #[error(transparent)]
    Compliance(#[from] ComplianceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for SubmitError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sql(e))
    }
}
