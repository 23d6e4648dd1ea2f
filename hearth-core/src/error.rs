//! Error types for Hearth core operations

use crate::entities::Domain;
use thiserror::Error;

/// Errors raised while ingesting or patching domain records.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("Record has neither `id` nor `_id`")]
    MissingIdentity,

    #[error("Record is not a JSON object")]
    NotAnObject,

    #[error("Malformed {domain} record: {reason}")]
    MalformedRecord { domain: Domain, reason: String },

    #[error("Patch for {domain} entity {id} is invalid: {reason}")]
    InvalidPatch {
        domain: Domain,
        id: String,
        reason: String,
    },
}

pub type CoreResult<T> = Result<T, CoreError>;
