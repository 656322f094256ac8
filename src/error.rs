// ⚠️ Error types - Structural, validation and persistence failures

use thiserror::Error;

/// Result alias used across the loader
pub type Result<T> = std::result::Result<T, IngestError>;

// ============================================================================
// VALIDATION ERROR
// ============================================================================

/// Why an entity factory refused its inputs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Tax number must be exactly 10 digits and not all zeros
    #[error("client inn `{0}` must be 10 digits and not all zeros")]
    Inn(String),

    /// A required text field was empty or whitespace
    #[error("{entity} field `{field}` must not be blank")]
    Blank {
        entity: &'static str,
        field: &'static str,
    },

    /// Amount missing, unparseable or not strictly positive
    #[error("amount `{0}` must be a positive decimal")]
    Amount(String),

    /// More digits than a 96-bit decimal can hold without rounding
    #[error("amount `{0}` has more than 28 significant digits")]
    Precision(String),

    /// Serial positions are 1-based
    #[error("serial must be positive")]
    Serial,
}

impl ValidationError {
    pub(crate) fn blank(entity: &'static str, field: &'static str) -> Self {
        ValidationError::Blank { entity, field }
    }
}

// ============================================================================
// INGEST ERROR
// ============================================================================

/// Failures that stop a reader, a gateway unit of work or the whole run
#[derive(Error, Debug)]
pub enum IngestError {
    /// Feed could not be opened or read
    #[error("cannot read feed: {0}")]
    Io(#[from] std::io::Error),

    /// Feed is not well-formed XML
    #[error("malformed feed at byte {position}: {source}")]
    Syntax {
        position: usize,
        #[source]
        source: quick_xml::Error,
    },

    /// Feed ended in the middle of a record
    #[error("feed ended inside record {serial}")]
    Truncated { serial: u32 },

    /// Feed ended between records with elements still open
    #[error("feed ended with {open} unclosed element(s)")]
    Unclosed { open: usize },

    /// A record failed validation while loading
    #[error("invalid record {serial}: {source}")]
    InvalidRecord {
        serial: u32,
        #[source]
        source: ValidationError,
    },

    /// Storage failure inside a unit of work
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Unit of work exceeded its deadline
    #[error("unit of work exceeded {0:?}")]
    Timeout(std::time::Duration),

    /// Configuration loading or validation error
    #[error("configuration error: {0}")]
    Config(String),

    /// A reader or writer thread panicked
    #[error("worker `{0}` panicked")]
    WorkerPanicked(String),
}
