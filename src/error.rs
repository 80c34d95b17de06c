use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("file headers are empty")]
    EmptyHeaders,

    #[error("file is missing required column(s): {}", .0.join(", "))]
    #[diagnostic(help(
        "required columns: cellularResolution, sequenceType, standardized_species, sample_id, organ, disorder"
    ))]
    MissingHeaders(Vec<String>),

    #[error("missing sample id in the records (line {line})")]
    MissingSampleId { line: usize },

    #[error("file is missing required column: protocol. It is required for Single Cell data")]
    MissingProtocol,

    #[error("invalid protocol value: {0}")]
    #[diagnostic(help("expected one of dropseq, 10XV1, 10XV2, 10XV3, 10XV4"))]
    InvalidProtocol(String),

    #[error("invalid delimiter: {0}")]
    InvalidDelimiter(String),

    #[error("invalid upload filename: {0}")]
    #[diagnostic(help("only .csv and .tsv metadata files are accepted"))]
    InvalidFilename(String),

    #[error("no valid records found to process")]
    NoValidRecords,

    #[error("specimen on line {line} has no usable identifier after sanitization")]
    UnresolvableSpecimenId { line: usize },

    #[error("batch {batch} could not be resolved: {reason}")]
    BatchResolution { batch: String, reason: String },

    #[error("registry request failed: {0}")]
    RegistryHttp(String),

    #[error("registry returned status {status}: {message}")]
    RegistryStatus { status: u16, message: String },

    #[error("unexpected registry payload: {0}")]
    RegistryPayload(String),

    #[error("row store request failed: {0}")]
    RowStoreHttp(String),

    #[error("row store returned status {status}: {message}")]
    RowStoreStatus { status: u16, message: String },

    #[error("unexpected row store payload: {0}")]
    RowStorePayload(String),

    #[error("no stored metadata for upload: {0}")]
    MetadataNotFound(String),

    #[error("failed to render export: {0}")]
    Export(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl IngestError {
    /// Errors caused by the uploaded file itself rather than by a collaborator.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            IngestError::EmptyHeaders
                | IngestError::MissingHeaders(_)
                | IngestError::MissingSampleId { .. }
                | IngestError::MissingProtocol
                | IngestError::InvalidProtocol(_)
                | IngestError::InvalidDelimiter(_)
                | IngestError::InvalidFilename(_)
                | IngestError::NoValidRecords
        )
    }

    pub fn is_collaborator(&self) -> bool {
        matches!(
            self,
            IngestError::RegistryHttp(_)
                | IngestError::RegistryStatus { .. }
                | IngestError::RegistryPayload(_)
                | IngestError::RowStoreHttp(_)
                | IngestError::RowStoreStatus { .. }
                | IngestError::RowStorePayload(_)
        )
    }
}
