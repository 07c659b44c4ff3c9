//! Error types for a VAT report run.

use crate::normalize::RowDiagnostic;
use thiserror::Error;

/// Why a run produced no report.
///
/// Row-level defects are not errors: they are recorded as
/// [`RowDiagnostic`]s and the row is dropped.  They only surface here,
/// as [`VatError::EmptyResult`], once no valid rows remain.
#[derive(Debug, Error)]
pub enum VatError {
    /// Required columns are absent from the input altogether.
    #[error("missing required columns: {}", .columns.join(", "))]
    MissingColumns { columns: Vec<String> },

    #[error("no rows supplied")]
    EmptyInput,

    /// Rows were supplied but every one of them was dropped.
    #[error("all {dropped} rows were rejected during validation")]
    EmptyResult {
        dropped: usize,
        diagnostics: Vec<RowDiagnostic>,
    },

    #[error("worker failed while processing chunk {chunk}: {message}")]
    WorkerExecution { chunk: usize, message: String },

    /// A running total left the range a `Decimal` can hold.
    #[error("amount overflow while summing {0}")]
    AmountOverflow(&'static str),

    #[error("run was cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, VatError>;
