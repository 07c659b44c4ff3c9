//! VAT Engine library crate.
//!
//! This crate turns transaction rows extracted from spreadsheets into a
//! VAT liability report: input and output VAT split by tax category,
//! derived totals such as VAT payable, and a handful of sample
//! transactions per category for audit display.  Large inputs are
//! processed in chunks on a worker pool and merged deterministically.
//! External applications call [`engine::VatEngine`] or the one-shot
//! [`engine::compute_vat_report`].

pub mod accumulate;
pub mod engine;
pub mod error;
pub mod finalize;
pub mod logging;
pub mod models;
pub mod normalize;
pub mod scheduler;
pub mod tax;

pub use engine::{compute_vat_report, compute_vat_report_async, VatEngine, VatRun};
pub use error::VatError;
pub use models::{FinalReport, RawRow, RawValue};
pub use scheduler::{CancelToken, ProgressEvent, RunOptions, WorkerPool};
pub use tax::ClassificationConfig;
