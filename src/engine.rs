//! VAT report computation engine.
//!
//! The `engine` module wires the pipeline together: raw rows are
//! validated by [`normalize`], the surviving records are aggregated
//! chunk by chunk by the [`Scheduler`] (on a [`rayon`] pool for large
//! inputs) and the merged totals are turned into a [`FinalReport`].
//! The result is either a complete report or an error; a partial report
//! is never returned.

use crate::error::Result;
use crate::finalize::finalize;
use crate::models::{FinalReport, RawRow};
use crate::normalize::{normalize, summarize, ColumnMap, DiagnosticSummary, RowDiagnostic};
use crate::scheduler::{CancelToken, ExecutionMode, ProgressEvent, RunOptions, Scheduler};
use crate::tax::ClassificationConfig;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Everything a reporting collaborator needs from one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VatRun {
    pub report: FinalReport,
    /// Rows dropped during validation, in row order.
    pub diagnostics: Vec<RowDiagnostic>,
    pub mode: ExecutionMode,
    pub chunk_count: usize,
}

impl VatRun {
    pub fn diagnostic_summary(&self) -> DiagnosticSummary {
        summarize(&self.diagnostics)
    }
}

/// A configured engine.  Holds the worker pool, so reuse one instance
/// for several runs rather than building a new one each time.
#[derive(Debug)]
pub struct VatEngine {
    config: Arc<ClassificationConfig>,
    columns: ColumnMap,
    scheduler: Scheduler,
}

impl VatEngine {
    pub fn new(config: ClassificationConfig, columns: ColumnMap, options: RunOptions) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let scheduler = Scheduler::new(Arc::clone(&config), options)?;
        Ok(VatEngine {
            config,
            columns,
            scheduler,
        })
    }

    pub fn config(&self) -> &ClassificationConfig {
        &self.config
    }

    /// Computes the report, blocking the calling thread until done.
    pub fn compute<P>(&self, rows: &[RawRow], progress: P, cancel: &CancelToken) -> Result<VatRun>
    where
        P: FnMut(ProgressEvent),
    {
        info!(rows = rows.len(), config = %self.config.name, "computing VAT report");
        let normalized = normalize(rows, &self.config, &self.columns)?;
        let scheduled = self.scheduler.run(normalized.records, progress, cancel)?;
        Ok(VatRun {
            report: finalize(&scheduled.accumulator)?,
            diagnostics: normalized.diagnostics,
            mode: scheduled.mode,
            chunk_count: scheduled.chunk_count,
        })
    }

    /// Computes the report without blocking the async runtime.
    pub async fn compute_async<P>(
        &self,
        rows: &[RawRow],
        progress: P,
        cancel: &CancelToken,
    ) -> Result<VatRun>
    where
        P: FnMut(ProgressEvent) + Send,
    {
        info!(rows = rows.len(), config = %self.config.name, "computing VAT report");
        let normalized = normalize(rows, &self.config, &self.columns)?;
        let scheduled = self
            .scheduler
            .run_async(normalized.records, progress, cancel)
            .await?;
        Ok(VatRun {
            report: finalize(&scheduled.accumulator)?,
            diagnostics: normalized.diagnostics,
            mode: scheduled.mode,
            chunk_count: scheduled.chunk_count,
        })
    }
}

/// One-shot helper: builds an engine with the default column names and
/// runs it without progress reporting or cancellation.
pub fn compute_vat_report(
    rows: &[RawRow],
    config: &ClassificationConfig,
    options: &RunOptions,
) -> Result<VatRun> {
    let engine = VatEngine::new(config.clone(), ColumnMap::default(), options.clone())?;
    engine.compute(rows, |_| {}, &CancelToken::new())
}

/// Async counterpart of [`compute_vat_report`].
pub async fn compute_vat_report_async(
    rows: &[RawRow],
    config: &ClassificationConfig,
    options: &RunOptions,
) -> Result<VatRun> {
    let engine = VatEngine::new(config.clone(), ColumnMap::default(), options.clone())?;
    engine.compute_async(rows, |_| {}, &CancelToken::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VatError;
    use crate::normalize::DiagnosticReason;
    use rust_decimal_macros::dec;

    fn row(category: &str, code: &str, tax: f64, excl: f64) -> RawRow {
        RawRow::new()
            .with("tax_category", category)
            .with("transaction_type", code)
            .with("tax_rate", if category == "ZR" { 0.0 } else { 15.0 })
            .with("tax_amount", tax)
            .with("excl_amount", excl)
            .with("incl_amount", tax + excl)
    }

    #[test]
    fn report_with_dropped_rows() {
        let rows = vec![
            row("STD", "SINV", 150.0, 1000.0),
            row("LUX", "INV", 999.0, 999.0),
            row("ZR", "CS", 0.0, 2000.0),
            row("STD", "GJ", 999.0, 999.0),
            row("STD", "INV", 300.0, 2000.0),
        ];
        let run = compute_vat_report(
            &rows,
            &ClassificationConfig::south_african(),
            &RunOptions::default(),
        )
        .unwrap();
        assert_eq!(run.report.vat_payable, dec!(150));
        assert_eq!(run.report.sales_including_vat, dec!(4300));
        assert_eq!(run.report.transaction_count, 3);
        assert_eq!(run.mode, ExecutionMode::SerialCooperative);
        let summary = run.diagnostic_summary();
        assert_eq!(summary[&DiagnosticReason::UnknownCategory], 1);
        assert_eq!(summary[&DiagnosticReason::UnknownDirectionCode], 1);
        assert_eq!(run.diagnostics[0].row, 3);
        assert_eq!(run.diagnostics[1].row, 5);
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let mut config = ClassificationConfig::south_african();
        config.categories.clear();
        let err = VatEngine::new(config, ColumnMap::default(), RunOptions::default()).unwrap_err();
        assert!(matches!(err, VatError::InvalidConfig(_)));
    }

    #[test]
    fn custom_column_names() {
        let columns = ColumnMap {
            category: "VAT Code".into(),
            direction_code: "Tx Type".into(),
            ..ColumnMap::default()
        };
        let rows = vec![RawRow::new()
            .with("VAT Code", "Standard rate")
            .with("Tx Type", "inv")
            .with("tax_rate", "15%")
            .with("tax_amount", "15.00")
            .with("excl_amount", "100.00")
            .with("incl_amount", "115.00")];
        let engine =
            VatEngine::new(ClassificationConfig::south_african(), columns, RunOptions::default())
                .unwrap();
        let run = engine.compute(&rows, |_| {}, &CancelToken::new()).unwrap();
        assert_eq!(run.report.total_output_vat, dec!(15));
        assert_eq!(run.chunk_count, 1);
    }
}
