//! Row validation and normalization.
//!
//! Turns the loosely typed rows produced by the spreadsheet reader into
//! [`TransactionRecord`]s.  Two kinds of problem are distinguished:
//!
//! * a required column missing from the input as a whole is structural
//!   and fails the run before any row is looked at;
//! * a bad value in a single row drops that row and records a
//!   [`RowDiagnostic`].  The run only fails if nothing survives.
//!
//! Output order always matches input order; sample retention further
//! down depends on it.

use crate::error::{Result, VatError};
use crate::models::{Direction, RawRow, RawValue, TransactionRecord};
use crate::tax::ClassificationConfig;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use tracing::{debug, warn};

/// Column headers the normalizer reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMap {
    pub category: String,
    pub direction_code: String,
    pub tax_rate: String,
    pub tax_amount: String,
    pub excl_amount: String,
    pub incl_amount: String,
    pub description: String,
    pub reference: String,
    pub date: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        ColumnMap {
            category: "tax_category".into(),
            direction_code: "transaction_type".into(),
            tax_rate: "tax_rate".into(),
            tax_amount: "tax_amount".into(),
            excl_amount: "excl_amount".into(),
            incl_amount: "incl_amount".into(),
            description: "description".into(),
            reference: "reference".into(),
            date: "date".into(),
        }
    }
}

impl ColumnMap {
    fn required(&self) -> [&str; 6] {
        [
            self.category.as_str(),
            self.direction_code.as_str(),
            self.tax_rate.as_str(),
            self.tax_amount.as_str(),
            self.excl_amount.as_str(),
            self.incl_amount.as_str(),
        ]
    }
}

/// Why a row was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticReason {
    UnknownCategory,
    UnknownDirectionCode,
    MissingValue,
    NonNumeric,
    NegativeRate,
}

impl DiagnosticReason {
    pub fn describe(self) -> &'static str {
        match self {
            DiagnosticReason::UnknownCategory => "unknown tax category",
            DiagnosticReason::UnknownDirectionCode => "unknown transaction type",
            DiagnosticReason::MissingValue => "missing value",
            DiagnosticReason::NonNumeric => "not a number",
            DiagnosticReason::NegativeRate => "negative tax rate",
        }
    }
}

/// A dropped row and the first check it failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowDiagnostic {
    /// 1-based spreadsheet row number (the header is row 1).
    pub row: usize,
    /// Header of the offending column.
    pub field: String,
    pub reason: DiagnosticReason,
    /// The offending cell as text.
    pub value: String,
}

impl std::fmt::Display for RowDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "row {}: {} in '{}' ({:?})",
            self.row,
            self.reason.describe(),
            self.field,
            self.value
        )
    }
}

/// Dropped-row counts per reason.
pub type DiagnosticSummary = BTreeMap<DiagnosticReason, usize>;

/// The normalizer's output: records in input order plus what was dropped.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub records: Vec<TransactionRecord>,
    pub diagnostics: Vec<RowDiagnostic>,
}

impl Normalized {
    pub fn summary(&self) -> DiagnosticSummary {
        summarize(&self.diagnostics)
    }
}

pub fn summarize(diagnostics: &[RowDiagnostic]) -> DiagnosticSummary {
    let mut summary = DiagnosticSummary::new();
    for d in diagnostics {
        *summary.entry(d.reason).or_default() += 1;
    }
    summary
}

/// Validate `rows` against `config` and convert them to records.
pub fn normalize(
    rows: &[RawRow],
    config: &ClassificationConfig,
    columns: &ColumnMap,
) -> Result<Normalized> {
    if rows.is_empty() {
        return Err(VatError::EmptyInput);
    }
    check_columns(rows, columns)?;

    let mut out = Normalized {
        records: Vec::with_capacity(rows.len()),
        diagnostics: Vec::new(),
    };
    for (index, row) in rows.iter().enumerate() {
        let row_number = index + 2;
        match normalize_row(row, row_number, config, columns) {
            Ok(record) => out.records.push(record),
            Err(diagnostic) => {
                debug!(%diagnostic, "dropping row");
                out.diagnostics.push(diagnostic);
            }
        }
    }

    if !out.diagnostics.is_empty() {
        warn!(
            dropped = out.diagnostics.len(),
            kept = out.records.len(),
            "rows dropped during validation"
        );
    }
    if out.records.is_empty() {
        return Err(VatError::EmptyResult {
            dropped: out.diagnostics.len(),
            diagnostics: out.diagnostics,
        });
    }
    Ok(out)
}

/// A column counts as present if any row carries it; readers omit
/// blank trailing cells, so the first row alone is not authoritative.
fn check_columns(rows: &[RawRow], columns: &ColumnMap) -> Result<()> {
    let present: BTreeSet<&str> = rows.iter().flat_map(RawRow::columns).collect();
    let missing: Vec<String> = columns
        .required()
        .iter()
        .filter(|c| !present.contains(**c))
        .map(|c| c.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(VatError::MissingColumns { columns: missing })
    }
}

fn normalize_row(
    row: &RawRow,
    row_number: usize,
    config: &ClassificationConfig,
    columns: &ColumnMap,
) -> std::result::Result<TransactionRecord, RowDiagnostic> {
    let reject = |field: &str, reason: DiagnosticReason| RowDiagnostic {
        row: row_number,
        field: field.to_string(),
        reason,
        value: row.get(field).map(RawValue::display).unwrap_or_default(),
    };

    let category_key = row.get(&columns.category).map(RawValue::display).unwrap_or_default();
    let category = config
        .category(&category_key)
        .ok_or_else(|| reject(&columns.category, DiagnosticReason::UnknownCategory))?;

    let direction_code = row
        .get(&columns.direction_code)
        .map(RawValue::display)
        .unwrap_or_default();
    if config.direction_of(&direction_code) == Direction::Unknown {
        return Err(reject(&columns.direction_code, DiagnosticReason::UnknownDirectionCode));
    }

    let number = |field: &str| {
        coerce_decimal(row.get(field)).map_err(|reason| reject(field, reason))
    };
    let tax_rate = number(&columns.tax_rate)?;
    let tax_amount = number(&columns.tax_amount)?;
    let excl_amount = number(&columns.excl_amount)?;
    let incl_amount = number(&columns.incl_amount)?;
    if tax_rate < Decimal::ZERO {
        return Err(reject(&columns.tax_rate, DiagnosticReason::NegativeRate));
    }

    let text = |field: &str| {
        row.get(field)
            .filter(|v| !v.is_blank())
            .map(RawValue::display)
    };
    Ok(TransactionRecord {
        row_number,
        category: category.clone(),
        direction_code: direction_code.to_ascii_uppercase(),
        tax_rate,
        tax_amount,
        excl_amount,
        incl_amount,
        description: text(&columns.description),
        reference: text(&columns.reference),
        date: text(&columns.date),
    })
}

/// Coerce a cell to an exact decimal.
///
/// Text may carry thousands separators, spaces, a trailing `%` or
/// accounting-style parentheses for negatives.  Booleans are rejected.
pub fn coerce_decimal(value: Option<&RawValue>) -> std::result::Result<Decimal, DiagnosticReason> {
    match value {
        None | Some(RawValue::Empty) => Err(DiagnosticReason::MissingValue),
        Some(RawValue::Bool(_)) => Err(DiagnosticReason::NonNumeric),
        Some(RawValue::Number(n)) => {
            if !n.is_finite() {
                return Err(DiagnosticReason::NonNumeric);
            }
            // Display gives the shortest text that round-trips, which is
            // what the spreadsheet showed the user.
            Decimal::from_str(&n.to_string())
                .ok()
                .or_else(|| Decimal::from_f64(*n))
                .map(|d| d.normalize())
                .ok_or(DiagnosticReason::NonNumeric)
        }
        Some(RawValue::Text(s)) => parse_decimal_text(s),
    }
}

fn parse_decimal_text(raw: &str) -> std::result::Result<Decimal, DiagnosticReason> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DiagnosticReason::MissingValue);
    }
    let (negative, body) = match trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, trimmed),
    };
    let body = body.strip_suffix('%').unwrap_or(body);
    let cleaned: String = body
        .chars()
        .filter(|c| !matches!(c, ',' | ' ' | '\u{a0}'))
        .collect();
    let value = Decimal::from_str(&cleaned).map_err(|_| DiagnosticReason::NonNumeric)?;
    Ok(if negative { -value } else { value })
}
