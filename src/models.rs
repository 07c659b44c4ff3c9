//! Data models for the VAT Engine.
//!
//! The `models` module defines the serialisable types that flow through
//! the engine: the loosely typed [`RawRow`] handed over by the
//! spreadsheet reader, the strict [`TransactionRecord`] produced by the
//! normalizer, the per-category totals built up during aggregation and
//! the [`FinalReport`] handed to reporting and export collaborators.
//! Monetary values are `rust_decimal::Decimal` throughout so that sums
//! over tens of thousands of rows never drift.

use crate::error::{Result, VatError};
use crate::tax::TaxCategory;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single cell as delivered by the spreadsheet reader.
///
/// The reader makes no promises about types: a monetary column may hold
/// a number in one row and a formatted string in the next. The variant
/// is preserved so the normalizer can decide, field by field, whether a
/// value is acceptable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    /// A blank cell (`null` in JSON).
    Empty,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl RawValue {
    /// Returns `true` for blank cells and whitespace-only text.
    pub fn is_blank(&self) -> bool {
        match self {
            RawValue::Empty => true,
            RawValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Renders the cell for display in diagnostics and samples.
    pub fn display(&self) -> String {
        match self {
            RawValue::Empty => String::new(),
            RawValue::Bool(b) => b.to_string(),
            RawValue::Number(n) => n.to_string(),
            RawValue::Text(s) => s.trim().to_string(),
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::Text(value)
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Number(value as f64)
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        RawValue::Bool(value)
    }
}

/// One spreadsheet row keyed by column header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRow {
    cells: BTreeMap<String, RawValue>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper used by readers and tests.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<RawValue>) {
        self.cells.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&RawValue> {
        self.cells.get(column)
    }

    /// Column headers present in this row.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }
}

/// Whether a transaction is a purchase (input tax) or a sale (output tax).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Purchases and expenses; VAT paid and claimable.
    Input,
    /// Sales and income; VAT charged and payable.
    Output,
    /// The direction code is in neither configured set.
    Unknown,
}

/// A validated transaction.  Only the normalizer constructs these, and
/// only for rows whose category is known and whose direction code
/// resolves to input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// 1-based spreadsheet row number (the header is row 1).
    pub row_number: usize,
    pub category: TaxCategory,
    /// Transaction type code from the source system, e.g. `"INV"`.
    pub direction_code: String,
    /// Rate as stated on the row, in percent.
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub excl_amount: Decimal,
    pub incl_amount: Decimal,
    pub description: Option<String>,
    pub reference: Option<String>,
    pub date: Option<String>,
}

/// The subset of a record retained for audit display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleTransaction {
    pub row_number: usize,
    pub direction_code: String,
    pub description: Option<String>,
    pub reference: Option<String>,
    pub date: Option<String>,
    pub tax_amount: Decimal,
    pub excl_amount: Decimal,
    pub incl_amount: Decimal,
}

impl From<&TransactionRecord> for SampleTransaction {
    fn from(record: &TransactionRecord) -> Self {
        SampleTransaction {
            row_number: record.row_number,
            direction_code: record.direction_code.clone(),
            description: record.description.clone(),
            reference: record.reference.clone(),
            date: record.date.clone(),
            tax_amount: record.tax_amount,
            excl_amount: record.excl_amount,
            incl_amount: record.incl_amount,
        }
    }
}

/// Running totals for one category in one direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionTotals {
    pub count: usize,
    pub vat_amount: Decimal,
    pub excl_amount: Decimal,
    pub incl_amount: Decimal,
    /// The first transactions seen, never more than the sample limit.
    pub sample_transactions: Vec<SampleTransaction>,
}

impl DirectionTotals {
    /// Adds a record to the totals, keeping it as a sample while there is room.
    ///
    /// On overflow the totals are left as they were.
    pub fn record(&mut self, record: &TransactionRecord, sample_limit: usize) -> Result<()> {
        let vat_amount = add_amount(self.vat_amount, record.tax_amount, "VAT")?;
        let excl_amount = add_amount(self.excl_amount, record.excl_amount, "excl. amounts")?;
        let incl_amount = add_amount(self.incl_amount, record.incl_amount, "incl. amounts")?;
        self.count += 1;
        self.vat_amount = vat_amount;
        self.excl_amount = excl_amount;
        self.incl_amount = incl_amount;
        if self.sample_transactions.len() < sample_limit {
            self.sample_transactions.push(SampleTransaction::from(record));
        }
        Ok(())
    }

    /// Folds `other` into `self`.  `other` must come later in row order.
    pub fn absorb(&mut self, other: DirectionTotals, sample_limit: usize) -> Result<()> {
        let vat_amount = add_amount(self.vat_amount, other.vat_amount, "VAT")?;
        let excl_amount = add_amount(self.excl_amount, other.excl_amount, "excl. amounts")?;
        let incl_amount = add_amount(self.incl_amount, other.incl_amount, "incl. amounts")?;
        self.count += other.count;
        self.vat_amount = vat_amount;
        self.excl_amount = excl_amount;
        self.incl_amount = incl_amount;
        let room = sample_limit.saturating_sub(self.sample_transactions.len());
        self.sample_transactions
            .extend(other.sample_transactions.into_iter().take(room));
        self.sample_transactions.truncate(sample_limit);
        Ok(())
    }
}

/// `total + amount`, or [`VatError::AmountOverflow`] naming `what`.
pub(crate) fn add_amount(total: Decimal, amount: Decimal, what: &'static str) -> Result<Decimal> {
    total.checked_add(amount).ok_or(VatError::AmountOverflow(what))
}

/// Input and output totals for a single tax category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryBreakdown {
    pub category: TaxCategory,
    pub input: DirectionTotals,
    pub output: DirectionTotals,
}

impl CategoryBreakdown {
    pub fn new(category: TaxCategory) -> Self {
        CategoryBreakdown {
            category,
            input: DirectionTotals::default(),
            output: DirectionTotals::default(),
        }
    }

    /// Totals for a resolved direction; `None` for [`Direction::Unknown`].
    pub fn totals_mut(&mut self, direction: Direction) -> Option<&mut DirectionTotals> {
        match direction {
            Direction::Input => Some(&mut self.input),
            Direction::Output => Some(&mut self.output),
            Direction::Unknown => None,
        }
    }
}

/// The finished VAT report.
///
/// Produced once per run by [`crate::finalize::finalize`] and handed
/// to the reporting and export collaborators as a read-only value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalReport {
    /// VAT paid on purchases.
    pub total_input_vat: Decimal,
    /// VAT charged on sales.
    pub total_output_vat: Decimal,
    pub sales_excluding_vat: Decimal,
    /// `sales_excluding_vat + total_output_vat`.
    pub sales_including_vat: Decimal,
    /// Output excl. amounts of zero-rated categories only.
    pub zero_rated_sales: Decimal,
    pub purchases_excluding_vat: Decimal,
    /// `total_output_vat - total_input_vat`.  Negative means a refund is due.
    pub vat_payable: Decimal,
    /// Records that contributed to the totals.
    pub transaction_count: usize,
    /// Per-category breakdown keyed by category code.
    pub categories: BTreeMap<String, CategoryBreakdown>,
}

impl FinalReport {
    /// `true` when the period results in a refund rather than a payment.
    pub fn is_refund(&self) -> bool {
        self.vat_payable < Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tax::CategoryKind;
    use rust_decimal_macros::dec;

    fn record(row_number: usize, tax: Decimal) -> TransactionRecord {
        TransactionRecord {
            row_number,
            category: TaxCategory::new("S", "Standard rate", dec!(15), CategoryKind::Standard),
            direction_code: "INV".into(),
            tax_rate: dec!(15),
            tax_amount: tax,
            excl_amount: tax * dec!(10),
            incl_amount: tax * dec!(11),
            description: Some(format!("row {row_number}")),
            reference: None,
            date: None,
        }
    }

    #[test]
    fn raw_row_deserializes_loose_json_cells() {
        let row: RawRow = serde_json::from_str(
            r#"{"tax_amount": 150, "description": "Stationery", "date": null, "flag": true}"#,
        )
        .unwrap();
        assert_eq!(row.get("tax_amount"), Some(&RawValue::Number(150.0)));
        assert_eq!(row.get("description"), Some(&RawValue::Text("Stationery".into())));
        assert_eq!(row.get("date"), Some(&RawValue::Empty));
        assert_eq!(row.get("flag"), Some(&RawValue::Bool(true)));
        assert!(row.get("missing").is_none());
    }

    #[test]
    fn blank_detection() {
        assert!(RawValue::Empty.is_blank());
        assert!(RawValue::from("   ").is_blank());
        assert!(!RawValue::from(0.0).is_blank());
    }

    #[test]
    fn totals_keep_first_samples_only() {
        let mut totals = DirectionTotals::default();
        for row in 2..10 {
            totals.record(&record(row, dec!(1.5)), 3).unwrap();
        }
        assert_eq!(totals.count, 8);
        assert_eq!(totals.vat_amount, dec!(12.0));
        let rows: Vec<usize> = totals.sample_transactions.iter().map(|s| s.row_number).collect();
        assert_eq!(rows, vec![2, 3, 4]);
    }

    #[test]
    fn absorb_appends_later_samples_after_earlier() {
        let mut left = DirectionTotals::default();
        left.record(&record(2, dec!(1)), 3).unwrap();
        let mut right = DirectionTotals::default();
        for row in 3..6 {
            right.record(&record(row, dec!(2)), 3).unwrap();
        }
        left.absorb(right, 3).unwrap();
        assert_eq!(left.count, 4);
        assert_eq!(left.vat_amount, dec!(7));
        let rows: Vec<usize> = left.sample_transactions.iter().map(|s| s.row_number).collect();
        assert_eq!(rows, vec![2, 3, 4]);
    }

    #[test]
    fn overflowing_totals_are_rejected_and_left_untouched() {
        let huge: Decimal = "5000000000000000000000000000".parse().unwrap();
        let mut totals = DirectionTotals::default();
        totals.record(&record(2, huge), 3).unwrap();
        let before = totals.clone();
        let err = totals.record(&record(3, huge), 3).unwrap_err();
        assert!(matches!(err, VatError::AmountOverflow(_)), "{err}");
        assert_eq!(totals, before);

        let mut other = DirectionTotals::default();
        other.record(&record(4, huge), 3).unwrap();
        assert!(matches!(
            totals.absorb(other, 3),
            Err(VatError::AmountOverflow(_))
        ));
        assert_eq!(totals, before);
    }
}
