//! Tax categories and transaction classification rules.
//!
//! The `tax` module defines the category table and the direction code
//! sets that decide whether a transaction counts as a purchase (input
//! VAT) or a sale (output VAT).  Both live in a single
//! [`ClassificationConfig`] value which is passed explicitly to the
//! normalizer and the accumulator; nothing here is global.  Configs can
//! be built in code, taken from the bundled South African preset, or
//! loaded from JSON files.

use crate::error::VatError;
use crate::models::Direction;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// How a category is treated on the return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryKind {
    /// Taxable at a positive rate.
    Standard,
    /// Taxable at 0%.  Reported separately as zero-rated supplies.
    ZeroRated,
    /// Outside the VAT net.  Rate is 0% but not reported as zero-rated.
    Exempt,
}

/// A tax category as it appears in the source system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaxCategory {
    /// Short code used in the spreadsheet, e.g. `"STD"`.
    pub code: String,
    pub description: String,
    /// Rate in percent.  Never negative.
    pub rate: Decimal,
    pub kind: CategoryKind,
}

impl TaxCategory {
    pub fn new(
        code: impl Into<String>,
        description: impl Into<String>,
        rate: Decimal,
        kind: CategoryKind,
    ) -> Self {
        TaxCategory {
            code: code.into(),
            description: description.into(),
            rate,
            kind,
        }
    }

    pub fn is_zero_rated(&self) -> bool {
        self.kind == CategoryKind::ZeroRated
    }
}

/// The category table plus the two disjoint direction code sets.
///
/// Configs are immutable once a run starts; the scheduler shares one
/// instance across worker threads behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationConfig {
    /// A label such as `"ZA-2024"`.  Only used in log output.
    #[serde(default)]
    pub name: String,
    pub categories: Vec<TaxCategory>,
    /// Codes for purchases and expenses.
    pub input_codes: BTreeSet<String>,
    /// Codes for sales and income.
    pub output_codes: BTreeSet<String>,
}

impl ClassificationConfig {
    /// Categories and transaction codes for a South African VAT201 return.
    pub fn south_african() -> Self {
        let codes = |list: &[&str]| -> BTreeSet<String> {
            list.iter().map(|c| c.to_string()).collect()
        };
        ClassificationConfig {
            name: "ZA-VAT201".into(),
            categories: vec![
                TaxCategory::new("STD", "Standard rate", Decimal::new(15, 0), CategoryKind::Standard),
                TaxCategory::new(
                    "CAP",
                    "Capital goods",
                    Decimal::new(15, 0),
                    CategoryKind::Standard,
                ),
                TaxCategory::new("ZR", "Zero rated", Decimal::ZERO, CategoryKind::ZeroRated),
                TaxCategory::new("EX", "Exempt", Decimal::ZERO, CategoryKind::Exempt),
            ],
            // Supplier invoices, cash purchases, expense claims, input journals.
            input_codes: codes(&["SINV", "PUR", "CP", "EXP", "JNLI"]),
            // Customer invoices, cash sales, credit notes, output journals.
            output_codes: codes(&["INV", "CS", "CN", "JNLO"]),
        }
    }

    /// Looks a category up by code, falling back to its description.
    /// Matching ignores case and surrounding whitespace.
    pub fn category(&self, key: &str) -> Option<&TaxCategory> {
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        self.categories
            .iter()
            .find(|c| c.code.eq_ignore_ascii_case(key))
            .or_else(|| {
                self.categories
                    .iter()
                    .find(|c| c.description.eq_ignore_ascii_case(key))
            })
    }

    /// Resolves a transaction code to a direction.
    pub fn direction_of(&self, code: &str) -> Direction {
        let code = code.trim();
        if code.is_empty() {
            return Direction::Unknown;
        }
        let matches =
            |set: &BTreeSet<String>| set.iter().any(|c| c.trim().eq_ignore_ascii_case(code));
        if matches(&self.input_codes) {
            Direction::Input
        } else if matches(&self.output_codes) {
            Direction::Output
        } else {
            Direction::Unknown
        }
    }

    /// Checks the table for duplicate codes, negative rates and codes
    /// that appear in both direction sets.
    pub fn validate(&self) -> std::result::Result<(), VatError> {
        if self.categories.is_empty() {
            return Err(VatError::InvalidConfig("no tax categories configured".into()));
        }
        let mut seen = HashSet::new();
        for category in &self.categories {
            if category.code.trim().is_empty() {
                return Err(VatError::InvalidConfig("tax category with empty code".into()));
            }
            if !seen.insert(category.code.trim().to_ascii_uppercase()) {
                return Err(VatError::InvalidConfig(format!(
                    "duplicate tax category code '{}'",
                    category.code
                )));
            }
            if category.rate < Decimal::ZERO {
                return Err(VatError::InvalidConfig(format!(
                    "tax category '{}' has negative rate {}",
                    category.code, category.rate
                )));
            }
        }
        let inputs: HashSet<String> = self
            .input_codes
            .iter()
            .map(|c| c.trim().to_ascii_uppercase())
            .collect();
        let mut overlap: Vec<&str> = self
            .output_codes
            .iter()
            .filter(|c| inputs.contains(&c.trim().to_ascii_uppercase()))
            .map(String::as_str)
            .collect();
        if !overlap.is_empty() {
            overlap.sort_unstable();
            return Err(VatError::InvalidConfig(format!(
                "direction codes configured as both input and output: {}",
                overlap.join(", ")
            )));
        }
        Ok(())
    }
}

/// Load and validate a classification config from a JSON file.
pub fn load_config_from_file(path: &Path) -> Result<ClassificationConfig> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading classification config {}", path.display()))?;
    let config: ClassificationConfig = serde_json::from_str(&data)
        .with_context(|| format!("parsing classification config {}", path.display()))?;
    config.validate()?;
    tracing::debug!(
        name = %config.name,
        categories = config.categories.len(),
        "loaded classification config"
    );
    Ok(config)
}
