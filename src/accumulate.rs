//! Classification and aggregation of validated records.
//!
//! [`accumulate`] is a pure function over a slice of records: it reads
//! the classification config, touches nothing shared and returns a
//! fresh [`Accumulator`].  That is what lets the scheduler run it on
//! many chunks at once and combine the partial results afterwards with
//! [`Accumulator::merge`].

use crate::error::Result;
use crate::models::{add_amount, CategoryBreakdown, Direction, TransactionRecord};
use crate::tax::ClassificationConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::error;

/// Default number of sample transactions kept per category and direction.
pub const DEFAULT_SAMPLE_LIMIT: usize = 5;

/// Sums, counts and samples for one batch of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accumulator {
    pub categories: BTreeMap<String, CategoryBreakdown>,
    pub total_input_vat: Decimal,
    pub total_output_vat: Decimal,
    /// Records added to the totals.
    pub records_seen: usize,
    /// Records skipped because their direction did not resolve.
    pub skipped: usize,
    pub sample_limit: usize,
}

impl Accumulator {
    pub fn new(sample_limit: usize) -> Self {
        Accumulator {
            categories: BTreeMap::new(),
            total_input_vat: Decimal::ZERO,
            total_output_vat: Decimal::ZERO,
            records_seen: 0,
            skipped: 0,
            sample_limit,
        }
    }

    /// Classify one record and add it to the totals.
    pub fn add(
        &mut self,
        record: &TransactionRecord,
        config: &ClassificationConfig,
    ) -> Result<()> {
        let direction = config.direction_of(&record.direction_code);
        if direction == Direction::Unknown {
            // The normalizer never emits these; count it rather than let it
            // take down a whole chunk.
            error!(
                row = record.row_number,
                code = %record.direction_code,
                "record with unresolvable direction reached the accumulator"
            );
            self.skipped += 1;
            return Ok(());
        }
        let sample_limit = self.sample_limit;
        let total = match direction {
            Direction::Input => &mut self.total_input_vat,
            _ => &mut self.total_output_vat,
        };
        let new_total = add_amount(*total, record.tax_amount, "VAT totals")?;
        let breakdown = self
            .categories
            .entry(record.category.code.clone())
            .or_insert_with(|| CategoryBreakdown::new(record.category.clone()));
        if let Some(totals) = breakdown.totals_mut(direction) {
            totals.record(record, sample_limit)?;
        }
        *total = new_total;
        self.records_seen += 1;
        Ok(())
    }

    /// Combine two accumulators.
    ///
    /// `self` must cover rows that come before `other`'s: samples are
    /// taken from `self` first and then topped up from `other`.  Sums and
    /// counts do not depend on the order.
    pub fn merge(mut self, other: Accumulator) -> Result<Accumulator> {
        let sample_limit = self.sample_limit.min(other.sample_limit);
        for totals in self
            .categories
            .values_mut()
            .flat_map(|b| [&mut b.input, &mut b.output])
        {
            totals.sample_transactions.truncate(sample_limit);
        }
        for (code, incoming) in other.categories {
            match self.categories.get_mut(&code) {
                Some(existing) => {
                    existing.input.absorb(incoming.input, sample_limit)?;
                    existing.output.absorb(incoming.output, sample_limit)?;
                }
                None => {
                    let mut incoming = incoming;
                    incoming.input.sample_transactions.truncate(sample_limit);
                    incoming.output.sample_transactions.truncate(sample_limit);
                    self.categories.insert(code, incoming);
                }
            }
        }
        self.total_input_vat =
            add_amount(self.total_input_vat, other.total_input_vat, "VAT totals")?;
        self.total_output_vat =
            add_amount(self.total_output_vat, other.total_output_vat, "VAT totals")?;
        self.records_seen += other.records_seen;
        self.skipped += other.skipped;
        self.sample_limit = sample_limit;
        Ok(self)
    }
}

/// Build an accumulator for `records`.
pub fn accumulate(
    records: &[TransactionRecord],
    config: &ClassificationConfig,
    sample_limit: usize,
) -> Result<Accumulator> {
    let mut acc = Accumulator::new(sample_limit);
    for record in records {
        acc.add(record, config)?;
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VatError;
    use rust_decimal_macros::dec;

    fn record(row_number: usize, category: &str, code: &str, tax: Decimal) -> TransactionRecord {
        let config = ClassificationConfig::south_african();
        TransactionRecord {
            row_number,
            category: config.category(category).unwrap().clone(),
            direction_code: code.into(),
            tax_rate: dec!(15),
            tax_amount: tax,
            excl_amount: tax * dec!(10),
            incl_amount: tax * dec!(11),
            description: None,
            reference: None,
            date: None,
        }
    }

    fn sample_rows(acc: &Accumulator, category: &str, direction: Direction) -> Vec<usize> {
        let breakdown = &acc.categories[category];
        let totals = match direction {
            Direction::Input => &breakdown.input,
            _ => &breakdown.output,
        };
        totals.sample_transactions.iter().map(|s| s.row_number).collect()
    }

    fn batch() -> Vec<TransactionRecord> {
        (0..12)
            .map(|i| {
                let code = if i % 2 == 0 { "SINV" } else { "INV" };
                let category = if i % 3 == 0 { "ZR" } else { "STD" };
                record(i + 2, category, code, Decimal::new(i as i64 * 1001, 2))
            })
            .collect()
    }

    #[test]
    fn classifies_by_direction_and_category() {
        let config = ClassificationConfig::south_african();
        let records = vec![
            record(2, "STD", "SINV", dec!(150)),
            record(3, "ZR", "CS", dec!(0)),
            record(4, "STD", "INV", dec!(300)),
        ];
        let acc = accumulate(&records, &config, DEFAULT_SAMPLE_LIMIT).unwrap();
        assert_eq!(acc.total_input_vat, dec!(150));
        assert_eq!(acc.total_output_vat, dec!(300));
        assert_eq!(acc.records_seen, 3);
        let std = &acc.categories["STD"];
        assert_eq!(std.input.count, 1);
        assert_eq!(std.input.excl_amount, dec!(1500));
        assert_eq!(std.output.vat_amount, dec!(300));
        assert_eq!(acc.categories["ZR"].output.count, 1);
        assert!(!acc.categories.contains_key("EX"));
    }

    #[test]
    fn unresolvable_direction_is_skipped_not_counted() {
        let config = ClassificationConfig::south_african();
        let records = vec![record(2, "EX", "GJ", dec!(99)), record(3, "STD", "INV", dec!(1))];
        let acc = accumulate(&records, &config, DEFAULT_SAMPLE_LIMIT).unwrap();
        assert_eq!(acc.skipped, 1);
        assert_eq!(acc.records_seen, 1);
        assert_eq!(acc.total_input_vat + acc.total_output_vat, dec!(1));
        assert!(!acc.categories.contains_key("EX"));
    }

    #[test]
    fn samples_are_bounded_first_seen() {
        let config = ClassificationConfig::south_african();
        let records: Vec<_> = (0..20).map(|i| record(i + 2, "STD", "INV", dec!(1))).collect();
        let acc = accumulate(&records, &config, 5).unwrap();
        assert_eq!(acc.categories["STD"].output.count, 20);
        assert_eq!(sample_rows(&acc, "STD", Direction::Output), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn merge_in_chunk_order_matches_single_pass() {
        let config = ClassificationConfig::south_african();
        let records = batch();
        let whole = accumulate(&records, &config, 3).unwrap();
        let merged = records
            .chunks(5)
            .map(|c| accumulate(c, &config, 3).unwrap())
            .try_fold(Accumulator::new(3), Accumulator::merge)
            .unwrap();
        assert_eq!(merged, whole);
    }

    #[test]
    fn merge_is_associative() {
        let config = ClassificationConfig::south_african();
        let records = batch();
        let parts: Vec<_> = records
            .chunks(4)
            .map(|c| accumulate(c, &config, 2).unwrap())
            .collect();
        let (a, b, c) = (parts[0].clone(), parts[1].clone(), parts[2].clone());
        let left = a.clone().merge(b.clone()).unwrap().merge(c.clone()).unwrap();
        let right = a.merge(b.merge(c).unwrap()).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn merge_is_commutative_on_totals() {
        let config = ClassificationConfig::south_african();
        let records = batch();
        let a = accumulate(&records[..7], &config, 2).unwrap();
        let b = accumulate(&records[7..], &config, 2).unwrap();
        let ab = a.clone().merge(b.clone()).unwrap();
        let ba = b.merge(a).unwrap();
        assert_eq!(ab.total_input_vat, ba.total_input_vat);
        assert_eq!(ab.total_output_vat, ba.total_output_vat);
        assert_eq!(ab.records_seen, ba.records_seen);
        for (code, left) in &ab.categories {
            let right = &ba.categories[code];
            assert_eq!(left.input.count, right.input.count);
            assert_eq!(left.input.vat_amount, right.input.vat_amount);
            assert_eq!(left.output.excl_amount, right.output.excl_amount);
        }
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let config = ClassificationConfig::south_african();
        let acc = accumulate(&batch(), &config, 5).unwrap();
        assert_eq!(Accumulator::new(5).merge(acc.clone()).unwrap(), acc);
        assert_eq!(acc.clone().merge(Accumulator::new(5)).unwrap(), acc);
    }

    #[test]
    fn overflow_fails_the_same_way_in_one_chunk_or_split() {
        let config = ClassificationConfig::south_african();
        let huge: Decimal = "20000000000000000000000000000".parse().unwrap();
        // Category totals stay in range; only the output VAT total overflows.
        let records: Vec<_> = ["STD", "ZR", "EX", "CAP"]
            .iter()
            .enumerate()
            .map(|(i, category)| {
                let mut r = record(i + 2, category, "INV", dec!(0));
                r.tax_amount = huge;
                r
            })
            .collect();

        let whole = accumulate(&records, &config, 5);
        assert!(matches!(whole, Err(VatError::AmountOverflow("VAT totals"))));

        let merged = records
            .chunks(1)
            .map(|c| accumulate(c, &config, 5).unwrap())
            .try_fold(Accumulator::new(5), Accumulator::merge);
        assert!(matches!(merged, Err(VatError::AmountOverflow("VAT totals"))));
    }
}
