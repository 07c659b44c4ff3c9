//! Derives the report totals that only make sense once all chunks
//! have been merged.

use crate::accumulate::Accumulator;
use crate::error::{Result, VatError};
use crate::models::{add_amount, FinalReport};
use rust_decimal::Decimal;

/// Turn a merged accumulator into the final report.
pub fn finalize(acc: &Accumulator) -> Result<FinalReport> {
    let mut sales_excluding_vat = Decimal::ZERO;
    let mut zero_rated_sales = Decimal::ZERO;
    let mut purchases_excluding_vat = Decimal::ZERO;
    for breakdown in acc.categories.values() {
        sales_excluding_vat =
            add_amount(sales_excluding_vat, breakdown.output.excl_amount, "sales")?;
        purchases_excluding_vat =
            add_amount(purchases_excluding_vat, breakdown.input.excl_amount, "purchases")?;
        if breakdown.category.is_zero_rated() {
            zero_rated_sales =
                add_amount(zero_rated_sales, breakdown.output.excl_amount, "zero-rated sales")?;
        }
    }

    Ok(FinalReport {
        total_input_vat: acc.total_input_vat,
        total_output_vat: acc.total_output_vat,
        sales_excluding_vat,
        sales_including_vat: add_amount(sales_excluding_vat, acc.total_output_vat, "sales")?,
        zero_rated_sales,
        purchases_excluding_vat,
        vat_payable: acc
            .total_output_vat
            .checked_sub(acc.total_input_vat)
            .ok_or(VatError::AmountOverflow("VAT payable"))?,
        transaction_count: acc.records_seen,
        categories: acc.categories.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulate::accumulate;
    use crate::models::TransactionRecord;
    use crate::tax::ClassificationConfig;
    use rust_decimal_macros::dec;

    fn record(category: &str, code: &str, tax: Decimal, excl: Decimal) -> TransactionRecord {
        let config = ClassificationConfig::south_african();
        let category = config.category(category).unwrap().clone();
        TransactionRecord {
            row_number: 2,
            tax_rate: category.rate,
            category,
            direction_code: code.into(),
            tax_amount: tax,
            excl_amount: excl,
            incl_amount: excl + tax,
            description: None,
            reference: None,
            date: None,
        }
    }

    #[test]
    fn three_row_scenario() {
        let config = ClassificationConfig::south_african();
        let records = vec![
            record("STD", "SINV", dec!(150), dec!(1000)),
            record("ZR", "CS", dec!(0), dec!(2000)),
            record("STD", "INV", dec!(300), dec!(2000)),
        ];
        let report = finalize(&accumulate(&records, &config, 5).unwrap()).unwrap();
        assert_eq!(report.total_input_vat, dec!(150));
        assert_eq!(report.total_output_vat, dec!(300));
        assert_eq!(report.sales_excluding_vat, dec!(4000));
        assert_eq!(report.sales_including_vat, dec!(4300));
        assert_eq!(report.zero_rated_sales, dec!(2000));
        assert_eq!(report.purchases_excluding_vat, dec!(1000));
        assert_eq!(report.vat_payable, dec!(150));
        assert_eq!(report.transaction_count, 3);
        assert!(!report.is_refund());
    }

    #[test]
    fn exempt_sales_are_not_zero_rated() {
        let config = ClassificationConfig::south_african();
        let records = vec![
            record("EX", "INV", dec!(0), dec!(500)),
            record("ZR", "INV", dec!(0), dec!(70)),
        ];
        let report = finalize(&accumulate(&records, &config, 5).unwrap()).unwrap();
        assert_eq!(report.sales_excluding_vat, dec!(570));
        assert_eq!(report.zero_rated_sales, dec!(70));
    }

    #[test]
    fn excess_input_vat_is_a_refund() {
        let config = ClassificationConfig::south_african();
        let records = vec![
            record("CAP", "PUR", dec!(1500), dec!(10000)),
            record("STD", "CS", dec!(45.15), dec!(301)),
        ];
        let report = finalize(&accumulate(&records, &config, 5).unwrap()).unwrap();
        assert_eq!(report.vat_payable, dec!(-1454.85));
        assert!(report.is_refund());
        assert_eq!(report.sales_including_vat, dec!(346.15));
    }

    #[test]
    fn empty_accumulator_finalizes_to_zero() {
        let report = finalize(&Accumulator::new(5)).unwrap();
        assert_eq!(report.vat_payable, Decimal::ZERO);
        assert!(report.categories.is_empty());
    }

    #[test]
    fn derived_totals_report_overflow() {
        let config = ClassificationConfig::south_african();
        let huge: Decimal = "40000000000000000000000000000".parse().unwrap();
        // Each total fits on its own; their sum does not.
        let mut sale = record("STD", "INV", dec!(0), dec!(0));
        sale.tax_amount = huge;
        sale.excl_amount = huge;
        let acc = accumulate(&[sale], &config, 5).unwrap();
        assert_eq!(acc.total_output_vat, huge);
        assert!(matches!(finalize(&acc), Err(VatError::AmountOverflow("sales"))));
    }
}
