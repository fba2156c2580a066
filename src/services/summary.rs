//! Simplified invoice-summary view: 8 of the batch columns, relabelled, with a
//! constant invoicing type on every row.

use crate::batch::Batch;
use crate::types::InvoiceRecord;

pub const INVOICE_TYPE_LABEL: &str = "增值税专用发票";

pub const SUMMARY_HEADERS: [&str; 8] = [
    "发票代码",
    "发票编号",
    "发票名称",
    "开票类型",
    "发票金额（含税）",
    "税率%",
    "税额",
    "发票金额（不含税）",
];

/// Summary columns written as numbers when they parse.
pub const SUMMARY_AMOUNT_COLUMNS: [usize; 3] = [4, 6, 7];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRow {
    pub cells: [String; 8],
}

fn project(record: Option<&InvoiceRecord>) -> SummaryRow {
    let blank = InvoiceRecord::default();
    let r = record.unwrap_or(&blank);
    SummaryRow {
        cells: [
            r.invoice_code.clone(),
            r.invoice_number.clone(),
            r.commodity_names.clone(),
            INVOICE_TYPE_LABEL.to_string(),
            r.amount_in_figures.clone(),
            r.commodity_tax_rates.clone(),
            r.total_tax.clone(),
            r.total_amount.clone(),
        ],
    }
}

/// One summary row per batch row, in batch order. Failed and duplicate rows
/// keep only the invoicing type.
pub fn reshape(batch: &Batch) -> Vec<SummaryRow> {
    batch.rows().iter().map(|row| project(row.record())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ItemFailure;

    fn record(number: &str) -> InvoiceRecord {
        InvoiceRecord {
            invoice_code: "3200191130".into(),
            invoice_number: number.into(),
            commodity_names: "笔\n纸".into(),
            commodity_tax_rates: "13%\n13%".into(),
            total_amount: "300.00".into(),
            total_tax: "39.00".into(),
            amount_in_figures: "339.00".into(),
            seller_name: "not projected".into(),
            ..Default::default()
        }
    }

    #[test]
    fn two_rows_get_eight_columns_and_constant_type() {
        let mut batch = Batch::new();
        batch.push_record("a.jpg", record("1"));
        batch.push_record("b.jpg", record("2"));
        let rows = reshape(&batch);
        assert_eq!(rows.len(), 2);
        assert_eq!(SUMMARY_HEADERS.len(), 8);
        for row in &rows {
            assert_eq!(row.cells.len(), 8);
            assert_eq!(row.cells[3], INVOICE_TYPE_LABEL);
        }
        assert_eq!(
            rows[0].cells,
            [
                "3200191130".to_string(),
                "1".into(),
                "笔\n纸".into(),
                INVOICE_TYPE_LABEL.into(),
                "339.00".into(),
                "13%\n13%".into(),
                "39.00".into(),
                "300.00".into(),
            ]
        );
    }

    #[test]
    fn blank_rows_still_carry_invoice_type() {
        let mut batch = Batch::new();
        batch.push_failure("bad.jpg", ItemFailure::Unreadable("gone".into()));
        let rows = reshape(&batch);
        assert_eq!(rows[0].cells[3], INVOICE_TYPE_LABEL);
        assert!(rows[0]
            .cells
            .iter()
            .enumerate()
            .all(|(i, c)| i == 3 || c.is_empty()));
    }
}
