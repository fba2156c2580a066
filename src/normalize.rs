//! `words_result` → [`InvoiceRecord`] mapping.
//!
//! Scalar fields are passed through as strings. `CommodityName` fixes the line
//! count `n`; the other three commodity arrays are read for the first `n`
//! entries and each column is joined with `\n`, so every commodity column has
//! exactly `n - 1` newlines.

use crate::types::{InvoiceRecord, WordItem, WordsResult};
use serde_json::Value;
use thiserror::Error;

pub const COMMODITY_NAME: &str = "CommodityName";
pub const COMMODITY_AMOUNT: &str = "CommodityAmount";
pub const COMMODITY_TAX_RATE: &str = "CommodityTaxRate";
pub const COMMODITY_TAX: &str = "CommodityTax";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("field {field} has unexpected shape: {detail}")]
    BadShape { field: &'static str, detail: String },
    #[error("{field} has {found} entries, CommodityName needs {expected}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("invoice has no commodity lines")]
    NoCommodityLines,
}

fn scalar(words: &WordsResult, key: &'static str) -> Result<String, RecordError> {
    match words.get(key) {
        None => Err(RecordError::MissingField(key)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) => Ok(String::new()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(other) => Err(RecordError::BadShape {
            field: key,
            detail: format!("expected a string, got {other}"),
        }),
    }
}

fn commodity_words(words: &WordsResult, key: &'static str) -> Result<Vec<String>, RecordError> {
    let value = words.get(key).ok_or(RecordError::MissingField(key))?;
    let items: Vec<WordItem> =
        serde_json::from_value(value.clone()).map_err(|e| RecordError::BadShape {
            field: key,
            detail: e.to_string(),
        })?;
    Ok(items.into_iter().map(|item| item.word).collect())
}

/// Normalize one recognition result. Fails without a partial record when a
/// key is missing or a commodity array is shorter than `CommodityName`.
pub fn normalize(words: &WordsResult) -> Result<InvoiceRecord, RecordError> {
    let names = commodity_words(words, COMMODITY_NAME)?;
    let n = names.len();
    if n == 0 {
        return Err(RecordError::NoCommodityLines);
    }
    let mut columns = [Vec::new(), Vec::new(), Vec::new()];
    for (slot, key) in columns
        .iter_mut()
        .zip([COMMODITY_AMOUNT, COMMODITY_TAX_RATE, COMMODITY_TAX])
    {
        let mut values = commodity_words(words, key)?;
        if values.len() < n {
            return Err(RecordError::LengthMismatch {
                field: key,
                expected: n,
                found: values.len(),
            });
        }
        values.truncate(n);
        *slot = values;
    }
    let [amounts, tax_rates, taxes] = columns;

    Ok(InvoiceRecord {
        invoice_code: scalar(words, "InvoiceCodeConfirm")?,
        invoice_number: scalar(words, "InvoiceNumConfirm")?,
        machine_code: scalar(words, "MachineCode")?,
        invoice_date: scalar(words, "InvoiceDate")?,
        purchaser_name: scalar(words, "PurchaserName")?,
        purchaser_register_num: scalar(words, "PurchaserRegisterNum")?,
        purchaser_address: scalar(words, "PurchaserAddress")?,
        purchaser_bank: scalar(words, "PurchaserBank")?,
        commodity_names: names.join("\n"),
        commodity_amounts: amounts.join("\n"),
        commodity_tax_rates: tax_rates.join("\n"),
        commodity_taxes: taxes.join("\n"),
        total_amount: scalar(words, "TotalAmount")?,
        total_tax: scalar(words, "TotalTax")?,
        amount_in_figures: scalar(words, "AmountInFiguers")?,
        seller_name: scalar(words, "SellerName")?,
        seller_register_num: scalar(words, "SellerRegisterNum")?,
        seller_address: scalar(words, "SellerAddress")?,
        seller_bank: scalar(words, "SellerBank")?,
        remarks: scalar(words, "Remarks")?,
    })
}
