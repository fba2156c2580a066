//! Sequential batch processing: recognize, normalize, deduplicate by invoice
//! number. One outcome per input, in input order.

use crate::cache::BatchCache;
use crate::normalize::{normalize, RecordError};
use crate::ocr::{AccessToken, InvoiceRecognizer, OcrError, TokenSource};
use crate::types::{BatchInput, InvoiceRecord};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// The recognition endpoint rejects base64 payloads above ~10 MB.
pub const MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;

/// Why a single file produced no record.
#[derive(Debug, Clone, Error)]
pub enum ItemFailure {
    #[error("could not read file: {0}")]
    Unreadable(String),
    #[error("file too large ({size} bytes, max 10 MiB)")]
    TooLarge { size: u64 },
    #[error("recognition failed: {0}")]
    Recognition(#[from] OcrError),
    #[error("unexpected recognition result: {0}")]
    Normalize(#[from] RecordError),
}

#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Extracted(InvoiceRecord),
    /// Invoice number already seen earlier in the batch; `first_file` carried it first.
    Duplicate {
        invoice_number: String,
        first_file: String,
    },
    Failed(ItemFailure),
}

#[derive(Debug, Clone)]
pub struct BatchRow {
    pub file_name: String,
    pub outcome: ItemOutcome,
}

impl BatchRow {
    /// The record, for rows that contribute data.
    pub fn record(&self) -> Option<&InvoiceRecord> {
        match &self.outcome {
            ItemOutcome::Extracted(record) => Some(record),
            _ => None,
        }
    }

    pub fn status(&self) -> &'static str {
        match &self.outcome {
            ItemOutcome::Extracted(_) => "ok",
            ItemOutcome::Duplicate { .. } => "duplicate",
            ItemOutcome::Failed(_) => "failed",
        }
    }
}

/// Ordered rows plus the invoice numbers seen so far.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    rows: Vec<BatchRow>,
    seen: HashMap<String, String>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a normalized record, or a duplicate row if its invoice number
    /// was already recorded. Numbers compare exactly, blank ones included.
    pub fn push_record(&mut self, file_name: impl Into<String>, record: InvoiceRecord) {
        let file_name = file_name.into();
        if let Some(first_file) = self.seen.get(&record.invoice_number) {
            tracing::info!(file = %file_name, invoice_number = %record.invoice_number, first = %first_file, "duplicate invoice skipped");
            let outcome = ItemOutcome::Duplicate {
                invoice_number: record.invoice_number,
                first_file: first_file.clone(),
            };
            self.rows.push(BatchRow { file_name, outcome });
            return;
        }
        self.seen.insert(record.invoice_number.clone(), file_name.clone());
        self.rows.push(BatchRow {
            file_name,
            outcome: ItemOutcome::Extracted(record),
        });
    }

    pub fn push_failure(&mut self, file_name: impl Into<String>, failure: ItemFailure) {
        let file_name = file_name.into();
        tracing::warn!(file = %file_name, reason = %failure, "invoice not extracted");
        self.rows.push(BatchRow {
            file_name,
            outcome: ItemOutcome::Failed(failure),
        });
    }

    pub fn rows(&self) -> &[BatchRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &InvoiceRecord> {
        self.rows.iter().filter_map(BatchRow::record)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &ItemFailure)> {
        self.rows.iter().filter_map(|row| match &row.outcome {
            ItemOutcome::Failed(failure) => Some((row.file_name.as_str(), failure)),
            _ => None,
        })
    }

    pub fn duplicate_count(&self) -> usize {
        self.rows
            .iter()
            .filter(|row| matches!(row.outcome, ItemOutcome::Duplicate { .. }))
            .count()
    }
}

fn extract_one<R: InvoiceRecognizer>(
    recognizer: &R,
    token: &AccessToken,
    input: &BatchInput,
) -> Result<InvoiceRecord, ItemFailure> {
    let size = input
        .source
        .size()
        .map_err(|e| ItemFailure::Unreadable(e.to_string()))?;
    if size > MAX_IMAGE_BYTES {
        return Err(ItemFailure::TooLarge { size });
    }
    let image = input
        .source
        .read()
        .map_err(|e| ItemFailure::Unreadable(e.to_string()))?;
    let words = recognizer.recognize(&image, token)?;
    Ok(normalize(&words)?)
}

/// Process every input with an already-acquired token. Per-file failures are
/// recorded and never stop the batch.
pub fn process_with_token<R: InvoiceRecognizer>(
    recognizer: &R,
    token: &AccessToken,
    inputs: &[BatchInput],
) -> Batch {
    let mut batch = Batch::new();
    for (i, input) in inputs.iter().enumerate() {
        tracing::debug!(index = i, file = %input.name, "recognizing");
        match extract_one(recognizer, token, input) {
            Ok(record) => batch.push_record(input.name.clone(), record),
            Err(failure) => batch.push_failure(input.name.clone(), failure),
        }
    }
    batch
}

/// Every input fails with the token error; nothing is sent for recognition.
fn reject_all(inputs: &[BatchInput], error: &OcrError) -> Batch {
    tracing::warn!(files = inputs.len(), reason = %error, "no access token, every file fails");
    let mut batch = Batch::new();
    for input in inputs {
        batch.push_failure(input.name.clone(), ItemFailure::Recognition(error.clone()));
    }
    batch
}

/// The batch, and whether a token was actually obtained for it.
fn run_batch<T, R>(tokens: &T, recognizer: &R, inputs: &[BatchInput]) -> Result<(Batch, bool), OcrError>
where
    T: TokenSource,
    R: InvoiceRecognizer,
{
    match tokens.access_token() {
        Ok(token) => Ok((process_with_token(recognizer, &token, inputs), true)),
        Err(error @ OcrError::TokenMissing { .. }) => Ok((reject_all(inputs, &error), false)),
        Err(error) => Err(error),
    }
}

/// Acquire one token, then process the inputs in order.
///
/// A token response without a token still yields a full batch in which every
/// file failed with that reason, so the workbook keeps one row per input.
/// Only a transport failure on the token endpoint fails the whole call.
pub fn process_batch<T, R>(tokens: &T, recognizer: &R, inputs: &[BatchInput]) -> Result<Batch, OcrError>
where
    T: TokenSource,
    R: InvoiceRecognizer,
{
    run_batch(tokens, recognizer, inputs).map(|(batch, _)| batch)
}

/// [`process_batch`] behind the content-keyed cache: the same files with the
/// same names in the same order return the stored batch without any remote call.
/// Batches produced without a token are not stored.
pub fn process_batch_cached<T, R>(
    cache: &BatchCache,
    tokens: &T,
    recognizer: &R,
    inputs: &[BatchInput],
) -> Result<Arc<Batch>, OcrError>
where
    T: TokenSource,
    R: InvoiceRecognizer,
{
    let key = cache.key_for(inputs);
    if let Some(hit) = key.as_deref().and_then(|k| cache.get(k)) {
        tracing::info!(files = inputs.len(), "batch served from cache");
        return Ok(hit);
    }
    let (batch, authorized) = run_batch(tokens, recognizer, inputs)?;
    let batch = Arc::new(batch);
    if let (Some(key), true) = (key, authorized) {
        cache.insert(key, Arc::clone(&batch));
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::MockRecognizer;
    use crate::types::WordsResult;
    use serde_json::json;

    fn words(number: &str, names: &[&str]) -> WordsResult {
        let items = |prefix: &str| {
            names
                .iter()
                .map(|n| json!({"word": format!("{prefix}{n}")}))
                .collect::<Vec<_>>()
        };
        let value = json!({
            "InvoiceCodeConfirm": "044001900111",
            "InvoiceNumConfirm": number,
            "MachineCode": "", "InvoiceDate": "2022年12月09日",
            "PurchaserName": "甲公司", "PurchaserRegisterNum": "", "PurchaserAddress": "", "PurchaserBank": "",
            "CommodityName": items(""), "CommodityAmount": items("amt-"),
            "CommodityTaxRate": items("rate-"), "CommodityTax": items("tax-"),
            "TotalAmount": "10.00", "TotalTax": "1.30", "AmountInFiguers": "11.30",
            "SellerName": "乙公司", "SellerRegisterNum": "", "SellerAddress": "", "SellerBank": "",
            "Remarks": ""
        });
        serde_json::from_value(value).unwrap()
    }

    fn input(bytes: &[u8], name: &str) -> BatchInput {
        BatchInput::from_bytes(bytes.to_vec(), name)
    }

    #[test]
    fn one_row_per_input_in_order() {
        let mock = MockRecognizer::new()
            .with_result(b"a".to_vec(), words("1", &["x"]))
            .with_result(b"c".to_vec(), words("3", &["z"]));
        let inputs = [input(b"a", "a.jpg"), input(b"b", "b.jpg"), input(b"c", "c.jpg")];
        let batch = process_batch(&mock, &mock, &inputs).unwrap();
        let names: Vec<_> = batch.rows().iter().map(|r| r.file_name.as_str()).collect();
        assert_eq!(names, ["a.jpg", "b.jpg", "c.jpg"]);
        let statuses: Vec<_> = batch.rows().iter().map(BatchRow::status).collect();
        assert_eq!(statuses, ["ok", "failed", "ok"]);
        assert_eq!(mock.token_calls(), 1);
    }

    #[test]
    fn repeated_invoice_number_keeps_first() {
        let mock = MockRecognizer::new()
            .with_result(b"first".to_vec(), words("12345", &["笔", "纸"]))
            .with_result(b"second".to_vec(), words("12345", &["other"]));
        let inputs = [input(b"first", "1.jpg"), input(b"second", "2.jpg")];
        let batch = process_batch(&mock, &mock, &inputs).unwrap();

        assert_eq!(batch.len(), 2);
        let first = batch.rows()[0].record().unwrap();
        assert_eq!(first.invoice_number, "12345");
        assert_eq!(first.commodity_names, "笔\n纸");
        match &batch.rows()[1].outcome {
            ItemOutcome::Duplicate {
                invoice_number,
                first_file,
            } => {
                assert_eq!(invoice_number, "12345");
                assert_eq!(first_file, "1.jpg");
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(batch.records().count(), 1);
        assert_eq!(batch.duplicate_count(), 1);
    }

    #[test]
    fn same_file_twice_is_a_duplicate() {
        let mock = MockRecognizer::new().with_result(b"img".to_vec(), words("12345", &["a", "b"]));
        let inputs = [input(b"img", "inv.jpg"), input(b"img", "inv.jpg")];
        let batch = process_batch(&mock, &mock, &inputs).unwrap();
        assert_eq!(batch.rows()[0].status(), "ok");
        assert_eq!(batch.rows()[1].status(), "duplicate");
        assert_eq!(batch.rows()[1].file_name, "inv.jpg");
    }

    #[test]
    fn failure_reasons_are_kept() {
        let mut broken = words("9", &["a"]);
        broken.0.remove("SellerBank");
        let mock = MockRecognizer::new()
            .with_error(b"down".to_vec(), OcrError::Status { status: 502, body: "bad gateway".into() })
            .with_result(b"broken".to_vec(), broken);
        let inputs = [
            input(b"down", "down.jpg"),
            input(b"broken", "broken.jpg"),
            BatchInput::from_path("/nonexistent/dir/missing.jpg"),
        ];
        let batch = process_batch(&mock, &mock, &inputs).unwrap();
        let failures: Vec<_> = batch.failures().collect();
        assert_eq!(failures.len(), 3);
        assert!(matches!(failures[0].1, ItemFailure::Recognition(OcrError::Status { status: 502, .. })));
        assert!(matches!(
            failures[1].1,
            ItemFailure::Normalize(RecordError::MissingField("SellerBank"))
        ));
        assert!(matches!(failures[2].1, ItemFailure::Unreadable(_)));
        assert_eq!(failures[2].0, "missing.jpg");
    }

    #[test]
    fn oversized_image_is_not_sent() {
        let big = vec![0u8; MAX_IMAGE_BYTES as usize + 1];
        let mock = MockRecognizer::new();
        let batch = process_batch(&mock, &mock, &[BatchInput::from_bytes(big, "huge.png")]).unwrap();
        assert!(matches!(
            batch.rows()[0].outcome,
            ItemOutcome::Failed(ItemFailure::TooLarge { .. })
        ));
        assert_eq!(mock.recognize_calls(), 0);
    }

    #[test]
    fn blank_invoice_numbers_dedup_like_any_other() {
        let mut batch = Batch::new();
        batch.push_record("a.jpg", InvoiceRecord::default());
        batch.push_record("b.jpg", InvoiceRecord::default());
        assert_eq!(batch.records().count(), 1);
        assert!(matches!(
            &batch.rows()[1].outcome,
            ItemOutcome::Duplicate { invoice_number, first_file } if invoice_number.is_empty() && first_file == "a.jpg"
        ));
    }

    #[test]
    fn invoice_numbers_compare_untrimmed() {
        let mut batch = Batch::new();
        let record = |n: &str| InvoiceRecord {
            invoice_number: n.into(),
            ..Default::default()
        };
        batch.push_record("a.jpg", record("12345"));
        batch.push_record("b.jpg", record(" 12345"));
        assert_eq!(batch.records().count(), 2);
        assert_eq!(batch.duplicate_count(), 0);
    }

    #[test]
    fn reprocessing_is_idempotent() {
        let mock = MockRecognizer::new()
            .with_result(b"a".to_vec(), words("1", &["x", "y"]))
            .with_result(b"b".to_vec(), words("2", &["z"]));
        let inputs = [input(b"a", "a.jpg"), input(b"b", "b.jpg")];
        let first = process_batch(&mock, &mock, &inputs).unwrap();
        let second = process_batch(&mock, &mock, &inputs).unwrap();
        let a: Vec<_> = first.records().cloned().collect();
        let b: Vec<_> = second.records().cloned().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn cache_skips_remote_calls_on_repeat() {
        let mock = MockRecognizer::new().with_result(b"a".to_vec(), words("1", &["x"]));
        let cache = BatchCache::new();
        let inputs = [input(b"a", "a.jpg")];
        let first = process_batch_cached(&cache, &mock, &mock, &inputs).unwrap();
        let second = process_batch_cached(&cache, &mock, &mock, &inputs).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(mock.token_calls(), 1);
        assert_eq!(mock.recognize_calls(), 1);

        let renamed = [input(b"a", "renamed.jpg")];
        process_batch_cached(&cache, &mock, &mock, &renamed).unwrap();
        assert_eq!(mock.recognize_calls(), 2);
    }

    /// Token endpoint that answers without a token.
    struct RejectingTokens;

    impl TokenSource for RejectingTokens {
        fn access_token(&self) -> Result<AccessToken, OcrError> {
            Err(OcrError::TokenMissing {
                error: "invalid_client".into(),
                description: "unknown client id".into(),
            })
        }
    }

    #[test]
    fn missing_token_fails_every_file_but_keeps_rows() {
        let mock = MockRecognizer::new().with_result(b"a".to_vec(), words("1", &["x"]));
        let inputs = [input(b"a", "a.jpg"), input(b"b", "b.jpg")];
        let batch = process_batch(&RejectingTokens, &mock, &inputs).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records().count(), 0);
        for (row, name) in batch.rows().iter().zip(["a.jpg", "b.jpg"]) {
            assert_eq!(row.file_name, name);
            assert!(matches!(
                &row.outcome,
                ItemOutcome::Failed(ItemFailure::Recognition(OcrError::TokenMissing { error, .. }))
                    if error == "invalid_client"
            ));
        }
        assert_eq!(mock.recognize_calls(), 0);
    }

    #[test]
    fn batch_without_token_is_not_cached() {
        let mock = MockRecognizer::new().with_result(b"a".to_vec(), words("1", &["x"]));
        let cache = BatchCache::new();
        let inputs = [input(b"a", "a.jpg")];
        process_batch_cached(&cache, &RejectingTokens, &mock, &inputs).unwrap();
        assert!(cache.is_empty());
        let retried = process_batch_cached(&cache, &mock, &mock, &inputs).unwrap();
        assert_eq!(retried.records().count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn oversized_file_is_rejected_from_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.png");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(MAX_IMAGE_BYTES + 1).unwrap();
        let mock = MockRecognizer::new();
        let batch = process_batch(&mock, &mock, &[BatchInput::from_path(&path)]).unwrap();
        assert!(matches!(
            batch.rows()[0].outcome,
            ItemOutcome::Failed(ItemFailure::TooLarge { size }) if size == MAX_IMAGE_BYTES + 1
        ));
        assert_eq!(mock.recognize_calls(), 0);
    }
}
