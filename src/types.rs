use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// One recognized word from the VAT invoice API (commodity array element).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WordItem {
    pub word: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<Value>,
}

/// Raw `words_result` map returned per invoice. Scalar fields map to strings,
/// commodity fields to arrays of [`WordItem`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct WordsResult(pub Map<String, Value>);

impl WordsResult {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl From<Map<String, Value>> for WordsResult {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Headers of the 20 record columns, in export order.
pub const RECORD_HEADERS: [&str; 20] = [
    "发票代码",
    "发票编号",
    "机器编号",
    "开票日期",
    "购买方 名称",
    "购买方 纳税人识别号",
    "购买方 地址、电话",
    "购买方 开户行及账号",
    "货物或应税劳务、服务名称",
    "金额",
    "税率",
    "税额",
    "合计金额",
    "合计税额",
    "价税合计",
    "销售方 名称",
    "销售方 纳税人识别号",
    "销售方 地址、电话",
    "销售方 开户行及账号",
    "备注",
];

pub const FILE_NAME_HEADER: &str = "文件名";

/// Normalized invoice row. The four commodity columns hold one line per
/// commodity, joined with `\n`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvoiceRecord {
    pub invoice_code: String,
    pub invoice_number: String,
    pub machine_code: String,
    pub invoice_date: String,
    pub purchaser_name: String,
    pub purchaser_register_num: String,
    pub purchaser_address: String,
    pub purchaser_bank: String,
    pub commodity_names: String,
    pub commodity_amounts: String,
    pub commodity_tax_rates: String,
    pub commodity_taxes: String,
    pub total_amount: String,
    pub total_tax: String,
    pub amount_in_figures: String,
    pub seller_name: String,
    pub seller_register_num: String,
    pub seller_address: String,
    pub seller_bank: String,
    pub remarks: String,
}

impl InvoiceRecord {
    /// Cell values in [`RECORD_HEADERS`] order.
    pub fn cells(&self) -> [&str; 20] {
        [
            self.invoice_code.as_str(),
            self.invoice_number.as_str(),
            self.machine_code.as_str(),
            self.invoice_date.as_str(),
            self.purchaser_name.as_str(),
            self.purchaser_register_num.as_str(),
            self.purchaser_address.as_str(),
            self.purchaser_bank.as_str(),
            self.commodity_names.as_str(),
            self.commodity_amounts.as_str(),
            self.commodity_tax_rates.as_str(),
            self.commodity_taxes.as_str(),
            self.total_amount.as_str(),
            self.total_tax.as_str(),
            self.amount_in_figures.as_str(),
            self.seller_name.as_str(),
            self.seller_register_num.as_str(),
            self.seller_address.as_str(),
            self.seller_bank.as_str(),
            self.remarks.as_str(),
        ]
    }
}

/// Where an invoice image comes from: a file on disk or bytes already in memory.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl ImageSource {
    pub fn read(&self) -> std::io::Result<Cow<'_, [u8]>> {
        match self {
            ImageSource::Path(path) => std::fs::read(path).map(Cow::Owned),
            ImageSource::Bytes(bytes) => Ok(Cow::Borrowed(bytes.as_slice())),
        }
    }

    /// Size in bytes, from file metadata for paths, so the content is not read.
    pub fn size(&self) -> std::io::Result<u64> {
        match self {
            ImageSource::Path(path) => std::fs::metadata(path).map(|m| m.len()),
            ImageSource::Bytes(bytes) => Ok(bytes.len() as u64),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            ImageSource::Path(path) => Some(path),
            ImageSource::Bytes(_) => None,
        }
    }
}

/// One batch entry: the image plus the name shown in the file-name column.
#[derive(Debug, Clone)]
pub struct BatchInput {
    pub source: ImageSource,
    pub name: String,
}

impl BatchInput {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|o| o.to_str())
            .unwrap_or("")
            .to_string();
        Self {
            source: ImageSource::Path(path),
            name,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>, name: impl Into<String>) -> Self {
        Self {
            source: ImageSource::Bytes(bytes),
            name: name.into(),
        }
    }
}
