use calamine::{open_workbook_auto, Data, DataType, Range, Reader, Xlsx};
use chrono::NaiveDateTime;
use rust_xlsxwriter::{Color, Format, FormatAlign, Workbook, Worksheet, XlsxError};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::batch::Batch;
use crate::services::summary::{SummaryRow, SUMMARY_AMOUNT_COLUMNS, SUMMARY_HEADERS};
use crate::types::{FILE_NAME_HEADER, RECORD_HEADERS};

pub const SHEET_NAME: &str = "发票识别";
pub const SUMMARY_SHEET_NAME: &str = "发票汇总";
const FILE_PREFIX: &str = "invoice-extraction";

/// 合计金额, 合计税额, 价税合计 in the batch table (file name is column 0).
const BATCH_AMOUNT_COLUMNS: [usize; 3] = [13, 14, 15];

#[derive(Debug, Error)]
pub enum ExcelError {
    #[error("could not write workbook: {0}")]
    Xlsx(#[from] XlsxError),
    #[error("could not read workbook: {0}")]
    Read(String),
    #[error("workbook has no sheets")]
    NoSheet,
}

/// Header row of the batch table: file name, then the record columns.
pub fn batch_headers() -> Vec<&'static str> {
    std::iter::once(FILE_NAME_HEADER)
        .chain(RECORD_HEADERS.iter().copied())
        .collect()
}

struct SheetData<'a> {
    name: &'a str,
    headers: Vec<&'a str>,
    rows: Vec<Vec<&'a str>>,
    amount_columns: &'a [usize],
}

fn batch_sheet(batch: &Batch) -> SheetData<'_> {
    let rows = batch
        .rows()
        .iter()
        .map(|row| {
            let mut cells = vec![row.file_name.as_str()];
            match row.record() {
                Some(record) => cells.extend(record.cells()),
                None => cells.extend(std::iter::repeat("").take(RECORD_HEADERS.len())),
            }
            cells
        })
        .collect();
    SheetData {
        name: SHEET_NAME,
        headers: batch_headers(),
        rows,
        amount_columns: &BATCH_AMOUNT_COLUMNS,
    }
}

fn summary_sheet(rows: &[SummaryRow]) -> SheetData<'_> {
    SheetData {
        name: SUMMARY_SHEET_NAME,
        headers: SUMMARY_HEADERS.to_vec(),
        rows: rows
            .iter()
            .map(|r| r.cells.iter().map(String::as_str).collect())
            .collect(),
        amount_columns: &SUMMARY_AMOUNT_COLUMNS,
    }
}

/// Remove characters that can corrupt the sheet XML (control chars other than
/// tab, newline and CR; U+FFFE/U+FFFF).
fn sanitize_cell(s: &str) -> String {
    s.chars()
        .filter(|&c| {
            let u = c as u32;
            c == '\t' || c == '\n' || c == '\r' || !(u < 0x20 || u == 0x7F || u == 0xFFFE || u == 0xFFFF)
        })
        .collect()
}

fn write_text_cell_safe(
    worksheet: &mut Worksheet,
    row: u32,
    col: u16,
    text: &str,
    format: &Format,
) -> Result<(), XlsxError> {
    let cleaned = sanitize_cell(text);
    worksheet.write_string_with_format(row, col, &cleaned, format).map(|_| ())
}

/// Write number cell: parse as f64 and write number, or write sanitized text on parse failure.
fn write_number_cell_safe(
    worksheet: &mut Worksheet,
    row: u32,
    col: u16,
    value: &str,
    number_format: &Format,
    text_format: &Format,
) -> Result<(), XlsxError> {
    let cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, ',' | ' ' | '¥' | '￥'))
        .collect();
    match cleaned.trim().parse::<f64>() {
        Ok(num) => worksheet.write_number_with_format(row, col, num, number_format).map(|_| ()),
        Err(_) => write_text_cell_safe(worksheet, row, col, value, text_format),
    }
}

/// Display width of one line; CJK and other wide characters count double.
pub(crate) fn display_width(line: &str) -> f64 {
    line.chars().map(|c| if c.is_ascii() { 1.0 } else { 2.0 }).sum()
}

/// Estimate column width from the longest line (clamped 10–50).
fn estimate_text_width(text: &str) -> f64 {
    let widest = text.lines().map(display_width).fold(0.0, f64::max);
    (widest * 1.1).clamp(10.0, 50.0)
}

fn calculate_column_widths(sheet: &SheetData) -> Vec<f64> {
    let mut widths: Vec<f64> = sheet.headers.iter().map(|h| estimate_text_width(h)).collect();
    for row in &sheet.rows {
        for (col, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(col) {
                *w = w.max(estimate_text_width(cell));
            }
        }
    }
    widths
}

/// Row height so every line of a multi-line commodity cell is visible.
fn row_height(cells: &[&str]) -> f64 {
    let lines = cells.iter().map(|c| c.lines().count()).max().unwrap_or(1).max(1);
    (lines as f64 * 15.0).min(409.0)
}

fn build_workbook(sheet: &SheetData) -> Result<Workbook, XlsxError> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(sheet.name)?;

    let header_format = Format::new()
        .set_bold()
        .set_background_color(Color::RGB(0x2563EB))
        .set_font_color(Color::RGB(0xFFFFFF));
    let text_format = Format::new().set_text_wrap().set_align(FormatAlign::Top);
    let amount_format = Format::new()
        .set_num_format("#,##0.00")
        .set_align(FormatAlign::Right)
        .set_align(FormatAlign::Top);

    for (col, &w) in calculate_column_widths(sheet).iter().enumerate() {
        worksheet.set_column_width(col as u16, w)?;
    }
    for (col, header) in sheet.headers.iter().enumerate() {
        write_text_cell_safe(worksheet, 0, col as u16, header, &header_format)?;
    }

    for (row_idx, cells) in sheet.rows.iter().enumerate() {
        let row = (row_idx + 1) as u32;
        for (col, value) in cells.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            if sheet.amount_columns.contains(&col) {
                write_number_cell_safe(worksheet, row, col as u16, value, &amount_format, &text_format)?;
            } else {
                write_text_cell_safe(worksheet, row, col as u16, value, &text_format)?;
            }
        }
        worksheet.set_row_height(row, row_height(cells))?;
    }

    worksheet.set_freeze_panes(1, 0)?;
    Ok(workbook)
}

/// Serialize the batch table to xlsx bytes: header row, then one row per input.
pub fn export_batch_to_buffer(batch: &Batch) -> Result<Vec<u8>, ExcelError> {
    let mut workbook = build_workbook(&batch_sheet(batch))?;
    Ok(workbook.save_to_buffer()?)
}

pub fn export_batch_to_file(batch: &Batch, path: &Path) -> Result<(), ExcelError> {
    let mut workbook = build_workbook(&batch_sheet(batch))?;
    workbook.save(path)?;
    tracing::info!(path = %path.display(), rows = batch.len(), "workbook written");
    Ok(())
}

pub fn export_summary_to_buffer(rows: &[SummaryRow]) -> Result<Vec<u8>, ExcelError> {
    let mut workbook = build_workbook(&summary_sheet(rows))?;
    Ok(workbook.save_to_buffer()?)
}

pub fn export_summary_to_file(rows: &[SummaryRow], path: &Path) -> Result<(), ExcelError> {
    let mut workbook = build_workbook(&summary_sheet(rows))?;
    workbook.save(path)?;
    tracing::info!(path = %path.display(), rows = rows.len(), "summary written");
    Ok(())
}

/// `invoice-extraction_<YYYYMMDD>_<HHMMSS>.xlsx`
pub fn default_file_name(now: NaiveDateTime) -> String {
    format!("{}_{}.xlsx", FILE_PREFIX, now.format("%Y%m%d_%H%M%S"))
}

/// Output path: the override (forced to `.xlsx`), or a timestamped name in
/// `out_dir` that does not collide with an existing file.
pub fn resolve_output_path(path_override: Option<&Path>, out_dir: &Path, now: NaiveDateTime) -> PathBuf {
    if let Some(p) = path_override.filter(|p| !p.as_os_str().is_empty()) {
        let mut pb = p.to_path_buf();
        if pb.extension().and_then(|e| e.to_str()) != Some("xlsx") {
            pb.set_extension("xlsx");
        }
        return pb;
    }
    let mut p = out_dir.join(default_file_name(now));
    let mut counter = 2u32;
    while p.exists() {
        p = out_dir.join(format!(
            "{}_{}_{}.xlsx",
            FILE_PREFIX,
            now.format("%Y%m%d_%H%M%S"),
            counter
        ));
        counter += 1;
    }
    p
}

/// `<stem>-summary.xlsx` next to the batch workbook.
pub fn summary_path_for(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(FILE_PREFIX);
    path.with_file_name(format!("{stem}-summary.xlsx"))
}

fn range_rows(range: &Range<Data>) -> Vec<Vec<String>> {
    range
        .rows()
        .map(|row| row.iter().map(|c| c.as_string().unwrap_or_default()).collect())
        .collect()
}

/// Rows of the first sheet of a workbook on disk, as strings.
pub fn read_workbook_rows(path: &Path) -> Result<Vec<Vec<String>>, ExcelError> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| ExcelError::Read(format!("{}: {}", path.display(), e)))?;
    let first = workbook.sheet_names().first().cloned().ok_or(ExcelError::NoSheet)?;
    let range = workbook
        .worksheet_range(&first)
        .map_err(|e| ExcelError::Read(e.to_string()))?;
    Ok(range_rows(&range))
}

/// Rows of the first sheet of an in-memory xlsx.
pub fn read_workbook_rows_from_bytes(bytes: &[u8]) -> Result<Vec<Vec<String>>, ExcelError> {
    let mut workbook: Xlsx<_> =
        Xlsx::new(Cursor::new(bytes)).map_err(|e| ExcelError::Read(e.to_string()))?;
    let first = workbook.sheet_names().first().cloned().ok_or(ExcelError::NoSheet)?;
    let range = workbook
        .worksheet_range(&first)
        .map_err(|e| ExcelError::Read(e.to_string()))?;
    Ok(range_rows(&range))
}
