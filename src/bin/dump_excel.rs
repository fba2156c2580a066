//! Print every row of an exported workbook, tab separated. Handy for checking
//! what the extractor wrote without opening Excel.

use std::path::PathBuf;
use vat_invoice_lib::excel::read_workbook_rows;

fn main() -> anyhow::Result<()> {
    let Some(path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        anyhow::bail!("usage: dump_excel <workbook.xlsx>");
    };
    let rows = read_workbook_rows(&path)?;
    for (i, row) in rows.iter().enumerate() {
        let cells: Vec<String> = row.iter().map(|c| c.replace('\n', "\\n")).collect();
        println!("{}\t{}", i + 1, cells.join("\t"));
    }
    Ok(())
}
