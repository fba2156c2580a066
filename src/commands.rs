use crate::batch::{process_batch_cached, Batch, ItemOutcome};
use crate::cache::BatchCache;
use crate::config::{
    self, AppConfig, ConfigError, ENV_API_KEY, ENV_SECRET_KEY, ENV_TIMEOUT_SECS, ENV_TOKEN_URL,
    ENV_VAT_URL,
};
use crate::excel;
use crate::ocr::{BaiduClient, TokenSource};
use crate::services::summary;
use crate::types::BatchInput;
use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use regex::Regex;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

#[derive(Debug, Parser)]
#[command(name = "vat-invoice-extract", version, about = "Extract VAT invoice data with Baidu OCR and export it to Excel")]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Recognize invoice images and write the result workbook
    Extract(ExtractArgs),
    /// Report whether API credentials are configured
    Status,
    /// Acquire an access token (credential check)
    Token(CredentialArgs),
}

/// Flags that override the BAIDU_OCR_* environment variables.
#[derive(Debug, Clone, Default, Args)]
pub struct CredentialArgs {
    #[arg(long)]
    pub api_key: Option<String>,
    #[arg(long)]
    pub secret_key: Option<String>,
    #[arg(long)]
    pub token_url: Option<String>,
    #[arg(long)]
    pub vat_url: Option<String>,
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

impl CredentialArgs {
    pub fn resolve(&self) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|name| {
            let flag = match name {
                ENV_API_KEY => self.api_key.clone(),
                ENV_SECRET_KEY => self.secret_key.clone(),
                ENV_TOKEN_URL => self.token_url.clone(),
                ENV_VAT_URL => self.vat_url.clone(),
                ENV_TIMEOUT_SECS => self.timeout_secs.map(|s| s.to_string()),
                _ => None,
            };
            flag.or_else(|| std::env::var(name).ok())
        })
    }
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// Invoice images, or directories of images
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Workbook path (default: timestamped name in --out-dir)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[arg(long, env = "VAT_INVOICE_OUT_DIR", default_value = ".")]
    pub out_dir: PathBuf,

    /// Also write the 8-column summary layout
    #[arg(long)]
    pub summary: bool,

    #[command(flatten)]
    pub credentials: CredentialArgs,
}

/// Shared state for command handlers. The CLI runs one command per process,
/// so its cache never hits there; it serves callers that drive several
/// batches through one state.
pub struct AppState {
    pub cache: BatchCache,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            cache: BatchCache::new(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

fn image_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\.(jpe?g|png|bmp)$").expect("image extension regex"))
}

/// Turn CLI paths into batch inputs. Directories contribute their image files
/// in name order; plain paths are kept as given (missing files fail per item).
pub fn expand_inputs(paths: &[PathBuf]) -> io::Result<Vec<BatchInput>> {
    let mut inputs = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| image_file_re().is_match(n))
                        .unwrap_or(false)
                })
                .collect();
            files.sort();
            if files.is_empty() {
                tracing::warn!(dir = %path.display(), "no invoice images in directory");
            }
            inputs.extend(files.into_iter().map(BatchInput::from_path));
        } else {
            inputs.push(BatchInput::from_path(path.clone()));
        }
    }
    Ok(inputs)
}

/// `s` padded with spaces to `width` terminal columns (wide chars count two).
fn pad_display(s: &str, width: usize) -> String {
    let used = excel::display_width(s) as usize;
    format!("{s}{}", " ".repeat(width.saturating_sub(used)))
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

/// Tabular preview of the batch: one line per input.
pub fn write_preview<W: Write>(out: &mut W, batch: &Batch) -> io::Result<()> {
    let name_width = batch
        .rows()
        .iter()
        .map(|r| excel::display_width(&r.file_name) as usize)
        .max()
        .unwrap_or(0)
        .max(4);
    writeln!(
        out,
        "{:>3}  {}  {:<9}  {:<12}  {:>12}  detail",
        "#",
        pad_display("file", name_width),
        "status",
        "invoice no",
        "total"
    )?;
    for (i, row) in batch.rows().iter().enumerate() {
        let (number, total, detail) = match &row.outcome {
            ItemOutcome::Extracted(record) => (
                record.invoice_number.clone(),
                record.amount_in_figures.clone(),
                format!(
                    "{} line(s), {}",
                    record.commodity_names.split('\n').count(),
                    first_line(&record.commodity_names)
                ),
            ),
            ItemOutcome::Duplicate {
                invoice_number,
                first_file,
            } => (invoice_number.clone(), String::new(), format!("same invoice as {first_file}")),
            ItemOutcome::Failed(failure) => (String::new(), String::new(), failure.to_string()),
        };
        writeln!(
            out,
            "{:>3}  {}  {:<9}  {:<12}  {:>12}  {}",
            i + 1,
            pad_display(&row.file_name, name_width),
            row.status(),
            number,
            total,
            detail
        )?;
    }
    writeln!(
        out,
        "{} file(s): {} extracted, {} duplicate, {} failed",
        batch.len(),
        batch.records().count(),
        batch.duplicate_count(),
        batch.failures().count()
    )
}

fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.as_os_str().is_empty() && !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

pub fn extract(state: &AppState, args: &ExtractArgs) -> anyhow::Result<PathBuf> {
    let config = args.credentials.resolve()?;
    let inputs = expand_inputs(&args.inputs).context("could not list input files")?;
    if inputs.is_empty() {
        bail!("no invoice images found");
    }
    let client = BaiduClient::new(config)?;
    let batch = process_batch_cached(&state.cache, &client, &client, &inputs)
        .context("could not acquire an access token")?;

    write_preview(&mut io::stdout().lock(), &batch)?;

    let now = chrono::Local::now().naive_local();
    let path = excel::resolve_output_path(args.output.as_deref(), &args.out_dir, now);
    if let Some(parent) = path.parent() {
        ensure_dir(parent).with_context(|| format!("could not create {}", parent.display()))?;
    }
    excel::export_batch_to_file(&batch, &path)
        .with_context(|| format!("could not write {}", path.display()))?;
    println!("Saved {}", path.display());

    if args.summary {
        let summary_path = excel::summary_path_for(&path);
        excel::export_summary_to_file(&summary::reshape(&batch), &summary_path)
            .with_context(|| format!("could not write {}", summary_path.display()))?;
        println!("Saved {}", summary_path.display());
    }
    Ok(path)
}

pub fn status() -> &'static str {
    config::credentials_status()
}

pub fn token(args: &CredentialArgs) -> anyhow::Result<String> {
    let client = BaiduClient::new(args.resolve()?)?;
    let token = client.access_token()?;
    Ok(token.to_string())
}

pub fn dispatch(state: &AppState, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Extract(args) => {
            extract(state, args)?;
        }
        Command::Status => println!("{}", status()),
        Command::Token(args) => println!("{}", token(args)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ItemFailure;
    use crate::types::InvoiceRecord;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn extract_args_parse() {
        let cli = Cli::try_parse_from([
            "vat-invoice-extract",
            "extract",
            "a.jpg",
            "scans",
            "--summary",
            "-o",
            "out.xlsx",
            "--api-key",
            "ak",
        ])
        .unwrap();
        match cli.command {
            Command::Extract(args) => {
                assert_eq!(args.inputs, vec![PathBuf::from("a.jpg"), PathBuf::from("scans")]);
                assert!(args.summary);
                assert_eq!(args.output, Some(PathBuf::from("out.xlsx")));
                assert_eq!(args.credentials.api_key.as_deref(), Some("ak"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn flags_override_environment() {
        let args = CredentialArgs {
            api_key: Some("flag-ak".into()),
            secret_key: Some("flag-sk".into()),
            timeout_secs: Some(7),
            ..Default::default()
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.api_key, "flag-ak");
        assert_eq!(config.secret_key, "flag-sk");
        assert_eq!(config.timeout, std::time::Duration::from_secs(7));
    }

    #[test]
    fn directories_expand_to_sorted_images() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.PNG", "a.jpg", "notes.txt", "c.jpeg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let inputs = expand_inputs(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<_> = inputs.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["a.jpg", "b.PNG", "c.jpeg"]);
    }

    #[test]
    fn missing_file_is_kept_for_per_item_failure() {
        let inputs = expand_inputs(&[PathBuf::from("/nonexistent/x.jpg")]).unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].name, "x.jpg");
    }

    #[test]
    fn preview_lists_every_row() {
        let mut batch = Batch::new();
        batch.push_record(
            "a.jpg",
            InvoiceRecord {
                invoice_number: "12345".into(),
                commodity_names: "笔\n纸".into(),
                amount_in_figures: "339.00".into(),
                ..Default::default()
            },
        );
        batch.push_record(
            "b.jpg",
            InvoiceRecord {
                invoice_number: "12345".into(),
                ..Default::default()
            },
        );
        batch.push_failure("c.jpg", ItemFailure::Unreadable("denied".into()));

        let mut out = Vec::new();
        write_preview(&mut out, &batch).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[1].contains("a.jpg") && lines[1].contains("2 line(s)"));
        assert!(lines[2].contains("duplicate") && lines[2].contains("same invoice as a.jpg"));
        assert!(lines[3].contains("failed") && lines[3].contains("denied"));
        assert_eq!(lines[4], "3 file(s): 1 extracted, 1 duplicate, 1 failed");
    }

    #[test]
    fn preview_aligns_wide_file_names() {
        let mut batch = Batch::new();
        batch.push_failure("发票一.jpg", ItemFailure::Unreadable("x".into()));
        batch.push_failure("b.jpg", ItemFailure::Unreadable("x".into()));

        let mut out = Vec::new();
        write_preview(&mut out, &batch).unwrap();
        let text = String::from_utf8(out).unwrap();
        let status_column = |line: &str| {
            let at = line.find("failed").unwrap();
            excel::display_width(&line[..at]) as usize
        };
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(status_column(lines[1]), status_column(lines[2]));
        assert_eq!(pad_display("发票", 6), "发票  ");
    }
}
