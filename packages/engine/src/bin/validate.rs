//! Bulk CSV validation driver.
//!
//! Reads a quality-check schema (JSON or YAML) and a CSV of records (header
//! row = field names), validates row by row, and writes a per-record error
//! report as CSV or JSON. Exit code 0 when every record passes, 1 when any
//! record fails, 2 on a fatal error.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use indexmap::IndexMap;
use tracing_subscriber::EnvFilter;

use formqc_engine::{load_schema, QualityCheck, Record, Value};

/// FormQC - validate CSV form records against a quality-check schema.
#[derive(Parser)]
#[command(name = "formqc-validate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Rules schema file (JSON or YAML)
    #[arg(short, long)]
    rules: PathBuf,

    /// Input records CSV; the header row names the fields
    #[arg(short, long)]
    input: PathBuf,

    /// Error report destination (.csv or .json); stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Primary key field of the project
    #[arg(short = 'k', long, default_value = "primary_key")]
    primary_key: String,

    /// Skip record fields unknown to the schema instead of reporting them
    #[arg(short = 's', long)]
    disable_strict: bool,
}

struct RowReport {
    row: usize,
    sys_failure: bool,
    errors: IndexMap<String, Vec<String>>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("FATAL: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run() -> Result<bool> {
    let cli = Cli::parse();

    let schema = load_schema(&cli.rules)
        .with_context(|| format!("cannot load rules from {}", cli.rules.display()))?;
    let qc = QualityCheck::new(&cli.primary_key, schema, !cli.disable_strict, None)
        .context("schema failed validation")?;

    let mut reader = csv::Reader::from_path(&cli.input)
        .with_context(|| format!("cannot open records CSV {}", cli.input.display()))?;
    let headers = reader.headers().context("records CSV has no header row")?.clone();

    let mut failures = Vec::new();
    // header row is row 0; records count from 1
    for (i, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("cannot read CSV row {}", i + 1))?;
        let mut record = Record::new();
        for (field, value) in headers.iter().zip(row.iter()) {
            record.insert(field.to_string(), Value::from(value));
        }

        let outcome = qc.validate_record(&record);
        if !outcome.passed {
            tracing::warn!(row = i + 1, sys_failure = outcome.system_failure, "record failed validation");
            failures.push(RowReport {
                row: i + 1,
                sys_failure: outcome.system_failure,
                errors: outcome.errors,
            });
        }
    }

    tracing::info!(failed = failures.len(), "validation finished");
    write_report(&failures, cli.output.as_deref())?;
    Ok(failures.is_empty())
}

fn write_report(failures: &[RowReport], output: Option<&Path>) -> Result<()> {
    match output {
        None => {
            for report in failures {
                println!("Row {} (sys_failure={}):", report.row, report.sys_failure);
                for (field, messages) in &report.errors {
                    for message in messages {
                        println!("  {field}: {message}");
                    }
                }
            }
            Ok(())
        }
        Some(path) => match path.extension().and_then(|e| e.to_str()) {
            Some("json") => write_json_report(failures, path),
            Some("csv") | None => write_csv_report(failures, path),
            Some(other) => bail!("unsupported output suffix: .{other}"),
        },
    }
}

fn write_json_report(failures: &[RowReport], path: &Path) -> Result<()> {
    let mut by_row = serde_json::Map::new();
    for report in failures {
        by_row.insert(
            report.row.to_string(),
            serde_json::json!({
                "sys_failure": report.sys_failure,
                "errors": report.errors,
            }),
        );
    }
    let text = serde_json::to_string_pretty(&serde_json::Value::Object(by_row))?;
    std::fs::write(path, text)
        .with_context(|| format!("cannot write report to {}", path.display()))?;
    Ok(())
}

fn write_csv_report(failures: &[RowReport], path: &Path) -> Result<()> {
    let fields: BTreeSet<&str> = failures
        .iter()
        .flat_map(|r| r.errors.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("cannot write report to {}", path.display()))?;

    let mut header = vec!["row".to_string(), "sys_failure".to_string()];
    header.extend(fields.iter().map(|f| f.to_string()));
    writer.write_record(&header)?;

    for report in failures {
        let mut cells = vec![report.row.to_string(), report.sys_failure.to_string()];
        for field in &fields {
            let cell = report
                .errors
                .get(*field)
                .map(|messages| messages.join("; "))
                .unwrap_or_default();
            cells.push(cell);
        }
        writer.write_record(&cells)?;
    }
    writer.flush()?;
    Ok(())
}
