use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use gcd_metrics::{
    active_mass_g, build_rate_table, compute_file_metrics, export_cv_curve, export_cycle_curve,
    export_eis_curve, ChannelSeries, ColumnBlock, ConditionFile, Current, CurrentKind,
    CurveExport, CvFile, CycleMarkerEvent, Diagnostic, EisSpectrum, FileMetrics, GcdError,
    MetricsConfig, MetricsParams, RunReport, Severity,
};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "GCD cycle metrics CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Per-cycle metrics for one or more GCD CSV files
    Metrics(MetricsArgs),
    /// Rate capability and retention table for one battery
    Rate(RateArgs),
    /// Export one curve: a GCD or CV cycle, or an EIS spectrum
    Curve(CurveArgs),
}

#[derive(Args, Debug)]
struct ParamArgs {
    /// JSON parameter file; flags below override its fields
    #[arg(long, value_hint = ValueHint::FilePath)]
    params: Option<PathBuf>,

    /// Window lower bound (V)
    #[arg(long)]
    v_start: Option<f64>,

    /// Window upper bound (V)
    #[arg(long)]
    v_end: Option<f64>,

    /// Reported quantity
    #[arg(long, value_enum)]
    output_type: Option<OutputTypeOpt>,

    /// Cell factor K (Csp mode only)
    #[arg(long = "k-factor")]
    k_factor: Option<f64>,

    /// Representative cycle number
    #[arg(long)]
    n_gcd: Option<i64>,

    /// Positive electrode mass (mg)
    #[arg(long)]
    m_pos: Option<f64>,

    /// Negative electrode mass (mg)
    #[arg(long)]
    m_neg: Option<f64>,

    /// Active material fraction (%)
    #[arg(long)]
    p_active: Option<f64>,

    /// Geometric area (cm²) used to convert `j` columns to current
    #[arg(long)]
    area: Option<f64>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Append run-report lines to this file
    #[arg(long, value_hint = ValueHint::FilePath)]
    report: Option<PathBuf>,

    /// Stop starting new files after the first failure
    #[arg(long, action = ArgAction::SetTrue)]
    fail_fast: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct MetricsArgs {
    /// Normalized GCD CSV files
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Per-cycle CSV path (`-` for stdout)
    #[arg(short, long, default_value = "gcd_metrics.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Optional JSON dump of the full per-file metrics
    #[arg(long, value_hint = ValueHint::FilePath)]
    json: Option<PathBuf>,

    /// Current-density label (A/g) for files not named `GCD-<num>.<ext>`
    #[arg(long)]
    density: Option<f64>,

    #[command(flatten)]
    params: ParamArgs,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Parser, Debug)]
struct RateArgs {
    /// One `GCD-<num>.<ext>` file per current density
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Rate table CSV path (`-` for stdout)
    #[arg(short, long, default_value = "rate.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[command(flatten)]
    params: ParamArgs,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Parser, Debug)]
struct CurveArgs {
    /// Normalized GCD, CV or EIS CSV file
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Measurement type; inferred from a `GCD-`/`CV-`/`EIS-` file name when omitted
    #[arg(long, value_enum)]
    kind: Option<CurveKind>,

    /// Cycle to export (GCD and CV)
    #[arg(long, default_value_t = 1)]
    cycle: i64,

    /// Curve CSV path (`-` for stdout)
    #[arg(short, long, default_value = "curve.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Current-density label (A/g) for files not named `GCD-<num>.<ext>`
    #[arg(long)]
    density: Option<f64>,

    /// Geometric area (cm²) used to convert `j` columns to current
    #[arg(long, default_value_t = 1.0)]
    area: f64,

    /// Scan-rate label (mV/s) for CV files not named `CV-<num>.<ext>`
    #[arg(long)]
    scan_rate: Option<f64>,

    /// Positive electrode mass (mg), CV only
    #[arg(long, default_value_t = 0.0)]
    m_pos: f64,

    /// Negative electrode mass (mg), CV only
    #[arg(long, default_value_t = 0.0)]
    m_neg: f64,

    /// Active material fraction (%), CV only
    #[arg(long, default_value_t = 100.0)]
    p_active: f64,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum CurveKind {
    Gcd,
    Cv,
    Eis,
}

impl CurveKind {
    fn from_file_name(path: &Path) -> Option<Self> {
        [
            (CurveKind::Gcd, "GCD-"),
            (CurveKind::Cv, "CV-"),
            (CurveKind::Eis, "EIS-"),
        ]
        .into_iter()
        .find(|(_, prefix)| label_text(path, prefix).is_some())
        .map(|(kind, _)| kind)
    }
}

/// Full `--json` document of the metrics command.
#[derive(Serialize)]
struct MetricsDump<'a> {
    generated_at: String,
    params_sha256: String,
    params: &'a MetricsParams,
    files: &'a [&'a FileMetrics],
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputTypeOpt {
    Csp,
    Qsp,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Metrics(args) => args.run.verbose,
        Command::Rate(args) => args.run.verbose,
        Command::Curve(args) => args.run.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Metrics(args) => handle_metrics(args),
        Command::Rate(args) => handle_rate(args),
        Command::Curve(args) => handle_curve(args),
    }
}

fn resolve_params(args: &ParamArgs) -> Result<MetricsParams> {
    let mut params = match args.params.as_ref() {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read params {}", path.display()))?;
            serde_json::from_str::<MetricsParams>(&text)
                .with_context(|| format!("{} is not a valid params JSON", path.display()))?
        }
        None => MetricsParams::default(),
    };
    if let Some(v) = args.v_start {
        params.v_start = v;
    }
    if let Some(v) = args.v_end {
        params.v_end = v;
    }
    match args.output_type {
        Some(OutputTypeOpt::Csp) => params.output_type = "Csp".into(),
        Some(OutputTypeOpt::Qsp) => {
            params.output_type = "Qsp".into();
            if args.k_factor.is_none() {
                params.k_factor = None;
            }
        }
        None => {}
    }
    if args.k_factor.is_some() {
        params.k_factor = args.k_factor;
    }
    if let Some(n) = args.n_gcd {
        params.n_gcd = n;
    }
    if let Some(m) = args.m_pos {
        params.m_pos_mg = m;
    }
    if let Some(m) = args.m_neg {
        params.m_neg_mg = m;
    }
    if let Some(p) = args.p_active {
        params.p_active_pct = p;
    }
    if let Some(a) = args.area {
        params.area_cm2 = a;
    }
    Ok(params)
}

/// Numeric text of a `<prefix><num>.<ext>` file name, prefix matched
/// case-insensitively.
fn label_text<'a>(path: &'a Path, prefix: &str) -> Option<&'a str> {
    let name = path.file_name()?.to_str()?;
    let (stem, _ext) = name.rsplit_once('.')?;
    if !stem.get(..prefix.len())?.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let text = stem.get(prefix.len()..)?;
    let value: f64 = text.parse().ok()?;
    value.is_finite().then_some(text)
}

/// Current-density label from a `GCD-<num>.<ext>` file name.
fn parse_density_label(path: &Path) -> Option<f64> {
    label_text(path, "GCD-")?.parse().ok()
}

fn parse_cell(raw: &str, column: &str, line: usize) -> Result<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(f64::NAN);
    }
    raw.parse::<f64>()
        .with_context(|| format!("line {}: column {} is not a number: '{}'", line, column, raw))
}

/// Source line of a CSV record, falling back to its data-row position.
fn record_line(record: &csv::StringRecord, row: usize) -> usize {
    record
        .position()
        .map_or(row + 2, |pos| pos.line() as usize)
}

/// Reads a normalized CSV with canonical headers (`t`, `E`, and optionally
/// `I`, `j`, `Step`, `Cycle`, `Q_chg`, `Q_dis`). `j` is scaled to current
/// with `area_cm2` when no `I` column is present.
fn load_series<R: Read>(reader: R, area_cm2: f64) -> Result<ChannelSeries> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = rdr.headers()?.clone();
    let mut records = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("malformed CSV row {}", row + 1))?;
        records.push((record_line(&record, row), record));
    }
    let (series, _kept) = series_from_records(&headers, records, area_cm2)?;
    Ok(series)
}

/// Parses data records into channels. Rows without a finite `t` and `E`
/// are skipped; the source line of every kept row is returned alongside.
fn series_from_records<I>(
    headers: &csv::StringRecord,
    records: I,
    area_cm2: f64,
) -> Result<(ChannelSeries, Vec<usize>)>
where
    I: IntoIterator<Item = (usize, csv::StringRecord)>,
{
    let find = |name: &str| headers.iter().position(|h| h == name);
    let t_col = find("t").ok_or_else(|| anyhow!("missing required column 't'"))?;
    let e_col = find("E").ok_or_else(|| anyhow!("missing required column 'E'"))?;
    let optional = ["I", "j", "Step", "Cycle", "Q_chg", "Q_dis"].map(|name| (name, find(name)));

    let mut t = Vec::new();
    let mut e = Vec::new();
    let mut kept = Vec::new();
    let mut extra: Vec<Vec<f64>> = vec![Vec::new(); optional.len()];
    for (line, record) in records {
        let tv = parse_cell(record.get(t_col).unwrap_or(""), "t", line)?;
        let ev = parse_cell(record.get(e_col).unwrap_or(""), "E", line)?;
        if !(tv.is_finite() && ev.is_finite()) {
            continue;
        }
        t.push(tv);
        e.push(ev);
        kept.push(line);
        for (slot, (name, col)) in extra.iter_mut().zip(optional.iter()) {
            if let Some(col) = col {
                slot.push(parse_cell(record.get(*col).unwrap_or(""), name, line)?);
            }
        }
    }

    let mut columns = optional
        .iter()
        .zip(extra)
        .map(|((_, col), values)| col.map(|_| values));
    let (i, j, step, cycle, q_chg, q_dis) = (
        columns.next().flatten(),
        columns.next().flatten(),
        columns.next().flatten(),
        columns.next().flatten(),
        columns.next().flatten(),
        columns.next().flatten(),
    );

    let current = match (i, j) {
        (Some(amps), _) => Some(Current {
            kind: CurrentKind::Direct,
            amps,
        }),
        (None, Some(density)) => Some(Current {
            kind: CurrentKind::Density,
            amps: density.into_iter().map(|v| v * area_cm2).collect(),
        }),
        (None, None) => None,
    };
    let step = step.map(|s| {
        s.into_iter()
            .map(|v| if v.is_finite() { v.round() as i64 } else { 0 })
            .collect()
    });

    let series = ChannelSeries {
        t,
        e,
        current,
        step,
        cycle,
        q_chg,
        q_dis,
    };
    Ok((series, kept))
}

/// Splits a trailing `<k> CYCLE` annotation off a field, returning `k` and
/// the text before it. A non-empty prefix must end in whitespace.
fn split_cycle_marker(field: &str) -> Option<(i64, &str)> {
    let trimmed = field.trim_end();
    let cut = trimmed.len().checked_sub("CYCLE".len())?;
    if !trimmed.get(cut..)?.eq_ignore_ascii_case("CYCLE") {
        return None;
    }
    let head = trimmed.get(..cut)?.trim_end();
    let prefix = head.trim_end_matches(|c: char| c.is_ascii_digit());
    let k: i64 = head.get(prefix.len()..)?.parse().ok()?;
    if !(prefix.is_empty() || prefix.ends_with(char::is_whitespace)) {
        return None;
    }
    Some((k, prefix.trim()))
}

/// Reads a CV CSV whose rows may carry "N CYCLE" markers, either on a line
/// of their own or trailing the last field of a data row.
fn load_cv_series<R: Read>(
    reader: R,
    area_cm2: f64,
) -> Result<(ChannelSeries, Vec<usize>, Vec<CycleMarkerEvent>)> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let headers = rdr.headers()?.clone();
    let mut markers = Vec::new();
    let mut data = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("malformed CSV row {}", row + 1))?;
        let line = record_line(&record, row);
        let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
        let marker = fields.iter().rposition(|f| !f.is_empty()).and_then(|idx| {
            split_cycle_marker(&fields[idx]).map(|(k, rest)| (idx, k, rest.to_string()))
        });
        if let Some((idx, k, rest)) = marker {
            let is_standalone = idx == 0 && rest.is_empty();
            markers.push(CycleMarkerEvent {
                row_position: line,
                k,
                is_standalone,
            });
            if is_standalone {
                continue;
            }
            fields[idx] = rest;
        }
        data.push((line, csv::StringRecord::from(fields)));
    }
    let (series, kept) = series_from_records(&headers, data, area_cm2)?;
    Ok((series, kept, markers))
}

/// Reads an EIS CSV with `Zre` and `Zim` columns (ohm).
fn load_eis_spectrum<R: Read>(reader: R) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = rdr.headers()?.clone();
    let find = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| anyhow!("missing required column '{}'", name))
    };
    let (re_col, im_col) = (find("Zre")?, find("Zim")?);
    let mut z_re = Vec::new();
    let mut z_im = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("malformed CSV row {}", row + 1))?;
        let line = record_line(&record, row);
        let re = parse_cell(record.get(re_col).unwrap_or(""), "Zre", line)?;
        let im = parse_cell(record.get(im_col).unwrap_or(""), "Zim", line)?;
        if re.is_finite() && im.is_finite() {
            z_re.push(re);
            z_im.push(im);
        }
    }
    Ok((z_re, z_im))
}

fn load_condition(path: &Path, area_cm2: f64, j_label: f64) -> Result<ConditionFile> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let series = load_series(file, area_cm2)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(ConditionFile {
        file_path: path.display().to_string(),
        j_label,
        series,
    })
}

fn label_or_fallback(path: &Path, fallback: Option<f64>) -> f64 {
    if let Some(label) = parse_density_label(path) {
        return label;
    }
    let label = fallback.unwrap_or(1.0);
    warn!(
        "{} is not named GCD-<num>.<ext>; using current density {} A/g",
        path.display(),
        label
    );
    label
}

fn open_output(path: &Path) -> Result<Box<dyn Write>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(io::stdout().lock()));
    }
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    Ok(Box::new(file))
}

fn fmt_value(v: f64) -> String {
    if v.is_finite() {
        format!("{}", v)
    } else {
        String::new()
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(fmt_value).unwrap_or_default()
}

/// Outcome of one input file in a parallel batch.
enum Outcome<T> {
    Done(T),
    Failed(anyhow::Error),
    Skipped,
}

/// Runs `job` over `inputs` in parallel, checking the cancellation flag
/// between files, and returns the outcomes in input order.
fn run_batch<T, F>(inputs: &[PathBuf], fail_fast: bool, job: F) -> Vec<(PathBuf, Outcome<T>)>
where
    T: Send,
    F: Fn(&Path) -> Result<T> + Sync,
    T: BatchItem,
{
    let cancel = AtomicBool::new(false);
    let indexed: Vec<(usize, &PathBuf)> = inputs.iter().enumerate().collect();
    let mut results: Vec<(usize, PathBuf, Outcome<T>)> = indexed
        .par_iter()
        .map(|(id, path)| {
            if cancel.load(Ordering::Relaxed) {
                return (*id, (*path).clone(), Outcome::Skipped);
            }
            let outcome = match job(path) {
                Ok(value) => {
                    if fail_fast && value.is_fatal() {
                        cancel.store(true, Ordering::Relaxed);
                    }
                    Outcome::Done(value)
                }
                Err(err) => {
                    if fail_fast {
                        cancel.store(true, Ordering::Relaxed);
                    }
                    Outcome::Failed(err)
                }
            };
            (*id, (*path).clone(), outcome)
        })
        .collect();
    results.sort_by_key(|(id, _, _)| *id);
    results
        .into_iter()
        .map(|(_, path, outcome)| (path, outcome))
        .collect()
}

trait BatchItem {
    fn is_fatal(&self) -> bool;
}

impl BatchItem for FileMetrics {
    fn is_fatal(&self) -> bool {
        FileMetrics::is_fatal(self)
    }
}

/// Records a failed file: known error codes become report entries, anything
/// else a free-form report line.
fn record_failure(report: &mut RunReport, extra: &mut Vec<String>, path: &Path, err: &anyhow::Error) {
    error!("{}: {:#}", path.display(), err);
    match err.downcast_ref::<GcdError>().and_then(GcdError::code) {
        Some(code) => report.push(Diagnostic::new(code).with("file_path", path.display())),
        None => extra.push(format!("ERROR file_path={} {:#}", path.display(), err)),
    }
}

fn log_diagnostics(diagnostics: &[Diagnostic]) {
    for d in diagnostics {
        match d.severity() {
            Severity::Warning => warn!("{}", d),
            Severity::Error => error!("{}", d),
        }
    }
}

fn append_report(
    path: &Path,
    command: &str,
    params: Option<&MetricsParams>,
    report: &RunReport,
    extra: &[String],
) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open report {}", path.display()))?;
    let hash = match params {
        Some(p) => p.params_hash_sha256()?,
        None => "-".to_string(),
    };
    writeln!(
        file,
        "# gcd-metrics {} {} params_sha256={}",
        command,
        Utc::now().to_rfc3339(),
        hash
    )?;
    for line in report.lines().iter().chain(extra.iter()) {
        writeln!(file, "{}", line)?;
    }
    Ok(())
}

fn write_cycle_rows<W: Write>(
    results: &[&FileMetrics],
    config: &MetricsConfig,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "file",
        "j_A_per_g",
        "cycle",
        "ok_window",
        "main_order",
        "delta_t_s",
        "delta_t_samp_s",
        "delta_q_chg_mAh",
        "delta_q_dis_mAh",
        "delta_q_eff_chg_mAh",
        "delta_q_eff_dis_mAh",
        "delta_q_source",
        "delta_v_noir_V",
        "delta_v_eff_chg_V",
        "delta_v_eff_dis_V",
        "r_drop_V",
        "r_turn_ohm",
        "ce_pct",
        "qsp_chg_mAh_per_g",
        "qsp_dis_mAh_per_g",
        "csp_F_per_g",
        "csp_eff_F_per_g",
    ])?;
    for fm in results {
        for c in fm.cycles.values() {
            let specific = c.specific(fm.main_order, config);
            let source = match c.delta_q_source {
                Some(source) => serde_json::to_value(source)?
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                None => String::new(),
            };
            writer.write_record([
                fm.file_path.clone(),
                fmt_value(fm.j_label),
                c.cycle_k.to_string(),
                c.ok_window.to_string(),
                fm.main_order.to_string(),
                fmt_opt(c.delta_t),
                fmt_opt(c.delta_t_samp),
                fmt_opt(c.delta_q_chg),
                fmt_opt(c.delta_q_dis),
                fmt_opt(c.delta_q_eff_chg),
                fmt_opt(c.delta_q_eff_dis),
                source,
                fmt_value(c.delta_v_noir),
                fmt_opt(c.delta_v_eff_chg),
                fmt_opt(c.delta_v_eff_dis),
                fmt_opt(c.r_drop),
                fmt_opt(c.r_turn),
                fmt_value(specific.ce),
                fmt_value(specific.qsp_chg),
                fmt_value(specific.qsp_dis),
                fmt_opt(specific.csp),
                fmt_opt(specific.csp_eff),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Writes the three header rows followed by the data rows of `block`.
fn write_block<W: Write>(block: &ColumnBlock, writer: &mut csv::Writer<W>) -> Result<()> {
    for header_row in block.header_rows() {
        writer.write_record(header_row)?;
    }
    for r in 0..block.height() {
        writer.write_record(block.row(r).into_iter().map(fmt_value))?;
    }
    Ok(())
}

fn handle_metrics(args: MetricsArgs) -> Result<()> {
    let params = resolve_params(&args.params)?;
    let config = params.validate().context("invalid metrics parameters")?;
    let t_run = Instant::now();

    let outcomes = run_batch(&args.inputs, args.run.fail_fast, |path| {
        let label = label_or_fallback(path, args.density);
        let file = load_condition(path, config.area_cm2, label)?;
        let fm = compute_file_metrics(&file, &config)
            .with_context(|| format!("metrics failed for {}", path.display()))?;
        Ok(fm)
    });

    let mut report = RunReport::new();
    let mut extra = Vec::new();
    let mut done = Vec::new();
    let mut failed = 0usize;
    for (path, outcome) in &outcomes {
        match outcome {
            Outcome::Done(fm) => {
                let diagnostics = fm.diagnostics();
                log_diagnostics(&diagnostics);
                report.extend(diagnostics);
                if fm.is_fatal() {
                    failed += 1;
                }
                info!(
                    "{}: {} cycles, main order {}, representative cycle {} {}",
                    path.display(),
                    fm.cycles.len(),
                    fm.main_order,
                    fm.n_gcd,
                    if fm.representative_cycle_ok { "ok" } else { "failed" }
                );
                done.push(fm);
            }
            Outcome::Failed(err) => {
                failed += 1;
                record_failure(&mut report, &mut extra, path, err);
            }
            Outcome::Skipped => {
                warn!("{}: skipped after an earlier failure", path.display());
                extra.push(format!("SKIPPED file_path={}", path.display()));
            }
        }
    }

    let mut writer = csv::Writer::from_writer(open_output(&args.output)?);
    write_cycle_rows(&done, &config, &mut writer)?;
    if let Some(json_path) = args.json.as_ref() {
        let file = File::create(json_path)
            .with_context(|| format!("failed to create {}", json_path.display()))?;
        let dump = MetricsDump {
            generated_at: Utc::now().to_rfc3339(),
            params_sha256: params.params_hash_sha256()?,
            params: &params,
            files: &done,
        };
        serde_json::to_writer_pretty(file, &dump)?;
    }
    if let Some(report_path) = args.run.report.as_ref() {
        append_report(report_path, "metrics", Some(&params), &report, &extra)?;
    }
    info!(
        "Processed {} files in {:.1} ms",
        outcomes.len(),
        t_run.elapsed().as_secs_f64() * 1000.0
    );

    if failed > 0 {
        bail!("{} of {} files failed", failed, outcomes.len());
    }
    Ok(())
}

fn handle_rate(args: RateArgs) -> Result<()> {
    let params = resolve_params(&args.params)?;
    let config = params.validate().context("invalid metrics parameters")?;

    let labelled = args
        .inputs
        .iter()
        .map(|path| {
            parse_density_label(path)
                .map(|label| (path.clone(), label))
                .ok_or_else(|| anyhow!("{} must be named GCD-<num>.<ext>", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let outcomes = run_batch(&args.inputs, args.run.fail_fast, |path| {
        let label = labelled
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, label)| *label)
            .ok_or_else(|| anyhow!("no label for {}", path.display()))?;
        load_condition(path, config.area_cm2, label).map(Loaded)
    });

    let mut report = RunReport::new();
    let mut extra = Vec::new();
    let mut files = Vec::new();
    for (path, outcome) in outcomes {
        match outcome {
            Outcome::Done(Loaded(file)) => files.push(file),
            Outcome::Failed(err) => record_failure(&mut report, &mut extra, &path, &err),
            Outcome::Skipped => extra.push(format!("SKIPPED file_path={}", path.display())),
        }
    }

    let built = if extra.is_empty() && report.entries().is_empty() {
        build_rate_table(&files, &config).context("rate table failed")
    } else {
        Err(anyhow!("{} input files could not be loaded", args.inputs.len() - files.len()))
    };
    let table = match built {
        Ok(table) => table,
        Err(err) => {
            if let Some(report_path) = args.run.report.as_ref() {
                extra.push(format!("ERROR {:#}", err));
                append_report(report_path, "rate", Some(&params), &report, &extra)?;
            }
            return Err(err);
        }
    };

    let diagnostics = table.diagnostics();
    log_diagnostics(&diagnostics);
    report.extend(diagnostics);

    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(open_output(&args.output)?);
    write_block(&table.rate, &mut writer)?;
    writer.write_record(["Retention"])?;
    write_block(&table.retention, &mut writer)?;
    writer.flush()?;

    if let Some(report_path) = args.run.report.as_ref() {
        append_report(report_path, "rate", Some(&params), &report, &extra)?;
    }
    info!(
        "Rate table: {} conditions, {} warnings",
        table.conditions.len(),
        report.count(Severity::Warning)
    );
    Ok(())
}

/// Loaded input file; never fatal on its own.
struct Loaded(ConditionFile);

impl BatchItem for Loaded {
    fn is_fatal(&self) -> bool {
        false
    }
}

fn export_curve(args: &CurveArgs, kind: CurveKind) -> Result<CurveExport> {
    let path = args.input.as_path();
    let open = || File::open(path).with_context(|| format!("failed to open {}", path.display()));
    match kind {
        CurveKind::Gcd => {
            let label = label_or_fallback(path, args.density);
            let file = load_condition(path, args.area, label)?;
            Ok(export_cycle_curve(&file, args.cycle)?)
        }
        CurveKind::Cv => {
            let scan_rate = match label_text(path, "CV-").and_then(|t| t.parse::<f64>().ok()) {
                Some(rate) => rate,
                None => {
                    let rate = args.scan_rate.unwrap_or(1.0);
                    warn!(
                        "{} is not named CV-<num>.<ext>; using scan rate {} mV/s",
                        path.display(),
                        rate
                    );
                    rate
                }
            };
            let m_active = active_mass_g(args.m_pos, args.m_neg, args.p_active)
                .context("CV export needs --m-pos/--m-neg/--p-active")?;
            let (series, kept_rows, markers) = load_cv_series(open()?, args.area)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            let file = CvFile {
                file_path: path.display().to_string(),
                scan_rate,
                series,
                kept_rows,
                markers,
            };
            Ok(export_cv_curve(&file, args.cycle, m_active)?)
        }
        CurveKind::Eis => {
            let label = match label_text(path, "EIS-") {
                Some(num) => format!("EIS-{}", num),
                None => path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            };
            let (z_re, z_im) = load_eis_spectrum(open()?)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            let spectrum = EisSpectrum {
                file_path: path.display().to_string(),
                label,
                z_re,
                z_im,
            };
            Ok(export_eis_curve(&spectrum)?)
        }
    }
}

fn handle_curve(args: CurveArgs) -> Result<()> {
    let kind = args
        .kind
        .or_else(|| CurveKind::from_file_name(&args.input))
        .unwrap_or(CurveKind::Gcd);
    let mut report = RunReport::new();
    let mut extra = Vec::new();
    let export = match export_curve(&args, kind) {
        Ok(export) => export,
        Err(err) => {
            record_failure(&mut report, &mut extra, &args.input, &err);
            if let Some(report_path) = args.run.report.as_ref() {
                append_report(report_path, "curve", None, &report, &extra)?;
            }
            return Err(err);
        }
    };
    log_diagnostics(&export.warnings);
    report.extend(export.warnings.iter().cloned());

    let mut writer = csv::Writer::from_writer(open_output(&args.output)?);
    write_block(&export.block, &mut writer)?;
    writer.flush()?;
    if let Some(report_path) = args.run.report.as_ref() {
        append_report(report_path, "curve", None, &report, &extra)?;
    }
    info!(
        "{}: {:?} curve exported ({} points)",
        args.input.display(),
        kind,
        export.block.height()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn density_label_from_file_name() {
        assert_eq!(parse_density_label(Path::new("data/GCD-0.5.txt")), Some(0.5));
        assert_eq!(parse_density_label(Path::new("gcd-2.csv")), Some(2.0));
        assert_eq!(parse_density_label(Path::new("GCD-+1.txt")), Some(1.0));
        assert_eq!(parse_density_label(Path::new("CV-1.txt")), None);
        assert_eq!(parse_density_label(Path::new("GCD-fast.txt")), None);
        assert_eq!(parse_density_label(Path::new("GCD-1")), None);
    }

    #[test]
    fn density_column_is_scaled_by_area() {
        let csv = "t,E,j,Step,Cycle\n0,0.1,0.5,1,1\n1,0.2,0.5,1,1\n2,0.3,-0.5,2,1\n";
        let series = load_series(csv.as_bytes(), 2.0).unwrap();
        assert_eq!(series.len(), 3);
        let current = series.current.as_ref().unwrap();
        assert_eq!(current.kind, CurrentKind::Density);
        assert_eq!(current.amps, vec![1.0, 1.0, -1.0]);
        assert_eq!(series.step, Some(vec![1, 1, 2]));
        assert_eq!(series.cycle_values(), Some(vec![1, 1, 1]));
        assert!(series.q_chg.is_none());
    }

    #[test]
    fn direct_current_wins_over_density() {
        let csv = "t,E,I,j,Q_chg,Q_dis\n0,0.1,0.001,9,0,0\n1,0.2,0.001,9,0.1,0\n";
        let series = load_series(csv.as_bytes(), 1.0).unwrap();
        let current = series.current.as_ref().unwrap();
        assert_eq!(current.kind, CurrentKind::Direct);
        assert_eq!(current.amps, vec![0.001, 0.001]);
        assert_eq!(series.q_chg, Some(vec![0.0, 0.1]));
    }

    #[test]
    fn rows_without_time_or_voltage_are_skipped() {
        let csv = "t,E,Cycle\n0,0.1,1\n,0.2,1\n2,0.3,1\n";
        let series = load_series(csv.as_bytes(), 1.0).unwrap();
        assert_eq!(series.t, vec![0.0, 2.0]);
        assert_eq!(series.cycle, Some(vec![1.0, 1.0]));
    }

    #[test]
    fn missing_voltage_column_is_rejected() {
        let csv = "t,I\n0,1\n";
        assert!(load_series(csv.as_bytes(), 1.0).is_err());
        let bad = "t,E\n0,abc\n";
        assert!(load_series(bad.as_bytes(), 1.0).is_err());
    }

    #[test]
    fn curve_kind_from_file_name() {
        assert_eq!(CurveKind::from_file_name(Path::new("CV-50.txt")), Some(CurveKind::Cv));
        assert_eq!(CurveKind::from_file_name(Path::new("eis-3.csv")), Some(CurveKind::Eis));
        assert_eq!(CurveKind::from_file_name(Path::new("GCD-1.txt")), Some(CurveKind::Gcd));
        assert_eq!(CurveKind::from_file_name(Path::new("run.csv")), None);
        assert_eq!(label_text(Path::new("EIS-0.5.csv"), "EIS-"), Some("0.5"));
    }

    #[test]
    fn cycle_markers_split_off_fields() {
        assert_eq!(split_cycle_marker("3 CYCLE"), Some((3, "")));
        assert_eq!(split_cycle_marker("0.0012  2 cycle "), Some((2, "0.0012")));
        assert_eq!(split_cycle_marker("0.0012CYCLE"), None);
        assert_eq!(split_cycle_marker("0.5"), None);
        assert_eq!(split_cycle_marker("CYCLE"), None);
    }

    #[test]
    fn cv_markers_standalone_and_trailing() {
        let csv = "t,E,I\n0,0.0,0.001\n1,0.5,0.002 1 CYCLE\n1 CYCLE\n2,1.0,0.003\n3,0.5,0.002\n";
        let (series, kept, markers) = load_cv_series(csv.as_bytes(), 1.0).unwrap();
        assert_eq!(series.e, vec![0.0, 0.5, 1.0, 0.5]);
        assert_eq!(series.amps().unwrap()[1], 0.002);
        assert_eq!(kept, vec![2, 3, 5, 6]);
        assert_eq!(markers.len(), 2);
        assert_eq!((markers[0].row_position, markers[0].is_standalone), (3, false));
        assert_eq!((markers[1].row_position, markers[1].is_standalone), (4, true));

        let file = CvFile {
            file_path: "CV-20.txt".into(),
            scan_rate: 20.0,
            series,
            kept_rows: kept,
            markers,
        };
        let export = export_cv_curve(&file, 2, 0.001).unwrap();
        assert_eq!(export.block.column("Voltage").unwrap(), &[1.0, 0.5]);
        assert_eq!(export.block.headers[1].sub_label, "20 mV/s");
    }

    #[test]
    fn eis_columns_are_required() {
        let csv = "Zre,Zim\n1.0,-0.5\n,0.1\n2.0,-1.0\n";
        let (z_re, z_im) = load_eis_spectrum(csv.as_bytes()).unwrap();
        assert_eq!(z_re, vec![1.0, 2.0]);
        assert_eq!(z_im, vec![-0.5, -1.0]);
        assert!(load_eis_spectrum("Zre\n1.0\n".as_bytes()).is_err());
    }

    #[test]
    fn flags_override_params() {
        let args = ParamArgs {
            params: None,
            v_start: Some(0.2),
            v_end: None,
            output_type: Some(OutputTypeOpt::Qsp),
            k_factor: None,
            n_gcd: Some(3),
            m_pos: Some(1.0),
            m_neg: None,
            p_active: None,
            area: None,
        };
        let params = resolve_params(&args).unwrap();
        assert_eq!(params.v_start, 0.2);
        assert_eq!(params.output_type, "Qsp");
        assert!(params.k_factor.is_none());
        let config = params.validate().unwrap();
        assert_eq!(config.n_gcd, 3);
    }
}
