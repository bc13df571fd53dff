//! Rate-capability table and capacity retention across the current
//! densities of one battery.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{MetricsConfig, OutputMode};
use crate::metrics::{compute_file_metrics, FileMetrics};
use crate::report::{Code, Diagnostic};
use crate::series::ConditionFile;
use crate::table::{ColumnBlock, ColumnHeader};
use crate::GcdError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateTable {
    /// One row per condition, ascending current density.
    pub rate: ColumnBlock,
    /// Single row: `100 × last / first` per metric column.
    pub retention: ColumnBlock,
    /// Per-condition metrics in the same order as the rate rows.
    pub conditions: Vec<FileMetrics>,
    pub warnings: Vec<Diagnostic>,
}

impl RateTable {
    /// Every diagnostic raised while building the table, conditions first.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let mut out: Vec<Diagnostic> = self
            .conditions
            .iter()
            .flat_map(FileMetrics::diagnostics)
            .collect();
        out.extend(self.warnings.iter().cloned());
        out
    }
}

fn metric_headers(output: OutputMode) -> Vec<ColumnHeader> {
    match output {
        OutputMode::Csp { .. } => vec![
            ColumnHeader::new("Specific capacitance", "F/g", "no IR"),
            ColumnHeader::new("Specific capacitance", "F/g", "effective"),
            ColumnHeader::new("R↓", "V", ""),
            ColumnHeader::new("R_turn", "ohm", ""),
        ],
        OutputMode::Qsp => vec![ColumnHeader::new("Specific capacity", "mAh/g", "")],
    }
}

/// Representative-cycle values of one condition, in `metric_headers` order.
fn metric_row(fm: &FileMetrics, config: &MetricsConfig) -> Vec<f64> {
    let width = metric_headers(config.output).len();
    let rep = match fm.representative() {
        Some(rep) if rep.ok_window => rep,
        _ => return vec![f64::NAN; width],
    };
    let specific = rep.specific(fm.main_order, config);
    match config.output {
        OutputMode::Csp { .. } => vec![
            specific.csp.unwrap_or(f64::NAN),
            specific.csp_eff.unwrap_or(f64::NAN),
            rep.r_drop.unwrap_or(f64::NAN),
            rep.r_turn.unwrap_or(f64::NAN),
        ],
        OutputMode::Qsp => vec![specific.qsp_dis],
    }
}

/// `100 × last / first` of one metric column. A baseline that is not
/// strictly positive (zero, negative, NaN) is returned as the error.
fn retention_pct(column: &[f64]) -> Result<f64, f64> {
    match (column.first(), column.last()) {
        (Some(&first), Some(&last)) if first > 0.0 => Ok(100.0 * last / first),
        (Some(&first), Some(_)) => Err(first),
        _ => Ok(f64::NAN),
    }
}

/// Runs the metrics of every condition file at `config.n_gcd` and assembles
/// the rate and retention blocks.
///
/// A bad retention baseline yields NaN and a `W1304` warning for that
/// column only. Structural errors in any file abort the table.
pub fn build_rate_table(
    files: &[ConditionFile],
    config: &MetricsConfig,
) -> Result<RateTable, GcdError> {
    let mut ordered: Vec<&ConditionFile> = files.iter().collect();
    ordered.sort_by_key(|f| OrderedFloat(f.j_label));

    let conditions = ordered
        .iter()
        .map(|f| compute_file_metrics(f, config))
        .collect::<Result<Vec<_>, _>>()?;

    let headers = metric_headers(config.output);
    let mut metric_columns: Vec<Vec<f64>> = vec![Vec::with_capacity(conditions.len()); headers.len()];
    for fm in &conditions {
        for (col, value) in metric_columns.iter_mut().zip(metric_row(fm, config)) {
            col.push(value);
        }
    }
    let densities: Vec<f64> = conditions.iter().map(|fm| fm.j_label).collect();

    let density_header = ColumnHeader::new("Current density", "A/g", "");
    let mut rate = ColumnBlock::new();
    rate.push(density_header.clone(), densities.clone());
    let mut retention = ColumnBlock::new();
    retention.push(density_header, densities.last().copied().into_iter().collect());

    let mut warnings = Vec::new();
    for (header, col) in headers.into_iter().zip(metric_columns) {
        let value = retention_pct(&col).unwrap_or_else(|baseline| {
            warnings.push(
                Diagnostic::new(Code::W1304)
                    .with("column", &header.name)
                    .with("sub_label", &header.sub_label)
                    .with("baseline", baseline),
            );
            f64::NAN
        });
        retention.push(
            ColumnHeader {
                unit: "%".to_string(),
                ..header.clone()
            },
            vec![value],
        );
        rate.push(header, col);
    }

    debug!(
        conditions = conditions.len(),
        warnings = warnings.len(),
        "rate table assembled"
    );

    Ok(RateTable {
        rate,
        retention,
        conditions,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VoltageWindow;
    use crate::series::{ChannelSeries, Current, CurrentKind};

    /// One charge/discharge cycle, 0→1 V and back, at `amps`.
    fn condition(j_label: f64, amps: f64) -> ConditionFile {
        let mut s = ChannelSeries::default();
        let mut current = Vec::new();
        let mut step = Vec::new();
        for k in 0..11 {
            s.t.push(k as f64);
            s.e.push(k as f64 / 10.0);
            current.push(amps);
            step.push(1);
        }
        for k in 0..11 {
            s.t.push(11.0 + k as f64);
            s.e.push(1.0 - k as f64 / 10.0);
            current.push(-amps);
            step.push(2);
        }
        s.cycle = Some(vec![1.0; s.t.len()]);
        s.step = Some(step);
        s.current = Some(Current {
            kind: CurrentKind::Direct,
            amps: current,
        });
        ConditionFile {
            file_path: format!("GCD-{}.txt", j_label),
            j_label,
            series: s,
        }
    }

    fn config(output: OutputMode) -> MetricsConfig {
        MetricsConfig {
            window: VoltageWindow {
                v_start: 0.1,
                v_end: 0.9,
            },
            output,
            n_gcd: 1,
            m_active_g: 0.001,
            area_cm2: 1.0,
        }
    }

    #[test]
    fn rows_are_sorted_by_current_density() {
        let files = vec![condition(2.0, 2e-3), condition(0.5, 1e-3), condition(1.0, 1.5e-3)];
        let table = build_rate_table(&files, &config(OutputMode::Qsp)).unwrap();
        assert_eq!(table.rate.columns[0], vec![0.5, 1.0, 2.0]);
        assert_eq!(table.rate.headers[1].unit, "mAh/g");
        let qsp = &table.rate.columns[1];
        assert!((qsp[0] - 1e-3 * 8.0 / 3.6 / 0.001).abs() < 1e-9);
        assert!((qsp[2] - 2e-3 * 8.0 / 3.6 / 0.001).abs() < 1e-9);
        let retention = table.retention.column("Specific capacity").unwrap();
        assert_eq!(retention.len(), 1);
        assert!((retention[0] - 200.0).abs() < 1e-9);
        assert_eq!(table.retention.headers[1].unit, "%");
        assert!(table.warnings.is_empty());
    }

    #[test]
    fn csp_layout_has_ir_columns() {
        let files = vec![condition(1.0, 1e-3)];
        let table = build_rate_table(&files, &config(OutputMode::Csp { k_factor: 4.0 })).unwrap();
        assert_eq!(table.rate.width(), 5);
        let csp = table.rate.columns[1][0];
        let expected = (1e-3 * 8.0 / 3.6) * 3.6 / (0.8 * 0.001) * 4.0;
        assert!((csp - expected).abs() < 1e-9);
        assert_eq!(table.rate.headers[2].sub_label, "effective");
        let retention = &table.retention.columns[1];
        assert!((retention[0] - 100.0).abs() < 1e-12);
    }

    #[test]
    fn dead_baseline_marks_retention_unavailable() {
        // zero current at the slowest rate leaves no legs to integrate
        let files = vec![condition(0.5, 0.0), condition(1.0, 1e-3)];
        let table = build_rate_table(&files, &config(OutputMode::Qsp)).unwrap();
        let retention = table.retention.column("Specific capacity").unwrap();
        assert!(retention[0].is_nan());
        assert!(table.warnings.iter().any(|w| w.is(Code::W1304)));
        assert!(table.diagnostics().iter().any(|w| w.is(Code::W1304)));
    }

    #[test]
    fn zero_baseline_marks_retention_unavailable() {
        // charge ends and discharge starts at the same voltage: R↓ = 0
        let files = vec![condition(0.5, 1e-3), condition(1.0, 2e-3)];
        let table = build_rate_table(&files, &config(OutputMode::Csp { k_factor: 1.0 })).unwrap();
        assert_eq!(table.rate.column("R↓").unwrap(), &[0.0, 0.0]);
        let retention = table.retention.column("R↓").unwrap();
        assert!(retention[0].is_nan());
        let w1304: Vec<&Diagnostic> = table.warnings.iter().filter(|w| w.is(Code::W1304)).collect();
        assert!(w1304.iter().any(|w| w.to_string().contains("column=R↓")));
        // the capacitance column has a positive baseline and stays finite
        assert!(table.retention.columns[1][0].is_finite());
    }

    #[test]
    fn non_positive_baselines_are_rejected() {
        assert_eq!(retention_pct(&[0.0, 1.0]), Err(0.0));
        assert_eq!(retention_pct(&[-2.0, 1.0]), Err(-2.0));
        assert!(retention_pct(&[f64::NAN, 1.0]).unwrap_err().is_nan());
        assert_eq!(retention_pct(&[2.0, 1.0]), Ok(50.0));
        assert!(retention_pct(&[]).unwrap().is_nan());
    }

    #[test]
    fn failed_representative_contributes_nan() {
        let files = vec![condition(1.0, 1e-3), condition(2.0, 2e-3)];
        let mut cfg = config(OutputMode::Qsp);
        cfg.n_gcd = 2;
        let table = build_rate_table(&files, &cfg).unwrap();
        assert!(table.rate.columns[1].iter().all(|v| v.is_nan()));
        assert!(table.conditions.iter().all(FileMetrics::is_fatal));
        assert!(table.warnings.iter().any(|w| w.is(Code::W1304)));
    }
}
