//! Curve exports: GCD time/voltage, CV voltage/specific current and the
//! EIS Nyquist pair.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::VoltageWindow;
use crate::cycle_split::{select_cycle_rows, split_cycles};
use crate::report::Diagnostic;
use crate::segment::{
    decide_main_order, drop_first_cycle_reverse_segment, segment_cycle, CycleSegments, CycleView,
};
use crate::series::{sort_dedup_by_time, ConditionFile, CvFile, EisSpectrum, FileType};
use crate::table::{ColumnBlock, ColumnHeader};
use crate::GcdError;

/// An exported curve and the diagnostics raised while cutting it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CurveExport {
    pub block: ColumnBlock,
    pub warnings: Vec<Diagnostic>,
}

/// Segments one cycle with a window spanning its own voltage range.
fn segment_own_range(k: i64, view: &CycleView, j_label: f64) -> CycleSegments {
    let lo = view.e.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = view.e.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let window = VoltageWindow {
        v_start: lo,
        v_end: hi,
    };
    segment_cycle(k, view, window, j_label, 1.0)
}

/// Exports cycle `n` of a GCD file as `Time [s]` / `Voltage [V]` columns.
///
/// Only samples inside surviving segments are kept, time is zeroed at the
/// first kept sample. Cycle 1 of a multi-cycle file loses its leading
/// reverse segment.
pub fn export_cycle_curve(file: &ConditionFile, n: i64) -> Result<CurveExport, GcdError> {
    let series = &file.series;
    series.validate()?;
    let cycle_values = series.cycle_values();
    let partition = split_cycles(FileType::Gcd, cycle_values.as_deref(), &[], &[])?;
    let rows = select_cycle_rows(&partition, n)?;

    let sub_label = format!("{} A/g", file.j_label);
    let mut export = CurveExport {
        warnings: partition.warnings.clone(),
        ..CurveExport::default()
    };
    if rows.is_empty() {
        export.block.push(ColumnHeader::new("Time", "s", ""), Vec::new());
        export
            .block
            .push(ColumnHeader::new("Voltage", "V", sub_label), Vec::new());
        return Ok(export);
    }

    let sorted = sort_dedup_by_time(rows, &series.t);
    let view = CycleView::from_rows(series, &sorted);
    let mut segs = segment_own_range(n, &view, file.j_label);

    let max_cycle = partition.max_cycle.unwrap_or(0);
    if n == 1 && max_cycle >= 2 {
        let all: Vec<CycleSegments> = partition
            .cycles
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(&k, rows)| {
                let sorted = sort_dedup_by_time(rows, &series.t);
                segment_own_range(k, &CycleView::from_rows(series, &sorted), file.j_label)
            })
            .collect();
        let order = decide_main_order(&all).order;
        segs = drop_first_cycle_reverse_segment(&segs, order);
    }

    let mut local: Vec<usize> = segs
        .segments
        .iter()
        .flat_map(|s| s.start..=s.end)
        .collect();
    local.sort_unstable();
    local.dedup();
    if local.is_empty() {
        local = (0..view.len()).collect();
    }

    let t0 = view.t[local[0]];
    let time: Vec<f64> = local.iter().map(|&k| view.t[k] - t0).collect();
    let voltage: Vec<f64> = local.iter().map(|&k| view.e[k]).collect();
    debug!(file = %file.file_path, cycle = n, points = time.len(), "cycle curve exported");

    export.warnings.extend(segs.warnings);
    export.block.push(ColumnHeader::new("Time", "s", ""), time);
    export
        .block
        .push(ColumnHeader::new("Voltage", "V", sub_label), voltage);
    Ok(export)
}

/// Exports cycle `n` of a CV file as `Voltage [V]` / `Specific Current [A/g]`.
///
/// Cycles come from the file's "N CYCLE" markers; marker problems are
/// carried as warnings. Rows keep their recorded order.
pub fn export_cv_curve(file: &CvFile, n: i64, m_active_g: f64) -> Result<CurveExport, GcdError> {
    let series = &file.series;
    series.validate()?;
    if file.kept_rows.len() != series.len() {
        return Err(GcdError::ChannelLengthMismatch {
            channel: "kept_rows",
            expected: series.len(),
            found: file.kept_rows.len(),
        });
    }
    if !(m_active_g > 0.0) {
        return Err(GcdError::InvalidParameter("m_active must be > 0".into()));
    }
    let amps = series.amps().ok_or(GcdError::MissingChannel("I"))?;

    let partition = split_cycles(FileType::Cv, None, &file.kept_rows, &file.markers)?;
    let rows = select_cycle_rows(&partition, n)?;
    let voltage: Vec<f64> = rows.iter().map(|&r| series.e[r]).collect();
    let specific: Vec<f64> = rows.iter().map(|&r| amps[r] / m_active_g).collect();
    debug!(file = %file.file_path, cycle = n, points = voltage.len(), "CV curve exported");

    let mut block = ColumnBlock::new();
    block.push(ColumnHeader::new("Voltage", "V", ""), voltage);
    block.push(
        ColumnHeader::new("Specific Current", "A/g", format!("{} mV/s", file.scan_rate)),
        specific,
    );
    Ok(CurveExport {
        block,
        warnings: partition.warnings,
    })
}

/// Exports an impedance spectrum as `Z' [ohm]` / `-Z'' [ohm]`. The
/// imaginary part is always negated, whatever its recorded sign.
pub fn export_eis_curve(spectrum: &EisSpectrum) -> Result<CurveExport, GcdError> {
    if spectrum.z_im.len() != spectrum.z_re.len() {
        return Err(GcdError::ChannelLengthMismatch {
            channel: "Zim",
            expected: spectrum.z_re.len(),
            found: spectrum.z_im.len(),
        });
    }
    let positive = spectrum.z_im.iter().filter(|&&z| z > 0.0).count();
    if positive > 0 {
        debug!(file = %spectrum.file_path, positive, "EIS export negates positive Z''");
    }

    let mut block = ColumnBlock::new();
    block.push(ColumnHeader::new("Z'", "ohm", ""), spectrum.z_re.clone());
    block.push(
        ColumnHeader::new("-Z''", "ohm", spectrum.label.as_str()),
        spectrum.z_im.iter().map(|z| -z).collect(),
    );
    Ok(CurveExport {
        block,
        warnings: Vec::new(),
    })
}
