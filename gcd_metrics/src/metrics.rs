//! Per-cycle and per-file GCD metrics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{MetricsConfig, OutputMode};
use crate::cycle_split::split_cycles;
use crate::report::{Code, Diagnostic};
use crate::segment::{
    decide_main_order, drop_first_cycle_reverse_segment, segment_cycle, CycleSegments, CycleView,
    MainOrder, OrderDecision, Segment, SegmentKind,
};
use crate::series::{sort_dedup_by_time, ChannelSeries, ConditionFile, CurrentKind, FileType};
use crate::window::{clip_to_window, GlobalSeries, LegSamples, WindowTrace};
use crate::{median, GcdError};

/// Which channel the charge transfer was computed from.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChargeSource {
    #[serde(rename = "I")]
    Current,
    #[serde(rename = "j")]
    CurrentDensity,
    #[serde(rename = "capacity")]
    Capacity,
}

/// Metrics of one cycle. `None` means "not computed"; `NaN` inside a
/// `Some` means the quantity was attempted but is unavailable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub cycle_k: i64,
    pub ok_window: bool,
    pub delta_t: Option<f64>,
    pub delta_t_samp: Option<f64>,
    pub delta_q_chg: Option<f64>,
    pub delta_q_dis: Option<f64>,
    pub delta_q_eff_chg: Option<f64>,
    pub delta_q_eff_dis: Option<f64>,
    pub delta_q_source: Option<ChargeSource>,
    pub delta_v_noir: f64,
    pub delta_v_eff_chg: Option<f64>,
    pub delta_v_eff_dis: Option<f64>,
    pub r_drop: Option<f64>,
    pub r_turn: Option<f64>,
    pub warnings: Vec<Diagnostic>,
}

/// Mass-normalized quantities derived from a [`CycleMetrics`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct SpecificMetrics {
    /// Coulombic efficiency, %.
    pub ce: f64,
    /// mAh/g.
    pub qsp_chg: f64,
    pub qsp_dis: f64,
    /// F/g; `None` outside Csp mode.
    pub csp: Option<f64>,
    pub csp_eff: Option<f64>,
}

impl CycleMetrics {
    fn unavailable(cycle_k: i64, delta_v_noir: f64, warnings: Vec<Diagnostic>) -> Self {
        Self {
            cycle_k,
            ok_window: false,
            delta_t: None,
            delta_t_samp: None,
            delta_q_chg: None,
            delta_q_dis: None,
            delta_q_eff_chg: None,
            delta_q_eff_dis: None,
            delta_q_source: None,
            delta_v_noir,
            delta_v_eff_chg: None,
            delta_v_eff_dis: None,
            r_drop: None,
            r_turn: None,
            warnings,
        }
    }

    /// `100 × ΔQ_dis / ΔQ_chg` on the un-rounded charges; NaN when `ΔQ_chg <= 0`.
    pub fn coulombic_efficiency(&self) -> f64 {
        match (self.delta_q_chg, self.delta_q_dis) {
            (Some(chg), Some(dis)) if chg > 0.0 => 100.0 * dis / chg,
            _ => f64::NAN,
        }
    }

    /// ΔQ of the second leg of `order` (the leg capacitance is reported on).
    pub fn second_leg_delta_q(&self, order: MainOrder) -> (Option<f64>, Option<f64>) {
        match order {
            MainOrder::ChargeDischarge => (self.delta_q_dis, self.delta_q_eff_dis),
            MainOrder::DischargeCharge => (self.delta_q_chg, self.delta_q_eff_chg),
        }
    }

    pub fn specific(&self, order: MainOrder, config: &MetricsConfig) -> SpecificMetrics {
        let m = config.m_active_g;
        let per_mass = |q: Option<f64>| q.map_or(f64::NAN, |q| q / m);
        let (csp, csp_eff) = match config.output {
            OutputMode::Csp { k_factor } => {
                let (dq, dq_eff) = self.second_leg_delta_q(order);
                let width = config.window.width();
                (
                    Some(specific_capacitance(dq, width, m, k_factor)),
                    Some(specific_capacitance(dq_eff, width, m, k_factor)),
                )
            }
            OutputMode::Qsp => (None, None),
        };
        SpecificMetrics {
            ce: self.coulombic_efficiency(),
            qsp_chg: per_mass(self.delta_q_chg),
            qsp_dis: per_mass(self.delta_q_dis),
            csp,
            csp_eff,
        }
    }
}

/// `ΔQ[mAh] × 3.6 / (ΔV × m) × K` in F/g; NaN for missing or non-positive inputs.
pub fn specific_capacitance(delta_q_mah: Option<f64>, delta_v: f64, m_active_g: f64, k_factor: f64) -> f64 {
    match delta_q_mah {
        Some(q) if m_active_g > 0.0 && delta_v > 0.0 => q * 3.6 / (delta_v * m_active_g) * k_factor,
        _ => f64::NAN,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileMetrics {
    pub file_path: String,
    pub j_label: f64,
    pub main_order: MainOrder,
    pub order_decision: Option<OrderDecision>,
    pub max_cycle: i64,
    /// Representative cycle number.
    pub n_gcd: i64,
    pub representative_cycle_ok: bool,
    pub cycles: BTreeMap<i64, CycleMetrics>,
    pub fatal_error: Option<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl FileMetrics {
    pub fn representative(&self) -> Option<&CycleMetrics> {
        self.cycles.get(&self.n_gcd)
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal_error.is_some()
    }

    /// Every diagnostic of the file in report order: file-level warnings,
    /// per-cycle warnings, then the fatal error.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let mut out = self.warnings.clone();
        for cycle in self.cycles.values() {
            out.extend(cycle.warnings.iter().cloned());
        }
        out.extend(self.fatal_error.iter().cloned());
        out
    }
}

/// Owned samples of one raw (unclipped) leg.
struct RawLeg {
    kind: SegmentKind,
    rows: Vec<usize>,
    t: Vec<f64>,
    e: Vec<f64>,
    i: Option<Vec<f64>>,
    q: Option<Vec<f64>>,
}

impl RawLeg {
    fn gather(series: &ChannelSeries, view: &CycleView, seg: &Segment) -> Self {
        let rows = view.rows[seg.start..=seg.end].to_vec();
        let pick = |values: &[f64]| rows.iter().map(|&r| values[r]).collect::<Vec<f64>>();
        let q_channel = match seg.kind {
            SegmentKind::Charge => series.q_chg.as_deref(),
            SegmentKind::Discharge => series.q_dis.as_deref(),
            SegmentKind::Platform => None,
        };
        let t = pick(&series.t);
        let e = pick(&series.e);
        let i = series.amps().map(pick);
        let q = q_channel.map(pick);
        Self {
            kind: seg.kind,
            rows,
            t,
            e,
            i,
            q,
        }
    }

    fn samples(&self) -> LegSamples<'_> {
        LegSamples {
            t: &self.t,
            e: &self.e,
            i: self.i.as_deref(),
            q: self.q.as_deref(),
            global_rows: &self.rows,
        }
    }
}

/// Sorts a clipped trace by time and drops repeated timestamps.
fn clean_trace(trace: WindowTrace) -> WindowTrace {
    let positions: Vec<usize> = (0..trace.len()).collect();
    let keep = sort_dedup_by_time(&positions, &trace.t);
    if keep == positions {
        return trace;
    }
    let pick = |values: &[f64]| keep.iter().map(|&k| values[k]).collect::<Vec<f64>>();
    WindowTrace {
        t: pick(&trace.t),
        e: pick(&trace.e),
        i: trace.i.as_deref().map(pick),
        q: trace.q.as_deref().map(pick),
        ..trace
    }
}

/// Trapezoidal `|∫I dt|` in mAh over the intervals from `first_interval` on.
fn integrate_mah(t: &[f64], i: &[f64], first_interval: usize) -> f64 {
    if t.len() < 2 {
        return f64::NAN;
    }
    let mut sum = 0.0;
    for k in first_interval..t.len() - 1 {
        let dt = t[k + 1] - t[k];
        if dt <= 0.0 {
            continue;
        }
        sum += 0.5 * (i[k] + i[k + 1]) * dt;
    }
    (sum / 3.6).abs()
}

/// ΔQ and effective ΔQ of one clipped leg from the chosen source.
fn leg_charge(trace: &WindowTrace, source: ChargeSource) -> (f64, f64) {
    let n = trace.len();
    match source {
        ChargeSource::Current | ChargeSource::CurrentDensity => {
            let i = trace.i.as_deref().unwrap_or(&[]);
            let full = integrate_mah(&trace.t, i, 0);
            let eff = if n >= 3 {
                integrate_mah(&trace.t, i, 1)
            } else {
                f64::NAN
            };
            (full, eff)
        }
        ChargeSource::Capacity => {
            let q = trace.q.as_deref().unwrap_or(&[]);
            let full = if q.len() >= 2 {
                (q[q.len() - 1] - q[0]).abs()
            } else {
                f64::NAN
            };
            let eff = if q.len() >= 3 {
                (q[q.len() - 1] - q[1]).abs()
            } else {
                f64::NAN
            };
            (full, eff)
        }
    }
}

fn effective_delta_v(trace: &WindowTrace) -> f64 {
    if trace.len() < 3 {
        f64::NAN
    } else {
        (trace.e[trace.len() - 1] - trace.e[1]).abs()
    }
}

struct CycleInputs<'a> {
    file_path: &'a str,
    series: &'a ChannelSeries,
    view: &'a CycleView,
    segments: &'a CycleSegments,
    order: MainOrder,
    config: &'a MetricsConfig,
}

fn compute_cycle_metrics(inputs: &CycleInputs<'_>) -> CycleMetrics {
    let k = inputs.segments.cycle_k;
    let config = inputs.config;
    let delta_v_noir = config.window.width();
    let mut warnings = inputs.segments.warnings.clone();

    let legs = inputs.order.legs();
    let (seg1, seg2) = match (
        inputs.segments.first_of(legs[0]),
        inputs.segments.first_of(legs[1]),
    ) {
        (Some(a), Some(b)) => (a, b),
        (a, _) => {
            let missing = if a.is_none() { legs[0] } else { legs[1] };
            warnings.push(
                Diagnostic::new(Code::W5202)
                    .with("file_path", inputs.file_path)
                    .with("cycle", k)
                    .with("reason", format!("no {} leg", missing)),
            );
            return CycleMetrics::unavailable(k, delta_v_noir, warnings);
        }
    };
    warnings.extend(seg1.warnings.iter().cloned());
    warnings.extend(seg2.warnings.iter().cloned());

    let raw1 = RawLeg::gather(inputs.series, inputs.view, seg1);
    let raw2 = RawLeg::gather(inputs.series, inputs.view, seg2);
    let global = GlobalSeries {
        t: &inputs.series.t,
        e: &inputs.series.e,
        i: inputs.series.amps(),
    };

    let mut clip = |raw: &RawLeg| match clip_to_window(&raw.samples(), config.window, raw.kind, &global) {
        Ok(trace) => Some(clean_trace(trace)),
        Err(err) => {
            warnings.push(
                Diagnostic::new(Code::W5202)
                    .with("file_path", inputs.file_path)
                    .with("cycle", k)
                    .with("leg", raw.kind)
                    .with("reason", err),
            );
            None
        }
    };
    let trace1 = clip(&raw1);
    let trace2 = clip(&raw2);
    let (w1, w2) = match (trace1, trace2) {
        (Some(a), Some(b)) => (a, b),
        _ => return CycleMetrics::unavailable(k, delta_v_noir, warnings),
    };

    let delta_t = w1.duration() + w2.duration();
    let gaps = w1
        .t
        .windows(2)
        .chain(w2.t.windows(2))
        .map(|w| w[1] - w[0])
        .filter(|dt| *dt > 0.0);
    let delta_t_samp = median(gaps);

    let has_current = w1.i.is_some() && w2.i.is_some();
    let has_capacity = w1.q.as_ref().map_or(false, |q| q.len() >= 2)
        && w2.q.as_ref().map_or(false, |q| q.len() >= 2);
    let source = match inputs.series.current.as_ref().map(|c| c.kind) {
        Some(CurrentKind::Direct) if has_current => Some(ChargeSource::Current),
        Some(CurrentKind::Density) if has_current => Some(ChargeSource::CurrentDensity),
        _ if has_capacity => Some(ChargeSource::Capacity),
        _ => None,
    };
    let source = match source {
        Some(source) => source,
        None => {
            warnings.push(
                Diagnostic::new(Code::E5102)
                    .with("file_path", inputs.file_path)
                    .with("cycle", k),
            );
            return CycleMetrics {
                ok_window: true,
                delta_t: Some(delta_t),
                delta_t_samp,
                ..CycleMetrics::unavailable(k, delta_v_noir, warnings)
            };
        }
    };
    if source == ChargeSource::Capacity {
        warnings.push(
            Diagnostic::new(Code::W5101)
                .with("file_path", inputs.file_path)
                .with("cycle", k),
        );
    }
    debug!(cycle = k, ?source, "charge source selected");

    let (dq1, dq1_eff) = leg_charge(&w1, source);
    let (dq2, dq2_eff) = leg_charge(&w2, source);
    if w1.len() < 3 || w2.len() < 3 {
        warnings.push(
            Diagnostic::new(Code::W5201)
                .with("file_path", inputs.file_path)
                .with("cycle", k),
        );
    }
    let dv1_eff = effective_delta_v(&w1);
    let dv2_eff = effective_delta_v(&w2);

    let r_drop = (raw1.e[raw1.e.len() - 1] - raw2.e[0]).abs();
    let turn_currents = match (raw1.i.as_deref(), raw2.i.as_deref()) {
        (Some(i1), Some(i2)) => i1.last().copied().zip(i2.first().copied()),
        _ => None,
    };
    let r_turn = match turn_currents {
        Some((i1, i2)) => {
            let di = (i2 - i1).abs();
            if di > 0.0 {
                r_drop / di
            } else {
                f64::NAN
            }
        }
        None => {
            warnings.push(
                Diagnostic::new(Code::W1103)
                    .with("file_path", inputs.file_path)
                    .with("cycle", k),
            );
            f64::NAN
        }
    };

    let (dq_chg, dq_dis, dq_eff_chg, dq_eff_dis, dv_eff_chg, dv_eff_dis) = match inputs.order {
        MainOrder::ChargeDischarge => (dq1, dq2, dq1_eff, dq2_eff, dv1_eff, dv2_eff),
        MainOrder::DischargeCharge => (dq2, dq1, dq2_eff, dq1_eff, dv2_eff, dv1_eff),
    };

    CycleMetrics {
        cycle_k: k,
        ok_window: true,
        delta_t: Some(delta_t),
        delta_t_samp,
        delta_q_chg: Some(dq_chg),
        delta_q_dis: Some(dq_dis),
        delta_q_eff_chg: Some(dq_eff_chg),
        delta_q_eff_dis: Some(dq_eff_dis),
        delta_q_source: Some(source),
        delta_v_noir,
        delta_v_eff_chg: Some(dv_eff_chg),
        delta_v_eff_dis: Some(dv_eff_dis),
        r_drop: Some(r_drop),
        r_turn: Some(r_turn),
        warnings,
    }
}

/// Segmented cycles of one file, in cycle order, plus the main order.
pub(crate) struct SegmentedFile {
    pub(crate) max_cycle: i64,
    pub(crate) cycles: Vec<(CycleView, CycleSegments)>,
    pub(crate) order: MainOrder,
    pub(crate) order_decision: Option<OrderDecision>,
    pub(crate) warnings: Vec<Diagnostic>,
}

/// Splits and segments every cycle of a GCD file and decides its main order.
pub(crate) fn segment_file(
    file: &ConditionFile,
    config: &MetricsConfig,
) -> Result<SegmentedFile, GcdError> {
    let series = &file.series;
    series.validate()?;
    let cycle_values = series.cycle_values();
    let partition = split_cycles(FileType::Gcd, cycle_values.as_deref(), &[], &[])?;
    let max_cycle = partition.max_cycle.unwrap_or(0);

    let mut cycles = Vec::new();
    for (&k, rows) in &partition.cycles {
        if rows.is_empty() {
            continue;
        }
        let sorted = sort_dedup_by_time(rows, &series.t);
        let view = CycleView::from_rows(series, &sorted);
        let segs = segment_cycle(k, &view, config.window, file.j_label, config.m_active_g);
        cycles.push((view, segs));
    }

    let mut warnings = partition.warnings;
    let (order, order_decision) = if max_cycle >= 2 && !cycles.is_empty() {
        let segs: Vec<CycleSegments> = cycles.iter().map(|(_, s)| s.clone()).collect();
        let decided = decide_main_order(&segs);
        warnings.extend(decided.warnings);
        (decided.order, Some(decided.decided_from))
    } else {
        (MainOrder::default(), None)
    };

    Ok(SegmentedFile {
        max_cycle,
        cycles,
        order,
        order_decision,
        warnings,
    })
}

/// Runs segmentation, clipping and integration over every cycle of one GCD
/// file and aggregates the outcome.
///
/// Structural problems (mismatched channels, no usable Cycle column) and
/// precondition violations are returned as `Err`. A window-clip failure is
/// fatal for the file only at the representative cycle `config.n_gcd`; at
/// any other cycle it becomes a `W5204` warning.
pub fn compute_file_metrics(
    file: &ConditionFile,
    config: &MetricsConfig,
) -> Result<FileMetrics, GcdError> {
    if !(config.m_active_g > 0.0) {
        return Err(GcdError::InvalidParameter("m_active must be > 0".into()));
    }
    if config.n_gcd <= 0 {
        return Err(GcdError::InvalidParameter(
            "N_GCD must be a positive integer".into(),
        ));
    }
    if let OutputMode::Csp { k_factor } = config.output {
        if !(k_factor > 0.0) {
            return Err(GcdError::InvalidParameter(
                "K must be > 0 in Csp mode".into(),
            ));
        }
    }

    let segmented = segment_file(file, config)?;
    let mut warnings = segmented.warnings;
    let mut cycles = BTreeMap::new();
    let mut fatal_error = None;

    for (view, segs) in &segmented.cycles {
        let k = segs.cycle_k;
        let segs = if k == 1 && segmented.max_cycle >= 2 {
            drop_first_cycle_reverse_segment(segs, segmented.order)
        } else {
            segs.clone()
        };
        let metrics = compute_cycle_metrics(&CycleInputs {
            file_path: &file.file_path,
            series: &file.series,
            view,
            segments: &segs,
            order: segmented.order,
            config,
        });

        if metrics.warnings.iter().any(|w| w.is(Code::E5102)) {
            fatal_error = Some(
                Diagnostic::new(Code::E5102)
                    .with("file_path", &file.file_path)
                    .with("n_gcd", config.n_gcd),
            );
        }
        if !metrics.ok_window && k != config.n_gcd {
            warnings.push(
                Diagnostic::new(Code::W5204)
                    .with("file_path", &file.file_path)
                    .with("cycle", k)
                    .with("V_start", config.window.v_start)
                    .with("V_end", config.window.v_end),
            );
        }
        cycles.insert(k, metrics);
    }

    let representative_cycle_ok = cycles.get(&config.n_gcd).map_or(false, |c| c.ok_window);
    if !representative_cycle_ok {
        fatal_error = Some(
            Diagnostic::new(Code::E5201)
                .with("file_path", &file.file_path)
                .with("cycle", config.n_gcd)
                .with("V_start", config.window.v_start)
                .with("V_end", config.window.v_end),
        );
    }
    debug!(
        file = %file.file_path,
        order = %segmented.order,
        cycles = cycles.len(),
        representative_cycle_ok,
        "file metrics computed"
    );

    Ok(FileMetrics {
        file_path: file.file_path.clone(),
        j_label: file.j_label,
        main_order: segmented.order,
        order_decision: segmented.order_decision,
        max_cycle: segmented.max_cycle,
        n_gcd: config.n_gcd,
        representative_cycle_ok,
        cycles,
        fatal_error,
        warnings,
    })
}
