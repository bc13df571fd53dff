//! Charge/discharge segmentation of one cycle and the battery-wide cycling order.

use std::fmt;

use ndarray::{s, Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::VoltageWindow;
use crate::report::{Code, Diagnostic};
use crate::series::ChannelSeries;
use crate::{median, sign};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Charge,
    Discharge,
    Platform,
}

impl SegmentKind {
    pub fn opposite(&self) -> SegmentKind {
        match self {
            SegmentKind::Charge => SegmentKind::Discharge,
            SegmentKind::Discharge => SegmentKind::Charge,
            SegmentKind::Platform => SegmentKind::Platform,
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SegmentKind::Charge => "charge",
            SegmentKind::Discharge => "discharge",
            SegmentKind::Platform => "platform",
        })
    }
}

/// A contiguous run of samples inside one cycle. `start`/`end` are inclusive
/// positions in the cycle view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
    pub t_start: f64,
    pub t_end: f64,
    pub i_med: f64,
    pub e_start: f64,
    pub e_end: f64,
    pub delta_e: f64,
    pub kind: SegmentKind,
    pub warnings: Vec<Diagnostic>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleSegments {
    pub cycle_k: i64,
    pub segments: Vec<Segment>,
    pub dropped_rest_count: usize,
    pub warnings: Vec<Diagnostic>,
}

impl CycleSegments {
    pub fn first_of(&self, kind: SegmentKind) -> Option<&Segment> {
        self.segments.iter().find(|s| s.kind == kind)
    }

    fn first_leg_kind(&self) -> Option<SegmentKind> {
        self.segments
            .iter()
            .map(|s| s.kind)
            .find(|k| *k != SegmentKind::Platform)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MainOrder {
    #[serde(rename = "Charge→Discharge")]
    ChargeDischarge,
    #[serde(rename = "Discharge→Charge")]
    DischargeCharge,
}

impl MainOrder {
    pub fn first_kind(&self) -> SegmentKind {
        match self {
            MainOrder::ChargeDischarge => SegmentKind::Charge,
            MainOrder::DischargeCharge => SegmentKind::Discharge,
        }
    }

    pub fn second_kind(&self) -> SegmentKind {
        self.first_kind().opposite()
    }

    pub fn legs(&self) -> [SegmentKind; 2] {
        [self.first_kind(), self.second_kind()]
    }
}

impl Default for MainOrder {
    fn default() -> Self {
        MainOrder::ChargeDischarge
    }
}

impl fmt::Display for MainOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MainOrder::ChargeDischarge => "Charge→Discharge",
            MainOrder::DischargeCharge => "Discharge→Charge",
        })
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderDecision {
    #[serde(rename = "vote")]
    Vote,
    #[serde(rename = "cycle2_fallback")]
    Cycle2Fallback,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatteryMainOrder {
    pub order: MainOrder,
    pub decided_from: OrderDecision,
    pub warnings: Vec<Diagnostic>,
}

/// Time-sorted samples of one cycle plus the global row of each sample.
#[derive(Clone, Debug)]
pub struct CycleView {
    pub rows: Vec<usize>,
    pub t: Array1<f64>,
    pub e: Array1<f64>,
    /// Measured current, or a pseudo-current when the file has none.
    pub i: Array1<f64>,
    pub step: Option<Vec<i64>>,
}

impl CycleView {
    pub fn new(t: Vec<f64>, e: Vec<f64>, i: Vec<f64>, step: Option<Vec<i64>>) -> Self {
        let rows = (0..t.len()).collect();
        Self {
            rows,
            t: Array1::from_vec(t),
            e: Array1::from_vec(e),
            i: Array1::from_vec(i),
            step,
        }
    }

    /// Gathers `rows` (already sorted and de-duplicated by time) from `series`.
    pub fn from_rows(series: &ChannelSeries, rows: &[usize]) -> Self {
        let t: Array1<f64> = rows.iter().map(|&r| series.t[r]).collect();
        let e: Array1<f64> = rows.iter().map(|&r| series.e[r]).collect();
        let step: Option<Vec<i64>> = series
            .step
            .as_ref()
            .map(|step| rows.iter().map(|&r| step[r]).collect());
        let i: Array1<f64> = match series.amps() {
            Some(amps) => rows.iter().map(|&r| amps[r]).collect(),
            None => pseudo_current(e.view(), step.as_deref()),
        };
        Self {
            rows: rows.to_vec(),
            t,
            e,
            i,
            step,
        }
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }
}

/// Stand-in current for files without a current channel: each Step run
/// gets `+1` when its voltage rises (or stays flat) and `-1` otherwise.
fn pseudo_current(e: ArrayView1<f64>, step: Option<&[i64]>) -> Array1<f64> {
    let n = e.len();
    let step = match step {
        Some(step) if n > 0 => step,
        _ => return Array1::from_elem(n, 1.0),
    };
    let mut out = Array1::zeros(n);
    let mut s = 0;
    for i in 1..=n {
        if i == n || step[i] != step[i - 1] {
            let value = if e[i - 1] - e[s] >= 0.0 { 1.0 } else { -1.0 };
            out.slice_mut(s![s..i]).fill(value);
            s = i;
        }
    }
    out
}

fn step_candidates(step: &[i64]) -> Vec<(usize, usize)> {
    if step.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut s = 0;
    for i in 1..step.len() {
        if step[i] != step[i - 1] {
            out.push((s, i - 1));
            s = i;
        }
    }
    out.push((s, step.len() - 1));
    out
}

/// Candidate legs from the current sign; also returns how many rest runs
/// were dropped outright (not absorbed into a merged leg).
fn current_candidates(t: ArrayView1<f64>, i: ArrayView1<f64>, eps_i: f64) -> (Vec<(usize, usize)>, usize) {
    let n = i.len();
    if n == 0 {
        return (Vec::new(), 0);
    }
    let tags: Vec<i8> = i.iter().map(|&v| sign(v, eps_i)).collect();
    let mut runs: Vec<(usize, usize, i8)> = Vec::new();
    let mut s = 0;
    for k in 1..n {
        if tags[k] != tags[k - 1] {
            runs.push((s, k - 1, tags[k - 1]));
            s = k;
        }
    }
    runs.push((s, n - 1, tags[n - 1]));

    let mut valid: Vec<(usize, usize, i8)> = Vec::new();
    let mut rest: Vec<(usize, usize)> = Vec::new();
    for (a, b, tag) in runs {
        let run = i.slice(s![a..=b]);
        let abs_med = median(run.iter().map(|v| v.abs())).unwrap_or(0.0);
        if abs_med > eps_i && tag != 0 {
            let med = median(run.iter().copied()).unwrap_or(0.0);
            valid.push((a, b, sign(med, 0.0)));
        } else {
            rest.push((a, b));
        }
    }

    let dt = if n >= 2 {
        median((0..n - 1).map(|k| (t[k + 1] - t[k]).max(0.0))).unwrap_or(0.0)
    } else {
        0.0
    };

    let mut merged: Vec<(usize, usize)> = Vec::new();
    let mut k = 0;
    while k < valid.len() {
        let (a, mut b, sg) = valid[k];
        let mut j = k + 1;
        while j < valid.len() {
            let (na, nb, nsg) = valid[j];
            if nsg != sg {
                break;
            }
            let gap = (t[na] - t[b]).max(0.0);
            if gap > 3.0 * dt {
                break;
            }
            b = nb;
            j += 1;
        }
        merged.push((a, b));
        k = j;
    }

    let dropped = rest
        .iter()
        .filter(|(ra, rb)| !merged.iter().any(|(a, b)| a <= ra && rb <= b))
        .count();
    (merged, dropped)
}

/// Builds and classifies one candidate run; `None` marks a rest run.
fn make_segment(view: &CycleView, a: usize, b: usize, eps_i: f64, eps_v: f64) -> Option<Segment> {
    let i_seg = view.i.slice(s![a..=b]);
    let e_seg = view.e.slice(s![a..=b]);
    let abs_med = median(i_seg.iter().map(|v| v.abs())).unwrap_or(0.0);
    if abs_med <= eps_i {
        return None;
    }

    let i_med = median(i_seg.iter().copied()).unwrap_or(0.0);
    let delta = e_seg[e_seg.len() - 1] - e_seg[0];
    let drift = if delta.abs() >= eps_v {
        sign(delta, 0.0)
    } else if e_seg.len() >= 2 {
        let diffs = (0..e_seg.len() - 1).map(|k| e_seg[k + 1] - e_seg[k]);
        sign(median(diffs).unwrap_or(0.0), 0.0)
    } else {
        0
    };
    let kind = match drift {
        1 => SegmentKind::Charge,
        -1 => SegmentKind::Discharge,
        _ => SegmentKind::Platform,
    };

    let mut warnings = Vec::new();
    let s_i = sign(i_med, 0.0);
    if s_i != 0 {
        let oppose = i_seg.iter().filter(|&&v| sign(v, eps_i) == -s_i).count();
        if oppose as f64 / i_seg.len() as f64 > 0.05 {
            warnings.push(Diagnostic::new(Code::W5001).with("start", a).with("end", b));
        }
    }
    if e_seg.len() >= 3 {
        let steps: Vec<i8> = (0..e_seg.len() - 1)
            .map(|k| sign(e_seg[k + 1] - e_seg[k], 1e-12))
            .filter(|&d| d != 0)
            .collect();
        let flips = steps.windows(2).filter(|w| w[0] != w[1]).count();
        let denom = steps.len().saturating_sub(1).max(1);
        if !steps.is_empty() && flips as f64 / denom as f64 > 0.3 {
            warnings.push(Diagnostic::new(Code::W5002).with("start", a).with("end", b));
        }
    }

    Some(Segment {
        start: a,
        end: b,
        t_start: view.t[a],
        t_end: view.t[b],
        i_med,
        e_start: e_seg[0],
        e_end: e_seg[e_seg.len() - 1],
        delta_e: delta,
        kind,
        warnings,
    })
}

/// Assigns each platform segment the kind of its nearest classified neighbour
/// (previous first, then next). Works on a snapshot of the first-pass kinds.
fn resolve_platforms(classified: &[Segment]) -> Option<Vec<SegmentKind>> {
    let kinds: Vec<SegmentKind> = classified.iter().map(|s| s.kind).collect();
    if !kinds.is_empty() && kinds.iter().all(|k| *k == SegmentKind::Platform) {
        return None;
    }
    let resolved = (0..kinds.len())
        .map(|idx| {
            if kinds[idx] != SegmentKind::Platform {
                return kinds[idx];
            }
            let prev = kinds[..idx]
                .iter()
                .rev()
                .find(|k| **k != SegmentKind::Platform);
            let next = kinds[idx + 1..]
                .iter()
                .find(|k| **k != SegmentKind::Platform);
            prev.or(next).copied().unwrap_or(SegmentKind::Platform)
        })
        .collect();
    Some(resolved)
}

/// Maps current sign to leg kind by a drift vote over all segments.
fn vote_sign_mapping(classified: &[Segment], warnings: &mut Vec<Diagnostic>) -> Vec<SegmentKind> {
    warnings.push(Diagnostic::new(Code::W5003));
    let mut score_pos = 0usize;
    let mut score_neg = 0usize;
    for seg in classified {
        let along = (seg.i_med > 0.0 && seg.delta_e > 0.0) || (seg.i_med < 0.0 && seg.delta_e < 0.0);
        let against = (seg.i_med > 0.0 && seg.delta_e < 0.0) || (seg.i_med < 0.0 && seg.delta_e > 0.0);
        score_pos += along as usize;
        score_neg += against as usize;
    }
    let positive_charges = if score_pos == score_neg {
        warnings.push(Diagnostic::new(Code::W5004));
        true
    } else {
        score_pos > score_neg
    };
    classified
        .iter()
        .map(|seg| {
            if seg.i_med > 0.0 {
                if positive_charges {
                    SegmentKind::Charge
                } else {
                    SegmentKind::Discharge
                }
            } else if seg.i_med < 0.0 {
                if positive_charges {
                    SegmentKind::Discharge
                } else {
                    SegmentKind::Charge
                }
            } else {
                seg.kind
            }
        })
        .collect()
}

/// Segments one cycle into classified legs.
///
/// `window` only sizes the voltage threshold; `j_label` (A/g) and
/// `m_active_g` size the current threshold below which a run counts as rest.
pub fn segment_cycle(
    cycle_k: i64,
    view: &CycleView,
    window: VoltageWindow,
    j_label: f64,
    m_active_g: f64,
) -> CycleSegments {
    let mut out = CycleSegments {
        cycle_k,
        segments: Vec::new(),
        dropped_rest_count: 0,
        warnings: Vec::new(),
    };
    if view.is_empty() {
        return out;
    }

    let eps_i = (1e-3 * (j_label * m_active_g).abs()).max(1e-9);
    let eps_v = (1e-3 * window.width()).max(1e-3);

    let candidates = match view.step.as_deref() {
        Some(step) => step_candidates(step),
        None => {
            let (candidates, dropped) = current_candidates(view.t.view(), view.i.view(), eps_i);
            out.dropped_rest_count += dropped;
            candidates
        }
    };

    let mut classified = Vec::with_capacity(candidates.len());
    for (a, b) in candidates {
        match make_segment(view, a, b, eps_i, eps_v) {
            Some(seg) => classified.push(seg),
            None => out.dropped_rest_count += 1,
        }
    }

    let kinds = match resolve_platforms(&classified) {
        Some(kinds) => kinds,
        None => vote_sign_mapping(&classified, &mut out.warnings),
    };
    out.segments = classified
        .into_iter()
        .zip(kinds)
        .map(|(seg, kind)| Segment { kind, ..seg })
        .collect();

    debug!(
        cycle = cycle_k,
        segments = out.segments.len(),
        dropped_rest = out.dropped_rest_count,
        "segmented cycle"
    );
    out
}

/// Majority vote over the first leg of every cycle numbered 2 or higher.
pub fn decide_main_order(cycles: &[CycleSegments]) -> BatteryMainOrder {
    let firsts: Vec<SegmentKind> = cycles
        .iter()
        .filter(|c| c.cycle_k >= 2)
        .filter_map(CycleSegments::first_leg_kind)
        .collect();
    let charge = firsts.iter().filter(|k| **k == SegmentKind::Charge).count();
    let discharge = firsts.len() - charge;

    let decided = if charge > discharge {
        Some(MainOrder::ChargeDischarge)
    } else if discharge > charge {
        Some(MainOrder::DischargeCharge)
    } else {
        None
    };
    if let Some(order) = decided {
        debug!(%order, charge, discharge, "main order by vote");
        return BatteryMainOrder {
            order,
            decided_from: OrderDecision::Vote,
            warnings: Vec::new(),
        };
    }

    let cycle2 = cycles
        .iter()
        .find(|c| c.cycle_k == 2)
        .and_then(CycleSegments::first_leg_kind);
    let order = match cycle2 {
        Some(SegmentKind::Discharge) => MainOrder::DischargeCharge,
        _ => MainOrder::ChargeDischarge,
    };
    debug!(%order, "main order from cycle 2 fallback");
    BatteryMainOrder {
        order,
        decided_from: OrderDecision::Cycle2Fallback,
        warnings: vec![Diagnostic::new(Code::W5005)],
    }
}

/// Drops cycle 1's leading leg when it runs against the main order and ends
/// within the first 30% of the cycle (an initial partial or settling leg).
pub fn drop_first_cycle_reverse_segment(cycle1: &CycleSegments, order: MainOrder) -> CycleSegments {
    let first = match cycle1.segments.first() {
        Some(first) if cycle1.cycle_k == 1 => first,
        _ => return cycle1.clone(),
    };
    let t0 = cycle1
        .segments
        .iter()
        .map(|s| s.t_start)
        .fold(f64::INFINITY, f64::min);
    let t_last = cycle1
        .segments
        .iter()
        .map(|s| s.t_end)
        .fold(f64::NEG_INFINITY, f64::max);
    let early = first.t_end <= t0 + 0.3 * (t_last - t0);
    if first.kind != order.first_kind() && first.start == 0 && early {
        let mut warnings = cycle1.warnings.clone();
        warnings.push(Diagnostic::new(Code::W5006).with("cycle", 1));
        return CycleSegments {
            cycle_k: cycle1.cycle_k,
            segments: cycle1.segments[1..].to_vec(),
            dropped_rest_count: cycle1.dropped_rest_count,
            warnings,
        };
    }
    cycle1.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: VoltageWindow = VoltageWindow {
        v_start: 0.0,
        v_end: 1.0,
    };

    fn linspace(a: f64, b: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|k| a + (b - a) * k as f64 / (n - 1) as f64)
            .collect()
    }

    /// Charge ramp 0→1 V at +1 mA, rest, discharge ramp 1→0 V at -1 mA.
    fn charge_rest_discharge(step: bool) -> CycleView {
        let mut t = Vec::new();
        let mut e = Vec::new();
        let mut i = Vec::new();
        let mut st = Vec::new();
        for (k, v) in linspace(0.0, 1.0, 11).into_iter().enumerate() {
            t.push(k as f64);
            e.push(v);
            i.push(1e-3);
            st.push(1);
        }
        for k in 0..5 {
            t.push(11.0 + k as f64);
            e.push(1.0);
            i.push(0.0);
            st.push(2);
        }
        for (k, v) in linspace(1.0, 0.0, 11).into_iter().enumerate() {
            t.push(16.0 + k as f64);
            e.push(v);
            i.push(-1e-3);
            st.push(3);
        }
        CycleView::new(t, e, i, if step { Some(st) } else { None })
    }

    #[test]
    fn step_boundaries_define_segments() {
        let view = charge_rest_discharge(true);
        let segs = segment_cycle(1, &view, WINDOW, 1.0, 0.001);
        assert_eq!(segs.dropped_rest_count, 1);
        assert_eq!(segs.segments.len(), 2);
        assert_eq!((segs.segments[0].start, segs.segments[0].end), (0, 10));
        assert_eq!((segs.segments[1].start, segs.segments[1].end), (16, 26));
        assert_eq!(segs.segments[0].kind, SegmentKind::Charge);
        assert_eq!(segs.segments[1].kind, SegmentKind::Discharge);
    }

    #[test]
    fn step_changes_split_even_at_constant_current() {
        let view = CycleView::new(
            vec![0.0, 1.0, 2.0, 3.0],
            vec![0.0, 0.1, 0.2, 0.3],
            vec![1e-3; 4],
            Some(vec![7, 7, 8, 8]),
        );
        let segs = segment_cycle(1, &view, WINDOW, 1.0, 0.001);
        let bounds: Vec<(usize, usize)> = segs.segments.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(bounds, vec![(0, 1), (2, 3)]);
    }

    #[test]
    fn current_sign_segmentation_drops_rest() {
        let view = charge_rest_discharge(false);
        let segs = segment_cycle(1, &view, WINDOW, 1.0, 0.001);
        assert_eq!(segs.dropped_rest_count, 1);
        assert_eq!(segs.segments.len(), 2);
        assert_eq!(segs.segments[0].kind, SegmentKind::Charge);
        assert_eq!(segs.segments[1].kind, SegmentKind::Discharge);
        assert_eq!(segs.segments[1].start, 16);
    }

    #[test]
    fn short_zero_current_blip_is_merged() {
        let t: Vec<f64> = (0..12).map(|k| k as f64).collect();
        let e = linspace(0.0, 1.1, 12);
        let mut i = vec![1e-3; 12];
        i[5] = 0.0;
        let view = CycleView::new(t, e, i, None);
        let segs = segment_cycle(1, &view, WINDOW, 1.0, 0.001);
        assert_eq!(segs.segments.len(), 1);
        assert_eq!((segs.segments[0].start, segs.segments[0].end), (0, 11));
        assert_eq!(segs.dropped_rest_count, 0);
    }

    #[test]
    fn flat_segment_inherits_previous_kind() {
        // charge ramp, then a flat hold at constant current, then discharge
        let mut e = linspace(0.0, 1.0, 5);
        e.extend([1.0, 1.0, 1.0, 1.0]);
        e.extend(linspace(1.0, 0.0, 5));
        let t: Vec<f64> = (0..e.len()).map(|k| k as f64).collect();
        let mut i = vec![1e-3; 9];
        i.extend(vec![-1e-3; 5]);
        let step = Some([vec![1; 5], vec![2; 4], vec![3; 5]].concat());
        let view = CycleView::new(t, e, i, step);
        let segs = segment_cycle(1, &view, WINDOW, 1.0, 0.001);
        let kinds: Vec<SegmentKind> = segs.segments.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![SegmentKind::Charge, SegmentKind::Charge, SegmentKind::Discharge]
        );
        assert!(segs.warnings.is_empty());
    }

    #[test]
    fn leading_flat_segment_inherits_next_kind() {
        let mut e = vec![0.5; 4];
        e.extend(linspace(0.5, 0.0, 5));
        let t: Vec<f64> = (0..e.len()).map(|k| k as f64).collect();
        let i = vec![-1e-3; 9];
        let step = Some([vec![1; 4], vec![2; 5]].concat());
        let segs = segment_cycle(1, &CycleView::new(t, e, i, step), WINDOW, 1.0, 0.001);
        assert!(segs.segments.iter().all(|s| s.kind == SegmentKind::Discharge));
    }

    #[test]
    fn all_flat_cycle_falls_back_to_sign_vote() {
        let t: Vec<f64> = (0..6).map(|k| k as f64).collect();
        let e = vec![0.5; 6];
        let i = vec![1e-3, 1e-3, 1e-3, -1e-3, -1e-3, -1e-3];
        let step = Some(vec![1, 1, 1, 2, 2, 2]);
        let segs = segment_cycle(1, &CycleView::new(t, e, i, step), WINDOW, 1.0, 0.001);
        assert!(segs.warnings.iter().any(|w| w.is(Code::W5003)));
        assert_eq!(segs.segments[0].kind, SegmentKind::Charge);
        assert_eq!(segs.segments[1].kind, SegmentKind::Discharge);
    }

    #[test]
    fn pseudo_current_follows_step_voltage_direction() {
        let series = ChannelSeries {
            t: vec![0.0, 1.0, 2.0, 3.0],
            e: vec![0.1, 0.2, 0.2, 0.1],
            step: Some(vec![1, 1, 2, 2]),
            ..ChannelSeries::default()
        };
        let view = CycleView::from_rows(&series, &[0, 1, 2, 3]);
        assert_eq!(view.i.to_vec(), vec![1.0, 1.0, -1.0, -1.0]);
    }

    fn cycle_with_first(k: i64, first: SegmentKind) -> CycleSegments {
        let seg = |kind: SegmentKind, start: usize, t_start: f64, t_end: f64| Segment {
            start,
            end: start + 1,
            t_start,
            t_end,
            i_med: 1.0,
            e_start: 0.0,
            e_end: 0.0,
            delta_e: 0.0,
            kind,
            warnings: Vec::new(),
        };
        CycleSegments {
            cycle_k: k,
            segments: vec![seg(first, 0, 0.0, 10.0), seg(first.opposite(), 2, 11.0, 100.0)],
            dropped_rest_count: 0,
            warnings: Vec::new(),
        }
    }

    #[test]
    fn main_order_by_majority() {
        let cycles = vec![
            cycle_with_first(1, SegmentKind::Charge),
            cycle_with_first(2, SegmentKind::Discharge),
            cycle_with_first(3, SegmentKind::Discharge),
            cycle_with_first(4, SegmentKind::Charge),
        ];
        let decided = decide_main_order(&cycles);
        assert_eq!(decided.order, MainOrder::DischargeCharge);
        assert_eq!(decided.decided_from, OrderDecision::Vote);
        assert!(decided.warnings.is_empty());
    }

    #[test]
    fn main_order_tie_uses_cycle_two() {
        let cycles = vec![
            cycle_with_first(2, SegmentKind::Discharge),
            cycle_with_first(3, SegmentKind::Charge),
        ];
        let decided = decide_main_order(&cycles);
        assert_eq!(decided.order, MainOrder::DischargeCharge);
        assert_eq!(decided.decided_from, OrderDecision::Cycle2Fallback);
        assert!(decided.warnings.iter().any(|w| w.is(Code::W5005)));

        let none = decide_main_order(&[cycle_with_first(1, SegmentKind::Discharge)]);
        assert_eq!(none.order, MainOrder::ChargeDischarge);
    }

    #[test]
    fn early_reverse_leg_in_cycle_one_is_dropped() {
        let cycle1 = cycle_with_first(1, SegmentKind::Discharge);
        let trimmed = drop_first_cycle_reverse_segment(&cycle1, MainOrder::ChargeDischarge);
        assert_eq!(trimmed.segments.len(), 1);
        assert_eq!(trimmed.segments[0].kind, SegmentKind::Charge);
        assert!(trimmed.warnings.iter().any(|w| w.is(Code::W5006)));

        let kept = drop_first_cycle_reverse_segment(&cycle1, MainOrder::DischargeCharge);
        assert_eq!(kept.segments.len(), 2);
    }

    #[test]
    fn late_reverse_leg_is_kept() {
        let mut cycle1 = cycle_with_first(1, SegmentKind::Discharge);
        cycle1.segments[0].t_end = 60.0;
        cycle1.segments[1].t_start = 61.0;
        let kept = drop_first_cycle_reverse_segment(&cycle1, MainOrder::ChargeDischarge);
        assert_eq!(kept.segments.len(), 2);
    }
}
