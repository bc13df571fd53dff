//! Voltage-window clipping of one charge or discharge leg.
//!
//! A charge leg is cut where it rises through `V_start` and again where it
//! rises through `V_end`; a discharge leg is cut where it falls through
//! `V_end` and then `V_start`. Endpoints are linearly interpolated between
//! the bracketing samples. When the true crossing lies just outside the
//! leg, a small neighbourhood of the whole-file series is searched instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::VoltageWindow;
use crate::segment::SegmentKind;

const TOUCH_EPS: f64 = 1e-12;
const DENOM_EPS: f64 = 1e-15;
const GLOBAL_SEARCH_RADIUS: usize = 5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClipError {
    #[error("leg has fewer than 2 samples")]
    TooFewSamples,
    #[error("window is empty (V_start >= V_end)")]
    InvalidWindow,
    #[error("leg kind {0} cannot be clipped")]
    NotALeg(SegmentKind),
    #[error("no crossing of start target {0} V")]
    NoStartCrossing(f64),
    #[error("no crossing of end target {0} V")]
    NoEndCrossing(f64),
    #[error("bracketing samples have equal voltage at {0} V")]
    DegenerateBracket(f64),
    #[error("clipped end time does not exceed start time")]
    NonIncreasingTime,
    #[error("clipped trace has fewer than 2 points")]
    EmptyTrace,
}

/// Samples of one leg plus the global row of each sample.
#[derive(Clone, Copy, Debug)]
pub struct LegSamples<'a> {
    pub t: &'a [f64],
    pub e: &'a [f64],
    pub i: Option<&'a [f64]>,
    pub q: Option<&'a [f64]>,
    pub global_rows: &'a [usize],
}

/// Whole-file series the fallback crossing search runs over.
#[derive(Clone, Copy, Debug)]
pub struct GlobalSeries<'a> {
    pub t: &'a [f64],
    pub e: &'a [f64],
    pub i: Option<&'a [f64]>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WindowTrace {
    pub t: Vec<f64>,
    pub e: Vec<f64>,
    pub i: Option<Vec<f64>>,
    pub q: Option<Vec<f64>>,
    /// Endpoint lies strictly between two samples rather than on one.
    pub start_via_interp: bool,
    pub end_via_interp: bool,
    /// Endpoint came from the whole-file neighbourhood search.
    pub start_from_global: bool,
    pub end_from_global: bool,
}

impl WindowTrace {
    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    pub fn duration(&self) -> f64 {
        match (self.t.first(), self.t.last()) {
            (Some(a), Some(b)) => b - a,
            _ => 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Point {
    t: f64,
    e: f64,
    i: Option<f64>,
    q: Option<f64>,
    interpolated: bool,
}

fn crosses(a: f64, b: f64, target: f64, upward: bool) -> bool {
    let touches = (a - target).abs() <= TOUCH_EPS || (b - target).abs() <= TOUCH_EPS;
    if upward {
        (a <= target && target <= b + TOUCH_EPS) || touches
    } else {
        (b - TOUCH_EPS <= target && target <= a) || touches
    }
}

fn crossing_pairs(e: &[f64], target: f64, upward: bool) -> Vec<usize> {
    (0..e.len().saturating_sub(1))
        .filter(|&k| crosses(e[k], e[k + 1], target, upward))
        .collect()
}

/// Nearest crossing pair within ±5 samples of `center` in the global series.
fn global_bracket(e: &[f64], center: usize, target: f64, upward: bool) -> Option<usize> {
    if e.len() < 2 {
        return None;
    }
    let lo = center.saturating_sub(GLOBAL_SEARCH_RADIUS);
    let hi = (center + GLOBAL_SEARCH_RADIUS).min(e.len() - 2);
    (lo..=hi)
        .filter(|&k| crosses(e[k], e[k + 1], target, upward))
        .min_by_key(|&k| (k.abs_diff(center), k))
}

/// Local pair index whose samples are global rows `g` and `g + 1`.
fn local_pair(global_rows: &[usize], g: usize) -> Option<usize> {
    global_rows.windows(2).position(|w| w[0] == g && w[1] == g + 1)
}

fn lerp(a: f64, b: f64, alpha: f64) -> f64 {
    a + alpha * (b - a)
}

fn interp_at(
    k: usize,
    target: f64,
    t: &[f64],
    e: &[f64],
    i: Option<&[f64]>,
    q: Option<&[f64]>,
) -> Result<Point, ClipError> {
    let de = e[k + 1] - e[k];
    if de.abs() < DENOM_EPS {
        return Err(ClipError::DegenerateBracket(target));
    }
    let alpha = (target - e[k]) / de;
    let on_sample =
        (e[k] - target).abs() <= TOUCH_EPS || (e[k + 1] - target).abs() <= TOUCH_EPS;
    Ok(Point {
        t: lerp(t[k], t[k + 1], alpha),
        e: target,
        i: i.map(|i| lerp(i[k], i[k + 1], alpha)),
        q: q.map(|q| lerp(q[k], q[k + 1], alpha)),
        interpolated: !on_sample,
    })
}

/// Resolved crossing: the local pair it sits on (if the pair belongs to the
/// leg) and, for global hits, the global pair.
#[derive(Clone, Copy, Debug)]
struct Crossing {
    local: Option<usize>,
    global: Option<usize>,
}

fn resolve_endpoint(
    crossing: Crossing,
    target: f64,
    leg: &LegSamples<'_>,
    global: &GlobalSeries<'_>,
    q_fallback: Option<f64>,
) -> Result<Point, ClipError> {
    match crossing.global {
        None => {
            let k = crossing.local.ok_or(ClipError::EmptyTrace)?;
            interp_at(k, target, leg.t, leg.e, leg.i, leg.q)
        }
        Some(g) => {
            let mut point = interp_at(g, target, global.t, global.e, global.i, None)?;
            point.q = match (crossing.local, leg.q) {
                (Some(k), Some(_)) => interp_at(k, target, leg.t, leg.e, None, leg.q)?.q,
                (None, Some(_)) => q_fallback,
                (_, None) => None,
            };
            Ok(point)
        }
    }
}

/// Clips one leg to `window`. `direction` must be `Charge` or `Discharge`.
pub fn clip_to_window(
    leg: &LegSamples<'_>,
    window: VoltageWindow,
    direction: SegmentKind,
    global: &GlobalSeries<'_>,
) -> Result<WindowTrace, ClipError> {
    let n = leg.t.len();
    if n < 2 || leg.e.len() < 2 || leg.global_rows.len() != n {
        return Err(ClipError::TooFewSamples);
    }
    if window.v_start >= window.v_end {
        return Err(ClipError::InvalidWindow);
    }
    let (start_target, end_target, upward) = match direction {
        SegmentKind::Charge => (window.v_start, window.v_end, true),
        SegmentKind::Discharge => (window.v_end, window.v_start, false),
        SegmentKind::Platform => return Err(ClipError::NotALeg(direction)),
    };

    let start = match crossing_pairs(leg.e, start_target, upward).last() {
        Some(&k) => Crossing {
            local: Some(k),
            global: None,
        },
        None => {
            let g = global_bracket(global.e, leg.global_rows[0], start_target, upward)
                .ok_or(ClipError::NoStartCrossing(start_target))?;
            Crossing {
                local: local_pair(leg.global_rows, g),
                global: Some(g),
            }
        }
    };

    let end_local = crossing_pairs(leg.e, end_target, upward)
        .into_iter()
        .find(|&k| start.local.map_or(true, |s| k >= s));
    let end = match end_local {
        Some(k) => Crossing {
            local: Some(k),
            global: None,
        },
        None => {
            let g = global_bracket(global.e, leg.global_rows[n - 1], end_target, upward)
                .ok_or(ClipError::NoEndCrossing(end_target))?;
            Crossing {
                local: local_pair(leg.global_rows, g),
                global: Some(g),
            }
        }
    };

    let first_q = leg.q.and_then(|q| q.first().copied());
    let last_q = leg.q.and_then(|q| q.last().copied());
    let start_point = resolve_endpoint(start, start_target, leg, global, first_q)?;
    let end_point = resolve_endpoint(end, end_target, leg, global, last_q)?;

    let interior_from = start.local.map_or(0, |k| k + 1);
    let interior_to = end.local.unwrap_or(n - 1);
    if end_point.t <= start_point.t + DENOM_EPS || interior_to + 1 < interior_from {
        return Err(ClipError::NonIncreasingTime);
    }

    let mut trace = WindowTrace {
        i: leg.i.map(|_| Vec::new()),
        q: leg.q.map(|_| Vec::new()),
        start_via_interp: start_point.interpolated,
        end_via_interp: end_point.interpolated,
        start_from_global: start.global.is_some(),
        end_from_global: end.global.is_some(),
        ..WindowTrace::default()
    };
    push_point(&mut trace, start_point);
    for k in interior_from..=interior_to {
        push_point(
            &mut trace,
            Point {
                t: leg.t[k],
                e: leg.e[k],
                i: leg.i.map(|i| i[k]),
                q: leg.q.map(|q| q[k]),
                interpolated: false,
            },
        );
    }
    push_point(&mut trace, end_point);

    if trace.len() < 2 {
        return Err(ClipError::EmptyTrace);
    }
    Ok(trace)
}

/// Appends a point unless it coincides with the previous one in both `t` and `E`.
fn push_point(trace: &mut WindowTrace, point: Point) {
    if let (Some(&t), Some(&e)) = (trace.t.last(), trace.e.last()) {
        if (t - point.t).abs() <= TOUCH_EPS && (e - point.e).abs() <= TOUCH_EPS {
            return;
        }
    }
    trace.t.push(point.t);
    trace.e.push(point.e);
    if let Some(i) = trace.i.as_mut() {
        i.push(point.i.unwrap_or(f64::NAN));
    }
    if let Some(q) = trace.q.as_mut() {
        q.push(point.q.unwrap_or(f64::NAN));
    }
}
