use std::fmt;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::GcdError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum FileType {
    Cv,
    Gcd,
    Eis,
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileType::Cv => "CV",
            FileType::Gcd => "GCD",
            FileType::Eis => "EIS",
        })
    }
}

/// Which measured column the current came from. Density readings are
/// already scaled to amperes by the geometric area upstream.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum CurrentKind {
    Direct,
    Density,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Current {
    pub kind: CurrentKind,
    pub amps: Vec<f64>,
}

/// Normalized, index-aligned channels of one measurement file.
///
/// Units: `t` s, `e` V, current A, capacities mAh.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChannelSeries {
    pub t: Vec<f64>,
    pub e: Vec<f64>,
    pub current: Option<Current>,
    pub step: Option<Vec<i64>>,
    pub cycle: Option<Vec<f64>>,
    pub q_chg: Option<Vec<f64>>,
    pub q_dis: Option<Vec<f64>>,
}

impl ChannelSeries {
    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    pub fn amps(&self) -> Option<&[f64]> {
        self.current.as_ref().map(|c| c.amps.as_slice())
    }

    /// Checks that every present channel has exactly `t.len()` samples.
    pub fn validate(&self) -> Result<(), GcdError> {
        let expected = self.t.len();
        let check = |channel: &'static str, found: usize| {
            if found == expected {
                Ok(())
            } else {
                Err(GcdError::ChannelLengthMismatch {
                    channel,
                    expected,
                    found,
                })
            }
        };
        check("E", self.e.len())?;
        if let Some(current) = &self.current {
            check("I", current.amps.len())?;
        }
        if let Some(step) = &self.step {
            check("Step", step.len())?;
        }
        if let Some(cycle) = &self.cycle {
            check("Cycle", cycle.len())?;
        }
        if let Some(q) = &self.q_chg {
            check("Q_chg", q.len())?;
        }
        if let Some(q) = &self.q_dis {
            check("Q_dis", q.len())?;
        }
        Ok(())
    }

    /// Integer view of the Cycle column, `None` when the column is absent
    /// or any value is not an integer.
    pub fn cycle_values(&self) -> Option<Vec<i64>> {
        self.cycle.as_deref().and_then(integer_cycle_values)
    }
}

pub fn integer_cycle_values(raw: &[f64]) -> Option<Vec<i64>> {
    raw.iter()
        .map(|&v| {
            if v.is_finite() && (v - v.round()).abs() <= 1e-6 {
                Some(v.round() as i64)
            } else {
                None
            }
        })
        .collect()
}

/// "N CYCLE" annotation found while cleaning raw lines.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleMarkerEvent {
    pub row_position: usize,
    pub k: i64,
    pub is_standalone: bool,
}

/// One battery condition: a normalized GCD series labelled with its current density.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConditionFile {
    pub file_path: String,
    /// Labelled current density (A/g).
    pub j_label: f64,
    pub series: ChannelSeries,
}

/// One CV measurement: normalized channels, the source line of every kept
/// data row (ascending) and the "N CYCLE" markers found between them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CvFile {
    pub file_path: String,
    /// Scan-rate label (mV/s).
    pub scan_rate: f64,
    pub series: ChannelSeries,
    pub kept_rows: Vec<usize>,
    pub markers: Vec<CycleMarkerEvent>,
}

/// Impedance spectrum of one EIS measurement (ohm).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EisSpectrum {
    pub file_path: String,
    /// Curve tag, conventionally `EIS-<num>`.
    pub label: String,
    pub z_re: Vec<f64>,
    pub z_im: Vec<f64>,
}

/// Sorts `rows` by `(t, original position)` and keeps the first row per distinct `t`.
pub fn sort_dedup_by_time(rows: &[usize], t: &[f64]) -> Vec<usize> {
    let mut order: Vec<(usize, usize)> = rows.iter().copied().enumerate().collect();
    order.sort_by_key(|&(pos, row)| (OrderedFloat(t[row]), pos));
    let mut out: Vec<usize> = Vec::with_capacity(order.len());
    for (_, row) in order {
        if let Some(&last) = out.last() {
            if OrderedFloat(t[last]) == OrderedFloat(t[row]) {
                continue;
            }
        }
        out.push(row);
    }
    out
}
