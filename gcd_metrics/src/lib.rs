//! Core galvanostatic charge-discharge (GCD) metrics library.
//!
//! The pipeline runs strictly downward: cycles are split from the
//! normalized channel series, each cycle is segmented into charge and
//! discharge legs, the legs are clipped to a voltage window, and the
//! clipped traces are integrated into per-cycle and per-file metrics.
//! Every stage is a pure function over in-memory arrays; diagnostics are
//! returned as values and persisted by the caller.

use thiserror::Error;

pub mod config;
pub mod curve;
pub mod cycle_split;
pub mod metrics;
pub mod rate;
pub mod report;
pub mod segment;
pub mod series;
pub mod table;
pub mod window;

pub use config::{active_mass_g, MetricsConfig, MetricsParams, OutputMode, VoltageWindow};
pub use curve::{export_cv_curve, export_cycle_curve, export_eis_curve, CurveExport};
pub use cycle_split::{select_cycle_rows, split_cycles, CyclePartition, SplitMethod};
pub use metrics::{
    compute_file_metrics, specific_capacitance, ChargeSource, CycleMetrics, FileMetrics,
    SpecificMetrics,
};
pub use rate::{build_rate_table, RateTable};
pub use report::{Code, Diagnostic, RunReport, Severity};
pub use segment::{
    decide_main_order, drop_first_cycle_reverse_segment, segment_cycle, BatteryMainOrder,
    CycleSegments, CycleView, MainOrder, OrderDecision, Segment, SegmentKind,
};
pub use series::{
    sort_dedup_by_time, ChannelSeries, ConditionFile, Current, CurrentKind, CvFile,
    CycleMarkerEvent, EisSpectrum, FileType,
};
pub use table::{ColumnBlock, ColumnHeader};
pub use window::{clip_to_window, ClipError, GlobalSeries, LegSamples, WindowTrace};

#[derive(Error, Debug)]
pub enum GcdError {
    #[error("E9007: missing cycle column for GCD")]
    MissingCycleColumn,
    #[error("missing required channel: {0}")]
    MissingChannel(&'static str),
    #[error("channel {channel} has {found} samples, expected {expected}")]
    ChannelLengthMismatch {
        channel: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("cycle {requested} out of range (max cycle {max:?})")]
    CycleOutOfRange { requested: i64, max: Option<i64> },
}

impl GcdError {
    /// Report code for errors that carry one.
    pub fn code(&self) -> Option<Code> {
        match self {
            GcdError::MissingCycleColumn => Some(Code::E9007),
            _ => None,
        }
    }
}

/// Median of the finite-or-not values yielded by `values`; `None` when empty.
pub(crate) fn median<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = f64>,
{
    let mut sorted: Vec<f64> = values.into_iter().collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by_key(|v| ordered_float::OrderedFloat(*v));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

pub(crate) fn sign(x: f64, eps: f64) -> i8 {
    if x > eps {
        1
    } else if x < -eps {
        -1
    } else {
        0
    }
}
