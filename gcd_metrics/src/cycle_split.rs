//! Partitioning of a file's rows into numbered cycles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::report::{Code, Diagnostic};
use crate::series::{CycleMarkerEvent, FileType};
use crate::GcdError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SplitMethod {
    #[serde(rename = "cycle_col")]
    CycleColumn,
    #[serde(rename = "k_cycle")]
    Markers,
    #[serde(rename = "none")]
    None,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CyclePartition {
    pub file_type: FileType,
    pub method: SplitMethod,
    pub max_cycle: Option<i64>,
    pub cycles: BTreeMap<i64, Vec<usize>>,
    pub warnings: Vec<Diagnostic>,
}

impl CyclePartition {
    fn empty(file_type: FileType, method: SplitMethod, max_cycle: Option<i64>) -> Self {
        Self {
            file_type,
            method,
            max_cycle,
            cycles: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    /// Rows of `cycle`; empty for a number in `1..=max_cycle` with no rows.
    pub fn rows(&self, cycle: i64) -> &[usize] {
        self.cycles.get(&cycle).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Splits rows into cycles.
///
/// * `EIS` has no cycle concept.
/// * `GCD` requires an integer Cycle column (`cycle_values`); rows whose
///   cycle number is `<= 0` are left out but still count toward `max_cycle`.
///
/// Only cycles that own rows (or that a marker names) get a map entry, so
/// the partition grows with the input, not with the largest cycle number.
/// * `CV` uses "N CYCLE" markers; `kept_rows` lists the raw line index of
///   every data row that survived cleaning, in ascending order.
pub fn split_cycles(
    file_type: FileType,
    cycle_values: Option<&[i64]>,
    kept_rows: &[usize],
    markers: &[CycleMarkerEvent],
) -> Result<CyclePartition, GcdError> {
    match file_type {
        FileType::Eis => Ok(CyclePartition::empty(file_type, SplitMethod::None, None)),
        FileType::Gcd => split_by_cycle_column(cycle_values),
        FileType::Cv => Ok(split_by_markers(kept_rows, markers)),
    }
}

fn split_by_cycle_column(cycle_values: Option<&[i64]>) -> Result<CyclePartition, GcdError> {
    let values = match cycle_values {
        Some(values) if !values.is_empty() => values,
        _ => return Err(GcdError::MissingCycleColumn),
    };
    let max_cycle = values.iter().copied().max().unwrap_or(0);
    let mut partition =
        CyclePartition::empty(FileType::Gcd, SplitMethod::CycleColumn, Some(max_cycle));
    for (row, &k) in values.iter().enumerate() {
        if k <= 0 {
            continue;
        }
        partition.cycles.entry(k).or_default().push(row);
    }
    Ok(partition)
}

fn split_by_markers(kept_rows: &[usize], markers: &[CycleMarkerEvent]) -> CyclePartition {
    let n_rows = kept_rows.len();
    let mut partition = CyclePartition::empty(FileType::Cv, SplitMethod::Markers, Some(1));
    if n_rows == 0 {
        partition.cycles.insert(1, Vec::new());
        return partition;
    }

    // Latest occurrence wins for repeated cycle numbers.
    let mut latest: BTreeMap<i64, usize> = BTreeMap::new();
    for marker in markers {
        if marker.k <= 0 {
            continue;
        }
        let slot = latest.entry(marker.k).or_insert(marker.row_position);
        if marker.row_position > *slot {
            *slot = marker.row_position;
        }
    }

    let mut ends: BTreeMap<i64, usize> = BTreeMap::new();
    let mut prev_end: Option<usize> = None;
    for (&k, &raw_position) in &latest {
        // Index of the last kept row at or before the marker.
        let at_or_before = kept_rows.partition_point(|&row| row <= raw_position);
        if at_or_before == 0 {
            partition
                .warnings
                .push(Diagnostic::new(Code::W4001).with("k", k));
            continue;
        }
        let mut end = at_or_before - 1;
        if let Some(prev) = prev_end {
            if end <= prev {
                partition
                    .warnings
                    .push(Diagnostic::new(Code::W4002).with("k", k));
                end = prev;
            }
        }
        ends.insert(k, end);
        prev_end = Some(end);
    }

    let (n_max, last_end) = match ends.iter().next_back() {
        Some((&k, &end)) => (k, end),
        None => {
            partition.cycles.insert(1, (0..n_rows).collect());
            return partition;
        }
    };

    // Ends are non-decreasing after clamping; unnamed cycles stay empty.
    let mut previous: Option<usize> = None;
    for (&k, &end) in &ends {
        let start = previous.map_or(0, |p| p + 1);
        let rows = if end >= start {
            (start..=end).collect()
        } else {
            Vec::new()
        };
        partition.cycles.insert(k, rows);
        previous = Some(end);
    }

    if last_end + 1 < n_rows {
        partition.max_cycle = Some(n_max + 1);
        partition.cycles.insert(n_max + 1, (last_end + 1..n_rows).collect());
    } else {
        partition.max_cycle = Some(n_max);
    }
    partition
}

/// Rows of cycle `n`, validated against the partition's range.
pub fn select_cycle_rows(partition: &CyclePartition, n: i64) -> Result<&[usize], GcdError> {
    let out_of_range = GcdError::CycleOutOfRange {
        requested: n,
        max: partition.max_cycle,
    };
    match partition.max_cycle {
        Some(max) if n >= 1 && n <= max && partition.file_type != FileType::Eis => {
            Ok(partition.rows(n))
        }
        _ => Err(out_of_range),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(row_position: usize, k: i64) -> CycleMarkerEvent {
        CycleMarkerEvent {
            row_position,
            k,
            is_standalone: true,
        }
    }

    fn assert_disjoint(partition: &CyclePartition) {
        let mut seen = std::collections::HashSet::new();
        for rows in partition.cycles.values() {
            for &r in rows {
                assert!(seen.insert(r), "row {} assigned twice", r);
            }
        }
    }

    #[test]
    fn eis_has_no_cycles() {
        let p = split_cycles(FileType::Eis, None, &[0, 1], &[]).unwrap();
        assert_eq!(p.method, SplitMethod::None);
        assert!(p.max_cycle.is_none());
        assert!(p.cycles.is_empty());
        assert!(select_cycle_rows(&p, 1).is_err());
    }

    #[test]
    fn gcd_requires_cycle_column() {
        let err = split_cycles(FileType::Gcd, None, &[], &[]).unwrap_err();
        assert!(matches!(err, GcdError::MissingCycleColumn));
        assert_eq!(err.code(), Some(Code::E9007));
        assert!(split_cycles(FileType::Gcd, Some(&[]), &[], &[]).is_err());
    }

    #[test]
    fn gcd_partitions_by_cycle_value() {
        let values = [0, 1, 1, 2, 2, 3, -1, 3];
        let p = split_cycles(FileType::Gcd, Some(&values), &[], &[]).unwrap();
        assert_eq!(p.method, SplitMethod::CycleColumn);
        assert_eq!(p.max_cycle, Some(3));
        assert_eq!(p.cycles.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(p.rows(1), &[1, 2]);
        assert_eq!(p.rows(2), &[3, 4]);
        assert_eq!(p.rows(3), &[5, 7]);
        assert_disjoint(&p);
    }

    #[test]
    fn gcd_gaps_in_numbering_read_as_empty() {
        let p = split_cycles(FileType::Gcd, Some(&[1, 1, 3]), &[], &[]).unwrap();
        assert_eq!(p.cycles.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert!(p.rows(2).is_empty());
        assert_eq!(select_cycle_rows(&p, 2).unwrap(), &[] as &[usize]);
    }

    #[test]
    fn huge_cycle_number_stores_only_present_cycles() {
        let p = split_cycles(FileType::Gcd, Some(&[1, 20_000_000]), &[], &[]).unwrap();
        assert_eq!(p.max_cycle, Some(20_000_000));
        assert_eq!(p.cycles.len(), 2);
        assert_eq!(p.rows(20_000_000), &[1]);
        assert!(select_cycle_rows(&p, 10_000_000).unwrap().is_empty());
    }

    #[test]
    fn huge_marker_number_stores_only_named_cycles() {
        let kept: Vec<usize> = (0..6).collect();
        let p = split_cycles(FileType::Cv, None, &kept, &[marker(2, 1), marker(4, 1_000_000_000)])
            .unwrap();
        assert_eq!(p.max_cycle, Some(1_000_000_001));
        assert_eq!(p.cycles.len(), 3);
        assert_eq!(p.rows(1_000_000_000), &[3, 4]);
        assert_eq!(p.rows(1_000_000_001), &[5]);
    }

    #[test]
    fn markers_split_with_trailing_cycle() {
        let kept: Vec<usize> = (3..13).collect();
        let p = split_cycles(FileType::Cv, None, &kept, &[marker(6, 1), marker(9, 2)]).unwrap();
        assert_eq!(p.method, SplitMethod::Markers);
        assert_eq!(p.max_cycle, Some(3));
        assert_eq!(p.rows(1), &[0, 1, 2, 3]);
        assert_eq!(p.rows(2), &[4, 5, 6]);
        assert_eq!(p.rows(3), &[7, 8, 9]);
        assert!(p.warnings.is_empty());
    }

    #[test]
    fn markers_without_trailing_data() {
        let kept: Vec<usize> = (0..6).collect();
        let p = split_cycles(FileType::Cv, None, &kept, &[marker(2, 1), marker(5, 2)]).unwrap();
        assert_eq!(p.max_cycle, Some(2));
        assert_eq!(p.rows(2), &[3, 4, 5]);
    }

    #[test]
    fn duplicate_markers_keep_latest_position() {
        let kept: Vec<usize> = (0..10).collect();
        let p = split_cycles(FileType::Cv, None, &kept, &[marker(2, 1), marker(4, 1)]).unwrap();
        assert_eq!(p.rows(1), &[0, 1, 2, 3, 4]);
        assert_eq!(p.rows(2), &[5, 6, 7, 8, 9]);
    }

    #[test]
    fn non_monotonic_markers_are_clamped() {
        let kept: Vec<usize> = (0..15).collect();
        let p = split_cycles(FileType::Cv, None, &kept, &[marker(5, 2), marker(10, 1)]).unwrap();
        assert!(p.warnings.iter().any(|w| w.is(Code::W4002)));
        assert_eq!(p.rows(1), &(0..=10).collect::<Vec<_>>()[..]);
        assert!(p.rows(2).is_empty());
        assert_eq!(p.rows(3), &[11, 12, 13, 14]);
        assert_disjoint(&p);
    }

    #[test]
    fn markers_before_first_row_are_dropped() {
        let kept: Vec<usize> = (10..14).collect();
        let p = split_cycles(FileType::Cv, None, &kept, &[marker(3, 1)]).unwrap();
        assert!(p.warnings.iter().any(|w| w.is(Code::W4001)));
        assert_eq!(p.max_cycle, Some(1));
        assert_eq!(p.rows(1), &[0, 1, 2, 3]);
    }

    #[test]
    fn missing_intermediate_marker_yields_empty_cycle() {
        let kept: Vec<usize> = (0..9).collect();
        let p = split_cycles(FileType::Cv, None, &kept, &[marker(2, 1), marker(5, 3)]).unwrap();
        assert_eq!(p.rows(1), &[0, 1, 2]);
        assert!(p.rows(2).is_empty());
        assert_eq!(p.rows(3), &[3, 4, 5]);
        assert_eq!(p.rows(4), &[6, 7, 8]);
    }

    #[test]
    fn select_rejects_out_of_range() {
        let p = split_cycles(FileType::Gcd, Some(&[1, 2]), &[], &[]).unwrap();
        assert_eq!(select_cycle_rows(&p, 2).unwrap(), &[1]);
        assert!(select_cycle_rows(&p, 0).is_err());
        assert!(select_cycle_rows(&p, 3).is_err());
    }
}
