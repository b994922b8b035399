use std::ops::Range;

use qc_columnar::BitMask;
use qc_types::{FailureRecord, Timestamp};

/// Maximal runs of set bits, in row order.
#[must_use]
pub fn failure_runs(failures: &BitMask) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = None;
    for (row, failed) in failures.bits().enumerate() {
        match (failed, start) {
            (true, None) => start = Some(row),
            (false, Some(s)) => {
                runs.push(s..row);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(s..failures.len());
    }
    runs
}

/// One record per run of at least `min_consecutive` failures.
///
/// Shorter runs produce no record; callers still apply them to the mask.
#[must_use]
pub fn group_failures(
    labels: &[Timestamp],
    failures: &BitMask,
    min_consecutive: usize,
    variable: Option<&str>,
    error_flag: &str,
) -> Vec<FailureRecord> {
    failure_runs(failures)
        .into_iter()
        .filter(|run| run.len() >= min_consecutive.max(1))
        .filter_map(|run| {
            let start_time = *labels.get(run.start)?;
            let end_time = *labels.get(run.end - 1)?;
            Some(FailureRecord {
                variable_name: variable.map(str::to_owned),
                start_time,
                end_time,
                timesteps: run.len(),
                error_flag: error_flag.to_owned(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use qc_columnar::BitMask;
    use qc_types::Timestamp;

    use super::{failure_runs, group_failures};

    fn labels(n: u32) -> Vec<Timestamp> {
        (0..n)
            .map(|h| {
                NaiveDate::from_ymd_opt(2015, 1, 1)
                    .and_then(|d| d.and_hms_opt(h, 0, 0))
                    .expect("valid timestamp")
            })
            .collect()
    }

    #[test]
    fn runs_cover_edges() {
        let mask = BitMask::from_bools(&[true, true, false, true, false, true]);
        assert_eq!(failure_runs(&mask), vec![0..2, 3..4, 5..6]);
        assert!(failure_runs(&BitMask::all_false(4)).is_empty());
        assert_eq!(failure_runs(&BitMask::all_true(3)), vec![0..3]);
    }

    #[test]
    fn short_runs_are_not_reported() {
        let labels = labels(7);
        let mask = BitMask::from_bools(&[false, false, true, true, true, false, true]);
        let records = group_failures(&labels, &mask, 2, Some("A"), "Data > upper bound, 1");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.variable_name.as_deref(), Some("A"));
        assert_eq!(record.start_time, labels[2]);
        assert_eq!(record.end_time, labels[4]);
        assert_eq!(record.timesteps, 3);
        assert_eq!(record.error_flag, "Data > upper bound, 1");
    }

    #[test]
    fn zero_minimum_behaves_like_one() {
        let labels = labels(3);
        let mask = BitMask::from_bools(&[false, true, false]);
        assert_eq!(group_failures(&labels, &mask, 0, None, "x").len(), 1);
    }
}
