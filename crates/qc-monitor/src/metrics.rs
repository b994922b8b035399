//! Generic performance metrics over session outputs.
//!
//! Every metric takes an optional [`TimeFilter`]; rows it excludes are
//! dropped before computing. Per-column results keep the frame's column
//! order.

use qc_columnar::{BitMask, Column};
use qc_frame::{MaskFrame, TimeFrame};
use qc_index::TimeIndex;
use qc_types::delta_seconds;
use tracing::debug;

use crate::QcError;
use crate::time_filter::TimeFilter;

/// One value per column.
pub type ColumnMetric = Vec<(String, f64)>;

fn kept_rows(index: &TimeIndex, filter: Option<&TimeFilter>) -> Vec<usize> {
    match filter {
        Some(filter) => {
            let keep = filter.aligned(index);
            (0..index.len()).filter(|&row| keep.get(row)).collect()
        }
        None => (0..index.len()).collect(),
    }
}

fn filter_frame(frame: &TimeFrame, filter: Option<&TimeFilter>) -> Result<TimeFrame, QcError> {
    if filter.is_none() {
        return Ok(frame.clone());
    }
    let rows = kept_rows(frame.index(), filter);
    let positions: Vec<Option<usize>> = rows.iter().copied().map(Some).collect();
    Ok(frame.take_rows(frame.index().take(&rows), &positions)?)
}

fn same_columns(left: &[String], right: &[String], what: &str) -> Result<(), QcError> {
    let mut l = left.to_vec();
    let mut r = right.to_vec();
    l.sort();
    r.sort();
    if l == r {
        Ok(())
    } else {
        Err(QcError::InvalidInput(format!(
            "the column names of both {what} must be equal"
        )))
    }
}

fn filtered_bits(bits: &BitMask, rows: &[usize]) -> Vec<bool> {
    rows.iter().map(|&row| bits.get(row)).collect()
}

// ── Quality ────────────────────────────────────────────────────────────

/// Quality control index: share of rows that passed, per column.
#[must_use]
pub fn qci(mask: &MaskFrame, filter: Option<&TimeFilter>) -> ColumnMetric {
    let rows = kept_rows(mask.index(), filter);
    mask.iter_columns()
        .map(|(name, bits)| {
            let passed = rows.iter().filter(|&&row| bits.get(row)).count();
            (name.to_owned(), passed as f64 / rows.len() as f64)
        })
        .collect()
}

/// Root mean squared error between two frames with the same columns.
pub fn rmse(
    data1: &TimeFrame,
    data2: &TimeFrame,
    filter: Option<&TimeFilter>,
) -> Result<ColumnMetric, QcError> {
    same_columns(data1.column_names(), data2.column_names(), "frames")?;
    if data1.index() != data2.index() {
        return Err(QcError::InvalidInput(
            "frames must share one index".to_owned(),
        ));
    }
    let rows = kept_rows(data1.index(), filter);
    let mut out = Vec::with_capacity(data1.num_columns());
    for (name, left) in data1.iter_columns() {
        let Some(right) = data2.column(name) else {
            continue;
        };
        let (sum, count) = rows
            .iter()
            .map(|&row| left.values()[row] - right.values()[row])
            .filter(|diff| !diff.is_nan())
            .fold((0.0, 0usize), |(sum, count), diff| (sum + diff * diff, count + 1));
        out.push((name.to_owned(), (sum / count as f64).sqrt()));
    }
    Ok(out)
}

// ── Calculus ───────────────────────────────────────────────────────────

/// Trapezoidal integral over seconds since the first row. Missing values
/// count as zero.
pub fn time_integral(frame: &TimeFrame, filter: Option<&TimeFilter>) -> Result<ColumnMetric, QcError> {
    let frame = filter_frame(frame, filter)?;
    let seconds = seconds_since_start(frame.index());
    let out = frame
        .iter_columns()
        .map(|(name, column)| {
            let values: Vec<f64> = column
                .values()
                .iter()
                .map(|v| if v.is_nan() { 0.0 } else { *v })
                .collect();
            let area = seconds
                .windows(2)
                .zip(values.windows(2))
                .map(|(t, f)| (t[1] - t[0]) * (f[0] + f[1]) / 2.0)
                .sum::<f64>();
            (name.to_owned(), area)
        })
        .collect();
    Ok(out)
}

/// Derivative with respect to seconds: second-order central differences
/// inside, one-sided differences at both ends.
pub fn time_derivative(frame: &TimeFrame, filter: Option<&TimeFilter>) -> Result<TimeFrame, QcError> {
    let frame = filter_frame(frame, filter)?;
    if frame.len() < 2 {
        return Err(QcError::InvalidInput(
            "a derivative needs at least two rows".to_owned(),
        ));
    }
    let seconds = seconds_since_start(frame.index());
    let columns = frame
        .iter_columns()
        .map(|(name, column)| (name.to_owned(), Column::new(gradient(column.values(), &seconds))))
        .collect();
    debug!(rows = frame.len(), "computed time derivative");
    Ok(TimeFrame::new(frame.index().clone(), columns)?)
}

fn seconds_since_start(index: &TimeIndex) -> Vec<f64> {
    match index.first() {
        Some(first) => index
            .labels()
            .iter()
            .map(|ts| delta_seconds(*ts - first))
            .collect(),
        None => Vec::new(),
    }
}

fn gradient(f: &[f64], x: &[f64]) -> Vec<f64> {
    let n = f.len();
    let mut out = vec![f64::NAN; n];
    if n < 2 {
        return out;
    }
    out[0] = (f[1] - f[0]) / (x[1] - x[0]);
    out[n - 1] = (f[n - 1] - f[n - 2]) / (x[n - 1] - x[n - 2]);
    for i in 1..n - 1 {
        let hs = x[i] - x[i - 1];
        let hd = x[i + 1] - x[i];
        out[i] = (hs * hs * f[i + 1] + (hd * hd - hs * hs) * f[i] - hd * hd * f[i - 1])
            / (hs * hd * (hd + hs));
    }
    out
}

// ── Detection ──────────────────────────────────────────────────────────

/// Counts of one column's observed mask against the actual conditions.
/// `true` = normal, `false` = anomalous in both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Confusion {
    true_positive: usize,
    false_negative: usize,
    true_negative: usize,
    false_positive: usize,
}

impl Confusion {
    fn tally(observed: &[bool], actual: &[bool]) -> Self {
        let mut counts = Self::default();
        for (obs, act) in observed.iter().zip(actual) {
            match (*obs, *act) {
                (false, false) => counts.true_positive += 1,
                (true, false) => counts.false_negative += 1,
                (true, true) => counts.true_negative += 1,
                (false, true) => counts.false_positive += 1,
            }
        }
        counts
    }
}

fn confusion(
    observed: &MaskFrame,
    actual: &MaskFrame,
    filter: Option<&TimeFilter>,
) -> Result<Vec<(String, Confusion)>, QcError> {
    same_columns(observed.column_names(), actual.column_names(), "masks")?;
    if observed.index() != actual.index() {
        return Err(QcError::InvalidInput("masks must share one index".to_owned()));
    }
    let rows = kept_rows(observed.index(), filter);
    Ok(observed
        .iter_columns()
        .filter_map(|(name, obs)| {
            let act = actual.column(name)?;
            let counts = Confusion::tally(&filtered_bits(obs, &rows), &filtered_bits(act, &rows));
            Some((name.to_owned(), counts))
        })
        .collect())
}

/// Share of anomalous cells the tests caught: `TP / (TP + FN)`.
pub fn probability_of_detection(
    observed: &MaskFrame,
    actual: &MaskFrame,
    filter: Option<&TimeFilter>,
) -> Result<ColumnMetric, QcError> {
    Ok(confusion(observed, actual, filter)?
        .into_iter()
        .map(|(name, c)| {
            let pd = c.true_positive as f64 / (c.true_positive + c.false_negative) as f64;
            (name, pd)
        })
        .collect())
}

/// Share of normal cells the tests flagged: `FP / (TN + FP)`.
pub fn false_alarm_rate(
    observed: &MaskFrame,
    actual: &MaskFrame,
    filter: Option<&TimeFilter>,
) -> Result<ColumnMetric, QcError> {
    Ok(confusion(observed, actual, filter)?
        .into_iter()
        .map(|(name, c)| {
            let far = c.false_positive as f64 / (c.true_negative + c.false_positive) as f64;
            (name, far)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use qc_columnar::BitMask;
    use qc_frame::{MaskFrame, TimeFrame};
    use qc_index::TimeIndex;
    use qc_types::Timestamp;

    use super::{
        false_alarm_rate, probability_of_detection, qci, rmse, time_derivative, time_integral,
    };
    use crate::QcError;
    use crate::time_filter::TimeFilter;

    fn ts(h: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2015, 1, 1)
            .and_then(|d| d.and_hms_opt(h, 0, 0))
            .expect("valid timestamp")
    }

    fn index(n: u32) -> TimeIndex {
        TimeIndex::new((0..n).map(ts).collect())
    }

    fn mask(bits: &[bool]) -> MaskFrame {
        MaskFrame::new(
            index(bits.len() as u32),
            vec![("A".to_owned(), BitMask::from_bools(bits))],
        )
        .expect("mask")
    }

    #[test]
    fn qci_with_and_without_filter() {
        let m = mask(&[true, false, true, true]);
        assert_eq!(qci(&m, None), vec![("A".to_owned(), 0.75)]);
        let filter = TimeFilter::from_bools(index(4), &[true, true, false, false]).expect("filter");
        assert_eq!(qci(&m, Some(&filter)), vec![("A".to_owned(), 0.5)]);
    }

    #[test]
    fn rmse_requires_matching_columns() {
        let a = TimeFrame::from_values(index(2), vec![("A", vec![1.0, 3.0])]).expect("a");
        let b = TimeFrame::from_values(index(2), vec![("A", vec![2.0, 2.0])]).expect("b");
        assert_eq!(rmse(&a, &b, None).expect("rmse"), vec![("A".to_owned(), 1.0)]);
        let c = TimeFrame::from_values(index(2), vec![("B", vec![2.0, 2.0])]).expect("c");
        assert!(matches!(rmse(&a, &c, None), Err(QcError::InvalidInput(_))));
    }

    #[test]
    fn integral_treats_missing_as_zero() {
        let frame = TimeFrame::from_values(index(3), vec![("A", vec![1.0, 1.0, f64::NAN])])
            .expect("frame");
        let integral = time_integral(&frame, None).expect("integral");
        assert_eq!(integral, vec![("A".to_owned(), 3600.0 + 1800.0)]);
    }

    #[test]
    fn derivative_uses_central_differences() {
        let labels = vec![ts(0), ts(1), ts(3)];
        let frame = TimeFrame::from_values(TimeIndex::new(labels), vec![("A", vec![0.0, 3600.0, 3.0 * 3600.0])])
            .expect("frame");
        let derivative = time_derivative(&frame, None).expect("derivative");
        let values = derivative.column("A").expect("A").values();
        for value in values {
            assert!((value - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn detection_rates() {
        let observed = mask(&[false, true, false, true, true]);
        let actual = mask(&[false, false, true, true, true]);
        let pd = probability_of_detection(&observed, &actual, None).expect("pd");
        assert_eq!(pd, vec![("A".to_owned(), 0.5)]);
        let far = false_alarm_rate(&observed, &actual, None).expect("far");
        assert!((far[0].1 - 1.0 / 3.0).abs() < 1e-12);
    }
}
