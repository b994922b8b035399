use qc_columnar::BitMask;
use qc_frame::{MaskFrame, TimeFrame};
use qc_index::TimeIndex;
use qc_types::{FailureRecord, Note, Timestamp};
use tracing::{debug, warn};

use crate::QcError;
use crate::grouper::group_failures;

/// Cumulative state of one session: per-cell failure flags, the failure
/// log and the notes.
///
/// Failure flags only ever go from unset to set; records are only appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulator {
    failed: MaskFrame,
    test_results: Vec<FailureRecord>,
    notes: Vec<Note>,
}

impl Accumulator {
    #[must_use]
    pub fn new(index: TimeIndex, columns: &[String]) -> Self {
        Self {
            failed: MaskFrame::filled(index, columns, false),
            test_results: Vec::new(),
            notes: Vec::new(),
        }
    }

    /// Follow the data onto a new index or column set; cells that did not
    /// exist before start un-failed.
    pub fn realign(&mut self, index: TimeIndex, columns: &[String]) {
        self.failed = self.failed.realign(index, columns, false);
    }

    /// Apply one finding: set every failed cell and log runs of at least
    /// `min_failures`, column by column.
    pub fn merge(
        &mut self,
        error_flag: &str,
        failures: &MaskFrame,
        min_failures: usize,
    ) -> Result<Vec<FailureRecord>, QcError> {
        if failures.index() != self.failed.index() {
            return Err(QcError::InvalidInput(
                "failure flags are not aligned with the session data".to_owned(),
            ));
        }
        let labels = failures.index().labels().to_vec();
        let mut appended = Vec::new();
        for (name, bits) in failures.iter_columns() {
            if !bits.any() {
                continue;
            }
            self.failed.or_column(name, bits)?;
            appended.extend(group_failures(
                &labels,
                bits,
                min_failures,
                Some(name),
                error_flag,
            ));
        }
        debug!(flag = error_flag, records = appended.len(), "merged test results");
        self.test_results.extend(appended.iter().cloned());
        Ok(appended)
    }

    /// Log index-level failures; these carry no variable name and touch no
    /// cell flags.
    pub fn merge_index_level(
        &mut self,
        labels: &[Timestamp],
        failures: &BitMask,
        error_flag: &str,
        min_failures: usize,
    ) -> Vec<FailureRecord> {
        let appended = group_failures(labels, failures, min_failures, None, error_flag);
        debug!(flag = error_flag, records = appended.len(), "merged timestamp results");
        self.test_results.extend(appended.iter().cloned());
        appended
    }

    pub fn push_note(&mut self, note: Note) {
        warn!("{note}");
        self.notes.push(note);
    }

    #[must_use]
    pub fn failed(&self) -> &MaskFrame {
        &self.failed
    }

    #[must_use]
    pub fn test_results(&self) -> &[FailureRecord] {
        &self.test_results
    }

    #[must_use]
    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    /// `true` where a cell has a value and passed every test so far.
    pub fn mask(&self, data: &TimeFrame) -> Result<MaskFrame, QcError> {
        pass_mask(data, &self.failed)
    }

    /// Data with every cell outside [`Accumulator::mask`] set missing.
    pub fn cleaned(&self, data: &TimeFrame) -> Result<TimeFrame, QcError> {
        Ok(data.where_mask(&self.mask(data)?)?)
    }
}

/// `!failed && !missing`, cell by cell over the data's columns.
pub(crate) fn pass_mask(data: &TimeFrame, failed: &MaskFrame) -> Result<MaskFrame, QcError> {
    let mut columns = Vec::with_capacity(data.num_columns());
    for (name, column) in data.iter_columns() {
        let present = column.validity();
        let pass = match failed.column(name) {
            Some(bits) if bits.len() == present.len() => present.and_mask(&bits.not_mask()),
            Some(_) => {
                return Err(QcError::InvalidInput(format!(
                    "failure flags for '{name}' are not aligned with the data"
                )));
            }
            None => present,
        };
        columns.push((name.to_owned(), pass));
    }
    Ok(MaskFrame::new(data.index().clone(), columns)?)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use qc_columnar::{BitMask, Column};
    use qc_frame::{MaskFrame, TimeFrame};
    use qc_index::TimeIndex;
    use qc_types::{Note, NoteKind, Timestamp};

    use super::Accumulator;

    fn ts(h: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2015, 1, 1)
            .and_then(|d| d.and_hms_opt(h, 0, 0))
            .expect("valid timestamp")
    }

    fn data() -> TimeFrame {
        TimeFrame::from_values(
            TimeIndex::new((0..4).map(ts).collect()),
            vec![("A", vec![1.0, 2.0, f64::NAN, 4.0]), ("B", vec![5.0; 4])],
        )
        .expect("frame")
    }

    fn names(data: &TimeFrame) -> Vec<String> {
        data.column_names().to_vec()
    }

    #[test]
    fn mask_combines_failures_and_missing_values() {
        let data = data();
        let mut acc = Accumulator::new(data.index().clone(), &names(&data));
        let failures = MaskFrame::new(
            data.index().clone(),
            vec![("B".to_owned(), BitMask::from_bools(&[false, true, true, false]))],
        )
        .expect("failures");
        let records = acc.merge("Data > upper bound, 4", &failures, 1).expect("merge");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timesteps, 2);

        let mask = acc.mask(&data).expect("mask");
        assert_eq!(
            mask.column("A").map(BitMask::to_vec),
            Some(vec![true, true, false, true])
        );
        assert_eq!(
            mask.column("B").map(BitMask::to_vec),
            Some(vec![true, false, false, true])
        );
        let cleaned = acc.cleaned(&data).expect("cleaned");
        assert_eq!(
            cleaned.column("B"),
            Some(&Column::new(vec![5.0, f64::NAN, f64::NAN, 5.0]))
        );
    }

    #[test]
    fn short_runs_mark_mask_without_records() {
        let data = data();
        let mut acc = Accumulator::new(data.index().clone(), &names(&data));
        let failures = MaskFrame::new(
            data.index().clone(),
            vec![("A".to_owned(), BitMask::from_bools(&[true, false, false, false]))],
        )
        .expect("failures");
        let records = acc.merge("flag", &failures, 2).expect("merge");
        assert!(records.is_empty());
        assert!(acc.test_results().is_empty());
        assert!(!acc.mask(&data).expect("mask").get("A", 0));
    }

    #[test]
    fn repeated_merges_duplicate_records_only() {
        let data = data();
        let mut acc = Accumulator::new(data.index().clone(), &names(&data));
        let failures = MaskFrame::new(
            data.index().clone(),
            vec![("A".to_owned(), BitMask::from_bools(&[false, true, false, false]))],
        )
        .expect("failures");
        acc.merge("flag", &failures, 1).expect("first");
        let first = acc.mask(&data).expect("mask");
        acc.merge("flag", &failures, 1).expect("second");
        assert_eq!(acc.mask(&data).expect("mask"), first);
        assert_eq!(acc.test_results().len(), 2);
        assert_eq!(acc.test_results()[0], acc.test_results()[1]);
    }

    #[test]
    fn realign_keeps_flags_and_adds_clean_cells() {
        let data = data();
        let mut acc = Accumulator::new(data.index().clone(), &names(&data));
        let failures = MaskFrame::new(
            data.index().clone(),
            vec![("A".to_owned(), BitMask::from_bools(&[true, false, false, false]))],
        )
        .expect("failures");
        acc.merge("flag", &failures, 1).expect("merge");
        let index = TimeIndex::new((0..5).map(ts).collect());
        acc.realign(index, &["A".to_owned(), "B".to_owned(), "C".to_owned()]);
        assert!(acc.failed().get("A", 0));
        assert!(!acc.failed().get("A", 4));
        assert!(!acc.failed().get("C", 0));
    }

    #[test]
    fn misaligned_failures_are_rejected() {
        let data = data();
        let mut acc = Accumulator::new(data.index().clone(), &names(&data));
        let other = MaskFrame::filled(TimeIndex::new(vec![ts(9)]), &names(&data), true);
        assert!(acc.merge("flag", &other, 1).is_err());
        acc.push_note(Note::new("range", NoteKind::InsufficientData, "no data"));
        assert_eq!(acc.notes().len(), 1);
    }
}
