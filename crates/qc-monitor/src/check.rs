use chrono::TimeDelta;
use qc_columnar::{BitMask, ComparisonOp};
use qc_frame::{MaskFrame, TimeFrame};
use qc_index::TimeIndex;
use qc_types::{Bound, Note, Timestamp};

use crate::QcError;

// ── Data view ──────────────────────────────────────────────────────────

/// The columns a check runs on, with rows outside the time filter blanked.
#[derive(Debug, Clone, PartialEq)]
pub struct DataView {
    frame: TimeFrame,
    included: BitMask,
}

impl DataView {
    /// Blank every cell of `selected` on rows where `included` is false.
    pub fn new(selected: &TimeFrame, included: BitMask) -> Result<Self, QcError> {
        let frame = selected.mask_rows(&included)?;
        Ok(Self { frame, included })
    }

    /// View with every row included.
    pub fn unfiltered(frame: TimeFrame) -> Self {
        let included = BitMask::all_true(frame.len());
        Self { frame, included }
    }

    #[must_use]
    pub fn frame(&self) -> &TimeFrame {
        &self.frame
    }

    #[must_use]
    pub fn included(&self) -> &BitMask {
        &self.included
    }

    #[must_use]
    pub fn index(&self) -> &TimeIndex {
        self.frame.index()
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        self.frame.column_names()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    /// Whether any cell of the view holds a value.
    #[must_use]
    pub fn has_values(&self) -> bool {
        self.frame
            .iter_columns()
            .any(|(_, column)| column.count_valid() > 0)
    }

    /// First and last included timestamps.
    #[must_use]
    pub fn included_bounds(&self) -> Option<(Timestamp, Timestamp)> {
        let labels = self.frame.index().labels();
        let mut kept = self
            .included
            .bits()
            .zip(labels)
            .filter_map(|(keep, ts)| keep.then_some(*ts));
        let first = kept.next()?;
        let last = kept.last().unwrap_or(first);
        Some((first, last))
    }

    /// Time between the first and last included rows.
    #[must_use]
    pub fn filtered_span(&self) -> Option<TimeDelta> {
        self.included_bounds().map(|(first, last)| last - first)
    }

    pub(crate) fn require_values(&self, test: &str) -> Result<(), QcError> {
        if self.has_values() {
            Ok(())
        } else {
            Err(QcError::insufficient(test, "no data to evaluate"))
        }
    }

    pub(crate) fn require_span(&self, test: &str, window: TimeDelta) -> Result<(), QcError> {
        self.require_span_since(test, window, None)
    }

    /// As [`DataView::require_span`], counting from `since` when it is
    /// earlier than the first included row.
    pub(crate) fn require_span_since(
        &self,
        test: &str,
        window: TimeDelta,
        since: Option<Timestamp>,
    ) -> Result<(), QcError> {
        let covered = self.included_bounds().map(|(first, last)| {
            let start = since.map_or(first, |since| since.min(first));
            last - start
        });
        match covered {
            Some(span) if window <= span => Ok(()),
            _ => Err(QcError::insufficient(
                test,
                format!(
                    "window of {}s is longer than the data",
                    window.num_milliseconds() as f64 / 1e3
                ),
            )),
        }
    }
}

// ── Check outcomes ─────────────────────────────────────────────────────

/// Cells failing one criterion, labelled with the error flag reported for
/// them.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub error_flag: String,
    /// `true` = failed; aligned with the view.
    pub failures: MaskFrame,
}

impl Finding {
    #[must_use]
    pub fn new(error_flag: impl Into<String>, failures: MaskFrame) -> Self {
        Self {
            error_flag: error_flag.into(),
            failures,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckOutcome {
    pub findings: Vec<Finding>,
    pub metadata: Option<TimeFrame>,
    /// Cells to replace with the missing sentinel in the session data.
    pub blanked: Option<MaskFrame>,
    /// Adjustments the check made on its own, reported with the call.
    pub notes: Vec<Note>,
}

impl CheckOutcome {
    #[must_use]
    pub fn from_findings(findings: Vec<Finding>) -> Self {
        Self {
            findings,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: TimeFrame) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn with_notes(mut self, notes: Vec<Note>) -> Self {
        self.notes = notes;
        self
    }
}

/// A quality control test as the session runs it.
///
/// Built-in static tests, the streaming engine and injected functions all
/// go through this one signature; `history` carries cleaned data from a
/// previous session where the check can use it.
pub trait QualityCheck {
    fn name(&self) -> &str;

    fn evaluate(
        &mut self,
        view: &DataView,
        history: Option<&TimeFrame>,
    ) -> Result<CheckOutcome, QcError>;
}

// ── Bound helpers ──────────────────────────────────────────────────────

/// Lower then upper bound findings over a frame of test statistics.
pub(crate) fn bound_findings(
    values: &TimeFrame,
    bound: &Bound,
    prefix: &str,
) -> Result<Vec<Finding>, QcError> {
    let mut findings = Vec::with_capacity(2);
    let sides = [
        (bound.lower, bound.lower_flag(prefix), ComparisonOp::Lt),
        (bound.upper, bound.upper_flag(prefix), ComparisonOp::Gt),
    ];
    for (limit, flag, op) in sides {
        let (Some(limit), Some(flag)) = (limit, flag) else {
            continue;
        };
        let columns = values
            .iter_columns()
            .map(|(name, column)| (name.to_owned(), column.compare_scalar(limit, op)))
            .collect();
        findings.push(Finding::new(
            flag,
            MaskFrame::new(values.index().clone(), columns)?,
        ));
    }
    Ok(findings)
}
