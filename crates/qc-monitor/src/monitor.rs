use std::collections::BTreeMap;

use qc_columnar::BitMask;
use qc_expr::{EvalContext, Expr, evaluate, parse_formula};
use qc_frame::{MaskFrame, TimeFrame};
use qc_index::{AuditOptions, IndexError, audit_timestamps};
use qc_types::{FailureRecord, Note, NoteKind, span_from_seconds};
use tracing::{debug, info};

use crate::accumulator::{Accumulator, pass_mask};
use crate::check::{DataView, QualityCheck};
use crate::plan::{
    CorruptTest, CustomTest, DeltaTest, IncrementTest, MissingTest, OutlierTest, QcPlan,
    RangeTest, TestSpec, TimestampTest,
};
use crate::static_tests::{
    CorruptCheck, CustomStaticCheck, DeltaCheck, IncrementCheck, MissingCheck, OutlierCheck,
    RangeCheck, StaticOutput,
};
use crate::streaming::{
    CustomStreamingCheck, History, Point, PointOutcome, StreamingEngine, StreamingOutlierCheck,
};
use crate::time_filter::TimeFilter;
use crate::translation::Translation;
use crate::{DUPLICATE_TIMESTAMP, MISSING_TIMESTAMP, NONMONOTONIC_TIMESTAMP, QcError};

/// What one test call produced.
///
/// `mask` and `cleaned_data` cover the tested columns and reflect this call
/// only; the session keeps the cumulative versions.
#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    pub test: String,
    pub records: Vec<FailureRecord>,
    pub mask: MaskFrame,
    pub cleaned_data: TimeFrame,
    pub metadata: Option<TimeFrame>,
    pub notes: Vec<Note>,
}

/// One monitoring session.
///
/// Tests run in call order and each observes the data and failure state
/// left by the previous ones. A call that returns `Err` leaves the session
/// as it was.
#[derive(Debug, Clone, Default)]
pub struct Monitor {
    data: TimeFrame,
    translation: Translation,
    time_filter: Option<TimeFilter>,
    constants: BTreeMap<String, f64>,
    prior_history: Option<TimeFrame>,
    accumulator: Accumulator,
    tests_run: usize,
}

impl Monitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Configuration ──────────────────────────────────────────────────

    /// Merge a frame into the working data.
    ///
    /// The first frame is stored as given. Later frames are merged on the
    /// sorted union of timestamps, newer non-missing cells winning. Every
    /// new column gets an identity translation entry.
    pub fn add_data(&mut self, frame: TimeFrame) -> Result<(), QcError> {
        if frame.num_columns() == 0 {
            return Err(QcError::InvalidInput("frame has no columns".to_owned()));
        }
        let merged = if self.data.num_columns() == 0 {
            frame
        } else {
            self.data.combine_newest(&frame)?
        };
        let added: Vec<String> = merged
            .column_names()
            .iter()
            .filter(|name| !self.data.contains_column(name))
            .cloned()
            .collect();
        for name in added {
            self.translation.insert(name.clone(), vec![name]);
        }
        debug!(rows = merged.len(), columns = merged.num_columns(), "data added");
        self.data = merged;
        self.accumulator
            .realign(self.data.index().clone(), self.data.column_names());
        Ok(())
    }

    pub fn add_translation<K, I, V>(&mut self, dict: I)
    where
        I: IntoIterator<Item = (K, Vec<V>)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.translation.merge(dict);
    }

    /// Named constant usable in formulas.
    pub fn add_constant(&mut self, name: impl Into<String>, value: f64) {
        self.constants.insert(name.into(), value);
    }

    pub fn add_time_filter(&mut self, filter: TimeFilter) {
        self.time_filter = Some(filter);
    }

    /// Use a boolean formula over the current data as the time filter.
    pub fn add_time_filter_expr(&mut self, expr: &Expr) -> Result<(), QcError> {
        self.require_data()?;
        let context = EvalContext::new(&self.data)
            .with_groups(self.translation.groups())
            .with_constants(&self.constants);
        let filter = TimeFilter::from_expr(expr, &context, self.data.index())?;
        self.time_filter = Some(filter);
        Ok(())
    }

    /// Evaluate `expr` over the data and add its output as new columns under
    /// the translation key `name`.
    pub fn add_composite_signal(&mut self, name: &str, expr: &Expr) -> Result<(), QcError> {
        self.require_data()?;
        let columns = {
            let context = EvalContext::new(&self.data)
                .with_groups(self.translation.groups())
                .with_constants(&self.constants);
            evaluate(expr, &context)?.into_columns(self.data.len())?
        };
        let names: Vec<String> = if columns.len() == 1 {
            vec![name.to_owned()]
        } else {
            (0..columns.len()).map(|i| format!("{name} {i}")).collect()
        };
        for (column_name, column) in names.iter().zip(columns) {
            self.data.insert_column(column_name.clone(), column)?;
        }
        self.translation.insert(name, names);
        self.accumulator
            .realign(self.data.index().clone(), self.data.column_names());
        Ok(())
    }

    /// Cleaned data from an earlier session, used to seed streaming windows.
    pub fn add_prior_history(&mut self, history: TimeFrame) {
        self.prior_history = Some(history);
    }

    // ── Accessors ──────────────────────────────────────────────────────

    #[must_use]
    pub fn data(&self) -> &TimeFrame {
        &self.data
    }

    #[must_use]
    pub fn translation(&self) -> &Translation {
        &self.translation
    }

    #[must_use]
    pub fn time_filter(&self) -> Option<&TimeFilter> {
        self.time_filter.as_ref()
    }

    #[must_use]
    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    #[must_use]
    pub fn test_results(&self) -> &[FailureRecord] {
        self.accumulator.test_results()
    }

    #[must_use]
    pub fn notes(&self) -> &[Note] {
        self.accumulator.notes()
    }

    #[must_use]
    pub fn tests_run(&self) -> usize {
        self.tests_run
    }

    /// Cumulative mask: `true` where a cell has a value and passed every
    /// test so far.
    pub fn mask(&self) -> Result<MaskFrame, QcError> {
        self.accumulator.mask(&self.data)
    }

    pub fn cleaned_data(&self) -> Result<TimeFrame, QcError> {
        self.accumulator.cleaned(&self.data)
    }

    // ── Tests ──────────────────────────────────────────────────────────

    /// Audit the raw index and replace it with the normalized one.
    ///
    /// Only allowed before any other test: it is the one call that
    /// restructures the data.
    pub fn check_timestamp(&mut self, params: &TimestampTest) -> Result<TestReport, QcError> {
        info!("check timestamp");
        if self.tests_run > 0 {
            return Err(QcError::Configuration(
                "the timestamp check must run before any other test".to_owned(),
            ));
        }
        self.require_data()?;
        let options = AuditOptions {
            frequency: span_from_seconds(params.frequency)?,
            expected_start: params.expected_start,
            expected_end: params.expected_end,
            exact_times: params.exact_times,
        };
        let audit = audit_timestamps(self.data.index(), &options).map_err(|err| match err {
            IndexError::Empty => QcError::InvalidInput("data has no timestamps".to_owned()),
            other => QcError::Configuration(other.to_string()),
        })?;
        let data = self.data.take_rows(audit.index.clone(), &audit.rows)?;

        let min = params.min_failures;
        let mut records = self.accumulator.merge_index_level(
            audit.raw.labels(),
            &BitMask::from_bools(&audit.nonmonotonic),
            NONMONOTONIC_TIMESTAMP,
            min,
        );
        records.extend(self.accumulator.merge_index_level(
            audit.unique.labels(),
            &BitMask::from_bools(&audit.duplicated),
            DUPLICATE_TIMESTAMP,
            min,
        ));
        records.extend(self.accumulator.merge_index_level(
            audit.expected.labels(),
            &BitMask::from_bools(&audit.missing),
            MISSING_TIMESTAMP,
            min,
        ));

        let mut notes = Vec::new();
        if audit.off_grid > 0 {
            let note = Note::new(
                "timestamp",
                NoteKind::DataAdjusted,
                format!(
                    "{} timestamps off the expected grid were dropped",
                    audit.off_grid
                ),
            );
            self.accumulator.push_note(note.clone());
            notes.push(note);
        }

        self.data = data;
        self.accumulator
            .realign(self.data.index().clone(), self.data.column_names());
        self.tests_run += 1;

        let none_failed =
            MaskFrame::filled(self.data.index().clone(), self.data.column_names(), false);
        let mask = pass_mask(&self.data, &none_failed)?;
        Ok(TestReport {
            test: "timestamp".to_owned(),
            records,
            mask,
            cleaned_data: self.data.clone(),
            metadata: None,
            notes,
        })
    }

    pub fn check_missing(&mut self, params: &MissingTest) -> Result<TestReport, QcError> {
        info!("check for missing data");
        self.require_data()?;
        let mut check = MissingCheck::skipping(self.reported_missing_rows()?);
        self.run_check(&mut check, params.key.as_deref(), params.min_failures)
    }

    pub fn check_corrupt(&mut self, params: &CorruptTest) -> Result<TestReport, QcError> {
        info!("check for corrupt data");
        let mut check = CorruptCheck::new(params.values.clone());
        self.run_check(&mut check, params.key.as_deref(), params.min_failures)
    }

    pub fn check_range(&mut self, params: &RangeTest) -> Result<TestReport, QcError> {
        info!("check for data outside expected range");
        let mut check = RangeCheck::new(params.bound)?;
        self.run_check(&mut check, params.key.as_deref(), params.min_failures)
    }

    pub fn check_increment(&mut self, params: &IncrementTest) -> Result<TestReport, QcError> {
        info!("check for data increment outside expected range");
        let mut check = IncrementCheck::new(params.bound, params.increment, params.absolute_value)?;
        self.run_check(&mut check, params.key.as_deref(), params.min_failures)
    }

    pub fn check_delta(&mut self, params: &DeltaTest) -> Result<TestReport, QcError> {
        info!("check for stagnant data and abrupt changes using delta within a rolling window");
        let window = span_from_seconds(params.window)?;
        let mut check = DeltaCheck::new(params.bound, window, params.direction)?;
        self.run_check(&mut check, params.key.as_deref(), params.min_failures)
    }

    pub fn check_outlier(&mut self, params: &OutlierTest) -> Result<TestReport, QcError> {
        info!(streaming = params.streaming, "check for outliers");
        let window = params.window.map(span_from_seconds).transpose()?;
        if params.streaming {
            let window = window.ok_or_else(|| {
                QcError::Configuration("streaming outlier detection requires a window".to_owned())
            })?;
            let engine = StreamingEngine::new(window, params.rebase)?;
            let mut check = StreamingOutlierCheck::new(params.bound, engine, params.absolute_value)?;
            self.run_check(&mut check, params.key.as_deref(), params.min_failures)
        } else {
            let mut check = OutlierCheck::new(params.bound, window, params.absolute_value)?;
            self.run_check(&mut check, params.key.as_deref(), params.min_failures)
        }
    }

    /// Run an injected function over the whole view. It returns `true` for
    /// cells that pass, with the view's shape.
    pub fn check_custom_static<F>(&mut self, params: &CustomTest, func: F) -> Result<TestReport, QcError>
    where
        F: FnMut(&TimeFrame) -> Result<StaticOutput, String>,
    {
        info!(function = %params.error_message, "check custom static function");
        let mut check = CustomStaticCheck::new(params.error_message.clone(), func);
        self.run_check(&mut check, params.key.as_deref(), params.min_failures)
    }

    /// Run an injected point function with streaming exclusion of failed
    /// points.
    pub fn check_custom_streaming<F>(&mut self, params: &CustomTest, func: F) -> Result<TestReport, QcError>
    where
        F: FnMut(&Point, &History<'_>) -> Result<PointOutcome, String>,
    {
        info!(function = %params.error_message, "check custom streaming function");
        let window = params.window.ok_or_else(|| {
            QcError::Configuration("streaming functions require a window".to_owned())
        })?;
        let engine = StreamingEngine::new(span_from_seconds(window)?, params.rebase)?;
        let mut check = CustomStreamingCheck::new(params.error_message.clone(), engine, func);
        self.run_check(&mut check, params.key.as_deref(), params.min_failures)
    }

    /// Run one built-in test.
    pub fn run_test(&mut self, spec: &TestSpec) -> Result<TestReport, QcError> {
        match spec {
            TestSpec::Timestamp(params) => self.check_timestamp(params),
            TestSpec::Missing(params) => self.check_missing(params),
            TestSpec::Corrupt(params) => self.check_corrupt(params),
            TestSpec::Range(params) => self.check_range(params),
            TestSpec::Delta(params) => self.check_delta(params),
            TestSpec::Increment(params) => self.check_increment(params),
            TestSpec::Outlier(params) => self.check_outlier(params),
        }
    }

    /// Apply a plan's configuration, then run its tests in order.
    pub fn run_plan(&mut self, plan: &QcPlan) -> Result<Vec<TestReport>, QcError> {
        self.translation.merge(plan.translation.groups().clone());
        self.constants
            .extend(plan.constants.iter().map(|(k, v)| (k.clone(), *v)));
        for signal in &plan.composite_signals {
            let expr = parse_formula(&signal.formula)?;
            self.add_composite_signal(&signal.name, &expr)?;
        }
        if let Some(formula) = &plan.time_filter {
            let expr = parse_formula(formula)?;
            self.add_time_filter_expr(&expr)?;
        }
        plan.tests.iter().map(|spec| self.run_test(spec)).collect()
    }

    /// Run any check over the columns behind `key` (all columns when
    /// `None`), merging its findings into the session.
    ///
    /// Insufficient data and injected function failures become notes and
    /// the call reports no failures.
    pub fn run_check(
        &mut self,
        check: &mut dyn QualityCheck,
        key: Option<&str>,
        min_failures: usize,
    ) -> Result<TestReport, QcError> {
        self.require_data()?;
        let columns = self.columns_for(key)?;
        let included = self.included();
        let view = DataView::new(&self.data.select(&columns)?, included.clone())?;
        let test = check.name().to_owned();

        let outcome = match check.evaluate(&view, self.prior_history.as_ref()) {
            Ok(outcome) => outcome,
            Err(err) => {
                let Some(note) = note_for(&test, key, &err) else {
                    return Err(err);
                };
                self.accumulator.push_note(note.clone());
                self.tests_run += 1;
                let selected = self.data.select(&columns)?;
                let none_failed = MaskFrame::filled(selected.index().clone(), &columns, false);
                let mask = pass_mask(&selected, &none_failed)?;
                return Ok(TestReport {
                    test,
                    records: Vec::new(),
                    cleaned_data: selected.where_mask(&mask)?,
                    mask,
                    metadata: None,
                    notes: vec![note],
                });
            }
        };
        for finding in &outcome.findings {
            if finding.failures.index() != view.index() {
                return Err(QcError::InvalidInput(format!(
                    "{test} produced results on a different index"
                )));
            }
        }

        if let Some(blanked) = &outcome.blanked {
            for (name, bits) in blanked.iter_columns() {
                let keep = bits.and_mask(&included).not_mask();
                if let Some(column) = self.data.column_mut(name) {
                    *column = column.where_mask(&keep);
                }
            }
        }

        let mut call_failed = MaskFrame::filled(view.index().clone(), &columns, false);
        let mut records = Vec::new();
        for finding in &outcome.findings {
            let mut failures = MaskFrame::filled(view.index().clone(), &[], false);
            for (name, bits) in finding.failures.iter_columns() {
                failures.insert_column(name, bits.and_mask(&included))?;
            }
            for (name, bits) in failures.iter_columns() {
                call_failed.or_column(name, bits)?;
            }
            records.extend(
                self.accumulator
                    .merge(&finding.error_flag, &failures, min_failures)?,
            );
        }
        for note in &outcome.notes {
            self.accumulator.push_note(note.clone());
        }
        self.tests_run += 1;

        let selected = self.data.select(&columns)?;
        let mask = pass_mask(&selected, &call_failed)?;
        Ok(TestReport {
            test,
            records,
            cleaned_data: selected.where_mask(&mask)?,
            mask,
            metadata: outcome.metadata,
            notes: outcome.notes,
        })
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn require_data(&self) -> Result<(), QcError> {
        if self.data.num_columns() == 0 || self.data.is_empty() {
            return Err(QcError::InvalidInput("no data has been added".to_owned()));
        }
        Ok(())
    }

    fn columns_for(&self, key: Option<&str>) -> Result<Vec<String>, QcError> {
        let Some(key) = key else {
            return Ok(self.data.column_names().to_vec());
        };
        let columns = self.translation.resolve(key)?;
        if let Some(absent) = columns.iter().find(|c| !self.data.contains_column(c)) {
            return Err(QcError::Configuration(format!(
                "column '{absent}' of key '{key}' is not in the data"
            )));
        }
        Ok(columns.to_vec())
    }

    fn included(&self) -> BitMask {
        match &self.time_filter {
            Some(filter) => filter.aligned(self.data.index()),
            None => BitMask::all_true(self.data.len()),
        }
    }

    /// Rows inside reported missing-timestamp runs.
    fn reported_missing_rows(&self) -> Result<BitMask, QcError> {
        let mut rows = BitMask::all_false(self.data.len());
        let reported = self
            .accumulator
            .test_results()
            .iter()
            .filter(|r| r.variable_name.is_none() && r.error_flag == MISSING_TIMESTAMP);
        for record in reported {
            let span = self
                .data
                .index()
                .positions_between(record.start_time, record.end_time)?;
            if !span.is_empty() {
                rows.set_range(span.start, span.end - 1, true);
            }
        }
        Ok(rows)
    }
}

fn note_for(test: &str, key: Option<&str>, err: &QcError) -> Option<Note> {
    let note = match err {
        QcError::InsufficientData { message, .. } => {
            Note::new(test, NoteKind::InsufficientData, message.clone())
        }
        QcError::CustomFunction { name, message } => {
            Note::new(test, NoteKind::CustomFunction, format!("{name}: {message}"))
        }
        _ => return None,
    };
    Some(match key {
        Some(key) => note.for_variable(key),
        None => note,
    })
}
