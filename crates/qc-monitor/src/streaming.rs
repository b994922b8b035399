//! Point-by-point evaluation against a history of clean observations.
//!
//! A point that fails is removed from the clean data, so it never enters the
//! history of a later point. When too much of a column's window has been
//! removed, the window is rebased onto the raw values.

use chrono::TimeDelta;
use qc_columnar::{BitMask, Column};
use qc_frame::{MaskFrame, TimeFrame};
use qc_index::TimeIndex;
use qc_types::{Bound, Note, NoteKind, Timestamp, nanmean, nanstd};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::QcError;
use crate::check::{CheckOutcome, DataView, Finding, QualityCheck, bound_findings};
use crate::static_tests::outlier_prefix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// Filling the first window; no point is judged yet.
    Initializing,
    Evaluating,
    /// Restoring raw values into a window that lost too many points.
    Rebasing,
}

/// One row handed to a point check.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub timestamp: Timestamp,
    pub names: Vec<String>,
    pub values: Vec<f64>,
}

impl Point {
    #[must_use]
    pub fn value(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|pos| self.values.get(pos).copied())
    }
}

/// Verdict on one point, column by column: `true` = passed.
#[derive(Debug, Clone, PartialEq)]
pub struct PointOutcome {
    pub pass: Vec<bool>,
    pub metadata: Vec<f64>,
}

/// Clean observations preceding a point, borrowed from the engine's
/// working buffers. Failed points read as missing.
#[derive(Debug, Clone, Copy)]
pub struct History<'a> {
    labels: &'a [Timestamp],
    names: &'a [String],
    columns: &'a [Vec<f64>],
    start: usize,
    end: usize,
}

impl<'a> History<'a> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[must_use]
    pub fn labels(&self) -> &'a [Timestamp] {
        &self.labels[self.start..self.end]
    }

    #[must_use]
    pub fn column_names(&self) -> &'a [String] {
        self.names
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&'a [f64]> {
        let pos = self.names.iter().position(|n| n == name)?;
        self.columns.get(pos).map(|values| &values[self.start..self.end])
    }

    /// Owned copy of the window.
    pub fn to_frame(&self) -> Result<TimeFrame, QcError> {
        let columns = self
            .names
            .iter()
            .zip(self.columns)
            .map(|(name, values)| (name.clone(), Column::new(values[self.start..self.end].to_vec())))
            .collect();
        Ok(TimeFrame::new(TimeIndex::new(self.labels().to_vec()), columns)?)
    }
}

pub trait PointCheck {
    fn name(&self) -> &str;

    fn evaluate_point(&mut self, point: &Point, history: &History<'_>) -> Result<PointOutcome, QcError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    /// `true` = failed; aligned with the evaluated view.
    pub failures: MaskFrame,
    /// Per-point metadata; missing on rows that were not evaluated.
    pub metadata: TimeFrame,
    /// Rebases per column, in view column order.
    pub rebases: Vec<(String, usize)>,
    pub evaluated: usize,
    pub state: StreamState,
}

impl StreamOutcome {
    #[must_use]
    pub fn rebase_count(&self) -> usize {
        self.rebases.iter().map(|(_, n)| n).sum()
    }

    /// One note per column whose history was rebased.
    #[must_use]
    pub fn rebase_notes(&self, test: &str) -> Vec<Note> {
        self.rebases
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(name, n)| {
                Note::new(
                    test,
                    NoteKind::DataAdjusted,
                    format!("history rebased onto raw values {n} time(s)"),
                )
                .for_variable(name.clone())
            })
            .collect()
    }
}

// ── Engine ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StreamingEngine {
    window: TimeDelta,
    rebase: Option<f64>,
    prior: Option<TimeFrame>,
}

impl StreamingEngine {
    pub fn new(window: TimeDelta, rebase: Option<f64>) -> Result<Self, QcError> {
        if window <= TimeDelta::zero() {
            return Err(QcError::Configuration("window must be positive".to_owned()));
        }
        if let Some(threshold) = rebase {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(QcError::Configuration(format!(
                    "rebase threshold must be within [0, 1], found {threshold}"
                )));
            }
        }
        Ok(Self {
            window,
            rebase,
            prior: None,
        })
    }

    /// Seed the first windows with cleaned data from an earlier session.
    #[must_use]
    pub fn with_prior_history(mut self, history: TimeFrame) -> Self {
        self.prior = Some(history);
        self
    }

    #[must_use]
    pub fn window(&self) -> TimeDelta {
        self.window
    }

    /// Prior rows strictly before the view, with the view's columns.
    fn seed(&self, view: &DataView, prior: Option<&TimeFrame>) -> Result<TimeFrame, QcError> {
        let empty = TimeIndex::new(Vec::new());
        let (Some(prior), Some(first)) = (prior.or(self.prior.as_ref()), view.index().first()) else {
            let mut seed = TimeFrame::empty(empty);
            for name in view.column_names() {
                seed.insert_column(name.clone(), Column::missing(0))?;
            }
            return Ok(seed);
        };
        let cut = prior
            .index()
            .first_at_or_after(first)
            .map_err(|err| QcError::Configuration(format!("prior history: {err}")))?;
        let rows: Vec<Option<usize>> = (0..cut).map(Some).collect();
        let index = prior.index().slice(0, cut);
        let mut seed = TimeFrame::empty(index);
        for name in view.column_names() {
            let column = match prior.column(name) {
                Some(column) => column.take(&rows),
                None => Column::missing(cut),
            };
            seed.insert_column(name.clone(), column)?;
        }
        Ok(seed)
    }

    pub fn run(
        &self,
        view: &DataView,
        prior: Option<&TimeFrame>,
        check: &mut dyn PointCheck,
    ) -> Result<StreamOutcome, QcError> {
        let seed = self.seed(view, prior)?;
        view.require_span_since(check.name(), self.window, seed.index().first())?;
        let offset = seed.len();
        let labels: Vec<Timestamp> = seed
            .index()
            .labels()
            .iter()
            .chain(view.index().labels())
            .copied()
            .collect();
        let index = TimeIndex::new(labels);
        if !index.is_strictly_increasing() {
            return Err(QcError::Configuration(
                "streaming analysis requires a strictly increasing index".to_owned(),
            ));
        }

        let names = view.column_names().to_vec();
        let raw: Vec<Vec<f64>> = names
            .iter()
            .map(|name| {
                let head = seed.column(name).map(Column::values).unwrap_or_default();
                let tail = view.frame().column(name).map(Column::values).unwrap_or_default();
                head.iter().chain(tail).copied().collect()
            })
            .collect();
        let mut clean = raw.clone();
        let mut excluded: Vec<BitMask> = names.iter().map(|_| BitMask::all_false(index.len())).collect();
        let mut failures: Vec<BitMask> = names.iter().map(|_| BitMask::all_false(view.len())).collect();
        let mut metadata: Vec<Vec<f64>> = names.iter().map(|_| vec![f64::NAN; view.len()]).collect();

        let mut state = StreamState::Initializing;
        let mut rebases = vec![0_usize; names.len()];
        let mut evaluated = 0;
        let start = match index.first() {
            Some(first) => index.first_at_or_after(first + self.window)?.max(offset),
            None => index.len(),
        };

        for t in start..index.len() {
            if !view.included().get(t - offset) {
                continue;
            }
            if state != StreamState::Evaluating {
                debug!(from = ?state, to = ?StreamState::Evaluating, "stream state change");
                state = StreamState::Evaluating;
            }
            let Some(now) = index.get(t) else { break };
            let t_start = index.nearest(now - self.window)?.min(t);

            let history = History {
                labels: index.labels(),
                names: &names,
                columns: &clean,
                start: t_start,
                end: t,
            };
            let point = Point {
                timestamp: now,
                names: names.clone(),
                values: clean.iter().map(|values| values[t]).collect(),
            };

            let outcome = check.evaluate_point(&point, &history)?;
            if outcome.pass.len() != names.len() || outcome.metadata.len() != names.len() {
                return Err(QcError::custom(
                    check.name(),
                    format!(
                        "point result has {} flags and {} metadata values, expected {}",
                        outcome.pass.len(),
                        outcome.metadata.len(),
                        names.len()
                    ),
                ));
            }
            evaluated += 1;

            for (col, passed) in outcome.pass.iter().enumerate() {
                metadata[col][t - offset] = outcome.metadata[col];
                if !passed {
                    failures[col].set(t - offset, true);
                    excluded[col].set(t, true);
                    clean[col][t] = f64::NAN;
                }
            }

            let Some(threshold) = self.rebase else { continue };
            let span = t + 1 - t_start;
            for col in 0..names.len() {
                let removed = (t_start..=t).filter(|&row| excluded[col].get(row)).count();
                if removed as f64 / span as f64 > threshold {
                    state = StreamState::Rebasing;
                    for row in t_start..=t {
                        if excluded[col].get(row) {
                            clean[col][row] = raw[col][row];
                            excluded[col].set(row, false);
                        }
                    }
                    rebases[col] += 1;
                    debug!(column = %names[col], at = %now, removed, span, "history rebased");
                }
            }
        }

        let failure_columns = names.iter().cloned().zip(failures).collect();
        let metadata_columns = names
            .iter()
            .cloned()
            .zip(metadata.into_iter().map(Column::new))
            .collect();
        debug!(evaluated, ?state, rebases = rebases.iter().sum::<usize>(), "streaming pass finished");
        Ok(StreamOutcome {
            failures: MaskFrame::new(view.index().clone(), failure_columns)?,
            metadata: TimeFrame::new(view.index().clone(), metadata_columns)?,
            rebases: names.into_iter().zip(rebases).collect(),
            evaluated,
            state,
        })
    }
}

// ── Streaming outlier ──────────────────────────────────────────────────

/// Z-score of a point against the mean and sample standard deviation of
/// its clean history. An undefined z-score passes.
#[derive(Debug, Clone, Copy)]
pub struct ZScore {
    bound: Bound,
    absolute_value: bool,
}

impl PointCheck for ZScore {
    fn name(&self) -> &str {
        "streaming outlier"
    }

    fn evaluate_point(&mut self, point: &Point, history: &History<'_>) -> Result<PointOutcome, QcError> {
        let mut pass = Vec::with_capacity(point.values.len());
        let mut metadata = Vec::with_capacity(point.values.len());
        for (name, value) in point.names.iter().zip(&point.values) {
            let past = history.column(name).unwrap_or_default();
            let z = (value - nanmean(past)) / nanstd(past, 1);
            let z = if self.absolute_value { z.abs() } else { z };
            let z = if z.is_finite() { z } else { f64::NAN };
            let below = self.bound.lower.is_some_and(|limit| z < limit);
            let above = self.bound.upper.is_some_and(|limit| z > limit);
            pass.push(!(below || above));
            metadata.push(z);
        }
        Ok(PointOutcome { pass, metadata })
    }
}

pub struct StreamingOutlierCheck {
    engine: StreamingEngine,
    score: ZScore,
}

impl StreamingOutlierCheck {
    pub fn new(bound: Bound, engine: StreamingEngine, absolute_value: bool) -> Result<Self, QcError> {
        bound.validate()?;
        Ok(Self {
            engine,
            score: ZScore {
                bound,
                absolute_value,
            },
        })
    }
}

impl QualityCheck for StreamingOutlierCheck {
    fn name(&self) -> &str {
        "streaming outlier"
    }

    fn evaluate(&mut self, view: &DataView, history: Option<&TimeFrame>) -> Result<CheckOutcome, QcError> {
        view.require_values(self.name())?;
        let outcome = self.engine.run(view, history, &mut self.score)?;
        let notes = outcome.rebase_notes(self.name());
        // split the failures by side using the z-scores behind them
        let findings = bound_findings(
            &outcome.metadata,
            &self.score.bound,
            outlier_prefix(self.score.absolute_value),
        )?
        .into_iter()
        .map(|finding| {
            let columns = finding
                .failures
                .iter_columns()
                .map(|(name, side)| {
                    let failed = outcome.failures.column(name).map_or_else(
                        || BitMask::all_false(side.len()),
                        |bits| bits.and_mask(side),
                    );
                    (name.to_owned(), failed)
                })
                .collect();
            MaskFrame::new(view.index().clone(), columns)
                .map(|failures| Finding::new(finding.error_flag, failures))
        })
        .collect::<Result<Vec<_>, _>>()?;
        Ok(CheckOutcome::from_findings(findings)
            .with_metadata(outcome.metadata)
            .with_notes(notes))
    }
}

// ── Custom streaming ───────────────────────────────────────────────────

/// Wraps an injected `(point, history) -> outcome` function.
pub struct CustomStreamingCheck<F> {
    error_flag: String,
    engine: StreamingEngine,
    func: F,
}

impl<F> CustomStreamingCheck<F>
where
    F: FnMut(&Point, &History<'_>) -> Result<PointOutcome, String>,
{
    pub fn new(error_flag: impl Into<String>, engine: StreamingEngine, func: F) -> Self {
        Self {
            error_flag: error_flag.into(),
            engine,
            func,
        }
    }
}

struct FnPoint<'a, F> {
    name: &'a str,
    func: &'a mut F,
}

impl<F> PointCheck for FnPoint<'_, F>
where
    F: FnMut(&Point, &History<'_>) -> Result<PointOutcome, String>,
{
    fn name(&self) -> &str {
        self.name
    }

    fn evaluate_point(&mut self, point: &Point, history: &History<'_>) -> Result<PointOutcome, QcError> {
        (self.func)(point, history).map_err(|message| QcError::custom(self.name, message))
    }
}

impl<F> QualityCheck for CustomStreamingCheck<F>
where
    F: FnMut(&Point, &History<'_>) -> Result<PointOutcome, String>,
{
    fn name(&self) -> &str {
        &self.error_flag
    }

    fn evaluate(&mut self, view: &DataView, history: Option<&TimeFrame>) -> Result<CheckOutcome, QcError> {
        let mut point_check = FnPoint {
            name: &self.error_flag,
            func: &mut self.func,
        };
        let outcome = self.engine.run(view, history, &mut point_check)?;
        let notes = outcome.rebase_notes(&self.error_flag);
        Ok(CheckOutcome::from_findings(vec![Finding::new(
            self.error_flag.clone(),
            outcome.failures,
        )])
        .with_metadata(outcome.metadata)
        .with_notes(notes))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeDelta};
    use qc_columnar::BitMask;
    use qc_frame::TimeFrame;
    use qc_index::TimeIndex;
    use qc_types::{Bound, Timestamp};

    use super::{
        CustomStreamingCheck, History, Point, PointCheck, PointOutcome, StreamState,
        StreamingEngine, StreamingOutlierCheck, ZScore,
    };
    use crate::QcError;
    use crate::check::{DataView, QualityCheck};

    fn ts(h: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2017, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|t| t + TimeDelta::hours(i64::from(h)))
            .expect("valid timestamp")
    }

    fn view(values: Vec<f64>) -> DataView {
        let index = TimeIndex::new((0..values.len() as u32).map(ts).collect());
        DataView::unfiltered(TimeFrame::from_values(index, vec![("A", values)]).expect("frame"))
    }

    /// Fails any value above a fixed level and records the history mean.
    struct Above(f64);

    impl PointCheck for Above {
        fn name(&self) -> &str {
            "above"
        }

        fn evaluate_point(&mut self, point: &Point, history: &History<'_>) -> Result<PointOutcome, QcError> {
            let frame = history.to_frame()?;
            assert_eq!(frame.index().labels(), history.labels());
            let mean = frame
                .column("A")
                .map_or(f64::NAN, |c| qc_types::nanmean(c.values()));
            Ok(PointOutcome {
                pass: point.values.iter().map(|v| v.is_nan() || *v <= self.0).collect(),
                metadata: vec![mean],
            })
        }
    }

    #[test]
    fn evaluation_waits_for_a_full_window() {
        let engine = StreamingEngine::new(TimeDelta::hours(3), None).expect("engine");
        let v = view(vec![1.0; 8]);
        let outcome = engine.run(&v, None, &mut Above(10.0)).expect("run");
        assert_eq!(outcome.evaluated, 5);
        assert_eq!(outcome.state, StreamState::Evaluating);
        let meta = outcome.metadata.column("A").expect("A");
        assert!(meta.is_missing(2));
        assert!(!meta.is_missing(3));
    }

    #[test]
    fn failed_points_leave_later_histories() {
        let engine = StreamingEngine::new(TimeDelta::hours(2), None).expect("engine");
        let v = view(vec![1.0, 1.0, 1.0, 50.0, 1.0, 1.0]);
        let outcome = engine.run(&v, None, &mut Above(10.0)).expect("run");
        assert_eq!(
            outcome.failures.column("A").map(BitMask::to_vec),
            Some(vec![false, false, false, true, false, false])
        );
        let meta = outcome.metadata.column("A").expect("A").values().to_vec();
        // histories after the spike hold only ones
        assert_eq!(meta[4], 1.0);
        assert_eq!(meta[5], 1.0);
    }

    #[test]
    fn rebase_restores_raw_values() {
        let engine = StreamingEngine::new(TimeDelta::hours(2), Some(0.5)).expect("engine");
        let v = view(vec![1.0, 1.0, 1.0, 50.0, 50.0, 50.0, 50.0]);
        let outcome = engine.run(&v, None, &mut Above(10.0)).expect("run");
        assert!(outcome.rebase_count() > 0);
        assert_eq!(outcome.rebases[0].0, "A");
        let meta = outcome.metadata.column("A").expect("A").values().to_vec();
        // after the rebase the raw level shows up in the history mean
        assert!(meta[6] > 1.0);
    }

    #[test]
    fn prior_history_seeds_the_first_window() {
        let prior = TimeFrame::from_values(
            TimeIndex::new((0..3).map(ts).collect()),
            vec![("A", vec![2.0, 2.0, 2.0])],
        )
        .expect("prior");
        let index = TimeIndex::new((3..6).map(ts).collect());
        let v = DataView::unfiltered(
            TimeFrame::from_values(index, vec![("A", vec![1.0, 1.0, 1.0])]).expect("frame"),
        );
        let engine = StreamingEngine::new(TimeDelta::hours(2), None)
            .expect("engine")
            .with_prior_history(prior);
        let outcome = engine.run(&v, None, &mut Above(10.0)).expect("run");
        assert_eq!(outcome.evaluated, 3);
        assert_eq!(outcome.failures.len(), 3);
        let meta = outcome.metadata.column("A").expect("A").values().to_vec();
        assert_eq!(meta[0], 2.0);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(matches!(
            StreamingEngine::new(TimeDelta::hours(1), Some(1.5)),
            Err(QcError::Configuration(_))
        ));
        assert!(StreamingEngine::new(TimeDelta::zero(), None).is_err());
    }

    #[test]
    fn zscore_passes_undefined_scores() {
        let mut score = ZScore {
            bound: Bound::between(-1.0, 1.0),
            absolute_value: false,
        };
        let labels: Vec<Timestamp> = (0..2).map(ts).collect();
        let names = vec!["A".to_owned()];
        let columns = vec![vec![1.0, 1.0]];
        let history = History {
            labels: &labels,
            names: &names,
            columns: &columns,
            start: 0,
            end: 2,
        };
        let point = Point {
            timestamp: ts(2),
            names: vec!["A".to_owned()],
            values: vec![5.0],
        };
        let outcome = score.evaluate_point(&point, &history).expect("score");
        assert_eq!(outcome.pass, vec![true]);
        assert!(outcome.metadata[0].is_nan());
    }

    #[test]
    fn streaming_outlier_splits_flags_by_side() {
        let mut values = vec![10.0, 11.0, 9.0, 10.0, 11.0, 9.0, 10.0, 11.0];
        values.push(40.0);
        values.push(10.0);
        let engine = StreamingEngine::new(TimeDelta::hours(6), Some(0.5)).expect("engine");
        let mut check = StreamingOutlierCheck::new(Bound::between(-3.0, 3.0), engine, false)
            .expect("check");
        let outcome = check.evaluate(&view(values), None).expect("outlier");
        assert_eq!(outcome.findings.len(), 2);
        assert_eq!(outcome.findings[1].error_flag, "Outlier > upper bound, 3");
        assert!(outcome.findings[1].failures.get("A", 8));
        assert_eq!(outcome.findings[0].failures.count_true(), 0);
    }

    #[test]
    fn custom_errors_and_bad_shapes_surface() {
        let engine = StreamingEngine::new(TimeDelta::hours(1), None).expect("engine");
        let mut failing = CustomStreamingCheck::new("Streaming", engine.clone(), |_: &Point, _: &History<'_>| {
            Err("bad point".to_owned())
        });
        assert!(matches!(
            failing.evaluate(&view(vec![1.0; 4]), None),
            Err(QcError::CustomFunction { .. })
        ));

        let mut short = CustomStreamingCheck::new("Streaming", engine, |_: &Point, _: &History<'_>| {
            Ok(PointOutcome {
                pass: Vec::new(),
                metadata: Vec::new(),
            })
        });
        assert!(matches!(
            short.evaluate(&view(vec![1.0; 4]), None),
            Err(QcError::CustomFunction { .. })
        ));
    }
}
