#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Row label of every time-indexed structure in the workspace.
pub type Timestamp = NaiveDateTime;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("lower bound {lower} is greater than upper bound {upper}")]
    InvertedBound { lower: f64, upper: f64 },
    #[error("bound value must be finite, found {value}")]
    NonFiniteBound { value: f64 },
    #[error("time span must be a positive number of seconds, found {seconds}")]
    InvalidSpan { seconds: f64 },
}

/// Convert a span in seconds to a `TimeDelta` at millisecond resolution.
pub fn span_from_seconds(seconds: f64) -> Result<TimeDelta, TypeError> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(TypeError::InvalidSpan { seconds });
    }
    let millis = (seconds * 1e3).round() as i64;
    if millis <= 0 {
        return Err(TypeError::InvalidSpan { seconds });
    }
    Ok(TimeDelta::milliseconds(millis))
}

// ── Bounds ─────────────────────────────────────────────────────────────

/// `[lower, upper]` pair where either side may be open.
///
/// Serialized as a two element array (`[0.0001, null]`) so plans read the
/// same way the bounds are written in reports.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "(Option<f64>, Option<f64>)", into = "(Option<f64>, Option<f64>)")]
pub struct Bound {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl From<(Option<f64>, Option<f64>)> for Bound {
    fn from((lower, upper): (Option<f64>, Option<f64>)) -> Self {
        Self { lower, upper }
    }
}

impl From<Bound> for (Option<f64>, Option<f64>) {
    fn from(bound: Bound) -> Self {
        (bound.lower, bound.upper)
    }
}

impl Bound {
    #[must_use]
    pub fn new(lower: Option<f64>, upper: Option<f64>) -> Self {
        Self { lower, upper }
    }

    #[must_use]
    pub fn lower(value: f64) -> Self {
        Self::new(Some(value), None)
    }

    #[must_use]
    pub fn upper(value: f64) -> Self {
        Self::new(None, Some(value))
    }

    #[must_use]
    pub fn between(lower: f64, upper: f64) -> Self {
        Self::new(Some(lower), Some(upper))
    }

    pub fn validate(&self) -> Result<(), TypeError> {
        for value in [self.lower, self.upper].into_iter().flatten() {
            if !value.is_finite() {
                return Err(TypeError::NonFiniteBound { value });
            }
        }
        if let (Some(lower), Some(upper)) = (self.lower, self.upper) {
            if lower > upper {
                return Err(TypeError::InvertedBound { lower, upper });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    /// Error flag for values below the lower bound, e.g. `Data < lower bound, 0`.
    #[must_use]
    pub fn lower_flag(&self, prefix: &str) -> Option<String> {
        self.lower
            .map(|value| format!("{prefix} < lower bound, {}", format_bound(value)))
    }

    /// Error flag for values above the upper bound, e.g. `Data > upper bound, 1`.
    #[must_use]
    pub fn upper_flag(&self, prefix: &str) -> Option<String> {
        self.upper
            .map(|value| format!("{prefix} > upper bound, {}", format_bound(value)))
    }
}

/// Shortest round-trippable rendering: `1`, `0.0001`, `-1.9`.
#[must_use]
pub fn format_bound(value: f64) -> String {
    format!("{value}")
}

/// Which ordering of min and max counts as a delta failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The minimum occurs before the maximum.
    Positive,
    /// The maximum occurs before the minimum.
    Negative,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Positive => write!(f, "positive"),
            Self::Negative => write!(f, "negative"),
        }
    }
}

// ── Results ────────────────────────────────────────────────────────────

/// One reportable run of consecutive failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// `None` for index-level failures (timestamp checks).
    pub variable_name: Option<String>,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub timesteps: usize,
    pub error_flag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    InsufficientData,
    CustomFunction,
    DataAdjusted,
}

impl fmt::Display for NoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data"),
            Self::CustomFunction => write!(f, "custom function error"),
            Self::DataAdjusted => write!(f, "data adjusted"),
        }
    }
}

/// Runtime warning attached to a session so degraded checks stay visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub test: String,
    pub variable: Option<String>,
    pub kind: NoteKind,
    pub message: String,
}

impl Note {
    #[must_use]
    pub fn new(test: impl Into<String>, kind: NoteKind, message: impl Into<String>) -> Self {
        Self {
            test: test.into(),
            variable: None,
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn for_variable(mut self, variable: impl Into<String>) -> Self {
        self.variable = Some(variable.into());
        self
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variable {
            Some(variable) => write!(
                f,
                "{} [{}] {}: {}",
                self.test, variable, self.kind, self.message
            ),
            None => write!(f, "{} {}: {}", self.test, self.kind, self.message),
        }
    }
}

// ── Nanops: NaN-skipping reductions ────────────────────────────────────

fn finite_values(values: &[f64]) -> impl Iterator<Item = f64> + '_ {
    values.iter().copied().filter(|v| !v.is_nan())
}

#[must_use]
pub fn nancount(values: &[f64]) -> usize {
    finite_values(values).count()
}

#[must_use]
pub fn nanmean(values: &[f64]) -> f64 {
    let (sum, count) = finite_values(values).fold((0.0, 0_usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        return f64::NAN;
    }
    sum / count as f64
}

#[must_use]
pub fn nanvar(values: &[f64], ddof: usize) -> f64 {
    let count = nancount(values);
    if count <= ddof {
        return f64::NAN;
    }
    let mean = nanmean(values);
    let sum_sq: f64 = finite_values(values).map(|x| (x - mean).powi(2)).sum();
    sum_sq / (count - ddof) as f64
}

#[must_use]
pub fn nanstd(values: &[f64], ddof: usize) -> f64 {
    nanvar(values, ddof).sqrt()
}

#[must_use]
pub fn nanmin(values: &[f64]) -> f64 {
    if nancount(values) == 0 {
        return f64::NAN;
    }
    finite_values(values).fold(f64::INFINITY, f64::min)
}

#[must_use]
pub fn nanmax(values: &[f64]) -> f64 {
    if nancount(values) == 0 {
        return f64::NAN;
    }
    finite_values(values).fold(f64::NEG_INFINITY, f64::max)
}

/// Position of the first minimum, skipping NaN.
#[must_use]
pub fn nanargmin(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (pos, &value) in values.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if value >= current => {}
            _ => best = Some((pos, value)),
        }
    }
    best.map(|(pos, _)| pos)
}

/// Position of the first maximum, skipping NaN.
#[must_use]
pub fn nanargmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (pos, &value) in values.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((pos, value)),
        }
    }
    best.map(|(pos, _)| pos)
}

// ── Time conversions ───────────────────────────────────────────────────

/// Seconds elapsed since the first timestamp, plus `origin`.
#[must_use]
pub fn elapsed_seconds(index: &[Timestamp], origin: f64) -> Vec<f64> {
    let Some(first) = index.first() else {
        return Vec::new();
    };
    index
        .iter()
        .map(|ts| delta_seconds(*ts - *first) + origin)
        .collect()
}

/// Seconds past midnight.
#[must_use]
pub fn clock_seconds(ts: &Timestamp) -> f64 {
    f64::from(ts.num_seconds_from_midnight()) + f64::from(ts.nanosecond()) / 1e9
}

/// Seconds since the unix epoch.
#[must_use]
pub fn epoch_seconds(ts: &Timestamp) -> f64 {
    ts.and_utc().timestamp_millis() as f64 / 1e3
}

/// Inverse of [`epoch_seconds`], rounded to the nearest millisecond.
#[must_use]
pub fn from_epoch_seconds(seconds: f64) -> Option<Timestamp> {
    if !seconds.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((seconds * 1e3).round() as i64).map(|dt| dt.naive_utc())
}

#[must_use]
pub fn delta_seconds(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1e3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundMode {
    Nearest,
    Floor,
    Ceiling,
}

/// Round a timestamp onto a grid of `step` anchored at the unix epoch.
#[must_use]
pub fn round_timestamp(ts: &Timestamp, step: TimeDelta, mode: RoundMode) -> Timestamp {
    let step_ms = step.num_milliseconds();
    if step_ms <= 0 {
        return *ts;
    }
    let millis = ts.and_utc().timestamp_millis();
    let floor = millis.div_euclid(step_ms) * step_ms;
    let rounded = match mode {
        RoundMode::Floor => floor,
        RoundMode::Ceiling if floor == millis => floor,
        RoundMode::Ceiling => floor + step_ms,
        RoundMode::Nearest => {
            if (millis - floor) * 2 >= step_ms {
                floor + step_ms
            } else {
                floor
            }
        }
    };
    DateTime::from_timestamp_millis(rounded).map_or(*ts, |dt| dt.naive_utc())
}
