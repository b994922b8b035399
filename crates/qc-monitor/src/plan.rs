use std::collections::BTreeMap;

use qc_types::{Bound, Direction, Timestamp};
use serde::{Deserialize, Serialize};

use crate::QcError;
use crate::translation::Translation;

fn default_min_failures() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_increment() -> usize {
    1
}

fn default_rebase() -> Option<f64> {
    Some(0.5)
}

// ── Test parameters ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampTest {
    /// Expected spacing in seconds.
    pub frequency: f64,
    #[serde(default)]
    pub expected_start: Option<Timestamp>,
    #[serde(default)]
    pub expected_end: Option<Timestamp>,
    #[serde(default = "default_min_failures")]
    pub min_failures: usize,
    #[serde(default = "default_true")]
    pub exact_times: bool,
}

impl TimestampTest {
    #[must_use]
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency,
            expected_start: None,
            expected_end: None,
            min_failures: 1,
            exact_times: true,
        }
    }

    #[must_use]
    pub fn expected_range(mut self, start: Option<Timestamp>, end: Option<Timestamp>) -> Self {
        self.expected_start = start;
        self.expected_end = end;
        self
    }

    #[must_use]
    pub fn exact_times(mut self, exact: bool) -> Self {
        self.exact_times = exact;
        self
    }

    #[must_use]
    pub fn min_failures(mut self, min_failures: usize) -> Self {
        self.min_failures = min_failures;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingTest {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_min_failures")]
    pub min_failures: usize,
}

impl MissingTest {
    #[must_use]
    pub fn new() -> Self {
        Self {
            key: None,
            min_failures: 1,
        }
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn min_failures(mut self, min_failures: usize) -> Self {
        self.min_failures = min_failures;
        self
    }
}

impl Default for MissingTest {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorruptTest {
    pub values: Vec<f64>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_min_failures")]
    pub min_failures: usize,
}

impl CorruptTest {
    #[must_use]
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            values,
            key: None,
            min_failures: 1,
        }
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn min_failures(mut self, min_failures: usize) -> Self {
        self.min_failures = min_failures;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeTest {
    pub bound: Bound,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_min_failures")]
    pub min_failures: usize,
}

impl RangeTest {
    #[must_use]
    pub fn new(bound: Bound) -> Self {
        Self {
            bound,
            key: None,
            min_failures: 1,
        }
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn min_failures(mut self, min_failures: usize) -> Self {
        self.min_failures = min_failures;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaTest {
    pub bound: Bound,
    /// Window span in seconds.
    pub window: f64,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default = "default_min_failures")]
    pub min_failures: usize,
}

impl DeltaTest {
    #[must_use]
    pub fn new(bound: Bound, window: f64) -> Self {
        Self {
            bound,
            window,
            key: None,
            direction: None,
            min_failures: 1,
        }
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    #[must_use]
    pub fn min_failures(mut self, min_failures: usize) -> Self {
        self.min_failures = min_failures;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementTest {
    pub bound: Bound,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_increment")]
    pub increment: usize,
    #[serde(default = "default_true")]
    pub absolute_value: bool,
    #[serde(default = "default_min_failures")]
    pub min_failures: usize,
}

impl IncrementTest {
    #[must_use]
    pub fn new(bound: Bound) -> Self {
        Self {
            bound,
            key: None,
            increment: 1,
            absolute_value: true,
            min_failures: 1,
        }
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn increment(mut self, increment: usize) -> Self {
        self.increment = increment;
        self
    }

    #[must_use]
    pub fn absolute_value(mut self, absolute_value: bool) -> Self {
        self.absolute_value = absolute_value;
        self
    }

    #[must_use]
    pub fn min_failures(mut self, min_failures: usize) -> Self {
        self.min_failures = min_failures;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierTest {
    pub bound: Bound,
    /// Normalization window in seconds; whole column when absent.
    #[serde(default)]
    pub window: Option<f64>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub absolute_value: bool,
    #[serde(default)]
    pub streaming: bool,
    /// Excluded fraction that triggers a rebase in streaming mode.
    #[serde(default = "default_rebase")]
    pub rebase: Option<f64>,
    #[serde(default = "default_min_failures")]
    pub min_failures: usize,
}

impl OutlierTest {
    #[must_use]
    pub fn new(bound: Bound) -> Self {
        Self {
            bound,
            window: None,
            key: None,
            absolute_value: false,
            streaming: false,
            rebase: default_rebase(),
            min_failures: 1,
        }
    }

    #[must_use]
    pub fn window(mut self, seconds: f64) -> Self {
        self.window = Some(seconds);
        self
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn absolute_value(mut self, absolute_value: bool) -> Self {
        self.absolute_value = absolute_value;
        self
    }

    #[must_use]
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    #[must_use]
    pub fn rebase(mut self, rebase: Option<f64>) -> Self {
        self.rebase = rebase;
        self
    }

    #[must_use]
    pub fn min_failures(mut self, min_failures: usize) -> Self {
        self.min_failures = min_failures;
        self
    }
}

/// Settings for injected functions. Not part of [`TestSpec`]: functions
/// cannot be written in a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomTest {
    pub error_message: String,
    pub key: Option<String>,
    /// History span in seconds; required by streaming functions.
    pub window: Option<f64>,
    pub rebase: Option<f64>,
    pub min_failures: usize,
}

impl CustomTest {
    #[must_use]
    pub fn new(error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
            key: None,
            window: None,
            rebase: None,
            min_failures: 1,
        }
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn window(mut self, seconds: f64) -> Self {
        self.window = Some(seconds);
        self
    }

    #[must_use]
    pub fn rebase(mut self, rebase: f64) -> Self {
        self.rebase = Some(rebase);
        self
    }

    #[must_use]
    pub fn min_failures(mut self, min_failures: usize) -> Self {
        self.min_failures = min_failures;
        self
    }
}

// ── Plans ──────────────────────────────────────────────────────────────

/// One built-in test with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "test", rename_all = "snake_case")]
pub enum TestSpec {
    Timestamp(TimestampTest),
    Missing(MissingTest),
    Corrupt(CorruptTest),
    Range(RangeTest),
    Delta(DeltaTest),
    Increment(IncrementTest),
    Outlier(OutlierTest),
}

impl TestSpec {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Timestamp(_) => "timestamp",
            Self::Missing(_) => "missing",
            Self::Corrupt(_) => "corrupt",
            Self::Range(_) => "range",
            Self::Delta(_) => "delta",
            Self::Increment(_) => "increment",
            Self::Outlier(_) => "outlier",
        }
    }
}

/// Derived signal added to the data before the tests run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeSpec {
    pub name: String,
    pub formula: String,
}

/// A full session configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QcPlan {
    #[serde(default)]
    pub translation: Translation,
    #[serde(default)]
    pub constants: BTreeMap<String, f64>,
    #[serde(default)]
    pub composite_signals: Vec<CompositeSpec>,
    /// Boolean formula; rows where it is false are excluded from tests.
    #[serde(default)]
    pub time_filter: Option<String>,
    #[serde(default)]
    pub tests: Vec<TestSpec>,
}

impl QcPlan {
    pub fn from_json(text: &str) -> Result<Self, QcError> {
        serde_json::from_str(text).map_err(|err| QcError::Configuration(format!("invalid plan: {err}")))
    }

    pub fn to_json(&self) -> Result<String, QcError> {
        serde_json::to_string_pretty(self)
            .map_err(|err| QcError::Configuration(format!("plan not serializable: {err}")))
    }
}
