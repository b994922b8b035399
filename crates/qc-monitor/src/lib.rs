#![forbid(unsafe_code)]

//! Quality control engine for time-indexed sensor data.
//!
//! A [`Monitor`] owns one session: the working data, translation groups,
//! the time filter and the accumulated failure state. Tests run in call
//! order and each sees the state left by the previous ones.

pub mod accumulator;
pub mod check;
pub mod functional;
pub mod grouper;
pub mod metrics;
pub mod monitor;
pub mod plan;
pub mod streaming;
pub mod time_filter;
pub mod translation;

use qc_expr::ExprError;
use qc_frame::FrameError;
use qc_index::IndexError;
use qc_types::TypeError;
use thiserror::Error;

pub use accumulator::Accumulator;
pub use check::{CheckOutcome, DataView, Finding, QualityCheck};
pub use grouper::{failure_runs, group_failures};
pub use monitor::{Monitor, TestReport};
pub use plan::{
    CompositeSpec, CorruptTest, CustomTest, DeltaTest, IncrementTest, MissingTest, OutlierTest, QcPlan,
    RangeTest, TestSpec, TimestampTest,
};
pub use streaming::{
    History, Point, PointCheck, PointOutcome, StreamOutcome, StreamState, StreamingEngine,
};
pub use time_filter::TimeFilter;
pub use translation::Translation;

/// Flag of index-level records produced for absent timestamps.
pub const MISSING_TIMESTAMP: &str = "Missing timestamp";
pub const DUPLICATE_TIMESTAMP: &str = "Duplicate timestamp";
pub const NONMONOTONIC_TIMESTAMP: &str = "Nonmonotonic timestamp";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QcError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("insufficient data for {test}: {message}")]
    InsufficientData { test: String, message: String },
    #[error("custom function '{name}' failed: {message}")]
    CustomFunction { name: String, message: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Expr(#[from] ExprError),
}

impl From<TypeError> for QcError {
    fn from(err: TypeError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl QcError {
    pub(crate) fn insufficient(test: &str, message: impl Into<String>) -> Self {
        Self::InsufficientData {
            test: test.to_owned(),
            message: message.into(),
        }
    }

    pub(crate) fn custom(name: &str, message: impl Into<String>) -> Self {
        Self::CustomFunction {
            name: name.to_owned(),
            message: message.into(),
        }
    }
}
