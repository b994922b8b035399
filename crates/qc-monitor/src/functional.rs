//! One-call wrappers: each function runs a single test on a fresh session
//! and returns its outputs.

use qc_frame::{MaskFrame, TimeFrame};
use qc_types::{FailureRecord, Note};

use crate::QcError;
use crate::monitor::{Monitor, TestReport};
use crate::plan::{
    CorruptTest, CustomTest, DeltaTest, IncrementTest, MissingTest, OutlierTest, RangeTest,
    TimestampTest,
};
use crate::static_tests::StaticOutput;
use crate::streaming::{History, Point, PointOutcome};
use crate::time_filter::TimeFilter;

#[derive(Debug, Clone, PartialEq)]
pub struct QcResults {
    pub cleaned_data: TimeFrame,
    pub mask: MaskFrame,
    pub test_results: Vec<FailureRecord>,
    pub notes: Vec<Note>,
    pub metadata: Option<TimeFrame>,
}

fn session(data: TimeFrame, filter: Option<TimeFilter>) -> Result<Monitor, QcError> {
    let mut monitor = Monitor::new();
    monitor.add_data(data)?;
    if let Some(filter) = filter {
        monitor.add_time_filter(filter);
    }
    Ok(monitor)
}

fn finish(monitor: &Monitor, report: TestReport) -> Result<QcResults, QcError> {
    Ok(QcResults {
        cleaned_data: monitor.cleaned_data()?,
        mask: monitor.mask()?,
        test_results: monitor.test_results().to_vec(),
        notes: monitor.notes().to_vec(),
        metadata: report.metadata,
    })
}

pub fn check_timestamp(data: TimeFrame, params: &TimestampTest) -> Result<QcResults, QcError> {
    let mut monitor = session(data, None)?;
    let report = monitor.check_timestamp(params)?;
    finish(&monitor, report)
}

pub fn check_missing(
    data: TimeFrame,
    params: &MissingTest,
    filter: Option<TimeFilter>,
) -> Result<QcResults, QcError> {
    let mut monitor = session(data, filter)?;
    let report = monitor.check_missing(params)?;
    finish(&monitor, report)
}

pub fn check_corrupt(
    data: TimeFrame,
    params: &CorruptTest,
    filter: Option<TimeFilter>,
) -> Result<QcResults, QcError> {
    let mut monitor = session(data, filter)?;
    let report = monitor.check_corrupt(params)?;
    finish(&monitor, report)
}

pub fn check_range(
    data: TimeFrame,
    params: &RangeTest,
    filter: Option<TimeFilter>,
) -> Result<QcResults, QcError> {
    let mut monitor = session(data, filter)?;
    let report = monitor.check_range(params)?;
    finish(&monitor, report)
}

pub fn check_delta(
    data: TimeFrame,
    params: &DeltaTest,
    filter: Option<TimeFilter>,
) -> Result<QcResults, QcError> {
    let mut monitor = session(data, filter)?;
    let report = monitor.check_delta(params)?;
    finish(&monitor, report)
}

pub fn check_increment(
    data: TimeFrame,
    params: &IncrementTest,
    filter: Option<TimeFilter>,
) -> Result<QcResults, QcError> {
    let mut monitor = session(data, filter)?;
    let report = monitor.check_increment(params)?;
    finish(&monitor, report)
}

/// Outlier check; `metadata` holds the z-scores.
pub fn check_outlier(
    data: TimeFrame,
    params: &OutlierTest,
    filter: Option<TimeFilter>,
) -> Result<QcResults, QcError> {
    let mut monitor = session(data, filter)?;
    let report = monitor.check_outlier(params)?;
    finish(&monitor, report)
}

pub fn check_custom_static<F>(
    data: TimeFrame,
    params: &CustomTest,
    filter: Option<TimeFilter>,
    func: F,
) -> Result<QcResults, QcError>
where
    F: FnMut(&TimeFrame) -> Result<StaticOutput, String>,
{
    let mut monitor = session(data, filter)?;
    let report = monitor.check_custom_static(params, func)?;
    finish(&monitor, report)
}

pub fn check_custom_streaming<F>(
    data: TimeFrame,
    params: &CustomTest,
    filter: Option<TimeFilter>,
    func: F,
) -> Result<QcResults, QcError>
where
    F: FnMut(&Point, &History<'_>) -> Result<PointOutcome, String>,
{
    let mut monitor = session(data, filter)?;
    let report = monitor.check_custom_streaming(params, func)?;
    finish(&monitor, report)
}
