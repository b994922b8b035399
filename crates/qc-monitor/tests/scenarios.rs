#![forbid(unsafe_code)]

//! End-to-end sessions over small synthetic data sets.

use chrono::{NaiveDate, TimeDelta};
use qc_frame::{MaskFrame, TimeFrame};
use qc_index::TimeIndex;
use qc_monitor::metrics::qci;
use qc_monitor::{
    CorruptTest, CustomTest, DUPLICATE_TIMESTAMP, DeltaTest, History, IncrementTest,
    MISSING_TIMESTAMP, MissingTest, Monitor, NONMONOTONIC_TIMESTAMP, OutlierTest, Point,
    PointOutcome, QcPlan, RangeTest, TimeFilter, TimestampTest,
};
use qc_types::{Bound, Note, NoteKind, Timestamp};

fn at(h: u32, m: u32) -> Timestamp {
    NaiveDate::from_ymd_opt(2015, 1, 1)
        .and_then(|d| d.and_hms_opt(h, m, 0))
        .expect("valid timestamp")
}

/// Every quarter hour of one day.
fn quarter_hours() -> Vec<Timestamp> {
    (0..96).map(|i| at(i / 4, (i % 4) * 15)).collect()
}

fn frame(labels: Vec<Timestamp>, columns: Vec<(&str, Vec<f64>)>) -> TimeFrame {
    TimeFrame::from_values(TimeIndex::new(labels), columns).expect("frame")
}

fn session(data: TimeFrame) -> Monitor {
    let mut pm = Monitor::new();
    pm.add_data(data).expect("add data");
    pm
}

// ── Timestamp audit ─────────────────────────────────────────────────────

/// Quarter-hour data with 05:00 absent, 17:00 repeated and 19:30 logged
/// after 19:45.
fn irregular_day() -> TimeFrame {
    let mut labels = Vec::new();
    let mut values = Vec::new();
    for ts in quarter_hours() {
        if ts == at(5, 0) || ts == at(19, 30) {
            continue;
        }
        labels.push(ts);
        values.push(1.0);
        if ts == at(17, 0) {
            labels.push(ts);
            values.push(2.0);
        }
        if ts == at(19, 45) {
            labels.push(at(19, 30));
            values.push(1.0);
        }
    }
    frame(labels, vec![("A", values)])
}

#[test]
fn timestamp_audit_reports_each_anomaly_once() {
    let mut pm = session(irregular_day());
    let report = pm.check_timestamp(&TimestampTest::new(900.0)).expect("timestamp");

    let summary: Vec<(Option<&str>, Timestamp, Timestamp, usize, &str)> = pm
        .test_results()
        .iter()
        .map(|r| {
            (
                r.variable_name.as_deref(),
                r.start_time,
                r.end_time,
                r.timesteps,
                r.error_flag.as_str(),
            )
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            (None, at(19, 30), at(19, 30), 1, NONMONOTONIC_TIMESTAMP),
            (None, at(17, 0), at(17, 0), 1, DUPLICATE_TIMESTAMP),
            (None, at(5, 0), at(5, 0), 1, MISSING_TIMESTAMP),
        ]
    );
    assert_eq!(report.records.len(), 3);

    let data = pm.data();
    assert_eq!(data.len(), 96);
    assert!(data.index().is_strictly_increasing());
    let values = data.column("A").expect("A").values();
    assert!(values[20].is_nan());
    // first occurrence of the duplicate wins
    assert_eq!(values[68], 1.0);
}

#[test]
fn missing_timestamps_are_not_reported_as_missing_data() {
    let mut pm = session(irregular_day());
    pm.check_timestamp(&TimestampTest::new(900.0)).expect("timestamp");
    let report = pm.check_missing(&MissingTest::new()).expect("missing");
    assert!(report.records.is_empty());
    assert!(!pm.mask().expect("mask").get("A", 20));
}

// ── Static tests ───────────────────────────────────────────────────────

#[test]
fn range_flags_single_value_above_bound() {
    let mut values = vec![0.5; 24];
    values[7] = 1.5;
    let labels = (0..24).map(|h| at(h, 0)).collect();
    let mut pm = session(frame(labels, vec![("A", values)]));
    let report = pm
        .check_range(&RangeTest::new(Bound::upper(1.0)))
        .expect("range");
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].error_flag, "Data > upper bound, 1");
    assert_eq!(report.records[0].start_time, at(7, 0));
    assert_eq!(report.records[0].timesteps, 1);
}

#[test]
fn delta_flags_whole_stagnant_interval() {
    // constant from 02:00 to 04:30, strictly increasing elsewhere
    let labels: Vec<Timestamp> = quarter_hours().into_iter().take(40).collect();
    let values: Vec<f64> = (0..40)
        .map(|i| if (8..=18).contains(&i) { 8.0 } else { f64::from(i) })
        .collect();
    let mut pm = session(frame(labels, vec![("A", values)]));
    let report = pm
        .check_delta(&DeltaTest::new(Bound::lower(0.0001), 3600.0))
        .expect("delta");
    assert_eq!(report.records.len(), 1);
    let record = &report.records[0];
    assert_eq!(record.error_flag, "Delta < lower bound, 0.0001");
    assert_eq!(record.start_time, at(2, 0));
    assert_eq!(record.end_time, at(4, 30));
    assert_eq!(record.timesteps, 11);
}

#[test]
fn corrupt_values_do_not_reach_later_tests() {
    let labels: Vec<Timestamp> = (0..6).map(|h| at(h, 0)).collect();
    let mut pm = session(frame(labels, vec![("A", vec![0.1, -999.0, -999.0, 0.2, 0.3, 0.4])]));
    pm.check_corrupt(&CorruptTest::new(vec![-999.0])).expect("corrupt");
    let range = pm
        .check_range(&RangeTest::new(Bound::between(0.0, 1.0)))
        .expect("range");
    assert!(range.records.is_empty());
    let increment = pm
        .check_increment(&IncrementTest::new(Bound::upper(0.5)))
        .expect("increment");
    assert!(increment.records.is_empty());
    assert_eq!(pm.test_results().len(), 1);
    assert_eq!(pm.test_results()[0].timesteps, 2);
}

#[test]
fn repeated_tests_duplicate_records_but_not_mask_changes() {
    let labels: Vec<Timestamp> = (0..4).map(|h| at(h, 0)).collect();
    let mut pm = session(frame(labels, vec![("A", vec![0.0, 5.0, 0.0, 5.0])]));
    let params = RangeTest::new(Bound::upper(1.0));
    pm.check_range(&params).expect("first");
    let mask = pm.mask().expect("mask");
    let cleaned = pm.cleaned_data().expect("cleaned");
    pm.check_range(&params).expect("second");
    assert_eq!(pm.mask().expect("mask"), mask);
    assert_eq!(pm.cleaned_data().expect("cleaned"), cleaned);
    assert_eq!(pm.test_results().len(), 4);
}

#[test]
fn short_runs_are_masked_but_not_reported() {
    let labels: Vec<Timestamp> = (0..7).map(|h| at(h, 0)).collect();
    let mut pm = session(frame(
        labels,
        vec![("A", vec![0.0, 0.0, 9.0, 9.0, 9.0, 0.0, 9.0])],
    ));
    let report = pm
        .check_range(&RangeTest::new(Bound::upper(1.0)).min_failures(2))
        .expect("range");
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].timesteps, 3);
    assert!(!pm.mask().expect("mask").get("A", 6));
}

// ── Streaming ──────────────────────────────────────────────────────────

#[test]
fn streaming_excludes_failed_points_from_history() {
    let labels: Vec<Timestamp> = (0..24).map(|h| at(h, 0)).collect();
    let mut values: Vec<f64> = (0..24).map(|i| 10.0 + f64::from(i % 3) * 0.1).collect();
    values[10] = 50.0;
    values[11] = 50.0;
    let mut pm = session(frame(labels, vec![("A", values)]));

    let mut seen_in_history = Vec::new();
    let report = pm
        .check_custom_streaming(
            &CustomTest::new("Jump").window(4.0 * 3600.0),
            |point: &Point, history: &History<'_>| -> Result<PointOutcome, String> {
                let past = history.column("A").unwrap_or_default();
                seen_in_history.extend(past.iter().copied().filter(|v| !v.is_nan()));
                let value = point.values[0];
                Ok(PointOutcome {
                    pass: vec![value < 20.0],
                    metadata: vec![value],
                })
            },
        )
        .expect("streaming");
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].start_time, at(10, 0));
    assert_eq!(report.records[0].timesteps, 2);
    assert!(seen_in_history.iter().all(|v| *v < 20.0));
}

#[test]
fn streaming_outlier_rebases_after_level_shift() {
    let labels: Vec<Timestamp> = (0..48).map(|h| at(0, 0) + TimeDelta::hours(h)).collect();
    let values: Vec<f64> = (0..48)
        .map(|i| {
            let base = if i < 24 { 0.0 } else { 100.0 };
            base + [0.0, 1.0, -1.0][i as usize % 3]
        })
        .collect();
    let mut pm = session(frame(labels, vec![("A", values)]));
    let report = pm
        .check_outlier(
            &OutlierTest::new(Bound::between(-3.0, 3.0))
                .window(6.0 * 3600.0)
                .streaming(true),
        )
        .expect("outlier");
    // the shift is flagged until the window rebases onto the new level
    assert!(!report.records.is_empty());
    let flagged: usize = report.records.iter().map(|r| r.timesteps).sum();
    assert!(flagged < 24);
    assert!(pm.mask().expect("mask").get("A", 47));

    // the rebase is reported, not just logged
    let rebased = |notes: &[Note]| {
        notes
            .iter()
            .any(|note| note.kind == NoteKind::DataAdjusted && note.variable.as_deref() == Some("A"))
    };
    assert!(rebased(&report.notes));
    assert!(rebased(pm.notes()));
}

/// A short daily run after a full day of clean history.
fn short_run_after_clean_day(with_history: bool) -> Monitor {
    let day_before = at(0, 0) - TimeDelta::days(1);
    let prior = frame(
        (0..24).map(|h| day_before + TimeDelta::hours(h)).collect(),
        vec![("A", (0..24).map(|h| if h % 2 == 0 { 9.8 } else { 10.2 }).collect())],
    );
    let mut pm = session(frame(
        (0..4).map(|h| at(h, 0)).collect(),
        vec![("A", vec![10.0, 10.1, 500.0, 10.2])],
    ));
    if with_history {
        pm.add_prior_history(prior);
    }
    pm
}

#[test]
fn prior_history_covers_window_longer_than_new_data() {
    let params = OutlierTest::new(Bound::between(-3.0, 3.0))
        .window(12.0 * 3600.0)
        .streaming(true);

    let mut pm = short_run_after_clean_day(true);
    let report = pm.check_outlier(&params).expect("outlier");
    assert!(report.notes.is_empty());
    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].error_flag, "Outlier > upper bound, 3");
    assert_eq!(report.records[0].start_time, at(2, 0));
    assert_eq!(report.records[0].timesteps, 1);

    // without the earlier day the window cannot be filled
    let mut pm = short_run_after_clean_day(false);
    let report = pm.check_outlier(&params).expect("outlier");
    assert!(report.records.is_empty());
    assert_eq!(report.notes.len(), 1);
    assert_eq!(report.notes[0].kind, NoteKind::InsufficientData);
}

// ── Time filter and windows ────────────────────────────────────────────

/// Twelve hourly values near 5 with `spike` at 06:00.
fn spiked(spike: f64) -> TimeFrame {
    let values = (0..12)
        .map(|i| if i == 6 { spike } else { 5.0 + [0.0, 0.2, -0.2][i % 3] })
        .collect();
    frame((0..12).map(|h| at(h, 0)).collect(), vec![("A", values)])
}

fn session_without_six(data: TimeFrame) -> Monitor {
    let keep: Vec<bool> = (0..12).map(|i| i != 6).collect();
    let filter = TimeFilter::from_bools(data.index().clone(), &keep).expect("filter");
    let mut pm = session(data);
    pm.add_time_filter(filter);
    pm
}

#[test]
fn time_filter_keeps_excluded_spike_out_of_delta_windows() {
    let params = DeltaTest::new(Bound::upper(10.0), 2.0 * 3600.0);

    let mut unfiltered = session(spiked(50.0));
    assert!(!unfiltered.check_delta(&params).expect("delta").records.is_empty());

    let mut filtered = session_without_six(spiked(50.0));
    let report = filtered.check_delta(&params).expect("delta");
    assert!(report.records.is_empty());
    assert!(report.notes.is_empty());
}

#[test]
fn time_filter_keeps_excluded_spike_out_of_rolling_outlier_statistics() {
    let params = OutlierTest::new(Bound::between(-3.0, 3.0)).window(4.0 * 3600.0);
    let zscores = |pm: &mut Monitor| -> Vec<f64> {
        let report = pm.check_outlier(&params).expect("outlier");
        let metadata = report.metadata.expect("z-scores");
        metadata.column("A").expect("A").values().to_vec()
    };

    let filtered = zscores(&mut session_without_six(spiked(50.0)));
    let blank = zscores(&mut session(spiked(f64::NAN)));
    let unfiltered = zscores(&mut session(spiked(50.0)));
    for row in (0..12).filter(|&row| row != 6) {
        let (a, b) = (filtered[row], blank[row]);
        assert!(a == b || (a.is_nan() && b.is_nan()), "row {row}: {a} vs {b}");
    }
    // the neighbour after the spike would see it without the filter
    assert_ne!(filtered[7], unfiltered[7]);
}

#[test]
fn time_filter_keeps_excluded_spike_out_of_streaming_history() {
    let mut pm = session_without_six(spiked(50.0));
    let mut evaluated = Vec::new();
    let mut largest_seen = f64::NEG_INFINITY;
    let report = pm
        .check_custom_streaming(
            &CustomTest::new("Level").window(2.0 * 3600.0),
            |point: &Point, history: &History<'_>| -> Result<PointOutcome, String> {
                evaluated.push(point.timestamp);
                if let Some(column) = history.column("A") {
                    for value in column.iter().filter(|v| !v.is_nan()) {
                        largest_seen = largest_seen.max(*value);
                    }
                }
                Ok(PointOutcome {
                    pass: vec![true],
                    metadata: vec![point.values[0]],
                })
            },
        )
        .expect("streaming");
    assert!(report.records.is_empty());
    assert!(!evaluated.is_empty());
    assert!(!evaluated.contains(&at(6, 0)));
    assert!(largest_seen < 6.0);
}

// ── Plans ──────────────────────────────────────────────────────────────

#[test]
fn plan_runs_configuration_then_tests() {
    let labels: Vec<Timestamp> = (0..24).map(|h| at(h, 0)).collect();
    let a: Vec<f64> = (0..24).map(|i| if i == 12 { 3.0 } else { 0.5 }).collect();
    let b: Vec<f64> = (0..24).map(|i| if i == 1 { 3.0 } else { 0.25 }).collect();
    let mut pm = session(frame(labels, vec![("A", a), ("B", b)]));

    let plan = QcPlan::from_json(
        r#"{
            "translation": {"Pair": ["A", "B"]},
            "composite_signals": [{"name": "Sum", "formula": "{A} + {B}"}],
            "time_filter": "{CLOCK_TIME} >= 3*3600",
            "tests": [
                {"test": "timestamp", "frequency": 3600},
                {"test": "range", "bound": [0, 1], "key": "Pair"},
                {"test": "range", "bound": [null, 2], "key": "Sum"}
            ]
        }"#,
    )
    .expect("plan");
    let reports = pm.run_plan(&plan).expect("run");
    assert_eq!(reports.len(), 3);
    assert!(reports[0].records.is_empty());

    // B at 01:00 lies outside the time filter
    assert_eq!(reports[1].records.len(), 1);
    assert_eq!(reports[1].records[0].variable_name.as_deref(), Some("A"));
    assert_eq!(reports[2].records.len(), 1);
    assert_eq!(reports[2].records[0].variable_name.as_deref(), Some("Sum"));

    let mask: MaskFrame = pm.mask().expect("mask");
    let filter = pm.time_filter().expect("filter");
    let index = qci(&mask, Some(filter));
    let a_qci = index
        .iter()
        .find(|(name, _)| name == "A")
        .map(|(_, v)| *v)
        .expect("A");
    assert!((a_qci - 20.0 / 21.0).abs() < 1e-12);
}
