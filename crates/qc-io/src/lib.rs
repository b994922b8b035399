#![forbid(unsafe_code)]

//! CSV ingestion of time-indexed data and export of session results.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use csv::{ReaderBuilder, WriterBuilder};
use qc_columnar::Column;
use qc_frame::{FrameError, MaskFrame, TimeFrame};
use qc_index::TimeIndex;
use qc_monitor::metrics::ColumnMetric;
use qc_types::{FailureRecord, Note, Timestamp};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum IoError {
    #[error("csv input has no headers")]
    MissingHeaders,
    #[error("csv input needs a timestamp column and at least one data column")]
    NoDataColumns,
    #[error("row {row}: cannot parse timestamp '{value}'")]
    InvalidTimestamp { row: usize, value: String },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

// ── Reading ────────────────────────────────────────────────────────────

/// Parse CSV text whose first column holds timestamps.
///
/// The remaining columns are numeric; empty or unparseable cells become
/// missing values. Rows keep their file order, so an unsorted or duplicated
/// index survives for the timestamp check to report.
pub fn read_csv_str(input: &str) -> Result<TimeFrame, IoError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input.as_bytes());

    let headers = reader.headers().cloned()?;
    if headers.is_empty() {
        return Err(IoError::MissingHeaders);
    }
    if headers.len() < 2 {
        return Err(IoError::NoDataColumns);
    }

    let column_count = headers.len() - 1;
    let row_hint = input.len() / (headers.len() * 8).max(1);
    let mut labels = Vec::with_capacity(row_hint);
    let mut columns: Vec<Vec<f64>> = (0..column_count)
        .map(|_| Vec::with_capacity(row_hint))
        .collect();

    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let field = record.get(0).unwrap_or_default();
        let ts = parse_timestamp(field).ok_or_else(|| IoError::InvalidTimestamp {
            row,
            value: field.to_owned(),
        })?;
        labels.push(ts);
        for (idx, values) in columns.iter_mut().enumerate() {
            values.push(parse_value(record.get(idx + 1).unwrap_or_default()));
        }
    }

    let named = headers
        .iter()
        .skip(1)
        .map(|name| name.trim().to_owned())
        .zip(columns.into_iter().map(Column::new))
        .collect();
    let frame = TimeFrame::new(TimeIndex::new(labels), named)?;
    debug!(rows = frame.len(), columns = frame.num_columns(), "parsed csv");
    Ok(frame)
}

pub fn read_csv_path(path: impl AsRef<Path>) -> Result<TimeFrame, IoError> {
    let path = path.as_ref();
    info!(path = %path.display(), "reading data");
    read_csv_str(&fs::read_to_string(path)?)
}

/// Accepts the common ISO-like layouts, with or without fractional seconds,
/// and bare dates.
#[must_use]
pub fn parse_timestamp(field: &str) -> Option<Timestamp> {
    let trimmed = field.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .map(|date| date.and_time(NaiveTime::MIN))
        })
}

fn parse_value(field: &str) -> f64 {
    field.trim().parse::<f64>().unwrap_or(f64::NAN)
}

#[must_use]
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

// ── Writing ────────────────────────────────────────────────────────────

/// Data as CSV; missing values are written as empty cells.
pub fn write_frame_csv<W: Write>(writer: W, frame: &TimeFrame) -> Result<(), IoError> {
    let mut out = WriterBuilder::new().from_writer(writer);
    let mut header = vec!["timestamp".to_owned()];
    header.extend(frame.column_names().iter().cloned());
    out.write_record(&header)?;
    for (row, ts) in frame.index().labels().iter().enumerate() {
        let mut record = vec![format_timestamp(ts)];
        record.extend(frame.iter_columns().map(|(_, column)| {
            column
                .value(row)
                .filter(|v| !v.is_nan())
                .map_or_else(String::new, |v| v.to_string())
        }));
        out.write_record(&record)?;
    }
    out.flush()?;
    Ok(())
}

pub fn write_mask_csv<W: Write>(writer: W, mask: &MaskFrame) -> Result<(), IoError> {
    let mut out = WriterBuilder::new().from_writer(writer);
    let mut header = vec!["timestamp".to_owned()];
    header.extend(mask.column_names().iter().cloned());
    out.write_record(&header)?;
    for (row, ts) in mask.index().labels().iter().enumerate() {
        let mut record = vec![format_timestamp(ts)];
        record.extend(mask.iter_columns().map(|(_, bits)| bits.get(row).to_string()));
        out.write_record(&record)?;
    }
    out.flush()?;
    Ok(())
}

/// Failure records sorted by variable, then times, count and flag.
/// Index-level records have an empty variable name and sort first.
pub fn write_test_results_csv<W: Write>(
    writer: W,
    records: &[FailureRecord],
) -> Result<(), IoError> {
    let mut sorted: Vec<&FailureRecord> = records.iter().collect();
    sorted.sort_by(|a, b| {
        (&a.variable_name, a.start_time, a.end_time, a.timesteps, &a.error_flag).cmp(&(
            &b.variable_name,
            b.start_time,
            b.end_time,
            b.timesteps,
            &b.error_flag,
        ))
    });

    let mut out = WriterBuilder::new().from_writer(writer);
    out.write_record(["Variable Name", "Start Time", "End Time", "Timesteps", "Error Flag"])?;
    for record in sorted {
        out.write_record([
            record.variable_name.clone().unwrap_or_default(),
            format_timestamp(&record.start_time),
            format_timestamp(&record.end_time),
            record.timesteps.to_string(),
            record.error_flag.clone(),
        ])?;
    }
    out.flush()?;
    Ok(())
}

/// One row per named metric, one column per data column. Missing values
/// are written as `NaN`.
pub fn write_metrics_csv<W: Write>(
    writer: W,
    metrics: &[(String, ColumnMetric)],
) -> Result<(), IoError> {
    let mut columns: Vec<&str> = Vec::new();
    for (_, values) in metrics {
        for (name, _) in values {
            if !columns.contains(&name.as_str()) {
                columns.push(name);
            }
        }
    }

    let mut out = WriterBuilder::new().from_writer(writer);
    let mut header = vec!["Metric"];
    header.extend(columns.iter().copied());
    out.write_record(&header)?;
    for (metric, values) in metrics {
        let mut record = vec![metric.clone()];
        record.extend(columns.iter().map(|column| {
            values
                .iter()
                .find(|(name, _)| name == column)
                .map_or(f64::NAN, |(_, v)| *v)
                .to_string()
        }));
        out.write_record(&record)?;
    }
    out.flush()?;
    Ok(())
}

/// Machine-readable account of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary<'a> {
    pub tests_run: usize,
    pub test_results: &'a [FailureRecord],
    pub notes: &'a [Note],
}

pub fn write_summary_json<W: Write>(writer: W, summary: &RunSummary<'_>) -> Result<(), IoError> {
    serde_json::to_writer_pretty(writer, summary)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use qc_columnar::BitMask;
    use qc_frame::{MaskFrame, TimeFrame};
    use qc_index::TimeIndex;
    use qc_types::{FailureRecord, Note, NoteKind, Timestamp};

    use super::{
        IoError, RunSummary, parse_timestamp, read_csv_str, write_frame_csv, write_mask_csv,
        write_metrics_csv, write_summary_json, write_test_results_csv,
    };

    fn ts(h: u32, m: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2015, 1, 1)
            .and_then(|d| d.and_hms_opt(h, m, 0))
            .expect("valid timestamp")
    }

    fn utf8(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).expect("utf8")
    }

    #[test]
    fn reads_timestamps_and_missing_cells() {
        let input = "time,A,B\n2015-01-01 00:00:00,1.5,\n2015-01-01 00:15,abc,2\n";
        let frame = read_csv_str(input).expect("read");
        assert_eq!(frame.index().labels(), &[ts(0, 0), ts(0, 15)]);
        assert_eq!(frame.column_names(), &["A".to_owned(), "B".to_owned()]);
        let a = frame.column("A").expect("A");
        assert_eq!(a.values()[0], 1.5);
        assert!(a.is_missing(1));
        assert!(frame.column("B").expect("B").is_missing(0));
    }

    #[test]
    fn unsorted_rows_keep_file_order() {
        let input = "time,A\n2015-01-01 01:00:00,1\n2015-01-01 00:00:00,2\n";
        let frame = read_csv_str(input).expect("read");
        assert_eq!(frame.index().labels(), &[ts(1, 0), ts(0, 0)]);
    }

    #[test]
    fn rejects_bad_timestamps_and_headerless_input() {
        assert!(matches!(
            read_csv_str("time,A\nyesterday,1\n"),
            Err(IoError::InvalidTimestamp { row: 0, .. })
        ));
        assert!(matches!(read_csv_str("time\n2015-01-01,1\n"), Err(IoError::NoDataColumns)));
    }

    #[test]
    fn timestamp_layouts() {
        assert_eq!(parse_timestamp("2015-01-01T05:30:00"), Some(ts(5, 30)));
        assert_eq!(parse_timestamp("01/01/2015 05:30"), Some(ts(5, 30)));
        assert_eq!(parse_timestamp("2015-01-01"), Some(ts(0, 0)));
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn frame_csv_round_trips() {
        let frame = TimeFrame::from_values(
            TimeIndex::new(vec![ts(0, 0), ts(1, 0)]),
            vec![("A", vec![1.0, f64::NAN]), ("B", vec![0.25, 3.0])],
        )
        .expect("frame");
        let mut buf = Vec::new();
        write_frame_csv(&mut buf, &frame).expect("write");
        let text = utf8(buf);
        assert_eq!(
            text,
            "timestamp,A,B\n2015-01-01 00:00:00,1,0.25\n2015-01-01 01:00:00,,3\n"
        );
        let back = read_csv_str(&text).expect("read");
        assert_eq!(back.index(), frame.index());
        assert!(back.column("A").expect("A").is_missing(1));
    }

    #[test]
    fn mask_csv_uses_booleans() {
        let mask = MaskFrame::new(
            TimeIndex::new(vec![ts(0, 0), ts(1, 0)]),
            vec![("A".to_owned(), BitMask::from_bools(&[true, false]))],
        )
        .expect("mask");
        let mut buf = Vec::new();
        write_mask_csv(&mut buf, &mask).expect("write");
        assert_eq!(
            utf8(buf),
            "timestamp,A\n2015-01-01 00:00:00,true\n2015-01-01 01:00:00,false\n"
        );
    }

    #[test]
    fn test_results_are_sorted_with_index_level_first() {
        let records = vec![
            FailureRecord {
                variable_name: Some("B".to_owned()),
                start_time: ts(3, 0),
                end_time: ts(4, 0),
                timesteps: 2,
                error_flag: "Data > upper bound, 1".to_owned(),
            },
            FailureRecord {
                variable_name: None,
                start_time: ts(5, 0),
                end_time: ts(5, 0),
                timesteps: 1,
                error_flag: "Missing timestamp".to_owned(),
            },
            FailureRecord {
                variable_name: Some("A".to_owned()),
                start_time: ts(7, 0),
                end_time: ts(7, 0),
                timesteps: 1,
                error_flag: "Missing data".to_owned(),
            },
        ];
        let mut buf = Vec::new();
        write_test_results_csv(&mut buf, &records).expect("write");
        let text = utf8(buf);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Variable Name,Start Time,End Time,Timesteps,Error Flag");
        assert_eq!(lines[1], ",2015-01-01 05:00:00,2015-01-01 05:00:00,1,Missing timestamp");
        assert!(lines[2].starts_with("A,"));
        assert!(lines[3].starts_with("B,"));
    }

    #[test]
    fn metrics_fill_absent_columns_with_nan() {
        let metrics = vec![
            ("QCI".to_owned(), vec![("A".to_owned(), 0.5), ("B".to_owned(), 1.0)]),
            ("RMSE".to_owned(), vec![("B".to_owned(), 0.25)]),
        ];
        let mut buf = Vec::new();
        write_metrics_csv(&mut buf, &metrics).expect("write");
        assert_eq!(utf8(buf), "Metric,A,B\nQCI,0.5,1\nRMSE,NaN,0.25\n");
    }

    #[test]
    fn summary_lists_records_and_notes() {
        let notes = vec![Note::new("delta", NoteKind::InsufficientData, "window too long").for_variable("A")];
        let summary = RunSummary {
            tests_run: 2,
            test_results: &[],
            notes: &notes,
        };
        let mut buf = Vec::new();
        write_summary_json(&mut buf, &summary).expect("write");
        let value: serde_json::Value = serde_json::from_slice(&buf).expect("json");
        assert_eq!(value["tests_run"], 2);
        assert_eq!(value["notes"][0]["kind"], "insufficient_data");
        assert_eq!(value["notes"][0]["variable"], "A");
    }
}
