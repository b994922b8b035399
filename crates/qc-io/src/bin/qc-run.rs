#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;

use qc_io::{
    RunSummary, read_csv_path, write_frame_csv, write_mask_csv, write_metrics_csv,
    write_summary_json, write_test_results_csv,
};
use qc_monitor::metrics::qci;
use qc_monitor::{Monitor, QcPlan};
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::level_filters::LevelFilter::INFO.into()),
        )
        .init();

    let mut data_files: Vec<PathBuf> = Vec::new();
    let mut plan_file: Option<PathBuf> = None;
    let mut out_dir = PathBuf::from(".");

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--data" => {
                let value = args.next().ok_or("--data requires a CSV file")?;
                data_files.push(PathBuf::from(value));
            }
            "--plan" => {
                let value = args.next().ok_or("--plan requires a JSON file")?;
                plan_file = Some(PathBuf::from(value));
            }
            "--out" => {
                let value = args.next().ok_or("--out requires a directory")?;
                out_dir = PathBuf::from(value);
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                return Err(format!("unknown argument: {other}").into());
            }
        }
    }

    if data_files.is_empty() {
        return Err("at least one --data file is required".into());
    }
    let plan_file = plan_file.ok_or("--plan is required")?;

    let mut monitor = Monitor::new();
    for path in &data_files {
        monitor.add_data(read_csv_path(path)?)?;
    }
    let plan = QcPlan::from_json(&fs::read_to_string(&plan_file)?)?;
    let reports = monitor.run_plan(&plan)?;
    for report in &reports {
        println!("test={} records={} notes={}", report.test, report.records.len(), report.notes.len());
    }

    fs::create_dir_all(&out_dir)?;
    let mask = monitor.mask()?;
    let cleaned = monitor.cleaned_data()?;
    let metrics = vec![("QCI".to_owned(), qci(&mask, monitor.time_filter()))];

    write_frame_csv(BufWriter::new(File::create(out_dir.join("cleaned_data.csv"))?), &cleaned)?;
    write_mask_csv(BufWriter::new(File::create(out_dir.join("mask.csv"))?), &mask)?;
    write_test_results_csv(
        BufWriter::new(File::create(out_dir.join("test_results.csv"))?),
        monitor.test_results(),
    )?;
    write_metrics_csv(BufWriter::new(File::create(out_dir.join("metrics.csv"))?), &metrics)?;
    write_summary_json(
        BufWriter::new(File::create(out_dir.join("summary.json"))?),
        &RunSummary {
            tests_run: monitor.tests_run(),
            test_results: monitor.test_results(),
            notes: monitor.notes(),
        },
    )?;
    info!(out = %out_dir.display(), records = monitor.test_results().len(), "results written");
    Ok(())
}

fn print_help() {
    println!("qc-run --data FILE [--data FILE ...] --plan PLAN.json [--out DIR]");
    println!();
    println!("Runs a quality control plan over time-indexed CSV data and writes");
    println!("cleaned_data.csv, mask.csv, test_results.csv, metrics.csv and summary.json.");
    println!("Set RUST_LOG to adjust logging (default: info).");
}
