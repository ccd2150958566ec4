use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use disk_reclaim_core::RunReport;
use serde::Serialize;

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("failed to serialize report")?;
    fs::write(path, payload)
        .with_context(|| format!("failed to write report to {}", path.display()))
}

/// One header row, then one row per item. An empty slice leaves an empty file.
pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("failed to write a row to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))
}

/// Writes the run's tables into `dir`, one file per table.
pub fn write_run_csvs(dir: &Path, report: &RunReport) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create csv directory {}", dir.display()))?;

    let usage_before = report
        .usage_before
        .samples
        .iter()
        .map(|sample| sample.to_row())
        .collect::<Vec<_>>();
    let usage_after = report
        .usage_after
        .samples
        .iter()
        .map(|sample| sample.to_row())
        .collect::<Vec<_>>();
    let cleanup = report
        .cleanup
        .iter()
        .map(|action| action.to_row())
        .collect::<Vec<_>>();
    let large_files = report
        .large_files
        .files
        .iter()
        .map(|file| file.to_row())
        .collect::<Vec<_>>();
    let directories = report
        .directories
        .records
        .iter()
        .map(|record| record.to_row())
        .collect::<Vec<_>>();

    write_csv(&dir.join("usage_before.csv"), &usage_before)?;
    write_csv(&dir.join("cleanup.csv"), &cleanup)?;
    write_csv(&dir.join("large_files.csv"), &large_files)?;
    write_csv(&dir.join("directories.csv"), &directories)?;
    write_csv(&dir.join("usage_after.csv"), &usage_after)?;
    Ok(())
}
