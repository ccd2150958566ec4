use crate::model::{RelocationOutcome, RunReport, UsageSampling};

pub fn render_markdown_summary(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str("# Disk Reclaim Summary\n\n");
    out.push_str(&format!(
        "- Report version: `{}`\n- Run id: `{}`\n- Generated at: `{}`\n- Volume: `{}`\n- Dry run: `{}`\n\n",
        report.report_version, report.run_id, report.generated_at, report.volume_id, report.dry_run
    ));

    out.push_str("## Reclaimed Space\n\n");
    if report.summary.reclaimed.is_empty() {
        out.push_str("No before/after samples to compare.\n\n");
    } else {
        for entry in &report.summary.reclaimed {
            out.push_str(&format!(
                "- `{}`: {}\n",
                entry.volume_id,
                signed_bytes(entry.freed_bytes)
            ));
        }
        out.push('\n');
    }

    out.push_str("## Volume Usage\n\n");
    push_usage(&mut out, "Before", &report.usage_before);
    push_usage(&mut out, "After", &report.usage_after);

    out.push_str("## Cleanup Actions\n\n");
    if report.cleanup.is_empty() {
        out.push_str("No cleanup actions.\n\n");
    } else {
        for action in &report.cleanup {
            let row = action.to_row();
            out.push_str(&format!("- `{}` ({:?}): {}", row.name, row.kind, row.outcome));
            if let Some(reason) = row.reason {
                out.push_str(&format!(" ({reason})"));
            }
            if action.stats.removed_entries > 0 {
                out.push_str(&format!(
                    ", removed {} entr(ies), {}",
                    action.stats.removed_entries,
                    human_bytes(action.stats.removed_bytes)
                ));
            }
            out.push('\n');
        }
        out.push('\n');
    }

    out.push_str(&format!(
        "## Large Files (> {})\n\n",
        human_bytes(report.large_files.threshold_bytes)
    ));
    if report.large_files.files.is_empty() {
        out.push_str("No files above the threshold.\n\n");
    } else {
        for file in &report.large_files.files {
            out.push_str(&format!(
                "- `{}` ({})\n",
                file.path,
                human_bytes(file.size_bytes)
            ));
        }
        out.push('\n');
    }

    out.push_str("## Largest Directories\n\n");
    if report.directories.records.is_empty() {
        out.push_str("No directories aggregated.\n\n");
    } else {
        for record in &report.directories.records {
            out.push_str(&format!(
                "- `{}`: {}, {} file(s){}\n",
                record.path,
                human_bytes(record.total_bytes),
                record.file_count,
                if record.partial { " (partial)" } else { "" }
            ));
        }
        if report.directories.truncated > 0 {
            out.push_str(&format!(
                "- ... {} smaller director(ies) omitted\n",
                report.directories.truncated
            ));
        }
        out.push('\n');
    }

    if let Some(plan) = &report.relocation.plan {
        out.push_str("## Relocation\n\n");
        out.push_str(&format!(
            "- Destination: `{}` (`{}`)\n- Executed: `{}`\n",
            plan.destination_root.display(),
            plan.destination_volume,
            report.relocation.executed
        ));
        if report.relocation.executed {
            for result in &report.relocation.results {
                let status = match &result.outcome {
                    RelocationOutcome::Moved { .. } => "moved".to_string(),
                    RelocationOutcome::SkippedExists { .. } => {
                        "skipped, destination exists".to_string()
                    }
                    RelocationOutcome::Failed { reason } => format!("failed: {reason}"),
                    RelocationOutcome::Cancelled => "cancelled".to_string(),
                };
                out.push_str(&format!("  - `{}`: {status}\n", result.file.path));
            }
        } else {
            for file in &plan.files {
                out.push_str(&format!("  - would move `{}`\n", file.path));
            }
        }
        out.push('\n');
    }

    let failed_roots = report
        .large_files
        .failed_roots
        .iter()
        .chain(&report.directories.failed_roots)
        .collect::<Vec<_>>();
    let samples = report
        .directories
        .walks
        .iter()
        .flat_map(|walk| &walk.error_samples)
        .collect::<Vec<_>>();
    if !failed_roots.is_empty() || !samples.is_empty() {
        out.push_str(&format!(
            "## Traversal Errors ({})\n\n",
            report.summary.traversal_errors
        ));
        for error in failed_roots.into_iter().chain(samples) {
            out.push_str(&format!("- `{}`: {}\n", error.path, error.reason));
        }
    }

    out
}

fn push_usage(out: &mut String, label: &str, sampling: &UsageSampling) {
    out.push_str(&format!("### {label}\n\n"));
    for sample in &sampling.samples {
        let row = sample.to_row();
        out.push_str(&format!(
            "- `{}`: used {} ({}%), free {} ({}%)\n",
            row.volume_id,
            human_bytes(row.used_bytes),
            row.used_percent,
            human_bytes(row.free_bytes),
            row.free_percent
        ));
    }
    for failure in &sampling.failures {
        out.push_str(&format!(
            "- `{}`: unavailable ({})\n",
            failure.volume_id, failure.reason
        ));
    }
    out.push('\n');
}

fn signed_bytes(value: i64) -> String {
    let magnitude = human_bytes(value.unsigned_abs());
    if value < 0 {
        format!("-{magnitude}")
    } else {
        magnitude
    }
}

pub fn human_bytes(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if value == 0 {
        return "0 B".to_string();
    }
    let mut size = value as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}
