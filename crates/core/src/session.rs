//! One reclamation run: usage sample, cleanup, large-file scan, directory
//! aggregation, relocation, usage sample.

use std::fs;
use std::path::Path;
use std::sync::{atomic::AtomicBool, Arc};

use tracing::{info, warn};
use uuid::Uuid;

use crate::cleanup::{CleanupActionRunner, CommandLauncher};
use crate::config::RunConfig;
use crate::dirsize::{sort_records, DirectorySizeAggregator};
use crate::error::{ReclaimError, Result};
use crate::large_files::LargeFileScanner;
use crate::model::{
    timestamp_now, ActionOutcome, CleanupAction, DirectorySizeReport, LargeFileReport,
    ReclaimedSpace, RelocationOutcome, RelocationReport, RunEvent, RunPhase, RunReport,
    RunSummary, TraversalErrorRecord, UsageSampling, REPORT_VERSION,
};
use crate::plan::build_actions;
use crate::relocate::RelocationPlanner;
use crate::usage::{normalize_volume_id, UsageReporter, VolumeProbe};
use crate::walk::{ExcludeMatcher, FilesystemWalker};

pub struct RunSession<'c> {
    config: &'c RunConfig,
    probe: &'c dyn VolumeProbe,
    launcher: &'c dyn CommandLauncher,
    cancel_flag: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub report: RunReport,
    pub events: Vec<RunEvent>,
}

impl<'c> RunSession<'c> {
    pub fn new(
        config: &'c RunConfig,
        probe: &'c dyn VolumeProbe,
        launcher: &'c dyn CommandLauncher,
    ) -> Self {
        Self {
            config,
            probe,
            launcher,
            cancel_flag: None,
        }
    }

    /// Checked between cleanup actions and between relocation moves.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(flag);
        self
    }

    pub fn run(&self) -> Result<RunReport> {
        self.run_with_callback(|_| {})
    }

    pub fn run_with_events(&self) -> Result<RunOutput> {
        let mut events = Vec::new();
        let report = self.run_with_callback(|event| events.push(event))?;
        Ok(RunOutput { report, events })
    }

    /// Runs every stage in order. Only an unreadable primary scan root
    /// ends the run early, and only when found before anything is deleted.
    /// Roots that fail later are reported in `failed_roots`.
    pub fn run_with_callback<F>(&self, on_event: F) -> Result<RunReport>
    where
        F: FnMut(RunEvent),
    {
        let config = self.config;
        config.validate()?;
        let primary = config
            .primary_root()
            .ok_or_else(|| ReclaimError::Config("at least one scan root is required".to_string()))?;
        ensure_readable(primary)?;

        let mut events = EventSink {
            run_id: Uuid::new_v4().to_string(),
            seq: 0,
            on_event,
        };
        info!(
            run_id = %events.run_id,
            volume = %config.volume_id,
            dry_run = config.dry_run,
            "run started"
        );

        let (excludes, exclude_warnings) = ExcludeMatcher::compile(&config.excludes);
        for warning in &exclude_warnings {
            warn!(%warning, "exclude pattern ignored");
        }
        let walker = FilesystemWalker::new(config.walk.clone()).with_excludes(&excludes);

        let candidates = self.candidate_volumes();
        let mut sampled_volumes = vec![config.volume_id.clone()];
        sampled_volumes.extend(candidates.iter().cloned());
        let reporter = UsageReporter::new(self.probe);

        events.emit(RunPhase::UsageBefore);
        let usage_before = reporter.sample(&sampled_volumes);

        events.emit(RunPhase::Cleanup);
        let cleanup = self.run_cleanup(build_actions(&config.cleanup, &config.volume_id));

        events.emit(RunPhase::LargeFiles);
        let large_files = scan_large_files(
            &LargeFileScanner::new(walker.clone(), config.large_file_threshold_bytes),
            config,
        );

        events.emit(RunPhase::DirectorySizes);
        let directories = aggregate_directories(&DirectorySizeAggregator::new(walker), config);

        events.emit(RunPhase::Relocation);
        let relocation = self.relocate(&large_files, &candidates);

        events.emit(RunPhase::UsageAfter);
        let usage_after = reporter.sample(&sampled_volumes);

        let mut report = RunReport {
            report_version: REPORT_VERSION.to_string(),
            run_id: events.run_id.clone(),
            generated_at: timestamp_now(),
            volume_id: config.volume_id.clone(),
            dry_run: config.dry_run,
            usage_before,
            cleanup,
            large_files,
            directories,
            relocation,
            usage_after,
            summary: RunSummary::default(),
        };
        report.summary = summarize(&report);
        events.emit(RunPhase::Done);

        info!(
            run_id = %report.run_id,
            actions_failed = report.summary.actions_failed,
            traversal_errors = report.summary.traversal_errors,
            large_files = report.large_files.files.len(),
            "run finished"
        );
        Ok(report)
    }

    fn candidate_volumes(&self) -> Vec<String> {
        let configured = &self.config.relocation.candidate_volumes;
        let source = normalize_volume_id(&self.config.volume_id);
        let volumes = if configured.is_empty() {
            self.probe.relocation_targets()
        } else {
            configured.clone()
        };
        volumes
            .into_iter()
            .filter(|volume| !normalize_volume_id(volume).eq_ignore_ascii_case(&source))
            .collect()
    }

    fn run_cleanup(&self, actions: Vec<CleanupAction>) -> Vec<CleanupAction> {
        if self.config.dry_run {
            info!(actions = actions.len(), "dry run; cleanup actions planned only");
            return actions;
        }
        let mut runner = CleanupActionRunner::new(self.launcher)
            .retry_in_use(self.config.cleanup.retry_in_use);
        if let Some(flag) = &self.cancel_flag {
            runner = runner.with_cancel_flag(Arc::clone(flag));
        }
        runner.run(actions)
    }

    fn relocate(&self, large_files: &LargeFileReport, candidates: &[String]) -> RelocationReport {
        let planner = RelocationPlanner::new(&self.config.relocation.subfolder);
        let Some(plan) = planner.plan(&large_files.files, candidates, &self.config.volume_id) else {
            return RelocationReport::default();
        };

        let execute = self.config.relocation.execute && !self.config.dry_run;
        if !execute {
            info!(
                files = plan.files.len(),
                destination = %plan.destination_root.display(),
                "relocation planned, not executed"
            );
            return RelocationReport {
                plan: Some(plan),
                executed: false,
                results: Vec::new(),
            };
        }

        let results = planner.execute(&plan, self.cancel_flag.as_deref());
        RelocationReport {
            plan: Some(plan),
            executed: true,
            results,
        }
    }
}

pub fn run_session(
    config: &RunConfig,
    probe: &dyn VolumeProbe,
    launcher: &dyn CommandLauncher,
) -> Result<RunReport> {
    RunSession::new(config, probe, launcher).run()
}

pub fn run_session_with_callback<F>(
    config: &RunConfig,
    probe: &dyn VolumeProbe,
    launcher: &dyn CommandLauncher,
    on_event: F,
) -> Result<RunReport>
where
    F: FnMut(RunEvent),
{
    RunSession::new(config, probe, launcher).run_with_callback(on_event)
}

struct EventSink<F> {
    run_id: String,
    seq: u64,
    on_event: F,
}

impl<F> EventSink<F>
where
    F: FnMut(RunEvent),
{
    fn emit(&mut self, phase: RunPhase) {
        self.seq = self.seq.saturating_add(1);
        (self.on_event)(RunEvent {
            seq: self.seq,
            run_id: self.run_id.clone(),
            phase,
            timestamp: timestamp_now(),
        });
    }
}

fn ensure_readable(root: &Path) -> Result<()> {
    fs::read_dir(root)
        .map(|_| ())
        .map_err(|source| ReclaimError::ScanRootInaccessible {
            path: root.to_path_buf(),
            source,
        })
}

fn root_failure(err: ReclaimError, root: &Path) -> TraversalErrorRecord {
    warn!(root = %root.display(), error = %err, "scan root skipped");
    TraversalErrorRecord {
        path: root.to_string_lossy().to_string(),
        reason: err.to_string(),
    }
}

fn scan_large_files(scanner: &LargeFileScanner<'_>, config: &RunConfig) -> LargeFileReport {
    let mut report = LargeFileReport {
        threshold_bytes: scanner.threshold_bytes(),
        files: Vec::new(),
        walks: Vec::new(),
        failed_roots: Vec::new(),
    };
    for root in &config.scan_roots {
        match scanner.scan(root) {
            Ok(scan) => {
                report.files.extend(scan.files);
                report.walks.push(scan.walk);
            }
            Err(err) => report.failed_roots.push(root_failure(err, root)),
        }
    }
    report.files.sort_by(|a, b| {
        b.size_bytes
            .cmp(&a.size_bytes)
            .then_with(|| a.path.cmp(&b.path))
    });
    report.files.dedup_by(|a, b| a.path == b.path);
    report
}

fn aggregate_directories(
    aggregator: &DirectorySizeAggregator<'_>,
    config: &RunConfig,
) -> DirectorySizeReport {
    let mut report = DirectorySizeReport {
        records: Vec::new(),
        walks: Vec::new(),
        failed_roots: Vec::new(),
        partial_directories: 0,
        truncated: 0,
    };
    for root in &config.scan_roots {
        match aggregator.aggregate(root) {
            Ok(aggregation) => {
                report.partial_directories += aggregation.partial_count();
                report.records.extend(aggregation.records);
                report.walks.push(aggregation.walk);
            }
            Err(err) => report.failed_roots.push(root_failure(err, root)),
        }
    }
    sort_records(&mut report.records);
    if let Some(limit) = config.directory_report_limit {
        if report.records.len() > limit {
            report.truncated = (report.records.len() - limit) as u64;
            report.records.truncate(limit);
        }
    }
    report
}

/// Counts outcomes across the report. Traversal errors come from the
/// directory walks only, since both scans visit the same roots.
pub fn summarize(report: &RunReport) -> RunSummary {
    let mut summary = RunSummary::default();

    for action in &report.cleanup {
        match &action.outcome {
            Some(ActionOutcome::Succeeded | ActionOutcome::SucceededAfterRetry { .. }) => {
                summary.actions_succeeded += 1;
            }
            Some(ActionOutcome::SkippedNotFound) => summary.actions_skipped += 1,
            Some(ActionOutcome::Failed { .. }) => summary.actions_failed += 1,
            Some(ActionOutcome::Cancelled) => summary.actions_cancelled += 1,
            None => {}
        }
    }

    summary.traversal_errors = report
        .directories
        .walks
        .iter()
        .map(|walk| walk.error_count)
        .sum::<u64>()
        + report.directories.failed_roots.len() as u64;
    summary.partial_directories = report.directories.partial_directories;

    let mut unavailable = report
        .usage_before
        .failures
        .iter()
        .chain(&report.usage_after.failures)
        .map(|failure| normalize_volume_id(&failure.volume_id).to_lowercase())
        .collect::<Vec<_>>();
    unavailable.sort();
    unavailable.dedup();
    summary.volumes_unavailable = unavailable.len() as u64;

    for result in &report.relocation.results {
        match result.outcome {
            RelocationOutcome::Moved { .. } => summary.relocations_moved += 1,
            RelocationOutcome::SkippedExists { .. } => summary.relocations_skipped += 1,
            RelocationOutcome::Failed { .. } => summary.relocations_failed += 1,
            RelocationOutcome::Cancelled => {}
        }
    }

    summary.reclaimed = reclaimed_space(&report.usage_before, &report.usage_after);
    summary
}

fn reclaimed_space(before: &UsageSampling, after: &UsageSampling) -> Vec<ReclaimedSpace> {
    before
        .samples
        .iter()
        .filter_map(|start| {
            let end = after.sample_for(&start.volume_id)?;
            Some(ReclaimedSpace {
                volume_id: start.volume_id.clone(),
                freed_bytes: end.free_bytes as i64 - start.free_bytes as i64,
            })
        })
        .collect()
}
