use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReclaimError, Result};

pub const REPORT_VERSION: &str = "1.0.0";

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn bytes_to_gib(bytes: u64) -> f64 {
    round2(bytes as f64 / GIB as f64)
}

pub fn bytes_to_mib(bytes: u64) -> f64 {
    round2(bytes as f64 / MIB as f64)
}

pub(crate) fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeUsageSample {
    pub volume_id: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub sampled_at: String,
}

impl VolumeUsageSample {
    /// Captures a sample, rejecting capacity figures where free space
    /// exceeds the volume size.
    pub fn new(volume_id: impl Into<String>, total_bytes: u64, free_bytes: u64) -> Result<Self> {
        let volume_id = volume_id.into();
        if free_bytes > total_bytes {
            return Err(ReclaimError::VolumeUnavailable {
                volume_id,
                reason: format!(
                    "reported free space {free_bytes} exceeds capacity {total_bytes}"
                ),
            });
        }
        Ok(Self {
            volume_id,
            total_bytes,
            free_bytes,
            sampled_at: timestamp_now(),
        })
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }

    pub fn used_percent(&self) -> f64 {
        percent_of(self.used_bytes(), self.total_bytes)
    }

    pub fn free_percent(&self) -> f64 {
        percent_of(self.free_bytes, self.total_bytes)
    }

    pub fn to_row(&self) -> VolumeUsageRow {
        VolumeUsageRow {
            volume_id: self.volume_id.clone(),
            used_bytes: self.used_bytes(),
            used_percent: self.used_percent(),
            free_bytes: self.free_bytes,
            free_percent: self.free_percent(),
        }
    }
}

fn percent_of(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round2(part as f64 * 100.0 / whole as f64)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeUsageRow {
    pub volume_id: String,
    pub used_bytes: u64,
    pub used_percent: f64,
    pub free_bytes: u64,
    pub free_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeFailure {
    pub volume_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UsageSampling {
    pub samples: Vec<VolumeUsageSample>,
    pub failures: Vec<VolumeFailure>,
}

impl UsageSampling {
    pub fn sample_for(&self, volume_id: &str) -> Option<&VolumeUsageSample> {
        self.samples
            .iter()
            .find(|sample| sample.volume_id == volume_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LargeFileRecord {
    pub path: String,
    pub size_bytes: u64,
}

impl LargeFileRecord {
    pub fn to_row(&self) -> LargeFileRow {
        LargeFileRow {
            path: self.path.clone(),
            size_gib: bytes_to_gib(self.size_bytes),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LargeFileRow {
    pub path: String,
    pub size_gib: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectorySizeRecord {
    pub path: String,
    pub total_bytes: u64,
    pub file_count: u64,
    /// Set when the directory (or something beneath it) could not be read.
    #[serde(default)]
    pub partial: bool,
}

impl DirectorySizeRecord {
    pub fn to_row(&self) -> DirectorySizeRow {
        DirectorySizeRow {
            path: self.path.clone(),
            size_gib: bytes_to_gib(self.total_bytes),
            size_mib: bytes_to_mib(self.total_bytes),
            file_count: self.file_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectorySizeRow {
    pub path: String,
    pub size_gib: f64,
    pub size_mib: f64,
    pub file_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraversalErrorRecord {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WalkSummary {
    pub root: String,
    pub files_seen: u64,
    pub directories_seen: u64,
    pub bytes_seen: u64,
    pub error_count: u64,
    /// The first few failing paths; `error_count` holds the full tally.
    pub error_samples: Vec<TraversalErrorRecord>,
    pub aborted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LargeFileReport {
    pub threshold_bytes: u64,
    pub files: Vec<LargeFileRecord>,
    pub walks: Vec<WalkSummary>,
    pub failed_roots: Vec<TraversalErrorRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectorySizeReport {
    pub records: Vec<DirectorySizeRecord>,
    pub walks: Vec<WalkSummary>,
    pub failed_roots: Vec<TraversalErrorRecord>,
    pub partial_directories: u64,
    /// Records dropped by `directory_report_limit`.
    pub truncated: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    PathDeletion,
    ExternalCommand,
    ServiceToggle,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    /// Remove everything inside the directory but keep the directory.
    #[default]
    ClearContents,
    /// Remove the path itself.
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathTarget {
    pub path: PathBuf,
    #[serde(default)]
    pub mode: DeleteMode,
}

impl PathTarget {
    pub fn clear(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: DeleteMode::ClearContents,
        }
    }

    pub fn remove(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: DeleteMode::Remove,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Exit codes treated as success; empty means only `0`.
    #[serde(default)]
    pub success_codes: Vec<i32>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            success_codes: Vec::new(),
        }
    }

    pub fn with_success_codes(mut self, codes: &[i32]) -> Self {
        self.success_codes = codes.to_vec();
        self
    }

    pub fn is_success(&self, code: i32) -> bool {
        if self.success_codes.is_empty() {
            code == 0
        } else {
            self.success_codes.contains(&code)
        }
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSpec {
    pub service: String,
    pub desired: ServiceState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionTarget {
    PathDeletion { paths: Vec<PathTarget> },
    ExternalCommand { command: CommandSpec },
    ServiceToggle { service: ServiceSpec },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Succeeded,
    /// Succeeded only because a "file in use" error cleared on retry.
    SucceededAfterRetry { retries: u64 },
    SkippedNotFound,
    Failed { reason: String },
    /// Not started because the run was cancelled.
    Cancelled,
}

impl ActionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::SucceededAfterRetry { .. } => "succeeded_after_retry",
            Self::SkippedNotFound => "skipped_not_found",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::SucceededAfterRetry { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ActionStats {
    pub removed_entries: u64,
    pub removed_bytes: u64,
    pub failed_entries: u64,
    pub retries: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupAction {
    pub name: String,
    pub target: ActionTarget,
    #[serde(default)]
    pub outcome: Option<ActionOutcome>,
    #[serde(default)]
    pub stats: ActionStats,
}

impl CleanupAction {
    pub fn new(name: impl Into<String>, target: ActionTarget) -> Self {
        Self {
            name: name.into(),
            target,
            outcome: None,
            stats: ActionStats::default(),
        }
    }

    pub fn path_deletion(name: impl Into<String>, paths: Vec<PathTarget>) -> Self {
        Self::new(name, ActionTarget::PathDeletion { paths })
    }

    pub fn external_command(name: impl Into<String>, command: CommandSpec) -> Self {
        Self::new(name, ActionTarget::ExternalCommand { command })
    }

    pub fn service_toggle(
        name: impl Into<String>,
        service: impl Into<String>,
        desired: ServiceState,
    ) -> Self {
        Self::new(
            name,
            ActionTarget::ServiceToggle {
                service: ServiceSpec {
                    service: service.into(),
                    desired,
                },
            },
        )
    }

    pub fn kind(&self) -> ActionKind {
        match self.target {
            ActionTarget::PathDeletion { .. } => ActionKind::PathDeletion,
            ActionTarget::ExternalCommand { .. } => ActionKind::ExternalCommand,
            ActionTarget::ServiceToggle { .. } => ActionKind::ServiceToggle,
        }
    }

    pub fn to_row(&self) -> ActionOutcomeRow {
        ActionOutcomeRow {
            name: self.name.clone(),
            kind: self.kind(),
            outcome: self
                .outcome
                .as_ref()
                .map_or("pending", ActionOutcome::label)
                .to_string(),
            reason: self
                .outcome
                .as_ref()
                .and_then(ActionOutcome::reason)
                .map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionOutcomeRow {
    pub name: String,
    pub kind: ActionKind,
    pub outcome: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelocationPlan {
    pub files: Vec<LargeFileRecord>,
    pub destination_volume: String,
    pub destination_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RelocationOutcome {
    Moved { destination: PathBuf },
    /// Left in place because the destination already holds a file.
    SkippedExists { destination: PathBuf },
    Failed { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelocationResult {
    pub file: LargeFileRecord,
    pub outcome: RelocationOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RelocationReport {
    pub plan: Option<RelocationPlan>,
    pub executed: bool,
    pub results: Vec<RelocationResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReclaimedSpace {
    pub volume_id: String,
    /// After-minus-before free space; negative when the volume filled up.
    pub freed_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub actions_succeeded: u64,
    pub actions_skipped: u64,
    pub actions_failed: u64,
    pub actions_cancelled: u64,
    pub traversal_errors: u64,
    pub partial_directories: u64,
    pub volumes_unavailable: u64,
    pub relocations_moved: u64,
    pub relocations_skipped: u64,
    pub relocations_failed: u64,
    pub reclaimed: Vec<ReclaimedSpace>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    UsageBefore,
    Cleanup,
    LargeFiles,
    DirectorySizes,
    Relocation,
    UsageAfter,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    pub seq: u64,
    pub run_id: String,
    pub phase: RunPhase,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub report_version: String,
    pub run_id: String,
    pub generated_at: String,
    pub volume_id: String,
    pub dry_run: bool,
    pub usage_before: UsageSampling,
    pub cleanup: Vec<CleanupAction>,
    pub large_files: LargeFileReport,
    pub directories: DirectorySizeReport,
    pub relocation: RelocationReport,
    pub usage_after: UsageSampling,
    pub summary: RunSummary,
}
