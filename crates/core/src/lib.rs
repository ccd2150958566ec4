pub mod cleanup;
pub mod config;
pub mod dirsize;
pub mod error;
pub mod large_files;
pub mod markdown;
pub mod model;
pub mod plan;
pub mod relocate;
pub mod session;
pub mod usage;
pub mod walk;

pub use cleanup::{service_command, CleanupActionRunner, CommandLauncher, SystemLauncher};
pub use config::{default_scan_roots, CleanupConfig, RelocationConfig, RunConfig};
pub use dirsize::{sort_records, DirectoryAggregation, DirectorySizeAggregator};
pub use error::{ReclaimError, Result};
pub use large_files::{LargeFileScan, LargeFileScanner, DEFAULT_LARGE_FILE_THRESHOLD};
pub use markdown::{human_bytes, render_markdown_summary};
pub use model::{
    ActionKind, ActionOutcome, ActionOutcomeRow, ActionStats, ActionTarget, CleanupAction,
    CommandSpec, DeleteMode, DirectorySizeRecord, DirectorySizeReport, DirectorySizeRow, FileEntry,
    LargeFileRecord, LargeFileReport, LargeFileRow, PathTarget, ReclaimedSpace, RelocationOutcome,
    RelocationPlan, RelocationReport, RelocationResult, RunEvent, RunPhase, RunReport, RunSummary,
    ServiceSpec, ServiceState, TraversalErrorRecord, UsageSampling, VolumeFailure,
    VolumeUsageRow, VolumeUsageSample, WalkSummary, GIB, MIB, REPORT_VERSION,
};
pub use plan::{build_actions, default_actions, PlanPlatform};
pub use relocate::{destination_for, RelocationPlanner};
pub use session::{run_session, run_session_with_callback, summarize, RunOutput, RunSession};
pub use usage::{
    detect_system_volume, detect_volumes, normalize_volume_id, relocation_targets, volume_of,
    volume_root, DetectedVolume, SysinfoProbe, UsageReporter, VolumeCapacity, VolumeProbe,
};
pub use walk::{ErrorPolicy, ExcludeMatcher, FilesystemWalker, Walk, WalkPolicy};
