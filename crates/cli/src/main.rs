mod export;
mod logging;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ArgAction;
use clap::{Args, Parser, Subcommand};
use disk_reclaim_core::{
    build_actions, detect_volumes, human_bytes, render_markdown_summary, sort_records,
    CleanupActionRunner, DirectorySizeAggregator, ExcludeMatcher, FilesystemWalker,
    LargeFileScanner, RunConfig, RunReport, RunSession, SysinfoProbe, SystemLauncher,
    UsageReporter,
};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(
    name = "disk-reclaim",
    version,
    about = "Reclaim disk space: clean known junk, report usage, large files and directory sizes."
)]
struct Cli {
    /// Also write logs to this file (no colors).
    #[arg(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full run: usage, cleanup, large files, directory sizes, relocation, usage.
    Run(RunArgs),
    /// Sample used/free space for one or more volumes.
    Usage(UsageArgs),
    /// List files larger than a threshold.
    LargeFiles(LargeFilesArgs),
    /// Aggregate recursive directory sizes.
    DirSizes(DirSizesArgs),
    /// Run only the cleanup actions.
    Clean(CleanArgs),
    /// Print the cleanup actions a run would execute, without running them.
    Plan(PlanArgs),
    /// List detected volumes.
    Volumes,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// JSON run configuration. Flags below override its values.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Target volume id (`C:` or a mount point such as `/`).
    #[arg(long, value_name = "VOLUME")]
    volume: Option<String>,

    /// Scan roots. The first is the primary root.
    #[arg(long = "paths", value_name = "PATH", num_args = 1.., action = ArgAction::Append)]
    paths: Vec<PathBuf>,

    /// Exclude glob or substring patterns (repeatable).
    #[arg(long = "exclude", value_name = "PATTERN", num_args = 1.., action = ArgAction::Append)]
    exclude: Vec<String>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Large-file threshold in bytes; strictly larger files are reported.
    #[arg(long, value_name = "BYTES")]
    threshold: Option<u64>,

    /// Plan cleanup and relocation without changing anything.
    #[arg(long)]
    dry_run: bool,

    /// Relocation destinations in preference order (repeatable).
    #[arg(long = "relocate-to", value_name = "VOLUME", num_args = 1.., action = ArgAction::Append)]
    relocate_to: Vec<String>,

    /// Actually move large files to the relocation destination.
    #[arg(long)]
    relocate: bool,

    /// Keep only the largest N directories in the report.
    #[arg(long, value_name = "N")]
    dir_limit: Option<usize>,

    /// Output report path.
    #[arg(long, default_value = "disk-reclaim-report.json", value_name = "FILE")]
    output: PathBuf,

    /// Also write one CSV per table into this directory.
    #[arg(long, value_name = "DIR")]
    csv_dir: Option<PathBuf>,

    /// Optional markdown summary output file.
    #[arg(long, value_name = "FILE")]
    md: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct UsageArgs {
    /// Volume ids to sample. Defaults to the system volume.
    #[arg(long = "volume", value_name = "VOLUME", num_args = 1.., action = ArgAction::Append)]
    volumes: Vec<String>,

    #[arg(long, value_name = "FILE")]
    csv: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct LargeFilesArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long, value_name = "BYTES")]
    threshold: Option<u64>,

    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    csv: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DirSizesArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Show only the largest N directories.
    #[arg(long, default_value_t = 20, value_name = "N")]
    top: usize,

    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    csv: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CleanArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init_tracing(cli.log_file.as_deref())?;

    match cli.command {
        Commands::Run(args) => run_run_command(args),
        Commands::Usage(args) => run_usage_command(args),
        Commands::LargeFiles(args) => run_large_files_command(args),
        Commands::DirSizes(args) => run_dir_sizes_command(args),
        Commands::Clean(args) => run_clean_command(args),
        Commands::Plan(args) => run_plan_command(args),
        Commands::Volumes => {
            run_volumes_command();
            Ok(())
        }
    }
}

fn load_config(args: &ConfigArgs) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => RunConfig::default(),
    };
    apply_overrides(&mut config, args);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn apply_overrides(config: &mut RunConfig, args: &ConfigArgs) {
    if let Some(volume) = &args.volume {
        config.volume_id = volume.clone();
        if args.config.is_none() && args.paths.is_empty() {
            config.scan_roots = disk_reclaim_core::default_scan_roots(volume);
        }
    }
    if !args.paths.is_empty() {
        config.scan_roots = args.paths.clone();
    }
    config.excludes.extend(args.exclude.iter().cloned());
}

fn run_run_command(args: RunArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;
    if let Some(threshold) = args.threshold {
        config.large_file_threshold_bytes = threshold;
    }
    if !args.relocate_to.is_empty() {
        config.relocation.candidate_volumes = args.relocate_to.clone();
    }
    config.relocation.execute |= args.relocate;
    config.dry_run |= args.dry_run;
    if args.dir_limit.is_some() {
        config.directory_report_limit = args.dir_limit;
    }

    let probe = SysinfoProbe;
    let launcher = SystemLauncher;
    let report = RunSession::new(&config, &probe, &launcher).run()?;

    export::write_json(&args.output, &report)?;
    println!("Report written to {}", args.output.display());
    if let Some(dir) = &args.csv_dir {
        export::write_run_csvs(dir, &report)?;
        println!("CSV tables written to {}", dir.display());
    }
    if let Some(md_path) = &args.md {
        fs::write(md_path, render_markdown_summary(&report)).with_context(|| {
            format!("failed to write markdown summary to {}", md_path.display())
        })?;
        println!("Markdown summary written to {}", md_path.display());
    }

    print_run_summary(&report);
    Ok(())
}

fn print_run_summary(report: &RunReport) {
    let summary = &report.summary;
    println!(
        "Cleanup: {} succeeded, {} skipped, {} failed, {} cancelled{}.",
        summary.actions_succeeded,
        summary.actions_skipped,
        summary.actions_failed,
        summary.actions_cancelled,
        if report.dry_run { " (dry run)" } else { "" }
    );
    println!(
        "Found {} large file(s), {} director(ies), {} traversal error(s), {} partial.",
        report.large_files.files.len(),
        report.directories.records.len(),
        summary.traversal_errors,
        summary.partial_directories
    );
    for entry in &summary.reclaimed {
        let freed = human_bytes(entry.freed_bytes.unsigned_abs());
        if entry.freed_bytes < 0 {
            println!("{}: free space dropped by {freed}", entry.volume_id);
        } else {
            println!("{}: reclaimed {freed}", entry.volume_id);
        }
    }
    if summary.volumes_unavailable > 0 {
        println!("{} volume(s) could not be sampled.", summary.volumes_unavailable);
    }
}

fn run_usage_command(args: UsageArgs) -> Result<()> {
    let volumes = if args.volumes.is_empty() {
        vec![disk_reclaim_core::detect_system_volume()]
    } else {
        args.volumes
    };
    let probe = SysinfoProbe;
    let sampling = UsageReporter::new(&probe).sample(&volumes);

    let rows = sampling
        .samples
        .iter()
        .map(|sample| sample.to_row())
        .collect::<Vec<_>>();
    for row in &rows {
        println!(
            "{}: used {} ({}%), free {} ({}%)",
            row.volume_id,
            human_bytes(row.used_bytes),
            row.used_percent,
            human_bytes(row.free_bytes),
            row.free_percent
        );
    }
    for failure in &sampling.failures {
        println!("{}: unavailable ({})", failure.volume_id, failure.reason);
    }
    if let Some(path) = &args.csv {
        export::write_csv(path, &rows)?;
        println!("CSV written to {}", path.display());
    }
    Ok(())
}

fn run_large_files_command(args: LargeFilesArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;
    if let Some(threshold) = args.threshold {
        config.large_file_threshold_bytes = threshold;
    }
    let excludes = compile_excludes(&config);
    let scanner = LargeFileScanner::new(
        FilesystemWalker::new(config.walk.clone()).with_excludes(&excludes),
        config.large_file_threshold_bytes,
    );

    let mut files = Vec::new();
    for root in &config.scan_roots {
        match scanner.scan(root) {
            Ok(scan) => files.extend(scan.files),
            Err(err) if root_is_primary(&config, root) => return Err(err.into()),
            Err(err) => warn!(root = %root.display(), error = %err, "scan root skipped"),
        }
    }
    files.sort_by(|a, b| {
        b.size_bytes
            .cmp(&a.size_bytes)
            .then_with(|| a.path.cmp(&b.path))
    });

    if files.is_empty() {
        println!(
            "No files larger than {}.",
            human_bytes(config.large_file_threshold_bytes)
        );
    }
    for file in &files {
        println!("{:>10}  {}", human_bytes(file.size_bytes), file.path);
    }

    if let Some(path) = &args.output {
        export::write_json(path, &files)?;
        println!("JSON written to {}", path.display());
    }
    if let Some(path) = &args.csv {
        let rows = files.iter().map(|file| file.to_row()).collect::<Vec<_>>();
        export::write_csv(path, &rows)?;
        println!("CSV written to {}", path.display());
    }
    Ok(())
}

fn run_dir_sizes_command(args: DirSizesArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let excludes = compile_excludes(&config);
    let walker = FilesystemWalker::new(config.walk.clone()).with_excludes(&excludes);
    let aggregator = DirectorySizeAggregator::new(walker);

    let mut records = Vec::new();
    for root in &config.scan_roots {
        match aggregator.aggregate(root) {
            Ok(aggregation) => records.extend(aggregation.records),
            Err(err) if root_is_primary(&config, root) => return Err(err.into()),
            Err(err) => warn!(root = %root.display(), error = %err, "scan root skipped"),
        }
    }
    sort_records(&mut records);
    records.truncate(args.top);

    for record in &records {
        println!(
            "{:>10}  {:>8} file(s)  {}{}",
            human_bytes(record.total_bytes),
            record.file_count,
            record.path,
            if record.partial { "  (partial)" } else { "" }
        );
    }

    if let Some(path) = &args.output {
        export::write_json(path, &records)?;
        println!("JSON written to {}", path.display());
    }
    if let Some(path) = &args.csv {
        let rows = records.iter().map(|record| record.to_row()).collect::<Vec<_>>();
        export::write_csv(path, &rows)?;
        println!("CSV written to {}", path.display());
    }
    Ok(())
}

fn run_clean_command(args: CleanArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let launcher = SystemLauncher;
    let actions = CleanupActionRunner::new(&launcher)
        .retry_in_use(config.cleanup.retry_in_use)
        .run(build_actions(&config.cleanup, &config.volume_id));

    for action in &actions {
        let row = action.to_row();
        match row.reason {
            Some(reason) => println!("- {}: {} ({reason})", row.name, row.outcome),
            None => println!("- {}: {}", row.name, row.outcome),
        }
    }
    if let Some(path) = &args.output {
        export::write_json(path, &actions)?;
        println!("JSON written to {}", path.display());
    }
    Ok(())
}

fn run_plan_command(args: PlanArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    let actions = build_actions(&config.cleanup, &config.volume_id);
    println!(
        "{} cleanup action(s) planned for {}:",
        actions.len(),
        config.volume_id
    );
    for action in &actions {
        println!("- {} ({:?})", action.name, action.kind());
    }
    if let Some(path) = &args.output {
        export::write_json(path, &actions)?;
        println!("JSON written to {}", path.display());
    }
    Ok(())
}

fn run_volumes_command() {
    let volumes = detect_volumes();
    println!("Detected volumes: {}", volumes.len());
    for volume in volumes {
        println!(
            "- {} [{}] total={} free={} fs={} removable={} system={}",
            volume.volume_id,
            volume.name,
            human_bytes(volume.total_bytes),
            human_bytes(volume.free_bytes),
            volume.file_system.as_deref().unwrap_or("unknown"),
            volume.is_removable,
            volume.is_system
        );
    }
}

fn compile_excludes(config: &RunConfig) -> ExcludeMatcher {
    let (excludes, warnings) = ExcludeMatcher::compile(&config.excludes);
    for warning in warnings {
        warn!(%warning, "exclude pattern ignored");
    }
    excludes
}

fn root_is_primary(config: &RunConfig, root: &Path) -> bool {
    config.primary_root() == Some(root)
}
