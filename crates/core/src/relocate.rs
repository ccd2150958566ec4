use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::error::ReclaimError;
use crate::model::{LargeFileRecord, RelocationOutcome, RelocationPlan, RelocationResult};
use crate::usage::{normalize_volume_id, volume_of, volume_root};

#[derive(Debug, Clone)]
pub struct RelocationPlanner {
    subfolder: String,
}

impl RelocationPlanner {
    pub fn new(subfolder: impl Into<String>) -> Self {
        Self {
            subfolder: subfolder.into(),
        }
    }

    /// Targets the first candidate that is not `source_volume`, in the
    /// order given. Returns `None` when there is nothing to move or nowhere
    /// to move it. Files whose closest mount is the destination volume are
    /// left out.
    pub fn plan(
        &self,
        files: &[LargeFileRecord],
        candidate_volumes: &[String],
        source_volume: &str,
    ) -> Option<RelocationPlan> {
        if files.is_empty() {
            return None;
        }
        let source = normalize_volume_id(source_volume);
        let destination = candidate_volumes
            .iter()
            .find(|candidate| !normalize_volume_id(candidate).eq_ignore_ascii_case(&source))?;

        let destination = normalize_volume_id(destination);
        let volumes = [source, destination.clone()];
        let files = files
            .iter()
            .filter(|file| {
                volume_of(Path::new(&file.path), &volumes) != Some(destination.as_str())
            })
            .cloned()
            .collect::<Vec<_>>();
        if files.is_empty() {
            return None;
        }

        Some(RelocationPlan {
            files,
            destination_root: volume_root(&destination).join(&self.subfolder),
            destination_volume: destination,
        })
    }

    /// Moves each planned file on its own; one failure never blocks the
    /// rest. `cancel` is checked between moves.
    pub fn execute(
        &self,
        plan: &RelocationPlan,
        cancel: Option<&AtomicBool>,
    ) -> Vec<RelocationResult> {
        let mut results = Vec::with_capacity(plan.files.len());
        let mut cancelled = false;

        for file in &plan.files {
            cancelled = cancelled || cancel.is_some_and(|flag| flag.load(Ordering::Relaxed));
            let outcome = if cancelled {
                RelocationOutcome::Cancelled
            } else {
                let source = PathBuf::from(&file.path);
                let destination = destination_for(&plan.destination_root, &source);
                move_file(&source, &destination)
            };

            match &outcome {
                RelocationOutcome::Moved { destination } => info!(
                    from = %file.path,
                    to = %destination.display(),
                    bytes = file.size_bytes,
                    "file relocated"
                ),
                RelocationOutcome::Failed { reason } => {
                    warn!(path = %file.path, %reason, "relocation failed");
                }
                RelocationOutcome::SkippedExists { destination } => {
                    warn!(
                        path = %file.path,
                        destination = %destination.display(),
                        "destination occupied"
                    );
                }
                RelocationOutcome::Cancelled => {}
            }
            results.push(RelocationResult {
                file: file.clone(),
                outcome,
            });
        }
        results
    }
}

/// Mirrors the source path under `root`, dropping its drive and root.
pub fn destination_for(root: &Path, source: &Path) -> PathBuf {
    source
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

fn move_file(source: &Path, destination: &Path) -> RelocationOutcome {
    if destination.exists() {
        return RelocationOutcome::SkippedExists {
            destination: destination.to_path_buf(),
        };
    }
    match try_move(source, destination) {
        Ok(()) => RelocationOutcome::Moved {
            destination: destination.to_path_buf(),
        },
        Err(err) => RelocationOutcome::Failed {
            reason: ReclaimError::RelocationFailed {
                path: source.to_path_buf(),
                reason: err.to_string(),
            }
            .to_string(),
        },
    }
}

fn try_move(source: &Path, destination: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(source)?;
    if !metadata.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "source is not a regular file",
        ));
    }
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }

    // Different volumes: copy, then drop the original.
    if let Err(err) = fs::copy(source, destination) {
        let _ = fs::remove_file(destination);
        return Err(err);
    }
    fs::remove_file(source).map_err(|err| {
        io::Error::new(
            err.kind(),
            format!("copied to {} but source was kept: {err}", destination.display()),
        )
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicBool;

    use tempfile::TempDir;

    use super::{destination_for, RelocationPlanner};
    use crate::model::{LargeFileRecord, RelocationOutcome};

    fn record(path: &Path, size_bytes: u64) -> LargeFileRecord {
        LargeFileRecord {
            path: path.to_string_lossy().to_string(),
            size_bytes,
        }
    }

    #[test]
    fn no_candidates_means_no_plan() {
        let planner = RelocationPlanner::new("LargeFiles");
        let files = vec![record(Path::new("/home/u/big.iso"), 10)];
        assert!(planner.plan(&files, &[], "/").is_none());
        assert!(planner.plan(&[], &["/mnt/d".to_string()], "/").is_none());
    }

    #[test]
    fn never_targets_the_source_volume() {
        let planner = RelocationPlanner::new("LargeFiles");
        let files = vec![record(Path::new("C:\\Users\\u\\big.iso"), 10)];
        assert!(planner
            .plan(&files, &["c:\\".to_string()], "C:")
            .is_none());

        let plan = planner
            .plan(
                &files,
                &["C:".to_string(), "E:".to_string(), "D:".to_string()],
                "C:",
            )
            .expect("plan");
        assert_eq!(plan.destination_volume, "E:");
        assert_eq!(plan.destination_root, PathBuf::from("E:\\").join("LargeFiles"));
    }

    #[test]
    fn nested_source_mount_is_not_mistaken_for_the_destination() {
        let planner = RelocationPlanner::new("LargeFiles");
        let files = vec![
            record(Path::new("/mnt/data/big.iso"), 10),
            record(Path::new("/srv/already-there.iso"), 5),
        ];
        let plan = planner
            .plan(&files, &["/".to_string()], "/mnt/data")
            .expect("plan");

        assert_eq!(plan.destination_volume, "/");
        assert_eq!(plan.files, vec![files[0].clone()]);
        assert_eq!(plan.destination_root, PathBuf::from("/LargeFiles"));
    }

    #[test]
    fn destination_mirrors_source_layout() {
        assert_eq!(
            destination_for(Path::new("/mnt/d/LargeFiles"), Path::new("/home/u/big.iso")),
            PathBuf::from("/mnt/d/LargeFiles/home/u/big.iso")
        );
    }

    #[test]
    fn moves_are_isolated_per_file() {
        let temp = TempDir::new().expect("tempdir");
        let source_volume = temp.path().join("src");
        let dest_volume = temp.path().join("dest");
        fs::create_dir_all(&source_volume).expect("mkdir");
        fs::create_dir_all(&dest_volume).expect("mkdir");

        let present = source_volume.join("movie.mkv");
        let missing = source_volume.join("vanished.iso");
        let occupied = source_volume.join("dup.vhd");
        fs::write(&present, b"payload").expect("write");
        fs::write(&occupied, b"dup").expect("write");

        let planner = RelocationPlanner::new("LargeFiles");
        let dest_id = dest_volume.to_string_lossy().to_string();
        let plan = planner
            .plan(
                &[record(&missing, 1), record(&present, 7), record(&occupied, 3)],
                &[dest_id],
                &source_volume.to_string_lossy(),
            )
            .expect("plan");

        let blocked = destination_for(&plan.destination_root, &occupied);
        fs::create_dir_all(blocked.parent().expect("parent")).expect("mkdir");
        fs::write(&blocked, b"already here").expect("write");

        let results = planner.execute(&plan, None);
        assert_eq!(results.len(), 3);
        assert!(matches!(results[0].outcome, RelocationOutcome::Failed { .. }));
        match &results[1].outcome {
            RelocationOutcome::Moved { destination } => {
                assert_eq!(fs::read(destination).expect("read"), b"payload");
                assert!(!present.exists());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(
            results[2].outcome,
            RelocationOutcome::SkippedExists { .. }
        ));
        assert!(occupied.exists());
    }

    #[test]
    fn cancelled_plan_moves_nothing() {
        let temp = TempDir::new().expect("tempdir");
        let file = temp.path().join("a/big.bin");
        fs::create_dir_all(file.parent().expect("parent")).expect("mkdir");
        fs::write(&file, b"x").expect("write");

        let planner = RelocationPlanner::new("LargeFiles");
        let plan = planner
            .plan(
                &[record(&file, 1)],
                &[temp.path().join("d").to_string_lossy().to_string()],
                "/nonexistent-source",
            )
            .expect("plan");
        let flag = AtomicBool::new(true);
        let results = planner.execute(&plan, Some(&flag));
        assert_eq!(results[0].outcome, RelocationOutcome::Cancelled);
        assert!(file.exists());
    }
}
