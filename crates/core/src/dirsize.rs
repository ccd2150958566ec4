//! Recursive directory totals computed in one depth-first pass.
//!
//! The walker yields nodes in depth-first order, so the chain of
//! directories that are still open always forms a stack. A directory is
//! closed as soon as an event at its depth or shallower arrives, and its
//! totals are folded into its parent at that moment.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;
use crate::model::{DirectorySizeRecord, WalkSummary};
use crate::walk::{FilesystemWalker, WalkEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryAggregation {
    /// Sorted by `total_bytes` descending, then path ascending.
    pub records: Vec<DirectorySizeRecord>,
    pub walk: WalkSummary,
}

impl DirectoryAggregation {
    pub fn partial_count(&self) -> u64 {
        self.records.iter().filter(|record| record.partial).count() as u64
    }
}

#[derive(Debug)]
struct OpenDir {
    path: PathBuf,
    depth: usize,
    total_bytes: u64,
    file_count: u64,
    partial: bool,
}

#[derive(Debug, Clone)]
pub struct DirectorySizeAggregator<'a> {
    walker: FilesystemWalker<'a>,
}

impl<'a> DirectorySizeAggregator<'a> {
    pub fn new(walker: FilesystemWalker<'a>) -> Self {
        Self { walker }
    }

    /// One record for `root` and for every directory beneath it.
    pub fn aggregate(&self, root: &Path) -> Result<DirectoryAggregation> {
        let mut walk = self.walker.walk(root)?;
        let mut open: Vec<OpenDir> = Vec::new();
        let mut records = Vec::new();

        while let Some(event) = walk.next_event() {
            match event {
                WalkEvent::Directory { path, depth } => {
                    close_from(&mut open, depth, &mut records);
                    open.push(OpenDir {
                        path,
                        depth,
                        total_bytes: 0,
                        file_count: 0,
                        partial: false,
                    });
                }
                WalkEvent::File { entry, depth } => {
                    close_from(&mut open, depth, &mut records);
                    if let Some(parent) = open.last_mut() {
                        parent.total_bytes = parent.total_bytes.saturating_add(entry.size_bytes);
                        parent.file_count += 1;
                    }
                }
                WalkEvent::Unreadable { path, depth } => {
                    // Either the listing of an open directory failed, or a
                    // single child could not be read; flag the right owner.
                    close_from(&mut open, depth + 1, &mut records);
                    if open.last().is_some_and(|top| top.path != path) {
                        close_from(&mut open, depth, &mut records);
                    }
                    if let Some(owner) = open.last_mut() {
                        owner.partial = true;
                    }
                }
            }
        }
        close_from(&mut open, 0, &mut records);

        if let Some(err) = walk.abort_error() {
            return Err(err);
        }

        sort_records(&mut records);
        info!(
            root = %root.display(),
            directories = records.len(),
            errors = walk.summary().error_count,
            "directory aggregation complete"
        );

        Ok(DirectoryAggregation {
            records,
            walk: walk.into_summary(),
        })
    }
}

/// Closes every open directory at `depth` or deeper.
fn close_from(open: &mut Vec<OpenDir>, depth: usize, records: &mut Vec<DirectorySizeRecord>) {
    while open.last().is_some_and(|top| top.depth >= depth) {
        let Some(done) = open.pop() else { break };
        if let Some(parent) = open.last_mut() {
            parent.total_bytes = parent.total_bytes.saturating_add(done.total_bytes);
            parent.file_count += done.file_count;
            parent.partial |= done.partial;
        }
        records.push(DirectorySizeRecord {
            path: done.path.to_string_lossy().to_string(),
            total_bytes: done.total_bytes,
            file_count: done.file_count,
            partial: done.partial,
        });
    }
}

pub fn sort_records(records: &mut [DirectorySizeRecord]) {
    records.sort_by(|a, b| {
        b.total_bytes
            .cmp(&a.total_bytes)
            .then_with(|| a.path.cmp(&b.path))
    });
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File};
    use std::path::Path;

    use tempfile::TempDir;

    use super::DirectorySizeAggregator;
    use crate::model::DirectorySizeRecord;
    use crate::walk::{FilesystemWalker, WalkPolicy};

    fn sized(path: &Path, len: u64) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        File::create(path)
            .and_then(|file| file.set_len(len))
            .expect("sparse file");
    }

    fn record<'r>(records: &'r [DirectorySizeRecord], path: &Path) -> &'r DirectorySizeRecord {
        let key = path.to_string_lossy();
        records
            .iter()
            .find(|record| record.path == key)
            .unwrap_or_else(|| panic!("no record for {key}"))
    }

    fn aggregator() -> DirectorySizeAggregator<'static> {
        DirectorySizeAggregator::new(FilesystemWalker::new(WalkPolicy::default()))
    }

    #[test]
    fn totals_roll_up_to_every_ancestor() {
        let temp = TempDir::new().expect("tempdir");
        let a = temp.path().join("a");
        sized(&a.join("f1"), 500_000_000);
        sized(&a.join("b/f2"), 2_000_000_000);
        sized(&a.join("b/f3"), 200_000_000);
        fs::create_dir_all(temp.path().join("empty")).expect("mkdir");

        let result = aggregator().aggregate(temp.path()).expect("aggregate");

        let b = record(&result.records, &a.join("b"));
        assert_eq!(b.total_bytes, 2_200_000_000);
        assert_eq!(b.file_count, 2);

        let a_record = record(&result.records, &a);
        assert_eq!(a_record.total_bytes, 2_700_000_000);
        assert_eq!(a_record.file_count, 3);

        let empty = record(&result.records, &temp.path().join("empty"));
        assert_eq!(empty.total_bytes, 0);
        assert_eq!(result.records.len(), 4);
        assert_eq!(result.records[0].path, temp.path().to_string_lossy());
    }

    #[test]
    fn root_total_matches_walker_sum() {
        let temp = TempDir::new().expect("tempdir");
        for (index, name) in ["x/1", "x/y/2", "x/y/z/3", "w/4", "5"].iter().enumerate() {
            sized(&temp.path().join(name), (index as u64 + 1) * 1_000);
        }

        let walked: u64 = FilesystemWalker::new(WalkPolicy::default())
            .walk(temp.path())
            .expect("walk")
            .map(|entry| entry.size_bytes)
            .sum();
        let result = aggregator().aggregate(temp.path()).expect("aggregate");
        let root = record(&result.records, temp.path());

        assert_eq!(root.total_bytes, walked);
        assert_eq!(root.file_count, 5);
    }

    #[test]
    fn equal_totals_sort_by_path() {
        let temp = TempDir::new().expect("tempdir");
        sized(&temp.path().join("zeta/f"), 10);
        sized(&temp.path().join("alpha/f"), 10);
        sized(&temp.path().join("mid/f"), 10);

        let result = aggregator().aggregate(temp.path()).expect("aggregate");
        let tail = result.records[1..]
            .iter()
            .map(|record| record.path.clone())
            .collect::<Vec<_>>();
        let expected = ["alpha", "mid", "zeta"]
            .iter()
            .map(|name| temp.path().join(name).to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(tail, expected);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_is_flagged_not_fatal() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().expect("tempdir");
        sized(&temp.path().join("open/f"), 7);
        sized(&temp.path().join("locked/f"), 100);
        let locked = temp.path().join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).expect("chmod");
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod");
            return;
        }

        let result = aggregator().aggregate(temp.path());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod");
        let result = result.expect("aggregate");

        let locked_record = record(&result.records, &locked);
        assert_eq!(locked_record.total_bytes, 0);
        assert_eq!(locked_record.file_count, 0);
        assert!(locked_record.partial);

        let root = record(&result.records, temp.path());
        assert_eq!(root.total_bytes, 7);
        assert!(root.partial);
        assert!(!record(&result.records, &temp.path().join("open")).partial);
        assert!(result.walk.error_count >= 1);
    }
}
