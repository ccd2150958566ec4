use std::path::Path;

use tracing::info;

use crate::error::Result;
use crate::model::{LargeFileRecord, WalkSummary, GIB};
use crate::walk::FilesystemWalker;

pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = GIB;

#[derive(Debug, Clone, PartialEq)]
pub struct LargeFileScan {
    pub files: Vec<LargeFileRecord>,
    pub walk: WalkSummary,
}

#[derive(Debug, Clone)]
pub struct LargeFileScanner<'a> {
    walker: FilesystemWalker<'a>,
    threshold_bytes: u64,
}

impl<'a> LargeFileScanner<'a> {
    pub fn new(walker: FilesystemWalker<'a>, threshold_bytes: u64) -> Self {
        Self {
            walker,
            threshold_bytes,
        }
    }

    pub fn threshold_bytes(&self) -> u64 {
        self.threshold_bytes
    }

    /// Files strictly larger than the threshold, largest first.
    ///
    /// An empty `files` list is a successful scan; an aborted walk is
    /// returned as an error instead.
    pub fn scan(&self, root: &Path) -> Result<LargeFileScan> {
        let mut walk = self.walker.walk(root)?;
        let mut files = walk
            .by_ref()
            .filter(|entry| entry.size_bytes > self.threshold_bytes)
            .map(|entry| LargeFileRecord {
                path: entry.path.to_string_lossy().to_string(),
                size_bytes: entry.size_bytes,
            })
            .collect::<Vec<_>>();

        if let Some(err) = walk.abort_error() {
            return Err(err);
        }

        files.sort_by(|a, b| {
            b.size_bytes
                .cmp(&a.size_bytes)
                .then_with(|| a.path.cmp(&b.path))
        });
        info!(
            root = %root.display(),
            threshold_bytes = self.threshold_bytes,
            matches = files.len(),
            "large-file scan complete"
        );

        Ok(LargeFileScan {
            files,
            walk: walk.into_summary(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File};
    use std::path::Path;

    use tempfile::TempDir;

    use super::LargeFileScanner;
    use crate::walk::{FilesystemWalker, WalkPolicy};

    fn sized(path: &Path, len: u64) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        File::create(path)
            .and_then(|file| file.set_len(len))
            .expect("sparse file");
    }

    #[test]
    fn threshold_is_strictly_greater() {
        let temp = TempDir::new().expect("tempdir");
        sized(&temp.path().join("equal.bin"), 100);
        sized(&temp.path().join("over.bin"), 101);
        sized(&temp.path().join("deep/way/over.bin"), 500);
        sized(&temp.path().join("under.bin"), 99);

        let scanner = LargeFileScanner::new(FilesystemWalker::new(WalkPolicy::default()), 100);
        let scan = scanner.scan(temp.path()).expect("scan succeeds");

        let sizes = scan
            .files
            .iter()
            .map(|record| record.size_bytes)
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![500, 101]);
        assert_eq!(scan.walk.files_seen, 4);
    }

    #[test]
    fn empty_result_is_not_a_failure() {
        let temp = TempDir::new().expect("tempdir");
        sized(&temp.path().join("small.bin"), 10);

        let scanner = LargeFileScanner::new(FilesystemWalker::new(WalkPolicy::default()), 1_000);
        let scan = scanner.scan(temp.path()).expect("scan succeeds");
        assert!(scan.files.is_empty());
        assert!(!scan.walk.aborted);
    }

    #[test]
    fn inaccessible_root_is_an_error() {
        let temp = TempDir::new().expect("tempdir");
        let scanner = LargeFileScanner::new(FilesystemWalker::new(WalkPolicy::default()), 0);
        assert!(scanner.scan(&temp.path().join("gone")).is_err());
    }
}
