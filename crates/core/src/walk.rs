//! Fault-tolerant, lazy filesystem traversal shared by every scanner.

use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{ReclaimError, Result};
use crate::model::{FileEntry, TraversalErrorRecord, WalkSummary};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    #[default]
    Continue,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WalkPolicy {
    pub follow_symlinks: bool,
    pub on_error: ErrorPolicy,
    pub max_recorded_errors: usize,
}

impl Default for WalkPolicy {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
            on_error: ErrorPolicy::Continue,
            max_recorded_errors: 20,
        }
    }
}

/// A node seen during traversal, in depth-first order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WalkEvent {
    Directory { path: PathBuf, depth: usize },
    File { entry: FileEntry, depth: usize },
    /// A node that could not be read. For a directory whose listing failed
    /// `path` is the directory itself and `depth` is its own depth.
    Unreadable { path: PathBuf, depth: usize },
}

#[derive(Debug, Clone, Default)]
pub struct FilesystemWalker<'a> {
    policy: WalkPolicy,
    excludes: Option<&'a ExcludeMatcher>,
}

impl<'a> FilesystemWalker<'a> {
    pub fn new(policy: WalkPolicy) -> Self {
        Self {
            policy,
            excludes: None,
        }
    }

    pub fn with_excludes(mut self, excludes: &'a ExcludeMatcher) -> Self {
        if !excludes.is_empty() {
            self.excludes = Some(excludes);
        }
        self
    }

    pub fn policy(&self) -> &WalkPolicy {
        &self.policy
    }

    /// Starts a walk under `root`.
    ///
    /// Fails with [`ReclaimError::ScanRootInaccessible`] when the root's own
    /// entries cannot be listed; every later failure is recorded in the
    /// walk's summary according to the error policy.
    pub fn walk(&self, root: &Path) -> Result<Walk<'a>> {
        if let Err(source) = fs::read_dir(root) {
            return Err(ReclaimError::ScanRootInaccessible {
                path: root.to_path_buf(),
                source,
            });
        }

        let inner = WalkDir::new(root)
            .follow_links(self.policy.follow_symlinks)
            .sort_by_file_name()
            .into_iter();

        debug!(root = %root.display(), "walk started");
        Ok(Walk {
            root: root.to_path_buf(),
            inner,
            policy: self.policy.clone(),
            excludes: self.excludes,
            summary: WalkSummary {
                root: root.to_string_lossy().to_string(),
                ..WalkSummary::default()
            },
            abort_cause: None,
            finished: false,
        })
    }
}

/// Single-pass sequence of files under one root.
///
/// Only the directories currently open are held in memory. Iterate with
/// `by_ref()` to inspect [`Walk::summary`] afterwards.
pub struct Walk<'a> {
    root: PathBuf,
    inner: walkdir::IntoIter,
    policy: WalkPolicy,
    excludes: Option<&'a ExcludeMatcher>,
    summary: WalkSummary,
    abort_cause: Option<TraversalErrorRecord>,
    finished: bool,
}

impl Walk<'_> {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn summary(&self) -> &WalkSummary {
        &self.summary
    }

    pub fn into_summary(self) -> WalkSummary {
        self.summary
    }

    pub fn is_aborted(&self) -> bool {
        self.summary.aborted
    }

    /// The error that stopped an aborted walk.
    pub fn abort_error(&self) -> Option<ReclaimError> {
        self.abort_cause
            .as_ref()
            .map(|cause| ReclaimError::WalkAborted {
                root: self.root.clone(),
                path: PathBuf::from(&cause.path),
                reason: cause.reason.clone(),
            })
    }

    pub(crate) fn next_event(&mut self) -> Option<WalkEvent> {
        while !self.finished {
            let item = match self.inner.next() {
                Some(item) => item,
                None => {
                    self.finished = true;
                    break;
                }
            };

            let entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    let depth = err.depth();
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.root.clone());
                    let reason = err
                        .io_error()
                        .map_or_else(|| err.to_string(), ToString::to_string);
                    self.record_error(&path, reason);
                    return Some(WalkEvent::Unreadable { path, depth });
                }
            };

            let depth = entry.depth();
            if depth > 0 {
                if let Some(excludes) = self.excludes {
                    if excludes.is_excluded(entry.path()) {
                        if entry.file_type().is_dir() {
                            self.inner.skip_current_dir();
                        }
                        continue;
                    }
                }
            }

            let file_type = entry.file_type();
            if file_type.is_dir() {
                self.summary.directories_seen += 1;
                return Some(WalkEvent::Directory {
                    path: entry.into_path(),
                    depth,
                });
            }
            if !file_type.is_file() {
                continue;
            }

            match entry.metadata() {
                Ok(metadata) => {
                    let size_bytes = metadata.len();
                    self.summary.files_seen += 1;
                    self.summary.bytes_seen = self.summary.bytes_seen.saturating_add(size_bytes);
                    return Some(WalkEvent::File {
                        entry: FileEntry {
                            path: entry.into_path(),
                            size_bytes,
                        },
                        depth,
                    });
                }
                Err(err) => {
                    let path = entry.into_path();
                    self.record_error(&path, err.to_string());
                    return Some(WalkEvent::Unreadable { path, depth });
                }
            }
        }
        None
    }

    fn record_error(&mut self, path: &Path, reason: String) {
        warn!(path = %path.display(), %reason, "traversal error");
        self.summary.error_count += 1;
        let record = TraversalErrorRecord {
            path: path.to_string_lossy().to_string(),
            reason,
        };
        if self.summary.error_samples.len() < self.policy.max_recorded_errors {
            self.summary.error_samples.push(record.clone());
        }
        if self.policy.on_error == ErrorPolicy::Abort {
            self.summary.aborted = true;
            self.abort_cause = Some(record);
            self.finished = true;
        }
    }
}

impl Iterator for Walk<'_> {
    type Item = FileEntry;

    fn next(&mut self) -> Option<FileEntry> {
        loop {
            match self.next_event()? {
                WalkEvent::File { entry, .. } => return Some(entry),
                WalkEvent::Directory { .. } | WalkEvent::Unreadable { .. } => {}
            }
        }
    }
}

/// Path filter built from glob patterns; patterns without glob
/// metacharacters match as case-insensitive substrings.
#[derive(Debug, Clone, Default)]
pub struct ExcludeMatcher {
    globs: Option<GlobSet>,
    needles: Vec<String>,
}

impl ExcludeMatcher {
    /// Compiles `patterns`, returning the matcher plus a warning for each
    /// pattern that had to be downgraded.
    pub fn compile(patterns: &[String]) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let mut builder = GlobSetBuilder::new();
        let mut glob_count = 0_usize;
        let mut needles = Vec::new();

        for raw in patterns {
            let pattern = raw.trim();
            if pattern.is_empty() {
                continue;
            }
            let has_meta = pattern
                .chars()
                .any(|ch| matches!(ch, '*' | '?' | '[' | ']' | '{' | '}'));
            if !has_meta {
                needles.push(pattern.to_lowercase());
                continue;
            }
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                    glob_count += 1;
                }
                Err(err) => {
                    warnings.push(format!(
                        "exclude pattern '{pattern}' is not a valid glob ({err}); matching it as text"
                    ));
                    needles.push(pattern.to_lowercase());
                }
            }
        }

        let globs = if glob_count == 0 {
            None
        } else {
            match builder.build() {
                Ok(set) => Some(set),
                Err(err) => {
                    warnings.push(format!("exclude globs disabled: {err}"));
                    None
                }
            }
        };

        (Self { globs, needles }, warnings)
    }

    pub fn is_empty(&self) -> bool {
        self.globs.is_none() && self.needles.is_empty()
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.globs.as_ref().is_some_and(|set| set.is_match(path)) {
            return true;
        }
        if self.needles.is_empty() {
            return false;
        }
        let lowered = path.to_string_lossy().to_lowercase();
        self.needles.iter().any(|needle| lowered.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::TempDir;

    use super::{ErrorPolicy, ExcludeMatcher, FilesystemWalker, WalkPolicy};
    use crate::error::ReclaimError;

    fn sample_tree() -> TempDir {
        let temp = TempDir::new().expect("tempdir");
        fs::create_dir_all(temp.path().join("a/b")).expect("mkdir");
        fs::create_dir_all(temp.path().join("cache")).expect("mkdir");
        fs::write(temp.path().join("top.txt"), b"12345").expect("write");
        fs::write(temp.path().join("a/one.bin"), b"xx").expect("write");
        fs::write(temp.path().join("a/b/two.bin"), b"yyy").expect("write");
        fs::write(temp.path().join("cache/skip.tmp"), b"zzzz").expect("write");
        temp
    }

    #[test]
    fn yields_every_file_with_sizes() {
        let temp = sample_tree();
        let walker = FilesystemWalker::new(WalkPolicy::default());
        let mut walk = walker.walk(temp.path()).expect("root readable");
        let mut files = walk
            .by_ref()
            .map(|entry| (entry.path, entry.size_bytes))
            .collect::<Vec<_>>();
        files.sort();

        assert_eq!(files.len(), 4);
        assert_eq!(walk.summary().bytes_seen, 14);
        assert_eq!(walk.summary().error_count, 0);
        assert_eq!(walk.summary().directories_seen, 4);
        assert!(files.contains(&(temp.path().join("a/b/two.bin"), 3)));
    }

    #[test]
    fn excluded_directories_are_not_descended() {
        let temp = sample_tree();
        let (excludes, warnings) =
            ExcludeMatcher::compile(&["cache".to_string(), "**/*.bin".to_string()]);
        assert!(warnings.is_empty());

        let walker = FilesystemWalker::new(WalkPolicy::default()).with_excludes(&excludes);
        let files = walker
            .walk(temp.path())
            .expect("root readable")
            .map(|entry| entry.path)
            .collect::<Vec<_>>();
        assert_eq!(files, vec![temp.path().join("top.txt")]);
    }

    #[test]
    fn exclude_matcher_downgrades_bad_globs() {
        let (matcher, warnings) = ExcludeMatcher::compile(&["[".to_string()]);
        assert_eq!(warnings.len(), 1);
        assert!(matcher.is_excluded(Path::new("/x/[weird]/y")));
        assert!(!matcher.is_excluded(Path::new("/x/y")));
    }

    #[test]
    fn missing_root_is_fatal() {
        let temp = TempDir::new().expect("tempdir");
        let walker = FilesystemWalker::new(WalkPolicy::default());
        let err = walker
            .walk(&temp.path().join("absent"))
            .err()
            .expect("missing root must fail");
        assert!(matches!(err, ReclaimError::ScanRootInaccessible { .. }));
        assert!(err.is_fatal());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_subdirectory_is_skipped_and_counted() {
        use std::os::unix::fs::PermissionsExt;

        let temp = sample_tree();
        let locked = temp.path().join("a/b");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).expect("chmod");
        if fs::read_dir(&locked).is_ok() {
            // Privileged users ignore permission bits.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod");
            return;
        }

        let walker = FilesystemWalker::new(WalkPolicy::default());
        let mut walk = walker.walk(temp.path()).expect("root readable");
        let count = walk.by_ref().count();
        let summary = walk.into_summary();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod");

        assert_eq!(count, 3);
        assert!(summary.error_count >= 1);
        assert!(!summary.aborted);
        assert!(summary.error_samples[0].path.ends_with("b"));
    }

    #[cfg(unix)]
    #[test]
    fn abort_policy_ends_the_sequence() {
        use std::os::unix::fs::PermissionsExt;

        let temp = sample_tree();
        let locked = temp.path().join("a/b");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).expect("chmod");
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod");
            return;
        }

        let walker = FilesystemWalker::new(WalkPolicy {
            on_error: ErrorPolicy::Abort,
            ..WalkPolicy::default()
        });
        let mut walk = walker.walk(temp.path()).expect("root readable");
        let _ = walk.by_ref().count();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("chmod");

        assert!(walk.is_aborted());
        assert!(matches!(
            walk.abort_error(),
            Some(ReclaimError::WalkAborted { .. })
        ));
        assert!(walk.next().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycles_terminate_by_default() {
        let temp = sample_tree();
        std::os::unix::fs::symlink(temp.path(), temp.path().join("a/loop")).expect("symlink");

        let walker = FilesystemWalker::new(WalkPolicy::default());
        let count = walker.walk(temp.path()).expect("root readable").count();
        assert_eq!(count, 4);
    }
}
