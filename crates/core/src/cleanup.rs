use std::any::Any;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::{debug, info, warn};

use crate::error::ReclaimError;
use crate::model::{
    ActionOutcome, ActionStats, ActionTarget, CleanupAction, CommandSpec, DeleteMode, PathTarget,
    ServiceSpec, ServiceState,
};

/// Launches an external program and reports its exit code.
///
/// `Ok(None)` means the process ended without an exit code (killed by a
/// signal). Output is never interpreted.
pub trait CommandLauncher {
    fn launch(&self, command: &CommandSpec) -> io::Result<Option<i32>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl CommandLauncher for SystemLauncher {
    fn launch(&self, command: &CommandSpec) -> io::Result<Option<i32>> {
        let status = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        Ok(status.code())
    }
}

/// Command that moves a background service into `spec.desired`.
///
/// Exit codes meaning "already in that state" count as success so the
/// toggle is idempotent.
pub fn service_command(spec: &ServiceSpec) -> CommandSpec {
    #[cfg(windows)]
    {
        // 1062: service not started; 1056: instance already running.
        match spec.desired {
            ServiceState::Stopped => CommandSpec::new("sc.exe", ["stop", spec.service.as_str()])
                .with_success_codes(&[0, 1062]),
            ServiceState::Running => CommandSpec::new("sc.exe", ["start", spec.service.as_str()])
                .with_success_codes(&[0, 1056]),
        }
    }
    #[cfg(not(windows))]
    {
        let verb = match spec.desired {
            ServiceState::Stopped => "stop",
            ServiceState::Running => "start",
        };
        CommandSpec::new("systemctl", [verb, spec.service.as_str()])
    }
}

#[derive(Clone)]
pub struct CleanupActionRunner<'l> {
    launcher: &'l dyn CommandLauncher,
    retry_in_use: bool,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl<'l> CleanupActionRunner<'l> {
    pub fn new(launcher: &'l dyn CommandLauncher) -> Self {
        Self {
            launcher,
            retry_in_use: true,
            cancel_flag: None,
        }
    }

    pub fn retry_in_use(mut self, enabled: bool) -> Self {
        self.retry_in_use = enabled;
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(flag);
        self
    }

    /// Executes `actions` strictly in order and returns them with outcomes
    /// recorded. A failing action never stops the ones after it.
    ///
    /// Cancellation is honoured between actions only; once cancelled, every
    /// remaining action is marked [`ActionOutcome::Cancelled`]. Actions that
    /// already carry an outcome are left untouched.
    pub fn run(&self, mut actions: Vec<CleanupAction>) -> Vec<CleanupAction> {
        let mut cancelled = false;
        for action in &mut actions {
            if action.outcome.is_some() {
                debug!(action = %action.name, "action already ran; not repeating");
                continue;
            }
            if !cancelled && self.is_cancelled() {
                warn!("cleanup cancelled; remaining actions will not run");
                cancelled = true;
            }
            if cancelled {
                action.outcome = Some(ActionOutcome::Cancelled);
                continue;
            }

            let outcome = self.execute_isolated(action);
            match &outcome {
                ActionOutcome::Failed { reason } => {
                    warn!(action = %action.name, %reason, "cleanup action failed");
                }
                other => info!(
                    action = %action.name,
                    outcome = other.label(),
                    removed_entries = action.stats.removed_entries,
                    removed_bytes = action.stats.removed_bytes,
                    "cleanup action finished"
                ),
            }
            action.outcome = Some(outcome);
        }
        actions
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn execute_isolated(&self, action: &mut CleanupAction) -> ActionOutcome {
        let mut stats = ActionStats::default();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.execute(&action.target, &mut stats)
        }));
        action.stats = stats;
        let outcome = result.unwrap_or_else(|payload| ActionOutcome::Failed {
            reason: format!("panicked: {}", panic_message(payload.as_ref())),
        });
        match outcome {
            ActionOutcome::Failed { reason } => ActionOutcome::Failed {
                reason: ReclaimError::ActionFailed {
                    action: action.name.clone(),
                    reason,
                }
                .to_string(),
            },
            other => other,
        }
    }

    fn execute(&self, target: &ActionTarget, stats: &mut ActionStats) -> ActionOutcome {
        match target {
            ActionTarget::PathDeletion { paths } => self.delete_paths(paths, stats),
            ActionTarget::ExternalCommand { command } => self.run_command(command),
            ActionTarget::ServiceToggle { service } => self.run_command(&service_command(service)),
        }
    }

    fn run_command(&self, command: &CommandSpec) -> ActionOutcome {
        debug!(command = %command.display(), "launching external command");
        match self.launcher.launch(command) {
            Ok(Some(code)) if command.is_success(code) => ActionOutcome::Succeeded,
            Ok(Some(code)) => ActionOutcome::Failed {
                reason: format!("{} exited with status {code}", command.program),
            },
            Ok(None) => ActionOutcome::Failed {
                reason: format!("{} terminated without an exit status", command.program),
            },
            Err(err) => ActionOutcome::Failed {
                reason: format!("failed to launch {}: {err}", command.program),
            },
        }
    }

    fn delete_paths(&self, targets: &[PathTarget], stats: &mut ActionStats) -> ActionOutcome {
        let mut deleter = Deleter {
            retry_in_use: self.retry_in_use,
            stats,
            failures: Vec::new(),
        };
        let mut found_any = false;

        for target in targets {
            let metadata = match fs::symlink_metadata(&target.path) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %target.path.display(), "deletion target absent");
                    continue;
                }
                Err(err) => {
                    deleter.fail(&target.path, &err);
                    continue;
                }
            };
            found_any = true;

            match target.mode {
                DeleteMode::ClearContents if metadata.is_dir() => deleter.clear_dir(&target.path),
                DeleteMode::ClearContents => deleter.fail(
                    &target.path,
                    &io::Error::new(io::ErrorKind::Other, "not a directory"),
                ),
                DeleteMode::Remove => deleter.remove(&target.path, &metadata),
            }
        }

        let Deleter {
            failures, stats, ..
        } = deleter;
        deletion_outcome(found_any, &failures, stats)
    }
}

fn deletion_outcome(found_any: bool, failures: &[String], stats: &ActionStats) -> ActionOutcome {
    if !found_any && failures.is_empty() {
        return ActionOutcome::SkippedNotFound;
    }
    if let Some(first) = failures.first() {
        let attempted = stats.failed_entries + stats.removed_entries;
        return ActionOutcome::Failed {
            reason: format!(
                "{} of {attempted} entries could not be removed; first: {first}",
                stats.failed_entries
            ),
        };
    }
    if stats.retries > 0 {
        ActionOutcome::SucceededAfterRetry {
            retries: stats.retries,
        }
    } else {
        ActionOutcome::Succeeded
    }
}

struct Deleter<'s> {
    retry_in_use: bool,
    stats: &'s mut ActionStats,
    failures: Vec<String>,
}

impl Deleter<'_> {
    fn fail(&mut self, path: &Path, err: &io::Error) {
        debug!(path = %path.display(), error = %err, "entry not removed");
        self.stats.failed_entries += 1;
        self.failures.push(format!("{}: {err}", path.display()));
    }

    fn clear_dir(&mut self, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                self.fail(dir, &err);
                return;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    self.fail(dir, &err);
                    continue;
                }
            };
            let path = entry.path();
            match fs::symlink_metadata(&path) {
                Ok(metadata) => self.remove(&path, &metadata),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => self.fail(&path, &err),
            }
        }
    }

    /// Removes `path`; directories are emptied bottom-up so one locked file
    /// only keeps its own ancestors alive.
    fn remove(&mut self, path: &Path, metadata: &fs::Metadata) {
        if metadata.is_dir() {
            let failures_before = self.stats.failed_entries;
            self.clear_dir(path);
            if self.stats.failed_entries > failures_before {
                return;
            }
            match self.attempt(|| fs::remove_dir(path)) {
                Ok(()) => self.stats.removed_entries += 1,
                Err(err) => self.fail(path, &err),
            }
            return;
        }

        match self.attempt(|| remove_file_forced(path)) {
            Ok(()) => {
                self.stats.removed_entries += 1;
                self.stats.removed_bytes = self.stats.removed_bytes.saturating_add(metadata.len());
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => self.fail(path, &err),
        }
    }

    /// Runs `op`, retrying once on a "file in use" error.
    fn attempt<F>(&mut self, mut op: F) -> io::Result<()>
    where
        F: FnMut() -> io::Result<()>,
    {
        match op() {
            Err(err) if self.retry_in_use && is_in_use(&err) => {
                self.stats.retries += 1;
                debug!(error = %err, "entry in use; retrying once");
                op()
            }
            result => result,
        }
    }
}

#[cfg(windows)]
fn remove_file_forced(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            let mut permissions = fs::symlink_metadata(path)?.permissions();
            if !permissions.readonly() {
                return Err(err);
            }
            permissions.set_readonly(false);
            fs::set_permissions(path, permissions)?;
            fs::remove_file(path)
        }
        result => result,
    }
}

#[cfg(not(windows))]
fn remove_file_forced(path: &Path) -> io::Result<()> {
    fs::remove_file(path)
}

fn is_in_use(err: &io::Error) -> bool {
    #[cfg(windows)]
    {
        // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
        matches!(err.raw_os_error(), Some(32 | 33))
    }
    #[cfg(unix)]
    {
        // EBUSY, ETXTBSY
        matches!(err.raw_os_error(), Some(16 | 26))
    }
    #[cfg(not(any(windows, unix)))]
    {
        let _ = err;
        false
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;
    use std::io;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use tempfile::TempDir;

    use super::{
        deletion_outcome, service_command, CleanupActionRunner, CommandLauncher, Deleter,
    };
    use crate::model::{
        ActionOutcome, ActionStats, CleanupAction, CommandSpec, PathTarget, ServiceSpec,
        ServiceState,
    };

    #[derive(Default)]
    struct ScriptedLauncher {
        calls: RefCell<Vec<String>>,
    }

    impl CommandLauncher for ScriptedLauncher {
        fn launch(&self, command: &CommandSpec) -> io::Result<Option<i32>> {
            self.calls.borrow_mut().push(command.display());
            match command.program.as_str() {
                "ok" => Ok(Some(0)),
                "fails" => Ok(Some(2)),
                "killed" => Ok(None),
                "boom" => panic!("launcher exploded"),
                _ => Err(io::Error::new(io::ErrorKind::NotFound, "no such program")),
            }
        }
    }

    fn command(name: &str, program: &str) -> CleanupAction {
        CleanupAction::external_command(name, CommandSpec::new(program, ["--flag"]))
    }

    #[test]
    fn failing_action_does_not_stop_later_ones() {
        let temp = TempDir::new().expect("tempdir");
        let junk = temp.path().join("junk");
        fs::create_dir_all(junk.join("nested")).expect("mkdir");
        fs::write(junk.join("a.tmp"), b"aaaa").expect("write");
        fs::write(junk.join("nested/b.tmp"), b"bb").expect("write");

        let launcher = ScriptedLauncher::default();
        let runner = CleanupActionRunner::new(&launcher);
        let actions = runner.run(vec![
            CleanupAction::path_deletion("temp", vec![PathTarget::clear(&junk)]),
            command("broken", "fails"),
            command("after", "ok"),
        ]);

        let names = actions
            .iter()
            .map(|action| action.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["temp", "broken", "after"]);
        assert_eq!(actions[0].outcome, Some(ActionOutcome::Succeeded));
        assert_eq!(actions[0].stats.removed_entries, 3);
        assert_eq!(actions[0].stats.removed_bytes, 6);
        assert!(junk.exists());
        assert_eq!(fs::read_dir(&junk).expect("read").count(), 0);

        assert_eq!(
            actions[1].outcome,
            Some(ActionOutcome::Failed {
                reason: "action 'broken' failed: fails exited with status 2".to_string()
            })
        );
        assert_eq!(actions[2].outcome, Some(ActionOutcome::Succeeded));
        assert_eq!(launcher.calls.borrow().len(), 2);
    }

    #[test]
    fn missing_path_is_skipped_not_failed() {
        let temp = TempDir::new().expect("tempdir");
        let launcher = ScriptedLauncher::default();
        let actions = CleanupActionRunner::new(&launcher).run(vec![
            CleanupAction::path_deletion(
                "gone",
                vec![
                    PathTarget::clear(temp.path().join("nope")),
                    PathTarget::remove(temp.path().join("also-nope")),
                ],
            ),
        ]);
        assert_eq!(actions[0].outcome, Some(ActionOutcome::SkippedNotFound));
    }

    #[test]
    fn remove_mode_deletes_the_path_itself() {
        let temp = TempDir::new().expect("tempdir");
        let file = temp.path().join("hiberfil.sys");
        let dir = temp.path().join("old");
        fs::write(&file, b"12345678").expect("write");
        fs::create_dir_all(dir.join("x")).expect("mkdir");

        let launcher = ScriptedLauncher::default();
        let actions = CleanupActionRunner::new(&launcher).run(vec![CleanupAction::path_deletion(
            "remove",
            vec![PathTarget::remove(&file), PathTarget::remove(&dir)],
        )]);

        assert_eq!(actions[0].outcome, Some(ActionOutcome::Succeeded));
        assert!(!file.exists());
        assert!(!dir.exists());
        assert_eq!(actions[0].stats.removed_bytes, 8);
    }

    #[test]
    fn clearing_a_file_target_fails() {
        let temp = TempDir::new().expect("tempdir");
        let file = temp.path().join("plain.txt");
        fs::write(&file, b"x").expect("write");

        let launcher = ScriptedLauncher::default();
        let actions = CleanupActionRunner::new(&launcher).run(vec![CleanupAction::path_deletion(
            "bad",
            vec![PathTarget::clear(&file)],
        )]);
        assert!(matches!(
            actions[0].outcome,
            Some(ActionOutcome::Failed { .. })
        ));
        assert!(file.exists());
    }

    #[test]
    fn launch_errors_and_signals_are_failures() {
        let launcher = ScriptedLauncher::default();
        let actions = CleanupActionRunner::new(&launcher).run(vec![
            command("missing", "does-not-exist"),
            command("signal", "killed"),
        ]);
        for action in &actions {
            assert_eq!(action.outcome.as_ref().map(ActionOutcome::label), Some("failed"));
        }
        let reason = actions[0]
            .outcome
            .as_ref()
            .and_then(ActionOutcome::reason)
            .expect("reason");
        assert!(reason.starts_with("action 'missing' failed: failed to launch does-not-exist"));
    }

    #[test]
    fn panicking_action_is_contained() {
        let launcher = ScriptedLauncher::default();
        let actions = CleanupActionRunner::new(&launcher)
            .run(vec![command("explodes", "boom"), command("survivor", "ok")]);
        assert_eq!(
            actions[0].outcome,
            Some(ActionOutcome::Failed {
                reason: "action 'explodes' failed: panicked: launcher exploded".to_string()
            })
        );
        assert_eq!(actions[1].outcome, Some(ActionOutcome::Succeeded));
    }

    #[test]
    fn cancellation_marks_remaining_actions() {
        let flag = Arc::new(AtomicBool::new(false));
        let launcher = ScriptedLauncher::default();
        let runner = CleanupActionRunner::new(&launcher).with_cancel_flag(Arc::clone(&flag));

        let first = runner.run(vec![command("one", "ok")]);
        assert_eq!(first[0].outcome, Some(ActionOutcome::Succeeded));

        flag.store(true, Ordering::Relaxed);
        let mut rest = first;
        rest.push(command("two", "ok"));
        rest.push(command("three", "ok"));
        let rest = runner.run(rest);

        assert_eq!(rest[0].outcome, Some(ActionOutcome::Succeeded));
        assert_eq!(rest[1].outcome, Some(ActionOutcome::Cancelled));
        assert_eq!(rest[2].outcome, Some(ActionOutcome::Cancelled));
        assert_eq!(launcher.calls.borrow().len(), 1);
    }

    #[test]
    fn service_toggle_goes_through_the_launcher() {
        let launcher = ScriptedLauncher::default();
        let actions = CleanupActionRunner::new(&launcher).run(vec![CleanupAction::service_toggle(
            "stop-updates",
            "wuauserv",
            ServiceState::Stopped,
        )]);
        // The scripted launcher does not know sc.exe/systemctl.
        assert!(matches!(
            actions[0].outcome,
            Some(ActionOutcome::Failed { .. })
        ));
        let expected = service_command(&ServiceSpec {
            service: "wuauserv".to_string(),
            desired: ServiceState::Stopped,
        });
        assert_eq!(launcher.calls.borrow()[0], expected.display());
    }

    #[test]
    fn service_commands_tolerate_target_state() {
        let stop = service_command(&ServiceSpec {
            service: "svc".to_string(),
            desired: ServiceState::Stopped,
        });
        let start = service_command(&ServiceSpec {
            service: "svc".to_string(),
            desired: ServiceState::Running,
        });
        assert!(stop.is_success(0));
        assert!(start.is_success(0));
        assert!(stop.args.contains(&"stop".to_string()));
        assert!(start.args.contains(&"start".to_string()));
        #[cfg(windows)]
        {
            assert!(stop.is_success(1062));
            assert!(start.is_success(1056));
        }
    }

    #[cfg(windows)]
    fn in_use() -> io::Error {
        io::Error::from_raw_os_error(32)
    }

    #[cfg(unix)]
    fn in_use() -> io::Error {
        io::Error::from_raw_os_error(16)
    }

    #[cfg(any(windows, unix))]
    #[test]
    fn in_use_error_is_retried_once() {
        let mut stats = ActionStats::default();
        let mut deleter = Deleter {
            retry_in_use: true,
            stats: &mut stats,
            failures: Vec::new(),
        };
        let mut attempts = 0;
        let result = deleter.attempt(|| {
            attempts += 1;
            if attempts == 1 {
                Err(in_use())
            } else {
                Ok(())
            }
        });

        assert!(result.is_ok());
        assert_eq!(attempts, 2);
        assert_eq!(stats.retries, 1);
        assert_eq!(
            deletion_outcome(true, &[], &stats),
            ActionOutcome::SucceededAfterRetry { retries: 1 }
        );
    }

    #[cfg(any(windows, unix))]
    #[test]
    fn second_in_use_error_fails_without_third_attempt() {
        let mut stats = ActionStats::default();
        let mut deleter = Deleter {
            retry_in_use: true,
            stats: &mut stats,
            failures: Vec::new(),
        };
        let mut attempts = 0;
        let result = deleter.attempt(|| {
            attempts += 1;
            Err(in_use())
        });

        let err = result.expect_err("still in use");
        assert_eq!(attempts, 2);
        deleter.fail(std::path::Path::new("locked.tmp"), &err);
        let failures = deleter.failures.clone();
        assert_eq!(stats.retries, 1);
        assert!(matches!(
            deletion_outcome(true, &failures, &stats),
            ActionOutcome::Failed { .. }
        ));
    }

    #[cfg(any(windows, unix))]
    #[test]
    fn retry_can_be_disabled() {
        let mut stats = ActionStats::default();
        let mut deleter = Deleter {
            retry_in_use: false,
            stats: &mut stats,
            failures: Vec::new(),
        };
        let mut attempts = 0;
        let result = deleter.attempt(|| {
            attempts += 1;
            Err(in_use())
        });
        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(stats.retries, 0);
    }

    #[test]
    fn plain_success_is_not_marked_as_retried() {
        let stats = ActionStats {
            removed_entries: 3,
            ..ActionStats::default()
        };
        assert_eq!(deletion_outcome(true, &[], &stats), ActionOutcome::Succeeded);
        assert_eq!(
            deletion_outcome(false, &[], &ActionStats::default()),
            ActionOutcome::SkippedNotFound
        );
    }
}
