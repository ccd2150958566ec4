//! The default, ordered list of cleanup actions for a volume.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::CleanupConfig;
use crate::model::{CleanupAction, CommandSpec, PathTarget, ServiceState};
use crate::usage::volume_root;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanPlatform {
    Windows,
    Unix,
}

impl PlanPlatform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }
}

/// Uses the configured override list when present, otherwise the
/// platform default for `volume_id`.
pub fn build_actions(config: &CleanupConfig, volume_id: &str) -> Vec<CleanupAction> {
    match &config.actions {
        Some(actions) => actions.clone(),
        None => default_actions(PlanPlatform::current(), config, &volume_root(volume_id)),
    }
}

/// The stock plan. Order matters: the update service is stopped before its
/// download cache is cleared and started again right after.
pub fn default_actions(
    platform: PlanPlatform,
    config: &CleanupConfig,
    root: &Path,
) -> Vec<CleanupAction> {
    match platform {
        PlanPlatform::Windows => windows_actions(config, root),
        PlanPlatform::Unix => unix_actions(root),
    }
}

fn windows_actions(config: &CleanupConfig, root: &Path) -> Vec<CleanupAction> {
    let windows = root.join("Windows");
    let volume = root
        .to_string_lossy()
        .trim_end_matches(['\\', '/'])
        .to_string();

    let user_temp = list_subdirs(&root.join("Users"))
        .into_iter()
        .map(|profile| PathTarget::clear(profile.join("AppData").join("Local").join("Temp")))
        .collect();

    vec![
        CleanupAction::path_deletion("user-temp", user_temp),
        CleanupAction::path_deletion("system-temp", vec![PathTarget::clear(windows.join("Temp"))]),
        CleanupAction::service_toggle(
            "stop-update-service",
            &config.update_service,
            ServiceState::Stopped,
        ),
        CleanupAction::path_deletion(
            "update-cache",
            vec![PathTarget::clear(
                windows.join("SoftwareDistribution").join("Download"),
            )],
        ),
        CleanupAction::service_toggle(
            "start-update-service",
            &config.update_service,
            ServiceState::Running,
        ),
        CleanupAction::path_deletion(
            "logs",
            vec![
                PathTarget::clear(windows.join("Logs").join("CBS")),
                PathTarget::clear(windows.join("Logs").join("DISM")),
            ],
        ),
        CleanupAction::external_command(
            "disable-hibernation",
            CommandSpec::new("powercfg.exe", ["/hibernate", "off"]),
        ),
        CleanupAction::external_command(
            "delete-shadow-copies",
            CommandSpec::new(
                "vssadmin.exe",
                [
                    "delete".to_string(),
                    "shadows".to_string(),
                    format!("/for={volume}"),
                    "/all".to_string(),
                    "/quiet".to_string(),
                ],
            ),
        ),
        CleanupAction::external_command(
            "system-cleanup",
            CommandSpec::new(
                "cleanmgr.exe",
                [format!("/sagerun:{}", config.cleanmgr_profile)],
            ),
        ),
        CleanupAction::path_deletion(
            "recycle-bin",
            vec![PathTarget::clear(root.join("$Recycle.Bin"))],
        ),
    ]
}

fn unix_actions(root: &Path) -> Vec<CleanupAction> {
    let trash = list_subdirs(&root.join("home"))
        .into_iter()
        .map(|home| PathTarget::clear(home.join(".local/share/Trash/files")))
        .collect();

    vec![
        CleanupAction::path_deletion("system-temp", vec![PathTarget::clear(root.join("tmp"))]),
        CleanupAction::path_deletion(
            "persistent-temp",
            vec![PathTarget::clear(root.join("var/tmp"))],
        ),
        CleanupAction::external_command(
            "journal-vacuum",
            CommandSpec::new("journalctl", ["--vacuum-time=7d"]),
        ),
        CleanupAction::path_deletion("trash", trash),
    ]
}

fn list_subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    dirs.sort();
    dirs
}
