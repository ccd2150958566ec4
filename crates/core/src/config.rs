use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ReclaimError, Result};
use crate::large_files::DEFAULT_LARGE_FILE_THRESHOLD;
use crate::model::CleanupAction;
use crate::usage::{detect_system_volume, volume_root};
use crate::walk::WalkPolicy;

/// Everything a run needs, passed explicitly into each component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub volume_id: String,
    pub scan_roots: Vec<PathBuf>,
    pub large_file_threshold_bytes: u64,
    pub walk: WalkPolicy,
    pub excludes: Vec<String>,
    pub cleanup: CleanupConfig,
    pub relocation: RelocationConfig,
    /// Keep only the largest N directories in the report.
    pub directory_report_limit: Option<usize>,
    pub dry_run: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        let volume_id = detect_system_volume();
        Self {
            scan_roots: default_scan_roots(&volume_id),
            volume_id,
            large_file_threshold_bytes: DEFAULT_LARGE_FILE_THRESHOLD,
            walk: WalkPolicy::default(),
            excludes: Vec::new(),
            cleanup: CleanupConfig::default(),
            relocation: RelocationConfig::default(),
            directory_report_limit: None,
            dry_run: false,
        }
    }
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        let roots_given = value.get("scan_roots").is_some();
        let mut config: Self = serde_json::from_value(value)?;
        // Default roots belong to the configured volume, not the system one.
        if !roots_given {
            config.scan_roots = default_scan_roots(&config.volume_id);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.volume_id.trim().is_empty() {
            return Err(ReclaimError::Config("volume_id must not be empty".to_string()));
        }
        if self.scan_roots.is_empty() {
            return Err(ReclaimError::Config(
                "at least one scan root is required".to_string(),
            ));
        }
        let subfolder = Path::new(&self.relocation.subfolder);
        let plain = !self.relocation.subfolder.is_empty()
            && subfolder
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !plain {
            return Err(ReclaimError::Config(format!(
                "relocation subfolder '{}' must be a relative path without '..'",
                self.relocation.subfolder
            )));
        }
        Ok(())
    }

    /// The scan root whose total inaccessibility aborts a run.
    pub fn primary_root(&self) -> Option<&Path> {
        self.scan_roots.first().map(PathBuf::as_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleanupConfig {
    /// Replaces the platform default plan when set.
    pub actions: Option<Vec<CleanupAction>>,
    pub retry_in_use: bool,
    pub cleanmgr_profile: u32,
    pub update_service: String,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            actions: None,
            retry_in_use: true,
            cleanmgr_profile: 1,
            update_service: "wuauserv".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelocationConfig {
    /// Destination volumes in preference order; empty means every detected
    /// non-system volume, by mount point.
    pub candidate_volumes: Vec<String>,
    pub subfolder: String,
    /// Moves happen only when set; otherwise the plan is reported.
    pub execute: bool,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            candidate_volumes: Vec::new(),
            subfolder: "LargeFiles".to_string(),
            execute: false,
        }
    }
}

/// User profile directories plus the system temp directory when it lives on the volume.
pub fn default_scan_roots(volume_id: &str) -> Vec<PathBuf> {
    let root = volume_root(volume_id);
    if cfg!(windows) {
        vec![root.join("Users"), root.join("Windows").join("Temp")]
    } else {
        let mut roots = vec![root.join("home")];
        let temp = std::env::temp_dir();
        if temp.starts_with(&root) {
            roots.push(temp);
        }
        roots
    }
}
