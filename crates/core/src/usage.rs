use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use tracing::{info, warn};

use crate::error::{ReclaimError, Result};
use crate::model::{UsageSampling, VolumeFailure, VolumeUsageSample, GIB};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeCapacity {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Read-only source of volume capacity figures.
pub trait VolumeProbe {
    fn capacity(&self, volume_id: &str) -> Result<VolumeCapacity>;

    /// Volumes that may receive relocated files, in mount-point order.
    fn relocation_targets(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectedVolume {
    pub volume_id: String,
    pub mount_point: String,
    pub name: String,
    pub file_system: Option<String>,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub is_removable: bool,
    pub is_system: bool,
}

/// Lists mounted volumes, sorted by mount point.
pub fn detect_volumes() -> Vec<DetectedVolume> {
    let system = normalize_volume_id(&detect_system_volume());
    let disks = Disks::new_with_refreshed_list();
    let mut volumes = disks
        .list()
        .iter()
        .map(|disk| {
            let mount_point = disk.mount_point().to_string_lossy().to_string();
            let volume_id = normalize_volume_id(&mount_point);
            let file_system = disk.file_system().to_string_lossy().to_string();
            DetectedVolume {
                is_system: volume_id.eq_ignore_ascii_case(&system),
                volume_id,
                mount_point,
                name: disk.name().to_string_lossy().to_string(),
                file_system: (!file_system.is_empty()).then_some(file_system),
                total_bytes: disk.total_space(),
                free_bytes: disk.available_space(),
                is_removable: disk.is_removable(),
            }
        })
        .collect::<Vec<_>>();
    volumes.sort_by(|a, b| a.mount_point.cmp(&b.mount_point));
    volumes.dedup_by(|a, b| a.volume_id == b.volume_id);
    volumes
}

/// Smaller volumes are boot or recovery partitions, not storage.
pub const MIN_RELOCATION_VOLUME_BYTES: u64 = 8 * GIB;

/// Fixed, non-system volumes of at least [`MIN_RELOCATION_VOLUME_BYTES`].
pub fn relocation_targets(volumes: &[DetectedVolume]) -> Vec<String> {
    volumes
        .iter()
        .filter(|volume| {
            !volume.is_removable
                && !volume.is_system
                && volume.total_bytes >= MIN_RELOCATION_VOLUME_BYTES
        })
        .map(|volume| volume.volume_id.clone())
        .collect()
}

pub fn detect_system_volume() -> String {
    #[cfg(windows)]
    {
        std::env::var("SystemDrive")
            .map(|drive| normalize_volume_id(&drive))
            .unwrap_or_else(|_| "C:".to_string())
    }
    #[cfg(not(windows))]
    {
        "/".to_string()
    }
}

/// Canonical spelling of a volume id: `c:\` becomes `C:`, trailing
/// separators are dropped except for a bare root.
pub fn normalize_volume_id(raw: &str) -> String {
    let trimmed = raw.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && trimmed[2..].chars().all(|ch| ch == '\\' || ch == '/')
    {
        return format!("{}:", char::from(bytes[0]).to_ascii_uppercase());
    }
    let stripped = trimmed.trim_end_matches(['/', '\\']);
    if stripped.is_empty() {
        return trimmed.chars().take(1).collect();
    }
    stripped.to_string()
}

/// Filesystem root of a volume id.
pub fn volume_root(volume_id: &str) -> PathBuf {
    let id = normalize_volume_id(volume_id);
    if id.len() == 2 && id.ends_with(':') {
        PathBuf::from(format!("{id}\\"))
    } else {
        PathBuf::from(id)
    }
}

/// Picks the volume holding `path`, preferring the longest mount match.
pub fn volume_of<'v>(path: &Path, volume_ids: &'v [String]) -> Option<&'v str> {
    volume_ids
        .iter()
        .filter(|id| path.starts_with(volume_root(id)))
        .max_by_key(|id| normalize_volume_id(id).len())
        .map(String::as_str)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoProbe;

impl VolumeProbe for SysinfoProbe {
    fn capacity(&self, volume_id: &str) -> Result<VolumeCapacity> {
        let wanted = normalize_volume_id(volume_id);
        detect_volumes()
            .into_iter()
            .find(|volume| volume.volume_id.eq_ignore_ascii_case(&wanted))
            .map(|volume| VolumeCapacity {
                total_bytes: volume.total_bytes,
                free_bytes: volume.free_bytes,
            })
            .ok_or_else(|| ReclaimError::VolumeUnavailable {
                volume_id: volume_id.to_string(),
                reason: "no mounted volume matches this id".to_string(),
            })
    }

    fn relocation_targets(&self) -> Vec<String> {
        relocation_targets(&detect_volumes())
    }
}

pub struct UsageReporter<'p> {
    probe: &'p dyn VolumeProbe,
}

impl<'p> UsageReporter<'p> {
    pub fn new(probe: &'p dyn VolumeProbe) -> Self {
        Self { probe }
    }

    /// Samples each distinct volume once. A volume that cannot be queried
    /// lands in `failures`; the others are still sampled.
    pub fn sample(&self, volume_ids: &[String]) -> UsageSampling {
        let mut sampling = UsageSampling::default();
        let mut seen = HashSet::new();

        for volume_id in volume_ids {
            if !seen.insert(normalize_volume_id(volume_id).to_lowercase()) {
                continue;
            }
            let sample = self.probe.capacity(volume_id).and_then(|capacity| {
                VolumeUsageSample::new(volume_id.clone(), capacity.total_bytes, capacity.free_bytes)
            });
            match sample {
                Ok(sample) => {
                    info!(
                        volume = %sample.volume_id,
                        used_percent = sample.used_percent(),
                        free_bytes = sample.free_bytes,
                        "volume sampled"
                    );
                    sampling.samples.push(sample);
                }
                Err(err) => {
                    warn!(volume = %volume_id, error = %err, "volume unavailable");
                    sampling.failures.push(VolumeFailure {
                        volume_id: volume_id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        sampling
    }
}
