//! Persistent per-VM metadata, one JSON file per VM.
//!
//! The store is the source of truth for the supervisor. Writes go through
//! the advisory-locked atomic writer; reads are tolerant of missing fields
//! so older files keep loading after schema additions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::lockfile;

pub const METADATA_FILE: &str = "metadata.json";

/// Runtime status; derived from QMP on every read, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmStatus {
    Running,
    #[default]
    Stopped,
    Paused,
    Unknown,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Paused => "paused",
            VmStatus::Unknown => "unknown",
        }
    }

    /// Map a QMP `query-status` value onto the observable states.
    pub fn from_qmp(status: &str) -> VmStatus {
        match status {
            "running" => VmStatus::Running,
            "paused" => VmStatus::Paused,
            _ => VmStatus::Unknown,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExtraVolume {
    pub name: String,
    pub path: String,
    pub size: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VmMetadata {
    pub name: String,
    pub owner: String,
    pub image: String,
    pub arch: String,
    pub volume: String,
    pub mac_address: String,
    pub ip_address: String,
    pub cpu: String,
    pub memory: String,
    pub disk: String,
    pub tag: String,
    pub lock: bool,
    pub vnc_password: String,
    pub vnc_port: String,
    pub user_data: String,
    pub cloud_init_iso: String,
    pub extra_volumes: Vec<ExtraVolume>,
    /// Overlaid from QMP by the supervisor; not part of the on-disk schema.
    #[serde(skip)]
    pub status: VmStatus,
}

/// Path-safe VM name: 1–64 chars of `[A-Za-z0-9._-]`, no leading dot.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid("VM name cannot be empty"));
    }
    if name.len() > 64 {
        return Err(Error::invalid("VM name must be 64 characters or fewer"));
    }
    if name.starts_with('.') {
        return Err(Error::invalid("VM name cannot start with a dot"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::invalid(
            "VM name must only contain alphanumeric characters, hyphens, underscores, and dots",
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub struct MetaStore {
    vm_root: PathBuf,
}

impl MetaStore {
    pub fn new(vm_root: impl Into<PathBuf>) -> Self {
        MetaStore {
            vm_root: vm_root.into(),
        }
    }

    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.vm_root.join(name)
    }

    pub fn metadata_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join(METADATA_FILE)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.metadata_path(name).exists()
    }

    /// Serialize and write `meta` under the per-VM advisory lock.
    pub fn save(&self, name: &str, meta: &VmMetadata) -> Result<()> {
        let dir = self.vm_dir(name);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::upstream(format!("create VM dir {}", dir.display()), e))?;

        let bytes = serde_json::to_vec_pretty(meta)
            .map_err(|e| Error::upstream("serialize VM metadata", e))?;
        let path = dir.join(METADATA_FILE);
        lockfile::write_locked(&path, &bytes)
            .map_err(|e| Error::upstream(format!("write {}", path.display()), e))
    }

    /// Best-effort read; unknown fields are ignored, absent files are
    /// `NotFound`.
    pub fn load(&self, name: &str) -> Result<VmMetadata> {
        let path = self.metadata_path(name);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("VM", name));
            }
            Err(e) => return Err(Error::upstream(format!("read {}", path.display()), e)),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::upstream(format!("parse {}", path.display()), e))
    }

    /// Enumerate VM directories. Per-entry failures are logged and
    /// skipped, never fatal to the listing.
    pub fn list(&self) -> Result<Vec<VmMetadata>> {
        let entries = match std::fs::read_dir(&self.vm_root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::upstream(
                    format!("read VM dir {}", self.vm_root.display()),
                    e,
                ))
            }
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable VM dir entry");
                    continue;
                }
            };
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_name(&name).is_err() {
                continue;
            }
            match self.load(&name) {
                Ok(meta) => out.push(meta),
                Err(e) => warn!(vm = %name, error = %e, "skipping unloadable VM"),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Recursively delete the VM directory.
    pub fn remove_all(&self, name: &str) -> Result<()> {
        let dir = self.vm_dir(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::upstream(format!("remove {}", dir.display()), e)),
        }
    }
}
