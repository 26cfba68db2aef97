//! Best-effort playbook persistence.
//!
//! A playbook can be persisted to a JSON file or through host-provided
//! load/save callbacks. Persistence is best-effort by contract: read and
//! write failures are logged and swallowed, never propagated to the
//! learning path that triggered them.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::playbook::Playbook;

/// Error type produced by persistence callbacks.
pub type PersistError = Box<dyn std::error::Error + Send + Sync>;

/// Host-provided load callback.
pub type LoadFn = Arc<dyn Fn() -> Result<Option<Playbook>, PersistError> + Send + Sync>;

/// Host-provided save callback.
pub type SaveFn = Arc<dyn Fn(&Playbook) -> Result<(), PersistError> + Send + Sync>;

/// Where a playbook is persisted.
#[derive(Clone)]
pub enum PlaybookStore {
    /// JSON file at a path. Parent directories are created as needed.
    File(PathBuf),
    /// Explicit load/save callbacks.
    Callbacks {
        /// Loads a previously persisted playbook, if any.
        load: LoadFn,
        /// Saves the playbook.
        save: SaveFn,
    },
}

impl fmt::Debug for PlaybookStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybookStore::File(path) => f.debug_tuple("File").field(path).finish(),
            PlaybookStore::Callbacks { .. } => write!(f, "Callbacks"),
        }
    }
}

impl PlaybookStore {
    /// Load a previously persisted playbook.
    ///
    /// Returns `None` when nothing is persisted yet or loading fails;
    /// failures are logged, not propagated.
    pub fn load(&self) -> Option<Playbook> {
        match self {
            PlaybookStore::File(path) => {
                if !path.exists() {
                    return None;
                }
                match fs::read_to_string(path) {
                    Ok(contents) => match serde_json::from_str::<Playbook>(&contents) {
                        Ok(playbook) => Some(playbook),
                        Err(e) => {
                            log::warn!("Failed to parse playbook at {:?}: {}", path, e);
                            None
                        }
                    },
                    Err(e) => {
                        log::warn!("Failed to read playbook at {:?}: {}", path, e);
                        None
                    }
                }
            }
            PlaybookStore::Callbacks { load, .. } => match load() {
                Ok(playbook) => playbook,
                Err(e) => {
                    log::warn!("Playbook load callback failed: {}", e);
                    None
                }
            },
        }
    }

    /// Persist the playbook. Failures are logged, not propagated.
    pub fn save(&self, playbook: &Playbook) {
        match self {
            PlaybookStore::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        if let Err(e) = fs::create_dir_all(parent) {
                            log::warn!("Failed to create playbook directory {:?}: {}", parent, e);
                            return;
                        }
                    }
                }
                let json = match serde_json::to_string_pretty(playbook) {
                    Ok(json) => json,
                    Err(e) => {
                        log::warn!("Failed to serialize playbook: {}", e);
                        return;
                    }
                };
                if let Err(e) = fs::write(path, json) {
                    log::warn!("Failed to write playbook to {:?}: {}", path, e);
                }
            }
            PlaybookStore::Callbacks { save, .. } => {
                if let Err(e) = save(playbook) {
                    log::warn!("Playbook save callback failed: {}", e);
                }
            }
        }
    }
}
