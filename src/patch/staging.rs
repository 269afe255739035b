//! Writes incoming modules to deterministic paths before they are loaded.

use super::{PatchKind, PatchModule, StagedPatch};
use crate::error::PatchError;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MODULE_EXTENSION: &str = "dylib";
const SIDECAR_EXTENSION: &str = "classes";

/// Where staged files go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingLayout {
    /// The session's staging directory is writable from this process.
    SharedDir(PathBuf),
    /// No writable shared directory: write next to the source identifier.
    AlongsideSource,
}

/// Persists patch modules (and side-cars) for the current session.
#[derive(Debug, Clone)]
pub struct PatchStager {
    layout: StagingLayout,
    staging_dir: PathBuf,
}

fn is_writable_dir(dir: &Path) -> bool {
    fs::metadata(dir)
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false)
}

/// Remove whatever is at `path`, then write `bytes`. A leftover file must
/// never be mistaken for the new one.
fn write_fresh(path: &Path, bytes: &[u8]) -> Result<(), PatchError> {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed stale staged file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(PatchError::Staging(format!(
                "could not remove {}: {}",
                path.display(),
                e
            )))
        }
    }
    fs::write(path, bytes)
        .map_err(|e| PatchError::Staging(format!("could not write {}: {}", path.display(), e)))
}

fn with_extension(base: &Path, ext: &str) -> PathBuf {
    let mut os = base.as_os_str().to_os_string();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}

impl PatchStager {
    pub fn new(layout: StagingLayout, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout,
            staging_dir: staging_dir.into(),
        }
    }

    /// Pick the layout for a coordinator-assigned staging directory.
    pub fn for_session(staging_dir: &Path) -> Self {
        let layout = if is_writable_dir(staging_dir) {
            StagingLayout::SharedDir(staging_dir.to_path_buf())
        } else {
            warn!(
                dir = %staging_dir.display(),
                "Staging directory not writable here, staging next to sources"
            );
            StagingLayout::AlongsideSource
        };
        Self::new(layout, staging_dir)
    }

    pub fn layout(&self) -> &StagingLayout {
        &self.layout
    }

    /// Base path (without extension) a module is staged under.
    pub fn base_path(&self, module: &PatchModule) -> Result<PathBuf, PatchError> {
        match module.kind {
            PatchKind::Copy => Ok(self
                .staging_dir
                .join(format!("eval{}", module.generation))),
            PatchKind::Load => match &self.layout {
                StagingLayout::SharedDir(dir) => {
                    let name = Path::new(&module.identifier).file_name().ok_or_else(|| {
                        PatchError::Staging(format!(
                            "no file name in identifier {:?}",
                            module.identifier
                        ))
                    })?;
                    Ok(dir.join(name))
                }
                StagingLayout::AlongsideSource => Ok(PathBuf::from(&module.identifier)),
            },
        }
    }

    pub fn stage(&self, module: &PatchModule) -> Result<StagedPatch, PatchError> {
        let base = self.base_path(module)?;
        let module_path = with_extension(&base, MODULE_EXTENSION);
        write_fresh(&module_path, &module.bytes)?;

        let sidecar_path = match &module.sidecar {
            Some(bytes) => {
                let path = with_extension(&base, SIDECAR_EXTENSION);
                write_fresh(&path, bytes)?;
                Some(path)
            }
            None => None,
        };

        debug!(
            path = %module_path.display(),
            generation = module.generation,
            bytes = module.bytes.len(),
            "Staged patch module"
        );

        Ok(StagedPatch {
            kind: module.kind,
            identifier: module.identifier.clone(),
            generation: module.generation,
            module_path,
            sidecar_path,
            discovered_symbols: module.discovered_symbols(),
        })
    }
}
