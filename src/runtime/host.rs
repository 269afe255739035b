//! Capabilities the host environment supplies to the activator.

use crate::error::PatchError;
use crate::patch::StagedPatch;
use libloading::Library;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Entry point of a one-time global initializer.
pub type OneTimeInitializer = unsafe extern "C" fn();

/// A symbol found in a loaded module.
#[derive(Debug, Clone)]
pub struct ScannedSymbol {
    pub name: String,
    pub initializer: OneTimeInitializer,
}

/// A module mapped into the process. Never unloaded: replaced code may still
/// be referenced from live state.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub path: PathBuf,
    pub generation: u64,
    pub discovered_symbols: Vec<String>,
    library: Option<Arc<Library>>,
}

impl LoadedModule {
    /// A module loaded by some mechanism other than libloading.
    pub fn new(path: impl Into<PathBuf>, generation: u64, discovered_symbols: Vec<String>) -> Self {
        Self {
            path: path.into(),
            generation,
            discovered_symbols,
            library: None,
        }
    }

    pub fn with_library(
        path: impl Into<PathBuf>,
        generation: u64,
        discovered_symbols: Vec<String>,
        library: Library,
    ) -> Self {
        Self {
            path: path.into(),
            generation,
            discovered_symbols,
            library: Some(Arc::new(library)),
        }
    }

    pub fn library(&self) -> Option<&Library> {
        self.library.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Maps a staged module into the running process.
pub trait ModuleLoader {
    fn load(&mut self, staged: &StagedPatch) -> Result<LoadedModule, PatchError>;
}

/// Walks loaded-code metadata for symbols following a naming convention.
pub trait ModuleSymbolScanner {
    /// Symbols defined by `module` itself ending with `suffix`. Symbols only
    /// reachable through the module's dependencies are never returned.
    /// `hints` lists names the caller is interested in, for scanners that can
    /// only resolve by name.
    fn scan(&self, module: &LoadedModule, suffix: &str, hints: &[String]) -> Vec<ScannedSymbol>;

    /// Names containing `marker` defined by any of the images at `images`.
    fn scan_images(&self, images: &[PathBuf], marker: &str) -> Vec<String>;
}

/// Swaps live implementations for the ones in a loaded module.
pub trait SymbolReplacer {
    /// Returns how many symbols were replaced.
    fn replace(&mut self, module: &LoadedModule) -> Result<usize, PatchError>;

    /// Re-apply already loaded code for a class or source file name.
    fn reinject(&mut self, class_or_file: &str) -> Result<(), PatchError>;
}
