//! Modules mapped into the process, keyed by name.

use crate::protocol::FRAMEWORK_DELIMITER;
use crate::runtime::ImageLister;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOrigin {
    /// Shipped with the application.
    Application,
    /// Provided by the system.
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub path: PathBuf,
    pub origin: ModuleOrigin,
}

/// Built once at handshake; afterwards entries are appended, never removed.
#[derive(Debug, Clone)]
pub struct ModuleCatalog {
    app_prefix: PathBuf,
    entries: Vec<CatalogEntry>,
    by_name: HashMap<String, usize>,
}

/// Whether an image path names a loadable module worth cataloguing.
fn is_module_image(path: &Path) -> bool {
    if path.to_string_lossy().contains(".framework/") {
        return true;
    }
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    name.ends_with(".dylib") || name.ends_with(".so") || name.contains(".so.") || name.ends_with(".dll")
}

impl ModuleCatalog {
    pub fn new(app_prefix: impl Into<PathBuf>) -> Self {
        Self {
            app_prefix: app_prefix.into(),
            entries: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Catalog the given images, in order.
    pub fn from_images(app_prefix: impl Into<PathBuf>, images: &[PathBuf]) -> Self {
        let mut catalog = Self::new(app_prefix);
        for image in images {
            catalog.insert(image);
        }
        catalog
    }

    pub fn classify(&self, path: &Path) -> ModuleOrigin {
        if path.starts_with(&self.app_prefix) {
            ModuleOrigin::Application
        } else {
            ModuleOrigin::System
        }
    }

    /// Append `path` as a new module. Returns false when it is not a module or
    /// its name is already known.
    ///
    /// Images are listed most recent first, so a repeated name points the
    /// existing entry at the later, older image. The entry keeps its position.
    pub fn insert(&mut self, path: &Path) -> bool {
        if !is_module_image(path) {
            return false;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return false;
        };
        if let Some(&index) = self.by_name.get(&name) {
            let origin = self.classify(path);
            let entry = &mut self.entries[index];
            entry.path = path.to_path_buf();
            entry.origin = origin;
            return false;
        }
        let entry = CatalogEntry {
            origin: self.classify(path),
            name: name.clone(),
            path: path.to_path_buf(),
        };
        self.by_name.insert(name, self.entries.len());
        self.entries.push(entry);
        true
    }

    /// Append modules loaded since the catalog was built. Returns how many were new.
    pub fn refresh(&mut self, lister: &dyn ImageLister) -> usize {
        let mut added = 0;
        for image in lister.loaded_images() {
            if self.insert(&image) {
                added += 1;
            }
        }
        if added > 0 {
            debug!(added, total = self.entries.len(), "Module catalog refreshed");
        }
        added
    }

    pub fn lookup(&self, name: &str) -> Option<&CatalogEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of one origin joined for the `FrameworkList` response.
    pub fn joined_names(&self, origin: ModuleOrigin) -> String {
        self.entries
            .iter()
            .filter(|e| e.origin == origin)
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>()
            .join(FRAMEWORK_DELIMITER)
    }
}
