//! Default host capabilities backed by the platform dynamic loader.

use super::host::{
    LoadedModule, ModuleLoader, ModuleSymbolScanner, OneTimeInitializer, ScannedSymbol,
    SymbolReplacer,
};
use super::symbols::{address_in_image, defined_symbols};
use crate::error::PatchError;
use crate::patch::StagedPatch;
use libloading::Library;
use std::collections::BTreeSet;
use std::ffi::c_void;
use std::path::PathBuf;
use tracing::{debug, info};

/// Optional export of a patch module: applies the module's replacements and
/// returns how many it performed.
pub const PATCH_ENTRY_SYMBOL: &str = "hotpatch_apply";

type PatchEntry = unsafe extern "C" fn() -> u32;

/// Loads staged modules with `dlopen`/`LoadLibrary`.
#[derive(Debug, Default)]
pub struct DylibLoader;

impl ModuleLoader for DylibLoader {
    fn load(&mut self, staged: &StagedPatch) -> Result<LoadedModule, PatchError> {
        // SAFETY: loading runs the module's static constructors. The module was
        // produced by the coordinator for this process and, where required,
        // approved by the signing gate before reaching this point.
        let library = unsafe { Library::new(&staged.module_path) }
            .map_err(|e| PatchError::Load(format!("{}: {}", staged.module_path.display(), e)))?;
        info!(path = %staged.module_path.display(), generation = staged.generation, "Loaded module");
        Ok(LoadedModule::with_library(
            &staged.module_path,
            staged.generation,
            staged.discovered_symbols.clone(),
            library,
        ))
    }
}

/// Resolve `name` through the module's handle and keep it only if the module
/// itself defines it. `dlsym` on a handle also searches the module's
/// dependencies.
fn resolves_inside(
    module: &LoadedModule,
    library: &Library,
    defined: &BTreeSet<String>,
    name: &str,
) -> bool {
    // SAFETY: only the symbol's address is read; nothing is called.
    let Ok(address) = (unsafe { library.get::<*const c_void>(name.as_bytes()) }) else {
        return false;
    };
    address_in_image(*address, &module.path).unwrap_or_else(|| defined.contains(name))
}

/// Defined symbols of a loaded module, or nothing if its file is unreadable.
fn module_symbols(module: &LoadedModule) -> BTreeSet<String> {
    defined_symbols(&module.path).unwrap_or_else(|e| {
        debug!(path = %module.path.display(), error = %e, "Symbol table unavailable");
        BTreeSet::new()
    })
}

/// Finds convention-matching names in each image's symbol table and resolves
/// them through the module's own handle. Side-car names and caller hints are
/// tried as well, for images whose table cannot be read.
#[derive(Debug, Default)]
pub struct SymbolTableScanner;

impl ModuleSymbolScanner for SymbolTableScanner {
    fn scan(&self, module: &LoadedModule, suffix: &str, hints: &[String]) -> Vec<ScannedSymbol> {
        let Some(library) = module.library() else {
            return Vec::new();
        };
        let defined = module_symbols(module);
        let candidates: BTreeSet<&String> = defined
            .iter()
            .chain(&module.discovered_symbols)
            .chain(hints)
            .filter(|name| name.ends_with(suffix))
            .collect();

        candidates
            .into_iter()
            .filter(|name| {
                let inside = resolves_inside(module, library, &defined, name);
                if !inside {
                    debug!(symbol = %name, path = %module.path.display(), "Not defined by this module");
                }
                inside
            })
            .filter_map(|name| {
                // SAFETY: convention-matching symbols are no-argument
                // initializers; the fn pointer outlives the borrow because the
                // library stays loaded for the life of the process.
                let symbol = unsafe { library.get::<OneTimeInitializer>(name.as_bytes()) }.ok()?;
                Some(ScannedSymbol {
                    name: name.clone(),
                    initializer: *symbol,
                })
            })
            .collect()
    }

    fn scan_images(&self, images: &[PathBuf], marker: &str) -> Vec<String> {
        let mut found = BTreeSet::new();
        for image in images {
            match defined_symbols(image) {
                Ok(names) => found.extend(names.into_iter().filter(|n| n.contains(marker))),
                Err(e) => debug!(image = %image.display(), error = %e, "Skipping image"),
            }
        }
        found.into_iter().collect()
    }
}

/// Counts a module's replacements: its side-car symbols that resolve, plus
/// whatever its `hotpatch_apply` entry reports.
#[derive(Debug, Default)]
pub struct EntryPointReplacer;

impl SymbolReplacer for EntryPointReplacer {
    fn replace(&mut self, module: &LoadedModule) -> Result<usize, PatchError> {
        let library = module.library().ok_or_else(|| {
            PatchError::Activation(format!("{} has no library handle", module.path.display()))
        })?;

        let defined = module_symbols(module);
        let mut replaced = module
            .discovered_symbols
            .iter()
            .filter(|name| resolves_inside(module, library, &defined, name))
            .count();

        // SAFETY: `hotpatch_apply` is declared by patch modules as
        // `extern "C" fn() -> u32` and takes no arguments.
        if let Ok(entry) = unsafe { library.get::<PatchEntry>(PATCH_ENTRY_SYMBOL.as_bytes()) } {
            let applied = unsafe { entry() } as usize;
            debug!(applied, "Module entry point applied replacements");
            replaced += applied;
        }

        if replaced == 0 {
            return Err(PatchError::Activation(format!(
                "no symbols to replace in {}",
                module.path.display()
            )));
        }
        Ok(replaced)
    }

    fn reinject(&mut self, class_or_file: &str) -> Result<(), PatchError> {
        Err(PatchError::Unsupported(format!(
            "re-injecting {class_or_file} needs a runtime with class metadata"
        )))
    }
}
