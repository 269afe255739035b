//! Allow-list of one-time global initializers that may be re-run after a load.

use crate::runtime::{LoadedModule, ModuleSymbolScanner};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Naming convention of one-time global initializer symbols.
pub const ONE_TIME_INITIALIZER_SUFFIX: &str = "_WZ";
/// Initializers the lint expects applications to register.
pub const LINT_MARKER: &str = "Reducer_WZ";

/// Process-wide, append-only set of injectable initializer symbols.
///
/// Registration happens on arbitrary application threads; scans happen on the
/// serialized context.
#[derive(Debug, Default)]
pub struct ReinitializationRegistry {
    symbols: Mutex<BTreeSet<String>>,
}

impl ReinitializationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.symbols.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add `symbol` to the allow-list. Returns true when it was new.
    /// Applications register through `ProcessContext::register_reinitializer`,
    /// which also schedules the lint.
    pub(crate) fn register(&self, symbol: &str) -> bool {
        self.lock().insert(symbol.to_string())
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.lock().contains(symbol)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sorted copy of the allow-list.
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    /// Re-run the allow-listed initializers found in a freshly loaded module.
    ///
    /// Each matching initializer runs exactly once. Symbols matching the
    /// convention but absent from the allow-list are never run. Returns the
    /// names actually invoked.
    pub fn reinitialize_after_load(
        &self,
        module: &LoadedModule,
        scanner: &dyn ModuleSymbolScanner,
    ) -> Vec<String> {
        // Copy out so initializers may register further symbols without deadlocking.
        let allowed: HashSet<String> = self.lock().iter().cloned().collect();
        if allowed.is_empty() {
            return Vec::new();
        }
        let hints: Vec<String> = allowed.iter().cloned().collect();

        let mut invoked = Vec::new();
        let mut seen = HashSet::new();
        for symbol in scanner.scan(module, ONE_TIME_INITIALIZER_SUFFIX, &hints) {
            if !symbol.name.ends_with(ONE_TIME_INITIALIZER_SUFFIX) {
                continue;
            }
            if !allowed.contains(&symbol.name) {
                debug!(symbol = %symbol.name, "Not re-running unregistered initializer");
                continue;
            }
            if !seen.insert(symbol.name.clone()) {
                continue;
            }
            // SAFETY: scanners only hand out entry points of no-argument
            // one-time initializers that live in `module`, which the
            // activator keeps loaded for the rest of the process.
            unsafe { (symbol.initializer)() };
            info!(symbol = %symbol.name, generation = module.generation, "Re-ran initializer");
            invoked.push(symbol.name);
        }
        invoked
    }

    /// Initializers following the lint marker, defined by any of `images`,
    /// that nobody registered.
    pub fn unregistered(&self, images: &[PathBuf], scanner: &dyn ModuleSymbolScanner) -> Vec<String> {
        let found: BTreeSet<String> = scanner.scan_images(images, LINT_MARKER).into_iter().collect();
        let registered = self.lock();
        found.difference(&registered).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ScannedSymbol;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static REGISTERED_RUNS: AtomicUsize = AtomicUsize::new(0);
    static UNREGISTERED_RUNS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn registered_init() {
        REGISTERED_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn unregistered_init() {
        UNREGISTERED_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    struct FixedScanner(Vec<ScannedSymbol>);

    impl ModuleSymbolScanner for FixedScanner {
        fn scan(&self, _module: &LoadedModule, _suffix: &str, _hints: &[String]) -> Vec<ScannedSymbol> {
            self.0.clone()
        }

        fn scan_images(&self, _images: &[PathBuf], marker: &str) -> Vec<String> {
            self.0
                .iter()
                .map(|s| s.name.clone())
                .filter(|n| n.contains(marker))
                .collect()
        }
    }

    #[test]
    fn register_is_idempotent() {
        let registry = ReinitializationRegistry::new();
        assert!(registry.register("$s4App10appReducer_WZ"));
        let once = registry.snapshot();
        assert!(!registry.register("$s4App10appReducer_WZ"));
        assert_eq!(registry.snapshot(), once);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn only_allow_listed_initializers_run() {
        let registry = ReinitializationRegistry::new();
        registry.register("$s4App10appReducer_WZ");

        let scanner = FixedScanner(vec![
            ScannedSymbol {
                name: "$s4App10appReducer_WZ".into(),
                initializer: registered_init,
            },
            // Same symbol reported twice still runs once.
            ScannedSymbol {
                name: "$s4App10appReducer_WZ".into(),
                initializer: registered_init,
            },
            ScannedSymbol {
                name: "$s4App8SneakyFxV_WZ".into(),
                initializer: unregistered_init,
            },
        ]);
        let module = LoadedModule::new("/tmp/App.swift.dylib", 1, Vec::new());

        let invoked = registry.reinitialize_after_load(&module, &scanner);

        assert_eq!(invoked, vec!["$s4App10appReducer_WZ"]);
        assert_eq!(REGISTERED_RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(UNREGISTERED_RUNS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn allow_listed_name_without_convention_is_skipped() {
        let registry = ReinitializationRegistry::new();
        registry.register("plain_function");
        let scanner = FixedScanner(vec![ScannedSymbol {
            name: "plain_function".into(),
            initializer: unregistered_init,
        }]);
        let module = LoadedModule::new("/tmp/x.dylib", 2, Vec::new());
        assert!(registry.reinitialize_after_load(&module, &scanner).is_empty());
    }

    #[test]
    fn lint_reports_unregistered_reducers_only() {
        let registry = ReinitializationRegistry::new();
        registry.register("$s1A10appReducer_WZ");
        let scanner = FixedScanner(vec![
            ScannedSymbol {
                name: "$s1A10appReducer_WZ".into(),
                initializer: unregistered_init,
            },
            ScannedSymbol {
                name: "$s1B10appReducer_WZ".into(),
                initializer: unregistered_init,
            },
            ScannedSymbol {
                name: "$s1C5ThemeV_WZ".into(),
                initializer: unregistered_init,
            },
        ]);
        assert_eq!(registry.unregistered(&[], &scanner), vec!["$s1B10appReducer_WZ"]);
    }
}
