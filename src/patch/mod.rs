//! Staged delivery and activation of compiled patch modules.
//!
//! A module travels `Idle -> Staged -> Approved -> Loaded -> {Completed, Failed}`.
//! Staging and signing run on the session's patch pipeline thread; everything
//! from `Approved` onward runs on the serialized execution context.

mod activation;
mod pipeline;
mod reinit;
mod signing;
mod staging;

pub use activation::{ActivationReport, PatchActivator, PatchAttempt, PatchState};
pub use pipeline::{PatchJob, PatchPipeline};
pub use reinit::{ReinitializationRegistry, LINT_MARKER, ONE_TIME_INITIALIZER_SUFFIX};
pub use signing::{signing_channel, SigningGate, SigningRelay};
pub use staging::{PatchStager, StagingLayout};

use std::path::PathBuf;

/// How a module arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// `Load`: replaces the code compiled from one source file.
    Load,
    /// `Copy`: an anonymous module staged under a generation-numbered name.
    Copy,
}

/// Binary payload for one reload, owned by the attempt that processes it.
#[derive(Debug, Clone)]
pub struct PatchModule {
    pub kind: PatchKind,
    /// Source identifier the module replaces (the changed file path).
    pub identifier: String,
    pub bytes: Vec<u8>,
    /// Symbol list side-car for targets that need discovery.
    pub sidecar: Option<Vec<u8>>,
    /// Patch counter value this attempt will consume.
    pub generation: u64,
}

impl PatchModule {
    /// Newly introduced symbol names listed in the side-car, one per line.
    pub fn discovered_symbols(&self) -> Vec<String> {
        self.sidecar
            .as_deref()
            .map(|bytes| {
                String::from_utf8_lossy(bytes)
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A module written to disk and ready to be approved and loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPatch {
    pub kind: PatchKind,
    pub identifier: String,
    pub generation: u64,
    pub module_path: PathBuf,
    pub sidecar_path: Option<PathBuf>,
    pub discovered_symbols: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_lines_become_symbols() {
        let module = PatchModule {
            kind: PatchKind::Load,
            identifier: "/src/Feature.swift".into(),
            bytes: vec![],
            sidecar: Some(b"$s7Feature10appReducer_WZ\n\n  $s7Feature4ViewV\n".to_vec()),
            generation: 1,
        };
        assert_eq!(
            module.discovered_symbols(),
            vec!["$s7Feature10appReducer_WZ", "$s7Feature4ViewV"]
        );
    }

    #[test]
    fn no_sidecar_no_symbols() {
        let module = PatchModule {
            kind: PatchKind::Copy,
            identifier: "eval".into(),
            bytes: vec![1, 2, 3],
            sidecar: None,
            generation: 4,
        };
        assert!(module.discovered_symbols().is_empty());
    }
}
