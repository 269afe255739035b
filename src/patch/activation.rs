//! Loading staged modules and adopting their code.

use super::StagedPatch;
use crate::context::ProcessContext;
use crate::error::PatchError;
use crate::runtime::{
    DylibLoader, EntryPointReplacer, LoadedModule, ModuleLoader, ModuleSymbolScanner,
    SymbolReplacer, SymbolTableScanner,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchState {
    Idle,
    Staged,
    Approved,
    Loaded,
    Completed,
    Failed(String),
}

impl PatchState {
    fn may_advance_to(&self, next: &PatchState) -> bool {
        matches!(
            (self, next),
            (PatchState::Idle, PatchState::Staged)
                | (PatchState::Staged, PatchState::Approved)
                | (PatchState::Approved, PatchState::Loaded)
                | (PatchState::Loaded, PatchState::Completed)
        )
    }
}

/// One trip through the activation state machine.
///
/// Every attempt advances the process patch counter exactly once: when it
/// reaches `Loaded`, or when it ends (fails or is dropped) before getting there.
#[derive(Debug)]
pub struct PatchAttempt {
    generation: u64,
    state: PatchState,
    counted: bool,
    context: Arc<ProcessContext>,
}

impl PatchAttempt {
    pub fn new(context: Arc<ProcessContext>) -> Self {
        Self {
            generation: context.next_generation(),
            state: PatchState::Idle,
            counted: false,
            context,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> &PatchState {
        &self.state
    }

    fn count(&mut self) {
        if !self.counted {
            self.counted = true;
            let counter = self.context.advance_patch_counter();
            debug!(generation = self.generation, counter, "Patch counter advanced");
        }
    }

    pub fn advance(&mut self, next: PatchState) -> Result<(), PatchError> {
        if !self.state.may_advance_to(&next) {
            return Err(PatchError::Activation(format!(
                "invalid transition {:?} -> {:?}",
                self.state, next
            )));
        }
        if next == PatchState::Loaded {
            self.count();
        }
        self.state = next;
        Ok(())
    }

    /// Move to `Failed`, returning the error for propagation.
    pub fn fail(&mut self, err: PatchError) -> PatchError {
        self.count();
        warn!(generation = self.generation, state = ?self.state, error = %err, "Patch attempt failed");
        self.state = PatchState::Failed(err.completion_message());
        err
    }
}

impl Drop for PatchAttempt {
    fn drop(&mut self) {
        self.count();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    pub generation: u64,
    pub replaced: usize,
    pub reinitialized: Vec<String>,
}

/// Owns the host capabilities and every module loaded so far. Lives on the
/// serialized execution context.
pub struct PatchActivator {
    loader: Box<dyn ModuleLoader>,
    scanner: Box<dyn ModuleSymbolScanner>,
    replacer: Box<dyn SymbolReplacer>,
    context: Arc<ProcessContext>,
    loaded: Vec<LoadedModule>,
}

impl PatchActivator {
    pub fn new(
        loader: Box<dyn ModuleLoader>,
        scanner: Box<dyn ModuleSymbolScanner>,
        replacer: Box<dyn SymbolReplacer>,
        context: Arc<ProcessContext>,
    ) -> Self {
        Self {
            loader,
            scanner,
            replacer,
            context,
            loaded: Vec::new(),
        }
    }

    /// Activator backed by the platform dynamic loader.
    pub fn with_defaults(context: Arc<ProcessContext>) -> Self {
        Self::new(
            Box::new(DylibLoader),
            Box::new(SymbolTableScanner),
            Box::new(EntryPointReplacer),
            context,
        )
    }

    pub fn loaded_modules(&self) -> &[LoadedModule] {
        &self.loaded
    }

    /// Drive an approved attempt through `Loaded` to `Completed`.
    pub fn activate(
        &mut self,
        attempt: &mut PatchAttempt,
        staged: &StagedPatch,
    ) -> Result<ActivationReport, PatchError> {
        if let Err(e) = attempt.advance(PatchState::Loaded) {
            return Err(attempt.fail(e));
        }

        let module = match self.loader.load(staged) {
            Ok(module) => module,
            Err(e) => return Err(attempt.fail(e)),
        };
        // Never unloaded: live state may still point into it.
        self.loaded.push(module.clone());

        let replaced = match self.replacer.replace(&module) {
            Ok(n) => n,
            Err(e) => return Err(attempt.fail(e)),
        };
        let reinitialized = self
            .context
            .registry()
            .reinitialize_after_load(&module, self.scanner.as_ref());

        attempt.advance(PatchState::Completed)?;
        info!(
            generation = attempt.generation(),
            replaced,
            reinitialized = reinitialized.len(),
            path = %staged.module_path.display(),
            "Patch activated"
        );
        Ok(ActivationReport {
            generation: attempt.generation(),
            replaced,
            reinitialized,
        })
    }

    /// Re-apply already loaded code for a class or source file.
    pub fn reinject(&mut self, class_or_file: &str) -> Result<(), PatchError> {
        self.replacer.reinject(class_or_file)
    }

    /// Lint-marked initializers that were never registered, across the host
    /// images in `host_images` and every module loaded so far.
    pub fn lint_unregistered(&self, host_images: &[PathBuf]) -> Vec<String> {
        let mut images = host_images.to_vec();
        for module in &self.loaded {
            if !images.contains(&module.path) {
                images.push(module.path.clone());
            }
        }
        self.context
            .registry()
            .unregistered(&images, self.scanner.as_ref())
    }
}
