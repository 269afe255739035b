//! Interfaces of the subsystems the client drives but does not implement:
//! method tracing, markup reloading and the remote object inspector.
//!
//! The defaults here only log what they were asked to do, so a host without
//! those subsystems still gets a well-behaved session.

use crate::error::PatchError;
use crate::protocol::LOG_PREFIX;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

/// Method tracing and interposition. Called off the serialized context, so
/// implementations must be thread-safe.
pub trait MethodTracer: Send + Sync {
    fn is_tracing(&self) -> bool;

    /// Trace every method in the main executable. Returns how many were traced.
    fn trace_main_executable(&self) -> usize;

    /// Trace the UI toolkit's own module. Runs on the serialized context.
    fn trace_ui_toolkit(&self);

    /// Trace the declarative UI framework. Returns false if the app does not use it.
    fn trace_declarative_ui(&self) -> bool;

    /// Trace every method in the module at `path`.
    fn trace_module(&self, path: &Path);

    /// Trace one package linked into the main executable.
    fn trace_package(&self, executable: &Path, package: &str);

    fn remove_all_traces(&self);

    /// Undo interposes (including injected ones) and remove all traces.
    fn revert_interposes(&self);

    fn set_include(&self, pattern: Option<String>);
    fn set_exclude(&self, pattern: Option<String>);
    fn filters(&self) -> (Option<String>, Option<String>);

    fn set_type_lookup(&self, enabled: bool);

    /// Lines of the elapsed-time report, slowest first.
    fn stats(&self, top: usize) -> Vec<String>;
    /// Function signatures in first-call order.
    fn call_order(&self) -> Vec<String>;
    /// Source files in first-reference order.
    fn file_order(&self) -> Vec<String>;
    /// Live object counts by class.
    fn object_counts(&self) -> Vec<(String, usize)>;
}

/// Human-readable description of the effective trace filter.
pub fn filter_summary(include: Option<&str>, exclude: Option<&str>) -> String {
    match (include, exclude) {
        (Some(inc), Some(exc)) => {
            format!("Filtering trace to include methods matching '{inc}' but not '{exc}'.")
        }
        (Some(inc), None) => format!("Filtering trace to include methods matching '{inc}'."),
        (None, Some(exc)) => format!("Filtering trace to exclude methods matching '{exc}'."),
        (None, None) => "Not filtering trace".to_string(),
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TracerState {
    pub tracing: bool,
    pub include: Option<String>,
    pub exclude: Option<String>,
    pub type_lookup: bool,
    pub traced: Vec<String>,
}

/// Tracer without an interposition engine: remembers requests and logs them.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    state: Mutex<TracerState>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TracerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> TracerState {
        self.lock().clone()
    }

    fn record(&self, what: String) {
        info!("{LOG_PREFIX}Trace requested: {what}");
        let mut state = self.lock();
        state.tracing = true;
        state.traced.push(what);
    }
}

impl MethodTracer for RecordingTracer {
    fn is_tracing(&self) -> bool {
        self.lock().tracing
    }

    fn trace_main_executable(&self) -> usize {
        self.record("main executable".to_string());
        0
    }

    fn trace_ui_toolkit(&self) {
        self.record("UI toolkit".to_string());
    }

    fn trace_declarative_ui(&self) -> bool {
        false
    }

    fn trace_module(&self, path: &Path) {
        self.record(path.display().to_string());
    }

    fn trace_package(&self, executable: &Path, package: &str) {
        self.record(format!("{package} in {}", executable.display()));
    }

    fn remove_all_traces(&self) {
        let mut state = self.lock();
        state.tracing = false;
        state.traced.clear();
    }

    fn revert_interposes(&self) {
        self.remove_all_traces();
    }

    fn set_include(&self, pattern: Option<String>) {
        self.lock().include = pattern;
    }

    fn set_exclude(&self, pattern: Option<String>) {
        self.lock().exclude = pattern;
    }

    fn filters(&self) -> (Option<String>, Option<String>) {
        let state = self.lock();
        (state.include.clone(), state.exclude.clone())
    }

    fn set_type_lookup(&self, enabled: bool) {
        self.lock().type_lookup = enabled;
    }

    fn stats(&self, _top: usize) -> Vec<String> {
        Vec::new()
    }

    fn call_order(&self) -> Vec<String> {
        Vec::new()
    }

    fn file_order(&self) -> Vec<String> {
        Vec::new()
    }

    fn object_counts(&self) -> Vec<(String, usize)> {
        Vec::new()
    }
}

/// Reloads UI markup resources (storyboards, nibs). Runs on the serialized context.
pub trait MarkupReloader {
    fn reload(&mut self, changed: &Path) -> Result<(), PatchError>;
}

#[derive(Debug, Default)]
pub struct UnsupportedMarkup;

impl MarkupReloader for UnsupportedMarkup {
    fn reload(&mut self, changed: &Path) -> Result<(), PatchError> {
        Err(PatchError::Activation(format!(
            "markup reload is not supported on this platform ({})",
            changed.display()
        )))
    }
}

/// Remote object inspection console. Runs on the serialized context.
pub trait ObjectInspector {
    fn xprobe(&mut self, target: &str) -> Result<(), PatchError>;

    /// Evaluate `code` in the context of the object at `path_id`.
    fn eval(&mut self, path_id: i64, code: &str) -> Result<(), PatchError>;
}

#[derive(Debug, Default)]
pub struct LoggingInspector;

impl ObjectInspector for LoggingInspector {
    fn xprobe(&mut self, target: &str) -> Result<(), PatchError> {
        info!(target = %target, "{LOG_PREFIX}Object inspector connection requested");
        Ok(())
    }

    fn eval(&mut self, path_id: i64, code: &str) -> Result<(), PatchError> {
        warn!(
            path_id,
            bytes = code.len(),
            "{LOG_PREFIX}Eval needs an object inspector; nothing was evaluated"
        );
        Ok(())
    }
}

/// Coordinator preferences pushed with `SettingsChanged`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vaccine_enabled: Option<bool>,
}

impl CoordinatorSettings {
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Overlay the values present in `update`.
    pub fn merge(&mut self, update: CoordinatorSettings) {
        if update.vaccine_enabled.is_some() {
            self.vaccine_enabled = update.vaccine_enabled;
        }
    }
}
