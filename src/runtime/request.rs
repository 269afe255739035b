//! Work submitted to the serialized execution context.

use crate::error::PatchError;
use crate::patch::{ActivationReport, PatchAttempt, StagedPatch};
use std::path::PathBuf;
use tokio::sync::oneshot;

pub enum MainRequest {
    Activate {
        attempt: PatchAttempt,
        staged: StagedPatch,
        resp: oneshot::Sender<Result<ActivationReport, PatchError>>,
    },
    Reinject {
        class_or_file: String,
        resp: oneshot::Sender<Result<(), PatchError>>,
    },
    ReloadMarkup {
        changed: PathBuf,
        resp: oneshot::Sender<Result<(), PatchError>>,
    },
    Xprobe {
        target: String,
        resp: oneshot::Sender<Result<(), PatchError>>,
    },
    Eval {
        path_id: i64,
        code: String,
        resp: oneshot::Sender<Result<(), PatchError>>,
    },
    TraceUiToolkit,
    LintReinitializers,
    Shutdown,
}

impl std::fmt::Debug for MainRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MainRequest::Activate { staged, .. } => f
                .debug_struct("Activate")
                .field("generation", &staged.generation)
                .field("path", &staged.module_path)
                .finish(),
            MainRequest::Reinject { class_or_file, .. } => {
                f.debug_struct("Reinject").field("class_or_file", class_or_file).finish()
            }
            MainRequest::ReloadMarkup { changed, .. } => {
                f.debug_struct("ReloadMarkup").field("changed", changed).finish()
            }
            MainRequest::Xprobe { target, .. } => {
                f.debug_struct("Xprobe").field("target", target).finish()
            }
            MainRequest::Eval { path_id, .. } => {
                f.debug_struct("Eval").field("path_id", path_id).finish()
            }
            MainRequest::TraceUiToolkit => f.write_str("TraceUiToolkit"),
            MainRequest::LintReinitializers => f.write_str("LintReinitializers"),
            MainRequest::Shutdown => f.write_str("Shutdown"),
        }
    }
}
