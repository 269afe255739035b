//! Per-session worker that takes patch requests from the read loop and sees
//! each one through to its single acknowledgement.
//!
//! Jobs run strictly in arrival order: a second `load` is not staged until the
//! first one's completion has been written. Staging and signing happen here;
//! activation is handed to the serialized execution context.

use super::{
    ActivationReport, PatchAttempt, PatchKind, PatchModule, PatchStager, PatchState, SigningGate,
};
use crate::context::ProcessContext;
use crate::error::PatchError;
use crate::protocol::{Outbound, Response};
use crate::runtime::MainQueue;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

const MARKUP_SUFFIXES: [&str; 2] = [".storyboard", ".xib"];
/// Seconds the coordinator is asked to wait while an eval runs.
const EVAL_PAUSE_SECS: &str = "5";

/// A request that owes the coordinator exactly one completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchJob {
    Load {
        changed: Option<String>,
        module: Option<Vec<u8>>,
        sidecar: Option<Vec<u8>>,
    },
    Copy {
        module: Option<Vec<u8>>,
    },
    Inject {
        changed: Option<String>,
    },
    MarkupReload {
        changed: Option<String>,
    },
    Xprobe {
        target: Option<String>,
    },
    Eval {
        request: Option<String>,
    },
}

impl PatchJob {
    fn name(&self) -> &'static str {
        match self {
            PatchJob::Load { .. } => "load",
            PatchJob::Copy { .. } => "copy",
            PatchJob::Inject { .. } => "inject",
            PatchJob::MarkupReload { .. } => "markup-reload",
            PatchJob::Xprobe { .. } => "xprobe",
            PatchJob::Eval { .. } => "eval",
        }
    }
}

fn is_markup(path: &str) -> bool {
    MARKUP_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}

/// Split `pathId^...^...^percent-encoded-code` into the object id and code.
pub fn parse_eval_request(request: &str) -> Result<(i64, String), PatchError> {
    let parts: Vec<&str> = request.split('^').collect();
    if parts.len() < 4 {
        return Err(PatchError::Activation(format!(
            "malformed eval request ({} fields)",
            parts.len()
        )));
    }
    let path_id = parts[0]
        .parse::<i64>()
        .map_err(|_| PatchError::Activation(format!("invalid eval path id {:?}", parts[0])))?;
    let code = urlencoding::decode(parts[3])
        .map_err(|e| PatchError::Activation(format!("eval code is not UTF-8: {e}")))?;
    Ok((path_id, code.into_owned()))
}

fn required<T>(value: Option<T>, what: &str) -> Result<T, PatchError> {
    value.ok_or_else(|| PatchError::Staging(format!("missing {what}")))
}

pub struct PatchPipeline {
    stager: PatchStager,
    gate: Option<SigningGate>,
    queue: MainQueue,
    outbound: Outbound,
    context: Arc<ProcessContext>,
}

impl PatchPipeline {
    /// `gate` is `None` on targets that load modules without approval.
    pub fn new(
        stager: PatchStager,
        gate: Option<SigningGate>,
        queue: MainQueue,
        outbound: Outbound,
        context: Arc<ProcessContext>,
    ) -> Self {
        Self {
            stager,
            gate,
            queue,
            outbound,
            context,
        }
    }

    /// Start the worker thread. It exits once the returned sender is dropped
    /// and the jobs already queued have been acknowledged.
    pub fn spawn(self) -> std::io::Result<(mpsc::Sender<PatchJob>, JoinHandle<()>)> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("hotpatch-pipeline".to_string())
            .spawn(move || self.run(rx))?;
        Ok((tx, handle))
    }

    pub fn run(self, rx: mpsc::Receiver<PatchJob>) {
        while let Ok(job) = rx.recv() {
            self.process(job);
        }
        debug!("Patch pipeline stopped");
    }

    /// Execute one job and write its completion.
    pub fn process(&self, job: PatchJob) {
        let name = job.name();
        let result = self.execute(job);
        if let Err(e) = &result {
            warn!(job = name, error = %e, "Patch request failed");
        }
        if let Err(e) = self.outbound.send_completion(&result) {
            warn!(job = name, error = %e, "Failed to write completion");
        }
    }

    fn execute(&self, job: PatchJob) -> Result<(), PatchError> {
        match job {
            PatchJob::Load {
                changed,
                module,
                sidecar,
            } => {
                let report = self.load(PatchKind::Load, changed, module, sidecar)?;
                info!(
                    generation = report.generation,
                    replaced = report.replaced,
                    "Load complete"
                );
                Ok(())
            }
            PatchJob::Copy { module } => {
                let report =
                    self.load(PatchKind::Copy, Some("copy".to_string()), module, None)?;
                info!(generation = report.generation, "Copy complete");
                Ok(())
            }
            PatchJob::Inject { changed } => {
                let changed = required(changed, "changed file name")?;
                if is_markup(&changed) {
                    self.queue.reload_markup(PathBuf::from(changed))
                } else {
                    self.queue.reinject(changed)
                }
            }
            PatchJob::MarkupReload { changed } => {
                let changed = required(changed, "changed file name")?;
                self.queue.reload_markup(PathBuf::from(changed))
            }
            PatchJob::Xprobe { target } => self.queue.xprobe(target.unwrap_or_default()),
            PatchJob::Eval { request } => {
                let (path_id, code) = parse_eval_request(&required(request, "eval request")?)?;
                if let Err(e) = self.outbound.send(Response::Pause, Some(EVAL_PAUSE_SECS)) {
                    warn!(error = %e, "Failed to write pause");
                }
                self.queue.eval(path_id, code)
            }
        }
    }

    /// Stage, approve and activate one module. The attempt is counted exactly
    /// once whichever step it stops at.
    fn load(
        &self,
        kind: PatchKind,
        identifier: Option<String>,
        bytes: Option<Vec<u8>>,
        sidecar: Option<Vec<u8>>,
    ) -> Result<ActivationReport, PatchError> {
        let mut attempt = PatchAttempt::new(self.context.clone());
        let module = match (identifier, bytes) {
            (Some(identifier), Some(bytes)) => PatchModule {
                kind,
                identifier,
                bytes,
                sidecar,
                generation: attempt.generation(),
            },
            (None, _) => return Err(attempt.fail(PatchError::Staging("missing changed file name".into()))),
            (_, None) => return Err(attempt.fail(PatchError::Staging("missing module payload".into()))),
        };

        let staged = self.stager.stage(&module).map_err(|e| attempt.fail(e))?;
        attempt.advance(PatchState::Staged)?;

        if let Some(gate) = &self.gate {
            let module_id = staged.module_path.display().to_string();
            if !gate.request_approval(&module_id) {
                return Err(attempt.fail(PatchError::ApprovalDenied(module_id)));
            }
        }
        attempt.advance(PatchState::Approved)?;

        self.queue.activate(attempt, staged)
    }
}
