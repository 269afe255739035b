//! The per-connection command loop.
//!
//! Every opcode lands in one of three lanes:
//! - in-loop: plain session state updates and logging;
//! - off-context: signing verdicts and tracer calls, safe from any thread;
//! - patch pipeline: anything that owes the coordinator a completion. Those
//!   jobs are queued in order and each one is acknowledged exactly once.

use super::Session;
use crate::collaborators::{filter_summary, CoordinatorSettings, MethodTracer};
use crate::error::{PatchError, ProtocolError};
use crate::patch::{PatchAttempt, PatchJob, SigningRelay};
use crate::protocol::{Command, FrameReader, Outbound, Response, CALLORDER_DELIMITER, LOG_PREFIX};
use crate::runtime::{ImageLister, MainQueue};
use std::io::Read;
use std::ops::ControlFlow;
use std::sync::{mpsc, Arc};
use tracing::{debug, info, warn};

/// Rows shown by the elapsed-time report.
const STATS_TOP: usize = 200;

/// Why the command loop stopped.
#[derive(Debug)]
pub enum SessionEnd {
    /// The coordinator sent `End`.
    EndOfSession,
    /// The stream closed.
    Disconnected,
    /// Unknown opcode or malformed frame.
    Protocol(ProtocolError),
}

pub struct CommandDispatcher<R> {
    session: Session,
    reader: FrameReader<R>,
    outbound: Outbound,
    relay: SigningRelay,
    jobs: mpsc::Sender<PatchJob>,
    queue: MainQueue,
    tracer: Arc<dyn MethodTracer>,
    images: Arc<dyn ImageLister>,
}

impl<R: Read> CommandDispatcher<R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Session,
        reader: FrameReader<R>,
        outbound: Outbound,
        relay: SigningRelay,
        jobs: mpsc::Sender<PatchJob>,
        queue: MainQueue,
        tracer: Arc<dyn MethodTracer>,
        images: Arc<dyn ImageLister>,
    ) -> Self {
        Self {
            session,
            reader,
            outbound,
            relay,
            jobs,
            queue,
            tracer,
            images,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Read and dispatch commands until the session ends.
    pub fn run(&mut self) -> SessionEnd {
        let load_has_sidecar = self.session.arch.requires_symbol_discovery();
        loop {
            let command = match Command::read_from(&mut self.reader, load_has_sidecar) {
                Ok(command) => command,
                Err(e) if e.is_disconnect() => {
                    info!("{LOG_PREFIX}Coordinator disconnected");
                    return SessionEnd::Disconnected;
                }
                Err(e) => {
                    warn!(error = %e, "{LOG_PREFIX}Ending session on unreadable command");
                    return SessionEnd::Protocol(e);
                }
            };
            debug!(opcode = ?command.opcode(), "Command received");
            if let ControlFlow::Break(end) = self.dispatch(command) {
                return end;
            }
        }
    }

    /// Handle one command. Every opcode has an arm here.
    pub fn dispatch(&mut self, command: Command) -> ControlFlow<SessionEnd> {
        match command {
            Command::Connected { project } => {
                let project = project.unwrap_or_else(|| "Missing project".to_string());
                info!("{LOG_PREFIX}Connected to {project}");
                self.session.project_path = Some(project);
            }
            Command::Watching { directory } => {
                info!(
                    "{LOG_PREFIX}Watching files under {}",
                    directory.as_deref().unwrap_or("Missing directory")
                );
            }
            Command::Log { text } => {
                info!("{LOG_PREFIX}{}", text.as_deref().unwrap_or("Missing log message"));
            }
            Command::Signed { approved } => {
                self.relay.relay(approved);
            }
            Command::Load {
                changed,
                module,
                sidecar,
            } => self.enqueue(PatchJob::Load {
                changed,
                module,
                sidecar,
            }),
            Command::Copy { module } => self.enqueue(PatchJob::Copy { module }),
            Command::Inject { changed } => self.enqueue(PatchJob::Inject { changed }),
            Command::MarkupReload { changed } => self.enqueue(PatchJob::MarkupReload { changed }),
            Command::Xprobe { target } => self.enqueue(PatchJob::Xprobe { target }),
            Command::Eval { request } => self.enqueue(PatchJob::Eval { request }),
            Command::IdeProcPath { path } => {
                self.session.ide_proc_path = path;
            }
            Command::SettingsChanged { json } => self.settings_changed(json),
            Command::Trace => {
                self.trace_main_executable();
                self.filtering_changed();
            }
            Command::Untrace => self.tracer.remove_all_traces(),
            Command::TraceUi => {
                self.trace_main_executable();
                self.filtering_changed();
            }
            Command::TraceUiToolkit => {
                if let Err(e) = self.queue.trace_ui_toolkit() {
                    warn!(error = %e, "Could not schedule UI toolkit tracing");
                }
                self.filtering_changed();
            }
            Command::TraceSwiftUi => {
                if self.tracer.trace_declarative_ui() {
                    info!("{LOG_PREFIX}Adding trace to declarative UI calls.");
                    self.filtering_changed();
                } else {
                    info!("{LOG_PREFIX}Your app doesn't seem to use a declarative UI framework.");
                }
            }
            Command::TraceFramework { name } => {
                self.trace_framework(name.unwrap_or_else(|| "Missing framework".to_string()));
                self.filtering_changed();
            }
            Command::QuietInclude { pattern } => self.tracer.set_include(pattern),
            Command::Include { pattern } => {
                self.tracer.set_include(pattern);
                self.filtering_changed();
            }
            Command::Exclude { pattern } => {
                self.tracer.set_exclude(pattern);
                self.filtering_changed();
            }
            Command::Stats => {
                info!("{LOG_PREFIX}Sorted top {STATS_TOP} elapsed time/invocations by method");
                for line in self.tracer.stats(STATS_TOP) {
                    info!("{line}");
                }
                self.needs_tracing();
            }
            Command::CallOrder => {
                info!("{LOG_PREFIX}Function names in the order they were first called:");
                for signature in self.tracer.call_order() {
                    info!("{signature}");
                }
                self.needs_tracing();
            }
            Command::FileOrder => {
                info!("{LOG_PREFIX}Source files in the order they were first referenced:");
                for file in self.tracer.file_order() {
                    info!("{file}");
                }
                self.needs_tracing();
            }
            Command::FileReorder => {
                let order = self.tracer.call_order().join(CALLORDER_DELIMITER);
                if let Err(e) = self.outbound.send(Response::CallOrderList, Some(&order)) {
                    warn!(error = %e, "Failed to send call order");
                }
                self.needs_tracing();
            }
            Command::Uninterpose => {
                self.tracer.revert_interposes();
                info!("{LOG_PREFIX}Removed all traces (and injections).");
            }
            Command::Feedback { enabled } => {
                self.session.trace_injection = enabled;
            }
            Command::Lookup { enabled } => {
                self.tracer.set_type_lookup(enabled);
                if self.tracer.is_tracing() {
                    info!(
                        "{LOG_PREFIX}Discovery of target app's types switched {}",
                        if enabled { "on" } else { "off" }
                    );
                }
            }
            Command::Counts => {
                info!("{LOG_PREFIX}Counts of live objects by class:");
                for (class, count) in self.tracer.object_counts() {
                    info!("{class}: {count}");
                }
                self.needs_tracing();
            }
            Command::Invalid => {
                warn!("{LOG_PREFIX}Coordinator has rejected this connection. Is it running from the right directory?");
            }
            Command::End => {
                info!("{LOG_PREFIX}End of session received");
                return ControlFlow::Break(SessionEnd::EndOfSession);
            }
        }
        ControlFlow::Continue(())
    }

    /// Hand a job to the pipeline. If the pipeline is gone, acknowledge here.
    fn enqueue(&mut self, job: PatchJob) {
        if let Err(mpsc::SendError(job)) = self.jobs.send(job) {
            if matches!(job, PatchJob::Load { .. } | PatchJob::Copy { .. }) {
                // Counts as an attempt all the same.
                drop(PatchAttempt::new(self.session.context().clone()));
            }
            if let Err(e) = self.outbound.send_completion(&Err(PatchError::WorkerClosed)) {
                warn!(error = %e, "Failed to write completion");
            }
        }
    }

    fn settings_changed(&mut self, json: Option<String>) {
        let Some(json) = json else {
            return;
        };
        match CoordinatorSettings::parse(&json) {
            Ok(update) => {
                self.session.settings.merge(update);
                debug!(settings = ?self.session.settings, "Coordinator settings updated");
            }
            Err(e) => warn!(error = %e, "Ignoring malformed settings"),
        }
    }

    fn trace_main_executable(&self) {
        if self.tracer.trace_main_executable() == 0 {
            warn!("{LOG_PREFIX}Tracing only works if the executable was linked with interposable symbols");
        } else {
            info!("{LOG_PREFIX}Added trace to methods in main executable");
        }
    }

    fn trace_framework(&mut self, name: String) {
        if self.session.catalog.lookup(&name).is_none() {
            self.session.catalog.refresh(self.images.as_ref());
        }
        match self.session.catalog.lookup(&name) {
            Some(entry) => {
                info!("{LOG_PREFIX}Tracing {}", entry.path.display());
                self.tracer.trace_module(&entry.path);
            }
            None => {
                info!("{LOG_PREFIX}Tracing package {name}");
                self.tracer
                    .trace_package(&self.session.executable_path, &name);
            }
        }
    }

    fn filtering_changed(&self) {
        if self.tracer.is_tracing() {
            let (include, exclude) = self.tracer.filters();
            info!(
                "{LOG_PREFIX}{}",
                filter_summary(include.as_deref(), exclude.as_deref())
            );
        }
    }

    fn needs_tracing(&self) {
        if !self.tracer.is_tracing() {
            warn!("{LOG_PREFIX}You need to have traced something to gather stats.");
        }
    }
}
