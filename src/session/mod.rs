//! One connection to the build coordinator.
//!
//! A session runs the handshake, starts the patch pipeline for the negotiated
//! staging directory and then hands the read half to the [`CommandDispatcher`]
//! until the coordinator ends the session or the stream breaks. Nothing here
//! ever exits the process.

mod catalog;
mod dispatcher;
mod handshake;

pub use catalog::{CatalogEntry, ModuleCatalog, ModuleOrigin};
pub use dispatcher::{CommandDispatcher, SessionEnd};
pub use handshake::{negotiate, read_sign_identity, Negotiated, UNREADABLE_IDENTITY, UNSIGNED_IDENTITY};

use crate::collaborators::{CoordinatorSettings, MethodTracer};
use crate::config::{ClientConfig, TargetArch};
use crate::context::ProcessContext;
use crate::error::ProtocolError;
use crate::patch::{signing_channel, PatchPipeline, PatchStager};
use crate::protocol::{FrameReader, Outbound, LOG_PREFIX};
use crate::runtime::{ImageLister, MainQueue};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Per-connection state. Dropped when the connection ends.
#[derive(Debug)]
pub struct Session {
    pub arch: TargetArch,
    pub staging_dir: PathBuf,
    pub executable_path: PathBuf,
    pub plugin_mode: bool,
    pub catalog: ModuleCatalog,
    pub project_path: Option<String>,
    pub ide_proc_path: Option<String>,
    pub settings: CoordinatorSettings,
    /// Coordinator asked for per-injection feedback.
    pub trace_injection: bool,
    context: Arc<ProcessContext>,
}

impl Session {
    pub fn new(config: &ClientConfig, negotiated: Negotiated, context: Arc<ProcessContext>) -> Self {
        Self {
            arch: config.arch.clone(),
            staging_dir: negotiated.staging_dir,
            executable_path: config.executable_path.clone(),
            plugin_mode: negotiated.plugin_mode,
            catalog: negotiated.catalog,
            project_path: None,
            ide_proc_path: None,
            settings: CoordinatorSettings::default(),
            trace_injection: false,
            context,
        }
    }

    pub fn context(&self) -> &Arc<ProcessContext> {
        &self.context
    }

    /// Load attempts made so far in this process.
    pub fn patch_counter(&self) -> u64 {
        self.context.patch_counter()
    }
}

/// What the host process lends to each session.
#[derive(Clone)]
pub struct SessionHost {
    pub context: Arc<ProcessContext>,
    pub queue: MainQueue,
    pub tracer: Arc<dyn MethodTracer>,
    pub images: Arc<dyn ImageLister>,
}

/// Run one session over an already-connected stream pair.
pub fn run_session<R, W>(
    reader: R,
    writer: W,
    config: &ClientConfig,
    host: &SessionHost,
) -> Result<SessionEnd, ProtocolError>
where
    R: Read,
    W: Write + Send + 'static,
{
    let outbound = Outbound::new(writer);
    let mut reader = FrameReader::new(reader);

    let negotiated = negotiate(&mut reader, &outbound, config, host.images.as_ref())?;
    let session = Session::new(config, negotiated, host.context.clone());
    info!(
        staging_dir = %session.staging_dir.display(),
        plugin_mode = session.plugin_mode,
        arch = session.arch.as_str(),
        "{LOG_PREFIX}Session established"
    );

    let (gate, relay) = signing_channel(outbound.clone());
    let gate = session.arch.requires_signing().then_some(gate);
    let pipeline = PatchPipeline::new(
        PatchStager::for_session(&session.staging_dir),
        gate,
        host.queue.clone(),
        outbound.clone(),
        host.context.clone(),
    );
    let (jobs, worker) = pipeline.spawn()?;

    let mut dispatcher = CommandDispatcher::new(
        session,
        reader,
        outbound,
        relay,
        jobs,
        host.queue.clone(),
        host.tracer.clone(),
        host.images.clone(),
    );
    let end = dispatcher.run();
    // Closes the job queue and rejects any approval still pending; work
    // already handed to the serialized context runs to completion.
    drop(dispatcher);
    if worker.join().is_err() {
        warn!("Patch pipeline panicked");
    }
    info!(end = ?end, "{LOG_PREFIX}Session ended");
    Ok(end)
}

/// Connect to the coordinator and run a session on the calling thread.
pub fn connect(config: &ClientConfig, host: &SessionHost) -> Result<SessionEnd, ProtocolError> {
    info!(addr = %config.coordinator_addr, "Connecting to coordinator");
    let stream = TcpStream::connect(config.coordinator_addr)?;
    stream.set_nodelay(true)?;
    let writer = stream.try_clone()?;
    run_session(stream, writer, config, host)
}
