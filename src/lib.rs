//! Live code-patch client
//!
//! This library lets a running process adopt freshly compiled code pushed by
//! a build coordinator, without restarting. It speaks the coordinator's
//! length-prefixed opcode protocol, stages each incoming module to disk, asks
//! the coordinator to approve it where the platform requires signed code,
//! loads it into the address space and re-runs the allow-listed one-time
//! initializers tied to the replaced code.
//!
//! # Architecture
//!
//! Shared runtime state may only be mutated from one place. The layout is:
//!
//! - **Main thread**: runs the serialized execution context
//!   ([`runtime::run_main_loop`]). Module loading, symbol replacement,
//!   reinitialization, markup reloads and object inspection happen here.
//!
//! - **Session thread**: runs the [`session::CommandDispatcher`] read loop
//!   with fully blocking reads. Tracer calls and signing verdicts are handled
//!   directly on this thread.
//!
//! - **Patch pipeline thread**: one per session. Stages modules, waits for
//!   signing approval and hands activation to the main thread through
//!   [`runtime::MainQueue`], then writes the single completion each request
//!   is owed. Requests are processed strictly in arrival order.
//!
//! - **[`ProcessContext`]**: process-wide allow-list of reinitializers and
//!   the patch counter. Lives for the life of the process.
//!
//! # Failure model
//!
//! Protocol errors end the session, never the process. Staging, approval,
//! load and activation failures are reported to the coordinator as one
//! `Error` completion and leave the previous code running.

pub mod collaborators;
pub mod config;
pub mod context;
pub mod error;
pub mod patch;
pub mod protocol;
pub mod runtime;
pub mod session;

pub use collaborators::{
    CoordinatorSettings, MarkupReloader, MethodTracer, ObjectInspector, RecordingTracer,
};
pub use config::{ClientConfig, TargetArch};
pub use context::ProcessContext;
pub use error::{PatchError, ProtocolError};
pub use patch::{PatchActivator, ReinitializationRegistry};
pub use protocol::{Command, Opcode, Response};
pub use runtime::{main_queue, run_main_loop, LiveImages, MainContext, MainQueue};
pub use session::{connect, run_session, SessionEnd, SessionHost};
