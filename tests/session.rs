//! End-to-end sessions against a scripted coordinator over a socket pair.

#![cfg(unix)]

use hotpatch::error::{PatchError, ProtocolError};
use hotpatch::patch::{PatchActivator, StagedPatch};
use hotpatch::protocol::{
    Command, FrameReader, FrameWriter, Response, HANDSHAKE_KEY, HANDSHAKE_SALT,
};
use hotpatch::runtime::{
    main_queue, run_main_loop, ImageLister, LoadedModule, MainContext, ModuleLoader,
    ModuleSymbolScanner, ScannedSymbol, SymbolReplacer,
};
use hotpatch::{
    run_session, ClientConfig, ProcessContext, RecordingTracer, SessionEnd, SessionHost,
    TargetArch,
};
use std::io::{Cursor, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct AcceptingLoader;

impl ModuleLoader for AcceptingLoader {
    fn load(&mut self, staged: &StagedPatch) -> Result<LoadedModule, PatchError> {
        Ok(LoadedModule::new(
            &staged.module_path,
            staged.generation,
            staged.discovered_symbols.clone(),
        ))
    }
}

struct NoSymbols;

impl ModuleSymbolScanner for NoSymbols {
    fn scan(&self, _: &LoadedModule, _: &str, _: &[String]) -> Vec<ScannedSymbol> {
        Vec::new()
    }
    fn scan_images(&self, _: &[PathBuf], _: &str) -> Vec<String> {
        Vec::new()
    }
}

struct OneReplacement;

impl SymbolReplacer for OneReplacement {
    fn replace(&mut self, _: &LoadedModule) -> Result<usize, PatchError> {
        Ok(1)
    }
    fn reinject(&mut self, _: &str) -> Result<(), PatchError> {
        Ok(())
    }
}

struct Images;

impl ImageLister for Images {
    fn loaded_images(&self) -> Vec<PathBuf> {
        vec![
            PathBuf::from("/App.app/Frameworks/Kit.framework/Kit"),
            PathBuf::from("/usr/lib/libSystem.dylib"),
        ]
    }
}

/// Serialized execution context running on its own thread, as the host's
/// main thread would.
struct Runtime {
    host: SessionHost,
    main: JoinHandle<()>,
}

impl Runtime {
    fn start() -> Self {
        let context = ProcessContext::new(Duration::from_secs(3600));
        let (queue, rx) = main_queue(16);
        let activator_context = context.clone();
        let tracer = Arc::new(RecordingTracer::new());
        let loop_tracer = tracer.clone();
        let main = thread::spawn(move || {
            let activator = PatchActivator::new(
                Box::new(AcceptingLoader),
                Box::new(NoSymbols),
                Box::new(OneReplacement),
                activator_context,
            );
            let mut ctx = MainContext::new(activator, loop_tracer);
            run_main_loop(rx, &mut ctx);
        });
        Runtime {
            host: SessionHost {
                context,
                queue,
                tracer,
                images: Arc::new(Images),
            },
            main,
        }
    }

    fn stop(self) {
        self.host.queue.shutdown();
        self.main.join().expect("main loop");
    }
}

fn config(arch: TargetArch) -> ClientConfig {
    ClientConfig::default()
        .with_arch(arch)
        .with_executable_path("/App.app/App")
        .with_app_modules_prefix("/App.app")
        .with_staging_hint("/var/tmp")
        .with_sign_file("/definitely/missing/sign")
}

fn encode(commands: &[Command], load_has_sidecar: bool) -> Vec<u8> {
    let mut w = FrameWriter::new(Vec::new());
    for command in commands {
        command.write_to(&mut w, load_has_sidecar).expect("encode");
    }
    w.into_inner()
}

fn unique_source(tag: &str) -> String {
    format!("/src/{tag}_{}.swift", std::process::id())
}

/// Consume the client's handshake, returning the reported arch.
fn read_handshake<R: Read>(r: &mut FrameReader<R>, signed: bool) -> String {
    assert_eq!(r.read_int().expect("salt"), HANDSHAKE_SALT);
    assert_eq!(r.read_string().expect("key").as_deref(), Some(HANDSHAKE_KEY));
    assert_eq!(r.read_string().expect("hint").as_deref(), Some("/var/tmp"));
    let arch = r.read_string().expect("arch").expect("arch present");
    if signed {
        r.read_string().expect("sign identity");
    }
    assert_eq!(r.read_string().expect("exe").as_deref(), Some("/App.app/App"));
    arch
}

#[test]
fn plugin_session_loads_and_ends() {
    let runtime = Runtime::start();
    let (client, coordinator) = UnixStream::pair().expect("socket pair");

    let script = {
        let mut w = FrameWriter::new(Vec::new());
        w.write_string("/tmp").expect("dir");
        let mut bytes = w.into_inner();
        bytes.extend(encode(
            &[
                Command::Connected {
                    project: Some("/work/App.xcodeproj".into()),
                },
                Command::Load {
                    changed: Some(unique_source("plugin_session")),
                    module: Some(b"module bytes".to_vec()),
                    sidecar: None,
                },
                Command::End,
            ],
            false,
        ));
        bytes
    };
    let mut coordinator_writer = coordinator.try_clone().expect("clone");
    coordinator_writer.write_all(&script).expect("script");

    let reader = client.try_clone().expect("clone");
    let end = run_session(reader, client, &config(TargetArch::X86_64), &runtime.host)
        .expect("session");
    assert!(matches!(end, SessionEnd::EndOfSession));

    let mut sent = Vec::new();
    let mut coordinator = coordinator;
    coordinator.read_to_end(&mut sent).expect("client output");
    let total = sent.len() as u64;
    let mut r = FrameReader::new(Cursor::new(sent));
    assert_eq!(read_handshake(&mut r, false), "x86_64");
    // Plugin mode: no module list, straight to the load acknowledgement.
    assert_eq!(r.read_opcode().expect("completion"), Response::Complete as u32);
    assert_eq!(r.into_inner().position(), total);

    assert_eq!(runtime.host.context.patch_counter(), 1);
    runtime.stop();
}

#[test]
fn unknown_opcode_ends_session_without_touching_the_process() {
    let runtime = Runtime::start();
    let (client, coordinator) = UnixStream::pair().expect("socket pair");
    let staging = tempfile::tempdir().expect("tempdir");

    let mut w = FrameWriter::new(Vec::new());
    w.write_string(&staging.path().to_string_lossy()).expect("dir");
    w.write_opcode(999).expect("opcode");
    let mut coordinator_writer = coordinator.try_clone().expect("clone");
    coordinator_writer.write_all(&w.into_inner()).expect("script");

    let reader = client.try_clone().expect("clone");
    let end = run_session(reader, client, &config(TargetArch::X86_64), &runtime.host)
        .expect("session");
    assert!(matches!(
        end,
        SessionEnd::Protocol(ProtocolError::UnknownOpcode(999))
    ));

    let mut sent = Vec::new();
    let mut coordinator = coordinator;
    coordinator.read_to_end(&mut sent).expect("client output");
    let mut r = FrameReader::new(Cursor::new(sent));
    read_handshake(&mut r, false);
    assert_eq!(r.read_opcode().expect("list"), Response::FrameworkList as u32);
    assert_eq!(r.read_string().expect("app").as_deref(), Some("Kit"));
    assert_eq!(r.read_string().expect("sys").as_deref(), Some("libSystem.dylib"));

    assert_eq!(runtime.host.context.patch_counter(), 0);
    runtime.stop();
}

#[test]
fn signed_load_waits_for_approval() {
    let runtime = Runtime::start();
    let (client, coordinator) = UnixStream::pair().expect("socket pair");
    let staging = tempfile::tempdir().expect("tempdir");
    let staging_dir = staging.path().to_string_lossy().into_owned();
    let source = unique_source("signed_load");

    let coordinator_thread = thread::spawn(move || {
        let mut out = FrameWriter::new(coordinator.try_clone().expect("clone"));
        let mut r = FrameReader::new(coordinator);

        assert_eq!(read_handshake(&mut r, true), "arm64");
        out.write_string(&staging_dir).expect("dir");
        assert_eq!(r.read_opcode().expect("list"), Response::FrameworkList as u32);
        for _ in 0..3 {
            r.read_string().expect("list payload");
        }

        Command::Load {
            changed: Some(source),
            module: Some(b"module bytes".to_vec()),
            sidecar: Some(b"Reducer_WZ\n".to_vec()),
        }
        .write_to(&mut out, true)
        .expect("load");

        assert_eq!(r.read_opcode().expect("sign"), Response::Sign as u32);
        let module = r.read_string().expect("module id").expect("module id present");
        assert!(module.contains("signed_load"));
        Command::Signed { approved: true }
            .write_to(&mut out, true)
            .expect("verdict");

        assert_eq!(r.read_opcode().expect("completion"), Response::Complete as u32);
        Command::End.write_to(&mut out, true).expect("end");
    });

    let reader = client.try_clone().expect("clone");
    let end = run_session(reader, client, &config(TargetArch::Arm64), &runtime.host)
        .expect("session");
    assert!(matches!(end, SessionEnd::EndOfSession));
    coordinator_thread.join().expect("coordinator");

    assert_eq!(runtime.host.context.patch_counter(), 1);
    runtime.stop();
}
