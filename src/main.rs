//! Live code-patch client host
//!
//! Connects to a build coordinator and applies the modules it sends to this
//! process.
//!
//! Architecture:
//! - Main thread: runs the serialized execution context
//! - Background thread: runs the coordinator session

use clap::{Args, Parser, Subcommand};
use hotpatch::runtime::ImageLister;
use hotpatch::session::{ModuleCatalog, ModuleOrigin};
use hotpatch::{
    connect, main_queue, run_main_loop, ClientConfig, LiveImages, MainContext, PatchActivator,
    ProcessContext, RecordingTracer, SessionHost, TargetArch,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "hotpatch",
    version,
    about = "Live code-patch client",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    /// Used when no subcommand is given
    #[command(flatten)]
    connect: ConnectArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the coordinator and apply patches (default)
    Connect(ConnectArgs),
    /// Print the modules loaded in this process, classified by origin
    Images(ImagesArgs),
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Coordinator address [default: 127.0.0.1:8898]
    #[arg(long, env = "HOTPATCH_ADDR")]
    addr: Option<SocketAddr>,
    /// Architecture reported to the coordinator (defaults to this process's)
    #[arg(long, env = "HOTPATCH_ARCH")]
    arch: Option<String>,
    /// File holding the code-signing identity
    #[arg(long, env = "HOTPATCH_SIGN_FILE")]
    sign_file: Option<PathBuf>,
    /// Staging directory hint sent during the handshake
    #[arg(long, env = "HOTPATCH_STAGING_DIR")]
    staging_dir: Option<PathBuf>,
    /// Path prefix of application-owned modules
    #[arg(long)]
    app_prefix: Option<PathBuf>,
    /// One-time initializer allowed to re-run after a load (repeatable)
    #[arg(long = "reinitializer", value_name = "SYMBOL")]
    reinitializers: Vec<String>,
    /// Seconds before unregistered initializers are reported [default: 10]
    #[arg(long)]
    lint_delay_secs: Option<u64>,
}

#[derive(Args)]
struct ImagesArgs {
    /// Path prefix of application-owned modules
    #[arg(long)]
    app_prefix: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout is left to the host application.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hotpatch=info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Connect(args)) => run_connect(args),
        Some(Command::Images(args)) => run_images(args),
        None => run_connect(cli.connect),
    }
}

impl ConnectArgs {
    fn into_config(self) -> ClientConfig {
        let mut config = ClientConfig::default();
        if let Some(addr) = self.addr {
            config = config.with_coordinator_addr(addr);
        }
        if let Some(secs) = self.lint_delay_secs {
            config = config.with_lint_delay(Duration::from_secs(secs));
        }
        if let Some(arch) = self.arch {
            config = config.with_arch(TargetArch::parse(&arch));
        }
        if let Some(sign_file) = self.sign_file {
            config = config.with_sign_file(sign_file);
        }
        if let Some(dir) = self.staging_dir {
            config = config.with_staging_hint(dir);
        }
        if let Some(prefix) = self.app_prefix {
            config = config.with_app_modules_prefix(prefix);
        }
        config
    }
}

fn run_connect(args: ConnectArgs) -> anyhow::Result<()> {
    let reinitializers = args.reinitializers.clone();
    let config = args.into_config();
    let app_prefix = config.app_modules_prefix.clone();
    info!(addr = %config.coordinator_addr, arch = config.arch.as_str(), "Starting patch client");

    let context = ProcessContext::new(config.lint_delay);
    for symbol in &reinitializers {
        context.register_reinitializer(symbol);
    }

    let (queue, rx) = main_queue(config.request_queue_capacity);
    context.attach_executor(queue.clone());

    let tracer = Arc::new(RecordingTracer::new());
    let host = SessionHost {
        context: context.clone(),
        queue: queue.clone(),
        tracer: tracer.clone(),
        images: Arc::new(LiveImages),
    };

    let session_handle = thread::Builder::new()
        .name("hotpatch-session".to_string())
        .spawn(move || {
            let result = connect(&config, &host);
            match &result {
                Ok(end) => info!(end = ?end, "Session finished"),
                Err(e) => error!(error = %e, "Session failed"),
            }
            host.queue.shutdown();
            result
        })?;

    info!("Starting serialized execution context");
    let mut ctx = MainContext::new(PatchActivator::with_defaults(context.clone()), tracer)
        .with_images(Arc::new(LiveImages), Some(app_prefix));
    run_main_loop(rx, &mut ctx);

    match session_handle.join() {
        Ok(result) => {
            result?;
        }
        Err(e) => error!("Session thread panicked: {:?}", e),
    }
    info!(patches = context.patch_counter(), "Patch client stopped");
    Ok(())
}

fn run_images(args: ImagesArgs) -> anyhow::Result<()> {
    let config = ClientConfig::default();
    let prefix = args.app_prefix.unwrap_or(config.app_modules_prefix);
    let catalog = ModuleCatalog::from_images(&prefix, &LiveImages.loaded_images());
    for entry in catalog.entries() {
        let origin = match entry.origin {
            ModuleOrigin::Application => "app",
            ModuleOrigin::System => "system",
        };
        println!("{origin}\t{}\t{}", entry.name, entry.path.display());
    }
    info!(modules = catalog.len(), prefix = %prefix.display(), "Listed loaded modules");
    Ok(())
}
