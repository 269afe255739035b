//! The serialized execution context's work loop.

use super::images::{ImageLister, LiveImages};
use super::request::MainRequest;
use crate::collaborators::{
    LoggingInspector, MarkupReloader, MethodTracer, ObjectInspector, UnsupportedMarkup,
};
use crate::patch::PatchActivator;
use crate::protocol::LOG_PREFIX;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use tracing::{debug, info, warn};

/// Log result with debug on success and warn on error.
macro_rules! log_result {
    ($result:expr, $ok_msg:literal, $err_msg:literal) => {
        match &$result {
            Ok(_) => debug!($ok_msg),
            Err(e) => warn!(error = %e, $err_msg),
        }
    };
}

/// Everything that may only be touched from the serialized context.
pub struct MainContext {
    pub activator: PatchActivator,
    pub markup: Box<dyn MarkupReloader>,
    pub inspector: Box<dyn ObjectInspector>,
    pub tracer: Arc<dyn MethodTracer>,
    /// Host images the reinitializer lint scans.
    pub images: Arc<dyn ImageLister>,
    /// When set, only images under this prefix are linted.
    pub lint_prefix: Option<PathBuf>,
}

impl MainContext {
    pub fn new(activator: PatchActivator, tracer: Arc<dyn MethodTracer>) -> Self {
        Self {
            activator,
            markup: Box::new(UnsupportedMarkup),
            inspector: Box::new(LoggingInspector),
            tracer,
            images: Arc::new(LiveImages),
            lint_prefix: None,
        }
    }

    /// Lint the images of `images`, limited to those under `prefix` if given.
    pub fn with_images(mut self, images: Arc<dyn ImageLister>, prefix: Option<PathBuf>) -> Self {
        self.images = images;
        self.lint_prefix = prefix;
        self
    }

    fn lint_images(&self) -> Vec<PathBuf> {
        let mut images = self.images.loaded_images();
        if let Some(prefix) = &self.lint_prefix {
            images.retain(|image| image.starts_with(prefix));
        }
        images
    }

    pub fn with_markup(mut self, markup: Box<dyn MarkupReloader>) -> Self {
        self.markup = markup;
        self
    }

    pub fn with_inspector(mut self, inspector: Box<dyn ObjectInspector>) -> Self {
        self.inspector = inspector;
        self
    }
}

/// Run the loop on the current thread until `Shutdown` arrives or every
/// queue handle is gone.
pub fn run_main_loop(rx: mpsc::Receiver<MainRequest>, ctx: &mut MainContext) {
    info!("Serialized execution context started");
    while let Ok(req) = rx.recv() {
        if !handle_request(ctx, req) {
            break;
        }
    }
    info!("Serialized execution context stopped");
}

/// Process whatever is queued without blocking, for hosts that run their own
/// loop and pump this from it. Returns false once the loop should stop.
pub fn drain_main_queue(rx: &mpsc::Receiver<MainRequest>, ctx: &mut MainContext) -> bool {
    loop {
        match rx.try_recv() {
            Ok(req) => {
                if !handle_request(ctx, req) {
                    return false;
                }
            }
            Err(mpsc::TryRecvError::Empty) => return true,
            Err(mpsc::TryRecvError::Disconnected) => return false,
        }
    }
}

fn handle_request(ctx: &mut MainContext, req: MainRequest) -> bool {
    match req {
        MainRequest::Activate {
            mut attempt,
            staged,
            resp,
        } => {
            debug!(generation = staged.generation, path = %staged.module_path.display(), "Activating patch");
            let result = ctx.activator.activate(&mut attempt, &staged);
            log_result!(result, "Activation finished", "Activation failed");
            let _ = resp.send(result);
        }
        MainRequest::Reinject {
            class_or_file,
            resp,
        } => {
            debug!(name = %class_or_file, "Re-injecting");
            let result = ctx.activator.reinject(&class_or_file);
            log_result!(result, "Re-injected", "Re-inject failed");
            let _ = resp.send(result);
        }
        MainRequest::ReloadMarkup { changed, resp } => {
            debug!(path = %changed.display(), "Reloading markup");
            let result = ctx.markup.reload(&changed);
            log_result!(result, "Markup reloaded", "Markup reload failed");
            let _ = resp.send(result);
        }
        MainRequest::Xprobe { target, resp } => {
            let result = ctx.inspector.xprobe(&target);
            log_result!(result, "Inspector connected", "Inspector connect failed");
            let _ = resp.send(result);
        }
        MainRequest::Eval {
            path_id,
            code,
            resp,
        } => {
            debug!(path_id, "Evaluating in object context");
            let result = ctx.inspector.eval(path_id, &code);
            log_result!(result, "Eval finished", "Eval failed");
            let _ = resp.send(result);
        }
        MainRequest::TraceUiToolkit => {
            info!("{LOG_PREFIX}Adding trace to the UI toolkit, this will take a while...");
            ctx.tracer.trace_ui_toolkit();
            info!("{LOG_PREFIX}Completed adding trace.");
        }
        MainRequest::LintReinitializers => {
            let images = ctx.lint_images();
            debug!(images = images.len(), "Linting reinitializers");
            let unregistered = ctx.activator.lint_unregistered(&images);
            if unregistered.is_empty() {
                debug!("Every lint-marked initializer is registered");
            }
            for symbol in unregistered {
                warn!(
                    symbol = %symbol,
                    "{LOG_PREFIX}Initializer is not registered for re-running after injection"
                );
            }
        }
        MainRequest::Shutdown => {
            info!("Serialized execution context shutting down");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::RecordingTracer;
    use crate::context::ProcessContext;
    use crate::error::PatchError;
    use crate::runtime::main_queue;
    use std::path::PathBuf;
    use std::time::Duration;

    fn context() -> MainContext {
        let process = ProcessContext::new(Duration::from_secs(3600));
        MainContext::new(
            PatchActivator::with_defaults(process),
            Arc::new(RecordingTracer::new()),
        )
    }

    #[test]
    fn requests_are_answered_in_order_until_shutdown() {
        let (queue, rx) = main_queue(8);
        let worker = std::thread::spawn(move || {
            let mut ctx = context();
            run_main_loop(rx, &mut ctx);
        });

        let markup = queue.reload_markup(PathBuf::from("Main.storyboard"));
        assert!(matches!(markup, Err(PatchError::Activation(_))));
        assert_eq!(queue.eval(3, "print(self)".into()), Ok(()));
        assert!(matches!(
            queue.reinject("ContentView".into()),
            Err(PatchError::Unsupported(_))
        ));

        queue.shutdown();
        worker.join().expect("loop thread");
        assert_eq!(queue.xprobe("x".into()), Err(PatchError::WorkerClosed));
    }

    #[test]
    fn drain_processes_queued_work_without_blocking() {
        let (queue, rx) = main_queue(8);
        let tracer = Arc::new(RecordingTracer::new());
        let mut ctx = context();
        ctx.tracer = tracer.clone() as Arc<dyn MethodTracer>;

        assert!(drain_main_queue(&rx, &mut ctx));
        queue.trace_ui_toolkit().expect("queued");
        assert!(drain_main_queue(&rx, &mut ctx));
        assert_eq!(tracer.state().traced, vec!["UI toolkit"]);

        queue.shutdown();
        assert!(!drain_main_queue(&rx, &mut ctx));
    }

    struct FixedImages;

    impl ImageLister for FixedImages {
        fn loaded_images(&self) -> Vec<PathBuf> {
            vec![
                PathBuf::from("/App.app/Frameworks/Kit.framework/Kit"),
                PathBuf::from("/usr/lib/libc.so.6"),
            ]
        }
    }

    #[test]
    fn lint_reads_host_images_under_the_app_prefix() {
        let (queue, rx) = main_queue(4);
        let mut ctx =
            context().with_images(Arc::new(FixedImages), Some(PathBuf::from("/App.app")));
        assert_eq!(
            ctx.lint_images(),
            vec![PathBuf::from("/App.app/Frameworks/Kit.framework/Kit")]
        );

        queue.submit(MainRequest::LintReinitializers).expect("queued");
        assert!(drain_main_queue(&rx, &mut ctx));

        let ctx = ctx.with_images(Arc::new(FixedImages), None);
        assert_eq!(ctx.lint_images().len(), 2);
    }
}
