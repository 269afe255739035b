//! Handle for submitting work to the serialized execution context.

use super::request::MainRequest;
use crate::error::PatchError;
use crate::patch::{ActivationReport, PatchAttempt, StagedPatch};
use std::path::PathBuf;
use std::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;

/// Create a bounded queue feeding `run_main_loop`.
pub fn main_queue(capacity: usize) -> (MainQueue, mpsc::Receiver<MainRequest>) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    (MainQueue::new(tx), rx)
}

#[derive(Clone, Debug)]
pub struct MainQueue {
    tx: mpsc::SyncSender<MainRequest>,
}

impl MainQueue {
    pub fn new(tx: mpsc::SyncSender<MainRequest>) -> Self {
        Self { tx }
    }

    /// Enqueue, waiting for room.
    pub fn submit(&self, req: MainRequest) -> Result<(), PatchError> {
        self.tx.send(req)?;
        Ok(())
    }

    /// Enqueue without waiting.
    pub fn try_submit(&self, req: MainRequest) -> Result<(), PatchError> {
        match self.tx.try_send(req) {
            Ok(()) => Ok(()),
            Err(mpsc::TrySendError::Full(_)) => Err(PatchError::Busy),
            Err(mpsc::TrySendError::Disconnected(_)) => Err(PatchError::WorkerClosed),
        }
    }

    /// Submit and block the calling thread until the context replies.
    fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, PatchError>>) -> MainRequest,
    ) -> Result<T, PatchError> {
        let (tx, rx) = oneshot::channel();
        self.submit(build(tx))?;
        rx.blocking_recv()?
    }

    pub fn activate(
        &self,
        attempt: PatchAttempt,
        staged: StagedPatch,
    ) -> Result<ActivationReport, PatchError> {
        self.call(|resp| MainRequest::Activate {
            attempt,
            staged,
            resp,
        })
    }

    pub fn reinject(&self, class_or_file: String) -> Result<(), PatchError> {
        self.call(|resp| MainRequest::Reinject {
            class_or_file,
            resp,
        })
    }

    pub fn reload_markup(&self, changed: PathBuf) -> Result<(), PatchError> {
        self.call(|resp| MainRequest::ReloadMarkup { changed, resp })
    }

    pub fn xprobe(&self, target: String) -> Result<(), PatchError> {
        self.call(|resp| MainRequest::Xprobe { target, resp })
    }

    pub fn eval(&self, path_id: i64, code: String) -> Result<(), PatchError> {
        self.call(|resp| MainRequest::Eval {
            path_id,
            code,
            resp,
        })
    }

    /// Fire-and-forget: no acknowledgement is owed for UI toolkit tracing.
    pub fn trace_ui_toolkit(&self) -> Result<(), PatchError> {
        self.try_submit(MainRequest::TraceUiToolkit)
    }

    /// Ask the loop to exit after the work already queued.
    pub fn shutdown(&self) {
        if self.submit(MainRequest::Shutdown).is_err() {
            debug!("Serialized context already stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_is_busy_and_closed_queue_is_closed() {
        let (queue, rx) = main_queue(1);
        queue.try_submit(MainRequest::TraceUiToolkit).expect("first fits");
        assert_eq!(
            queue.try_submit(MainRequest::TraceUiToolkit),
            Err(PatchError::Busy)
        );
        drop(rx);
        assert_eq!(
            queue.try_submit(MainRequest::LintReinitializers),
            Err(PatchError::WorkerClosed)
        );
    }

    #[test]
    fn dropped_request_reports_worker_closed() {
        let (queue, rx) = main_queue(1);
        let consumer = std::thread::spawn(move || {
            // Drop every request without replying.
            while let Ok(req) = rx.recv() {
                drop(req);
            }
        });
        assert_eq!(queue.xprobe("0".into()), Err(PatchError::WorkerClosed));
        drop(queue);
        consumer.join().expect("consumer");
    }
}
