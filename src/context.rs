//! Process-wide state shared by every session.
//!
//! Created once at process start and kept for the process lifetime. Holds the
//! reinitializer allow-list, the patch counter and the handle of the
//! serialized execution context the one-shot lint is delivered to.

use crate::patch::ReinitializationRegistry;
use crate::runtime::{MainQueue, MainRequest};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct ProcessContext {
    registry: ReinitializationRegistry,
    patch_counter: AtomicU64,
    lint_delay: Duration,
    lint_scheduled: AtomicBool,
    executor: OnceLock<MainQueue>,
}

impl ProcessContext {
    pub fn new(lint_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry: ReinitializationRegistry::new(),
            patch_counter: AtomicU64::new(0),
            lint_delay,
            lint_scheduled: AtomicBool::new(false),
            executor: OnceLock::new(),
        })
    }

    pub fn registry(&self) -> &ReinitializationRegistry {
        &self.registry
    }

    /// Allow `symbol` to be re-run after loads. The first registration in the
    /// process schedules the unregistered-initializer lint.
    pub fn register_reinitializer(self: &Arc<Self>, symbol: &str) -> bool {
        let added = self.registry.register(symbol);
        if added {
            debug!(symbol = %symbol, "Registered reinitializer");
        }
        if !self.lint_scheduled.swap(true, Ordering::SeqCst) {
            self.schedule_lint();
        }
        added
    }

    /// Number of load attempts so far.
    pub fn patch_counter(&self) -> u64 {
        self.patch_counter.load(Ordering::SeqCst)
    }

    /// Generation the next attempt will carry.
    pub fn next_generation(&self) -> u64 {
        self.patch_counter() + 1
    }

    /// Record one load attempt and return the new counter value.
    pub(crate) fn advance_patch_counter(&self) -> u64 {
        self.patch_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Hand the context the queue of the serialized execution context.
    /// Returns false if one was already attached.
    pub fn attach_executor(&self, queue: MainQueue) -> bool {
        self.executor.set(queue).is_ok()
    }

    pub fn executor(&self) -> Option<&MainQueue> {
        self.executor.get()
    }

    fn schedule_lint(self: &Arc<Self>) {
        let context = Arc::clone(self);
        let delay = self.lint_delay;
        let spawned = thread::Builder::new()
            .name("hotpatch-lint".to_string())
            .spawn(move || {
                thread::sleep(delay);
                match context.executor() {
                    Some(queue) => {
                        if let Err(e) = queue.try_submit(MainRequest::LintReinitializers) {
                            debug!(error = %e, "Skipping reinitializer lint");
                        }
                    }
                    None => debug!("No serialized context attached, skipping reinitializer lint"),
                }
            });
        match spawned {
            Ok(_) => info!(delay_ms = delay.as_millis() as u64, "Scheduled reinitializer lint"),
            Err(e) => warn!(error = %e, "Failed to spawn reinitializer lint thread"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::main_queue;

    #[test]
    fn counter_starts_at_zero_and_advances() {
        let context = ProcessContext::new(Duration::from_secs(60));
        assert_eq!(context.patch_counter(), 0);
        assert_eq!(context.next_generation(), 1);
        assert_eq!(context.advance_patch_counter(), 1);
        assert_eq!(context.advance_patch_counter(), 2);
        assert_eq!(context.next_generation(), 3);
    }

    #[test]
    fn first_registration_delivers_lint_once() {
        let context = ProcessContext::new(Duration::from_millis(10));
        let (queue, rx) = main_queue(4);
        assert!(context.attach_executor(queue.clone()));
        assert!(!context.attach_executor(queue));

        assert!(context.register_reinitializer("$s4App10appReducer_WZ"));
        assert!(!context.register_reinitializer("$s4App10appReducer_WZ"));
        assert!(context.register_reinitializer("$s4App11rootReducer_WZ"));

        let request = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("lint request");
        assert!(matches!(request, MainRequest::LintReinitializers));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(context.registry().len(), 2);
    }
}
