//! Coordinator approval round trip for modules about to be loaded.
//!
//! The gate writes a `Sign` request and blocks its caller on a oneshot; the
//! verdict arrives later as a `Signed` opcode on the same connection and the
//! dispatcher resolves it through the relay. The caller is the patch pipeline
//! thread, so the read loop keeps reading while approval is pending.

use crate::protocol::{Outbound, Response};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type PendingSlot = Arc<Mutex<Option<oneshot::Sender<bool>>>>;

fn lock_slot(slot: &PendingSlot) -> MutexGuard<'_, Option<oneshot::Sender<bool>>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Requesting side, owned by the patch pipeline.
pub struct SigningGate {
    pending: PendingSlot,
    outbound: Outbound,
}

/// Resolving side, owned by the command dispatcher.
pub struct SigningRelay {
    pending: PendingSlot,
}

/// Create a connected gate/relay pair writing requests to `outbound`.
pub fn signing_channel(outbound: Outbound) -> (SigningGate, SigningRelay) {
    let pending: PendingSlot = Arc::new(Mutex::new(None));
    (
        SigningGate {
            pending: pending.clone(),
            outbound,
        },
        SigningRelay { pending },
    )
}

impl SigningGate {
    /// Ask the coordinator to approve `module_id`. Blocks the calling thread
    /// until the verdict arrives; a closed session counts as rejection.
    pub fn request_approval(&self, module_id: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        if lock_slot(&self.pending).replace(tx).is_some() {
            warn!("Superseding an unanswered signing request");
        }
        if let Err(e) = self.outbound.send(Response::Sign, Some(module_id)) {
            warn!(error = %e, module = %module_id, "Failed to send signing request");
            lock_slot(&self.pending).take();
            return false;
        }
        debug!(module = %module_id, "Awaiting signing verdict");
        rx.blocking_recv().unwrap_or(false)
    }
}

impl SigningRelay {
    /// Deliver a verdict. Returns false when nobody is waiting.
    pub fn relay(&self, approved: bool) -> bool {
        match lock_slot(&self.pending).take() {
            Some(tx) => tx.send(approved).is_ok(),
            None => {
                warn!(approved, "Signing verdict received with no pending request");
                false
            }
        }
    }

    /// Reject whatever is pending.
    pub fn abandon(&self) {
        lock_slot(&self.pending).take();
    }
}

impl Drop for SigningRelay {
    fn drop(&mut self) {
        self.abandon();
    }
}
