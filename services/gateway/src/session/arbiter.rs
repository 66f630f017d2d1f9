//! Reconnection arbiter.
//!
//! Several detectors watch each session — the link's own disconnect signal,
//! the status poll, the freeze probe, the idle sweep — and any of them may
//! decide recovery is needed, sometimes within the same millisecond. Wiring
//! each detector straight to a reconnect call would start overlapping
//! recovery sequences; instead every request goes through a compare-and-set
//! guard on the session's reconnecting flag. Exactly one caller wins and
//! enqueues the recovery event; the flag stays set until the state machine
//! has driven the session all the way back to ready (not merely to
//! connecting), so a late detector cannot slip in mid-recovery.

use super::events::{ReconnectCause, SessionEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct ReconnectArbiter {
    reconnecting: Arc<AtomicBool>,
    events: mpsc::Sender<SessionEvent>,
}

impl ReconnectArbiter {
    pub fn new(reconnecting: Arc<AtomicBool>, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            reconnecting,
            events,
        }
    }

    /// Requests a recovery sequence. Returns `true` if this caller won the
    /// guard and the sequence was enqueued; `false` means recovery is already
    /// in flight and the request was a no-op.
    pub fn request_reconnect(&self, cause: ReconnectCause) -> bool {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(?cause, "Reconnect already in flight; request ignored.");
            return false;
        }
        info!(?cause, "Reconnect requested.");
        if self.events.try_send(SessionEvent::Reconnect(cause)).is_err() {
            // Session task is gone; nothing will ever clear the flag, so
            // release it here.
            self.reconnecting.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Whether a recovery sequence is currently in flight.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }
}
