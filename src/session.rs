//! Cryptographic Session State
//!
//! `ConnectionSession` is the handle the handshake engine binds into a
//! peer once key agreement produces transport keys. The registry core
//! treats it as opaque apart from the fields driven by handshake
//! completion: the queue lock serializing completion against the send
//! path, the outbound message counter, the ready flag, and the transient
//! certificate-validation state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Transient certificate-validation material held only while a handshake
/// is in progress. Dropped when the session becomes ready.
#[derive(Clone, Debug)]
pub struct CertState {
    /// Raw certificate presented by the far side during the handshake.
    pub raw_cert: Vec<u8>,
}

impl CertState {
    /// Wrap raw certificate bytes.
    pub fn new(raw_cert: Vec<u8>) -> Self {
        Self { raw_cert }
    }
}

/// One accepted cryptographic session with a remote peer.
///
/// The message counter and ready flag are atomics so the send path can
/// advance the counter without taking the queue lock; the queue lock
/// exists solely to order handshake completion (flag flip plus deferred
/// flush) against admission of new packets to the session.
#[derive(Debug, Default)]
pub struct ConnectionSession {
    queue_lock: Mutex<()>,
    message_counter: AtomicU64,
    ready: AtomicBool,
    cert_state: Mutex<Option<CertState>>,
}

impl ConnectionSession {
    /// Create a fresh session: counter at zero, not ready.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the session has been released for data traffic.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Current outbound message counter.
    pub fn message_counter(&self) -> u64 {
        self.message_counter.load(Ordering::SeqCst)
    }

    /// Advance the outbound message counter, returning the new value.
    ///
    /// Called by the send path for every emitted frame, including flush
    /// callbacks running under the queue lock.
    pub fn next_message_counter(&self) -> u64 {
        self.message_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Attach certificate-validation state for the handshake in progress.
    pub fn set_cert_state(&self, state: CertState) {
        *self.lock_cert_state() = Some(state);
    }

    /// Whether transient certificate state is still attached.
    pub fn has_cert_state(&self) -> bool {
        self.lock_cert_state().is_some()
    }

    /// Drop the transient certificate state.
    pub(crate) fn clear_cert_state(&self) {
        *self.lock_cert_state() = None;
    }

    /// Take the queue lock. Held across handshake completion; flush
    /// callbacks must not attempt to re-acquire it.
    pub(crate) fn lock_queue(&self) -> MutexGuard<'_, ()> {
        self.queue_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clamp the outbound counter to a floor consumed by the handshake,
    /// so data frames never reuse handshake counter values.
    pub(crate) fn clamp_message_counter(&self, floor: u64) {
        self.message_counter.store(floor, Ordering::SeqCst);
    }

    /// Release the session for data traffic.
    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    fn lock_cert_state(&self) -> MutexGuard<'_, Option<CertState>> {
        self.cert_state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
