//! Single-slot cache of the most recently received frame.
//!
//! Written by every client handler after a full frame is read, before any
//! validation, and read by the admin console. It has its own lock so that
//! handlers of unrelated clients do not contend on the registry for it.

use crate::frame::Frame;
use chrono::{DateTime, Local};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A cached frame and where it came from.
#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub frame: Frame,
    pub from: SocketAddr,
    pub received_at: DateTime<Local>,
}

/// The last-message slot. Empty until the first frame arrives.
#[derive(Default)]
pub struct LastMessageCache {
    slot: Mutex<Option<CachedMessage>>,
}

impl LastMessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<CachedMessage>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overwrite the slot with `frame`.
    pub fn store(&self, frame: &Frame, from: SocketAddr) {
        let entry = CachedMessage {
            frame: frame.clone(),
            from,
            received_at: Local::now(),
        };
        *self.lock() = Some(entry);
    }

    /// Copy of the cached message, if any frame has ever been stored.
    pub fn latest(&self) -> Option<CachedMessage> {
        self.lock().clone()
    }
}
