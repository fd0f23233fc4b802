//! Notification buffer for frames nobody was waiting for.

use std::collections::VecDeque;
use thingsdb_protocol::{Frame, ResponseType};

/// Shelf size above which a warning is logged; the buffer itself is unbounded.
pub const SHELF_WARN_THRESHOLD: usize = 1024;

#[derive(Debug, Clone)]
struct Shelved {
    kind: ResponseType,
    frame: Frame,
}

/// FIFO of shelved frames.
///
/// Solicited frames are keyed by ID: pushing a second one with the same ID
/// replaces the first. Push frames share ID 0 in practice, so every one of
/// them is kept and they are never matched by ID.
#[derive(Debug, Default)]
pub struct NotificationBuffer {
    entries: VecDeque<Shelved>,
    warned: bool,
}

impl NotificationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a frame.
    pub fn push(&mut self, kind: ResponseType, frame: Frame) {
        if kind.is_solicited() {
            if let Some(pos) = self.position_of(frame.id) {
                tracing::debug!("replacing shelved response id={}", frame.id);
                self.entries.remove(pos);
            }
        }
        self.entries.push_back(Shelved { kind, frame });

        if self.entries.len() > SHELF_WARN_THRESHOLD && !self.warned {
            tracing::warn!(
                "{} undrained notifications buffered; call listen() to consume them",
                self.entries.len()
            );
            self.warned = true;
        } else if self.entries.len() <= SHELF_WARN_THRESHOLD {
            self.warned = false;
        }
    }

    /// Removes and returns the oldest frame.
    pub fn pop_any(&mut self) -> Option<Frame> {
        self.entries.pop_front().map(|s| s.frame)
    }

    /// Removes and returns the solicited frame with `id`, keeping the others in order.
    pub fn pop_by_id(&mut self, id: u16) -> Option<Frame> {
        let pos = self.position_of(id)?;
        self.entries.remove(pos).map(|s| s.frame)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.warned = false;
    }

    fn position_of(&self, id: u16) -> Option<usize> {
        self.entries
            .iter()
            .position(|s| s.kind.is_solicited() && s.frame.id == id)
    }
}
