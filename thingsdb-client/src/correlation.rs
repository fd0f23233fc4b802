//! Request ID assignment and frame routing.
//!
//! Every decoded frame ends up in exactly one place: returned to the reader
//! awaiting it, handed to another pending request, shelved for `listen()`, or
//! dropped because the request it answers has already been abandoned.

use crate::buffer::NotificationBuffer;
use std::collections::{HashMap, HashSet};
use thingsdb_protocol::{Frame, ResponseType, MAX_REQUEST_ID};

/// Where a frame went after routing.
#[derive(Debug)]
pub enum Routed {
    /// The frame answers the request the reader is awaiting.
    Matched(Frame),
    /// The frame answers another pending request.
    Delivered,
    /// The frame was put in the notification buffer.
    Shelved,
    /// The frame answers an abandoned request and was dropped.
    Discarded,
}

/// Shared correlation state of one connection.
#[derive(Debug)]
pub struct Correlator {
    next_id: u16,
    max_id: u16,
    pending: HashSet<u16>,
    mailbox: HashMap<u16, Frame>,
    abandoned: HashSet<u16>,
    shelf: NotificationBuffer,
}

impl Correlator {
    pub fn new() -> Self {
        Self::with_max_id(MAX_REQUEST_ID)
    }

    /// Creates a correlator whose IDs wrap after `max_id`.
    pub fn with_max_id(max_id: u16) -> Self {
        Self {
            next_id: 1,
            max_id: max_id.max(1),
            pending: HashSet::new(),
            mailbox: HashMap::new(),
            abandoned: HashSet::new(),
            shelf: NotificationBuffer::new(),
        }
    }

    /// Registers a new pending request and returns its ID.
    ///
    /// IDs run `1..=max_id` and wrap to 1; 0 is never issued. IDs still
    /// pending are skipped.
    pub fn begin(&mut self) -> u16 {
        let mut id = self.advance();
        for _ in 0..self.max_id {
            if !self.pending.contains(&id) {
                break;
            }
            id = self.advance();
        }
        self.abandoned.remove(&id);
        self.mailbox.remove(&id);
        // Anything shelved under this ID predates the request.
        if self.shelf.pop_by_id(id).is_some() {
            tracing::warn!("dropping stale shelved response id={} on reuse", id);
        }
        self.pending.insert(id);
        id
    }

    fn advance(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = if id >= self.max_id { 1 } else { id + 1 };
        id
    }

    /// Takes a frame already routed to `id`, if any.
    pub fn take(&mut self, id: u16) -> Option<Frame> {
        self.mailbox
            .remove(&id)
            .or_else(|| self.shelf.pop_by_id(id))
    }

    /// Routes a freshly read frame. `awaiting` is the ID the reader waits for.
    pub fn route(&mut self, frame: Frame, kind: ResponseType, awaiting: Option<u16>) -> Routed {
        if kind.is_push() {
            tracing::debug!("shelving {} frame id={}", kind, frame.id);
            self.shelf.push(kind, frame);
            return Routed::Shelved;
        }

        if awaiting == Some(frame.id) {
            return Routed::Matched(frame);
        }

        if self.pending.contains(&frame.id) {
            tracing::debug!("delivering {} id={} to its waiter", kind, frame.id);
            self.mailbox.insert(frame.id, frame);
            return Routed::Delivered;
        }

        if self.abandoned.remove(&frame.id) {
            tracing::warn!(
                "discarding late {} for abandoned request id={}",
                kind,
                frame.id
            );
            return Routed::Discarded;
        }

        tracing::debug!("shelving unmatched {} id={}", kind, frame.id);
        self.shelf.push(kind, frame);
        Routed::Shelved
    }

    /// Marks a request as answered.
    pub fn finish(&mut self, id: u16) {
        self.pending.remove(&id);
    }

    /// Gives up on a request. A response arriving later is discarded.
    pub fn abandon(&mut self, id: u16) {
        if !self.pending.remove(&id) {
            return;
        }
        if self.mailbox.remove(&id).is_none() {
            self.abandoned.insert(id);
        }
    }

    /// Removes and returns the oldest shelved frame.
    pub fn pop_event(&mut self) -> Option<Frame> {
        self.shelf.pop_any()
    }

    pub fn is_pending(&self, id: u16) -> bool {
        self.pending.contains(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn shelved_count(&self) -> usize {
        self.shelf.len()
    }

    /// Drops all routing state. The ID counter keeps running.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.mailbox.clear();
        self.abandoned.clear();
        self.shelf.clear();
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn data(id: u16) -> Frame {
        Frame::new(id, ResponseType::Data.as_i8(), Bytes::from_static(b"\xc0"))
    }

    #[test]
    fn test_ids_start_at_one_and_wrap() {
        let mut c = Correlator::with_max_id(3);
        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = c.begin();
            c.finish(id);
            ids.push(id);
        }
        assert_eq!(ids, vec![1, 2, 3, 1]);
    }

    #[test]
    fn test_full_range_wrap() {
        let mut c = Correlator::new();
        let mut last = 0;
        for _ in 0..MAX_REQUEST_ID {
            last = c.begin();
            c.finish(last);
        }
        assert_eq!(last, MAX_REQUEST_ID);
        assert_eq!(c.begin(), 1);
    }

    #[test]
    fn test_pending_id_skipped() {
        let mut c = Correlator::with_max_id(3);
        let first = c.begin();
        let second = c.begin();
        c.finish(second);
        let third = c.begin();
        c.finish(third);
        // 1 is still outstanding
        assert_eq!(first, 1);
        assert_eq!(c.begin(), 2);
    }

    #[test]
    fn test_route_matched() {
        let mut c = Correlator::new();
        let id = c.begin();
        assert!(matches!(
            c.route(data(id), ResponseType::Data, Some(id)),
            Routed::Matched(f) if f.id == id
        ));
    }

    #[test]
    fn test_route_out_of_order() {
        let mut c = Correlator::new();
        for _ in 0..4 {
            let id = c.begin();
            c.finish(id);
        }
        let id5 = c.begin();
        assert_eq!(id5, 5);

        // frame 7 arrives first: nobody waits for it
        assert!(matches!(
            c.route(data(7), ResponseType::Data, Some(5)),
            Routed::Shelved
        ));
        assert!(matches!(
            c.route(data(5), ResponseType::Data, Some(5)),
            Routed::Matched(_)
        ));
        c.finish(5);

        assert_eq!(c.pop_event().unwrap().id, 7);
        assert!(c.pop_event().is_none());
    }

    #[test]
    fn test_route_to_other_waiter() {
        let mut c = Correlator::new();
        let a = c.begin();
        let b = c.begin();

        assert!(matches!(
            c.route(data(b), ResponseType::Data, Some(a)),
            Routed::Delivered
        ));
        assert_eq!(c.shelved_count(), 0);
        assert_eq!(c.take(b).unwrap().id, b);
        assert!(c.take(b).is_none());
    }

    #[test]
    fn test_push_always_shelved() {
        let mut c = Correlator::new();
        let id = c.begin();
        let push = Frame::new(id, ResponseType::OnJoin.as_i8(), Bytes::new());
        assert!(matches!(
            c.route(push, ResponseType::OnJoin, Some(id)),
            Routed::Shelved
        ));
        assert!(c.take(id).is_none());
        assert_eq!(c.pop_event().unwrap().frame_type, 6);
    }

    #[test]
    fn test_abandoned_response_discarded() {
        let mut c = Correlator::new();
        let id = c.begin();
        c.abandon(id);
        assert!(!c.is_pending(id));

        assert!(matches!(
            c.route(data(id), ResponseType::Data, None),
            Routed::Discarded
        ));
        assert_eq!(c.shelved_count(), 0);

        // a second frame with that id is no longer considered late
        assert!(matches!(
            c.route(data(id), ResponseType::Data, None),
            Routed::Shelved
        ));
    }

    #[test]
    fn test_abandon_after_delivery_drops_mail() {
        let mut c = Correlator::new();
        let a = c.begin();
        let b = c.begin();
        c.route(data(b), ResponseType::Data, Some(a));
        c.abandon(b);
        assert!(c.take(b).is_none());
        assert!(matches!(
            c.route(data(b), ResponseType::Data, None),
            Routed::Shelved
        ));
    }

    #[test]
    fn test_reused_id_ignores_stale_shelf() {
        let mut c = Correlator::with_max_id(2);
        let id = c.begin();
        c.route(data(2), ResponseType::Data, Some(id));
        c.finish(id);
        assert_eq!(c.shelved_count(), 1);

        let next = c.begin();
        assert_eq!(next, 2);
        assert!(c.take(next).is_none());
        assert_eq!(c.shelved_count(), 0);
    }

    #[test]
    fn test_clear() {
        let mut c = Correlator::new();
        let id = c.begin();
        c.route(data(99), ResponseType::Data, Some(id));
        assert_eq!(c.pending_count(), 1);
        assert_eq!(c.shelved_count(), 1);
        c.clear();
        assert_eq!(c.pending_count(), 0);
        assert_eq!(c.shelved_count(), 0);
    }
}
