//! Local request scheduler
//!
//! A single-priority FIFO serializing user commands and rekey-timer
//! firings. The IKE session dequeues only while `Idle`; a delayed entry
//! (scheduled retry) stays invisible until its release time. Rekey
//! requests are tagged with the SA they were scheduled for so that timers
//! belonging to a rekeyed-away record are discarded on dequeue.

use std::collections::VecDeque;

/// One queued local request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalRequestKind {
    /// Create an additional Child SA
    CreateChild {
        /// Identifier of the already-registered child session
        child_id: u32,
    },

    /// Delete the Child SA with this local SPI
    DeleteChild {
        /// Local SPI of the child
        local_spi: u32,
    },

    /// Rekey the Child SA with this local SPI
    RekeyChild {
        /// Local SPI of the child
        local_spi: u32,
        /// SPI of the record the scheduling timer belonged to
        record_spi: u32,
    },

    /// Rekey the IKE SA
    RekeyIke,

    /// Send a liveness (empty informational) exchange
    Info,

    /// Delete the IKE SA and close the session
    DeleteIke,
}

/// A request plus its earliest dispatch time.
#[derive(Debug, Clone)]
pub struct LocalRequest {
    /// What to do
    pub kind: LocalRequestKind,

    /// Clock millis before which this entry is not dispatched
    pub not_before_ms: u64,
}

/// FIFO of local requests.
#[derive(Debug, Default)]
pub struct LocalRequestQueue {
    items: VecDeque<LocalRequest>,
}

impl LocalRequestQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        LocalRequestQueue {
            items: VecDeque::new(),
        }
    }

    /// Append a request
    pub fn enqueue(&mut self, kind: LocalRequestKind) {
        self.items.push_back(LocalRequest {
            kind,
            not_before_ms: 0,
        });
    }

    /// Append a request that becomes dispatchable at `not_before_ms`
    pub fn enqueue_delayed(&mut self, kind: LocalRequestKind, not_before_ms: u64) {
        self.items.push_back(LocalRequest {
            kind,
            not_before_ms,
        });
    }

    /// Take the first request whose release time has passed.
    ///
    /// Entries ahead of it that are still delayed keep their order.
    pub fn dequeue_ready(&mut self, now_ms: u64) -> Option<LocalRequest> {
        let index = self
            .items
            .iter()
            .position(|item| item.not_before_ms <= now_ms)?;
        self.items.remove(index)
    }

    /// Earliest release time of any queued entry
    pub fn next_release_ms(&self) -> Option<u64> {
        self.items.iter().map(|item| item.not_before_ms).min()
    }

    /// Drop queued requests that target the given child
    pub fn cancel_for_child(&mut self, local_spi: u32) {
        self.items.retain(|item| {
            !matches!(
                item.kind,
                LocalRequestKind::DeleteChild { local_spi: spi }
                | LocalRequestKind::RekeyChild { local_spi: spi, .. }
                    if spi == local_spi
            )
        });
    }

    /// Drop everything (session close)
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Number of queued requests
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = LocalRequestQueue::new();
        queue.enqueue(LocalRequestKind::CreateChild { child_id: 1 });
        queue.enqueue(LocalRequestKind::RekeyIke);
        queue.enqueue(LocalRequestKind::DeleteIke);

        assert_eq!(
            queue.dequeue_ready(0).unwrap().kind,
            LocalRequestKind::CreateChild { child_id: 1 }
        );
        assert_eq!(
            queue.dequeue_ready(0).unwrap().kind,
            LocalRequestKind::RekeyIke
        );
        assert_eq!(
            queue.dequeue_ready(0).unwrap().kind,
            LocalRequestKind::DeleteIke
        );
        assert!(queue.dequeue_ready(0).is_none());
    }

    #[test]
    fn test_delayed_entry_held_back() {
        let mut queue = LocalRequestQueue::new();
        queue.enqueue_delayed(
            LocalRequestKind::RekeyChild {
                local_spi: 1,
                record_spi: 1,
            },
            1000,
        );

        assert!(queue.dequeue_ready(999).is_none());
        assert!(queue.dequeue_ready(1000).is_some());
    }

    #[test]
    fn test_delayed_head_does_not_block_later_entry() {
        let mut queue = LocalRequestQueue::new();
        queue.enqueue_delayed(LocalRequestKind::Info, 5000);
        queue.enqueue(LocalRequestKind::CreateChild { child_id: 1 });

        // The ready entry behind the delayed head is dispatched first
        assert_eq!(
            queue.dequeue_ready(0).unwrap().kind,
            LocalRequestKind::CreateChild { child_id: 1 }
        );
        assert!(queue.dequeue_ready(0).is_none());
        assert_eq!(queue.dequeue_ready(5000).unwrap().kind, LocalRequestKind::Info);
    }

    #[test]
    fn test_cancel_for_child() {
        let mut queue = LocalRequestQueue::new();
        queue.enqueue(LocalRequestKind::RekeyChild {
            local_spi: 1,
            record_spi: 1,
        });
        queue.enqueue(LocalRequestKind::DeleteChild { local_spi: 2 });
        queue.enqueue(LocalRequestKind::DeleteChild { local_spi: 1 });
        queue.enqueue(LocalRequestKind::RekeyIke);

        queue.cancel_for_child(1);
        assert_eq!(queue.len(), 2);
        assert_eq!(
            queue.dequeue_ready(0).unwrap().kind,
            LocalRequestKind::DeleteChild { local_spi: 2 }
        );
        assert_eq!(
            queue.dequeue_ready(0).unwrap().kind,
            LocalRequestKind::RekeyIke
        );
    }

    #[test]
    fn test_next_release() {
        let mut queue = LocalRequestQueue::new();
        assert_eq!(queue.next_release_ms(), None);

        queue.enqueue_delayed(LocalRequestKind::Info, 700);
        queue.enqueue_delayed(LocalRequestKind::RekeyIke, 300);
        assert_eq!(queue.next_release_ms(), Some(300));
    }

    #[test]
    fn test_clear() {
        let mut queue = LocalRequestQueue::new();
        queue.enqueue(LocalRequestKind::CreateChild { child_id: 1 });
        queue.clear();
        assert!(queue.is_empty());
    }
}
