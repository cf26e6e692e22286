//! Pending-exchange tracking and retransmission
//!
//! At most one locally-initiated exchange is in flight per IKE SA
//! (window size 1). The cached request bytes are resent verbatim on an
//! exponential backoff: base 500 ms doubling per attempt, capped at 8
//! attempts, after which the SA is torn down with `Timeout`.

/// Initial retransmission delay (milliseconds)
pub const RETRANSMIT_BASE_MS: u64 = 500;

/// Backoff multiplier per attempt
pub const RETRANSMIT_MULTIPLIER: u64 = 2;

/// Maximum number of transmissions (first send included)
pub const RETRANSMIT_MAX_ATTEMPTS: u32 = 8;

/// What a locally-initiated exchange was doing, used to route the
/// matching response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePurpose {
    /// IKE_SA_INIT
    IkeInit,
    /// One round of the IKE_AUTH / EAP loop
    IkeAuth,
    /// CREATE_CHILD_SA creating a new child
    CreateChild {
        /// Session identifier of the child being created
        child_id: u32,
    },
    /// CREATE_CHILD_SA rekeying a child
    RekeyChild {
        /// Session identifier of the child being rekeyed
        child_id: u32,
    },
    /// INFORMATIONAL deleting a child
    DeleteChild {
        /// Session identifier of the child being deleted
        child_id: u32,
    },
    /// INFORMATIONAL deleting the replaced SA after a child rekey
    RekeyChildDelete {
        /// Session identifier of the child being rekeyed
        child_id: u32,
    },
    /// CREATE_CHILD_SA rekeying the IKE SA
    RekeyIke,
    /// INFORMATIONAL deleting the old IKE SA after a rekey
    RekeyIkeDelete,
    /// INFORMATIONAL deleting the IKE SA
    DeleteIke,
    /// Plain INFORMATIONAL (liveness)
    Info,
}

/// One in-flight locally-initiated exchange.
#[derive(Debug, Clone)]
pub struct PendingExchange {
    /// Message id of the request
    pub message_id: u32,

    /// Serialized request, resent byte-identical
    pub bytes: Vec<u8>,

    /// Transmissions so far (the initial send counts)
    pub attempts: u32,

    /// Clock millis at which the next retransmission fires
    pub next_fire_ms: u64,

    /// Response routing
    pub purpose: ExchangePurpose,
}

/// Outcome of a retransmission timer firing.
#[derive(Debug, PartialEq, Eq)]
pub enum RetransmitAction {
    /// Resend the cached bytes
    Resend,

    /// Attempt limit reached; the SA is dead
    GiveUp,

    /// Timer fired early; nothing to do yet
    NotDue,
}

impl PendingExchange {
    /// Record a freshly sent request.
    pub fn new(message_id: u32, bytes: Vec<u8>, purpose: ExchangePurpose, now_ms: u64) -> Self {
        PendingExchange {
            message_id,
            bytes,
            attempts: 1,
            next_fire_ms: now_ms + RETRANSMIT_BASE_MS,
            purpose,
        }
    }

    /// Handle a retransmission timer firing at `now_ms`.
    pub fn on_timer(&mut self, now_ms: u64) -> RetransmitAction {
        if now_ms < self.next_fire_ms {
            return RetransmitAction::NotDue;
        }
        if self.attempts >= RETRANSMIT_MAX_ATTEMPTS {
            return RetransmitAction::GiveUp;
        }

        let delay = RETRANSMIT_BASE_MS
            * RETRANSMIT_MULTIPLIER.saturating_pow(self.attempts);
        self.attempts += 1;
        self.next_fire_ms = now_ms + delay;
        RetransmitAction::Resend
    }

    /// Whether a received response id matches this exchange.
    pub fn matches_response(&self, message_id: u32) -> bool {
        self.message_id == message_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_deadline() {
        let pending = PendingExchange::new(0, vec![1, 2, 3], ExchangePurpose::IkeInit, 1000);
        assert_eq!(pending.attempts, 1);
        assert_eq!(pending.next_fire_ms, 1500);
    }

    #[test]
    fn test_backoff_doubles() {
        let mut pending = PendingExchange::new(0, vec![], ExchangePurpose::IkeInit, 0);

        // Fire exactly on schedule each time and observe the doubling
        let mut now = pending.next_fire_ms;
        let mut delays = Vec::new();
        loop {
            match pending.on_timer(now) {
                RetransmitAction::Resend => {
                    delays.push(pending.next_fire_ms - now);
                    now = pending.next_fire_ms;
                }
                RetransmitAction::GiveUp => break,
                RetransmitAction::NotDue => panic!("timer fired on schedule"),
            }
        }

        assert_eq!(delays.len(), (RETRANSMIT_MAX_ATTEMPTS - 1) as usize);
        assert_eq!(delays[0], 1000);
        assert_eq!(delays[1], 2000);
        assert_eq!(*delays.last().unwrap(), 500 * 2u64.pow(7));
    }

    #[test]
    fn test_gives_up_after_cap() {
        let mut pending = PendingExchange::new(0, vec![], ExchangePurpose::IkeAuth, 0);
        pending.attempts = RETRANSMIT_MAX_ATTEMPTS;
        pending.next_fire_ms = 10;

        assert_eq!(pending.on_timer(10), RetransmitAction::GiveUp);
    }

    #[test]
    fn test_early_fire_is_ignored() {
        let mut pending = PendingExchange::new(0, vec![], ExchangePurpose::Info, 0);
        assert_eq!(pending.on_timer(100), RetransmitAction::NotDue);
        assert_eq!(pending.attempts, 1);
    }

    #[test]
    fn test_response_matching() {
        let pending = PendingExchange::new(
            7,
            vec![],
            ExchangePurpose::DeleteChild { child_id: 1 },
            0,
        );
        assert!(pending.matches_response(7));
        assert!(!pending.matches_response(8));
    }

    #[test]
    fn test_bytes_preserved_for_resend() {
        let bytes = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let mut pending =
            PendingExchange::new(1, bytes.clone(), ExchangePurpose::IkeAuth, 0);
        assert_eq!(pending.on_timer(500), RetransmitAction::Resend);
        assert_eq!(pending.bytes, bytes);
    }
}
