//! Connection deduplication.
//!
//! Two nodes that discover each other at the same time may each dial the
//! other, leaving two connections between the same pair. Both ends must agree
//! on which one survives without exchanging any extra messages, so the
//! decision is a pure function of the two public keys:
//!
//! ```text
//!   A < B (byte order)
//!
//!   A ──dial──► B     A initiated: decide(A, B) = Keep   → survives
//!   A ◄──dial── B     B initiated: decide(B, A) = Drop   → closed
//! ```
//!
//! The discovery layer owns the bookkeeping of which connections exist; it
//! calls [`should_drop`] when a second connection to the same remote appears.

use crate::identity::PeerId;

/// Tie-break verdict for the connection initiated by `local`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    /// The connection `local` initiated survives
    Keep,
    /// The connection `local` initiated is closed
    Drop,
}

/// Decide whether the connection `local` initiated to `remote` survives.
///
/// `decide(a, b)` and `decide(b, a)` always disagree for distinct keys.
#[must_use]
pub fn decide(local: &PeerId, remote: &PeerId) -> DedupDecision {
    if local < remote {
        DedupDecision::Keep
    } else {
        DedupDecision::Drop
    }
}

/// Whether a concrete connection should be dropped.
///
/// `is_initiator` is true when `local` dialed this connection.
#[must_use]
pub fn should_drop(local: &PeerId, remote: &PeerId, is_initiator: bool) -> bool {
    let initiated_by_local_survives = decide(local, remote) == DedupDecision::Keep;
    is_initiator != initiated_by_local_survives
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_lower_key_initiator_wins() {
        let low = [1u8; 32];
        let high = [2u8; 32];

        assert_eq!(decide(&low, &high), DedupDecision::Keep);
        assert_eq!(decide(&high, &low), DedupDecision::Drop);

        // low dialed high: both ends keep it
        assert!(!should_drop(&low, &high, true));
        assert!(!should_drop(&high, &low, false));

        // high dialed low: both ends drop it
        assert!(should_drop(&high, &low, true));
        assert!(should_drop(&low, &high, false));
    }

    proptest! {
        #[test]
        fn decisions_are_antisymmetric(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            prop_assume!(a != b);
            prop_assert_ne!(decide(&a, &b), decide(&b, &a));
        }

        #[test]
        fn both_ends_agree_on_each_connection(
            a in any::<[u8; 32]>(),
            b in any::<[u8; 32]>(),
            a_dialed in any::<bool>(),
        ) {
            prop_assume!(a != b);
            prop_assert_eq!(should_drop(&a, &b, a_dialed), should_drop(&b, &a, !a_dialed));
        }

        #[test]
        fn exactly_one_of_two_crossing_connections_survives(
            a in any::<[u8; 32]>(),
            b in any::<[u8; 32]>(),
        ) {
            prop_assume!(a != b);
            let a_to_b_dropped = should_drop(&a, &b, true);
            let b_to_a_dropped = should_drop(&b, &a, true);
            prop_assert_ne!(a_to_b_dropped, b_to_a_dropped);
        }
    }
}
