//! Self-address negotiation (spec §4.7).
//!
//! Grounded on the teacher's `tp.rs` state-machine shape (an enum of phases
//! advanced by explicit events plus a tick), applied to address claiming
//! instead of multi-frame transfer.

use crate::token::Token;

/// `xorValue` rotation base (spec §4.7).
const DEVICE_ADDRESS_XOR_VALUE: u32 = 0x64;
const PROPOSAL_TIMEOUT_MS: u64 = 100;
const BEACON_AFTER_ASSIGN_MS: u64 = 1200;

/// Outcome of feeding the address manager an inbound token or a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressEvent {
    /// Emit `RequestAddress(value=candidate)`, broadcast.
    ProposeCandidate(u8),
    /// Emit `AddressInUse(value=addr)`, broadcast.
    AnnounceInUse(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Static(u8),
    Unassigned,
    Proposing { candidate: u8, started_at_ms: u64 },
    Assigned(u8),
}

pub struct AddressManager {
    state: State,
    guid: [u32; 4],
    xor_index: u32,
    address_offset: u32,
}

impl AddressManager {
    #[must_use]
    pub fn new_static(address: u8) -> Self {
        Self {
            state: State::Static(address),
            guid: [0; 4],
            xor_index: 0,
            address_offset: 0,
        }
    }

    #[must_use]
    pub fn new_unassigned(guid: [u32; 4]) -> Self {
        Self {
            state: State::Unassigned,
            guid,
            xor_index: 0,
            address_offset: 0,
        }
    }

    /// Reset to the initial state for `reset()`'s one-shot behaviour: static
    /// nodes announce immediately, unassigned nodes propose on the first tick.
    pub fn reset(&mut self) -> Option<AddressEvent> {
        match self.state {
            State::Static(addr) => Some(AddressEvent::AnnounceInUse(addr)),
            _ => None,
        }
    }

    #[must_use]
    pub fn own_address(&self) -> Option<u8> {
        match self.state {
            State::Static(a) | State::Assigned(a) => Some(a),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_static(&self) -> bool {
        matches!(self.state, State::Static(_))
    }

    /// Compute the next candidate from the GUID, advancing the rotation state.
    fn next_candidate(&mut self) -> u8 {
        loop {
            let rotation = self.xor_index % 32;
            let xor_value = DEVICE_ADDRESS_XOR_VALUE.rotate_right(rotation);
            let sum: u32 = self.guid.iter().fold(0, |acc, b| acc ^ (b ^ xor_value));
            let addr = (sum.wrapping_add(self.address_offset)) % 128;

            self.xor_index += 1;
            if self.xor_index >= 32 {
                self.xor_index = 0;
                self.address_offset += 1;
            }

            if addr != 0 && addr <= 120 {
                return addr as u8;
            }
        }
    }

    /// Drive the state machine forward one tick.
    pub fn clock(&mut self, now_ms: u64) -> Option<AddressEvent> {
        match self.state {
            State::Unassigned => {
                let candidate = self.next_candidate();
                self.state = State::Proposing {
                    candidate,
                    started_at_ms: now_ms,
                };
                Some(AddressEvent::ProposeCandidate(candidate))
            }
            State::Proposing { candidate, started_at_ms } => {
                if now_ms.saturating_sub(started_at_ms) >= PROPOSAL_TIMEOUT_MS {
                    self.state = State::Assigned(candidate);
                    Some(AddressEvent::AnnounceInUse(candidate))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Next scheduled beacon after assignment (spec §4.7: "+1200ms").
    #[must_use]
    pub fn beacon_delay_ms() -> u64 {
        BEACON_AFTER_ASSIGN_MS
    }

    /// Handle an inbound `AddressInUse` announcement.
    pub fn on_address_in_use(&mut self, value: u8) {
        match self.state {
            State::Proposing { candidate, .. } if candidate == value => {
                self.state = State::Unassigned;
            }
            State::Static(addr) if addr == value => {
                // Never yields; caller re-emits the Static announce via reset()/clock() paths.
            }
            _ => {}
        }
    }

    /// Handle an inbound `RequestAddress` naming a candidate equal to our own
    /// static address (spec §4.7: static nodes always reply, never yield).
    #[must_use]
    pub fn on_request_address(&self, candidate: u8) -> Option<AddressEvent> {
        match self.state {
            State::Static(addr) if addr == candidate => Some(AddressEvent::AnnounceInUse(addr)),
            _ => None,
        }
    }

    /// A frame arrived whose source equals `candidate`: someone else already
    /// has it (spec §4.7 Proposing bullet), or our own assigned address
    /// collided with another node (spec §4.7 Assigned bullet).
    pub fn on_frame_from_source(&mut self, source: u8) {
        match self.state {
            State::Proposing { candidate, .. } if candidate == source => {
                self.state = State::Unassigned;
            }
            State::Assigned(addr) if addr == source => {
                self.state = State::Unassigned;
            }
            _ => {}
        }
    }

    /// Lift a received `KeyTokenSequencerSync`/any token's source address
    /// through the collision-detection path; convenience over
    /// `on_frame_from_source` for callers that only have a `Token`.
    pub fn observe_token_source(&mut self, token: &Token) {
        if token.address < 128 {
            self.on_frame_from_source(token.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_node_announces_on_reset_and_never_yields() {
        let mut mgr = AddressManager::new_static(50);
        assert_eq!(mgr.reset(), Some(AddressEvent::AnnounceInUse(50)));
        assert_eq!(mgr.own_address(), Some(50));
        mgr.on_address_in_use(50);
        assert_eq!(mgr.own_address(), Some(50));
    }

    #[test]
    fn static_node_replies_to_request_for_its_own_address() {
        let mgr = AddressManager::new_static(50);
        assert_eq!(mgr.on_request_address(50), Some(AddressEvent::AnnounceInUse(50)));
        assert_eq!(mgr.on_request_address(51), None);
    }

    #[test]
    fn unassigned_node_proposes_then_assigns_after_timeout() {
        let mut mgr = AddressManager::new_unassigned([0xEE4C_AD97, 0x331C_E9EC, 0x9E95_7DBC, 0xA4A6_9FE5]);
        let event = mgr.clock(0);
        let candidate = match event {
            Some(AddressEvent::ProposeCandidate(c)) => c,
            other => panic!("expected ProposeCandidate, got {other:?}"),
        };
        assert!((1..=120).contains(&candidate));

        assert_eq!(mgr.clock(50), None);
        match mgr.clock(100) {
            Some(AddressEvent::AnnounceInUse(addr)) => assert_eq!(addr, candidate),
            other => panic!("expected AnnounceInUse, got {other:?}"),
        }
        assert_eq!(mgr.own_address(), Some(candidate));
    }

    #[test]
    fn candidate_never_zero_or_above_120() {
        let mut mgr = AddressManager::new_unassigned([0, 0, 0, 0]);
        for _ in 0..64 {
            let c = mgr.next_candidate();
            assert_ne!(c, 0);
            assert!(c <= 120);
        }
    }

    #[test]
    fn conflicting_address_in_use_restarts_proposal() {
        let mut mgr = AddressManager::new_unassigned([1, 2, 3, 4]);
        let candidate = match mgr.clock(0) {
            Some(AddressEvent::ProposeCandidate(c)) => c,
            _ => panic!(),
        };
        mgr.on_address_in_use(candidate);
        assert!(matches!(mgr.state, State::Unassigned));
    }

    #[test]
    fn frame_from_assigned_source_triggers_reassignment() {
        let mut mgr = AddressManager::new_unassigned([1, 2, 3, 4]);
        let candidate = match mgr.clock(0) {
            Some(AddressEvent::ProposeCandidate(c)) => c,
            _ => panic!(),
        };
        mgr.clock(100);
        assert_eq!(mgr.own_address(), Some(candidate));
        mgr.on_frame_from_source(candidate);
        assert_eq!(mgr.own_address(), None);
    }
}
