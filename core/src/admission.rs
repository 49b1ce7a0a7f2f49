// Admission control for concurrent sessions
//
// At most `limit` addresses hold a session slot; the rest wait in FIFO order.
// An address is never both active and waiting. The session manager is the
// only owner, so every mutation happens on its task.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

use crate::transport::ble::DeviceAddress;

/// Outcome of a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Admission {
    /// A slot was free; the session opens now
    ConnectedImmediately,
    /// All slots busy; the address waits for a release
    Queued,
    /// Already active or waiting; nothing changed
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    AlreadyPresent,
}

/// Active and waiting addresses at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionSnapshot {
    pub active: Vec<DeviceAddress>,
    pub waiting: Vec<DeviceAddress>,
}

#[derive(Debug)]
pub struct AdmissionController {
    limit: usize,
    active: HashSet<DeviceAddress>,
    waiting: VecDeque<DeviceAddress>,
}

impl AdmissionController {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            active: HashSet::new(),
            waiting: VecDeque::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn request_connect(&mut self, address: &DeviceAddress) -> Admission {
        if self.is_connected_or_queued(address) {
            debug!("Admission rejected for {}: already present", address);
            return Admission::Rejected(RejectReason::AlreadyPresent);
        }
        if self.active.len() < self.limit {
            self.active.insert(address.clone());
            info!("Admitted {} ({}/{})", address, self.active.len(), self.limit);
            Admission::ConnectedImmediately
        } else {
            self.waiting.push_back(address.clone());
            info!("Queued {} at position {}", address, self.waiting.len());
            Admission::Queued
        }
    }

    /// Free the slot of `address`; returns the waiting address promoted into it
    pub fn on_session_closed(&mut self, address: &DeviceAddress) -> Option<DeviceAddress> {
        if !self.active.remove(address) {
            debug!("Close for {} which holds no slot", address);
            return None;
        }
        if self.active.len() >= self.limit {
            return None;
        }
        let next = self.waiting.pop_front()?;
        self.active.insert(next.clone());
        info!("Promoted {} into the slot freed by {}", next, address);
        Some(next)
    }

    pub fn is_connected_or_queued(&self, address: &DeviceAddress) -> bool {
        self.is_active(address) || self.waiting.contains(address)
    }

    pub fn is_active(&self, address: &DeviceAddress) -> bool {
        self.active.contains(address)
    }

    /// Cancel a queued connect
    pub fn remove_waiting(&mut self, address: &DeviceAddress) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|a| a != address);
        before != self.waiting.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let mut active: Vec<DeviceAddress> = self.active.iter().cloned().collect();
        active.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        AdmissionSnapshot {
            active,
            waiting: self.waiting.iter().cloned().collect(),
        }
    }

    /// Forget everything; used on shutdown
    pub fn clear(&mut self) {
        self.active.clear();
        self.waiting.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(i: usize) -> DeviceAddress {
        DeviceAddress::new(format!("dev-{}", i))
    }

    #[test]
    fn test_fifth_request_is_queued() {
        let mut admission = AdmissionController::new(4);
        for i in 0..4 {
            assert_eq!(admission.request_connect(&addr(i)), Admission::ConnectedImmediately);
        }
        assert_eq!(admission.request_connect(&addr(4)), Admission::Queued);
        assert_eq!(admission.active_count(), 4);
    }

    #[test]
    fn test_duplicate_rejected_without_side_effects() {
        let mut admission = AdmissionController::new(1);
        admission.request_connect(&addr(0));
        admission.request_connect(&addr(1));
        let before = admission.snapshot();
        assert_eq!(
            admission.request_connect(&addr(0)),
            Admission::Rejected(RejectReason::AlreadyPresent)
        );
        assert_eq!(
            admission.request_connect(&addr(1)),
            Admission::Rejected(RejectReason::AlreadyPresent)
        );
        assert_eq!(admission.snapshot(), before);
    }

    #[test]
    fn test_close_promotes_fifo() {
        let mut admission = AdmissionController::new(1);
        admission.request_connect(&addr(0));
        admission.request_connect(&addr(1));
        admission.request_connect(&addr(2));
        assert_eq!(admission.on_session_closed(&addr(0)), Some(addr(1)));
        assert!(admission.is_active(&addr(1)));
        assert_eq!(admission.snapshot().waiting, vec![addr(2)]);
        // closing an address without a slot changes nothing
        assert_eq!(admission.on_session_closed(&addr(0)), None);
    }

    #[test]
    fn test_remove_waiting() {
        let mut admission = AdmissionController::new(1);
        admission.request_connect(&addr(0));
        admission.request_connect(&addr(1));
        assert!(admission.remove_waiting(&addr(1)));
        assert!(!admission.remove_waiting(&addr(1)));
        assert!(!admission.is_connected_or_queued(&addr(1)));
        assert_eq!(admission.on_session_closed(&addr(0)), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Connect(usize),
        Close(usize),
        Cancel(usize),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..8).prop_map(Op::Connect),
            (0usize..8).prop_map(Op::Close),
            (0usize..8).prop_map(Op::Cancel),
        ]
    }

    proptest! {
        /// Slots never exceed the limit, addresses are never both active and
        /// waiting, and a free slot never coexists with a waiting address
        #[test]
        fn admission_invariants_hold(
            limit in 1usize..5,
            ops in proptest::collection::vec(arb_op(), 0..64),
        ) {
            let mut admission = AdmissionController::new(limit);
            for op in ops {
                match op {
                    Op::Connect(i) => {
                        let present = admission.is_connected_or_queued(&addr(i));
                        let outcome = admission.request_connect(&addr(i));
                        prop_assert_eq!(
                            present,
                            outcome == Admission::Rejected(RejectReason::AlreadyPresent)
                        );
                    }
                    Op::Close(i) => {
                        let head = admission.snapshot().waiting.first().cloned();
                        let was_active = admission.is_active(&addr(i));
                        let promoted = admission.on_session_closed(&addr(i));
                        if was_active {
                            prop_assert_eq!(promoted, head);
                        } else {
                            prop_assert_eq!(promoted, None);
                        }
                    }
                    Op::Cancel(i) => {
                        admission.remove_waiting(&addr(i));
                    }
                }

                let snapshot = admission.snapshot();
                prop_assert!(snapshot.active.len() <= limit);
                prop_assert!(snapshot.waiting.is_empty() || snapshot.active.len() == limit);
                for waiting in &snapshot.waiting {
                    prop_assert!(!snapshot.active.contains(waiting));
                }
                let mut unique = snapshot.waiting.clone();
                unique.sort();
                unique.dedup();
                prop_assert_eq!(unique.len(), snapshot.waiting.len());
            }
        }
    }
}
