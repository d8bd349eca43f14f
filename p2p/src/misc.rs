use std::collections::BTreeMap;

use serde::Serialize;
use types::primitives::{Epoch, Slot, SubnetId};

pub type RequestId = usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PeerStatus {
    pub head_slot: Slot,
    pub finalized_epoch: Epoch,
    /// Whether the peer serves blocks outside the minimal retention window.
    pub serves_historical_blocks: bool,
}

/// Net effect of an attestation subnet update.
///
/// `subscriptions` and `enr` map subnet IDs to subscribe (`true`) or
/// unsubscribe (`false`); `enr` additionally toggles the `attnets` bit
/// advertised in the node record.
#[derive(Clone, PartialEq, Eq, Default, Debug, Serialize)]
pub struct AttestationSubnetActions {
    pub subscriptions: BTreeMap<SubnetId, bool>,
    pub enr: BTreeMap<SubnetId, bool>,
}

impl AttestationSubnetActions {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty() && self.enr.is_empty()
    }
}
