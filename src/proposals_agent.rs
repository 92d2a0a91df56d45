//! Per-order bookkeeping of received `StorageProposal`s, gated by a
//! "listening" flag the controller toggles while it's still willing to
//! accept new bids for an order.
//!
//! Confined behind the controller's single proposals mutex (§5): every
//! method here takes `&mut self`, and the controller is expected to hold one
//! `Mutex<ProposalsAgent>` rather than sprinkling locks per map.

use std::collections::{HashMap, HashSet};

use crate::types::{OrderHash, ProposalHash, StorageProposal};

/// Listening set plus the proposals received while listening, keyed by
/// order. Proposals for an order that isn't listening are dropped by the
/// controller before they ever reach `add_proposal`.
#[derive(Debug, Default)]
pub struct ProposalsAgent {
    listening: HashSet<OrderHash>,
    proposals: HashMap<OrderHash, Vec<StorageProposal>>,
}

impl ProposalsAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting proposals for `order_hash`.
    pub fn listen_proposal(&mut self, order_hash: OrderHash) {
        self.listening.insert(order_hash);
    }

    /// Stop accepting proposals for `order_hash`. Already-received proposals
    /// are left in place; call `erase_orders_proposals` to discard them too.
    pub fn stop_listen_proposal(&mut self, order_hash: OrderHash) {
        self.listening.remove(&order_hash);
    }

    pub fn is_listening(&self, order_hash: OrderHash) -> bool {
        self.listening.contains(&order_hash)
    }

    /// Snapshot of every order currently accepting proposals.
    pub fn get_listen_proposals(&self) -> Vec<OrderHash> {
        self.listening.iter().copied().collect()
    }

    /// Record a proposal. Callers MUST have already verified
    /// `is_listening(proposal.order_hash)` and the rate filter (§9 note 4
    /// pins the filter to `order.max_rate > proposal.rate`, strictly), this
    /// method does not re-check either, matching the original's "append,
    /// caller pre-filters" division of labor.
    pub fn add_proposal(&mut self, proposal: StorageProposal) {
        self.proposals
            .entry(proposal.order_hash)
            .or_default()
            .push(proposal);
    }

    /// All proposals received for `order_hash`, in the order they arrived.
    pub fn get_proposals(&self, order_hash: OrderHash) -> Vec<StorageProposal> {
        self.proposals.get(&order_hash).cloned().unwrap_or_default()
    }

    /// A single proposal by its content hash, if received.
    pub fn get_proposal(
        &self,
        order_hash: OrderHash,
        proposal_hash: ProposalHash,
    ) -> Option<StorageProposal> {
        self.proposals.get(&order_hash)?.iter().find_map(|p| {
            let hash = p.hash().ok()?;
            (hash == proposal_hash).then(|| p.clone())
        })
    }

    /// Discard everything recorded for `order_hash`: proposals and listening
    /// state. Used by `CancelOrder` and the reaper.
    pub fn erase_orders_proposals(&mut self, order_hash: OrderHash) {
        self.listening.remove(&order_hash);
        self.proposals.remove(&order_hash);
    }

    /// Proposals for `order_hash` sorted ascending by `rate`, ties broken by
    /// arrival order (a stable sort preserves that automatically). Backs
    /// `FindReplicaKeepers`; §9 note 3 flags the original's insertion sort as
    /// buggy (it silently drops proposals that sort after every existing
    /// entry), this is the corrected, total ordering.
    pub fn sorted_proposals(&self, order_hash: OrderHash) -> Vec<StorageProposal> {
        let mut proposals = self.get_proposals(order_hash);
        proposals.sort_by_key(|p| p.rate);
        proposals
    }
}
