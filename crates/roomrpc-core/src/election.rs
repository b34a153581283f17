//! Responsible-coordinator election.
//!
//! Every peer runs this independently over its own roster snapshot. The winner
//! is the live, coordinator-eligible peer with the smallest [`PeerId`]; since
//! identifiers are totally ordered, identical snapshots always agree.

use crate::peer::{PeerId, PeerInfo};

/// The elected coordinator of a roster, if any peer qualifies.
pub fn responsible_coordinator(peers: &[PeerInfo]) -> Option<&PeerInfo> {
    peers
        .iter()
        .filter(|p| p.is_live_coordinator())
        .min_by(|a, b| a.id.cmp(&b.id))
}

/// Whether `local` is the elected coordinator of `peers`.
pub fn is_responsible_coordinator(peers: &[PeerInfo], local: &PeerId) -> bool {
    responsible_coordinator(peers).is_some_and(|p| &p.id == local)
}

/// Whether any live coordinator-eligible peer exists.
pub fn has_live_coordinator(peers: &[PeerInfo]) -> bool {
    peers.iter().any(PeerInfo::is_live_coordinator)
}
