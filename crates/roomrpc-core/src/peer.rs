//! Peers and the room roster.
//!
//! The roster is owned by the host environment. The core only reads snapshots
//! of it through the [`Roster`] trait; [`RoomRoster`] and [`PeerRoster`] are the
//! in-process implementation used by tests and by hosts without their own.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Stable identifier of a peer.
///
/// Ordering is lexicographic over the UTF-8 bytes, which is what coordinator
/// election compares. Every peer must see the same identifiers for the same
/// sessions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Allowed to act as the responsible coordinator.
    pub coordinator_eligible: bool,
    /// Currently connected.
    pub live: bool,
}

impl PeerInfo {
    /// A live peer that cannot coordinate.
    pub fn member(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into(),
            coordinator_eligible: false,
            live: true,
        }
    }

    /// A live coordinator-eligible peer.
    pub fn coordinator(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into(),
            coordinator_eligible: true,
            live: true,
        }
    }

    pub fn offline(mut self) -> Self {
        self.live = false;
        self
    }

    /// Live and coordinator-eligible.
    pub fn is_live_coordinator(&self) -> bool {
        self.live && self.coordinator_eligible
    }
}

/// Read access to the room roster from one peer's point of view.
pub trait Roster: Send + Sync + 'static {
    /// Identifier of the peer this process runs as.
    fn local_peer_id(&self) -> PeerId;

    /// Snapshot of every known peer, live or not.
    fn peers(&self) -> Vec<PeerInfo>;

    /// Look up a single peer.
    fn peer(&self, id: &PeerId) -> Option<PeerInfo> {
        self.peers().into_iter().find(|p| &p.id == id)
    }

    /// The roster entry of the local peer, if the host lists it.
    fn local_peer(&self) -> Option<PeerInfo> {
        self.peer(&self.local_peer_id())
    }
}

/// Shared, mutable roster of a room.
///
/// Clones share the same underlying list.
#[derive(Debug, Clone, Default)]
pub struct RoomRoster {
    peers: Arc<RwLock<Vec<PeerInfo>>>,
}

impl RoomRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peers(peers: impl IntoIterator<Item = PeerInfo>) -> Self {
        let roster = Self::new();
        for peer in peers {
            roster.upsert(peer);
        }
        roster
    }

    /// Insert a peer, replacing any existing entry with the same identifier.
    pub fn upsert(&self, peer: PeerInfo) {
        let mut peers = self.write();
        match peers.iter_mut().find(|p| p.id == peer.id) {
            Some(existing) => *existing = peer,
            None => {
                debug!("Roster: peer {} joined", peer.id);
                peers.push(peer);
            }
        }
    }

    /// Mark a peer connected or disconnected. Returns false for unknown peers.
    pub fn set_live(&self, id: &PeerId, live: bool) -> bool {
        let mut peers = self.write();
        match peers.iter_mut().find(|p| &p.id == id) {
            Some(peer) => {
                peer.live = live;
                debug!("Roster: peer {} live={}", id, live);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &PeerId) -> Option<PeerInfo> {
        let mut peers = self.write();
        let index = peers.iter().position(|p| &p.id == id)?;
        Some(peers.remove(index))
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        match self.peers.read() {
            Ok(peers) => peers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// View this roster as the given local peer.
    pub fn view_as(&self, local: impl Into<PeerId>) -> PeerRoster {
        PeerRoster {
            room: self.clone(),
            local: local.into(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<PeerInfo>> {
        // A panic while holding the lock cannot leave a half-written entry.
        match self.peers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A [`RoomRoster`] seen from one local peer.
#[derive(Debug, Clone)]
pub struct PeerRoster {
    room: RoomRoster,
    local: PeerId,
}

impl PeerRoster {
    pub fn room(&self) -> &RoomRoster {
        &self.room
    }
}

impl Roster for PeerRoster {
    fn local_peer_id(&self) -> PeerId {
        self.local.clone()
    }

    fn peers(&self) -> Vec<PeerInfo> {
        self.room.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_orders_by_bytes() {
        assert!(PeerId::from("A") < PeerId::from("a"));
        assert!(PeerId::from("peer-10") < PeerId::from("peer-9"));
        assert_eq!(PeerId::from("x").to_string(), "x");
    }

    #[test]
    fn test_upsert_replaces_existing() {
        let roster = RoomRoster::new();
        roster.upsert(PeerInfo::member("a"));
        roster.upsert(PeerInfo::coordinator("a"));

        let peers = roster.snapshot();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].coordinator_eligible);
    }

    #[test]
    fn test_set_live_and_remove() {
        let roster = RoomRoster::with_peers([PeerInfo::member("a")]);
        assert!(roster.set_live(&PeerId::from("a"), false));
        assert!(!roster.set_live(&PeerId::from("missing"), false));
        assert!(!roster.snapshot()[0].live);

        assert!(roster.remove(&PeerId::from("a")).is_some());
        assert!(roster.snapshot().is_empty());
    }

    #[test]
    fn test_views_share_state() {
        let room = RoomRoster::new();
        let a = room.view_as("a");
        let b = room.view_as("b");

        room.upsert(PeerInfo::coordinator("a"));

        assert_eq!(a.local_peer_id(), PeerId::from("a"));
        assert!(a.local_peer().is_some());
        assert!(b.local_peer().is_none());
        assert_eq!(b.peers().len(), 1);
    }

    #[test]
    fn test_peer_info_serializes_id_as_string() {
        let json = serde_json::to_value(PeerInfo::member("a")).unwrap();
        assert_eq!(json["id"], "a");
    }
}
