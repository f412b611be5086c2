//! Turning mDNS sightings into connections.
//!
//! The swarm pushes every sighting into one queue; a single dispatcher reads
//! it and decides whether to dial. Only the side with the smaller peer id
//! dials, so two peers that find each other at the same moment end up with
//! one connection instead of two.

use std::collections::HashMap;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::NetworkError;

/// Sightings buffered between the swarm and the dispatcher.
pub const DISCOVERY_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub peer_id: PeerId,
    pub addresses: Vec<Multiaddr>,
}

/// Something that can open a connection to a discovered peer.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, peer: &DiscoveredPeer) -> Result<(), NetworkError>;
}

/// Folds one discovery event into one entry per peer, keeping the order in
/// which peers and addresses were first seen.
pub fn group_discoveries(
    sightings: impl IntoIterator<Item = (PeerId, Multiaddr)>,
) -> Vec<DiscoveredPeer> {
    let mut peers: Vec<DiscoveredPeer> = Vec::new();
    let mut index: HashMap<PeerId, usize> = HashMap::new();

    for (peer_id, address) in sightings {
        let slot = *index.entry(peer_id).or_insert_with(|| {
            peers.push(DiscoveredPeer {
                peer_id,
                addresses: Vec::new(),
            });
            peers.len() - 1
        });
        let entry = &mut peers[slot];
        if !entry.addresses.contains(&address) {
            entry.addresses.push(address);
        }
    }

    peers
}

/// The symmetry-breaking rule: dial only peers whose id sorts after ours.
///
/// Ids are compared by their binary encoding so every implementation agrees
/// on the order.
pub fn should_dial(local: &PeerId, remote: &PeerId) -> bool {
    local.to_bytes() < remote.to_bytes()
}

/// Reads sightings until the queue closes, dialing the ones the connect rule
/// assigns to us. Dial failures are logged and forgotten; the next sighting
/// of the same peer is the retry.
pub async fn run_dispatcher<D: Dialer>(
    local: PeerId,
    mut sightings: mpsc::Receiver<DiscoveredPeer>,
    dialer: D,
) {
    while let Some(peer) = sightings.recv().await {
        if peer.peer_id == local {
            continue;
        }

        if !should_dial(&local, &peer.peer_id) {
            debug!(peer = %peer.peer_id, "peer sorts before us, waiting for it to dial");
            continue;
        }

        info!(peer = %peer.peer_id, addresses = ?peer.addresses, "dialing discovered peer");
        if let Err(error) = dialer.dial(&peer).await {
            warn!(peer = %peer.peer_id, %error, "dial failed");
        }
    }

    debug!("discovery queue closed, dispatcher exiting");
}
