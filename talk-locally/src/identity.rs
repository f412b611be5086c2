use std::net::Ipv4Addr;

use libp2p::{
    identity::Keypair,
    multiaddr::{Multiaddr, Protocol},
    PeerId,
};

/// Who this process is on the mesh and where it listens.
///
/// Generated fresh on every start; nothing is persisted.
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: Keypair,
    peer_id: PeerId,
    listen_addr: Multiaddr,
}

impl NodeIdentity {
    /// Creates a new ed25519 identity listening on every IPv4 interface.
    /// Port 0 lets the OS pick.
    pub fn generate(port: u16) -> Self {
        let keypair = Keypair::generate_ed25519();
        let peer_id = keypair.public().to_peer_id();
        let listen_addr = Multiaddr::empty()
            .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
            .with(Protocol::Tcp(port));

        Self {
            keypair,
            peer_id,
            listen_addr,
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn listen_addr(&self) -> &Multiaddr {
        &self.listen_addr
    }

    /// Address other peers can paste to reach us directly.
    pub fn connection_string(&self) -> String {
        self.listen_addr
            .clone()
            .with(Protocol::P2p(self.peer_id))
            .to_string()
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .field("listen_addr", &self.listen_addr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_are_unique() {
        let first = NodeIdentity::generate(0);
        let second = NodeIdentity::generate(0);
        assert_ne!(first.peer_id(), second.peer_id());
    }

    #[test]
    fn connection_string_carries_port_and_peer() {
        let identity = NodeIdentity::generate(9001);
        let expected = format!("/ip4/0.0.0.0/tcp/9001/p2p/{}", identity.peer_id());
        assert_eq!(identity.connection_string(), expected);
    }
}
