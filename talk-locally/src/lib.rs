//! Serverless chat rooms for machines on the same local network.
//!
//! Peers find each other with mDNS, talk in named rooms over gossipsub and
//! push files to each other over direct streams. Each module owns one
//! concern:
//!
//! - [`identity`] generates the keypair, peer id and listen address.
//! - [`discovery`] turns mDNS sightings into dials with a connect rule that
//!   keeps two peers from dialing each other at once.
//! - [`pubsub`] is the topic registry and the transport seam, with an
//!   in-process [`pubsub::LocalHub`] for embedding and tests.
//! - [`room`] joins, publishes to and leaves named rooms.
//! - [`directory`] advertises and collects the rooms peers are sitting in.
//! - [`transfer`] is the file push protocol.
//! - [`swarm`] wires all of the above onto a libp2p swarm.
//! - [`node`] composes a running participant; [`console`] and [`http`] are
//!   the two frontends that drive one.

pub mod cli;
pub mod console;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod http;
pub mod identity;
pub mod message;
pub mod node;
pub mod pubsub;
pub mod room;
pub mod swarm;
pub mod transfer;
