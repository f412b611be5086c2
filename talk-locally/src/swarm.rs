//! The libp2p side: one swarm, owned by one task.
//!
//! Everything else talks to the swarm through [`SwarmHandle`], which sends
//! commands over a channel and waits on a oneshot for the answer. The event
//! loop never awaits anything but its own two inputs, so a slow consumer
//! elsewhere cannot stall gossip.

use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use libp2p::{
    gossipsub::{self, IdentTopic, PublishError},
    mdns, noise,
    swarm::{dial_opts::DialOpts, NetworkBehaviour, SwarmEvent},
    tcp, yamux, PeerId, Swarm, SwarmBuilder,
};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    discovery::{group_discoveries, DiscoveredPeer, Dialer},
    error::{NetworkError, TransferError},
    identity::NodeIdentity,
    pubsub::{Inbound, PubSubNetwork},
    transfer::{receive_file, StreamOpener, TransferStream, FILE_PROTOCOL},
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(NetworkBehaviour)]
pub struct TalkBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
    pub streams: libp2p_stream::Behaviour,
}

/// Builds the swarm for `identity` and starts listening on its address.
///
/// `scope` namespaces the gossipsub protocol id, so processes started with
/// different scopes never share room traffic even when they connect.
pub fn build_swarm(identity: &NodeIdentity, scope: &str) -> anyhow::Result<Swarm<TalkBehaviour>> {
    let protocol_prefix = format!("meshsub-{scope}");

    let mut swarm = SwarmBuilder::with_existing_identity(identity.keypair().clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .context("tcp transport")?
        .with_behaviour(|key| -> Result<TalkBehaviour, BoxError> {
            let config = gossipsub::ConfigBuilder::default()
                .protocol_id_prefix(protocol_prefix)
                .heartbeat_interval(Duration::from_secs(1))
                .validation_mode(gossipsub::ValidationMode::Strict)
                .build()?;
            let gossipsub =
                gossipsub::Behaviour::new(gossipsub::MessageAuthenticity::Signed(key.clone()), config)?;
            let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), key.public().to_peer_id())?;

            Ok(TalkBehaviour {
                gossipsub,
                mdns,
                streams: libp2p_stream::Behaviour::new(),
            })
        })
        .context("network behaviour")?
        .with_swarm_config(|config| config.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    swarm
        .listen_on(identity.listen_addr().clone())
        .with_context(|| format!("listen on {}", identity.listen_addr()))?;

    Ok(swarm)
}

pub enum SwarmCommand {
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    Publish {
        topic: String,
        data: Bytes,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    Dial {
        peer: DiscoveredPeer,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
}

/// Cloneable front door to the swarm task.
#[derive(Clone)]
pub struct SwarmHandle {
    commands: mpsc::UnboundedSender<SwarmCommand>,
}

impl SwarmHandle {
    async fn request<F>(&self, command: F) -> Result<(), NetworkError>
    where
        F: FnOnce(oneshot::Sender<Result<(), NetworkError>>) -> SwarmCommand,
    {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| NetworkError::SwarmStopped)?;
        response.await.map_err(|_| NetworkError::SwarmStopped)?
    }
}

#[async_trait]
impl PubSubNetwork for SwarmHandle {
    async fn subscribe(&self, topic: &str) -> Result<(), NetworkError> {
        let topic = topic.to_string();
        self.request(|reply| SwarmCommand::Subscribe { topic, reply })
            .await
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<(), NetworkError> {
        let topic = topic.to_string();
        self.request(|reply| SwarmCommand::Publish { topic, data, reply })
            .await
    }
}

#[async_trait]
impl Dialer for SwarmHandle {
    async fn dial(&self, peer: &DiscoveredPeer) -> Result<(), NetworkError> {
        let peer = peer.clone();
        self.request(|reply| SwarmCommand::Dial { peer, reply })
            .await
    }
}

/// Moves `swarm` into its own task.
///
/// Gossip for any subscribed topic goes out on `inbound`; mDNS sightings are
/// pushed into `discoveries` without waiting, and dropped when it is full.
pub fn spawn_swarm(
    swarm: Swarm<TalkBehaviour>,
    inbound: mpsc::UnboundedSender<Inbound>,
    discoveries: mpsc::Sender<DiscoveredPeer>,
) -> (SwarmHandle, JoinHandle<()>) {
    let (commands, receiver) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_swarm(swarm, receiver, inbound, discoveries));
    (SwarmHandle { commands }, task)
}

async fn run_swarm(
    mut swarm: Swarm<TalkBehaviour>,
    mut commands: mpsc::UnboundedReceiver<SwarmCommand>,
    inbound: mpsc::UnboundedSender<Inbound>,
    discoveries: mpsc::Sender<DiscoveredPeer>,
) {
    loop {
        select! {
            event = swarm.select_next_some() => {
                handle_swarm_event(event, &inbound, &discoveries);
            }
            command = commands.recv() => match command {
                Some(command) => handle_command(&mut swarm, command),
                None => {
                    info!("all swarm handles dropped, stopping swarm");
                    break;
                }
            },
        }
    }
}

fn handle_command(swarm: &mut Swarm<TalkBehaviour>, command: SwarmCommand) {
    match command {
        SwarmCommand::Subscribe { topic, reply } => {
            let result = swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&IdentTopic::new(topic.as_str()))
                .map(|fresh| {
                    if fresh {
                        debug!(%topic, "subscribed to topic");
                    }
                })
                .map_err(|error| NetworkError::Subscribe {
                    topic,
                    reason: error.to_string(),
                });
            let _ = reply.send(result);
        }
        SwarmCommand::Publish { topic, data, reply } => {
            let result = match swarm
                .behaviour_mut()
                .gossipsub
                .publish(IdentTopic::new(topic.as_str()), data.to_vec())
            {
                Ok(_) => Ok(()),
                // Nobody else in the topic yet. Local delivery already happened.
                Err(PublishError::InsufficientPeers) => {
                    trace!(%topic, "published with no remote peers");
                    Ok(())
                }
                Err(error) => Err(NetworkError::Publish {
                    topic,
                    reason: error.to_string(),
                }),
            };
            let _ = reply.send(result);
        }
        SwarmCommand::Dial { peer, reply } => {
            let result = if swarm.is_connected(&peer.peer_id) {
                trace!(peer = %peer.peer_id, "already connected, skipping dial");
                Ok(())
            } else {
                let opts = DialOpts::peer_id(peer.peer_id)
                    .addresses(peer.addresses)
                    .build();
                swarm.dial(opts).map_err(|error| NetworkError::Dial {
                    peer: peer.peer_id,
                    reason: error.to_string(),
                })
            };
            let _ = reply.send(result);
        }
    }
}

fn handle_swarm_event(
    event: SwarmEvent<TalkBehaviourEvent>,
    inbound: &mpsc::UnboundedSender<Inbound>,
    discoveries: &mpsc::Sender<DiscoveredPeer>,
) {
    match event {
        SwarmEvent::Behaviour(TalkBehaviourEvent::Gossipsub(gossipsub::Event::Message {
            propagation_source,
            message,
            ..
        })) => {
            let origin = message.source.unwrap_or(propagation_source);
            let _ = inbound.send(Inbound {
                topic: message.topic.to_string(),
                origin,
                data: Bytes::from(message.data),
            });
        }
        SwarmEvent::Behaviour(TalkBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed {
            peer_id,
            topic,
        })) => {
            debug!(peer = %peer_id, %topic, "peer subscribed");
        }
        SwarmEvent::Behaviour(TalkBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
            for peer in group_discoveries(list) {
                let peer_id = peer.peer_id;
                if let Err(error) = discoveries.try_send(peer) {
                    warn!(peer = %peer_id, %error, "discovery queue full, dropping sighting");
                }
            }
        }
        SwarmEvent::Behaviour(TalkBehaviourEvent::Mdns(mdns::Event::Expired(list))) => {
            for (peer_id, address) in list {
                debug!(peer = %peer_id, %address, "mdns record expired");
            }
        }
        SwarmEvent::NewListenAddr { address, .. } => {
            info!(%address, "listening");
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            debug!(peer = %peer_id, "connection established");
        }
        SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
            debug!(peer = %peer_id, ?cause, "connection closed");
        }
        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
            warn!(peer = ?peer_id, %error, "outgoing connection failed");
        }
        _ => {}
    }
}

/// Opens file streams through the swarm's stream behaviour.
#[derive(Clone)]
pub struct StreamControl {
    control: libp2p_stream::Control,
}

impl StreamControl {
    pub fn new(swarm: &Swarm<TalkBehaviour>) -> Self {
        Self {
            control: swarm.behaviour().streams.new_control(),
        }
    }

    /// Accepts inbound file streams for the life of the process, each one in
    /// its own task, and stores them under `download_dir`.
    pub fn spawn_file_receiver(&self, download_dir: PathBuf) -> anyhow::Result<JoinHandle<()>> {
        let mut incoming = self
            .control
            .clone()
            .accept(FILE_PROTOCOL)
            .context("file protocol already has a receiver")?;

        Ok(tokio::spawn(async move {
            while let Some((peer, stream)) = incoming.next().await {
                let dir = download_dir.clone();
                tokio::spawn(async move {
                    match receive_file(stream, &dir).await {
                        Ok(path) => info!(%peer, path = %path.display(), "saved incoming file"),
                        Err(error) => warn!(%peer, %error, "incoming file transfer failed"),
                    }
                });
            }
        }))
    }
}

#[async_trait]
impl StreamOpener for StreamControl {
    async fn open(&self, peer: PeerId) -> Result<TransferStream, TransferError> {
        let mut control = self.control.clone();
        let stream = control
            .open_stream(peer, FILE_PROTOCOL)
            .await
            .map_err(|error| TransferError::OpenStream {
                peer,
                reason: error.to_string(),
            })?;
        Ok(Box::new(stream))
    }
}
