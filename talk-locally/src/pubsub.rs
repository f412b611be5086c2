//! Topic plumbing shared by every room.
//!
//! A [`PubSubNetwork`] moves bytes between processes. The [`TopicRegistry`]
//! owns one [`Topic`] per topic string and fans inbound deliveries out to
//! every local subscription through a Tokio `broadcast` channel.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::error::NetworkError;

/// Prefix every chat room topic lives under.
pub const ROOM_TOPIC_PREFIX: &str = "chat-room:";

/// Topic of the reserved directory room. Sits outside [`ROOM_TOPIC_PREFIX`]
/// so no user-chosen room name can collide with it.
pub const DIRECTORY_TOPIC: &str = "room-discovery";

// Deliveries buffered per topic before a slow subscription starts lagging.
const TOPIC_FANOUT_CAPACITY: usize = 256;

pub fn topic_name(room_name: &str) -> String {
    format!("{ROOM_TOPIC_PREFIX}{room_name}")
}

/// The transport underneath the rooms.
#[async_trait]
pub trait PubSubNetwork: Send + Sync {
    /// Starts receiving `topic` from the network. Must be idempotent.
    async fn subscribe(&self, topic: &str) -> Result<(), NetworkError>;

    /// Sends `data` to remote subscribers of `topic`, best effort.
    async fn publish(&self, topic: &str, data: Bytes) -> Result<(), NetworkError>;
}

/// A payload received from the network, before it is matched to a topic.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: String,
    pub origin: PeerId,
    pub data: Bytes,
}

/// A payload as seen by one local subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub origin: PeerId,
    pub data: Bytes,
}

/// Handle to one topic. Cloning is cheap and every clone is the same topic.
#[derive(Clone)]
pub struct Topic {
    inner: Arc<TopicInner>,
}

struct TopicInner {
    name: String,
    local_peer: PeerId,
    fanout: broadcast::Sender<Delivery>,
    network: Arc<dyn PubSubNetwork>,
}

impl Topic {
    fn new(name: String, local_peer: PeerId, network: Arc<dyn PubSubNetwork>) -> Self {
        let (fanout, _) = broadcast::channel(TOPIC_FANOUT_CAPACITY);
        Self {
            inner: Arc::new(TopicInner {
                name,
                local_peer,
                fanout,
                network,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Opens a fresh, independent subscription on this topic.
    pub fn subscribe(&self) -> broadcast::Receiver<Delivery> {
        self.inner.fanout.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.fanout.receiver_count()
    }

    /// True when both handles point at the same underlying topic.
    pub fn same_topic(&self, other: &Topic) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Delivers to local subscriptions (ourselves included), then to the
    /// network. A network failure gets one immediate retry before it is
    /// returned.
    pub async fn publish(&self, data: Bytes) -> Result<(), NetworkError> {
        self.deliver(Delivery {
            origin: self.inner.local_peer,
            data: data.clone(),
        });

        match self.inner.network.publish(&self.inner.name, data.clone()).await {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!(topic = %self.inner.name, %error, "publish failed, retrying once");
                self.inner.network.publish(&self.inner.name, data).await
            }
        }
    }

    fn deliver(&self, delivery: Delivery) {
        // No receivers just means nobody local is listening right now.
        if self.inner.fanout.send(delivery).is_err() {
            trace!(topic = %self.inner.name, "no local subscribers for delivery");
        }
    }
}

/// Owns the one-topic-per-name invariant for this process.
pub struct TopicRegistry {
    local_peer: PeerId,
    network: Arc<dyn PubSubNetwork>,
    topics: Mutex<HashMap<String, Topic>>,
}

impl TopicRegistry {
    pub fn new(local_peer: PeerId, network: Arc<dyn PubSubNetwork>) -> Self {
        Self {
            local_peer,
            network,
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Returns the topic for `name`, creating it on first use.
    pub fn topic(&self, name: &str) -> Topic {
        let mut topics = self.topics.lock();
        topics
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(topic = name, "creating topic");
                Topic::new(name.to_string(), self.local_peer, Arc::clone(&self.network))
            })
            .clone()
    }

    /// Reuses or creates the topic for `name` and opens a new local
    /// subscription on it before asking the network for the topic, so nothing
    /// delivered in between is missed.
    pub async fn join(
        &self,
        name: &str,
    ) -> Result<(Topic, broadcast::Receiver<Delivery>), NetworkError> {
        let topic = self.topic(name);
        let subscription = topic.subscribe();
        self.network.subscribe(name).await?;
        Ok((topic, subscription))
    }

    pub fn len(&self) -> usize {
        self.topics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.lock().is_empty()
    }

    /// Hands an inbound payload to the matching topic, if we ever joined it.
    pub fn route(&self, inbound: Inbound) {
        let topic = self.topics.lock().get(&inbound.topic).cloned();
        match topic {
            Some(topic) => topic.deliver(Delivery {
                origin: inbound.origin,
                data: inbound.data,
            }),
            None => trace!(topic = %inbound.topic, "dropping delivery for unknown topic"),
        }
    }
}

/// Drains the network's inbound queue into the registry until the network
/// side hangs up.
pub async fn route_inbound(
    registry: Arc<TopicRegistry>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
) {
    while let Some(delivery) = inbound.recv().await {
        registry.route(delivery);
    }
    debug!("inbound delivery queue closed");
}

/// In-process stand-in for the gossip network.
///
/// Every attached peer gets a [`LocalLink`] and an inbound queue; publishing
/// on a link reaches every other attached peer subscribed to that topic.
/// Useful for embedding several nodes in one process and for tests.
#[derive(Clone, Default)]
pub struct LocalHub {
    peers: Arc<Mutex<HashMap<PeerId, LocalPeer>>>,
}

struct LocalPeer {
    topics: HashSet<String>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, peer: PeerId) -> (LocalLink, mpsc::UnboundedReceiver<Inbound>) {
        let (inbound, receiver) = mpsc::unbounded_channel();
        self.peers.lock().insert(
            peer,
            LocalPeer {
                topics: HashSet::new(),
                inbound,
            },
        );
        (
            LocalLink {
                hub: self.clone(),
                peer,
            },
            receiver,
        )
    }

    /// Removes a peer; later publishes no longer reach it.
    pub fn detach(&self, peer: &PeerId) {
        self.peers.lock().remove(peer);
    }
}

pub struct LocalLink {
    hub: LocalHub,
    peer: PeerId,
}

#[async_trait]
impl PubSubNetwork for LocalLink {
    async fn subscribe(&self, topic: &str) -> Result<(), NetworkError> {
        let mut peers = self.hub.peers.lock();
        match peers.get_mut(&self.peer) {
            Some(peer) => {
                peer.topics.insert(topic.to_string());
                Ok(())
            }
            None => Err(NetworkError::Subscribe {
                topic: topic.to_string(),
                reason: "peer is detached from the hub".to_string(),
            }),
        }
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<(), NetworkError> {
        let peers = self.hub.peers.lock();
        if !peers.contains_key(&self.peer) {
            return Err(NetworkError::Publish {
                topic: topic.to_string(),
                reason: "peer is detached from the hub".to_string(),
            });
        }

        for (peer_id, peer) in peers.iter() {
            if *peer_id == self.peer || !peer.topics.contains(topic) {
                continue;
            }
            let _ = peer.inbound.send(Inbound {
                topic: topic.to_string(),
                origin: self.peer,
                data: data.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::time::timeout;

    use super::*;

    /// Fails the first `failures` publishes, then succeeds.
    struct FlakyNetwork {
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyNetwork {
        fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PubSubNetwork for FlakyNetwork {
        async fn subscribe(&self, _topic: &str) -> Result<(), NetworkError> {
            Ok(())
        }

        async fn publish(&self, topic: &str, _data: Bytes) -> Result<(), NetworkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(NetworkError::Publish {
                    topic: topic.to_string(),
                    reason: "flaky".into(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn topic_names_are_distinct_per_room() {
        assert_ne!(topic_name("kitchen"), topic_name("garden"));
        assert_eq!(topic_name("kitchen"), "chat-room:kitchen");
        assert!(!DIRECTORY_TOPIC.starts_with(ROOM_TOPIC_PREFIX));
        assert_ne!(topic_name("room-discovery"), DIRECTORY_TOPIC);
    }

    #[tokio::test]
    async fn registry_reuses_topics_by_name() {
        let hub = LocalHub::new();
        let peer = PeerId::random();
        let (link, _inbound) = hub.attach(peer);
        let registry = TopicRegistry::new(peer, Arc::new(link));

        let (first, _first_sub) = registry.join("chat-room:kitchen").await.expect("join");
        let (second, _second_sub) = registry.join("chat-room:kitchen").await.expect("rejoin");
        let (other, _other_sub) = registry.join("chat-room:garden").await.expect("join other");

        assert!(first.same_topic(&second));
        assert!(!first.same_topic(&other));
        assert_eq!(registry.len(), 2);
        assert_eq!(first.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn publish_reaches_local_subscribers_and_remote_peers() {
        let hub = LocalHub::new();
        let alice = PeerId::random();
        let bob = PeerId::random();
        let (alice_link, _alice_inbound) = hub.attach(alice);
        let (bob_link, mut bob_inbound) = hub.attach(bob);
        bob_link.subscribe("t").await.expect("bob subscribes");

        let registry = TopicRegistry::new(alice, Arc::new(alice_link));
        let (topic, mut local) = registry.join("t").await.expect("join");

        topic.publish(Bytes::from_static(b"hi")).await.expect("publish");

        let echoed = local.recv().await.expect("local echo");
        assert_eq!(echoed.origin, alice);
        assert_eq!(echoed.data, Bytes::from_static(b"hi"));

        let remote = timeout(Duration::from_secs(1), bob_inbound.recv())
            .await
            .expect("bob receives in time")
            .expect("bob inbound open");
        assert_eq!(remote.origin, alice);
        assert_eq!(remote.topic, "t");
    }

    #[tokio::test]
    async fn route_ignores_unknown_topics() {
        let hub = LocalHub::new();
        let peer = PeerId::random();
        let (link, _inbound) = hub.attach(peer);
        let registry = TopicRegistry::new(peer, Arc::new(link));

        registry.route(Inbound {
            topic: "never-joined".into(),
            origin: PeerId::random(),
            data: Bytes::new(),
        });
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn detached_peer_cannot_publish() {
        let hub = LocalHub::new();
        let peer = PeerId::random();
        let (link, _inbound) = hub.attach(peer);
        hub.detach(&peer);

        let result = link.publish("t", Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(NetworkError::Publish { .. })));
    }

    #[tokio::test]
    async fn publish_retries_once_after_a_failure() {
        let network = FlakyNetwork::failing(1);
        let topic = Topic::new("t".into(), PeerId::random(), network.clone());

        topic
            .publish(Bytes::from_static(b"x"))
            .await
            .expect("second attempt succeeds");

        assert_eq!(network.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn publish_gives_up_after_the_retry() {
        let network = FlakyNetwork::failing(2);
        let topic = Topic::new("t".into(), PeerId::random(), network.clone());

        let result = topic.publish(Bytes::from_static(b"x")).await;

        assert!(matches!(result, Err(NetworkError::Publish { .. })));
        assert_eq!(network.calls.load(Ordering::SeqCst), 2);
    }
}
