//! Named rooms on top of the topic registry.
//!
//! Each [`Room`] owns one subscription and one delivery task. The task pulls
//! raw deliveries off the topic, decodes them, drops our own echoes, records
//! the sender in the roster and hands the message to a bounded queue. Closing
//! the room cancels the task even while it is parked on a full queue.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use tokio::{
    select,
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::RoomError,
    message::{ChatMessage, RoomAdvert, WireMessage},
    pubsub::{
        route_inbound, topic_name, Delivery, Inbound, PubSubNetwork, Topic, TopicRegistry,
        DIRECTORY_TOPIC,
    },
};

/// Messages buffered per room before the delivery task waits on the reader.
pub const ROOM_QUEUE_CAPACITY: usize = 128;

type Roster = Arc<RwLock<HashSet<PeerId>>>;

/// Joins rooms for one local identity and owns the topic registry they share.
pub struct RoomManager {
    nickname: String,
    registry: Arc<TopicRegistry>,
}

impl RoomManager {
    /// Builds the manager and spawns the task that routes `inbound`
    /// deliveries into joined topics. Must run inside a Tokio runtime.
    pub fn new(
        local_peer: PeerId,
        nickname: impl Into<String>,
        network: Arc<dyn PubSubNetwork>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> Self {
        let registry = Arc::new(TopicRegistry::new(local_peer, network));
        tokio::spawn(route_inbound(Arc::clone(&registry), inbound));

        Self {
            nickname: nickname.into(),
            registry,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.registry.local_peer()
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    /// Joins (or creates) the chat room called `room_name`.
    pub async fn join(&self, room_name: &str) -> Result<Room<ChatMessage>, RoomError> {
        let room_name = room_name.trim();
        if room_name.is_empty() {
            return Err(RoomError::EmptyName);
        }
        self.join_topic(room_name, &topic_name(room_name)).await
    }

    /// Joins the reserved room that carries directory advertisements.
    pub async fn join_directory(&self) -> Result<Room<RoomAdvert>, RoomError> {
        self.join_topic(DIRECTORY_TOPIC, DIRECTORY_TOPIC).await
    }

    async fn join_topic<M: WireMessage>(
        &self,
        room_name: &str,
        topic: &str,
    ) -> Result<Room<M>, RoomError> {
        let (topic, subscription) = self.registry.join(topic).await?;
        let room = Room::start(
            room_name.to_string(),
            topic,
            subscription,
            self.local_peer(),
            self.nickname.clone(),
        );
        info!(room = room_name, topic = room.topic().name(), "joined room");
        Ok(room)
    }
}

/// One membership in a named room.
pub struct Room<M: WireMessage = ChatMessage> {
    name: String,
    topic: Topic,
    local_peer: PeerId,
    nickname: String,
    roster: Roster,
    messages: Option<mpsc::Receiver<M>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<M: WireMessage> Room<M> {
    fn start(
        name: String,
        topic: Topic,
        subscription: broadcast::Receiver<Delivery>,
        local_peer: PeerId,
        nickname: String,
    ) -> Self {
        let roster: Roster = Arc::new(RwLock::new(HashSet::from([local_peer])));
        let (queue, messages) = mpsc::channel(ROOM_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_delivery(
            name.clone(),
            local_peer,
            subscription,
            Arc::clone(&roster),
            queue,
            cancel.clone(),
        ));

        Self {
            name,
            topic,
            local_peer,
            nickname,
            roster,
            messages: Some(messages),
            cancel,
            closed: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Snapshot of every peer seen talking in this room, plus ourselves
    /// until we leave.
    pub fn active_peers(&self) -> Vec<PeerId> {
        self.roster.read().iter().copied().collect()
    }

    /// Hands the receiving end of the inbound queue to a single consumer.
    /// Returns `None` once it has been taken.
    pub fn take_messages(&mut self) -> Option<mpsc::Receiver<M>> {
        self.messages.take()
    }

    /// Waits for the next message when nobody has taken the queue.
    pub async fn next_message(&mut self) -> Option<M> {
        match self.messages.as_mut() {
            Some(messages) => messages.recv().await,
            None => None,
        }
    }

    pub async fn send(&self, message: &M) -> Result<(), RoomError> {
        if self.is_closed() {
            return Err(RoomError::Closed);
        }
        let payload = message.encode().map_err(RoomError::Encode)?;
        self.topic.publish(Bytes::from(payload)).await?;
        Ok(())
    }

    /// Stops the delivery task and drops this membership's subscription.
    ///
    /// Messages already queued stay readable; the queue reports closed once
    /// they are drained. Closing twice returns [`RoomError::Closed`].
    pub async fn close(&self) -> Result<(), RoomError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(RoomError::Closed);
        }

        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(error) = worker.await {
                warn!(room = %self.name, %error, "delivery task ended abnormally");
            }
        }

        debug!(room = %self.name, "room closed");
        Ok(())
    }

    /// Removes ourselves from the roster, then closes.
    pub async fn leave(&self) -> Result<(), RoomError> {
        if self.is_closed() {
            return Err(RoomError::Closed);
        }
        self.roster.write().remove(&self.local_peer);
        self.close().await?;
        info!(room = %self.name, "left room");
        Ok(())
    }
}

impl Room<ChatMessage> {
    /// Publishes `text` to everyone in the room under our id and nickname.
    pub async fn publish(&self, text: &str) -> Result<(), RoomError> {
        let message = ChatMessage::new(text, &self.local_peer, self.nickname.as_str());
        self.send(&message).await
    }
}

impl<M: WireMessage> Drop for Room<M> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_delivery<M: WireMessage>(
    room: String,
    local_peer: PeerId,
    mut subscription: broadcast::Receiver<Delivery>,
    roster: Roster,
    queue: mpsc::Sender<M>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = select! {
            biased;
            _ = cancel.cancelled() => break,
            received = subscription.recv() => match received {
                Ok(delivery) => delivery,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%room, skipped, "room subscription lagged, messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let message = match M::decode(&delivery.data) {
            Ok(message) => message,
            Err(error) => {
                debug!(%room, origin = %delivery.origin, %error, "dropping undecodable payload");
                continue;
            }
        };

        if delivery.origin == local_peer {
            continue;
        }

        roster.write().insert(delivery.origin);

        select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = queue.send(message) => {
                if sent.is_err() {
                    debug!(%room, "room consumer went away");
                    break;
                }
            }
        }
    }

    debug!(%room, "delivery task stopped");
}
