//! One running participant: rooms, directory, message log and file drops
//! composed behind a single handle that the console and HTTP frontends share.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use chrono::Local;
use libp2p::PeerId;
use parking_lot::Mutex as SyncMutex;
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    cli::NodeArgs,
    directory::{RoomDirectory, ADVERTISE_INTERVAL},
    discovery::{run_dispatcher, DISCOVERY_QUEUE_CAPACITY},
    error::{NodeError, RoomError},
    identity::NodeIdentity,
    message::ChatMessage,
    room::{Room, RoomManager},
    swarm::{build_swarm, spawn_swarm, StreamControl},
    transfer::{send_file, StreamOpener, TransferReport},
};

// Delivered messages buffered for live viewers such as the console.
const DELIVERY_FANOUT_CAPACITY: usize = 256;

/// Everything said in the current session, in memory and optionally on disk.
pub struct MessageLog {
    lines: SyncMutex<Vec<String>>,
    disk: Option<PathBuf>,
}

impl MessageLog {
    pub fn new(disk: Option<PathBuf>) -> Self {
        Self {
            lines: SyncMutex::new(Vec::new()),
            disk,
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn record_sent(&self, text: &str) {
        self.lines.lock().push(text.to_string());
    }

    /// Keeps the message in memory and appends it to the disk log, if any.
    /// A failing disk write is logged and does not lose the in-memory line.
    pub async fn record_received(&self, message: &ChatMessage) {
        self.lines
            .lock()
            .push(format!("{}: {}", message.sender_nick, message.text));

        let Some(path) = self.disk.as_deref() else {
            return;
        };
        if let Err(error) = append_line(path, &disk_line(message)).await {
            warn!(path = %path.display(), %error, "failed to append to message log");
        }
    }
}

fn disk_line(message: &ChatMessage) -> String {
    format!(
        "Received message at {} from {}: {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S%.3f %:z"),
        message.sender_nick,
        message.text
    )
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await
}

struct ActiveRoom {
    room: Arc<Room<ChatMessage>>,
    pump: Option<JoinHandle<()>>,
}

pub struct Node {
    rooms: RoomManager,
    directory: Arc<RoomDirectory>,
    current: watch::Sender<Option<String>>,
    active: Mutex<Option<ActiveRoom>>,
    opener: Arc<dyn StreamOpener>,
    log: Arc<MessageLog>,
    deliveries: broadcast::Sender<ChatMessage>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Builds a node on top of an existing room manager. Joins the directory
    /// and starts advertising whichever room becomes current.
    pub async fn new(
        rooms: RoomManager,
        opener: Arc<dyn StreamOpener>,
        log_file: Option<PathBuf>,
    ) -> Result<Self, RoomError> {
        let directory = Arc::new(RoomDirectory::join(&rooms).await?);
        let (current, watcher) = watch::channel(None);
        let advertiser = Arc::clone(&directory).spawn_advertiser(watcher, ADVERTISE_INTERVAL);
        let (deliveries, _) = broadcast::channel(DELIVERY_FANOUT_CAPACITY);

        Ok(Self {
            rooms,
            directory,
            current,
            active: Mutex::new(None),
            opener,
            log: Arc::new(MessageLog::new(log_file)),
            deliveries,
            tasks: vec![advertiser],
        })
    }

    /// Brings up the full libp2p stack for `args`: identity, swarm, discovery
    /// dispatcher and file receiver.
    pub async fn start(args: &NodeArgs) -> anyhow::Result<Self> {
        let identity = NodeIdentity::generate(args.port);
        let nickname = args.nickname();
        info!(peer = %identity.peer_id(), %nickname, "starting node");

        let swarm = build_swarm(&identity, &args.scope)?;
        let streams = StreamControl::new(&swarm);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (discovery_tx, discovery_rx) = mpsc::channel(DISCOVERY_QUEUE_CAPACITY);
        let (handle, swarm_task) = spawn_swarm(swarm, inbound_tx, discovery_tx);

        let dispatcher = tokio::spawn(run_dispatcher(
            identity.peer_id(),
            discovery_rx,
            handle.clone(),
        ));
        let receiver = streams.spawn_file_receiver(args.download_dir.clone())?;

        let rooms = RoomManager::new(identity.peer_id(), nickname, Arc::new(handle), inbound_rx);
        let mut node = Self::new(rooms, Arc::new(streams), Some(args.log_file.clone()))
            .await
            .context("join room directory")?;
        node.tasks.extend([swarm_task, dispatcher, receiver]);

        info!(address = %identity.connection_string(), "node ready");
        Ok(node)
    }

    pub fn local_peer(&self) -> PeerId {
        self.rooms.local_peer()
    }

    pub fn nickname(&self) -> &str {
        self.rooms.nickname()
    }

    /// Joins `name`, leaving whatever room we were in before.
    pub async fn join_room(&self, name: &str) -> Result<String, NodeError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.current.send_replace(None);
            leave(previous).await;
        }

        let mut room = self.rooms.join(name).await?;
        let room_name = room.name().to_string();
        let pump = room.take_messages().map(|messages| {
            tokio::spawn(pump_messages(
                messages,
                Arc::clone(&self.log),
                self.deliveries.clone(),
            ))
        });

        *active = Some(ActiveRoom {
            room: Arc::new(room),
            pump,
        });
        self.current.send_replace(Some(room_name.clone()));
        Ok(room_name)
    }

    pub async fn leave_room(&self) -> Result<(), NodeError> {
        let previous = self.active.lock().await.take();
        match previous {
            Some(previous) => {
                self.current.send_replace(None);
                leave(previous).await;
                Ok(())
            }
            None => Err(NodeError::NoActiveRoom),
        }
    }

    pub async fn current_room(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.room.name().to_string())
    }

    async fn room(&self) -> Result<Arc<Room<ChatMessage>>, NodeError> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.room))
            .ok_or(NodeError::NoActiveRoom)
    }

    /// Publishes `text` in the current room and records it in the log.
    pub async fn send_message(&self, text: &str) -> Result<(), NodeError> {
        let room = self.room().await?;
        room.publish(text).await?;
        self.log.record_sent(text);
        Ok(())
    }

    pub async fn send_file(&self, path: &Path) -> Result<TransferReport, NodeError> {
        let room = self.room().await?;
        Ok(send_file(&room, self.opener.as_ref(), path).await?)
    }

    pub async fn active_peers(&self) -> Result<Vec<PeerId>, NodeError> {
        Ok(self.room().await?.active_peers())
    }

    pub fn available_rooms(&self) -> Vec<String> {
        self.directory.rooms()
    }

    pub fn messages(&self) -> Vec<String> {
        self.log.lines()
    }

    /// Live feed of messages delivered in whichever room is current.
    pub fn subscribe_deliveries(&self) -> broadcast::Receiver<ChatMessage> {
        self.deliveries.subscribe()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn leave(active: ActiveRoom) {
    let name = active.room.name().to_string();
    if let Err(error) = active.room.leave().await {
        debug!(room = %name, %error, "room already closed");
    }
    // The pump ends once the closed queue is drained.
    if let Some(pump) = active.pump {
        if let Err(error) = pump.await {
            warn!(room = %name, %error, "message pump ended abnormally");
        }
    }
}

async fn pump_messages(
    mut messages: mpsc::Receiver<ChatMessage>,
    log: Arc<MessageLog>,
    deliveries: broadcast::Sender<ChatMessage>,
) {
    while let Some(message) = messages.recv().await {
        log.record_received(&message).await;
        // Nobody watching live is fine; the log already has it.
        let _ = deliveries.send(message);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::{error::TransferError, pubsub::LocalHub, transfer::TransferStream};

    struct NoStreams;

    #[async_trait]
    impl StreamOpener for NoStreams {
        async fn open(&self, peer: PeerId) -> Result<TransferStream, TransferError> {
            Err(TransferError::OpenStream {
                peer,
                reason: "no streams in this test".into(),
            })
        }
    }

    async fn node(hub: &LocalHub, nickname: &str, log_file: Option<PathBuf>) -> Node {
        let peer = PeerId::random();
        let (link, inbound) = hub.attach(peer);
        let rooms = RoomManager::new(peer, nickname, Arc::new(link), inbound);
        Node::new(rooms, Arc::new(NoStreams), log_file)
            .await
            .expect("node")
    }

    #[tokio::test]
    async fn sending_without_a_room_fails() {
        let hub = LocalHub::new();
        let alice = node(&hub, "alice", None).await;

        assert!(matches!(
            alice.send_message("hello?").await,
            Err(NodeError::NoActiveRoom)
        ));
        assert!(matches!(alice.leave_room().await, Err(NodeError::NoActiveRoom)));
    }

    #[tokio::test]
    async fn received_messages_reach_log_and_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("logs.txt");
        let hub = LocalHub::new();
        let alice = node(&hub, "alice", None).await;
        let bob = node(&hub, "bob", Some(log_path.clone())).await;

        alice.join_room("kitchen").await.expect("alice joins");
        bob.join_room("kitchen").await.expect("bob joins");
        let mut live = bob.subscribe_deliveries();

        alice.send_message("dinner is ready").await.expect("send");

        let delivered = timeout(Duration::from_secs(1), live.recv())
            .await
            .expect("delivery in time")
            .expect("delivery");
        assert_eq!(delivered.text, "dinner is ready");
        assert_eq!(bob.messages(), vec!["alice: dinner is ready"]);
        assert_eq!(alice.messages(), vec!["dinner is ready"]);

        timeout(Duration::from_secs(1), async {
            loop {
                let written = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
                if written.contains("from alice: dinner is ready") {
                    assert!(written.starts_with("Received message at "));
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("disk log written in time");
    }

    #[tokio::test]
    async fn joining_another_room_leaves_the_first() {
        let hub = LocalHub::new();
        let alice = node(&hub, "alice", None).await;
        let bob = node(&hub, "bob", None).await;

        alice.join_room("kitchen").await.expect("join kitchen");
        alice.join_room("garden").await.expect("join garden");
        bob.join_room("kitchen").await.expect("bob joins");

        bob.send_message("still there?").await.expect("send");
        sleep(Duration::from_millis(100)).await;

        assert_eq!(alice.current_room().await.as_deref(), Some("garden"));
        assert!(alice.messages().is_empty());
    }

    #[tokio::test]
    async fn failed_join_stops_advertising_the_old_room() {
        let hub = LocalHub::new();
        let alice = node(&hub, "alice", None).await;

        alice.join_room("kitchen").await.expect("join kitchen");
        assert_eq!(alice.current.borrow().as_deref(), Some("kitchen"));

        let result = alice.join_room("   ").await;

        assert!(matches!(result, Err(NodeError::Room(RoomError::EmptyName))));
        assert_eq!(alice.current_room().await, None);
        assert_eq!(*alice.current.borrow(), None);
    }
}
