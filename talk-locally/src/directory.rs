//! Which rooms exist on the network right now, roughly.
//!
//! Every peer sitting in a room periodically shouts that room's name on the
//! reserved directory room. Everything heard is kept forever; the listing is
//! advisory and never shrinks.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use parking_lot::RwLock;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, trace};

use crate::{
    error::RoomError,
    message::RoomAdvert,
    room::{Room, RoomManager},
};

pub const ADVERTISE_INTERVAL: Duration = Duration::from_secs(5);

/// Grow-only set of advertised room names.
#[derive(Debug, Default)]
pub struct DirectorySet {
    rooms: RwLock<BTreeSet<String>>,
}

impl DirectorySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the name was not listed before.
    pub fn insert(&self, room_name: &str) -> bool {
        self.rooms.write().insert(room_name.to_string())
    }

    /// Sorted copy of every name seen so far.
    pub fn snapshot(&self) -> Vec<String> {
        self.rooms.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.read().is_empty()
    }
}

pub struct RoomDirectory {
    room: Room<RoomAdvert>,
    rooms: Arc<DirectorySet>,
}

impl RoomDirectory {
    /// Joins the directory room and starts collecting advertisements.
    pub async fn join(manager: &RoomManager) -> Result<Self, RoomError> {
        let mut room = manager.join_directory().await?;
        let rooms = Arc::new(DirectorySet::new());

        if let Some(adverts) = room.take_messages() {
            tokio::spawn(collect_adverts(adverts, Arc::clone(&rooms)));
        }

        Ok(Self { room, rooms })
    }

    /// Sorted snapshot of the known room names.
    pub fn rooms(&self) -> Vec<String> {
        self.rooms.snapshot()
    }

    pub fn set(&self) -> &Arc<DirectorySet> {
        &self.rooms
    }

    pub async fn advertise(&self, room_name: &str) -> Result<(), RoomError> {
        self.room.send(&RoomAdvert(room_name.to_string())).await
    }

    /// Advertises whatever `current` holds every `every`, for as long as the
    /// directory lives. Nothing is sent while no room is active.
    pub fn spawn_advertiser(
        self: Arc<Self>,
        mut current: watch::Receiver<Option<String>>,
        every: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let room_name = current.borrow_and_update().clone();
                let Some(room_name) = room_name else {
                    continue;
                };
                if let Err(error) = self.advertise(&room_name).await {
                    debug!(room = %room_name, %error, "room advertisement failed");
                    if matches!(error, RoomError::Closed) {
                        break;
                    }
                }
            }
        })
    }
}

async fn collect_adverts(mut adverts: mpsc::Receiver<RoomAdvert>, rooms: Arc<DirectorySet>) {
    while let Some(advert) = adverts.recv().await {
        if rooms.insert(advert.room_name()) {
            debug!(room = advert.room_name(), "discovered room");
        } else {
            trace!(room = advert.room_name(), "room already listed");
        }
    }
}
