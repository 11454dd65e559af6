//! Leader election
//!
//! Every ingest names its store connection with the same label. Once per
//! interval each ingest lists the store's connections and treats the
//! labelled connection with the lowest id, the oldest one, as leader. Only
//! the leader runs the [`LeaderDuty`]s for that tick. Nothing is persisted:
//! when the leader goes away the next oldest ingest takes over on its next
//! tick.

use crate::db;
use crate::hub::HubHandle;
use crate::store::{Store, StoreError, StoreOp};
use crate::utils::get_timestamp;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use shared::packets::SongEndedPacket;
use shared::Packet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

pub type DutyError = Box<dyn std::error::Error + Send + Sync>;

/// Periodic work that must run on exactly one ingest.
#[async_trait]
pub trait LeaderDuty: Send + Sync {
    fn name(&self) -> &'static str;
    async fn perform(&self) -> Result<(), DutyError>;
}

/// Connection id and name of every entry in a `CLIENT LIST` reply.
///
/// Lines without a numeric id are skipped.
pub fn parse_client_list(listing: &str) -> Vec<(i64, String)> {
    listing
        .lines()
        .filter_map(|line| {
            let mut id = None;
            let mut name = String::new();

            for field in line.split_whitespace() {
                match field.split_once('=') {
                    Some(("id", value)) => id = value.parse::<i64>().ok(),
                    Some(("name", value)) => name = value.to_string(),
                    _ => {}
                }
            }

            id.map(|id| (id, name))
        })
        .collect()
}

/// The leader's connection id: the lowest id carrying `label`.
pub fn elect(listing: &str, label: &str) -> Option<i64> {
    parse_client_list(listing)
        .into_iter()
        .filter(|(_, name)| name == label)
        .map(|(id, _)| id)
        .min()
}

pub struct LeaderElection {
    store: Arc<dyn Store>,
    label: String,
    period: Duration,
    duties: Vec<Arc<dyn LeaderDuty>>,
    leading: bool,
}

impl LeaderElection {
    pub fn new(store: Arc<dyn Store>, label: impl Into<String>, period: Duration) -> Self {
        Self {
            store,
            label: label.into(),
            period,
            duties: Vec::new(),
            leading: false,
        }
    }

    pub fn with_duty(mut self, duty: Arc<dyn LeaderDuty>) -> Self {
        self.duties.push(duty);
        self
    }

    pub fn is_leader(&self) -> bool {
        self.leading
    }

    /// Labels this ingest's store connection so peers can see it.
    pub async fn announce(&self) -> Result<(), StoreError> {
        self.store.set_client_name(&self.label).await
    }

    /// Recomputes leadership and, when leading, runs every duty once.
    ///
    /// Returns `None` when the connection listing could not be used, in
    /// which case the tick is skipped.
    pub async fn tick(&mut self) -> Option<bool> {
        let listing = match self.store.client_list().await {
            Ok(listing) => listing,
            Err(e) => {
                warn!("Skipping leader election: {}", e);
                return None;
            }
        };

        let Some(leader) = elect(&listing, &self.label) else {
            debug!("No connection labelled {}; skipping tick", self.label);
            return None;
        };

        let own_id = match self.store.client_id().await {
            Ok(id) => id,
            Err(e) => {
                warn!("Skipping leader election: {}", e);
                return None;
            }
        };

        let leading = leader == own_id;
        if leading != self.leading {
            if leading {
                info!("This ingest ({}) is now the leader", own_id);
            } else {
                info!("Ingest {} took over leadership from {}", leader, own_id);
            }
            self.leading = leading;
        }

        if leading {
            for duty in &self.duties {
                if let Err(e) = duty.perform().await {
                    error!("Leader duty {} failed: {}", duty.name(), e);
                }
            }
        }

        Some(leading)
    }

    pub async fn run(mut self) {
        if let Err(e) = self.announce().await {
            error!("Failed to label store connection: {}", e);
        }

        let mut timer = interval(self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            timer.tick().await;
            self.tick().await;
        }
    }
}

/// Advances the jukebox: once the song at the head of the queue has played
/// for its full duration it is removed and everyone is told it ended.
pub struct SongRotation {
    store: Arc<dyn Store>,
    hub: HubHandle,
}

impl SongRotation {
    pub fn new(store: Arc<dyn Store>, hub: HubHandle) -> Self {
        Self { store, hub }
    }
}

#[async_trait]
impl LeaderDuty for SongRotation {
    fn name(&self) -> &'static str {
        "song rotation"
    }

    async fn perform(&self) -> Result<(), DutyError> {
        let Some(current) = self.store.lrange(db::SONGS, 0, 0).await?.pop() else {
            return Ok(());
        };

        let now = get_timestamp();
        let started = self
            .store
            .get(db::SONGS_STARTED)
            .await?
            .and_then(|value| value.parse::<u64>().ok());

        let Some(started) = started else {
            // Clock for the current song starts now
            self.store
                .exec(vec![StoreOp::set(db::SONGS_STARTED, now.to_string())])
                .await?;
            return Ok(());
        };

        let duration_ms = db::load_song(self.store.as_ref(), &current)
            .await?
            .map_or(0, |song| song.duration.saturating_mul(1000));

        if now < started.saturating_add(duration_ms) {
            return Ok(());
        }

        self.store.lpop(db::SONGS).await?;
        let next = if self.store.lrange(db::SONGS, 0, 0).await?.is_empty() {
            StoreOp::del(db::SONGS_STARTED)
        } else {
            StoreOp::set(db::SONGS_STARTED, now.to_string())
        };
        self.store.exec(vec![next]).await?;

        info!("Song {} ended", current);
        self.hub
            .publish(&Packet::SongEnded(SongEndedPacket { id: current }))
            .await?;
        Ok(())
    }
}
