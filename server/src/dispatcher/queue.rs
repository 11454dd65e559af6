use super::{Dispatcher, Session};
use crate::db;
use crate::error::DispatchError;
use crate::hub::Route;
use crate::store::StoreOp;
use log::debug;
use shared::packets::{
    QueuePacket, QueueRemovePacket, QueueUpdateHackerPacket, QueueUpdateSponsorPacket,
};
use shared::{Packet, QueueSubscriber, Role, StoreRecord};

impl Dispatcher {
    pub(super) async fn queue_join(
        &self,
        session: &mut Session,
        packet: QueuePacket,
    ) -> Result<(), DispatchError> {
        let character = session.authenticated()?.clone();
        let sponsor_id = packet.sponsor_id;
        if sponsor_id.is_empty() {
            return Err(DispatchError::Rejected("missing sponsor"));
        }

        let queue = db::hacker_queue(&sponsor_id);
        let waiting = self.store().lrange(&queue, 0, -1).await?;
        if waiting.contains(&character.id) {
            debug!("{} is already queued for {}", character.id, sponsor_id);
            return Ok(());
        }

        let entry = QueueSubscriber::from(&character);
        self.store()
            .exec(vec![
                StoreOp::lrem(queue.clone(), character.id.clone()),
                StoreOp::rpush(queue, character.id.clone()),
                StoreOp::hset_one(
                    db::character(&character.id),
                    "queueId",
                    sponsor_id.clone(),
                ),
                StoreOp::hset(db::subscriber(&character.id), entry.to_fields()),
            ])
            .await?;

        if let Some(character) = session.character.as_mut() {
            character.queue_id = Some(sponsor_id.clone());
        }
        self.broadcast_queue(&sponsor_id).await
    }

    /// Takes a hacker off a queue. When a sponsor does it the hacker is
    /// sent the sponsor's meeting link.
    pub(super) async fn queue_remove(
        &self,
        session: &mut Session,
        packet: QueueRemovePacket,
    ) -> Result<(), DispatchError> {
        let remover = session.authenticated()?.clone();
        let QueueRemovePacket {
            sponsor_id,
            character_id,
        } = packet;

        self.store()
            .exec(vec![
                StoreOp::lrem(db::hacker_queue(&sponsor_id), character_id.clone()),
                StoreOp::hset_one(db::character(&character_id), "queueId", ""),
            ])
            .await?;

        if character_id == remover.id {
            if let Some(character) = session.character.as_mut() {
                character.queue_id = None;
            }
        }

        self.broadcast_queue(&sponsor_id).await?;

        if remover.role == Role::SponsorRep && character_id != remover.id {
            let url = self.store().hget(&db::sponsor(&sponsor_id), "url").await?;
            let update = Packet::QueueUpdateHacker(QueueUpdateHackerPacket {
                sponsor_id,
                position: 0,
                url,
            });
            self.hub
                .send_to(Route::character(character_id), &update)
                .await?;
        }
        Ok(())
    }

    pub(super) async fn queue_subscribe(
        &self,
        session: &mut Session,
        packet: QueuePacket,
    ) -> Result<(), DispatchError> {
        let id = session.authenticated()?.id.clone();
        self.store()
            .exec(vec![StoreOp::sadd(
                db::queue_subscribed(&packet.sponsor_id),
                id,
            )])
            .await?;
        self.broadcast_queue(&packet.sponsor_id).await
    }

    pub(super) async fn queue_unsubscribe(
        &self,
        session: &mut Session,
        packet: QueuePacket,
    ) -> Result<(), DispatchError> {
        let id = session.authenticated()?.id.clone();
        self.store()
            .exec(vec![StoreOp::srem(
                db::queue_subscribed(&packet.sponsor_id),
                id,
            )])
            .await?;
        Ok(())
    }

    /// Sends every queued hacker their position and every subscribed
    /// sponsor the full queue.
    async fn broadcast_queue(&self, sponsor_id: &str) -> Result<(), DispatchError> {
        let subscribers = db::load_queue(self.store(), sponsor_id).await?;

        for (index, hacker) in subscribers.iter().enumerate() {
            let update = Packet::QueueUpdateHacker(QueueUpdateHackerPacket {
                sponsor_id: sponsor_id.to_string(),
                position: index + 1,
                url: None,
            });
            self.hub
                .send_to(Route::character(hacker.id.as_str()), &update)
                .await?;
        }

        let update = Packet::QueueUpdateSponsor(QueueUpdateSponsorPacket {
            sponsor_id: sponsor_id.to_string(),
            subscribers,
        });
        for sponsor in self
            .store()
            .smembers(&db::queue_subscribed(sponsor_id))
            .await?
        {
            self.hub.send_to(Route::character(sponsor), &update).await?;
        }
        Ok(())
    }
}
