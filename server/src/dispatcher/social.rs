use super::{Dispatcher, Session};
use crate::db;
use crate::error::DispatchError;
use crate::hub::Route;
use crate::store::StoreOp;
use crate::utils::{get_timestamp, new_id};
use log::{debug, info};
use shared::packets::{
    AchievementNotificationPacket, AchievementsPacket, EventPacket, FriendRequestPacket,
    FriendUpdatePacket, GetMessagesPacket, MessagePacket, MessagesPacket, MESSAGE_HISTORY_LIMIT,
};
use shared::{conversation_key, is_ascii_text, Message, Packet, StoreRecord};
use std::collections::HashMap;

const EVENTS_ACHIEVEMENT: &str = "events";

impl Dispatcher {
    pub(super) async fn send_message(
        &self,
        session: &mut Session,
        packet: MessagePacket,
    ) -> Result<(), DispatchError> {
        let from = session.authenticated()?.id.clone();
        if packet.to.is_empty() {
            return Err(DispatchError::Rejected("message without recipient"));
        }
        if !is_ascii_text(&packet.message.text) {
            return Err(DispatchError::Rejected("message must be ascii"));
        }

        let message = Message {
            id: new_id(),
            from: from.clone(),
            to: packet.to.clone(),
            text: packet.message.text,
            timestamp: get_timestamp(),
        };

        self.store()
            .exec(vec![
                StoreOp::hset(db::message(&message.id), message.to_fields()),
                StoreOp::rpush(conversation_key(&from, &packet.to), message.id.clone()),
            ])
            .await?;

        self.hub
            .publish(&Packet::Message(MessagePacket {
                from,
                to: packet.to,
                message,
            }))
            .await?;
        Ok(())
    }

    pub(super) async fn get_messages(
        &self,
        session: &mut Session,
        packet: GetMessagesPacket,
    ) -> Result<(), DispatchError> {
        let id = session.authenticated()?.id.clone();
        let conversation = conversation_key(&id, &packet.recipient);
        let messages =
            db::load_messages(self.store(), &conversation, MESSAGE_HISTORY_LIMIT).await?;

        session.reply(&Packet::Messages(MessagesPacket {
            messages,
            recipient: packet.recipient,
        }))
    }

    /// Records a request, or accepts one when the recipient had already
    /// asked the sender.
    pub(super) async fn friend_request(
        &self,
        session: &mut Session,
        packet: FriendRequestPacket,
    ) -> Result<(), DispatchError> {
        let sender = session.authenticated()?.id.clone();
        let recipient = packet.recipient_id;
        if recipient.is_empty() || recipient == sender {
            return Err(DispatchError::Rejected("invalid friend request"));
        }

        let accepting = self
            .store()
            .sismember(&db::requests(&sender), &recipient)
            .await?;

        if accepting {
            self.store()
                .exec(vec![
                    StoreOp::srem(db::requests(&sender), recipient.clone()),
                    StoreOp::sadd(db::friends(&sender), recipient.clone()),
                    StoreOp::sadd(db::friends(&recipient), sender.clone()),
                ])
                .await?;
            info!("{} and {} are now friends", sender, recipient);

            for (id, friend_id) in [(&sender, &recipient), (&recipient, &sender)] {
                let update = Packet::FriendUpdate(FriendUpdatePacket {
                    id: id.clone(),
                    friend_id: friend_id.clone(),
                    pending: false,
                });
                self.hub.send_to(Route::character(id.as_str()), &update).await?;
            }
        } else {
            self.store()
                .exec(vec![StoreOp::sadd(db::requests(&recipient), sender.clone())])
                .await?;

            let update = Packet::FriendUpdate(FriendUpdatePacket {
                id: recipient.clone(),
                friend_id: sender,
                pending: true,
            });
            self.hub.send_to(Route::character(recipient), &update).await?;
        }
        Ok(())
    }

    /// Marks attendance at a known event. The `events` achievement is
    /// announced once, when the count of distinct events reaches the goal.
    pub(super) async fn attend_event(
        &self,
        session: &mut Session,
        packet: EventPacket,
    ) -> Result<(), DispatchError> {
        let id = session.authenticated()?.id.clone();
        if !self.store().sismember(db::EVENTS, &packet.id).await? {
            return Err(DispatchError::Rejected("unknown event"));
        }
        // Only the attendance that adds the event may count it
        if !self.store().sadd(&db::attended(&id), &packet.id).await? {
            debug!("Character {} already attended {}", id, packet.id);
            return Ok(());
        }

        self.store()
            .exec(vec![StoreOp::sadd(db::attendees(&packet.id), id.clone())])
            .await?;

        let attended = self
            .store()
            .hincrby(&db::achievements(&id), EVENTS_ACHIEVEMENT, 1)
            .await?;
        if attended == self.achievements.num_events {
            session.reply(&Packet::AchievementNotification(
                AchievementNotificationPacket {
                    achievement: EVENTS_ACHIEVEMENT.to_string(),
                },
            ))?;
        }
        Ok(())
    }

    pub(super) async fn get_achievements(&self, session: &mut Session) -> Result<(), DispatchError> {
        let id = session.authenticated()?.id.clone();
        let achievements: HashMap<String, i64> = self
            .store()
            .hgetall(&db::achievements(&id))
            .await?
            .into_iter()
            .filter_map(|(name, value)| value.parse().ok().map(|count| (name, count)))
            .collect();

        session.reply(&Packet::Achievements(AchievementsPacket { id, achievements }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn test_message_reaches_both_sides_and_history() {
        let mut harness = Harness::new();
        let (mut alice, mut alice_rx) = harness.join("Alice").await;
        let (mut bob, mut bob_rx) = harness.join("Bob").await;
        next_packet(&mut alice_rx).await;
        let alice_id = alice.character.clone().unwrap().id;
        let bob_id = bob.character.clone().unwrap().id;

        let request = format!(
            r#"{{"type":"message","to":"{bob_id}","message":{{"text":"hey bob"}}}}"#
        );
        harness.send(&mut alice, &request).await;

        for rx in [&mut bob_rx, &mut alice_rx] {
            match next_packet(rx).await {
                Packet::Message(packet) => {
                    assert_eq!(packet.from, alice_id);
                    assert_eq!(packet.message.text, "hey bob");
                    assert!(packet.message.timestamp > 0);
                }
                other => panic!("expected message, got {:?}", other),
            }
        }

        // Either side reads the same conversation
        let history = format!(r#"{{"type":"get_messages","recipient":"{alice_id}"}}"#);
        harness.send(&mut bob, &history).await;
        match next_packet(&mut bob_rx).await {
            Packet::Messages(packet) => {
                assert_eq!(packet.recipient, alice_id);
                assert_eq!(packet.messages.len(), 1);
                assert_eq!(packet.messages[0].to, bob_id);
            }
            other => panic!("expected messages, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_friend_request_then_accept() {
        let mut harness = Harness::new();
        let (mut alice, mut alice_rx) = harness.join("Alice").await;
        let (mut bob, mut bob_rx) = harness.join("Bob").await;
        next_packet(&mut alice_rx).await;
        let alice_id = alice.character.clone().unwrap().id;
        let bob_id = bob.character.clone().unwrap().id;

        let ask = format!(r#"{{"type":"friend_request","recipientId":"{bob_id}"}}"#);
        harness.send(&mut alice, &ask).await;
        assert_eq!(
            next_packet(&mut bob_rx).await,
            Packet::FriendUpdate(FriendUpdatePacket {
                id: bob_id.clone(),
                friend_id: alice_id.clone(),
                pending: true,
            })
        );

        let accept = format!(r#"{{"type":"friend_request","recipientId":"{alice_id}"}}"#);
        harness.send(&mut bob, &accept).await;
        assert!(matches!(
            next_packet(&mut alice_rx).await,
            Packet::FriendUpdate(update) if !update.pending && update.friend_id == bob_id
        ));
        assert!(matches!(
            next_packet(&mut bob_rx).await,
            Packet::FriendUpdate(update) if !update.pending && update.friend_id == alice_id
        ));

        let store = &harness.store;
        assert!(store.sismember(&db::friends(&alice_id), &bob_id).await.unwrap());
        assert!(store.sismember(&db::friends(&bob_id), &alice_id).await.unwrap());
        assert!(store.smembers(&db::requests(&bob_id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events_achievement_fires_once() {
        let mut harness = Harness::new();
        let mut ops = Vec::new();
        for i in 0..6 {
            ops.push(StoreOp::sadd(db::EVENTS, format!("talk{i}")));
        }
        harness.store.exec(ops).await.unwrap();
        let (mut alice, mut rx) = harness.join("Alice").await;

        for i in 0..4 {
            let attend = format!(r#"{{"type":"event","id":"talk{i}"}}"#);
            harness.send(&mut alice, &attend).await;
            // Repeats do not count
            harness.send(&mut alice, &attend).await;
        }
        assert_silent(&mut rx).await;

        harness
            .send(&mut alice, r#"{"type":"event","id":"talk4"}"#)
            .await;
        assert_eq!(
            next_packet(&mut rx).await,
            Packet::AchievementNotification(AchievementNotificationPacket {
                achievement: "events".to_string(),
            })
        );

        harness
            .send(&mut alice, r#"{"type":"event","id":"talk5"}"#)
            .await;
        harness
            .send(&mut alice, r#"{"type":"event","id":"unknown"}"#)
            .await;
        assert_silent(&mut rx).await;

        harness
            .send(&mut alice, r#"{"type":"get_achievements"}"#)
            .await;
        match next_packet(&mut rx).await {
            Packet::Achievements(packet) => assert_eq!(packet.achievements["events"], 6),
            other => panic!("expected achievements, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_simultaneous_attendance_counts_once() {
        let mut harness = Harness::new();
        let ops = (0..5)
            .map(|i| StoreOp::sadd(db::EVENTS, format!("talk{i}")))
            .collect();
        harness.store.exec(ops).await.unwrap();

        // The same character connected twice
        let (mut alice, mut alice_rx) = harness.join("Alice").await;
        let (mut twin, mut twin_rx) = harness.connect().await;
        twin.character = alice.character.clone();
        let alice_id = alice.character.clone().unwrap().id;

        for i in 0..5 {
            let attend = format!(r#"{{"type":"event","id":"talk{i}"}}"#);
            tokio::join!(
                harness.send(&mut alice, &attend),
                harness.send(&mut twin, &attend)
            );
        }

        assert_eq!(
            harness
                .store
                .hget(&db::achievements(&alice_id), "events")
                .await
                .unwrap()
                .as_deref(),
            Some("5")
        );

        let mut notifications = 0;
        for rx in [&mut alice_rx, &mut twin_rx] {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            while let Ok(payload) = rx.try_recv() {
                assert!(matches!(
                    Packet::decode(&payload).unwrap(),
                    Packet::AchievementNotification(_)
                ));
                notifications += 1;
            }
        }
        assert_eq!(notifications, 1);
    }
}
