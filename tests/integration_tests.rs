//! Integration tests for the ingest server
//!
//! These tests wire real hubs, dispatchers and replicators together over
//! the in-memory store. Several `MemoryStore` connections sharing one
//! backend stand in for several ingests sharing one Redis.

use assert_approx_eq::assert_approx_eq;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use server::config::Settings;
use server::db;
use server::dispatcher::{Dispatcher, Session};
use server::hub::{Hub, HubHandle};
use server::leader::LeaderElection;
use server::replication::Replicator;
use server::services::Services;
use server::store::{MemoryStore, Store, StoreOp};
use shared::packets::{ChatPacket, QueueUpdateHackerPacket};
use shared::{Packet, Role};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;

/// One ingest: hub, dispatcher and replicator on its own store connection.
struct Ingest {
    store: Arc<MemoryStore>,
    hub: HubHandle,
    dispatcher: Arc<Dispatcher>,
    next_client: u64,
}

struct Client {
    session: Session,
    rx: UnboundedReceiver<Vec<u8>>,
}

impl Client {
    fn id(&self) -> String {
        self.session
            .character
            .as_ref()
            .map(|character| character.id.clone())
            .unwrap_or_default()
    }

    async fn recv(&mut self) -> Packet {
        let payload = timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .expect("timed out waiting for packet")
            .expect("connection closed");
        Packet::decode(&payload).unwrap()
    }

    /// Waits for in-flight deliveries, then throws them away.
    async fn drain(&mut self) {
        sleep(Duration::from_millis(50)).await;
        while self.rx.try_recv().is_ok() {}
    }

    async fn assert_silent(&mut self) {
        sleep(Duration::from_millis(50)).await;
        if let Ok(payload) = self.rx.try_recv() {
            panic!("unexpected packet: {}", String::from_utf8_lossy(&payload));
        }
    }
}

/// Signs a session token the way the account service does.
fn session_token(character_id: &str) -> String {
    encode(
        &Header::default(),
        &json!({ "id": character_id }),
        &EncodingKey::from_secret(b"integration-secret"),
    )
    .unwrap()
}

impl Ingest {
    async fn start(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        let origin = store.client_id().await.unwrap();

        let replicator = Arc::new(Replicator::new(store.clone(), "room", origin));
        let (hub, events) = HubHandle::new(Some(replicator.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            hub.clone(),
            Services::offline("integration-secret"),
            &Settings::default(),
            origin,
        ));

        tokio::spawn(Hub::new(100, events, dispatcher.clone()).run());
        tokio::spawn(replicator.run(hub.clone()));
        // Let the replication subscription land
        sleep(Duration::from_millis(20)).await;

        Self {
            store,
            hub,
            dispatcher,
            next_client: 0,
        }
    }

    async fn connect(&mut self) -> Client {
        self.next_client += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        assert!(self.hub.register(self.next_client, tx.clone()).await);
        Client {
            session: Session::new(self.next_client, tx),
            rx,
        }
    }

    async fn send(&self, client: &mut Client, json: &str) {
        self.dispatcher.dispatch(&mut client.session, json.as_bytes()).await;
    }

    async fn join(&mut self, name: &str) -> Client {
        let mut client = self.connect().await;
        let request = format!(r#"{{"type":"join","name":"{name}"}}"#);
        self.send(&mut client, &request).await;
        assert!(client.session.character.is_some(), "join failed for {name}");
        client.drain().await;
        client
    }

    fn disconnect(&self, client: Client) {
        self.hub.unregister(client.session.client_id);
    }
}

/// END-TO-END SCENARIOS ON ONE INGEST
mod scenario_tests {
    use super::*;

    /// A join is announced to everyone already in the room
    #[tokio::test]
    async fn join_is_announced_to_room() {
        let mut ingest = Ingest::start(MemoryStore::new()).await;
        let mut bob = ingest.join("Bob").await;

        let mut alice = ingest.connect().await;
        ingest
            .send(&mut alice, r#"{"type":"join","name":"Alice"}"#)
            .await;
        let alice_id = alice.id();
        assert!(!alice_id.is_empty());

        match alice.recv().await {
            Packet::Init(init) => {
                assert_eq!(init.room.id, "lobby");
                assert_eq!(init.room.characters[&alice_id].room, "lobby");
            }
            other => panic!("expected init, got {:?}", other),
        }

        match bob.recv().await {
            Packet::Join(join) => {
                let character = join.character.unwrap();
                assert_eq!(character.id, alice_id);
                assert_eq!(character.room, "lobby");
            }
            other => panic!("expected join, got {:?}", other),
        }

        assert!(assert_ok!(
            ingest
                .store
                .sismember(&db::room_characters("lobby"), &alice_id)
                .await
        ));
        assert_eq!(
            assert_ok!(ingest.store.hget(&db::character(&alice_id), "room").await).as_deref(),
            Some("lobby")
        );
    }

    /// A returning character's stored room and membership agree with
    /// what it is shown
    #[tokio::test]
    async fn rejoin_keeps_room_field_and_membership_in_step() {
        let mut ingest = Ingest::start(MemoryStore::new()).await;
        let alice = ingest.join("Alice").await;
        let alice_id = alice.id();
        ingest.disconnect(alice);
        sleep(Duration::from_millis(50)).await;

        let token = session_token(&alice_id);
        let mut again = ingest.connect().await;
        let request = format!(r#"{{"type":"join","token":"{token}"}}"#);
        ingest.send(&mut again, &request).await;

        match again.recv().await {
            Packet::Init(init) => {
                assert!(!init.first_time);
                assert_eq!(init.room.characters[&alice_id].room, "lobby");
            }
            other => panic!("expected init, got {:?}", other),
        }
        assert_eq!(
            assert_ok!(ingest.store.hget(&db::character(&alice_id), "room").await).as_deref(),
            Some("lobby")
        );
        assert!(assert_ok!(
            ingest
                .store
                .sismember(&db::room_characters("lobby"), &alice_id)
                .await
        ));
    }

    /// Chat reaches the sender's room and nowhere else
    #[tokio::test]
    async fn chat_is_room_scoped() {
        let mut ingest = Ingest::start(MemoryStore::new()).await;
        let mut carol = ingest.join("Carol").await;
        ingest
            .send(&mut carol, r#"{"type":"teleport","to":"expo","x":0.5,"y":0.5}"#)
            .await;
        carol.drain().await;

        let mut alice = ingest.join("Alice").await;
        let mut bob = ingest.join("Bob").await;
        alice.drain().await;

        ingest
            .send(&mut alice, r#"{"type":"chat","message":"hi"}"#)
            .await;

        let expected = Packet::Chat(ChatPacket {
            id: alice.id(),
            room: "lobby".to_string(),
            message: "hi".to_string(),
        });
        assert_eq!(alice.recv().await, expected);
        assert_eq!(bob.recv().await, expected);
        carol.assert_silent().await;
    }

    /// Out-of-range teleport coordinates land in the middle of the room
    #[tokio::test]
    async fn teleport_clamps_and_moves_membership() {
        let mut ingest = Ingest::start(MemoryStore::new()).await;
        let mut alice = ingest.join("Alice").await;
        let alice_id = alice.id();

        ingest
            .send(
                &mut alice,
                r#"{"type":"teleport","from":"lobby","to":"expo","x":2,"y":-1}"#,
            )
            .await;

        match alice.recv().await {
            Packet::Init(init) => {
                assert_eq!(init.room.id, "expo");
                let me = &init.room.characters[&alice_id];
                assert_approx_eq!(me.x, 0.5);
                assert_approx_eq!(me.y, 0.5);
            }
            other => panic!("expected init, got {:?}", other),
        }

        let store = &ingest.store;
        assert_eq!(
            store
                .hget(&db::character(&alice_id), "room")
                .await
                .unwrap()
                .as_deref(),
            Some("expo")
        );
        assert!(!store
            .sismember(&db::room_characters("lobby"), &alice_id)
            .await
            .unwrap());
        assert!(store
            .sismember(&db::room_characters("expo"), &alice_id)
            .await
            .unwrap());
    }

    /// A sponsor removing the head of the queue moves everyone up
    #[tokio::test]
    async fn sponsor_queue_removal() {
        let mut ingest = Ingest::start(MemoryStore::new()).await;
        let mut rep = ingest.join("Rep").await;
        if let Some(character) = rep.session.character.as_mut() {
            character.role = Role::SponsorRep;
        }
        ingest
            .send(&mut rep, r#"{"type":"queue_subscribe","sponsorId":"acme"}"#)
            .await;

        let mut h1 = ingest.join("H1").await;
        let mut h2 = ingest.join("H2").await;
        let join = r#"{"type":"queue_join","sponsorId":"acme"}"#;
        ingest.send(&mut h1, join).await;
        ingest.send(&mut h2, join).await;
        for client in [&mut rep, &mut h1, &mut h2] {
            client.drain().await;
        }

        let remove = format!(
            r#"{{"type":"queue_remove","sponsorId":"acme","characterId":"{}"}}"#,
            h1.id()
        );
        ingest.send(&mut rep, &remove).await;

        assert_eq!(
            ingest
                .store
                .lrange(&db::hacker_queue("acme"), 0, -1)
                .await
                .unwrap(),
            vec![h2.id()]
        );
        assert_eq!(
            h2.recv().await,
            Packet::QueueUpdateHacker(QueueUpdateHackerPacket {
                sponsor_id: "acme".to_string(),
                position: 1,
                url: None,
            })
        );
        match rep.recv().await {
            Packet::QueueUpdateSponsor(update) => assert_eq!(update.subscribers.len(), 1),
            other => panic!("expected queue_update_sponsor, got {:?}", other),
        }
        assert!(matches!(
            h1.recv().await,
            Packet::QueueUpdateHacker(update) if update.position == 0
        ));
    }

    /// Friends hear about a disconnect and the room forgets the character
    #[tokio::test]
    async fn disconnect_notifies_friends() {
        let mut ingest = Ingest::start(MemoryStore::new()).await;
        let alice = ingest.join("Alice").await;
        let mut friend = ingest.join("Friend").await;
        let alice_id = alice.id();

        assert_ok!(
            ingest
                .store
                .exec(vec![StoreOp::sadd(db::friends(&alice_id), friend.id())])
                .await
        );

        ingest.disconnect(alice);

        let mut saw_offline = false;
        for _ in 0..2 {
            match friend.recv().await {
                Packet::Status(status) => {
                    assert_eq!(status.id, alice_id);
                    assert!(!status.online);
                    saw_offline = true;
                }
                Packet::Leave(leave) => assert_eq!(leave.character.id, alice_id),
                other => panic!("unexpected packet {:?}", other),
            }
        }
        assert!(saw_offline);

        assert!(!ingest
            .store
            .sismember(&db::room_characters("lobby"), &alice_id)
            .await
            .unwrap());
        assert!(ingest
            .store
            .get(&db::active(&alice_id))
            .await
            .unwrap()
            .is_none());
    }
}

/// CROSS-INGEST TESTS
mod replication_tests {
    use super::*;

    /// Room events cross ingests exactly once
    #[tokio::test]
    async fn chat_reaches_peer_ingest_once() {
        let shared_store = MemoryStore::new();
        let mut east = Ingest::start(shared_store.connect()).await;
        let mut west = Ingest::start(shared_store.connect()).await;

        let mut alice = east.join("Alice").await;
        let mut bob = west.join("Bob").await;
        alice.drain().await;

        east.send(&mut alice, r#"{"type":"chat","message":"across"}"#)
            .await;

        assert!(matches!(bob.recv().await, Packet::Chat(chat) if chat.message == "across"));
        assert!(matches!(alice.recv().await, Packet::Chat(_)));
        bob.assert_silent().await;
        alice.assert_silent().await;
    }

    /// Direct sends find a character on whichever ingest holds it
    #[tokio::test]
    async fn direct_message_crosses_ingests() {
        let shared_store = MemoryStore::new();
        let mut east = Ingest::start(shared_store.connect()).await;
        let mut west = Ingest::start(shared_store.connect()).await;

        let mut alice = east.join("Alice").await;
        let mut bob = west.join("Bob").await;
        alice.drain().await;

        let ask = format!(
            r#"{{"type":"friend_request","recipientId":"{}"}}"#,
            bob.id()
        );
        east.send(&mut alice, &ask).await;

        match bob.recv().await {
            Packet::FriendUpdate(update) => {
                assert_eq!(update.friend_id, alice.id());
                assert!(update.pending);
            }
            other => panic!("expected friend_update, got {:?}", other),
        }
        alice.assert_silent().await;
    }

    /// Characters are tracked per ingest
    #[tokio::test]
    async fn ingest_membership_is_per_node() {
        let shared_store = MemoryStore::new();
        let mut east = Ingest::start(shared_store.connect()).await;
        let mut west = Ingest::start(shared_store.connect()).await;

        let alice = east.join("Alice").await;
        let bob = west.join("Bob").await;

        let east_id = east.store.client_id().await.unwrap().to_string();
        let west_id = west.store.client_id().await.unwrap().to_string();
        assert_ne!(east_id, west_id);

        assert_eq!(
            shared_store
                .smembers(&db::ingest_characters(&east_id))
                .await
                .unwrap(),
            vec![alice.id()]
        );
        assert_eq!(
            shared_store
                .smembers(&db::ingest_characters(&west_id))
                .await
                .unwrap(),
            vec![bob.id()]
        );
    }
}

/// LEADER ELECTION TESTS
mod leader_tests {
    use super::*;

    /// Exactly one of several ingests leads, and leadership survives the
    /// leader going away
    #[tokio::test]
    async fn one_leader_then_failover() {
        let shared_store = MemoryStore::new();
        let mut elections: Vec<LeaderElection> = (0..3)
            .map(|_| {
                LeaderElection::new(
                    Arc::new(shared_store.connect()),
                    "ingest",
                    Duration::from_secs(1),
                )
            })
            .collect();

        for election in &elections {
            assert_ok!(election.announce().await);
        }

        let mut leaders = 0;
        for election in &mut elections {
            if election.tick().await == Some(true) {
                leaders += 1;
            }
        }
        assert_eq!(leaders, 1);
        assert!(elections[0].is_leader());

        // The oldest connection closes
        elections.remove(0);
        assert_eq!(elections[0].tick().await, Some(true));
        assert_eq!(elections[1].tick().await, Some(false));
    }
}
