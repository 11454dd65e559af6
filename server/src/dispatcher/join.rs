use super::{Dispatcher, Session};
use crate::db;
use crate::error::{AuthFailure, DispatchError};
use crate::hub::Route;
use crate::store::StoreOp;
use crate::utils::new_id;
use log::{info, warn};
use shared::packets::{
    InitPacket, JoinPacket, LeavePacket, RegisterPacket, SettingsPacket, StatusPacket,
};
use shared::{Character, Packet, Role, StoreRecord};

/// Who a join resolved to, and the writes needed if it is new.
struct Identity {
    character: Character,
    creation: Vec<StoreOp>,
    first_time: bool,
}

impl Identity {
    fn existing(character: Character) -> Self {
        Self {
            character,
            creation: Vec::new(),
            first_time: false,
        }
    }
}

impl Dispatcher {
    /// Handles `join` and `auth`. Only a full join places the character in
    /// a room; `auth` just binds the connection to its character.
    pub(super) async fn join(
        &self,
        session: &mut Session,
        packet: JoinPacket,
        full: bool,
    ) -> Result<(), DispatchError> {
        let Identity {
            mut character,
            creation,
            first_time,
        } = self.authenticate(&packet).await?;

        let mut ops = creation;
        if character.room.is_empty() {
            character.room = self.world.default_room.clone();
            ops.push(StoreOp::hset_one(
                db::character(&character.id),
                "room",
                character.room.clone(),
            ));
        }
        if !character.ingest.is_empty() && character.ingest != self.ingest_id {
            ops.push(StoreOp::srem(
                db::ingest_characters(&character.ingest),
                character.id.clone(),
            ));
        }
        character.ingest = self.ingest_id.clone();
        ops.push(StoreOp::hset_one(
            db::character(&character.id),
            "ingest",
            self.ingest_id.clone(),
        ));
        ops.push(StoreOp::sadd(
            db::ingest_characters(&self.ingest_id),
            character.id.clone(),
        ));
        ops.push(StoreOp::set(db::active(&character.id), "true"));
        if full {
            ops.push(StoreOp::sadd(
                db::room_characters(&character.room),
                character.id.clone(),
            ));
        }
        self.store().exec(ops).await?;

        info!(
            "Client {} is character {} ({})",
            session.client_id, character.id, character.name
        );
        session.character = Some(character.clone());
        self.hub.identify(session.client_id, character.clone());
        self.notify_presence(&character.id, true, true).await?;

        if full {
            let room = db::load_room(self.store(), &character.room).await?;
            session.reply(&Packet::Init(InitPacket {
                character_id: character.id.clone(),
                room,
                first_time,
            }))?;
            self.hub
                .publish(&Packet::Join(JoinPacket::announce(character)))
                .await?;
        }
        Ok(())
    }

    async fn authenticate(&self, packet: &JoinPacket) -> Result<Identity, DispatchError> {
        if !packet.name.is_empty() {
            let character = Character::new(
                new_id(),
                packet.name.clone(),
                self.world.default_room.as_str(),
            );
            return Ok(Identity {
                creation: vec![StoreOp::hset(
                    db::character(&character.id),
                    character.to_fields(),
                )],
                character,
                first_time: true,
            });
        }

        if !packet.quill_token.is_empty() {
            return self.authenticate_sso(&packet.quill_token).await;
        }

        if !packet.token.is_empty() {
            let id = match self.services.tokens.validate(&packet.token).await {
                Ok(id) => id,
                Err(e) => {
                    warn!("Rejected session token: {}", e);
                    return Err(AuthFailure::InvalidToken.into());
                }
            };
            return match db::load_character(self.store(), &id).await? {
                Some(character) => Ok(Identity::existing(character)),
                None => Err(AuthFailure::InvalidToken.into()),
            };
        }

        if !packet.email.is_empty() {
            return self.authenticate_email(packet.email.trim(), packet.code).await;
        }

        Err(DispatchError::Rejected("no credentials"))
    }

    async fn authenticate_sso(&self, token: &str) -> Result<Identity, DispatchError> {
        let identity = match self.services.sso.exchange(token).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("SSO exchange failed: {}", e);
                return Err(AuthFailure::NotAdmitted.into());
            }
        };
        if !identity.admitted {
            return Err(AuthFailure::NotAdmitted.into());
        }

        if let Some(id) = self
            .store()
            .hget(db::QUILL_TO_CHARACTER, &identity.id)
            .await?
        {
            if let Some(character) = db::load_character(self.store(), &id).await? {
                return Ok(Identity::existing(character));
            }
        }

        let mut character = Character::new(
            new_id(),
            identity.name,
            self.world.default_room.as_str(),
        );
        character.role = Role::Hacker;
        Ok(Identity {
            creation: vec![
                StoreOp::hset(db::character(&character.id), character.to_fields()),
                StoreOp::hset_one(db::QUILL_TO_CHARACTER, identity.id, character.id.clone()),
            ],
            character,
            first_time: true,
        })
    }

    async fn authenticate_email(
        &self,
        email: &str,
        code: Option<u32>,
    ) -> Result<Identity, DispatchError> {
        let code = code.ok_or(AuthFailure::InvalidCode)?;
        let request = format!("{email},{code}");
        if !self.store().sismember(db::LOGIN_REQUESTS, &request).await? {
            return Err(AuthFailure::InvalidCode.into());
        }

        // Codes are single use
        let redeem = StoreOp::srem(db::LOGIN_REQUESTS, request);

        if let Some(id) = self.store().hget(db::EMAIL_TO_CHARACTER, email).await? {
            if let Some(character) = db::load_character(self.store(), &id).await? {
                let mut identity = Identity::existing(character);
                identity.creation.push(redeem);
                return Ok(identity);
            }
        }

        let mut character = Character::new(
            new_id(),
            "Player",
            self.world.default_room.as_str(),
        );
        if self.store().sismember(db::SPONSOR_EMAILS, email).await? {
            character.role = Role::SponsorRep;
            character.sponsor_id = self.store().hget(db::EMAIL_TO_SPONSOR, email).await?;
        } else if self.store().sismember(db::MENTOR_EMAILS, email).await? {
            character.role = Role::Mentor;
        } else if self.store().sismember(db::ORGANIZER_EMAILS, email).await? {
            character.role = Role::Organizer;
        }

        Ok(Identity {
            creation: vec![
                redeem,
                StoreOp::hset(db::character(&character.id), character.to_fields()),
                StoreOp::hset_one(db::EMAIL_TO_CHARACTER, email, character.id.clone()),
            ],
            character,
            first_time: true,
        })
    }

    /// Tells teammates and friends about a presence change.
    pub(super) async fn notify_presence(
        &self,
        character_id: &str,
        online: bool,
        active: bool,
    ) -> Result<(), DispatchError> {
        let status = Packet::Status(StatusPacket {
            id: character_id.to_string(),
            online,
            active,
        });
        for id in db::presence_audience(self.store(), character_id).await? {
            self.hub.send_to(Route::character(id), &status).await?;
        }
        Ok(())
    }

    pub(super) async fn update_status(
        &self,
        session: &mut Session,
        packet: StatusPacket,
    ) -> Result<(), DispatchError> {
        let id = session.authenticated()?.id.clone();
        let active = if packet.active { "true" } else { "false" };
        self.store()
            .exec(vec![StoreOp::set(db::active(&id), active)])
            .await?;
        self.notify_presence(&id, true, packet.active).await
    }

    pub(super) async fn update_settings(
        &self,
        session: &mut Session,
        packet: SettingsPacket,
    ) -> Result<(), DispatchError> {
        let id = session.authenticated()?.id.clone();
        if !packet.settings.is_empty() {
            let fields = packet
                .settings
                .iter()
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect();
            self.store()
                .exec(vec![StoreOp::hset(db::settings(&id), fields)])
                .await?;
        }
        session.reply(&Packet::Settings(packet))
    }

    /// Completes a profile after first login, then re-sends the room.
    pub(super) async fn register(
        &self,
        session: &mut Session,
        packet: RegisterPacket,
    ) -> Result<(), DispatchError> {
        let mut character = session.authenticated()?.clone();

        let mut ops = Vec::new();
        if !packet.name.is_empty() {
            character.name = packet.name.clone();
            ops.push(StoreOp::hset_one(
                db::character(&character.id),
                "name",
                packet.name.clone(),
            ));
        }
        if !packet.phone_number.is_empty() {
            ops.push(StoreOp::hset_one(
                db::settings(&character.id),
                "phoneNumber",
                packet.phone_number.clone(),
            ));
        }
        if !ops.is_empty() {
            self.store().exec(ops).await?;
        }

        if let Some(subscription) = &packet.browser_subscription {
            self.services
                .push
                .notify(subscription, "Welcome to Playground!")
                .await;
        }

        session.character = Some(character.clone());
        self.hub.identify(session.client_id, character.clone());

        let room = db::load_room(self.store(), &character.room).await?;
        session.reply(&Packet::Init(InitPacket {
            character_id: character.id,
            room,
            first_time: false,
        }))
    }

    /// Cleanup after a character's connection to this ingest closed.
    pub(super) async fn disconnect(&self, character: &Character) -> Result<(), DispatchError> {
        let stored = db::load_character(self.store(), &character.id).await?;
        let mut ops = vec![StoreOp::srem(
            db::ingest_characters(&self.ingest_id),
            character.id.clone(),
        )];

        // Reconnected elsewhere in the meantime; that ingest owns it now
        let moved = stored
            .as_ref()
            .is_some_and(|stored| !stored.ingest.is_empty() && stored.ingest != self.ingest_id);
        if moved {
            self.store().exec(ops).await?;
            return Ok(());
        }

        let room = stored
            .map(|stored| stored.room)
            .filter(|room| !room.is_empty())
            .unwrap_or_else(|| character.room.clone());

        ops.push(StoreOp::del(db::active(&character.id)));
        ops.push(StoreOp::hdel(db::character(&character.id), "ingest"));
        ops.push(StoreOp::srem(
            db::room_characters(&room),
            character.id.clone(),
        ));
        self.store().exec(ops).await?;
        info!("Character {} left room {}", character.id, room);

        let mut departed = character.clone();
        departed.room = room.clone();
        self.hub
            .publish(&Packet::Leave(LeavePacket {
                character: departed,
                room,
            }))
            .await?;
        self.notify_presence(&character.id, false, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::db;
    use crate::hub::Departure;
    use crate::store::{Store, StoreOp};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use shared::{Character, Packet, Role, StoreRecord};

    fn session_token(id: &str) -> String {
        encode(
            &Header::default(),
            &json!({ "id": id }),
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_join_by_name_announces_to_room() {
        let mut harness = Harness::new();
        let (_bob, mut bob_rx) = harness.join("Bob").await;

        let (mut alice, mut alice_rx) = harness.connect().await;
        harness
            .send(&mut alice, r#"{"type":"join","name":"Alice"}"#)
            .await;

        let character = alice.character.clone().unwrap();
        assert_eq!(character.room, "lobby");
        assert_eq!(character.ingest, "1");

        match next_packet(&mut alice_rx).await {
            Packet::Init(init) => {
                assert_eq!(init.character_id, character.id);
                assert!(init.first_time);
                assert!(init.room.characters.contains_key(&character.id));
            }
            other => panic!("expected init, got {:?}", other),
        }

        match next_packet(&mut bob_rx).await {
            Packet::Join(join) => {
                let announced = join.character.unwrap();
                assert_eq!(announced.id, character.id);
                assert_eq!(announced.room, "lobby");
                assert!(join.name.is_empty());
            }
            other => panic!("expected join, got {:?}", other),
        }

        let store = &harness.store;
        assert!(store
            .sismember(&db::room_characters("lobby"), &character.id)
            .await
            .unwrap());
        assert!(store
            .sismember(&db::ingest_characters("1"), &character.id)
            .await
            .unwrap());
        assert_eq!(
            store.get(&db::active(&character.id)).await.unwrap().as_deref(),
            Some("true")
        );
    }

    #[tokio::test]
    async fn test_stored_room_matches_membership() {
        let mut harness = Harness::new();

        let (mut alice, mut alice_rx) = harness.connect().await;
        harness
            .send(&mut alice, r#"{"type":"join","name":"Alice"}"#)
            .await;
        let alice_id = alice.character.clone().unwrap().id;

        match next_packet(&mut alice_rx).await {
            Packet::Init(init) => assert_eq!(init.room.characters[&alice_id].room, "lobby"),
            other => panic!("expected init, got {:?}", other),
        }
        assert_eq!(
            harness
                .store
                .hget(&db::character(&alice_id), "room")
                .await
                .unwrap()
                .as_deref(),
            Some("lobby")
        );

        // A stored record without a room rejoins the default room
        let stored = Character::new("c7", "Dana", "");
        harness
            .store
            .exec(vec![StoreOp::hset(db::character("c7"), stored.to_fields())])
            .await
            .unwrap();
        let (mut dana, mut dana_rx) = harness.connect().await;
        let request = json!({ "type": "join", "token": session_token("c7") }).to_string();
        harness.send(&mut dana, &request).await;

        match next_packet(&mut dana_rx).await {
            Packet::Init(init) => {
                assert_eq!(init.room.id, "lobby");
                assert_eq!(init.room.characters["c7"].room, "lobby");
            }
            other => panic!("expected init, got {:?}", other),
        }
        assert_eq!(
            harness
                .store
                .hget(&db::character("c7"), "room")
                .await
                .unwrap()
                .as_deref(),
            Some("lobby")
        );
        assert!(harness
            .store
            .sismember(&db::room_characters("lobby"), "c7")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_auth_with_session_token() {
        let mut harness = Harness::new();
        let mut stored = Character::new("c42", "Carol", "expo");
        stored.role = Role::Mentor;
        harness
            .store
            .exec(vec![StoreOp::hset(db::character("c42"), stored.to_fields())])
            .await
            .unwrap();

        let (mut session, mut rx) = harness.connect().await;
        let request = json!({ "type": "auth", "token": session_token("c42") }).to_string();
        harness.send(&mut session, &request).await;

        let character = session.character.clone().unwrap();
        assert_eq!(character.name, "Carol");
        assert_eq!(character.role, Role::Mentor);

        // auth binds the connection without entering a room
        assert_silent(&mut rx).await;
        assert!(!harness
            .store
            .sismember(&db::room_characters("expo"), "c42")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_invalid_token_reports_error() {
        let mut harness = Harness::new();
        let (mut session, mut rx) = harness.connect().await;

        harness
            .send(&mut session, r#"{"type":"join","token":"not-a-jwt"}"#)
            .await;
        assert_eq!(
            next_packet(&mut rx).await,
            Packet::Error(shared::packets::ErrorPacket { code: 1 })
        );

        // Valid signature, unknown character
        let request = json!({ "type": "join", "token": session_token("nobody") }).to_string();
        harness.send(&mut session, &request).await;
        assert_eq!(
            next_packet(&mut rx).await,
            Packet::Error(shared::packets::ErrorPacket { code: 1 })
        );
        assert!(session.character.is_none());
    }

    #[tokio::test]
    async fn test_sso_unavailable_is_not_admitted() {
        let mut harness = Harness::new();
        let (mut session, mut rx) = harness.connect().await;

        harness
            .send(&mut session, r#"{"type":"join","quillToken":"abc"}"#)
            .await;
        assert_eq!(
            next_packet(&mut rx).await,
            Packet::Error(shared::packets::ErrorPacket { code: 2 })
        );
    }

    #[tokio::test]
    async fn test_email_code_is_single_use() {
        let mut harness = Harness::new();
        harness
            .store
            .exec(vec![
                StoreOp::sadd(db::SPONSOR_EMAILS, "rep@acme.com"),
                StoreOp::hset_one(db::EMAIL_TO_SPONSOR, "rep@acme.com", "acme"),
                StoreOp::sadd(db::LOGIN_REQUESTS, "rep@acme.com,123456"),
            ])
            .await
            .unwrap();

        let (mut session, mut rx) = harness.connect().await;
        let login = r#"{"type":"join","email":"rep@acme.com","code":123456}"#;
        harness.send(&mut session, login).await;

        let character = session.character.clone().unwrap();
        assert_eq!(character.role, Role::SponsorRep);
        assert_eq!(character.sponsor_id.as_deref(), Some("acme"));
        assert!(matches!(next_packet(&mut rx).await, Packet::Init(init) if init.first_time));

        let (mut again, mut again_rx) = harness.connect().await;
        harness.send(&mut again, login).await;
        assert_eq!(
            next_packet(&mut again_rx).await,
            Packet::Error(shared::packets::ErrorPacket { code: 3 })
        );
    }

    #[tokio::test]
    async fn test_presence_reaches_friends() {
        let mut harness = Harness::new();
        let (friend, mut friend_rx) = harness.join("Friend").await;
        let friend_id = friend.character.unwrap().id;

        let (mut session, _rx) = harness.connect().await;
        let mut stored = Character::new("c7", "Dana", "lobby");
        stored.ingest = String::new();
        harness
            .store
            .exec(vec![
                StoreOp::hset(db::character("c7"), stored.to_fields()),
                StoreOp::sadd(db::friends("c7"), friend_id.clone()),
            ])
            .await
            .unwrap();

        let request = json!({ "type": "auth", "token": session_token("c7") }).to_string();
        harness.send(&mut session, &request).await;

        match next_packet(&mut friend_rx).await {
            Packet::Status(status) => {
                assert_eq!(status.id, "c7");
                assert!(status.online);
                assert!(status.active);
            }
            other => panic!("expected status, got {:?}", other),
        }

        harness
            .send(&mut session, r#"{"type":"status","active":false}"#)
            .await;
        assert!(matches!(
            next_packet(&mut friend_rx).await,
            Packet::Status(status) if status.online && !status.active
        ));
        assert_eq!(
            harness.store.get(&db::active("c7")).await.unwrap().as_deref(),
            Some("false")
        );
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up() {
        let mut harness = Harness::new();
        let (alice, _alice_rx) = harness.join("Alice").await;
        let (_bob, mut bob_rx) = harness.join("Bob").await;
        let alice = alice.character.unwrap();

        harness.dispatcher.depart(alice.clone()).await;

        match next_packet(&mut bob_rx).await {
            Packet::Leave(leave) => {
                assert_eq!(leave.character.id, alice.id);
                assert_eq!(leave.room, "lobby");
            }
            other => panic!("expected leave, got {:?}", other),
        }

        let store = &harness.store;
        assert!(!store
            .sismember(&db::room_characters("lobby"), &alice.id)
            .await
            .unwrap());
        assert!(!store
            .sismember(&db::ingest_characters("1"), &alice.id)
            .await
            .unwrap());
        assert!(store.get(&db::active(&alice.id)).await.unwrap().is_none());
        assert!(store
            .hget(&db::character(&alice.id), "ingest")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_settings_and_register() {
        let mut harness = Harness::new();
        let (mut session, mut rx) = harness.join("Eve").await;
        let id = session.character.clone().unwrap().id;

        harness
            .send(
                &mut session,
                r#"{"type":"settings","settings":{"zoom":"2"}}"#,
            )
            .await;
        assert!(matches!(next_packet(&mut rx).await, Packet::Settings(_)));

        harness
            .send(
                &mut session,
                r#"{"type":"register","name":"Evelyn","phoneNumber":"555-0100"}"#,
            )
            .await;
        assert!(matches!(next_packet(&mut rx).await, Packet::Init(_)));

        let settings = harness.store.hgetall(&db::settings(&id)).await.unwrap();
        assert_eq!(settings["zoom"], "2");
        assert_eq!(settings["phoneNumber"], "555-0100");
        assert_eq!(session.character.unwrap().name, "Evelyn");
    }
}
