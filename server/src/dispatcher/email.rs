use super::Dispatcher;
use crate::db;
use crate::error::DispatchError;
use crate::store::StoreOp;
use crate::utils::generate_code;
use log::info;
use shared::packets::{AddEmailPacket, EmailCodePacket};
use shared::Role;

/// The allow-list of addresses that may log in with `role`.
fn email_list(role: Role) -> Option<&'static str> {
    match role {
        Role::SponsorRep => Some(db::SPONSOR_EMAILS),
        Role::Mentor => Some(db::MENTOR_EMAILS),
        Role::Organizer => Some(db::ORGANIZER_EMAILS),
        Role::Guest | Role::Hacker => None,
    }
}

impl Dispatcher {
    /// Mails a one-time login code to an allow-listed address. Unknown
    /// addresses get no reply so the lists cannot be enumerated.
    pub(super) async fn email_code(&self, packet: EmailCodePacket) -> Result<(), DispatchError> {
        let list = email_list(packet.role)
            .ok_or(DispatchError::Rejected("role has no email login"))?;
        let email = packet.email.trim();
        if !self.store().sismember(list, email).await? {
            return Err(DispatchError::Rejected("email not allow-listed"));
        }

        let code = generate_code();
        self.store()
            .exec(vec![StoreOp::sadd(
                db::LOGIN_REQUESTS,
                format!("{email},{code}"),
            )])
            .await?;
        self.services.mailer.send_code(email, code).await;
        Ok(())
    }

    pub(super) async fn add_email(&self, packet: AddEmailPacket) -> Result<(), DispatchError> {
        let list = email_list(packet.role)
            .ok_or(DispatchError::Rejected("role has no email login"))?;
        let email = packet.email.trim();
        if email.is_empty() {
            return Err(DispatchError::Rejected("missing email"));
        }

        let mut ops = vec![StoreOp::sadd(list, email)];
        if packet.role == Role::SponsorRep && !packet.sponsor_id.is_empty() {
            ops.push(StoreOp::hset_one(
                db::EMAIL_TO_SPONSOR,
                email,
                packet.sponsor_id.clone(),
            ));
        }
        self.store().exec(ops).await?;

        info!("Allowed {} to log in as {:?}", email, packet.role);
        Ok(())
    }
}
