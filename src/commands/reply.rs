use anyhow::{bail, Result};

use quickdesk::models::ReplyDraft;

use super::{require_user, visible_ticket, Desk};

pub fn run(desk: &mut Desk, id: &str, message: &str, internal: bool, attachments: &[String]) -> Result<()> {
    let user = require_user(desk)?;
    if internal && !user.role.is_staff() {
        bail!("Only agents and admins can add internal notes");
    }
    visible_ticket(desk, &user, id)?;

    let reply = desk.add_reply(
        id,
        ReplyDraft {
            author_id: user.id,
            message: message.to_string(),
            attachments: attachments.to_vec(),
            is_internal: internal,
        },
    )?;
    let kind = if reply.is_internal { "internal note" } else { "reply" };
    println!("Added {} {} to ticket {}", kind, reply.id, id);
    Ok(())
}
