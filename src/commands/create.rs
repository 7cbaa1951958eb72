use anyhow::Result;

use quickdesk::models::{Priority, TicketDraft};

use super::{require_user, Desk};

pub fn run(
    desk: &mut Desk,
    subject: &str,
    description: &str,
    category: &str,
    priority: &str,
    tags: &[String],
    attachments: &[String],
) -> Result<()> {
    let priority: Priority = priority.parse()?;
    let user = require_user(desk)?;

    let ticket = desk.add_ticket(TicketDraft {
        subject: subject.to_string(),
        description: description.to_string(),
        category: category.to_string(),
        priority,
        customer_id: user.id,
        attachments: attachments.to_vec(),
        tags: tags.to_vec(),
    })?;
    println!("Created ticket {} in {}", ticket.id, ticket.category);
    Ok(())
}
