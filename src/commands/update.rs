use anyhow::{bail, Result};

use quickdesk::models::TicketUpdate;

use super::{require_user, visible_ticket, Desk};

pub struct UpdateArgs<'a> {
    pub subject: Option<&'a str>,
    pub description: Option<&'a str>,
    pub category: Option<&'a str>,
    pub priority: Option<&'a str>,
    pub tags: Option<Vec<String>>,
    pub attachments: Option<Vec<String>>,
}

pub fn run(desk: &mut Desk, id: &str, args: UpdateArgs) -> Result<()> {
    let update = TicketUpdate {
        subject: args.subject.map(str::to_string),
        description: args.description.map(str::to_string),
        category: args.category.map(str::to_string),
        priority: args.priority.map(str::parse).transpose()?,
        status: None,
        attachments: args.attachments,
        tags: args.tags,
    };
    if update.is_empty() {
        bail!("Nothing to update. Use --subject, --description, --category, --priority, --tag or --attach");
    }

    let user = require_user(desk)?;
    visible_ticket(desk, &user, id)?;

    desk.update_ticket(id, update)?;
    println!("Updated ticket {}", id);
    Ok(())
}
