use anyhow::{bail, Result};

use super::{require_staff, Desk};

/// Assign a ticket to `to` (user id or email), or to the current agent
/// when omitted. `clear` unassigns instead.
pub fn run(desk: &mut Desk, id: &str, to: Option<&str>, clear: bool) -> Result<()> {
    let me = require_staff(desk)?;

    if clear {
        desk.unassign_ticket(id)?;
        println!("Unassigned ticket {}", id);
        return Ok(());
    }

    let assignee = match to {
        None | Some("me") => me,
        Some(who) if who.contains('@') => match desk.local().user_by_email(who) {
            Some(u) => u,
            None => bail!("No user with email {}", who),
        },
        Some(who) => match desk.local().user(who) {
            Some(u) => u,
            None => bail!("User {} not found", who),
        },
    };

    let ticket = desk.assign_ticket(id, &assignee.id)?;
    println!(
        "Assigned ticket {} to {}",
        ticket.id,
        ticket.assigned_to_name.as_deref().unwrap_or(&assignee.name)
    );
    Ok(())
}
