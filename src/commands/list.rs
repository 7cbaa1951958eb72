use anyhow::Result;

use quickdesk::models::{Assignee, Ticket, TicketFilter, User};
use quickdesk::remote::RemoteStore;

use super::{require_user, truncate, Desk};

/// Build a filter from CLI flags. `assigned` takes a user id, `me`, or `none`.
pub fn build_filter(
    user: &User,
    status: Option<&str>,
    priority: Option<&str>,
    category: Option<&str>,
    assigned: Option<&str>,
) -> Result<TicketFilter> {
    let assignee = match assigned {
        None => None,
        Some("none") => Some(Assignee::Unassigned),
        Some("me") => Some(Assignee::User(user.id.clone())),
        Some(id) => Some(Assignee::User(id.to_string())),
    };
    Ok(TicketFilter {
        status: status.map(str::parse).transpose()?,
        priority: priority.map(str::parse).transpose()?,
        category: category.map(str::to_string),
        assignee,
        ..Default::default()
    })
}

fn print_tickets(tickets: &[Ticket]) {
    if tickets.is_empty() {
        println!("No tickets found.");
        return;
    }

    for ticket in tickets {
        let status_display = format!("[{}]", ticket.status);
        let date = ticket.created_at.format("%Y-%m-%d");
        println!(
            "{:<6} {:13} {:<40} {:8} {:10} {}",
            ticket.id,
            status_display,
            truncate(&ticket.subject, 40),
            ticket.priority,
            truncate(&ticket.category, 10),
            date
        );
    }
}

pub fn run(desk: &Desk, filter: &TicketFilter) -> Result<()> {
    let user = require_user(desk)?;
    let tickets = desk.local().visible_tickets(&user, filter);
    print_tickets(&tickets);
    Ok(())
}

/// Search through the service, so the results include tickets this
/// session has not pulled yet.
pub fn search(desk: &Desk, text: &str, filter: &TicketFilter) -> Result<Vec<Ticket>> {
    let user = require_user(desk)?;
    let mut filter = filter.clone();
    if !user.role.is_staff() {
        filter.customer_id = Some(user.id.clone());
    }

    let tickets: Vec<Ticket> = desk
        .remote()
        .search_tickets(text, &filter)?
        .into_iter()
        .map(|view| view.ticket)
        .collect();
    print_tickets(&tickets);
    Ok(tickets)
}
