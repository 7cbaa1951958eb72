use anyhow::{Context, Result};
use std::fs;
use std::io::{self, Write};

use quickdesk::models::{Status, Ticket, TicketFilter};

use super::{require_admin, require_user, Desk};

fn emit(content: &str, output_path: Option<&str>, what: &str) -> Result<()> {
    match output_path {
        Some(path) => {
            fs::write(path, content).context("Failed to write export file")?;
            eprintln!("Exported {} to {}", what, path);
        }
        None => {
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{}", content)?;
        }
    }
    Ok(())
}

/// The full store snapshot, readable back with `init --import`.
pub fn run_json(desk: &Desk, output_path: Option<&str>) -> Result<()> {
    require_admin(desk)?;
    let json = desk.local().to_json()?;
    let count = desk.local().tickets().len();
    emit(&json, output_path, &format!("{} tickets", count))
}

pub fn run_markdown(desk: &Desk, output_path: Option<&str>) -> Result<()> {
    let user = require_user(desk)?;
    let tickets = desk.local().visible_tickets(&user, &TicketFilter::default());
    let md = render_markdown(&tickets, user.role.is_staff());
    emit(&md, output_path, &format!("{} tickets", tickets.len()))
}

pub fn render_markdown(tickets: &[Ticket], include_internal: bool) -> String {
    let mut md = String::new();

    md.push_str("# QuickDesk Tickets Export\n\n");
    md.push_str(&format!(
        "Exported: {}\n\n",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    ));

    for (status, heading) in [
        (Status::Open, "Open"),
        (Status::InProgress, "In Progress"),
        (Status::Resolved, "Resolved"),
        (Status::Closed, "Closed"),
    ] {
        let group: Vec<_> = tickets.iter().filter(|t| t.status == status).collect();
        if group.is_empty() {
            continue;
        }
        md.push_str(&format!("## {} Tickets\n\n", heading));
        for ticket in group {
            write_ticket_md(&mut md, ticket, include_internal);
        }
    }
    md
}

fn write_ticket_md(md: &mut String, ticket: &Ticket, include_internal: bool) {
    let checkbox = if matches!(ticket.status, Status::Resolved | Status::Closed) {
        "[x]"
    } else {
        "[ ]"
    };

    md.push_str(&format!("### {} {}: {}\n\n", checkbox, ticket.id, ticket.subject));
    md.push_str(&format!("- **Priority:** {}\n", ticket.priority));
    md.push_str(&format!("- **Category:** {}\n", ticket.category));
    md.push_str(&format!("- **Customer:** {}\n", ticket.customer_name));
    if let Some(ref name) = ticket.assigned_to_name {
        md.push_str(&format!("- **Assigned:** {}\n", name));
    }
    if !ticket.tags.is_empty() {
        let tags: Vec<&str> = ticket.tags.iter().map(String::as_str).collect();
        md.push_str(&format!("- **Tags:** {}\n", tags.join(", ")));
    }
    md.push_str(&format!("- **Votes:** +{} / -{}\n", ticket.upvotes, ticket.downvotes));
    md.push_str(&format!("- **Created:** {}\n", ticket.created_at.format("%Y-%m-%d")));

    md.push_str(&format!("\n{}\n", ticket.description));

    let replies: Vec<_> = ticket
        .replies
        .iter()
        .filter(|r| include_internal || !r.is_internal)
        .collect();
    if !replies.is_empty() {
        md.push_str("\n**Replies:**\n");
        for reply in replies {
            md.push_str(&format!(
                "- [{}] {}: {}\n",
                reply.created_at.format("%Y-%m-%d %H:%M"),
                reply.author_name,
                reply.message
            ));
        }
    }

    md.push_str("\n---\n\n");
}
