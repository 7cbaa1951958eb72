use anyhow::Result;

use quickdesk::models::Reply;

use super::{require_user, visible_ticket, Desk};

pub fn run(desk: &Desk, id: &str) -> Result<()> {
    let user = require_user(desk)?;
    let ticket = visible_ticket(desk, &user, id)?;

    println!("Ticket {}: {}", ticket.id, ticket.subject);
    println!("Status: {}", ticket.status);
    println!("Priority: {}", ticket.priority);
    println!("Category: {}", ticket.category);
    println!("Customer: {} <{}>", ticket.customer_name, ticket.customer_email);
    match &ticket.assigned_to_name {
        Some(name) => println!("Assigned to: {}", name),
        None => println!("Assigned to: (unassigned)"),
    }
    println!("Created: {}", ticket.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Updated: {}", ticket.updated_at.format("%Y-%m-%d %H:%M:%S"));

    let mut votes = format!("Votes: +{} / -{}", ticket.upvotes, ticket.downvotes);
    if let Some(mine) = desk.local().vote_of(&ticket.id, &user.id) {
        votes.push_str(&format!(" (you voted {})", mine));
    }
    println!("{}", votes);

    if !ticket.tags.is_empty() {
        let tags: Vec<&str> = ticket.tags.iter().map(String::as_str).collect();
        println!("Tags: {}", tags.join(", "));
    }
    if !ticket.attachments.is_empty() {
        println!("Attachments: {}", ticket.attachments.join(", "));
    }

    println!("\nDescription:");
    for line in ticket.description.lines() {
        println!("  {}", line);
    }

    // Internal notes stay with staff
    let replies: Vec<&Reply> = if user.role.is_staff() {
        ticket.replies.iter().collect()
    } else {
        ticket.public_replies().collect()
    };
    if !replies.is_empty() {
        println!("\nReplies:");
        for reply in replies {
            let marker = if reply.is_internal { " (internal)" } else { "" };
            println!(
                "  [{}] {} ({}){}",
                reply.created_at.format("%Y-%m-%d %H:%M"),
                reply.author_name,
                reply.author_role,
                marker
            );
            for line in reply.message.lines() {
                println!("    {}", line);
            }
        }
    }

    Ok(())
}
