use anyhow::Result;

use quickdesk::models::{Role, TicketFilter};
use quickdesk::store::TicketStats;

use super::{require_user, Desk};

fn print_ticket_stats(stats: &TicketStats) {
    println!("Total:       {}", stats.total);
    println!("Open:        {}", stats.open);
    println!("In progress: {}", stats.in_progress);
    println!("Resolved:    {}", stats.resolved);
    println!("Closed:      {}", stats.closed);
    println!("Unassigned:  {}", stats.unassigned);
}

/// Dashboard counts for what the current user can see. Admins also get
/// the user and category totals.
pub fn run(desk: &Desk) -> Result<TicketStats> {
    let user = require_user(desk)?;
    let scope = if user.role.is_staff() {
        TicketFilter::default()
    } else {
        TicketFilter {
            customer_id: Some(user.id.clone()),
            ..Default::default()
        }
    };

    let stats = desk.local().stats(&scope);
    print_ticket_stats(&stats);

    if user.role == Role::Agent {
        let mine = desk.local().stats(&TicketFilter {
            assignee: Some(quickdesk::models::Assignee::User(user.id.clone())),
            ..Default::default()
        });
        println!("Assigned to you: {}", mine.total);
    }

    if user.role == Role::Admin {
        let system = desk.local().system_stats();
        println!();
        println!("Users:        {} ({} active)", system.users, system.active_users);
        println!("Agents:       {}", system.agents);
        println!("Categories:   {} active", system.active_categories);
        for category in desk.local().categories() {
            let state = if category.is_active { "" } else { " (inactive)" };
            println!("  {:<12} {}{}", category.name, category.ticket_count, state);
        }
    }

    Ok(stats)
}
