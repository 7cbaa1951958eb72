use anyhow::Result;

use quickdesk::models::VoteDirection;

use super::{require_user, visible_ticket, Desk};

/// Vote `up` or `down` as the current user. Voting the same way twice
/// changes nothing; `clear` withdraws the vote.
pub fn run(desk: &mut Desk, id: &str, direction: Option<&str>, clear: bool) -> Result<()> {
    let user = require_user(desk)?;
    visible_ticket(desk, &user, id)?;

    if clear {
        if desk.remove_vote(id, &user.id)? {
            println!("Removed your vote on {}", id);
        } else {
            println!("You have not voted on {}", id);
        }
        return Ok(());
    }

    let direction: VoteDirection = direction.unwrap_or("up").parse()?;
    let ticket = desk.vote_ticket(id, direction, &user.id)?;
    println!(
        "Voted {} on {} (+{} / -{})",
        direction, ticket.id, ticket.upvotes, ticket.downvotes
    );
    Ok(())
}
