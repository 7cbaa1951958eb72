use anyhow::{bail, Result};
use std::io::{self, Write};

use super::{require_user, visible_ticket, Desk};

pub fn run(desk: &mut Desk, id: &str, force: bool) -> Result<()> {
    let user = require_user(desk)?;
    let ticket = visible_ticket(desk, &user, id)?;

    if !force {
        print!("Delete ticket {} \"{}\"? [y/N] ", id, ticket.subject);
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    if desk.delete_ticket(id)? {
        println!("Deleted ticket {}", id);
    } else {
        bail!("Failed to delete ticket {}", id);
    }

    Ok(())
}

/// Internal function for testing without stdin interaction
#[cfg(test)]
pub fn run_force(desk: &mut Desk, id: &str) -> Result<()> {
    run(desk, id, true)
}
