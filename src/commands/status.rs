use anyhow::Result;

use quickdesk::models::{Status, TicketUpdate};

use super::{require_user, visible_ticket, Desk};

/// Any status can follow any other; reopening a closed ticket is allowed.
pub fn run(desk: &mut Desk, id: &str, status: &str) -> Result<()> {
    let status: Status = status.parse()?;
    let user = require_user(desk)?;
    let before = visible_ticket(desk, &user, id)?;

    let ticket = desk.update_ticket(id, TicketUpdate::status(status))?;
    println!("Ticket {}: {} -> {}", id, before.status, ticket.status);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::*;
    use quickdesk::models::TicketDraft;

    fn add(desk: &mut Desk) -> String {
        desk.add_ticket(TicketDraft {
            subject: "Status".to_string(),
            description: "Body".to_string(),
            category: "Technical".to_string(),
            customer_id: "U-1".to_string(),
            ..Default::default()
        })
        .unwrap()
        .id
    }

    // ==================== Unit Tests ====================

    #[test]
    fn test_close_and_reopen() {
        let (db, _dir) = setup_test_db();
        let mut desk = signed_in(&db, AGENT);
        let id = add(&mut desk);

        run(&mut desk, &id, "closed").unwrap();
        assert_eq!(desk.local().ticket(&id).unwrap().status, Status::Closed);

        run(&mut desk, &id, "open").unwrap();
        assert_eq!(desk.local().ticket(&id).unwrap().status, Status::Open);
    }

    #[test]
    fn test_status_reaches_database() {
        use quickdesk::remote::RemoteStore;

        let (db, _dir) = setup_test_db();
        let mut desk = signed_in(&db, AGENT);
        let id = add(&mut desk);

        run(&mut desk, &id, "in-progress").unwrap();
        let stored = db.get_ticket(&id).unwrap().unwrap();
        assert_eq!(stored.ticket.status, Status::InProgress);
    }

    #[test]
    fn test_invalid_status() {
        let (db, _dir) = setup_test_db();
        let mut desk = signed_in(&db, AGENT);
        let id = add(&mut desk);

        let result = run(&mut desk, &id, "done");
        assert!(result.unwrap_err().to_string().contains("Must be one of"));
    }

    #[test]
    fn test_status_nonexistent_ticket() {
        let (db, _dir) = setup_test_db();
        let mut desk = signed_in(&db, AGENT);
        assert!(run(&mut desk, "T-404", "closed").is_err());
    }
}
