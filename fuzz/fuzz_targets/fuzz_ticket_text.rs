#![no_main]

//! Unicode subjects, tags and search text pushed through the SQLite
//! store. Catches panics from byte slicing and LIKE escaping.

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

use quickdesk::db::Database;
use quickdesk::models::{ReplyDraft, TicketDraft, TicketFilter};
use quickdesk::remote::RemoteStore;
use quickdesk::store::LocalStore;
use quickdesk::sync::SyncedStore;

#[derive(Arbitrary, Debug)]
struct TicketInput {
    subject: String,
    description: String,
    tags: Vec<String>,
    reply: String,
    search: String,
    num_tickets: u8,
}

fuzz_target!(|input: TicketInput| {
    let num_tickets = (input.num_tickets % 10).max(1);

    let Ok(dir) = tempdir() else {
        return;
    };
    let Ok(db) = Database::open(&dir.path().join("fuzz.db")) else {
        return;
    };
    let Ok(local) = LocalStore::open(&db) else {
        return;
    };
    let mut desk = SyncedStore::new(local, &db);
    if desk.initialize_data().is_err() {
        return;
    }

    let mut created = Vec::new();
    for i in 0..num_tickets {
        let draft = TicketDraft {
            subject: format!("{} #{}", input.subject, i),
            description: input.description.clone(),
            category: "Technical".to_string(),
            customer_id: "U-1".to_string(),
            tags: input.tags.clone(),
            ..Default::default()
        };
        if let Ok(ticket) = desk.add_ticket(draft) {
            created.push(ticket.id);
        }
    }

    if let Some(id) = created.first() {
        let _ = desk.add_reply(
            id,
            ReplyDraft {
                author_id: "U-2".to_string(),
                message: input.reply.clone(),
                ..Default::default()
            },
        );
    }

    let _ = db.search_tickets(&input.search, &TicketFilter::default());
    let _ = desk.local().list_tickets(&TicketFilter {
        search: Some(input.search.clone()),
        ..Default::default()
    });

    // What was written must read back unchanged.
    for id in &created {
        if let (Some(local), Ok(Some(remote))) = (desk.local().ticket(id), db.get_ticket(id)) {
            assert_eq!(local, remote.ticket);
        }
    }
});
