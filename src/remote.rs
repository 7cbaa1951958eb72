//! Contract for the authoritative ticket service the local store mirrors.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::Duration;

use crate::error::Result;
use crate::models::{Category, Reply, Ticket, TicketFilter, TicketUpdate, User, Vote};

/// Display data for the category a ticket belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryTag {
    pub id: String,
    pub name: String,
    pub color: String,
}

/// Current display data for a referenced user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserTag {
    pub id: String,
    pub name: String,
    pub email: String,
}

/// A ticket row joined with its category and assignee.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TicketView {
    pub ticket: Ticket,
    pub category: Option<CategoryTag>,
    pub assignee: Option<UserTag>,
}

/// A partial ticket write. `assigned_to` is `Some(None)` to unassign.
#[derive(Debug, Clone, PartialEq)]
pub struct TicketPatch {
    pub fields: TicketUpdate,
    pub assigned_to: Option<Option<String>>,
    pub updated_at: DateTime<Utc>,
}

impl TicketPatch {
    /// Only move `updated_at`, after a reply or vote changed the ticket.
    pub fn touch(updated_at: DateTime<Utc>) -> Self {
        TicketPatch {
            fields: TicketUpdate::default(),
            assigned_to: None,
            updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Tickets,
    Replies,
    Votes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub ticket_id: String,
    /// When the change happened, if the service knows.
    pub at: Option<DateTime<Utc>>,
}

/// What a subscriber wants to hear about: one table, optionally one ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub table: Table,
    pub ticket_id: Option<String>,
}

impl Topic {
    pub fn tickets() -> Self {
        Topic {
            table: Table::Tickets,
            ticket_id: None,
        }
    }

    pub fn replies(ticket_id: &str) -> Self {
        Topic {
            table: Table::Replies,
            ticket_id: Some(ticket_id.to_string()),
        }
    }

    pub fn votes(ticket_id: &str) -> Self {
        Topic {
            table: Table::Votes,
            ticket_id: Some(ticket_id.to_string()),
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.table == event.table
            && self
                .ticket_id
                .as_deref()
                .map_or(true, |id| id == event.ticket_id)
    }
}

/// Receiving end of a change feed. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    rx: Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn new(topic: Topic, rx: Receiver<ChangeEvent>) -> Self {
        Subscription { topic, rx }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Everything delivered so far, without blocking.
    pub fn drain(&self) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        events
    }

    pub fn wait(&self, timeout: Duration) -> Option<ChangeEvent> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// The authoritative store. Every method reports service failures as
/// `Error::RemoteUnavailable` and writes it refuses for good (constraint
/// violations) as `Error::Rejected`.
pub trait RemoteStore {
    /// Tickets matching `filter`, newest first, with full reply threads.
    fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<TicketView>>;

    fn get_ticket(&self, id: &str) -> Result<Option<TicketView>>;

    /// Substring search over subject, description and ticket id.
    fn search_tickets(&self, text: &str, filter: &TicketFilter) -> Result<Vec<TicketView>> {
        let filter = TicketFilter {
            search: Some(text.to_string()),
            ..filter.clone()
        };
        self.list_tickets(&filter)
    }

    fn create_ticket(&self, ticket: &Ticket) -> Result<TicketView>;

    fn update_ticket(&self, id: &str, patch: &TicketPatch) -> Result<TicketView>;

    /// Removes the ticket with its replies and votes.
    fn delete_ticket(&self, id: &str) -> Result<bool>;

    fn add_reply(&self, reply: &Reply) -> Result<Reply>;

    fn votes_for(&self, ticket_id: &str) -> Result<Vec<Vote>>;

    /// Insert or overwrite the vote for `(vote.ticket_id, vote.user_id)`.
    fn upsert_vote(&self, vote: &Vote) -> Result<Vote>;

    fn delete_vote(&self, ticket_id: &str, user_id: &str) -> Result<bool>;

    fn list_users(&self) -> Result<Vec<User>>;

    fn save_user(&self, user: &User) -> Result<User>;

    /// All categories, including inactive ones.
    fn list_categories(&self) -> Result<Vec<Category>>;

    fn save_category(&self, category: &Category) -> Result<Category>;

    fn subscribe(&self, topic: Topic) -> Result<Subscription>;
}

impl<R: RemoteStore + ?Sized> RemoteStore for &R {
    fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<TicketView>> {
        (**self).list_tickets(filter)
    }

    fn get_ticket(&self, id: &str) -> Result<Option<TicketView>> {
        (**self).get_ticket(id)
    }

    fn search_tickets(&self, text: &str, filter: &TicketFilter) -> Result<Vec<TicketView>> {
        (**self).search_tickets(text, filter)
    }

    fn create_ticket(&self, ticket: &Ticket) -> Result<TicketView> {
        (**self).create_ticket(ticket)
    }

    fn update_ticket(&self, id: &str, patch: &TicketPatch) -> Result<TicketView> {
        (**self).update_ticket(id, patch)
    }

    fn delete_ticket(&self, id: &str) -> Result<bool> {
        (**self).delete_ticket(id)
    }

    fn add_reply(&self, reply: &Reply) -> Result<Reply> {
        (**self).add_reply(reply)
    }

    fn votes_for(&self, ticket_id: &str) -> Result<Vec<Vote>> {
        (**self).votes_for(ticket_id)
    }

    fn upsert_vote(&self, vote: &Vote) -> Result<Vote> {
        (**self).upsert_vote(vote)
    }

    fn delete_vote(&self, ticket_id: &str, user_id: &str) -> Result<bool> {
        (**self).delete_vote(ticket_id, user_id)
    }

    fn list_users(&self) -> Result<Vec<User>> {
        (**self).list_users()
    }

    fn save_user(&self, user: &User) -> Result<User> {
        (**self).save_user(user)
    }

    fn list_categories(&self) -> Result<Vec<Category>> {
        (**self).list_categories()
    }

    fn save_category(&self, category: &Category) -> Result<Category> {
        (**self).save_category(category)
    }

    fn subscribe(&self, topic: Topic) -> Result<Subscription> {
        (**self).subscribe(topic)
    }
}
