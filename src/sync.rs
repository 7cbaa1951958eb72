//! Cache-aside layering of the local store over the remote service.
//!
//! Writes land in the local store first and are then pushed. A failed push
//! keeps the optimistic local state and queues the write; the queue is
//! replayed in order by `retry_pending` or undone by `rollback_pending`.
//! A write the remote rejects for good is undone right away.

use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{
    Category, CategoryDraft, CategoryUpdate, Reply, ReplyDraft, Ticket, TicketDraft,
    TicketFilter, TicketUpdate, User, UserDraft, UserUpdate, Vote, VoteDirection,
};
use crate::remote::{ChangeEvent, ChangeKind, RemoteStore, Subscription, Table, TicketPatch, TicketView, Topic};
use crate::storage::SnapshotStorage;
use crate::store::LocalStore;

/// A ticket as it was before an optimistic write.
type SavedTicket = (String, Option<Ticket>, Vec<Vote>);

/// A local write the remote has not acknowledged yet.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    CreateTicket(String),
    UpdateTicket { id: String, patch: TicketPatch },
    DeleteTicket(String),
    AddReply(Reply),
    /// Push whatever the local vote record for this pair is now.
    Vote { ticket_id: String, user_id: String },
    SaveUser(String),
    SaveCategory(String),
}

impl PendingOp {
    pub fn ticket_id(&self) -> Option<&str> {
        match self {
            PendingOp::CreateTicket(id) | PendingOp::DeleteTicket(id) => Some(id),
            PendingOp::UpdateTicket { id, .. } => Some(id),
            PendingOp::AddReply(reply) => Some(&reply.ticket_id),
            PendingOp::Vote { ticket_id, .. } => Some(ticket_id),
            PendingOp::SaveUser(_) | PendingOp::SaveCategory(_) => None,
        }
    }
}

#[derive(Debug)]
struct Pending {
    op: PendingOp,
    before: Option<SavedTicket>,
}

fn unavailable(err: Error) -> Error {
    match err {
        Error::RemoteUnavailable(_) => err,
        other => Error::RemoteUnavailable(other.to_string()),
    }
}

/// The values a successful local update actually wrote, for the fields it touched.
fn patch_from(update: &TicketUpdate, ticket: &Ticket) -> TicketPatch {
    TicketPatch {
        fields: TicketUpdate {
            subject: update.subject.as_ref().map(|_| ticket.subject.clone()),
            description: update.description.as_ref().map(|_| ticket.description.clone()),
            category: update.category.as_ref().map(|_| ticket.category.clone()),
            priority: update.priority.map(|_| ticket.priority),
            status: update.status.map(|_| ticket.status),
            attachments: update.attachments.as_ref().map(|_| ticket.attachments.clone()),
            tags: update.tags.as_ref().map(|_| ticket.tags.iter().cloned().collect()),
        },
        assigned_to: None,
        updated_at: ticket.updated_at,
    }
}

pub struct SyncedStore<S: SnapshotStorage, R: RemoteStore> {
    local: LocalStore<S>,
    remote: R,
    pending: VecDeque<Pending>,
}

impl<S: SnapshotStorage, R: RemoteStore> SyncedStore<S, R> {
    pub fn new(local: LocalStore<S>, remote: R) -> Self {
        SyncedStore {
            local,
            remote,
            pending: VecDeque::new(),
        }
    }

    /// Read access to the optimistic local state.
    pub fn local(&self) -> &LocalStore<S> {
        &self.local
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn pending(&self) -> Vec<PendingOp> {
        self.pending.iter().map(|p| p.op.clone()).collect()
    }

    pub fn has_pending(&self, ticket_id: &str) -> bool {
        self.pending.iter().any(|p| p.op.ticket_id() == Some(ticket_id))
    }

    pub fn subscribe(&self, topic: Topic) -> Result<Subscription> {
        self.remote.subscribe(topic)
    }

    fn saved(&self, id: &str) -> SavedTicket {
        (id.to_string(), self.local.ticket(id), self.local.votes_for(id))
    }

    /// Push `op` now, or queue it when the remote fails or older writes
    /// are still waiting. A write the remote rejects outright is undone
    /// locally instead of queued.
    fn sync(&mut self, op: PendingOp, before: Option<SavedTicket>) -> Result<()> {
        if !self.pending.is_empty() {
            let waiting = self.pending.len();
            self.pending.push_back(Pending { op, before });
            return Err(Error::RemoteUnavailable(format!(
                "queued behind {} pending write(s)",
                waiting
            )));
        }
        match self.send(&op, false) {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() => {
                let err = unavailable(err);
                warn!(?op, error = %err, "remote write failed, keeping local change");
                self.pending.push_back(Pending { op, before });
                Err(err)
            }
            Err(err) => {
                self.discard(Pending { op, before }, &err)?;
                Err(err)
            }
        }
    }

    /// Undo a rejected write, along with any queued writes to the same
    /// ticket that were built on top of it.
    fn discard(&mut self, rejected: Pending, err: &Error) -> Result<()> {
        warn!(op = ?rejected.op, error = %err, "remote rejected write, undoing local change");
        if let Some(id) = rejected.op.ticket_id() {
            self.pending.retain(|p| p.op.ticket_id() != Some(id));
        }
        if let Some(before) = rejected.before {
            self.local.restore_tickets(vec![before])?;
        }
        Ok(())
    }

    /// Sync every op, queueing past failures. Reports the first error.
    fn sync_all(&mut self, ops: Vec<(PendingOp, Option<SavedTicket>)>) -> Result<()> {
        let mut first_err = None;
        for (op, saved) in ops {
            if let Err(err) = self.sync(op, saved) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Send one write. On `replay` the remote may already hold part of it
    /// from an earlier attempt that failed halfway; those parts are skipped.
    fn send(&mut self, op: &PendingOp, replay: bool) -> Result<()> {
        match op {
            PendingOp::CreateTicket(id) => {
                if let Some(ticket) = self.local.ticket(id) {
                    let existing = if replay { self.remote.get_ticket(id)? } else { None };
                    let mut view = match existing {
                        Some(view) if view.ticket.created_at == ticket.created_at => view,
                        Some(_) => {
                            return Err(Error::Rejected(format!("ticket {} already exists", id)));
                        }
                        None => self.remote.create_ticket(&ticket)?,
                    };
                    let votes = self.local.votes_for(id);
                    // Imported tickets arrive with their thread.
                    if !ticket.replies.is_empty() || !votes.is_empty() {
                        for reply in &ticket.replies {
                            if !view.ticket.replies.iter().any(|r| r.id == reply.id) {
                                self.remote.add_reply(reply)?;
                            }
                        }
                        for vote in &votes {
                            self.remote.upsert_vote(vote)?;
                        }
                        view = self
                            .remote
                            .update_ticket(id, &TicketPatch::touch(ticket.updated_at))?;
                    }
                    self.adopt(view)?;
                }
            }
            PendingOp::UpdateTicket { id, patch } => {
                let view = self.remote.update_ticket(id, patch)?;
                self.adopt(view)?;
            }
            PendingOp::DeleteTicket(id) => {
                self.remote.delete_ticket(id)?;
            }
            PendingOp::AddReply(reply) => {
                let sent = replay
                    && self
                        .remote
                        .get_ticket(&reply.ticket_id)?
                        .is_some_and(|view| view.ticket.replies.iter().any(|r| r.id == reply.id));
                if !sent {
                    self.remote.add_reply(reply)?;
                }
                self.touch(&reply.ticket_id)?;
            }
            PendingOp::Vote { ticket_id, user_id } => {
                let record = self
                    .local
                    .votes_for(ticket_id)
                    .into_iter()
                    .find(|v| &v.user_id == user_id);
                match record {
                    Some(vote) => {
                        self.remote.upsert_vote(&vote)?;
                    }
                    None => {
                        self.remote.delete_vote(ticket_id, user_id)?;
                    }
                }
                self.touch(ticket_id)?;
            }
            PendingOp::SaveUser(id) => {
                if let Some(user) = self.local.user(id) {
                    self.remote.save_user(&user)?;
                }
            }
            PendingOp::SaveCategory(id) => {
                if let Some(category) = self.local.category(id) {
                    self.remote.save_category(&category)?;
                }
            }
        }
        Ok(())
    }

    /// Carry the local `updated_at` to the remote row after a child write.
    fn touch(&mut self, ticket_id: &str) -> Result<()> {
        if let Some(ticket) = self.local.ticket(ticket_id) {
            let view = self
                .remote
                .update_ticket(ticket_id, &TicketPatch::touch(ticket.updated_at))?;
            self.adopt(view)?;
        }
        Ok(())
    }

    /// Replace the local copy with the remote's authoritative row.
    fn adopt(&mut self, view: TicketView) -> Result<()> {
        let votes = self.remote.votes_for(&view.ticket.id)?;
        self.local.reconcile_ticket(view.ticket, votes)
    }

    // Tickets

    pub fn add_ticket(&mut self, draft: TicketDraft) -> Result<Ticket> {
        let ticket = self.local.add_ticket(draft)?;
        let before = (ticket.id.clone(), None, Vec::new());
        self.sync(PendingOp::CreateTicket(ticket.id.clone()), Some(before))?;
        Ok(self.local.ticket(&ticket.id).unwrap_or(ticket))
    }

    pub fn update_ticket(&mut self, id: &str, update: TicketUpdate) -> Result<Ticket> {
        let before = self.saved(id);
        let ticket = self.local.update_ticket(id, update.clone())?;
        let patch = patch_from(&update, &ticket);
        self.sync(
            PendingOp::UpdateTicket {
                id: id.to_string(),
                patch,
            },
            Some(before),
        )?;
        Ok(self.local.ticket(id).unwrap_or(ticket))
    }

    pub fn assign_ticket(&mut self, id: &str, assignee_id: &str) -> Result<Ticket> {
        let before = self.saved(id);
        let ticket = self.local.assign_ticket(id, assignee_id)?;
        let patch = TicketPatch {
            assigned_to: Some(Some(assignee_id.to_string())),
            ..TicketPatch::touch(ticket.updated_at)
        };
        self.sync(
            PendingOp::UpdateTicket {
                id: id.to_string(),
                patch,
            },
            Some(before),
        )?;
        Ok(self.local.ticket(id).unwrap_or(ticket))
    }

    pub fn unassign_ticket(&mut self, id: &str) -> Result<Ticket> {
        let before = self.saved(id);
        let ticket = self.local.unassign_ticket(id)?;
        let patch = TicketPatch {
            assigned_to: Some(None),
            ..TicketPatch::touch(ticket.updated_at)
        };
        self.sync(
            PendingOp::UpdateTicket {
                id: id.to_string(),
                patch,
            },
            Some(before),
        )?;
        Ok(self.local.ticket(id).unwrap_or(ticket))
    }

    pub fn delete_ticket(&mut self, id: &str) -> Result<bool> {
        let before = self.saved(id);
        if !self.local.delete_ticket(id)? {
            return Ok(false);
        }
        self.sync(PendingOp::DeleteTicket(id.to_string()), Some(before))?;
        Ok(true)
    }

    pub fn add_reply(&mut self, ticket_id: &str, draft: ReplyDraft) -> Result<Reply> {
        let before = self.saved(ticket_id);
        let reply = self.local.add_reply(ticket_id, draft)?;
        self.sync(PendingOp::AddReply(reply.clone()), Some(before))?;
        Ok(reply)
    }

    pub fn vote_ticket(&mut self, ticket_id: &str, direction: VoteDirection, user_id: &str) -> Result<Ticket> {
        let before = self.saved(ticket_id);
        let ticket = self.local.vote_ticket(ticket_id, direction, user_id)?;
        self.sync(
            PendingOp::Vote {
                ticket_id: ticket_id.to_string(),
                user_id: user_id.to_string(),
            },
            Some(before),
        )?;
        Ok(self.local.ticket(ticket_id).unwrap_or(ticket))
    }

    pub fn remove_vote(&mut self, ticket_id: &str, user_id: &str) -> Result<bool> {
        let before = self.saved(ticket_id);
        if !self.local.remove_vote(ticket_id, user_id)? {
            return Ok(false);
        }
        self.sync(
            PendingOp::Vote {
                ticket_id: ticket_id.to_string(),
                user_id: user_id.to_string(),
            },
            Some(before),
        )?;
        Ok(true)
    }

    // Users and categories. Rolling these back is not supported; a
    // dropped write just leaves the local copy ahead until `refresh`.

    pub fn add_user(&mut self, draft: UserDraft) -> Result<User> {
        let user = self.local.add_user(draft)?;
        self.sync(PendingOp::SaveUser(user.id.clone()), None)?;
        Ok(user)
    }

    pub fn update_user(&mut self, id: &str, update: UserUpdate) -> Result<User> {
        let user = self.local.update_user(id, update)?;
        self.sync(PendingOp::SaveUser(user.id.clone()), None)?;
        Ok(user)
    }

    pub fn record_login(&mut self, id: &str) -> Result<User> {
        let user = self.local.record_login(id)?;
        self.sync(PendingOp::SaveUser(user.id.clone()), None)?;
        Ok(user)
    }

    /// Session only; the remote has no notion of who is signed in here.
    pub fn set_current_user(&mut self, user: Option<User>) -> Result<()> {
        self.local.set_current_user(user)
    }

    pub fn add_category(&mut self, draft: CategoryDraft) -> Result<Category> {
        let category = self.local.add_category(draft)?;
        self.sync(PendingOp::SaveCategory(category.id.clone()), None)?;
        Ok(category)
    }

    /// A rename also moves the tickets filed under the old name.
    pub fn update_category(&mut self, id: &str, update: CategoryUpdate) -> Result<Category> {
        let before = self.local.tickets();
        let category = self.local.update_category(id, update)?;

        let mut ops = vec![(PendingOp::SaveCategory(category.id.clone()), None)];
        for old in before {
            let Some(ticket) = self.local.ticket(&old.id) else {
                continue;
            };
            if ticket.category == old.category {
                continue;
            }
            let patch = TicketPatch {
                fields: TicketUpdate {
                    category: Some(ticket.category.clone()),
                    ..Default::default()
                },
                ..TicketPatch::touch(ticket.updated_at)
            };
            let saved = (old.id.clone(), Some(old), self.local.votes_for(&ticket.id));
            ops.push((PendingOp::UpdateTicket { id: ticket.id, patch }, Some(saved)));
        }

        self.sync_all(ops)?;
        Ok(category)
    }

    pub fn delete_category(&mut self, id: &str) -> Result<bool> {
        if !self.local.delete_category(id)? {
            return Ok(false);
        }
        self.sync(PendingOp::SaveCategory(id.to_string()), None)?;
        Ok(true)
    }

    /// Seed defaults locally when empty and push them.
    pub fn initialize_data(&mut self) -> Result<bool> {
        if !self.local.initialize_data()? {
            return Ok(false);
        }
        let ops = self.directory_ops();
        self.sync_all(ops)?;
        Ok(true)
    }

    fn directory_ops(&self) -> Vec<(PendingOp, Option<SavedTicket>)> {
        let users = self.local.users().into_iter().map(|u| PendingOp::SaveUser(u.id));
        let categories = self
            .local
            .categories()
            .into_iter()
            .map(|c| PendingOp::SaveCategory(c.id));
        users.chain(categories).map(|op| (op, None)).collect()
    }

    /// Replace the local state with an export and push whatever the
    /// remote does not have yet. Tickets it already has are left alone.
    pub fn import(&mut self, json: &str) -> Result<usize> {
        self.local.from_json(json)?;
        let mut ops = self.directory_ops();
        let mut created = 0;
        for ticket in self.local.tickets() {
            if self.remote.get_ticket(&ticket.id)?.is_none() {
                ops.push((PendingOp::CreateTicket(ticket.id), None));
                created += 1;
            }
        }
        self.sync_all(ops)?;
        info!(created, "imported snapshot");
        Ok(created)
    }

    // Reconciliation

    /// Replay queued writes in order. Stops at the first failure that may
    /// pass on a later try, leaving it and everything after it queued.
    /// Writes the remote rejects are undone locally and dropped; the first
    /// such rejection is returned once the rest of the queue has been sent.
    pub fn retry_pending(&mut self) -> Result<usize> {
        let mut sent = 0;
        let mut rejected = None;
        while let Some(front) = self.pending.front() {
            let op = front.op.clone();
            match self.send(&op, true) {
                Ok(()) => {
                    self.pending.pop_front();
                    sent += 1;
                }
                Err(err) if err.is_retryable() => return Err(unavailable(err)),
                Err(err) => {
                    if let Some(front) = self.pending.pop_front() {
                        self.discard(front, &err)?;
                    }
                    rejected.get_or_insert(err);
                }
            }
        }
        if sent > 0 {
            info!(sent, "replayed pending writes");
        }
        match rejected {
            Some(err) => Err(err),
            None => Ok(sent),
        }
    }

    /// Drop every queued write and put affected tickets back the way they
    /// were before the first of them.
    pub fn rollback_pending(&mut self) -> Result<usize> {
        let dropped = self.pending.len();
        let mut saved: Vec<SavedTicket> = Vec::new();
        for pending in self.pending.drain(..) {
            if let Some(before) = pending.before {
                if saved.iter().all(|(id, _, _)| *id != before.0) {
                    saved.push(before);
                }
            }
        }
        self.local.restore_tickets(saved)?;
        if dropped > 0 {
            warn!(dropped, "rolled back pending writes");
        }
        Ok(dropped)
    }

    /// Pull users, categories and tickets from the remote. Tickets with
    /// queued writes keep their local copy.
    pub fn refresh(&mut self) -> Result<()> {
        let users = self.remote.list_users()?;
        let categories = self.remote.list_categories()?;
        self.local.reconcile_directory(users, categories)?;

        let views = self.remote.list_tickets(&TicketFilter::default())?;
        let gone: Vec<SavedTicket> = self
            .local
            .tickets()
            .into_iter()
            .filter(|t| !self.has_pending(&t.id) && views.iter().all(|v| v.ticket.id != t.id))
            .map(|t| (t.id, None, Vec::new()))
            .collect();
        let count = views.len();
        for view in views {
            if self.has_pending(&view.ticket.id) {
                continue;
            }
            self.adopt(view)?;
        }
        if !gone.is_empty() {
            debug!(removed = gone.len(), "dropping tickets the remote no longer has");
            self.local.restore_tickets(gone)?;
        }
        info!(tickets = count, "refreshed from remote");
        Ok(())
    }

    /// React to a change notification. Returns whether the local copy
    /// changed. A stale remote row never replaces a newer local edit.
    pub fn apply_change(&mut self, event: &ChangeEvent) -> Result<bool> {
        let id = event.ticket_id.as_str();
        if self.has_pending(id) {
            debug!(ticket = id, "skipping change, local write pending");
            return Ok(false);
        }

        let local = self.local.ticket(id);
        if event.table == Table::Tickets && event.kind == ChangeKind::Delete {
            if local.is_none() {
                return Ok(false);
            }
            self.local.restore_tickets(vec![(id.to_string(), None, Vec::new())])?;
            return Ok(true);
        }

        let Some(view) = self.remote.get_ticket(id)? else {
            if local.is_some() {
                self.local.restore_tickets(vec![(id.to_string(), None, Vec::new())])?;
                return Ok(true);
            }
            return Ok(false);
        };

        if let Some(ref current) = local {
            if current.updated_at > view.ticket.updated_at {
                warn!(
                    ticket = id,
                    local = %current.updated_at,
                    remote = %view.ticket.updated_at,
                    "ignoring stale remote change"
                );
                return Ok(false);
            }
        }

        let votes_before = self.local.votes_for(id);
        self.adopt(view)?;
        Ok(local != self.local.ticket(id) || votes_before != self.local.votes_for(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{Priority, Status};
    use crate::storage::MemoryStorage;
    use chrono::Duration;
    use std::cell::Cell;
    use tempfile::tempdir;

    /// A remote that can be switched off, or made to fail the next few
    /// `votes_for` reads after a write already went through.
    struct FlakyRemote {
        db: Database,
        down: Cell<bool>,
        failing_reads: Cell<u32>,
    }

    impl FlakyRemote {
        fn check(&self) -> Result<()> {
            if self.down.get() {
                return Err(Error::RemoteUnavailable("connection refused".to_string()));
            }
            Ok(())
        }
    }

    impl RemoteStore for FlakyRemote {
        fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<TicketView>> {
            self.check()?;
            self.db.list_tickets(filter)
        }

        fn get_ticket(&self, id: &str) -> Result<Option<TicketView>> {
            self.check()?;
            self.db.get_ticket(id)
        }

        fn create_ticket(&self, ticket: &Ticket) -> Result<TicketView> {
            self.check()?;
            self.db.create_ticket(ticket)
        }

        fn update_ticket(&self, id: &str, patch: &TicketPatch) -> Result<TicketView> {
            self.check()?;
            self.db.update_ticket(id, patch)
        }

        fn delete_ticket(&self, id: &str) -> Result<bool> {
            self.check()?;
            self.db.delete_ticket(id)
        }

        fn add_reply(&self, reply: &Reply) -> Result<Reply> {
            self.check()?;
            self.db.add_reply(reply)
        }

        fn votes_for(&self, ticket_id: &str) -> Result<Vec<Vote>> {
            self.check()?;
            if self.failing_reads.get() > 0 {
                self.failing_reads.set(self.failing_reads.get() - 1);
                return Err(Error::RemoteUnavailable("timeout".to_string()));
            }
            self.db.votes_for(ticket_id)
        }

        fn upsert_vote(&self, vote: &Vote) -> Result<Vote> {
            self.check()?;
            self.db.upsert_vote(vote)
        }

        fn delete_vote(&self, ticket_id: &str, user_id: &str) -> Result<bool> {
            self.check()?;
            self.db.delete_vote(ticket_id, user_id)
        }

        fn list_users(&self) -> Result<Vec<User>> {
            self.check()?;
            self.db.list_users()
        }

        fn save_user(&self, user: &User) -> Result<User> {
            self.check()?;
            self.db.save_user(user)
        }

        fn list_categories(&self) -> Result<Vec<Category>> {
            self.check()?;
            self.db.list_categories()
        }

        fn save_category(&self, category: &Category) -> Result<Category> {
            self.check()?;
            self.db.save_category(category)
        }

        fn subscribe(&self, topic: Topic) -> Result<Subscription> {
            self.db.subscribe(topic)
        }
    }

    fn setup_store() -> (SyncedStore<MemoryStorage, FlakyRemote>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("remote.db")).unwrap();
        let remote = FlakyRemote {
            db,
            down: Cell::new(false),
            failing_reads: Cell::new(0),
        };
        let local = LocalStore::open(MemoryStorage::new()).unwrap();
        let mut store = SyncedStore::new(local, remote);
        assert!(store.initialize_data().unwrap());
        (store, dir)
    }

    fn draft(subject: &str) -> TicketDraft {
        TicketDraft {
            subject: subject.to_string(),
            description: "Steps to reproduce".to_string(),
            category: "Technical".to_string(),
            priority: Priority::High,
            customer_id: "U-1".to_string(),
            tags: vec!["Login".to_string()],
            ..Default::default()
        }
    }

    fn remote_ticket(store: &SyncedStore<MemoryStorage, FlakyRemote>, id: &str) -> Option<Ticket> {
        store.remote().db.get_ticket(id).unwrap().map(|v| v.ticket)
    }

    fn set_down(store: &SyncedStore<MemoryStorage, FlakyRemote>, down: bool) {
        store.remote().down.set(down);
    }

    // ==================== Unit Tests ====================

    #[test]
    fn test_initialize_pushes_directory() {
        let (store, _dir) = setup_store();
        assert_eq!(store.remote().db.list_users().unwrap().len(), 3);
        assert_eq!(store.remote().db.list_categories().unwrap().len(), 4);
        assert!(store.pending().is_empty());
    }

    #[test]
    fn test_create_ticket_matches_remote() {
        let (mut store, _dir) = setup_store();
        let ticket = store.add_ticket(draft("Cannot log in")).unwrap();

        assert_eq!(remote_ticket(&store, &ticket.id), Some(ticket.clone()));
        assert_eq!(store.local().ticket(&ticket.id), Some(ticket));
    }

    #[test]
    fn test_update_and_assign_reach_remote() {
        let (mut store, _dir) = setup_store();
        let ticket = store.add_ticket(draft("Slow VPN")).unwrap();

        store
            .update_ticket(&ticket.id, TicketUpdate::status(Status::InProgress))
            .unwrap();
        let assigned = store.assign_ticket(&ticket.id, "U-2").unwrap();

        let remote = remote_ticket(&store, &ticket.id).unwrap();
        assert_eq!(remote.status, Status::InProgress);
        assert_eq!(remote.assigned_to.as_deref(), Some("U-2"));
        assert_eq!(remote, assigned);

        let unassigned = store.unassign_ticket(&ticket.id).unwrap();
        assert!(unassigned.assigned_to.is_none());
        assert!(remote_ticket(&store, &ticket.id).unwrap().assigned_to.is_none());
    }

    #[test]
    fn test_reply_and_vote_keep_timestamps_in_step() {
        let (mut store, _dir) = setup_store();
        let ticket = store.add_ticket(draft("Thread")).unwrap();

        store
            .add_reply(
                &ticket.id,
                ReplyDraft {
                    author_id: "U-2".to_string(),
                    message: "Looking into it".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        store.vote_ticket(&ticket.id, VoteDirection::Up, "U-1").unwrap();
        store.vote_ticket(&ticket.id, VoteDirection::Down, "U-3").unwrap();

        let local = store.local().ticket(&ticket.id).unwrap();
        let remote = remote_ticket(&store, &ticket.id).unwrap();
        assert_eq!(local, remote);
        assert_eq!(remote.replies.len(), 1);
        assert_eq!((remote.upvotes, remote.downvotes), (1, 1));
        assert_eq!(store.remote().db.votes_for(&ticket.id).unwrap().len(), 2);

        assert!(store.remove_vote(&ticket.id, "U-3").unwrap());
        assert_eq!(remote_ticket(&store, &ticket.id).unwrap().downvotes, 0);
    }

    #[test]
    fn test_delete_reaches_remote() {
        let (mut store, _dir) = setup_store();
        let ticket = store.add_ticket(draft("Short lived")).unwrap();
        assert!(store.delete_ticket(&ticket.id).unwrap());
        assert!(!store.delete_ticket(&ticket.id).unwrap());
        assert!(remote_ticket(&store, &ticket.id).is_none());
    }

    #[test]
    fn test_failed_write_stays_local_and_retries() {
        let (mut store, _dir) = setup_store();
        set_down(&store, true);

        let err = store.add_ticket(draft("Offline")).unwrap_err();
        assert!(matches!(err, Error::RemoteUnavailable(_)));
        let local = store.local().list_tickets(&TicketFilter::default());
        assert_eq!(local.len(), 1);
        let id = local[0].id.clone();
        assert!(store.has_pending(&id));

        // Later writes queue behind the first.
        let err = store
            .update_ticket(&id, TicketUpdate::status(Status::Resolved))
            .unwrap_err();
        assert!(matches!(err, Error::RemoteUnavailable(_)));
        assert_eq!(store.pending().len(), 2);

        assert!(store.retry_pending().is_err());
        assert_eq!(store.pending().len(), 2);

        set_down(&store, false);
        assert_eq!(store.retry_pending().unwrap(), 2);
        assert!(store.pending().is_empty());
        let remote = remote_ticket(&store, &id).unwrap();
        assert_eq!(remote.status, Status::Resolved);
        assert_eq!(store.local().ticket(&id), Some(remote));
    }

    #[test]
    fn test_retry_after_half_applied_create() {
        let (mut store, _dir) = setup_store();
        store.remote().failing_reads.set(1);

        // The row is inserted, then reading it back fails.
        let err = store.add_ticket(draft("Half sent")).unwrap_err();
        assert!(matches!(err, Error::RemoteUnavailable(_)));
        let id = store.local().tickets()[0].id.clone();
        assert!(remote_ticket(&store, &id).is_some());
        assert!(store.has_pending(&id));

        assert_eq!(store.retry_pending().unwrap(), 1);
        assert!(store.pending().is_empty());

        let later = store.add_ticket(draft("After recovery")).unwrap();
        assert_eq!(remote_ticket(&store, &later.id), Some(later));
    }

    #[test]
    fn test_retry_after_half_applied_reply() {
        let (mut store, _dir) = setup_store();
        let ticket = store.add_ticket(draft("Thread")).unwrap();
        store.remote().failing_reads.set(1);

        let reply = ReplyDraft {
            author_id: "U-2".to_string(),
            message: "Looking into it".to_string(),
            ..Default::default()
        };
        assert!(store.add_reply(&ticket.id, reply).is_err());
        assert_eq!(remote_ticket(&store, &ticket.id).unwrap().replies.len(), 1);

        assert_eq!(store.retry_pending().unwrap(), 1);
        let remote = remote_ticket(&store, &ticket.id).unwrap();
        assert_eq!(remote.replies.len(), 1);
        assert_eq!(store.local().ticket(&ticket.id), Some(remote));
    }

    #[test]
    fn test_rejected_write_is_undone_not_queued() {
        let (mut store, _dir) = setup_store();
        set_down(&store, true);
        let _ = store.add_ticket(draft("Clashing id"));
        let id = store.local().tickets()[0].id.clone();
        let _ = store.update_ticket(&id, TicketUpdate::status(Status::Closed));
        assert_eq!(store.pending().len(), 2);

        // Another session takes the same id first.
        let mut other = store.local().ticket(&id).unwrap();
        other.created_at -= Duration::hours(1);
        other.subject = "Someone else's".to_string();
        store.remote().db.create_ticket(&other).unwrap();

        set_down(&store, false);
        let err = store.retry_pending().unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        assert!(store.pending().is_empty());
        assert!(store.local().ticket(&id).is_none());

        let later = store.add_ticket(draft("Still works")).unwrap();
        assert_eq!(remote_ticket(&store, &later.id), Some(later));
    }

    #[test]
    fn test_rollback_restores_pre_write_state() {
        let (mut store, _dir) = setup_store();
        let ticket = store.add_ticket(draft("Original")).unwrap();

        set_down(&store, true);
        let _ = store.update_ticket(
            &ticket.id,
            TicketUpdate {
                subject: Some("Edited".to_string()),
                ..Default::default()
            },
        );
        let _ = store.vote_ticket(&ticket.id, VoteDirection::Up, "U-1");
        let _ = store.add_ticket(draft("Never pushed"));
        assert_eq!(store.local().tickets().len(), 2);

        assert_eq!(store.rollback_pending().unwrap(), 3);
        assert!(store.pending().is_empty());
        assert_eq!(store.local().tickets(), vec![ticket.clone()]);
        assert!(store.local().votes_for(&ticket.id).is_empty());
    }

    #[test]
    fn test_change_for_pending_ticket_is_ignored() {
        let (mut store, _dir) = setup_store();
        let ticket = store.add_ticket(draft("Contested")).unwrap();

        set_down(&store, true);
        let _ = store.update_ticket(&ticket.id, TicketUpdate::status(Status::Closed));
        set_down(&store, false);

        let event = ChangeEvent {
            table: Table::Tickets,
            kind: ChangeKind::Update,
            ticket_id: ticket.id.clone(),
            at: None,
        };
        assert!(!store.apply_change(&event).unwrap());
        assert_eq!(store.local().ticket(&ticket.id).unwrap().status, Status::Closed);
    }

    #[test]
    fn test_stale_remote_row_does_not_clobber_local() {
        let (mut store, _dir) = setup_store();
        let ticket = store.add_ticket(draft("Fresh")).unwrap();
        let edited = store
            .update_ticket(&ticket.id, TicketUpdate::status(Status::InProgress))
            .unwrap();

        // Another writer lands an older row.
        store
            .remote()
            .db
            .update_ticket(
                &ticket.id,
                &TicketPatch {
                    fields: TicketUpdate {
                        subject: Some("Stale".to_string()),
                        ..Default::default()
                    },
                    assigned_to: None,
                    updated_at: edited.updated_at - Duration::seconds(30),
                },
            )
            .unwrap();

        let event = ChangeEvent {
            table: Table::Tickets,
            kind: ChangeKind::Update,
            ticket_id: ticket.id.clone(),
            at: None,
        };
        assert!(!store.apply_change(&event).unwrap());
        assert_eq!(store.local().ticket(&ticket.id), Some(edited));
    }

    #[test]
    fn test_newer_remote_row_is_adopted() {
        let (mut store, _dir) = setup_store();
        let ticket = store.add_ticket(draft("Will change")).unwrap();
        let sub = store.subscribe(Topic::tickets()).unwrap();

        store
            .remote()
            .db
            .update_ticket(
                &ticket.id,
                &TicketPatch {
                    fields: TicketUpdate::status(Status::Resolved),
                    assigned_to: Some(Some("U-3".to_string())),
                    updated_at: ticket.updated_at + Duration::seconds(30),
                },
            )
            .unwrap();

        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert!(store.apply_change(&events[0]).unwrap());
        let local = store.local().ticket(&ticket.id).unwrap();
        assert_eq!(local.status, Status::Resolved);
        assert_eq!(local.assigned_to_name.as_deref(), Some("Michael Chen"));
    }

    #[test]
    fn test_delete_event_removes_local_copy() {
        let (mut store, _dir) = setup_store();
        let ticket = store.add_ticket(draft("Going away")).unwrap();
        store.remote().db.delete_ticket(&ticket.id).unwrap();

        let event = ChangeEvent {
            table: Table::Tickets,
            kind: ChangeKind::Delete,
            ticket_id: ticket.id.clone(),
            at: None,
        };
        assert!(store.apply_change(&event).unwrap());
        assert!(store.local().ticket(&ticket.id).is_none());
        assert!(!store.apply_change(&event).unwrap());
    }

    #[test]
    fn test_refresh_pulls_foreign_tickets() {
        let (mut store, _dir) = setup_store();
        let mine = store.add_ticket(draft("Mine")).unwrap();

        let mut theirs = mine.clone();
        theirs.id = "T-50".to_string();
        theirs.subject = "Theirs".to_string();
        store.remote().db.create_ticket(&theirs).unwrap();
        store.remote().db.delete_ticket(&mine.id).unwrap();

        store.refresh().unwrap();
        let ids: Vec<String> = store.local().tickets().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["T-50".to_string()]);

        // Fresh ids continue past what the remote issued.
        let next = store.add_ticket(draft("Next")).unwrap();
        assert_eq!(next.id, "T-51");
    }

    #[test]
    fn test_directory_writes_reach_remote() {
        let (mut store, _dir) = setup_store();
        let user = store
            .add_user(UserDraft {
                name: "Dana Lee".to_string(),
                email: "dana@example.com".to_string(),
                ..Default::default()
            })
            .unwrap();
        store
            .update_user(
                &user.id,
                UserUpdate {
                    company: Some("Acme".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let category = store
            .add_category(CategoryDraft::new("Hardware", "Broken devices", "red"))
            .unwrap();
        assert!(store.delete_category(&category.id).unwrap());

        let users = store.remote().db.list_users().unwrap();
        let remote_user = users.iter().find(|u| u.id == user.id).unwrap();
        assert_eq!(remote_user.company.as_deref(), Some("Acme"));

        let categories = store.remote().db.list_categories().unwrap();
        let remote_category = categories.iter().find(|c| c.id == category.id).unwrap();
        assert!(!remote_category.is_active);
    }

    #[test]
    fn test_import_pushes_threads() {
        let (mut source, _src_dir) = setup_store();
        let ticket = source.add_ticket(draft("Exported")).unwrap();
        source
            .add_reply(
                &ticket.id,
                ReplyDraft {
                    author_id: "U-2".to_string(),
                    message: "On it".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        source.vote_ticket(&ticket.id, VoteDirection::Up, "U-1").unwrap();
        let json = source.local().to_json().unwrap();

        let dir = tempdir().unwrap();
        let remote = FlakyRemote {
            db: Database::open(&dir.path().join("fresh.db")).unwrap(),
            down: Cell::new(false),
            failing_reads: Cell::new(0),
        };
        let mut target = SyncedStore::new(LocalStore::open(MemoryStorage::new()).unwrap(), remote);
        assert_eq!(target.import(&json).unwrap(), 1);

        let pushed = remote_ticket(&target, &ticket.id).unwrap();
        assert_eq!(pushed.replies.len(), 1);
        assert_eq!(pushed.upvotes, 1);
        assert_eq!(target.local().ticket(&ticket.id), Some(pushed));

        // Importing again creates nothing new.
        assert_eq!(target.import(&json).unwrap(), 0);
    }

    #[test]
    fn test_local_validation_never_reaches_remote() {
        let (mut store, _dir) = setup_store();
        let err = store.add_ticket(draft("   ")).unwrap_err();
        assert_eq!(err.field(), Some("subject"));
        assert!(store.pending().is_empty());
        assert!(store.remote().db.list_tickets(&TicketFilter::default()).unwrap().is_empty());
    }
}
