//! The local domain store: tickets, users, categories and votes for one
//! session, persisted as a single snapshot blob.
//!
//! Every mutation runs against a copy of the state. The copy is persisted
//! and swapped in only when the operation succeeds, so a rejected or
//! failed operation never leaves a partial update behind.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::error::{Error, Result, ValidationError};
use crate::models::{
    Category, CategoryDraft, CategoryUpdate, Reply, ReplyDraft, Role, Status, Ticket,
    TicketDraft, TicketFilter, TicketUpdate, User, UserDraft, UserStats, UserStatus, UserUpdate,
    Vote, VoteDirection,
};
use crate::storage::{SnapshotStorage, STORAGE_KEY};

/// Last identifier issued per entity kind. Identifiers are never reused,
/// even after the entity is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sequence {
    pub ticket: u64,
    pub reply: u64,
    pub user: u64,
    pub category: u64,
}

impl Sequence {
    fn issue(counter: &mut u64, prefix: &str) -> String {
        *counter += 1;
        format!("{}-{}", prefix, counter)
    }

    /// Advance past an identifier that was issued elsewhere (e.g. by the remote).
    fn observe(&mut self, id: &str) {
        let Some((prefix, n)) = id.split_once('-') else {
            return;
        };
        let Ok(n) = n.parse::<u64>() else {
            return;
        };
        let counter = match prefix {
            "T" => &mut self.ticket,
            "R" => &mut self.reply,
            "U" => &mut self.user,
            "C" => &mut self.category,
            _ => return,
        };
        *counter = (*counter).max(n);
    }
}

/// Everything the store persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub tickets: Vec<Ticket>,
    pub users: Vec<User>,
    pub categories: Vec<Category>,
    #[serde(default)]
    pub votes: Vec<Vote>,
    pub current_user: Option<User>,
    #[serde(default)]
    pub sequence: Sequence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TicketStats {
    pub total: usize,
    pub open: usize,
    pub in_progress: usize,
    pub resolved: usize,
    pub closed: usize,
    pub unassigned: usize,
}

impl TicketStats {
    fn tally<'a>(tickets: impl Iterator<Item = &'a Ticket>) -> Self {
        let mut stats = TicketStats::default();
        for ticket in tickets {
            stats.total += 1;
            match ticket.status {
                Status::Open => stats.open += 1,
                Status::InProgress => stats.in_progress += 1,
                Status::Resolved => stats.resolved += 1,
                Status::Closed => stats.closed += 1,
            }
            if ticket.assigned_to.is_none() {
                stats.unassigned += 1;
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SystemStats {
    pub users: usize,
    pub active_users: usize,
    pub agents: usize,
    pub active_categories: usize,
    pub tickets: TicketStats,
}

fn required(field: &'static str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(field, "must not be empty").into());
    }
    Ok(trimmed.to_string())
}

fn normalize_email(email: &str) -> Result<String> {
    let email = required("email", email)?.to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(ValidationError::new("email", format!("'{}' is not an email address", email)).into()),
    }
}

fn normalize_tags(tags: &[String]) -> BTreeSet<String> {
    tags.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn clean_names(names: &[String]) -> Vec<String> {
    names
        .iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect()
}

/// Empty string clears an optional profile field.
fn patch_optional(slot: &mut Option<String>, value: &Option<String>) {
    if let Some(v) = value {
        let v = v.trim();
        *slot = if v.is_empty() { None } else { Some(v.to_string()) };
    }
}

impl State {
    /// Strictly increasing timestamp, even when the wall clock is not.
    /// Microsecond precision, which is what the remote keeps.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let next = match self.last_stamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(next);
        next
    }

    fn ticket_index(&self, id: &str) -> Result<usize> {
        self.tickets
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| Error::not_found("Ticket", id))
    }

    fn user_ref(&self, field: &'static str, id: &str) -> Result<&User> {
        self.users
            .iter()
            .find(|u| u.id == id)
            .ok_or_else(|| ValidationError::new(field, format!("user '{}' does not exist", id)).into())
    }

    /// Resolve a category by id or name, preferring an active match.
    fn resolve_category(&self, reference: &str) -> Result<&Category> {
        let reference = required("category", reference)?;
        let found = self
            .categories
            .iter()
            .filter(|c| c.id == reference || c.name.eq_ignore_ascii_case(&reference))
            .max_by_key(|c| c.is_active);
        match found {
            None => Err(ValidationError::new("category", format!("'{}' does not exist", reference)).into()),
            Some(c) if !c.is_active => {
                Err(ValidationError::new("category", format!("'{}' is inactive", c.name)).into())
            }
            Some(c) => Ok(c),
        }
    }

    fn ensure_email_free(&self, email: &str, except: Option<&str>) -> Result<()> {
        let taken = self
            .users
            .iter()
            .any(|u| Some(u.id.as_str()) != except && u.email.eq_ignore_ascii_case(email));
        if taken {
            return Err(ValidationError::new("email", format!("'{}' is already registered", email)).into());
        }
        Ok(())
    }

    fn ensure_category_name_free(&self, name: &str, except: Option<&str>) -> Result<()> {
        let taken = self
            .categories
            .iter()
            .any(|c| c.is_active && Some(c.id.as_str()) != except && c.name.eq_ignore_ascii_case(name));
        if taken {
            return Err(ValidationError::new("name", format!("category '{}' already exists", name)).into());
        }
        Ok(())
    }

    /// Each ticket counts once, toward the category its name resolves to.
    /// An active category wins over an inactive one with the same name.
    fn recount_categories(&mut self) {
        let mut counts = vec![0u32; self.categories.len()];
        for ticket in &self.tickets {
            let owner = self
                .categories
                .iter()
                .enumerate()
                .filter(|(_, c)| c.name.eq_ignore_ascii_case(&ticket.category))
                .max_by_key(|(_, c)| c.is_active);
            if let Some((idx, _)) = owner {
                counts[idx] += 1;
            }
        }
        for (category, count) in self.categories.iter_mut().zip(counts) {
            category.ticket_count = count;
        }
    }

    /// Recompute a ticket's counters from its vote records.
    fn tally_votes(&mut self, ticket_id: &str) {
        let (mut up, mut down) = (0u32, 0u32);
        for vote in self.votes.iter().filter(|v| v.ticket_id == ticket_id) {
            match vote.direction {
                VoteDirection::Up => up += 1,
                VoteDirection::Down => down += 1,
            }
        }
        if let Some(ticket) = self.tickets.iter_mut().find(|t| t.id == ticket_id) {
            ticket.upvotes = up;
            ticket.downvotes = down;
        }
    }

    fn add_ticket(&mut self, draft: TicketDraft) -> Result<Ticket> {
        let subject = required("subject", &draft.subject)?;
        let description = required("description", &draft.description)?;
        let category = self.resolve_category(&draft.category)?.name.clone();
        let customer = self.user_ref("customer_id", &draft.customer_id)?.clone();

        let now = self.stamp();
        let ticket = Ticket {
            id: Sequence::issue(&mut self.sequence.ticket, "T"),
            subject,
            description,
            category,
            priority: draft.priority,
            status: Status::Open,
            created_at: now,
            updated_at: now,
            customer_id: customer.id,
            customer_name: customer.name,
            customer_email: customer.email,
            assigned_to: None,
            assigned_to_name: None,
            replies: Vec::new(),
            attachments: clean_names(&draft.attachments),
            upvotes: 0,
            downvotes: 0,
            tags: normalize_tags(&draft.tags),
        };
        self.tickets.push(ticket.clone());
        self.recount_categories();
        Ok(ticket)
    }

    fn update_ticket(&mut self, id: &str, update: TicketUpdate) -> Result<Ticket> {
        if update.is_empty() {
            return Err(ValidationError::new("update", "nothing to update").into());
        }
        let idx = self.ticket_index(id)?;

        let subject = update.subject.as_deref().map(|s| required("subject", s)).transpose()?;
        let description = update
            .description
            .as_deref()
            .map(|d| required("description", d))
            .transpose()?;
        let category = match update.category.as_deref() {
            Some(reference) => Some(self.resolve_category(reference)?.name.clone()),
            None => None,
        };

        let now = self.stamp();
        let ticket = &mut self.tickets[idx];
        if let Some(subject) = subject {
            ticket.subject = subject;
        }
        if let Some(description) = description {
            ticket.description = description;
        }
        if let Some(category) = category {
            ticket.category = category;
        }
        if let Some(priority) = update.priority {
            ticket.priority = priority;
        }
        if let Some(status) = update.status {
            ticket.status = status;
        }
        if let Some(ref attachments) = update.attachments {
            ticket.attachments = clean_names(attachments);
        }
        if let Some(ref tags) = update.tags {
            ticket.tags = normalize_tags(tags);
        }
        ticket.updated_at = now;
        let updated = ticket.clone();
        self.recount_categories();
        Ok(updated)
    }

    fn assign_ticket(&mut self, id: &str, assignee_id: Option<&str>) -> Result<Ticket> {
        let idx = self.ticket_index(id)?;
        let assignee = match assignee_id {
            Some(user_id) => {
                let user = self.user_ref("assigned_to", user_id)?;
                if !user.role.is_staff() {
                    return Err(ValidationError::new(
                        "assigned_to",
                        format!("{} is not an agent or admin", user.name),
                    )
                    .into());
                }
                Some((user.id.clone(), user.name.clone()))
            }
            None => None,
        };

        let now = self.stamp();
        let ticket = &mut self.tickets[idx];
        let (assigned_to, assigned_to_name) = assignee.unzip();
        ticket.assigned_to = assigned_to;
        ticket.assigned_to_name = assigned_to_name;
        ticket.updated_at = now;
        Ok(ticket.clone())
    }

    fn delete_ticket(&mut self, id: &str) -> bool {
        let before = self.tickets.len();
        self.tickets.retain(|t| t.id != id);
        if self.tickets.len() == before {
            return false;
        }
        self.votes.retain(|v| v.ticket_id != id);
        self.recount_categories();
        true
    }

    fn add_reply(&mut self, ticket_id: &str, draft: ReplyDraft) -> Result<Reply> {
        let idx = self.ticket_index(ticket_id)?;
        let author = self.user_ref("author_id", &draft.author_id)?;
        let (author_id, author_name, author_role) = (author.id.clone(), author.name.clone(), author.role);
        let message = required("message", &draft.message)?;

        let now = self.stamp();
        let reply = Reply {
            id: Sequence::issue(&mut self.sequence.reply, "R"),
            ticket_id: ticket_id.to_string(),
            author_id,
            author_name,
            author_role,
            message,
            created_at: now,
            attachments: clean_names(&draft.attachments),
            is_internal: draft.is_internal,
        };
        let ticket = &mut self.tickets[idx];
        ticket.replies.push(reply.clone());
        ticket.updated_at = now;
        Ok(reply)
    }

    fn vote_ticket(&mut self, ticket_id: &str, direction: VoteDirection, user_id: &str) -> Result<Ticket> {
        let idx = self.ticket_index(ticket_id)?;
        self.user_ref("user_id", user_id)?;

        let existing = self
            .votes
            .iter()
            .position(|v| v.ticket_id == ticket_id && v.user_id == user_id);
        if existing.is_some_and(|pos| self.votes[pos].direction == direction) {
            return Ok(self.tickets[idx].clone());
        }

        let now = self.stamp();
        match existing {
            Some(pos) => {
                let vote = &mut self.votes[pos];
                vote.direction = direction;
                vote.created_at = now;
            }
            None => self.votes.push(Vote {
                ticket_id: ticket_id.to_string(),
                user_id: user_id.to_string(),
                direction,
                created_at: now,
            }),
        }
        self.tally_votes(ticket_id);
        self.tickets[idx].updated_at = now;
        Ok(self.tickets[idx].clone())
    }

    fn remove_vote(&mut self, ticket_id: &str, user_id: &str) -> Result<bool> {
        let idx = self.ticket_index(ticket_id)?;
        let before = self.votes.len();
        self.votes
            .retain(|v| !(v.ticket_id == ticket_id && v.user_id == user_id));
        if self.votes.len() == before {
            return Ok(false);
        }
        self.tally_votes(ticket_id);
        let now = self.stamp();
        self.tickets[idx].updated_at = now;
        Ok(true)
    }

    fn add_user(&mut self, draft: UserDraft) -> Result<User> {
        let name = required("name", &draft.name)?;
        let email = normalize_email(&draft.email)?;
        self.ensure_email_free(&email, None)?;

        let now = self.stamp();
        let mut user = User {
            id: Sequence::issue(&mut self.sequence.user, "U"),
            name,
            email,
            role: draft.role,
            status: draft.status,
            created_at: now,
            last_login: None,
            phone: None,
            location: None,
            bio: None,
            company: None,
            department: None,
            permissions: draft.permissions,
            stats: draft.stats,
        };
        patch_optional(&mut user.phone, &draft.phone);
        patch_optional(&mut user.location, &draft.location);
        patch_optional(&mut user.bio, &draft.bio);
        patch_optional(&mut user.company, &draft.company);
        patch_optional(&mut user.department, &draft.department);
        self.users.push(user.clone());
        Ok(user)
    }

    fn update_user(&mut self, id: &str, update: UserUpdate) -> Result<User> {
        let idx = self
            .users
            .iter()
            .position(|u| u.id == id)
            .ok_or_else(|| Error::not_found("User", id))?;
        let name = update.name.as_deref().map(|n| required("name", n)).transpose()?;
        let email = update.email.as_deref().map(normalize_email).transpose()?;
        if let Some(ref email) = email {
            self.ensure_email_free(email, Some(id))?;
        }

        let user = &mut self.users[idx];
        if let Some(name) = name {
            user.name = name;
        }
        if let Some(email) = email {
            user.email = email;
        }
        if let Some(role) = update.role {
            user.role = role;
        }
        if let Some(status) = update.status {
            user.status = status;
        }
        patch_optional(&mut user.phone, &update.phone);
        patch_optional(&mut user.location, &update.location);
        patch_optional(&mut user.bio, &update.bio);
        patch_optional(&mut user.company, &update.company);
        patch_optional(&mut user.department, &update.department);
        if let Some(permissions) = update.permissions {
            user.permissions = Some(permissions);
        }
        if let Some(stats) = update.stats {
            user.stats = Some(stats);
        }
        let updated = user.clone();

        if self.current_user.as_ref().is_some_and(|u| u.id == id) {
            self.current_user = Some(updated.clone());
        }
        Ok(updated)
    }

    fn record_login(&mut self, id: &str) -> Result<User> {
        let now = self.stamp();
        let user = self
            .users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| Error::not_found("User", id))?;
        user.last_login = Some(now);
        let updated = user.clone();
        if self.current_user.as_ref().is_some_and(|u| u.id == id) {
            self.current_user = Some(updated.clone());
        }
        Ok(updated)
    }

    fn delete_user(&mut self, id: &str) -> bool {
        let before = self.users.len();
        self.users.retain(|u| u.id != id);
        if self.current_user.as_ref().is_some_and(|u| u.id == id) {
            self.current_user = None;
        }
        self.users.len() != before
    }

    fn add_category(&mut self, draft: CategoryDraft) -> Result<Category> {
        let name = required("name", &draft.name)?;
        if draft.is_active {
            self.ensure_category_name_free(&name, None)?;
        }
        let color = match draft.color.trim() {
            "" => "gray".to_string(),
            c => c.to_string(),
        };
        let category = Category {
            id: Sequence::issue(&mut self.sequence.category, "C"),
            name,
            description: draft.description.trim().to_string(),
            color,
            ticket_count: 0,
            is_active: draft.is_active,
        };
        let id = category.id.clone();
        self.categories.push(category);
        self.recount_categories();
        self.categories
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("Category", &id))
    }

    fn update_category(&mut self, id: &str, update: CategoryUpdate) -> Result<Category> {
        let idx = self
            .categories
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| Error::not_found("Category", id))?;
        let name = update.name.as_deref().map(|n| required("name", n)).transpose()?;
        let will_be_active = update.is_active.unwrap_or(self.categories[idx].is_active);
        if will_be_active {
            let check = name
                .clone()
                .unwrap_or_else(|| self.categories[idx].name.clone());
            self.ensure_category_name_free(&check, Some(id))?;
        }

        let old_name = self.categories[idx].name.clone();
        if let Some(ref new_name) = name {
            if new_name != &old_name {
                // Tickets reference categories by name; carry them over.
                let now = self.stamp();
                for ticket in self
                    .tickets
                    .iter_mut()
                    .filter(|t| t.category.eq_ignore_ascii_case(&old_name))
                {
                    ticket.category = new_name.clone();
                    ticket.updated_at = now;
                }
            }
        }

        let category = &mut self.categories[idx];
        if let Some(name) = name {
            category.name = name;
        }
        if let Some(description) = update.description {
            category.description = description.trim().to_string();
        }
        if let Some(color) = update.color {
            category.color = color.trim().to_string();
        }
        if let Some(active) = update.is_active {
            category.is_active = active;
        }
        self.recount_categories();
        Ok(self.categories[idx].clone())
    }

    fn deactivate_category(&mut self, id: &str) -> bool {
        let Some(category) = self.categories.iter_mut().find(|c| c.id == id) else {
            return false;
        };
        category.is_active = false;
        self.recount_categories();
        true
    }

    fn seed(&mut self) -> bool {
        let mut seeded = false;
        if self.categories.is_empty() {
            for (name, description, color) in [
                ("Technical", "Technical issues and bugs", "blue"),
                ("Account", "Account and login related", "green"),
                ("Billing", "Billing and payment issues", "orange"),
                ("Feature", "Feature requests", "purple"),
            ] {
                self.categories.push(Category {
                    id: Sequence::issue(&mut self.sequence.category, "C"),
                    name: name.to_string(),
                    description: description.to_string(),
                    color: color.to_string(),
                    ticket_count: 0,
                    is_active: true,
                });
            }
            self.recount_categories();
            seeded = true;
        }

        if self.users.is_empty() {
            let defaults = [
                UserDraft {
                    name: "John Doe".to_string(),
                    email: "john@example.com".to_string(),
                    role: Role::User,
                    company: Some("Tech Corp".to_string()),
                    department: Some("Engineering".to_string()),
                    ..Default::default()
                },
                UserDraft {
                    name: "Sarah Johnson".to_string(),
                    email: "sarah@quickdesk.com".to_string(),
                    role: Role::Agent,
                    department: Some("Customer Support".to_string()),
                    stats: Some(UserStats {
                        tickets_created: None,
                        tickets_resolved: Some(342),
                        avg_response_time: Some(2.4),
                        customer_rating: Some(4.8),
                    }),
                    ..Default::default()
                },
                UserDraft {
                    name: "Michael Chen".to_string(),
                    email: "michael@quickdesk.com".to_string(),
                    role: Role::Admin,
                    department: Some("IT Administration".to_string()),
                    permissions: Some(
                        ["user-management", "system-config", "analytics", "security"]
                            .iter()
                            .map(|p| p.to_string())
                            .collect(),
                    ),
                    ..Default::default()
                },
            ];
            for draft in defaults {
                // Seed data is valid and the collection is empty.
                if self.add_user(draft).is_ok() {
                    seeded = true;
                }
            }
        }
        seeded
    }

    /// Replace one ticket (and its votes) with an authoritative copy.
    fn reconcile_ticket(&mut self, ticket: Ticket, votes: Vec<Vote>) {
        self.sequence.observe(&ticket.id);
        for reply in &ticket.replies {
            self.sequence.observe(&reply.id);
        }
        if self.last_stamp.map_or(true, |last| last < ticket.updated_at) {
            self.last_stamp = Some(ticket.updated_at);
        }
        let id = ticket.id.clone();
        match self.tickets.iter_mut().find(|t| t.id == id) {
            Some(slot) => *slot = ticket,
            None => self.tickets.push(ticket),
        }
        self.votes.retain(|v| v.ticket_id != id);
        self.votes.extend(votes);
        self.tally_votes(&id);
        self.recount_categories();
    }

    /// Re-derive everything an imported snapshot could get wrong: one vote
    /// per (ticket, user) with the last record winning, no votes for missing
    /// tickets, counters from the records, and category counts.
    fn rederive(&mut self) {
        let mut votes: Vec<Vote> = Vec::with_capacity(self.votes.len());
        for vote in std::mem::take(&mut self.votes) {
            if !self.tickets.iter().any(|t| t.id == vote.ticket_id) {
                continue;
            }
            votes.retain(|v| !(v.ticket_id == vote.ticket_id && v.user_id == vote.user_id));
            votes.push(vote);
        }
        self.votes = votes;

        let ids: Vec<String> = self.tickets.iter().map(|t| t.id.clone()).collect();
        for id in &ids {
            self.tally_votes(id);
        }
        self.recount_categories();

        let newest = self.tickets.iter().map(|t| t.updated_at).max();
        if newest > self.last_stamp {
            self.last_stamp = newest;
        }
    }

    fn reconcile_directory(&mut self, users: Vec<User>, categories: Vec<Category>) {
        for user in &users {
            self.sequence.observe(&user.id);
        }
        for category in &categories {
            self.sequence.observe(&category.id);
        }
        if let Some(current) = self.current_user.as_ref() {
            self.current_user = users.iter().find(|u| u.id == current.id).cloned();
        }
        self.users = users;
        self.categories = categories;
        self.recount_categories();
    }
}

/// The session's view of tickets, users and categories.
pub struct LocalStore<S: SnapshotStorage> {
    storage: S,
    state: State,
}

impl<S: SnapshotStorage> LocalStore<S> {
    /// Restore the snapshot saved in `storage`, or start empty.
    pub fn open(storage: S) -> Result<Self> {
        let state = match storage.load(STORAGE_KEY)? {
            Some(blob) => serde_json::from_str(&blob)?,
            None => State::default(),
        };
        debug!(tickets = state.tickets.len(), users = state.users.len(), "restored store snapshot");
        Ok(LocalStore { storage, state })
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn commit<T>(&mut self, op: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut next = self.state.clone();
        let out = op(&mut next)?;
        let blob = serde_json::to_string(&next)?;
        self.storage.save(STORAGE_KEY, &blob)?;
        self.state = next;
        Ok(out)
    }

    // Tickets

    pub fn add_ticket(&mut self, draft: TicketDraft) -> Result<Ticket> {
        let ticket = self.commit(|s| s.add_ticket(draft))?;
        debug!(id = %ticket.id, category = %ticket.category, "created ticket");
        Ok(ticket)
    }

    /// Apply a partial update. Unknown ids are `Error::NotFound`.
    pub fn update_ticket(&mut self, id: &str, update: TicketUpdate) -> Result<Ticket> {
        let ticket = self.commit(|s| s.update_ticket(id, update))?;
        debug!(id, status = %ticket.status, "updated ticket");
        Ok(ticket)
    }

    pub fn assign_ticket(&mut self, id: &str, assignee_id: &str) -> Result<Ticket> {
        let ticket = self.commit(|s| s.assign_ticket(id, Some(assignee_id)))?;
        debug!(id, assignee = assignee_id, "assigned ticket");
        Ok(ticket)
    }

    pub fn unassign_ticket(&mut self, id: &str) -> Result<Ticket> {
        self.commit(|s| s.assign_ticket(id, None))
    }

    /// Remove a ticket along with its replies and votes. Returns whether
    /// anything was removed; a missing id is not an error.
    pub fn delete_ticket(&mut self, id: &str) -> Result<bool> {
        if self.state.tickets.iter().all(|t| t.id != id) {
            return Ok(false);
        }
        let removed = self.commit(|s| Ok(s.delete_ticket(id)))?;
        debug!(id, "deleted ticket");
        Ok(removed)
    }

    pub fn add_reply(&mut self, ticket_id: &str, draft: ReplyDraft) -> Result<Reply> {
        let reply = self.commit(|s| s.add_reply(ticket_id, draft))?;
        debug!(ticket = ticket_id, id = %reply.id, internal = reply.is_internal, "added reply");
        Ok(reply)
    }

    /// Record `user_id`'s vote. Repeating a vote changes nothing; voting
    /// the other way moves the vote. Counters always match the records.
    pub fn vote_ticket(&mut self, ticket_id: &str, direction: VoteDirection, user_id: &str) -> Result<Ticket> {
        let ticket = self.commit(|s| s.vote_ticket(ticket_id, direction, user_id))?;
        debug!(
            ticket = ticket_id,
            user = user_id,
            %direction,
            up = ticket.upvotes,
            down = ticket.downvotes,
            "recorded vote"
        );
        Ok(ticket)
    }

    pub fn remove_vote(&mut self, ticket_id: &str, user_id: &str) -> Result<bool> {
        self.commit(|s| s.remove_vote(ticket_id, user_id))
    }

    // Users

    pub fn add_user(&mut self, draft: UserDraft) -> Result<User> {
        let user = self.commit(|s| s.add_user(draft))?;
        debug!(id = %user.id, role = %user.role, "added user");
        Ok(user)
    }

    /// Patch a user. The session's current user is refreshed when it is
    /// the same account. Ticket snapshots are left untouched.
    pub fn update_user(&mut self, id: &str, update: UserUpdate) -> Result<User> {
        let user = self.commit(|s| s.update_user(id, update))?;
        debug!(id, "updated user");
        Ok(user)
    }

    pub fn delete_user(&mut self, id: &str) -> Result<bool> {
        self.commit(|s| Ok(s.delete_user(id)))
    }

    pub fn set_current_user(&mut self, user: Option<User>) -> Result<()> {
        self.commit(|s| {
            s.current_user = user;
            Ok(())
        })
    }

    pub fn record_login(&mut self, id: &str) -> Result<User> {
        self.commit(|s| s.record_login(id))
    }

    // Categories

    pub fn add_category(&mut self, draft: CategoryDraft) -> Result<Category> {
        let category = self.commit(|s| s.add_category(draft))?;
        debug!(id = %category.id, name = %category.name, "added category");
        Ok(category)
    }

    pub fn update_category(&mut self, id: &str, update: CategoryUpdate) -> Result<Category> {
        self.commit(|s| s.update_category(id, update))
    }

    /// Deactivate a category. It stays in storage and tickets keep it.
    pub fn delete_category(&mut self, id: &str) -> Result<bool> {
        let found = self.commit(|s| Ok(s.deactivate_category(id)))?;
        if found {
            debug!(id, "deactivated category");
        }
        Ok(found)
    }

    /// Seed default categories and users into empty collections. Safe to
    /// call on every start; returns whether anything was added.
    pub fn initialize_data(&mut self) -> Result<bool> {
        if !self.state.categories.is_empty() && !self.state.users.is_empty() {
            return Ok(false);
        }
        let seeded = self.commit(|s| Ok(s.seed()))?;
        if seeded {
            info!(
                categories = self.state.categories.len(),
                users = self.state.users.len(),
                "seeded default data"
            );
        }
        Ok(seeded)
    }

    pub(crate) fn reconcile_ticket(&mut self, ticket: Ticket, votes: Vec<Vote>) -> Result<()> {
        self.commit(|s| {
            s.reconcile_ticket(ticket, votes);
            Ok(())
        })
    }

    pub(crate) fn reconcile_directory(&mut self, users: Vec<User>, categories: Vec<Category>) -> Result<()> {
        self.commit(|s| {
            s.reconcile_directory(users, categories);
            Ok(())
        })
    }

    /// Put back tickets exactly as they were before a failed remote write.
    pub(crate) fn restore_tickets(&mut self, saved: Vec<(String, Option<Ticket>, Vec<Vote>)>) -> Result<()> {
        self.commit(|s| {
            for (id, ticket, votes) in saved {
                s.tickets.retain(|t| t.id != id);
                s.votes.retain(|v| v.ticket_id != id);
                if let Some(ticket) = ticket {
                    s.tickets.push(ticket);
                    s.votes.extend(votes);
                }
            }
            s.tickets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            s.recount_categories();
            Ok(())
        })
    }

    // Queries

    pub fn tickets(&self) -> Vec<Ticket> {
        self.state.tickets.clone()
    }

    pub fn ticket(&self, id: &str) -> Option<Ticket> {
        self.state.tickets.iter().find(|t| t.id == id).cloned()
    }

    /// Tickets matching `filter`, newest first.
    pub fn list_tickets(&self, filter: &TicketFilter) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self
            .state
            .tickets
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tickets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tickets
    }

    /// What `viewer` may see: end users only get their own tickets.
    pub fn visible_tickets(&self, viewer: &User, filter: &TicketFilter) -> Vec<Ticket> {
        if viewer.role.is_staff() {
            return self.list_tickets(filter);
        }
        let own = TicketFilter {
            customer_id: Some(viewer.id.clone()),
            ..filter.clone()
        };
        self.list_tickets(&own)
    }

    pub fn users(&self) -> Vec<User> {
        self.state.users.clone()
    }

    pub fn user(&self, id: &str) -> Option<User> {
        self.state.users.iter().find(|u| u.id == id).cloned()
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let email = email.trim();
        self.state
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned()
    }

    pub fn current_user(&self) -> Option<User> {
        self.state.current_user.clone()
    }

    pub fn categories(&self) -> Vec<Category> {
        self.state.categories.clone()
    }

    pub fn category(&self, id: &str) -> Option<Category> {
        self.state.categories.iter().find(|c| c.id == id).cloned()
    }

    /// Categories offered when creating a ticket.
    pub fn active_categories(&self) -> Vec<Category> {
        self.state
            .categories
            .iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect()
    }

    pub fn votes_for(&self, ticket_id: &str) -> Vec<Vote> {
        self.state
            .votes
            .iter()
            .filter(|v| v.ticket_id == ticket_id)
            .cloned()
            .collect()
    }

    pub fn vote_of(&self, ticket_id: &str, user_id: &str) -> Option<VoteDirection> {
        self.state
            .votes
            .iter()
            .find(|v| v.ticket_id == ticket_id && v.user_id == user_id)
            .map(|v| v.direction)
    }

    pub fn stats(&self, filter: &TicketFilter) -> TicketStats {
        TicketStats::tally(self.state.tickets.iter().filter(|t| filter.matches(t)))
    }

    pub fn system_stats(&self) -> SystemStats {
        SystemStats {
            users: self.state.users.len(),
            active_users: self
                .state
                .users
                .iter()
                .filter(|u| u.status == UserStatus::Active)
                .count(),
            agents: self.state.users.iter().filter(|u| u.role == Role::Agent).count(),
            active_categories: self.state.categories.iter().filter(|c| c.is_active).count(),
            tickets: TicketStats::tally(self.state.tickets.iter()),
        }
    }

    pub fn snapshot(&self) -> State {
        self.state.clone()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.state)?)
    }

    /// Replace the whole state with a previously exported one.
    pub fn from_json(&mut self, json: &str) -> Result<()> {
        let mut imported: State = serde_json::from_str(json)?;
        // Older exports may predate the sequence; never hand out a taken id.
        let ids: Vec<String> = imported
            .tickets
            .iter()
            .flat_map(|t| std::iter::once(t.id.clone()).chain(t.replies.iter().map(|r| r.id.clone())))
            .chain(imported.users.iter().map(|u| u.id.clone()))
            .chain(imported.categories.iter().map(|c| c.id.clone()))
            .collect();
        for id in &ids {
            imported.sequence.observe(id);
        }
        imported.rederive();
        let blob = serde_json::to_string(&imported)?;
        self.storage.save(STORAGE_KEY, &blob)?;
        info!(tickets = imported.tickets.len(), "imported store snapshot");
        self.state = imported;
        Ok(())
    }
}
