use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::cell::RefCell;
use std::path::Path;
use std::str::FromStr;
use std::sync::mpsc::{self, Sender};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::models::{Category, Reply, Ticket, TicketFilter, User, Vote};
use crate::remote::{
    CategoryTag, ChangeEvent, ChangeKind, RemoteStore, Subscription, Table, TicketPatch,
    TicketView, Topic, UserTag,
};
use crate::storage::SnapshotStorage;

const SCHEMA_VERSION: i32 = 1;

const TICKET_SELECT: &str = r#"
    SELECT t.id, t.subject, t.description, t.status, t.priority,
           COALESCE(c.name, t.category), t.customer_id, t.customer_name, t.customer_email,
           t.assigned_to, t.assigned_to_name, t.attachments, t.tags, t.created_at, t.updated_at,
           (SELECT COUNT(*) FROM votes v WHERE v.ticket_id = t.id AND v.vote_type = 'up'),
           (SELECT COUNT(*) FROM votes v WHERE v.ticket_id = t.id AND v.vote_type = 'down'),
           c.id, c.color, a.name, a.email
    FROM tickets t
    LEFT JOIN categories c ON c.id = t.category_id
    LEFT JOIN users a ON a.id = t.assigned_to
"#;

const USER_COLUMNS: &str = "id, name, email, role, status, created_at, last_login, phone, location, bio, company, department, permissions, stats";

const REPLY_COLUMNS: &str =
    "id, ticket_id, author_id, author_name, author_role, message, created_at, attachments, is_internal";

/// Resolves a category name to its id, preferring the active one.
const CATEGORY_ID_BY_NAME: &str =
    "(SELECT id FROM categories WHERE name = ?{n} COLLATE NOCASE ORDER BY is_active DESC LIMIT 1)";

/// SQLite-backed ticket service. Holds the relational tables the local
/// store mirrors, plus a key/value table for the local snapshot itself.
pub struct Database {
    conn: Connection,
    subscribers: RefCell<Vec<(Topic, Sender<ChangeEvent>)>>,
    watermark: RefCell<String>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::RemoteUnavailable(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn,
            subscribers: RefCell::new(Vec::new()),
            watermark: RefCell::new(timestamp(&Utc::now())),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap_or(0);

        if version < SCHEMA_VERSION {
            self.conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                    role TEXT NOT NULL DEFAULT 'user',
                    status TEXT NOT NULL DEFAULT 'active',
                    created_at TEXT NOT NULL,
                    last_login TEXT,
                    phone TEXT,
                    location TEXT,
                    bio TEXT,
                    company TEXT,
                    department TEXT,
                    permissions TEXT,
                    stats TEXT
                );

                CREATE TABLE IF NOT EXISTS categories (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    color TEXT NOT NULL DEFAULT 'gray',
                    is_active INTEGER NOT NULL DEFAULT 1
                );

                -- customer_* and assigned_to_name are snapshots taken at write time
                CREATE TABLE IF NOT EXISTS tickets (
                    id TEXT PRIMARY KEY,
                    subject TEXT NOT NULL,
                    description TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'open',
                    priority TEXT NOT NULL DEFAULT 'medium',
                    category_id TEXT,
                    category TEXT NOT NULL,
                    customer_id TEXT NOT NULL,
                    customer_name TEXT NOT NULL,
                    customer_email TEXT NOT NULL,
                    assigned_to TEXT,
                    assigned_to_name TEXT,
                    attachments TEXT NOT NULL DEFAULT '[]',
                    tags TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    FOREIGN KEY (category_id) REFERENCES categories(id),
                    FOREIGN KEY (customer_id) REFERENCES users(id),
                    FOREIGN KEY (assigned_to) REFERENCES users(id)
                );

                CREATE TABLE IF NOT EXISTS replies (
                    id TEXT PRIMARY KEY,
                    ticket_id TEXT NOT NULL,
                    author_id TEXT NOT NULL,
                    author_name TEXT NOT NULL,
                    author_role TEXT NOT NULL,
                    message TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    attachments TEXT NOT NULL DEFAULT '[]',
                    is_internal INTEGER NOT NULL DEFAULT 0,
                    FOREIGN KEY (ticket_id) REFERENCES tickets(id) ON DELETE CASCADE,
                    FOREIGN KEY (author_id) REFERENCES users(id)
                );

                -- One vote per user per ticket
                CREATE TABLE IF NOT EXISTS votes (
                    ticket_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    vote_type TEXT NOT NULL CHECK (vote_type IN ('up', 'down')),
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (ticket_id, user_id),
                    FOREIGN KEY (ticket_id) REFERENCES tickets(id) ON DELETE CASCADE,
                    FOREIGN KEY (user_id) REFERENCES users(id)
                );

                -- Local store snapshots
                CREATE TABLE IF NOT EXISTS kv (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);
                CREATE INDEX IF NOT EXISTS idx_tickets_priority ON tickets(priority);
                CREATE INDEX IF NOT EXISTS idx_tickets_customer ON tickets(customer_id);
                CREATE INDEX IF NOT EXISTS idx_tickets_assigned ON tickets(assigned_to);
                CREATE INDEX IF NOT EXISTS idx_tickets_updated ON tickets(updated_at);
                CREATE INDEX IF NOT EXISTS idx_replies_ticket ON replies(ticket_id);
                CREATE INDEX IF NOT EXISTS idx_votes_ticket ON votes(ticket_id);
                "#,
            )?;

            self.conn
                .execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
        }

        // Enable foreign keys
        self.conn.execute("PRAGMA foreign_keys = ON", [])?;

        Ok(())
    }

    fn publish(&self, table: Table, kind: ChangeKind, ticket_id: &str, at: Option<DateTime<Utc>>) {
        let event = ChangeEvent {
            table,
            kind,
            ticket_id: ticket_id.to_string(),
            at,
        };
        trace!(?event.table, ?event.kind, ticket = ticket_id, "publishing change");
        self.subscribers
            .borrow_mut()
            .retain(|(topic, tx)| !topic.matches(&event) || tx.send(event.clone()).is_ok());
    }

    /// Publish changes written by other connections since the last poll.
    /// Deletions are not visible this way. Returns the number of events.
    pub fn poll_changes(&self) -> Result<usize> {
        let since = self.watermark.borrow().clone();
        let mut newest = since.clone();
        let mut events: Vec<(String, Table, ChangeKind, String)> = Vec::new();

        let mut stmt = self
            .conn
            .prepare("SELECT id, created_at, updated_at FROM tickets WHERE updated_at > ?1")?;
        let rows = stmt
            .query_map([&since], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (id, created, updated) in rows {
            let kind = if created == updated {
                ChangeKind::Insert
            } else {
                ChangeKind::Update
            };
            events.push((updated, Table::Tickets, kind, id));
        }

        for (sql, table, kind) in [
            (
                "SELECT ticket_id, created_at FROM replies WHERE created_at > ?1",
                Table::Replies,
                ChangeKind::Insert,
            ),
            (
                "SELECT ticket_id, created_at FROM votes WHERE created_at > ?1",
                Table::Votes,
                ChangeKind::Update,
            ),
        ] {
            let mut stmt = self.conn.prepare(sql)?;
            let rows = stmt
                .query_map([&since], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for (ticket_id, at) in rows {
                events.push((at, table, kind, ticket_id));
            }
        }

        events.sort_by(|a, b| a.0.cmp(&b.0));
        for (at, table, kind, ticket_id) in &events {
            if *at > newest {
                newest = at.clone();
            }
            self.publish(*table, *kind, ticket_id, Some(parse_datetime(at.clone())));
        }
        *self.watermark.borrow_mut() = newest;
        Ok(events.len())
    }

    fn ticket_exists(&self, id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM tickets WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn get_replies(&self, ticket_id: &str) -> Result<Vec<Reply>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM replies WHERE ticket_id = ?1 ORDER BY created_at, rowid",
            REPLY_COLUMNS
        ))?;
        let replies = stmt
            .query_map([ticket_id], reply_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(replies)
    }

    fn with_replies(&self, mut view: TicketView) -> Result<TicketView> {
        view.ticket.replies = self.get_replies(&view.ticket.id)?;
        Ok(view)
    }

    fn require_ticket(&self, id: &str) -> Result<TicketView> {
        self.get_ticket(id)?
            .ok_or_else(|| Error::not_found("Ticket", id))
    }
}

impl SnapshotStorage for Database {
    fn load(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .map_err(|e| Error::Storage(e.to_string()))
    }

    fn save(&self, key: &str, blob: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, blob],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }
}

impl RemoteStore for Database {
    fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<TicketView>> {
        let mut sql = String::from(TICKET_SELECT);
        let mut conditions = Vec::new();
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("t.status = ?".to_string());
            params_vec.push(Box::new(status.as_str()));
        }

        if let Some(priority) = filter.priority {
            conditions.push("t.priority = ?".to_string());
            params_vec.push(Box::new(priority.as_str()));
        }

        if let Some(ref category) = filter.category {
            conditions.push("COALESCE(c.name, t.category) = ? COLLATE NOCASE".to_string());
            params_vec.push(Box::new(category.clone()));
        }

        if let Some(ref customer) = filter.customer_id {
            conditions.push("t.customer_id = ?".to_string());
            params_vec.push(Box::new(customer.clone()));
        }

        match filter.assignee {
            Some(crate::models::Assignee::Unassigned) => {
                conditions.push("t.assigned_to IS NULL".to_string());
            }
            Some(crate::models::Assignee::User(ref id)) => {
                conditions.push("t.assigned_to = ?".to_string());
                params_vec.push(Box::new(id.clone()));
            }
            None => {}
        }

        if let Some(ref text) = filter.search {
            let text = text.trim();
            if !text.is_empty() {
                conditions.push(
                    "(t.subject LIKE ? ESCAPE '\\' OR t.description LIKE ? ESCAPE '\\' OR t.id LIKE ? ESCAPE '\\')"
                        .to_string(),
                );
                let pattern = like_pattern(text);
                for _ in 0..3 {
                    params_vec.push(Box::new(pattern.clone()));
                }
            }
        }

        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        sql.push_str(" ORDER BY t.created_at DESC, t.rowid DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

        let views = stmt
            .query_map(params_refs.as_slice(), ticket_view_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        views.into_iter().map(|v| self.with_replies(v)).collect()
    }

    fn get_ticket(&self, id: &str) -> Result<Option<TicketView>> {
        let sql = format!("{} WHERE t.id = ?1", TICKET_SELECT);
        let view = self
            .conn
            .query_row(&sql, [id], ticket_view_from_row)
            .optional()?;
        view.map(|v| self.with_replies(v)).transpose()
    }

    fn create_ticket(&self, ticket: &Ticket) -> Result<TicketView> {
        let sql = format!(
            "INSERT INTO tickets (id, subject, description, status, priority, category_id, category,
                customer_id, customer_name, customer_email, assigned_to, assigned_to_name,
                attachments, tags, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, {}, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            CATEGORY_ID_BY_NAME.replace("{n}", "6")
        );
        self.conn.execute(
            &sql,
            params![
                ticket.id,
                ticket.subject,
                ticket.description,
                ticket.status.as_str(),
                ticket.priority.as_str(),
                ticket.category,
                ticket.customer_id,
                ticket.customer_name,
                ticket.customer_email,
                ticket.assigned_to,
                ticket.assigned_to_name,
                serde_json::to_string(&ticket.attachments)?,
                serde_json::to_string(&ticket.tags)?,
                timestamp(&ticket.created_at),
                timestamp(&ticket.updated_at),
            ],
        )?;
        debug!(id = %ticket.id, "inserted ticket row");
        self.publish(Table::Tickets, ChangeKind::Insert, &ticket.id, Some(ticket.updated_at));
        self.require_ticket(&ticket.id)
    }

    fn update_ticket(&self, id: &str, patch: &TicketPatch) -> Result<TicketView> {
        let mut updates = vec!["updated_at = ?1".to_string()];
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(timestamp(&patch.updated_at))];
        let fields = &patch.fields;

        if let Some(ref s) = fields.subject {
            updates.push(format!("subject = ?{}", params_vec.len() + 1));
            params_vec.push(Box::new(s.clone()));
        }

        if let Some(ref d) = fields.description {
            updates.push(format!("description = ?{}", params_vec.len() + 1));
            params_vec.push(Box::new(d.clone()));
        }

        if let Some(ref c) = fields.category {
            let n = (params_vec.len() + 1).to_string();
            updates.push(format!(
                "category = ?{}, category_id = {}",
                n,
                CATEGORY_ID_BY_NAME.replace("{n}", &n)
            ));
            params_vec.push(Box::new(c.clone()));
        }

        if let Some(p) = fields.priority {
            updates.push(format!("priority = ?{}", params_vec.len() + 1));
            params_vec.push(Box::new(p.as_str()));
        }

        if let Some(s) = fields.status {
            updates.push(format!("status = ?{}", params_vec.len() + 1));
            params_vec.push(Box::new(s.as_str()));
        }

        if let Some(ref a) = fields.attachments {
            updates.push(format!("attachments = ?{}", params_vec.len() + 1));
            params_vec.push(Box::new(serde_json::to_string(a)?));
        }

        if let Some(ref t) = fields.tags {
            updates.push(format!("tags = ?{}", params_vec.len() + 1));
            params_vec.push(Box::new(serde_json::to_string(t)?));
        }

        match patch.assigned_to {
            Some(Some(ref user_id)) => {
                let n = params_vec.len() + 1;
                updates.push(format!(
                    "assigned_to = ?{0}, assigned_to_name = (SELECT name FROM users WHERE id = ?{0})",
                    n
                ));
                params_vec.push(Box::new(user_id.clone()));
            }
            Some(None) => updates.push("assigned_to = NULL, assigned_to_name = NULL".to_string()),
            None => {}
        }

        params_vec.push(Box::new(id.to_string()));
        let sql = format!(
            "UPDATE tickets SET {} WHERE id = ?{}",
            updates.join(", "),
            params_vec.len()
        );

        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let rows = self.conn.execute(&sql, params_refs.as_slice())?;
        if rows == 0 {
            return Err(Error::not_found("Ticket", id));
        }
        self.publish(Table::Tickets, ChangeKind::Update, id, Some(patch.updated_at));
        self.require_ticket(id)
    }

    fn delete_ticket(&self, id: &str) -> Result<bool> {
        let rows = self.conn.execute("DELETE FROM tickets WHERE id = ?1", [id])?;
        if rows > 0 {
            self.publish(Table::Tickets, ChangeKind::Delete, id, None);
        }
        Ok(rows > 0)
    }

    fn add_reply(&self, reply: &Reply) -> Result<Reply> {
        if !self.ticket_exists(&reply.ticket_id)? {
            return Err(Error::not_found("Ticket", &reply.ticket_id));
        }
        self.conn.execute(
            &format!(
                "INSERT INTO replies ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                REPLY_COLUMNS
            ),
            params![
                reply.id,
                reply.ticket_id,
                reply.author_id,
                reply.author_name,
                reply.author_role.as_str(),
                reply.message,
                timestamp(&reply.created_at),
                serde_json::to_string(&reply.attachments)?,
                reply.is_internal,
            ],
        )?;
        self.publish(Table::Replies, ChangeKind::Insert, &reply.ticket_id, Some(reply.created_at));

        let stored = self.conn.query_row(
            &format!("SELECT {} FROM replies WHERE id = ?1", REPLY_COLUMNS),
            [&reply.id],
            reply_from_row,
        )?;
        Ok(stored)
    }

    fn votes_for(&self, ticket_id: &str) -> Result<Vec<Vote>> {
        let mut stmt = self.conn.prepare(
            "SELECT ticket_id, user_id, vote_type, created_at FROM votes WHERE ticket_id = ?1 ORDER BY created_at, user_id",
        )?;
        let votes = stmt
            .query_map([ticket_id], vote_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(votes)
    }

    fn upsert_vote(&self, vote: &Vote) -> Result<Vote> {
        if !self.ticket_exists(&vote.ticket_id)? {
            return Err(Error::not_found("Ticket", &vote.ticket_id));
        }
        self.conn.execute(
            "INSERT INTO votes (ticket_id, user_id, vote_type, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(ticket_id, user_id) DO UPDATE SET vote_type = excluded.vote_type, created_at = excluded.created_at",
            params![
                vote.ticket_id,
                vote.user_id,
                vote.direction.as_str(),
                timestamp(&vote.created_at)
            ],
        )?;
        self.publish(Table::Votes, ChangeKind::Update, &vote.ticket_id, Some(vote.created_at));

        let stored = self.conn.query_row(
            "SELECT ticket_id, user_id, vote_type, created_at FROM votes WHERE ticket_id = ?1 AND user_id = ?2",
            params![vote.ticket_id, vote.user_id],
            vote_from_row,
        )?;
        Ok(stored)
    }

    fn delete_vote(&self, ticket_id: &str, user_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM votes WHERE ticket_id = ?1 AND user_id = ?2",
            params![ticket_id, user_id],
        )?;
        if rows > 0 {
            self.publish(Table::Votes, ChangeKind::Delete, ticket_id, None);
        }
        Ok(rows > 0)
    }

    fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM users ORDER BY created_at, rowid", USER_COLUMNS))?;
        let users = stmt
            .query_map([], user_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    fn save_user(&self, user: &User) -> Result<User> {
        let permissions = user.permissions.as_ref().map(serde_json::to_string).transpose()?;
        let stats = user.stats.as_ref().map(serde_json::to_string).transpose()?;
        self.conn.execute(
            &format!(
                "INSERT INTO users ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name, email = excluded.email, role = excluded.role,
                    status = excluded.status, last_login = excluded.last_login,
                    phone = excluded.phone, location = excluded.location, bio = excluded.bio,
                    company = excluded.company, department = excluded.department,
                    permissions = excluded.permissions, stats = excluded.stats",
                USER_COLUMNS
            ),
            params![
                user.id,
                user.name,
                user.email,
                user.role.as_str(),
                user.status.as_str(),
                timestamp(&user.created_at),
                user.last_login.as_ref().map(timestamp),
                user.phone,
                user.location,
                user.bio,
                user.company,
                user.department,
                permissions,
                stats,
            ],
        )?;

        let stored = self.conn.query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
            [&user.id],
            user_from_row,
        )?;
        Ok(stored)
    }

    fn list_categories(&self) -> Result<Vec<Category>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT c.id, c.name, c.description, c.color, c.is_active,
                   (SELECT COUNT(*) FROM tickets t WHERE t.category_id = c.id)
            FROM categories c
            ORDER BY c.rowid
            "#,
        )?;
        let categories = stmt
            .query_map([], category_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(categories)
    }

    fn save_category(&self, category: &Category) -> Result<Category> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO categories (id, name, description, color, is_active) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, description = excluded.description,
                color = excluded.color, is_active = excluded.is_active",
            params![
                category.id,
                category.name,
                category.description,
                category.color,
                category.is_active
            ],
        )?;
        // Keep the denormalized name on tickets in step with a rename
        tx.execute(
            "UPDATE tickets SET category = ?1 WHERE category_id = ?2",
            params![category.name, category.id],
        )?;
        // Tickets written before the category existed here
        tx.execute(
            "UPDATE tickets SET category_id = ?1 WHERE category_id IS NULL AND category = ?2 COLLATE NOCASE",
            params![category.id, category.name],
        )?;
        tx.commit()?;

        let stored = self.conn.query_row(
            r#"
            SELECT c.id, c.name, c.description, c.color, c.is_active,
                   (SELECT COUNT(*) FROM tickets t WHERE t.category_id = c.id)
            FROM categories c WHERE c.id = ?1
            "#,
            [&category.id],
            category_from_row,
        )?;
        Ok(stored)
    }

    fn subscribe(&self, topic: Topic) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.borrow_mut().push((topic.clone(), tx));
        Ok(Subscription::new(topic, rx))
    }
}

fn ticket_view_from_row(row: &Row) -> rusqlite::Result<TicketView> {
    let ticket = Ticket {
        id: row.get(0)?,
        subject: row.get(1)?,
        description: row.get(2)?,
        status: enum_column(row, 3)?,
        priority: enum_column(row, 4)?,
        category: row.get(5)?,
        customer_id: row.get(6)?,
        customer_name: row.get(7)?,
        customer_email: row.get(8)?,
        assigned_to: row.get(9)?,
        assigned_to_name: row.get(10)?,
        attachments: json_column(row, 11)?,
        tags: json_column(row, 12)?,
        created_at: parse_datetime(row.get::<_, String>(13)?),
        updated_at: parse_datetime(row.get::<_, String>(14)?),
        upvotes: row.get(15)?,
        downvotes: row.get(16)?,
        replies: Vec::new(),
    };

    let category = row.get::<_, Option<String>>(17)?.map(|id| CategoryTag {
        id,
        name: ticket.category.clone(),
        color: String::new(),
    });
    let category = match (category, row.get::<_, Option<String>>(18)?) {
        (Some(tag), Some(color)) => Some(CategoryTag { color, ..tag }),
        (tag, _) => tag,
    };

    let assignee = match (
        ticket.assigned_to.clone(),
        row.get::<_, Option<String>>(19)?,
        row.get::<_, Option<String>>(20)?,
    ) {
        (Some(id), Some(name), Some(email)) => Some(UserTag { id, name, email }),
        _ => None,
    };

    Ok(TicketView {
        ticket,
        category,
        assignee,
    })
}

fn reply_from_row(row: &Row) -> rusqlite::Result<Reply> {
    Ok(Reply {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        author_id: row.get(2)?,
        author_name: row.get(3)?,
        author_role: enum_column(row, 4)?,
        message: row.get(5)?,
        created_at: parse_datetime(row.get::<_, String>(6)?),
        attachments: json_column(row, 7)?,
        is_internal: row.get(8)?,
    })
}

fn vote_from_row(row: &Row) -> rusqlite::Result<Vote> {
    Ok(Vote {
        ticket_id: row.get(0)?,
        user_id: row.get(1)?,
        direction: enum_column(row, 2)?,
        created_at: parse_datetime(row.get::<_, String>(3)?),
    })
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        role: enum_column(row, 3)?,
        status: enum_column(row, 4)?,
        created_at: parse_datetime(row.get::<_, String>(5)?),
        last_login: row.get::<_, Option<String>>(6)?.map(parse_datetime),
        phone: row.get(7)?,
        location: row.get(8)?,
        bio: row.get(9)?,
        company: row.get(10)?,
        department: row.get(11)?,
        permissions: optional_json_column(row, 12)?,
        stats: optional_json_column(row, 13)?,
    })
}

fn category_from_row(row: &Row) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        color: row.get(3)?,
        is_active: row.get(4)?,
        ticket_count: row.get(5)?,
    })
}

fn enum_column<T: FromStr<Err = Error>>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

/// `%text%` with LIKE wildcards in `text` escaped.
fn like_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

/// Fixed-width RFC 3339, so stored timestamps sort as text.
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Assignee, Priority, Role, Status, TicketUpdate, UserStatus, VoteDirection};
    use chrono::SubsecRound;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tempfile::tempdir;

    fn setup_test_db() -> (Database, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let db = Database::open(&db_path).unwrap();
        (db, dir)
    }

    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    fn user(id: &str, name: &str, role: Role) -> User {
        User {
            id: id.to_string(),
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase().replace(' ', ".")),
            role,
            status: UserStatus::Active,
            created_at: now(),
            last_login: None,
            phone: None,
            location: None,
            bio: None,
            company: None,
            department: None,
            permissions: None,
            stats: None,
        }
    }

    fn category(id: &str, name: &str) -> Category {
        Category {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            color: "blue".to_string(),
            ticket_count: 0,
            is_active: true,
        }
    }

    fn ticket(id: &str, subject: &str) -> Ticket {
        let at = now();
        Ticket {
            id: id.to_string(),
            subject: subject.to_string(),
            description: "Details".to_string(),
            category: "Technical".to_string(),
            priority: Priority::Medium,
            status: Status::Open,
            created_at: at,
            updated_at: at,
            customer_id: "U-1".to_string(),
            customer_name: "John Doe".to_string(),
            customer_email: "john.doe@example.com".to_string(),
            assigned_to: None,
            assigned_to_name: None,
            replies: Vec::new(),
            attachments: vec!["screenshot.png".to_string()],
            upvotes: 0,
            downvotes: 0,
            tags: BTreeSet::from(["vpn".to_string()]),
        }
    }

    fn seeded_db() -> (Database, tempfile::TempDir) {
        let (db, dir) = setup_test_db();
        db.save_user(&user("U-1", "John Doe", Role::User)).unwrap();
        db.save_user(&user("U-2", "Sarah Johnson", Role::Agent)).unwrap();
        db.save_category(&category("C-1", "Technical")).unwrap();
        db.save_category(&category("C-2", "Billing")).unwrap();
        (db, dir)
    }

    fn vote(ticket: &str, user: &str, direction: VoteDirection) -> Vote {
        Vote {
            ticket_id: ticket.to_string(),
            user_id: user.to_string(),
            direction,
            created_at: now(),
        }
    }

    // ==================== Unit Tests ====================

    #[test]
    fn test_create_and_get_ticket() {
        let (db, _dir) = seeded_db();
        let original = ticket("T-1", "VPN drops");
        let view = db.create_ticket(&original).unwrap();

        assert_eq!(view.ticket, original);
        let tag = view.category.unwrap();
        assert_eq!(tag.id, "C-1");
        assert_eq!(tag.color, "blue");
        assert!(view.assignee.is_none());
        assert_eq!(db.get_ticket("T-1").unwrap().unwrap().ticket, original);
    }

    #[test]
    fn test_duplicate_insert_is_rejected_not_unavailable() {
        let (db, _dir) = seeded_db();
        db.create_ticket(&ticket("T-1", "VPN drops")).unwrap();

        let err = db.create_ticket(&ticket("T-1", "Again")).unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        assert!(!err.is_retryable());
        assert_eq!(db.get_ticket("T-1").unwrap().unwrap().ticket.subject, "VPN drops");
    }

    #[test]
    fn test_get_missing_ticket() {
        let (db, _dir) = seeded_db();
        assert!(db.get_ticket("T-404").unwrap().is_none());
    }

    #[test]
    fn test_list_tickets_newest_first_and_filtered() {
        let (db, _dir) = seeded_db();
        let mut a = ticket("T-1", "Printer jam");
        let mut b = ticket("T-2", "Refund please");
        b.category = "Billing".to_string();
        b.priority = Priority::High;
        b.created_at = a.created_at + chrono::Duration::seconds(1);
        b.updated_at = b.created_at;
        a.status = Status::Resolved;
        db.create_ticket(&a).unwrap();
        db.create_ticket(&b).unwrap();

        let all: Vec<_> = db
            .list_tickets(&TicketFilter::default())
            .unwrap()
            .into_iter()
            .map(|v| v.ticket.id)
            .collect();
        assert_eq!(all, vec!["T-2", "T-1"]);

        let billing = db
            .list_tickets(&TicketFilter {
                category: Some("billing".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(billing.len(), 1);
        assert_eq!(billing[0].ticket.id, "T-2");

        let resolved = db
            .list_tickets(&TicketFilter {
                status: Some(Status::Resolved),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].ticket.id, "T-1");

        let high = db
            .list_tickets(&TicketFilter {
                priority: Some(Priority::High),
                customer_id: Some("U-1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(high.len(), 1);
    }

    #[test]
    fn test_search_tickets() {
        let (db, _dir) = seeded_db();
        db.create_ticket(&ticket("T-1", "Printer jam")).unwrap();
        db.create_ticket(&ticket("T-2", "100% CPU")).unwrap();
        db.create_ticket(&ticket("T-30", "Password reset")).unwrap();

        let by_subject = db.search_tickets("PRINTER", &TicketFilter::default()).unwrap();
        assert_eq!(by_subject.len(), 1);

        let by_id = db.search_tickets("t-3", &TicketFilter::default()).unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].ticket.id, "T-30");

        // Wildcards are literal
        let percent = db.search_tickets("0%", &TicketFilter::default()).unwrap();
        assert_eq!(percent.len(), 1);
        assert!(db.search_tickets("_", &TicketFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_update_ticket_patch() {
        let (db, _dir) = seeded_db();
        let original = ticket("T-1", "Old subject");
        db.create_ticket(&original).unwrap();

        let later = original.updated_at + chrono::Duration::seconds(5);
        let view = db
            .update_ticket(
                "T-1",
                &TicketPatch {
                    fields: TicketUpdate {
                        subject: Some("New subject".to_string()),
                        status: Some(Status::InProgress),
                        category: Some("Billing".to_string()),
                        ..Default::default()
                    },
                    assigned_to: Some(Some("U-2".to_string())),
                    updated_at: later,
                },
            )
            .unwrap();

        assert_eq!(view.ticket.subject, "New subject");
        assert_eq!(view.ticket.status, Status::InProgress);
        assert_eq!(view.ticket.category, "Billing");
        assert_eq!(view.category.unwrap().id, "C-2");
        assert_eq!(view.ticket.assigned_to_name.as_deref(), Some("Sarah Johnson"));
        assert_eq!(view.assignee.unwrap().name, "Sarah Johnson");
        assert_eq!(view.ticket.updated_at, later);
        assert_eq!(view.ticket.description, original.description);

        let unassigned = db
            .update_ticket(
                "T-1",
                &TicketPatch {
                    fields: TicketUpdate::default(),
                    assigned_to: Some(None),
                    updated_at: later,
                },
            )
            .unwrap();
        assert!(unassigned.ticket.assigned_to.is_none());

        let assigned = db
            .list_tickets(&TicketFilter {
                assignee: Some(Assignee::Unassigned),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(assigned.len(), 1);
    }

    #[test]
    fn test_update_missing_ticket_is_not_found() {
        let (db, _dir) = seeded_db();
        let err = db.update_ticket("T-9", &TicketPatch::touch(now())).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_replies_ordered_and_cascade() {
        let (db, _dir) = seeded_db();
        let t = ticket("T-1", "Thread");
        db.create_ticket(&t).unwrap();

        for i in 0..3 {
            db.add_reply(&Reply {
                id: format!("R-{}", i + 1),
                ticket_id: "T-1".to_string(),
                author_id: "U-2".to_string(),
                author_name: "Sarah Johnson".to_string(),
                author_role: Role::Agent,
                message: format!("reply {}", i),
                created_at: t.created_at + chrono::Duration::seconds(i),
                attachments: vec![],
                is_internal: i == 1,
            })
            .unwrap();
        }
        db.upsert_vote(&vote("T-1", "U-1", VoteDirection::Up)).unwrap();

        let view = db.get_ticket("T-1").unwrap().unwrap();
        let messages: Vec<_> = view.ticket.replies.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["reply 0", "reply 1", "reply 2"]);
        assert!(view.ticket.replies[1].is_internal);

        assert!(db.delete_ticket("T-1").unwrap());
        assert!(!db.delete_ticket("T-1").unwrap());
        assert!(db.get_replies("T-1").unwrap().is_empty());
        assert!(db.votes_for("T-1").unwrap().is_empty());
    }

    #[test]
    fn test_reply_to_missing_ticket() {
        let (db, _dir) = seeded_db();
        let err = db
            .add_reply(&Reply {
                id: "R-1".to_string(),
                ticket_id: "T-404".to_string(),
                author_id: "U-1".to_string(),
                author_name: "John Doe".to_string(),
                author_role: Role::User,
                message: "hello?".to_string(),
                created_at: now(),
                attachments: vec![],
                is_internal: false,
            })
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_upsert_vote_overwrites() {
        let (db, _dir) = seeded_db();
        db.create_ticket(&ticket("T-1", "Vote")).unwrap();

        db.upsert_vote(&vote("T-1", "U-1", VoteDirection::Up)).unwrap();
        db.upsert_vote(&vote("T-1", "U-1", VoteDirection::Up)).unwrap();
        let t = db.get_ticket("T-1").unwrap().unwrap().ticket;
        assert_eq!((t.upvotes, t.downvotes), (1, 0));

        db.upsert_vote(&vote("T-1", "U-1", VoteDirection::Down)).unwrap();
        db.upsert_vote(&vote("T-1", "U-2", VoteDirection::Down)).unwrap();
        let t = db.get_ticket("T-1").unwrap().unwrap().ticket;
        assert_eq!((t.upvotes, t.downvotes), (0, 2));
        assert_eq!(db.votes_for("T-1").unwrap().len(), 2);

        assert!(db.delete_vote("T-1", "U-2").unwrap());
        assert!(!db.delete_vote("T-1", "U-2").unwrap());
        let t = db.get_ticket("T-1").unwrap().unwrap().ticket;
        assert_eq!((t.upvotes, t.downvotes), (0, 1));
    }

    #[test]
    fn test_save_user_roundtrip_and_update() {
        let (db, _dir) = setup_test_db();
        let mut u = user("U-1", "John Doe", Role::User);
        u.permissions = Some(vec!["analytics".to_string()]);
        u.stats = Some(crate::models::UserStats {
            tickets_resolved: Some(3),
            ..Default::default()
        });
        assert_eq!(db.save_user(&u).unwrap(), u);

        u.name = "Johnny".to_string();
        u.last_login = Some(now());
        db.save_user(&u).unwrap();
        let users = db.list_users().unwrap();
        assert_eq!(users, vec![u]);
    }

    #[test]
    fn test_category_rename_and_counts() {
        let (db, _dir) = seeded_db();
        db.create_ticket(&ticket("T-1", "One")).unwrap();
        db.create_ticket(&ticket("T-2", "Two")).unwrap();

        let mut renamed = category("C-1", "Engineering");
        renamed.is_active = false;
        let stored = db.save_category(&renamed).unwrap();
        assert_eq!(stored.ticket_count, 2);
        assert!(!stored.is_active);

        let t = db.get_ticket("T-1").unwrap().unwrap().ticket;
        assert_eq!(t.category, "Engineering");

        let all = db.list_categories().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].ticket_count, 0);
    }

    #[test]
    fn test_ticket_before_category_is_linked_later() {
        let (db, _dir) = setup_test_db();
        db.save_user(&user("U-1", "John Doe", Role::User)).unwrap();
        let view = db.create_ticket(&ticket("T-1", "Orphan")).unwrap();
        assert!(view.category.is_none());
        assert_eq!(view.ticket.category, "Technical");

        db.save_category(&category("C-1", "Technical")).unwrap();
        let view = db.get_ticket("T-1").unwrap().unwrap();
        assert_eq!(view.category.unwrap().id, "C-1");
    }

    #[test]
    fn test_kv_snapshot_storage() {
        let (db, _dir) = setup_test_db();
        assert_eq!(db.load("quickdesk-storage").unwrap(), None);
        db.save("quickdesk-storage", "{\"a\":1}").unwrap();
        db.save("quickdesk-storage", "{\"a\":2}").unwrap();
        assert_eq!(db.load("quickdesk-storage").unwrap().as_deref(), Some("{\"a\":2}"));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let db = Database::open(&path).unwrap();
            db.save_user(&user("U-1", "John Doe", Role::User)).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_subscriptions_are_scoped() {
        let (db, _dir) = seeded_db();
        let tickets = db.subscribe(Topic::tickets()).unwrap();
        let votes_t1 = db.subscribe(Topic::votes("T-1")).unwrap();
        let votes_t2 = db.subscribe(Topic::votes("T-2")).unwrap();

        db.create_ticket(&ticket("T-1", "One")).unwrap();
        db.create_ticket(&ticket("T-2", "Two")).unwrap();
        db.upsert_vote(&vote("T-1", "U-1", VoteDirection::Up)).unwrap();

        let events = tickets.drain();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == ChangeKind::Insert));
        assert_eq!(votes_t1.drain().len(), 1);
        assert!(votes_t2.drain().is_empty());

        db.delete_ticket("T-2").unwrap();
        let deleted = tickets.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(deleted.kind, ChangeKind::Delete);
        assert_eq!(deleted.ticket_id, "T-2");
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let (db, _dir) = seeded_db();
        let sub = db.subscribe(Topic::tickets()).unwrap();
        drop(sub);
        db.create_ticket(&ticket("T-1", "One")).unwrap();
        assert!(db.subscribers.borrow().is_empty());
    }

    #[test]
    fn test_poll_changes_sees_other_connections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let watcher = Database::open(&path).unwrap();
        let sub = watcher.subscribe(Topic::tickets()).unwrap();

        let writer = Database::open(&path).unwrap();
        writer.save_user(&user("U-1", "John Doe", Role::User)).unwrap();
        let mut t = ticket("T-1", "From elsewhere");
        t.created_at = now() + chrono::Duration::seconds(1);
        t.updated_at = t.created_at;
        writer.create_ticket(&t).unwrap();

        assert_eq!(watcher.poll_changes().unwrap(), 1);
        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].ticket_id, "T-1");
        assert_eq!(events[0].kind, ChangeKind::Insert);

        assert_eq!(watcher.poll_changes().unwrap(), 0);
    }

    #[test]
    fn test_like_pattern_escapes() {
        assert_eq!(like_pattern("50%_off\\"), "%50\\%\\_off\\\\%");
    }

    #[test]
    fn test_timestamp_is_fixed_width() {
        let a = timestamp(&parse_datetime("2024-01-01T00:00:05Z".to_string()));
        let b = timestamp(&parse_datetime("2024-01-01T00:00:05.5Z".to_string()));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }

    // ==================== Property-Based Tests ====================

    proptest! {
        #[test]
        fn prop_ticket_text_roundtrip(
            subject in "[\\p{L}\\p{N} '\";%_-]{1,40}",
            description in "[\\p{L}\\p{N} \\n]{1,100}"
        ) {
            let (db, _dir) = seeded_db();
            let mut t = ticket("T-1", &subject);
            t.description = description.clone();
            db.create_ticket(&t).unwrap();

            let stored = db.get_ticket("T-1").unwrap().unwrap().ticket;
            prop_assert_eq!(stored.subject, subject);
            prop_assert_eq!(stored.description, description);
        }

        #[test]
        fn prop_vote_rows_unique_per_user(votes in proptest::collection::vec((0usize..2, any::<bool>()), 1..20)) {
            let (db, _dir) = seeded_db();
            db.create_ticket(&ticket("T-1", "Votes")).unwrap();
            let users = ["U-1", "U-2"];
            for (u, up) in &votes {
                let dir = if *up { VoteDirection::Up } else { VoteDirection::Down };
                db.upsert_vote(&vote("T-1", users[*u], dir)).unwrap();
            }
            let rows = db.votes_for("T-1").unwrap();
            let distinct: std::collections::HashSet<_> = votes.iter().map(|(u, _)| *u).collect();
            prop_assert_eq!(rows.len(), distinct.len());

            let t = db.get_ticket("T-1").unwrap().unwrap().ticket;
            prop_assert_eq!((t.upvotes + t.downvotes) as usize, rows.len());
        }
    }
}
