use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, ValidationError};

/// Closed string enums shared by the store, the SQLite schema and the CLI.
macro_rules! string_enum {
    ($name:ident, $field:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => {
                        let valid: Vec<&str> = $name::ALL.iter().map(|v| v.as_str()).collect();
                        Err(ValidationError::new(
                            $field,
                            format!("invalid value '{}'. Must be one of: {}", other, valid.join(", ")),
                        )
                        .into())
                    }
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Agent,
    Admin,
}

string_enum!(Role, "role", { User => "user", Agent => "agent", Admin => "admin" });

impl Role {
    /// Agents and admins work the whole queue; end users only see their own tickets.
    pub fn is_staff(self) -> bool {
        matches!(self, Role::Agent | Role::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Active,
    Inactive,
}

string_enum!(UserStatus, "status", { Active => "active", Inactive => "inactive" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

string_enum!(Priority, "priority", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    #[default]
    Open,
    InProgress,
    Resolved,
    Closed,
}

string_enum!(Status, "status", {
    Open => "open",
    InProgress => "in-progress",
    Resolved => "resolved",
    Closed => "closed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

string_enum!(VoteDirection, "direction", { Up => "up", Down => "down" });

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tickets_created: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tickets_resolved: Option<u32>,
    /// Hours.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_response_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_rating: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<UserStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub name: String,
    pub description: String,
    pub color: String,
    /// Recomputed from ticket membership on every ticket mutation.
    pub ticket_count: u32,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    pub subject: String,
    pub description: String,
    pub category: String,
    pub priority: Priority,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub customer_id: String,
    pub customer_name: String,
    pub customer_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to_name: Option<String>,
    pub replies: Vec<Reply>,
    pub attachments: Vec<String>,
    pub upvotes: u32,
    pub downvotes: u32,
    pub tags: BTreeSet<String>,
}

impl Ticket {
    /// Replies a customer may see; internal agent notes are filtered out.
    pub fn public_replies(&self) -> impl Iterator<Item = &Reply> {
        self.replies.iter().filter(|r| !r.is_internal)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub id: String,
    pub ticket_id: String,
    pub author_id: String,
    pub author_name: String,
    pub author_role: Role,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub attachments: Vec<String>,
    #[serde(default)]
    pub is_internal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub ticket_id: String,
    pub user_id: String,
    pub direction: VoteDirection,
    pub created_at: DateTime<Utc>,
}

// Drafts and updates. Drafts carry what the caller supplies at creation;
// updates enumerate only the fields that may change afterwards.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketDraft {
    pub subject: String,
    pub description: String,
    /// Category id or name.
    pub category: String,
    pub priority: Priority,
    pub customer_id: String,
    pub attachments: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketUpdate {
    pub subject: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub priority: Option<Priority>,
    pub status: Option<Status>,
    pub attachments: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
}

impl TicketUpdate {
    pub fn is_empty(&self) -> bool {
        self.subject.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.priority.is_none()
            && self.status.is_none()
            && self.attachments.is_none()
            && self.tags.is_none()
    }

    pub fn status(status: Status) -> Self {
        TicketUpdate {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyDraft {
    pub author_id: String,
    pub message: String,
    pub attachments: Vec<String>,
    pub is_internal: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserDraft {
    pub name: String,
    pub email: String,
    pub role: Role,
    pub status: UserStatus,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub bio: Option<String>,
    pub company: Option<String>,
    pub department: Option<String>,
    pub permissions: Option<Vec<String>>,
    pub stats: Option<UserStats>,
}

/// Profile fields: `Some("")` clears the field, `None` leaves it unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    pub status: Option<UserStatus>,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub bio: Option<String>,
    pub company: Option<String>,
    pub department: Option<String>,
    pub permissions: Option<Vec<String>>,
    pub stats: Option<UserStats>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryDraft {
    pub name: String,
    pub description: String,
    pub color: String,
    pub is_active: bool,
}

impl CategoryDraft {
    pub fn new(name: &str, description: &str, color: &str) -> Self {
        CategoryDraft {
            name: name.to_string(),
            description: description.to_string(),
            color: color.to_string(),
            is_active: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategoryUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub is_active: Option<bool>,
}

/// Who a ticket is assigned to, for filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignee {
    Unassigned,
    User(String),
}

/// Criteria for ticket lists. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketFilter {
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    /// Category name, compared case-insensitively.
    pub category: Option<String>,
    pub customer_id: Option<String>,
    pub assignee: Option<Assignee>,
    /// Case-insensitive substring of subject, description or ticket id.
    pub search: Option<String>,
}

impl TicketFilter {
    pub fn matches(&self, ticket: &Ticket) -> bool {
        if let Some(status) = self.status {
            if ticket.status != status {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if ticket.priority != priority {
                return false;
            }
        }
        if let Some(ref category) = self.category {
            if !ticket.category.eq_ignore_ascii_case(category) {
                return false;
            }
        }
        if let Some(ref customer) = self.customer_id {
            if &ticket.customer_id != customer {
                return false;
            }
        }
        match &self.assignee {
            Some(Assignee::Unassigned) if ticket.assigned_to.is_some() => return false,
            Some(Assignee::User(id)) if ticket.assigned_to.as_deref() != Some(id.as_str()) => {
                return false
            }
            _ => {}
        }
        if let Some(ref needle) = self.search {
            let needle = needle.trim().to_lowercase();
            if !needle.is_empty()
                && !ticket.subject.to_lowercase().contains(&needle)
                && !ticket.description.to_lowercase().contains(&needle)
                && !ticket.id.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }
}
