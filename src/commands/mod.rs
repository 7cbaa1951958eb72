pub mod assign;
pub mod category;
pub mod create;
pub mod delete;
pub mod export;
pub mod init;
pub mod list;
pub mod reply;
pub mod session;
pub mod show;
pub mod stats;
pub mod status;
pub mod update;
pub mod user;
pub mod vote;
pub mod watch;

use anyhow::{bail, Context, Result};

use quickdesk::db::Database;
use quickdesk::models::{Role, Ticket, User};
use quickdesk::store::LocalStore;
use quickdesk::sync::SyncedStore;

/// The CLI keeps its snapshot in the same SQLite file it syncs against.
pub type Desk<'a> = SyncedStore<&'a Database, &'a Database>;

pub fn open_desk(db: &Database) -> Result<Desk<'_>> {
    let local = LocalStore::open(db).context("Failed to restore local snapshot")?;
    let mut desk = SyncedStore::new(local, db);
    desk.refresh().context("Failed to load tickets")?;
    Ok(desk)
}

pub fn require_user(desk: &Desk) -> Result<User> {
    match desk.local().current_user() {
        Some(user) => Ok(user),
        None => bail!("Not logged in. Run 'quickdesk login <email>' first."),
    }
}

pub fn require_staff(desk: &Desk) -> Result<User> {
    let user = require_user(desk)?;
    if !user.role.is_staff() {
        bail!("Only agents and admins can do that");
    }
    Ok(user)
}

pub fn require_admin(desk: &Desk) -> Result<User> {
    let user = require_user(desk)?;
    if user.role != Role::Admin {
        bail!("Only admins can do that");
    }
    Ok(user)
}

/// A ticket the current user is allowed to see. End users only see their own.
pub fn visible_ticket(desk: &Desk, user: &User, id: &str) -> Result<Ticket> {
    match desk.local().ticket(id) {
        Some(t) if user.role.is_staff() || t.customer_id == user.id => Ok(t),
        _ => bail!("Ticket {} not found", id),
    }
}

pub fn truncate(s: &str, max_chars: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars - 3).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tempfile::tempdir;

    pub fn setup_test_db() -> (Database, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let db = Database::open(&db_path).unwrap();
        (db, dir)
    }

    /// Seeded desk signed in as `email`.
    pub fn signed_in<'a>(db: &'a Database, email: &str) -> Desk<'a> {
        let mut desk = open_desk(db).unwrap();
        desk.initialize_data().unwrap();
        let user = desk.local().user_by_email(email).unwrap();
        desk.set_current_user(Some(user)).unwrap();
        desk
    }

    pub const CUSTOMER: &str = "john@example.com";
    pub const AGENT: &str = "sarah@quickdesk.com";
    pub const ADMIN: &str = "michael@quickdesk.com";
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer subject", 10), "a much ...");
    }

    #[test]
    fn test_require_user_when_logged_out() {
        let (db, _dir) = setup_test_db();
        let desk = open_desk(&db).unwrap();
        let err = require_user(&desk).unwrap_err();
        assert!(err.to_string().contains("Not logged in"));
    }

    #[test]
    fn test_roles_gate_staff_actions() {
        let (db, _dir) = setup_test_db();
        let desk = signed_in(&db, CUSTOMER);
        assert!(require_staff(&desk).is_err());
        assert!(require_admin(&desk).is_err());

        let desk = signed_in(&db, AGENT);
        assert!(require_staff(&desk).is_ok());
        assert!(require_admin(&desk).is_err());
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let (db, _dir) = setup_test_db();
        {
            signed_in(&db, AGENT);
        }
        let desk = open_desk(&db).unwrap();
        assert_eq!(desk.local().current_user().unwrap().email, AGENT);
        assert_eq!(desk.local().users().len(), 3);
    }
}
