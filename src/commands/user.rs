use anyhow::{bail, Result};

use quickdesk::models::{Role, User, UserDraft, UserStatus, UserUpdate};

use super::{require_admin, require_user, truncate, Desk};

/// Look a user up by id or email.
fn find(desk: &Desk, reference: &str) -> Result<User> {
    let found = desk
        .local()
        .users()
        .into_iter()
        .find(|u| u.id == reference)
        .or_else(|| desk.local().user_by_email(reference));
    match found {
        Some(u) => Ok(u),
        None => bail!("User {} not found", reference),
    }
}

pub fn add(
    desk: &mut Desk,
    name: &str,
    email: &str,
    role: &str,
    department: Option<&str>,
    company: Option<&str>,
) -> Result<()> {
    require_admin(desk)?;
    let user = desk.add_user(UserDraft {
        name: name.to_string(),
        email: email.to_string(),
        role: role.parse()?,
        department: department.map(str::to_string),
        company: company.map(str::to_string),
        ..Default::default()
    })?;
    println!("Created user {} <{}> ({})", user.name, user.email, user.id);
    Ok(())
}

pub fn list(desk: &Desk, role: Option<&str>) -> Result<()> {
    require_admin(desk)?;
    let role: Option<Role> = role.map(str::parse).transpose()?;
    let users: Vec<User> = desk
        .local()
        .users()
        .into_iter()
        .filter(|u| role.is_none_or(|r| u.role == r))
        .collect();

    if users.is_empty() {
        println!("No users found.");
        return Ok(());
    }
    for u in users {
        let state = if u.status == UserStatus::Active { "" } else { " [inactive]" };
        println!(
            "{:<6} {:<6} {:<24} {}{}",
            u.id,
            u.role,
            truncate(&u.email, 24),
            u.name,
            state
        );
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct UserArgs<'a> {
    pub name: Option<&'a str>,
    pub email: Option<&'a str>,
    pub role: Option<&'a str>,
    pub status: Option<&'a str>,
    pub phone: Option<&'a str>,
    pub location: Option<&'a str>,
    pub bio: Option<&'a str>,
    pub company: Option<&'a str>,
    pub department: Option<&'a str>,
}

impl UserArgs<'_> {
    fn is_empty(&self) -> bool {
        [
            self.name,
            self.email,
            self.role,
            self.status,
            self.phone,
            self.location,
            self.bio,
            self.company,
            self.department,
        ]
        .iter()
        .all(Option::is_none)
    }
}

/// Users may edit their own profile. Role and status changes, and edits
/// to anyone else, need an admin. An empty value clears a profile field.
pub fn update(desk: &mut Desk, reference: &str, args: UserArgs) -> Result<()> {
    let current = require_user(desk)?;
    if args.is_empty() {
        bail!("Nothing to update. Pass at least one field to change");
    }
    let target = find(desk, reference)?;

    let is_admin = current.role == Role::Admin;
    if !is_admin && (target.id != current.id || args.role.is_some() || args.status.is_some()) {
        bail!("Only admins can do that");
    }

    let owned = |v: Option<&str>| v.map(str::to_string);
    let update = UserUpdate {
        name: owned(args.name),
        email: owned(args.email),
        role: args.role.map(str::parse).transpose()?,
        status: args.status.map(str::parse).transpose()?,
        phone: owned(args.phone),
        location: owned(args.location),
        bio: owned(args.bio),
        company: owned(args.company),
        department: owned(args.department),
        ..Default::default()
    };
    let user = desk.update_user(&target.id, update)?;
    println!("Updated user {} <{}>", user.name, user.email);
    Ok(())
}
