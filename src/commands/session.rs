use anyhow::{bail, Result};

use quickdesk::models::UserStatus;

use super::{require_user, Desk};

pub fn login(desk: &mut Desk, email: &str) -> Result<()> {
    let user = match desk.local().user_by_email(email) {
        Some(u) => u,
        None => bail!("No user with email {}", email.trim()),
    };
    if user.status != UserStatus::Active {
        bail!("User {} is inactive", user.email);
    }

    let user = desk.record_login(&user.id)?;
    desk.set_current_user(Some(user.clone()))?;
    println!("Logged in as {} ({})", user.name, user.role);
    Ok(())
}

pub fn logout(desk: &mut Desk) -> Result<()> {
    match desk.local().current_user() {
        Some(user) => {
            desk.set_current_user(None)?;
            println!("Logged out {}", user.name);
        }
        None => println!("Not logged in."),
    }
    Ok(())
}

pub fn whoami(desk: &Desk) -> Result<()> {
    let user = require_user(desk)?;
    println!("{} <{}>", user.name, user.email);
    println!("ID: {}", user.id);
    println!("Role: {}", user.role);
    if let Some(dept) = &user.department {
        println!("Department: {}", dept);
    }
    if let Some(last) = user.last_login {
        println!("Last login: {}", last.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
}
