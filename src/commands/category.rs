use anyhow::{bail, Result};

use quickdesk::models::{Category, CategoryDraft, CategoryUpdate, Role};

use super::{require_admin, require_user, Desk};

/// Look a category up by id or case-insensitive name.
fn find(desk: &Desk, reference: &str) -> Result<Category> {
    let categories = desk.local().categories();
    let found = categories
        .iter()
        .find(|c| c.id == reference)
        .or_else(|| categories.iter().find(|c| c.name.eq_ignore_ascii_case(reference.trim())));
    match found {
        Some(c) => Ok(c.clone()),
        None => bail!("Category {} not found", reference),
    }
}

pub fn add(desk: &mut Desk, name: &str, description: &str, color: &str) -> Result<()> {
    require_admin(desk)?;
    let category = desk.add_category(CategoryDraft::new(name, description, color))?;
    println!("Created category {} ({})", category.name, category.id);
    Ok(())
}

/// Admins see inactive categories too.
pub fn list(desk: &Desk) -> Result<()> {
    let user = require_user(desk)?;
    let categories = if user.role == Role::Admin {
        desk.local().categories()
    } else {
        desk.local().active_categories()
    };

    if categories.is_empty() {
        println!("No categories.");
        return Ok(());
    }
    for c in categories {
        let state = if c.is_active { "" } else { " [inactive]" };
        println!(
            "{:<5} {:<14} {:<8} {:>4} tickets  {}{}",
            c.id, c.name, c.color, c.ticket_count, c.description, state
        );
    }
    Ok(())
}

pub fn update(
    desk: &mut Desk,
    reference: &str,
    name: Option<&str>,
    description: Option<&str>,
    color: Option<&str>,
    active: Option<bool>,
) -> Result<()> {
    require_admin(desk)?;
    if name.is_none() && description.is_none() && color.is_none() && active.is_none() {
        bail!("Nothing to update. Use --name, --description, --color or --active");
    }
    let category = find(desk, reference)?;

    let updated = desk.update_category(
        &category.id,
        CategoryUpdate {
            name: name.map(str::to_string),
            description: description.map(str::to_string),
            color: color.map(str::to_string),
            is_active: active,
        },
    )?;
    println!("Updated category {} ({})", updated.name, updated.id);
    Ok(())
}

/// Deactivates; tickets keep their category.
pub fn delete(desk: &mut Desk, reference: &str) -> Result<()> {
    require_admin(desk)?;
    let category = find(desk, reference)?;
    if !category.is_active {
        println!("Category {} is already inactive", category.name);
        return Ok(());
    }
    desk.delete_category(&category.id)?;
    println!("Deactivated category {}", category.name);
    Ok(())
}
