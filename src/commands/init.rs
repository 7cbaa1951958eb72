use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use quickdesk::db::Database;

use super::open_desk;

pub const DIR_NAME: &str = ".quickdesk";
pub const DB_FILE: &str = "quickdesk.db";

/// Create `.quickdesk/` under `path` and seed the default categories and
/// users. Running it again only fills in what is missing.
pub fn run(path: &Path, import: Option<&Path>) -> Result<PathBuf> {
    let quickdesk_dir = path.join(DIR_NAME);
    let existed = quickdesk_dir.exists();
    fs::create_dir_all(&quickdesk_dir).context("Failed to create .quickdesk directory")?;

    let db = Database::open(&quickdesk_dir.join(DB_FILE)).context("Failed to open database")?;
    let mut desk = open_desk(&db)?;

    if let Some(file) = import {
        let json = fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let created = desk.import(&json).context("Failed to import snapshot")?;
        println!("Imported {} ticket(s) from {}", created, file.display());
    }

    if desk.initialize_data()? {
        println!("Seeded default categories and users");
    }

    if existed {
        println!("Already initialized at {}", quickdesk_dir.display());
    } else {
        println!("Created {}", quickdesk_dir.display());
    }
    Ok(quickdesk_dir)
}
