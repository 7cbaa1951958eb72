use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::debug;

use quickdesk::remote::{ChangeKind, Topic};

use super::Desk;

/// Follow ticket changes made by other sessions until `stop` is raised
/// (or `max_polls` runs out). Returns how many changes were applied.
pub fn run(desk: &mut Desk, interval: Duration, stop: &AtomicBool, max_polls: Option<usize>) -> Result<usize> {
    let feed = desk.subscribe(Topic::tickets())?;
    let mut applied = 0;
    let mut polls = 0;

    println!("Watching for ticket changes. Press Ctrl-C to stop.");
    while !stop.load(Ordering::Relaxed) {
        let found = desk.remote().poll_changes()?;
        if found > 0 {
            debug!(found, "polled changes");
        }

        for event in feed.drain() {
            if !desk.apply_change(&event)? {
                continue;
            }
            applied += 1;
            match (event.kind, desk.local().ticket(&event.ticket_id)) {
                (ChangeKind::Delete, _) | (_, None) => println!("{} deleted", event.ticket_id),
                (kind, Some(t)) => {
                    let verb = if kind == ChangeKind::Insert { "created" } else { "updated" };
                    println!("{} {} [{}] {}", t.id, verb, t.status, t.subject);
                }
            }
        }

        polls += 1;
        if max_polls.is_some_and(|max| polls >= max) {
            break;
        }
        thread::sleep(interval);
    }

    println!("Stopped watching ({} change(s) applied).", applied);
    Ok(applied)
}
