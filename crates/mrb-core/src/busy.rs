use std::{collections::HashMap, sync::Mutex, time::Duration};

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::UserId;

#[derive(Debug)]
struct BusyEntry {
    count: u32,
    since: Instant,
}

/// Reference-counted busy state, shared between the admission controller and
/// the session pool.
///
/// A user is "busy" while at least one operation holds a reference. A batch
/// operation and each sub-transfer it spawns all hold their own reference, so
/// busy only clears when the last holder releases. The session pool consults
/// this before evicting or expiring a session; a busy session is never
/// reclaimed automatically.
///
/// Invariant: an entry is present iff its count > 0. Counts are only mutated
/// through paired `acquire`/`release` calls.
#[derive(Debug, Default)]
pub struct BusyRefCounter {
    entries: Mutex<HashMap<UserId, BusyEntry>>,
}

impl BusyRefCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the user's reference count, creating the entry at 1.
    /// Infallible; safe under concurrent callers.
    pub fn acquire(&self, user: UserId) {
        let mut entries = self.entries.lock().expect("busy counter lock poisoned");
        let entry = entries.entry(user).or_insert_with(|| BusyEntry {
            count: 0,
            since: Instant::now(),
        });
        entry.count += 1;
        debug!(%user, count = entry.count, "busy ref acquired");
    }

    /// Decrement the user's reference count, removing the entry at zero.
    ///
    /// A release with no matching acquire is a contract violation in the
    /// orchestration layer above; it is logged and ignored rather than
    /// propagated, so background reapers can never crash on it.
    pub fn release(&self, user: UserId) {
        let mut entries = self.entries.lock().expect("busy counter lock poisoned");
        match entries.get_mut(&user) {
            Some(entry) if entry.count > 1 => {
                entry.count -= 1;
                debug!(%user, count = entry.count, "busy ref released");
            }
            Some(_) => {
                entries.remove(&user);
                debug!(%user, "busy ref released, user no longer busy");
            }
            None => {
                warn!(%user, "busy ref release without matching acquire (reference mismatch)");
            }
        }
    }

    pub fn is_busy(&self, user: UserId) -> bool {
        self.entries
            .lock()
            .expect("busy counter lock poisoned")
            .contains_key(&user)
    }

    /// Number of users currently holding at least one reference.
    pub fn busy_users(&self) -> usize {
        self.entries
            .lock()
            .expect("busy counter lock poisoned")
            .len()
    }

    /// Entries older than `min_age`, for the leaked-reference diagnostic.
    /// Diagnostic only: a stuck reference is reported, never auto-corrected,
    /// since it may belong to a genuinely long-running transfer.
    pub fn entries_older_than(&self, min_age: Duration) -> Vec<(UserId, Duration)> {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("busy counter lock poisoned")
            .iter()
            .filter_map(|(user, entry)| {
                let age = now.duration_since(entry.since);
                (age > min_age).then_some((*user, age))
            })
            .collect()
    }
}
