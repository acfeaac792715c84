//! Per-path transfer locks.
//!
//! A held lock is the only signal that a transfer for that path is in flight.
//! It also carries the mod-time used to arbitrate competing writers: every
//! check-then-act below runs under a single mutex acquisition.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transfer::TransferId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockEntry {
    pub mod_time: u32,
    pub owner: TransferId,
}

/// Outcome of an incoming transfer competing for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbitration {
    /// The incoming transfer now owns the path. `superseded` is the transfer
    /// that held it before, which must stop touching the file.
    Granted { superseded: Option<TransferId> },
    /// The current holder is newer; the incoming transfer is dropped.
    Rejected { held: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct LockTable {
    inner: Arc<Mutex<HashMap<PathBuf, LockEntry>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock only if nobody holds it.
    pub fn try_acquire(&self, path: &Path, mod_time: u32, owner: TransferId) -> bool {
        let mut locks = self.inner.lock();
        if locks.contains_key(path) {
            return false;
        }
        locks.insert(path.to_path_buf(), LockEntry { mod_time, owner });
        true
    }

    /// Mod-time tie-break: an existing holder strictly newer than `incoming`
    /// wins; otherwise the lock is handed to `owner` with the new mod-time.
    pub fn arbitrate(&self, path: &Path, incoming: u32, owner: TransferId) -> Arbitration {
        let mut locks = self.inner.lock();
        let superseded = match locks.get(path) {
            Some(held) if held.mod_time > incoming => {
                return Arbitration::Rejected {
                    held: held.mod_time,
                };
            }
            Some(held) => Some(held.owner),
            None => None,
        };
        locks.insert(
            path.to_path_buf(),
            LockEntry {
                mod_time: incoming,
                owner,
            },
        );
        Arbitration::Granted { superseded }
    }

    /// Releases the lock if `owner` still holds it.
    pub fn release(&self, path: &Path, owner: TransferId) -> bool {
        let mut locks = self.inner.lock();
        match locks.get(path) {
            Some(entry) if entry.owner == owner => {
                locks.remove(path);
                true
            }
            _ => false,
        }
    }

    pub fn is_held_by(&self, path: &Path, owner: TransferId) -> bool {
        self.inner
            .lock()
            .get(path)
            .is_some_and(|entry| entry.owner == owner)
    }

    pub fn get(&self, path: &Path) -> Option<LockEntry> {
        self.inner.lock().get(path).copied()
    }

    /// Whether any transfer holds a lock somewhere under `dir`.
    pub fn any_under(&self, dir: &Path) -> bool {
        self.inner.lock().keys().any(|p| p.starts_with(dir))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn older_incoming_is_rejected() {
        let locks = LockTable::new();
        let path = Path::new("/data/a.txt");
        let existing = TransferId::next();
        assert!(locks.try_acquire(path, 200, existing));

        let incoming = TransferId::next();
        assert_eq!(
            locks.arbitrate(path, 150, incoming),
            Arbitration::Rejected { held: 200 }
        );
        assert!(locks.is_held_by(path, existing));
        assert_eq!(locks.get(path).unwrap().mod_time, 200);
    }

    #[test]
    fn newer_or_equal_incoming_supersedes() {
        for incoming_time in [200, 250] {
            let locks = LockTable::new();
            let path = Path::new("/data/a.txt");
            let existing = TransferId::next();
            assert!(locks.try_acquire(path, 200, existing));

            let incoming = TransferId::next();
            assert_eq!(
                locks.arbitrate(path, incoming_time, incoming),
                Arbitration::Granted {
                    superseded: Some(existing)
                }
            );
            assert!(locks.is_held_by(path, incoming));
            assert!(!locks.is_held_by(path, existing));
            assert_eq!(locks.get(path).unwrap().mod_time, incoming_time);
        }
    }

    #[test]
    fn free_path_is_granted() {
        let locks = LockTable::new();
        let owner = TransferId::next();
        assert_eq!(
            locks.arbitrate(Path::new("/x"), 1, owner),
            Arbitration::Granted { superseded: None }
        );
        assert!(!locks.try_acquire(Path::new("/x"), 5, TransferId::next()));
    }

    #[test]
    fn only_the_owner_releases() {
        let locks = LockTable::new();
        let path = Path::new("/data/b.bin");
        let first = TransferId::next();
        let second = TransferId::next();
        locks.try_acquire(path, 10, first);
        locks.arbitrate(path, 20, second);

        assert!(!locks.release(path, first));
        assert!(locks.any_under(Path::new("/data")));
        assert!(locks.release(path, second));
        assert!(locks.is_empty());
        assert!(!locks.any_under(Path::new("/data")));
    }
}
