//! Concurrency Registry
//!
//! The only state shared between sessions. Admission and release both happen
//! under one mutex, so the active count can never exceed the cap. Admission
//! hands out a [`SessionPermit`]; dropping the permit releases the slot on
//! every exit path of the session, panics included.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Snapshot of one admitted session
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub id: u64,
    pub peer: SocketAddr,
    pub started_at: Instant,
}

#[derive(Debug, Default)]
struct RegistryState {
    next_id: u64,
    active: HashMap<u64, ActiveSession>,
}

/// Shared registry of active sessions with a fixed cap
#[derive(Debug, Clone)]
pub struct ConcurrencyRegistry {
    state: Arc<Mutex<RegistryState>>,
    max_sessions: usize,
}

impl ConcurrencyRegistry {
    pub fn new(max_sessions: usize) -> Self {
        ConcurrencyRegistry {
            state: Arc::new(Mutex::new(RegistryState::default())),
            max_sessions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // A panicking holder cannot leave the map half-updated, so keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit a session if a slot is free
    pub fn try_acquire(&self, peer: SocketAddr) -> Option<SessionPermit> {
        let mut state = self.lock();
        if state.active.len() >= self.max_sessions {
            log::debug!(
                "Registry full ({}/{}), rejecting {}",
                state.active.len(),
                self.max_sessions,
                peer
            );
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.active.insert(
            id,
            ActiveSession {
                id,
                peer,
                started_at: Instant::now(),
            },
        );
        log::debug!(
            "Session {} admitted for {} ({}/{})",
            id,
            peer,
            state.active.len(),
            self.max_sessions
        );
        Some(SessionPermit {
            id,
            peer,
            registry: self.clone(),
        })
    }

    fn release(&self, id: u64) {
        let mut state = self.lock();
        if state.active.remove(&id).is_some() {
            log::debug!(
                "Session {} released ({}/{})",
                id,
                state.active.len(),
                self.max_sessions
            );
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn is_full(&self) -> bool {
        self.active_count() >= self.max_sessions
    }

    /// Active sessions ordered by id
    pub fn active_sessions(&self) -> Vec<ActiveSession> {
        let mut sessions: Vec<ActiveSession> = self.lock().active.values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }
}

/// Admission ticket; releases its registry slot when dropped
#[derive(Debug)]
pub struct SessionPermit {
    id: u64,
    peer: SocketAddr,
    registry: ConcurrencyRegistry,
}

impl SessionPermit {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_cap_is_enforced() {
        let registry = ConcurrencyRegistry::new(2);
        let a = registry.try_acquire(peer(1)).unwrap();
        let b = registry.try_acquire(peer(2)).unwrap();
        assert!(registry.try_acquire(peer(3)).is_none());
        assert_eq!(registry.active_count(), 2);
        assert!(registry.is_full());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_drop_releases_slot() {
        let registry = ConcurrencyRegistry::new(1);
        let permit = registry.try_acquire(peer(1)).unwrap();
        assert!(registry.try_acquire(peer(2)).is_none());

        drop(permit);
        assert_eq!(registry.active_count(), 0);
        let again = registry.try_acquire(peer(2)).unwrap();
        assert_eq!(again.peer(), peer(2));
    }

    #[test]
    fn test_zero_cap_admits_nobody() {
        let registry = ConcurrencyRegistry::new(0);
        assert!(registry.try_acquire(peer(1)).is_none());
    }

    #[test]
    fn test_active_sessions_snapshot() {
        let registry = ConcurrencyRegistry::new(4);
        let _a = registry.try_acquire(peer(10)).unwrap();
        let b = registry.try_acquire(peer(11)).unwrap();
        let _c = registry.try_acquire(peer(12)).unwrap();
        drop(b);

        let ports: Vec<u16> = registry
            .active_sessions()
            .iter()
            .map(|s| s.peer.port())
            .collect();
        assert_eq!(ports, vec![10, 12]);
    }

    #[test]
    fn test_release_on_panic() {
        let registry = ConcurrencyRegistry::new(1);
        let shared = registry.clone();
        let result = std::thread::spawn(move || {
            let _permit = shared.try_acquire(peer(1)).unwrap();
            panic!("session blew up");
        })
        .join();

        assert!(result.is_err());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_cap() {
        let registry = ConcurrencyRegistry::new(3);
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.try_acquire(peer(1000 + i)))
            })
            .collect();
        let permits: Vec<SessionPermit> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(permits.len(), 3);
        assert_eq!(registry.active_count(), 3);
    }
}
