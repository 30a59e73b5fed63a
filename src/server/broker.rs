//! Single-slot session state shared between the uplink and demuxer threads.
//!
//! The broker owns the one piece of cross-thread mutable state in the
//! server: which session (if any) currently holds the classifier, its
//! token, and whether it is still accepting data or draining. All
//! transitions go through this struct; there are no session flags anywhere
//! else. The condvar wakes the demuxer when a session appears or changes
//! phase, so nothing spins.

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Where the current session is in its lifecycle. Idle is the absence of a
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting `submit` chunks.
    Active,
    /// End sentinel written; waiting for its echo to surface.
    Draining,
}

#[derive(Debug, Clone)]
pub struct SessionView {
    pub token: String,
    pub sample_id: String,
    pub phase: Phase,
}

#[derive(Debug)]
struct Session {
    token: String,
    sample_id: String,
    phase: Phase,
}

pub struct SessionBroker {
    slot: Mutex<Option<Session>>,
    changed: Condvar,
    counter: AtomicU64,
}

impl SessionBroker {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            changed: Condvar::new(),
            counter: AtomicU64::new(0),
        }
    }

    /// Try to claim the classifier for `sample_id`.
    ///
    /// Returns a fresh token on success, or `None` while another session is
    /// active or draining. Callers retry with backoff on `None`.
    pub fn acquire(&self, sample_id: &str) -> Option<String> {
        let mut slot = self.lock_slot();
        if slot.is_some() {
            return None;
        }
        let token = self.new_token();
        *slot = Some(Session {
            token: token.clone(),
            sample_id: sample_id.to_string(),
            phase: Phase::Active,
        });
        self.changed.notify_all();
        Some(token)
    }

    /// Verify that `token` names the current session and it still accepts
    /// data. Any mismatch is a protocol violation surfaced to the caller.
    pub fn expect_active(&self, token: &str) -> Result<()> {
        let slot = self.lock_slot();
        match slot.as_ref() {
            None => bail!("no session is active"),
            Some(session) if session.token != token => {
                bail!("token does not match the current session")
            }
            Some(session) if session.phase == Phase::Draining => {
                bail!("session is draining; no further data accepted")
            }
            Some(_) => Ok(()),
        }
    }

    /// ACTIVE → DRAINING for the session named by `token`.
    pub fn begin_drain(&self, token: &str) -> Result<()> {
        let mut slot = self.lock_slot();
        match slot.as_mut() {
            None => bail!("no session is active"),
            Some(session) if session.token != token => {
                bail!("token does not match the current session")
            }
            Some(session) if session.phase == Phase::Draining => {
                bail!("session is already draining")
            }
            Some(session) => {
                session.phase = Phase::Draining;
                self.changed.notify_all();
                Ok(())
            }
        }
    }

    /// DRAINING (or ACTIVE, on failure teardown) → IDLE. Only the demuxer
    /// calls this, after the downlink has confirmed the terminal event.
    pub fn release(&self, token: &str) -> Result<()> {
        let mut slot = self.lock_slot();
        match slot.as_ref() {
            Some(session) if session.token == token => {
                *slot = None;
                self.changed.notify_all();
                Ok(())
            }
            Some(_) => bail!("token does not match the current session"),
            None => bail!("no session to release"),
        }
    }

    /// Block until a session exists or `timeout` elapses.
    pub fn wait_for_session(&self, timeout: Duration) -> Option<SessionView> {
        let slot = self.lock_slot();
        let (slot, _timed_out) = self
            .changed
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.as_ref().map(view)
    }

    pub fn snapshot(&self) -> Option<SessionView> {
        self.lock_slot().as_ref().map(view)
    }

    pub fn is_draining(&self, token: &str) -> bool {
        matches!(
            self.lock_slot().as_ref(),
            Some(session) if session.token == token && session.phase == Phase::Draining
        )
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn new_token(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{millis:x}-{n:x}")
    }
}

impl Default for SessionBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn view(session: &Session) -> SessionView {
    SessionView {
        token: session.token.clone(),
        sample_id: session.sample_id.clone(),
        phase: session.phase,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn acquire_is_exclusive_until_release() {
        let broker = SessionBroker::new();
        let token = broker.acquire("id1").expect("first acquire");
        assert!(broker.acquire("id2").is_none());

        broker.begin_drain(&token).unwrap();
        assert!(broker.acquire("id2").is_none());

        broker.release(&token).unwrap();
        let second = broker.acquire("id2").expect("acquire after release");
        assert_ne!(token, second);
    }

    #[test]
    fn expect_active_rejects_stale_and_idle() {
        let broker = SessionBroker::new();
        assert!(broker.expect_active("nope").is_err());

        let token = broker.acquire("id1").unwrap();
        assert!(broker.expect_active(&token).is_ok());
        assert!(broker.expect_active("stale").is_err());

        broker.begin_drain(&token).unwrap();
        assert!(broker.expect_active(&token).is_err());
    }

    #[test]
    fn drain_requires_matching_active_session() {
        let broker = SessionBroker::new();
        assert!(broker.begin_drain("nope").is_err());

        let token = broker.acquire("id1").unwrap();
        assert!(broker.begin_drain("other").is_err());
        broker.begin_drain(&token).unwrap();
        assert!(broker.begin_drain(&token).is_err());
        assert!(broker.is_draining(&token));
    }

    #[test]
    fn release_checks_token() {
        let broker = SessionBroker::new();
        assert!(broker.release("nope").is_err());
        let token = broker.acquire("id1").unwrap();
        assert!(broker.release("other").is_err());
        broker.release(&token).unwrap();
        assert!(broker.snapshot().is_none());
    }

    #[test]
    fn concurrent_acquires_grant_exactly_one() {
        let broker = Arc::new(SessionBroker::new());
        let mut handles = Vec::new();
        for n in 0..8 {
            let broker = Arc::clone(&broker);
            handles.push(thread::spawn(move || broker.acquire(&format!("id{n}"))));
        }
        let granted: Vec<String> = handles
            .into_iter()
            .filter_map(|h| h.join().expect("acquire thread"))
            .collect();
        assert_eq!(granted.len(), 1);
    }

    #[test]
    fn wait_for_session_wakes_on_acquire() {
        let broker = Arc::new(SessionBroker::new());
        assert!(broker.wait_for_session(Duration::from_millis(10)).is_none());

        let waiter = {
            let broker = Arc::clone(&broker);
            thread::spawn(move || broker.wait_for_session(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        let token = broker.acquire("id1").unwrap();
        let seen = waiter.join().expect("waiter thread").expect("session seen");
        assert_eq!(seen.token, token);
        assert_eq!(seen.phase, Phase::Active);
    }
}
