//! Session table.
//!
//! A session is created on the first successful password login and can be
//! presented instead of the password until it expires. Every authenticated
//! call renews it; a call in flight pauses expiry through [`PauseGuard`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::debug;

use mcvirt_proto::{McvError, McvResult};

struct Session {
    username: String,
    expires: Instant,
    paused: u32,
}

pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    lifetime: Duration,
}

/// Keeps a session alive until dropped.
pub struct PauseGuard {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    id: Option<String>,
    lifetime: Duration,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = sessions.get_mut(&id) {
            session.paused = session.paused.saturating_sub(1);
            session.expires = Instant::now() + self.lifetime;
        }
    }
}

impl SessionManager {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            lifetime,
        }
    }

    /// Start a session for `username` and return its id.
    pub fn create(&self, username: &str) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let id = hex::encode(bytes);

        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        sessions.retain(|_, s| s.paused > 0 || s.expires > now);
        sessions.insert(
            id.clone(),
            Session {
                username: username.to_string(),
                expires: now + self.lifetime,
                paused: 0,
            },
        );
        debug!("created session for {}", username);
        id
    }

    /// Check that `id` is a live session of `username` and renew it.
    pub fn authenticate(&self, id: &str, username: &str) -> McvResult<()> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match sessions.get_mut(id) {
            Some(session) if session.username == username => {
                if session.paused == 0 && session.expires <= now {
                    sessions.remove(id);
                    return Err(McvError::AuthenticationError);
                }
                session.expires = now + self.lifetime;
                Ok(())
            }
            _ => Err(McvError::AuthenticationError),
        }
    }

    /// Pause expiry of `id` for as long as the guard lives.
    pub fn pause(&self, id: Option<&str>) -> PauseGuard {
        let mut paused_id = None;
        if let Some(id) = id {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(session) = sessions.get_mut(id) {
                session.paused += 1;
                paused_id = Some(id.to_string());
            }
        }
        PauseGuard {
            sessions: self.sessions.clone(),
            id: paused_id,
            lifetime: self.lifetime,
        }
    }

    /// Drop every session of a user, e.g. after a password change.
    pub fn remove_user(&self, username: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|_, s| s.username != username);
    }
}
