//! Session registry for connection and subscription tracking.
//!
//! The registry maintains bidirectional mappings: session → user (for
//! authorization checks on submit/ACK) and user → session (for O(1) delivery
//! routing). One session per user: a fresh Connect for an already-subscribed
//! user evicts the previous session, so the newest device wins.

use std::collections::HashMap;

use shroud_proto::UserId;

/// Information about a registered session.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// User subscribed on this session, once Connect has been processed.
    pub user_id: Option<UserId>,
}

/// Result of binding a user to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// User bound; no previous session existed.
    Bound,
    /// User bound; this session must be closed by the caller because the
    /// user reconnected elsewhere.
    Evicted(u64),
}

/// Registry tracking live sessions and which user each one serves.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    /// Session ID → session info
    sessions: HashMap<u64, SessionInfo>,
    /// User ID → session ID (reverse index for delivery routing)
    user_sessions: HashMap<UserId, u64>,
}

impl SessionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session, not yet bound to a user.
    ///
    /// Returns `false` if the session id already exists.
    pub fn register_session(&mut self, session_id: u64) -> bool {
        if self.sessions.contains_key(&session_id) {
            return false;
        }
        self.sessions.insert(session_id, SessionInfo::default());
        true
    }

    /// Bind a user to a registered session.
    ///
    /// If the user already has another live session, that session is
    /// unbound and its id returned in [`BindOutcome::Evicted`]; the caller
    /// is responsible for closing it. Returns `None` if `session_id` is not
    /// registered.
    pub fn bind_user(&mut self, session_id: u64, user_id: UserId) -> Option<BindOutcome> {
        if !self.sessions.contains_key(&session_id) {
            return None;
        }

        let evicted = match self.user_sessions.get(&user_id) {
            Some(&old) if old != session_id => {
                if let Some(info) = self.sessions.get_mut(&old) {
                    info.user_id = None;
                }
                Some(old)
            },
            _ => None,
        };

        if let Some(info) = self.sessions.get_mut(&session_id) {
            info.user_id = Some(user_id.clone());
        }
        self.user_sessions.insert(user_id, session_id);

        Some(match evicted {
            Some(old) => BindOutcome::Evicted(old),
            None => BindOutcome::Bound,
        })
    }

    /// Unregister a session, returning its info if it existed. Cleans up the
    /// user reverse index only if it still points at this session (an evicted
    /// session must not unbind its successor).
    pub fn unregister_session(&mut self, session_id: u64) -> Option<SessionInfo> {
        let info = self.sessions.remove(&session_id)?;

        if let Some(user_id) = &info.user_id
            && self.user_sessions.get(user_id) == Some(&session_id)
        {
            self.user_sessions.remove(user_id);
        }

        Some(info)
    }

    /// Check if a session is registered.
    pub fn has_session(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// User subscribed on a session, if bound.
    pub fn user_for_session(&self, session_id: u64) -> Option<&str> {
        self.sessions.get(&session_id).and_then(|info| info.user_id.as_deref())
    }

    /// Session serving a user, if connected. O(1) via the reverse index.
    pub fn session_for_user(&self, user_id: &str) -> Option<u64> {
        self.user_sessions.get(user_id).copied()
    }

    /// Total number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
