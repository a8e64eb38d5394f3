//! Recipient identity directory.
//!
//! Submission is rejected when the recipient has no known identity; the
//! actual identity and key-bundle management lives in an external service,
//! so the driver only needs a membership check behind this trait.

use std::collections::HashSet;

use shroud_proto::UserId;

/// Lookup seam to the external identity service.
pub trait IdentityDirectory: Send + Sync + 'static {
    /// Whether the user id has a registered identity.
    fn is_known_user(&self, user_id: &str) -> bool;
}

/// Directory that accepts every non-empty user id.
///
/// Deployment default when the relay runs behind an authenticating gateway
/// that already vouches for ids it forwards.
#[derive(Debug, Clone, Default)]
pub struct OpenDirectory;

impl IdentityDirectory for OpenDirectory {
    fn is_known_user(&self, user_id: &str) -> bool {
        !user_id.is_empty()
    }
}

/// Fixed-membership directory for tests and closed deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    users: HashSet<UserId>,
}

impl StaticDirectory {
    /// Create a directory with the given known users.
    pub fn new<I, T>(users: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<UserId>,
    {
        Self { users: users.into_iter().map(Into::into).collect() }
    }
}

impl IdentityDirectory for StaticDirectory {
    fn is_known_user(&self, user_id: &str) -> bool {
        self.users.contains(user_id)
    }
}
