/// End-user id on the remote messaging service (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Billing tier of a user. The post-transfer cooldown duration depends on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserTier {
    Free,
    Premium,
}
