use std::time::Duration;

/// Core error type for the relay bot.
///
/// Every variant here is recoverable by the caller; none is fatal to the
/// process. Adapter crates map their specific failures into this type so the
/// orchestration layer can distinguish "system busy, try later" from
/// "your credentials are broken" when replying to the user.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// The global concurrent-transfer ceiling is reached. Never queued.
    #[error("transfer capacity exceeded")]
    CapacityExceeded,

    /// The user finished a transfer recently and must wait out the cooldown.
    #[error("cooldown active, {} seconds remaining", remaining.as_secs())]
    CooldownActive { remaining: Duration },

    /// Every session slot is held by a busy session; nothing can be evicted.
    #[error("session pool exhausted")]
    PoolExhausted,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The per-transfer deadline elapsed before the transfer finished.
    #[error("transfer deadline exceeded")]
    TransferTimeout,
}

impl Error {
    /// True for rejections that should read as "busy, try again later" to the
    /// end user, as opposed to credential or connectivity problems.
    pub fn is_busy_rejection(&self) -> bool {
        matches!(
            self,
            Error::CapacityExceeded | Error::CooldownActive { .. } | Error::PoolExhausted
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
