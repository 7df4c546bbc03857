use std::sync::Arc;

use crate::{domain::UserId, Result};

/// A live authenticated connection to the remote messaging service.
///
/// Opaque to the core: the pool only stores it, hands it to transfers, and
/// closes it on eviction, idle expiry, or logout. The handle is exclusively
/// owned by its pool entry; concurrent transfers for the same user share it
/// only while the busy counter reflects all of them.
#[async_trait::async_trait]
pub trait RemoteConnection: Send + Sync {
    async fn close(&self);
}

impl std::fmt::Debug for dyn RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RemoteConnection")
    }
}

/// Hexagonal port for establishing authenticated connections.
///
/// The handshake (credentials lookup, login, transport setup) is the adapter's
/// business. Failures surface as `AuthenticationFailed` or `ConnectionFailed`;
/// the pool never retries internally.
#[async_trait::async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, user: UserId) -> Result<Arc<dyn RemoteConnection>>;
}
