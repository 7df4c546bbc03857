use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    busy::BusyRefCounter,
    config::Config,
    domain::UserId,
    ports::{RemoteConnection, RemoteConnector},
    Error, Result,
};

struct Session {
    conn: Arc<dyn RemoteConnection>,
    last_activity: Instant,
    created_at: DateTime<Utc>,
}

enum Slot {
    Ready(Session),
    /// A handshake is in flight for this user. The slot counts toward
    /// capacity so concurrent acquires cannot overfill the pool, and waiters
    /// for the same user park on the notify instead of double-connecting.
    Connecting(Arc<Notify>),
}

/// Bounded pool of live authenticated sessions, at most one per user.
///
/// On capacity pressure the least-recently-used *idle* session is evicted;
/// sessions whose owner holds a busy reference are never reclaimed
/// automatically, neither by eviction nor by idle expiry. Interrupting an
/// in-flight transfer would corrupt it, so zero interruption is the one
/// property this component must never trade away.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    capacity: usize,
    idle_timeout: Duration,
    busy: Arc<BusyRefCounter>,
    connector: Arc<dyn RemoteConnector>,

    slots: Mutex<HashMap<UserId, Slot>>,
    evictions: AtomicU64,
    expirations: AtomicU64,
    exhausted_rejections: AtomicU64,
}

/// Observability snapshot for external metrics collaborators.
#[derive(Clone, Debug, Serialize)]
pub struct PoolStats {
    pub live_sessions: usize,
    pub capacity: usize,
    pub evictions: u64,
    pub expirations: u64,
    pub exhausted_rejections: u64,
}

/// Per-session view, for status reporting.
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub user: i64,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub busy: bool,
}

impl SessionPool {
    pub fn new(cfg: &Config, busy: Arc<BusyRefCounter>, connector: Arc<dyn RemoteConnector>) -> Self {
        info!(
            capacity = cfg.session_pool_capacity,
            idle_timeout_secs = cfg.idle_timeout.as_secs(),
            "session pool initialized"
        );
        Self {
            inner: Arc::new(PoolInner {
                capacity: cfg.session_pool_capacity,
                idle_timeout: cfg.idle_timeout,
                busy,
                connector,
                slots: Mutex::new(HashMap::new()),
                evictions: AtomicU64::new(0),
                expirations: AtomicU64::new(0),
                exhausted_rejections: AtomicU64::new(0),
            }),
        }
    }

    /// Return the user's session, creating one if needed.
    ///
    /// An existing session has its activity refreshed. Creating a new one may
    /// first evict the least-recently-used idle session; if the pool is full
    /// and every session is busy, this fails with `PoolExhausted` instead.
    /// The connect handshake runs outside the pool lock — only the slot
    /// reservation is locked, so a slow handshake never blocks other users.
    pub async fn acquire(&self, user: UserId) -> Result<Arc<dyn RemoteConnection>> {
        loop {
            let our_notify = Arc::new(Notify::new());
            let evicted: Option<(UserId, Arc<dyn RemoteConnection>)>;
            {
                let mut slots = self.inner.slots.lock().await;
                let in_flight = match slots.get_mut(&user) {
                    Some(Slot::Ready(session)) => {
                        session.last_activity = Instant::now();
                        debug!(%user, "reusing existing session");
                        return Ok(session.conn.clone());
                    }
                    Some(Slot::Connecting(notify)) => Some(notify.clone()),
                    None => None,
                };

                if let Some(notify) = in_flight {
                    // Another task is mid-handshake for this user. Register
                    // interest before unlocking so the wakeup cannot be lost,
                    // then re-check from the top.
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    drop(slots);
                    notified.await;
                    continue;
                }

                evicted = if slots.len() >= self.inner.capacity {
                    let victim = slots
                        .iter()
                        .filter_map(|(uid, slot)| match slot {
                            Slot::Ready(s) if !self.inner.busy.is_busy(*uid) => {
                                Some((s.last_activity, *uid))
                            }
                            _ => None,
                        })
                        .min()
                        .map(|(_, uid)| uid);

                    let Some(victim) = victim else {
                        self.inner.exhausted_rejections.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            %user,
                            capacity = self.inner.capacity,
                            "cannot create session: every slot has an active transfer"
                        );
                        return Err(Error::PoolExhausted);
                    };
                    match slots.remove(&victim) {
                        Some(Slot::Ready(session)) => Some((victim, session.conn)),
                        _ => None,
                    }
                } else {
                    None
                };

                slots.insert(user, Slot::Connecting(our_notify.clone()));
            }

            if let Some((victim, conn)) = evicted {
                self.inner.evictions.fetch_add(1, Ordering::Relaxed);
                info!(evicted = %victim, for_user = %user, "evicted least-recently-used idle session");
                conn.close().await;
            }

            let connected = self.inner.connector.connect(user).await;
            return self.finish_connect(user, our_notify, connected).await;
        }
    }

    async fn finish_connect(
        &self,
        user: UserId,
        our_notify: Arc<Notify>,
        connected: Result<Arc<dyn RemoteConnection>>,
    ) -> Result<Arc<dyn RemoteConnection>> {
        let mut slots = self.inner.slots.lock().await;

        // The reservation may have disappeared via logout while we were in the
        // handshake; only take it back if it is still ours.
        let still_reserved = matches!(
            slots.get(&user),
            Some(Slot::Connecting(n)) if Arc::ptr_eq(n, &our_notify)
        );
        if still_reserved {
            slots.remove(&user);
        }

        match connected {
            Ok(conn) => {
                if !still_reserved {
                    drop(slots);
                    conn.close().await;
                    our_notify.notify_waiters();
                    return Err(Error::ConnectionFailed(
                        "session logged out during connect".to_string(),
                    ));
                }

                slots.insert(
                    user,
                    Slot::Ready(Session {
                        conn: conn.clone(),
                        last_activity: Instant::now(),
                        created_at: Utc::now(),
                    }),
                );
                let live = slots.len();
                drop(slots);
                our_notify.notify_waiters();
                info!(%user, live, capacity = self.inner.capacity, "created new session");
                Ok(conn)
            }
            Err(e) => {
                drop(slots);
                our_notify.notify_waiters();
                warn!(%user, error = %e, "session creation failed");
                Err(e)
            }
        }
    }

    /// Refresh the session's activity timestamp. Called for every unit of
    /// transfer progress, so a slow multi-file transfer never looks idle.
    pub async fn touch(&self, user: UserId) {
        let mut slots = self.inner.slots.lock().await;
        if let Some(Slot::Ready(session)) = slots.get_mut(&user) {
            session.last_activity = Instant::now();
        }
    }

    /// Hand the session back. It stays in the pool; from here on it is an
    /// idle-eviction candidate simply by not being refreshed anymore.
    pub async fn release(&self, user: UserId) {
        debug!(%user, "session released to idle");
    }

    /// Explicit, caller-initiated teardown. Always honored, busy or not:
    /// busy-state protection only covers automatic reclamation. Callers must
    /// drain or cancel the user's transfers before logging out.
    pub async fn logout(&self, user: UserId) {
        let removed = {
            let mut slots = self.inner.slots.lock().await;
            slots.remove(&user)
        };
        match removed {
            Some(Slot::Ready(session)) => {
                session.conn.close().await;
                info!(%user, "session logged out");
            }
            Some(Slot::Connecting(notify)) => {
                // The connecting task notices the missing reservation and
                // closes its fresh connection itself.
                notify.notify_waiters();
                info!(%user, "logout while session was connecting");
            }
            None => debug!(%user, "logout for user without a session"),
        }
    }

    /// Expire sessions idle past the timeout. Busy sessions are skipped, not
    /// force-expired; they get re-checked on the next sweep. Returns the
    /// number of sessions removed.
    pub async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let mut to_close = Vec::new();
        let mut skipped_busy = 0usize;
        {
            let mut slots = self.inner.slots.lock().await;
            let idle: Vec<UserId> = slots
                .iter()
                .filter_map(|(uid, slot)| match slot {
                    Slot::Ready(s)
                        if now.duration_since(s.last_activity) > self.inner.idle_timeout =>
                    {
                        Some(*uid)
                    }
                    _ => None,
                })
                .collect();

            for uid in idle {
                if self.inner.busy.is_busy(uid) {
                    skipped_busy += 1;
                    debug!(user = %uid, "idle session kept: transfer in flight");
                    continue;
                }
                if let Some(Slot::Ready(session)) = slots.remove(&uid) {
                    to_close.push((uid, session));
                }
            }
        }

        let reaped = to_close.len();
        for (uid, session) in to_close {
            let idle_secs = now.duration_since(session.last_activity).as_secs();
            session.conn.close().await;
            info!(user = %uid, idle_secs, "expired idle session");
        }

        if reaped > 0 || skipped_busy > 0 {
            self.inner
                .expirations
                .fetch_add(reaped as u64, Ordering::Relaxed);
            info!(reaped, skipped_busy, "idle session sweep complete");
        }
        reaped
    }

    /// Close every session (shutdown path).
    pub async fn disconnect_all(&self) {
        let drained: Vec<Slot> = {
            let mut slots = self.inner.slots.lock().await;
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            match slot {
                Slot::Ready(session) => session.conn.close().await,
                Slot::Connecting(notify) => notify.notify_waiters(),
            }
        }
        info!("all sessions disconnected");
    }

    pub async fn live_count(&self) -> usize {
        self.inner
            .slots
            .lock()
            .await
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            live_sessions: self.live_count().await,
            capacity: self.inner.capacity,
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            expirations: self.inner.expirations.load(Ordering::Relaxed),
            exhausted_rejections: self.inner.exhausted_rejections.load(Ordering::Relaxed),
        }
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        self.inner
            .slots
            .lock()
            .await
            .iter()
            .filter_map(|(uid, slot)| match slot {
                Slot::Ready(s) => Some(SessionInfo {
                    user: uid.0,
                    created_at: s.created_at,
                    idle_secs: now.duration_since(s.last_activity).as_secs(),
                    busy: self.inner.busy.is_busy(*uid),
                }),
                Slot::Connecting(_) => None,
            })
            .collect()
    }
}
