use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    busy::BusyRefCounter,
    config::Config,
    domain::{UserId, UserTier},
    Error, Result,
};

/// The single gate every transfer request passes through.
///
/// Enforces the global concurrent-transfer ceiling and the per-user
/// post-transfer cooldown. Deliberately no queue: an over-limit request is
/// rejected immediately so the user gets instant "busy, try later" feedback
/// and peak memory stays bounded by peak concurrency.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<AdmissionInner>,
}

struct AdmissionInner {
    max_concurrent: usize,
    free_cooldown: Duration,
    premium_cooldown: Duration,
    stale_busy_warn: Duration,
    busy: Arc<BusyRefCounter>,

    state: Mutex<AdmissionState>,
    cooldown_rejections: AtomicU64,
    capacity_rejections: AtomicU64,
}

#[derive(Default)]
struct AdmissionState {
    active: usize,
    cooldowns: HashMap<UserId, Instant>,
}

/// Observability snapshot for external metrics collaborators.
#[derive(Clone, Debug, Serialize)]
pub struct AdmissionStats {
    pub active: usize,
    pub max_concurrent: usize,
    pub cooldown_rejections: u64,
    pub capacity_rejections: u64,
}

impl AdmissionController {
    pub fn new(cfg: &Config, busy: Arc<BusyRefCounter>) -> Self {
        info!(
            max_concurrent = cfg.max_concurrent_transfers,
            "admission controller initialized"
        );
        Self {
            inner: Arc::new(AdmissionInner {
                max_concurrent: cfg.max_concurrent_transfers,
                free_cooldown: cfg.free_cooldown,
                premium_cooldown: cfg.premium_cooldown,
                stale_busy_warn: cfg.stale_busy_warn,
                busy,
                state: Mutex::new(AdmissionState::default()),
                cooldown_rejections: AtomicU64::new(0),
                capacity_rejections: AtomicU64::new(0),
            }),
        }
    }

    /// Admit a transfer or reject it immediately.
    ///
    /// Checks run under one lock, in order: cooldown first, then capacity, so
    /// a cooling-down user is told about the cooldown even when the server is
    /// also full. On success the user's busy reference is acquired and a slot
    /// is consumed; both are returned through the permit's release.
    pub fn try_admit(&self, user: UserId, tier: UserTier) -> Result<AdmissionPermit> {
        let mut state = self.inner.state.lock().expect("admission lock poisoned");
        let now = Instant::now();

        if let Some(&expiry) = state.cooldowns.get(&user) {
            if now < expiry {
                drop(state);
                self.inner.cooldown_rejections.fetch_add(1, Ordering::Relaxed);
                let remaining = expiry - now;
                debug!(%user, ?remaining, "transfer rejected: cooldown active");
                return Err(Error::CooldownActive { remaining });
            }
            // Expired entries are removed lazily at read time.
            state.cooldowns.remove(&user);
        }

        if state.active >= self.inner.max_concurrent {
            drop(state);
            self.inner.capacity_rejections.fetch_add(1, Ordering::Relaxed);
            debug!(%user, max = self.inner.max_concurrent, "transfer rejected: at capacity");
            return Err(Error::CapacityExceeded);
        }

        state.active += 1;
        self.inner.busy.acquire(user);
        debug!(%user, active = state.active, "transfer admitted");

        Ok(AdmissionPermit {
            inner: self.inner.clone(),
            user,
            tier,
            released: AtomicBool::new(false),
        })
    }

    /// Periodic maintenance: drop expired cooldown rows (memory bound, not a
    /// correctness requirement) and report suspiciously old busy references.
    pub fn sweep(&self) {
        let now = Instant::now();
        let removed = {
            let mut state = self.inner.state.lock().expect("admission lock poisoned");
            let before = state.cooldowns.len();
            state.cooldowns.retain(|_, expiry| *expiry > now);
            before - state.cooldowns.len()
        };
        if removed > 0 {
            debug!(removed, "sweep: expired cooldown entries removed");
        }

        // Stuck references are reported, never auto-corrected: freeing one
        // could let the pool reclaim a session mid-transfer.
        for (user, age) in self.inner.busy.entries_older_than(self.inner.stale_busy_warn) {
            warn!(%user, age_secs = age.as_secs(), "busy reference held unusually long");
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().expect("admission lock poisoned").active
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            active: self.active_count(),
            max_concurrent: self.inner.max_concurrent,
            cooldown_rejections: self.inner.cooldown_rejections.load(Ordering::Relaxed),
            capacity_rejections: self.inner.capacity_rejections.load(Ordering::Relaxed),
        }
    }
}

/// One admitted in-flight transfer.
///
/// Dropping the permit releases the admission slot, drops the busy reference,
/// and starts the user's cooldown — on success, error, timeout, and
/// cancellation alike. Release is idempotent; an explicit [`release`] is
/// equivalent to dropping.
///
/// [`release`]: AdmissionPermit::release
pub struct AdmissionPermit {
    inner: Arc<AdmissionInner>,
    user: UserId,
    tier: UserTier,
    released: AtomicBool,
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("user", &self.user)
            .field("tier", &self.tier)
            .finish_non_exhaustive()
    }
}

impl AdmissionPermit {
    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn release(self) {
        // Drop does the work.
    }

    fn release_once(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let cooldown = match self.tier {
            UserTier::Free => self.inner.free_cooldown,
            UserTier::Premium => self.inner.premium_cooldown,
        };

        let mut state = self.inner.state.lock().expect("admission lock poisoned");
        state.active = state.active.saturating_sub(1);
        if !cooldown.is_zero() {
            state.cooldowns.insert(self.user, Instant::now() + cooldown);
        }
        let active = state.active;
        drop(state);

        self.inner.busy.release(self.user);
        debug!(user = %self.user, active, cooldown_secs = cooldown.as_secs(), "transfer slot released");
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release_once();
    }
}
