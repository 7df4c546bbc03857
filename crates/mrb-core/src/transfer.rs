use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    admission::AdmissionController,
    config::Config,
    domain::{UserId, UserTier},
    pool::SessionPool,
    ports::RemoteConnection,
    Error, Result,
};

/// Everything a transfer body needs: the user's live connection and a progress
/// hook. Report progress for every unit of work (each file of a batch, each
/// chunk milestone) so the session never looks idle mid-transfer.
pub struct TransferContext {
    pub conn: Arc<dyn RemoteConnection>,
    progress: ProgressHandle,
}

impl TransferContext {
    pub fn progress(&self) -> &ProgressHandle {
        &self.progress
    }
}

/// Cheap, cloneable activity-refresh hook bound to one user's session.
#[derive(Clone)]
pub struct ProgressHandle {
    pool: SessionPool,
    user: UserId,
}

impl ProgressHandle {
    pub async fn tick(&self) {
        self.pool.touch(self.user).await;
    }
}

/// Drives the full admission/session protocol around a transfer body:
/// admit → acquire session → run under the per-transfer deadline → release.
///
/// The admission permit is held as an RAII guard for the whole run, so the
/// slot, the busy reference, and the cooldown are settled on every exit path
/// — normal completion, transfer error, deadline, or task cancellation.
#[derive(Clone)]
pub struct TransferCoordinator {
    admission: AdmissionController,
    pool: SessionPool,
    deadline: Duration,
}

impl TransferCoordinator {
    pub fn new(cfg: &Config, admission: AdmissionController, pool: SessionPool) -> Self {
        Self {
            admission,
            pool,
            deadline: cfg.transfer_timeout,
        }
    }

    pub async fn run<T, F, Fut>(&self, user: UserId, tier: UserTier, body: F) -> Result<T>
    where
        F: FnOnce(TransferContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.admission.try_admit(user, tier)?;

        // A pool failure still counts as a finished attempt: the permit drop
        // below releases the slot and starts the cooldown.
        let conn = self.pool.acquire(user).await?;

        let ctx = TransferContext {
            conn,
            progress: ProgressHandle {
                pool: self.pool.clone(),
                user,
            },
        };

        let result = match timeout(self.deadline, body(ctx)).await {
            Ok(r) => r,
            Err(_) => {
                warn!(%user, deadline_secs = self.deadline.as_secs(), "transfer hit deadline");
                Err(Error::TransferTimeout)
            }
        };

        match &result {
            Ok(_) => debug!(%user, "transfer completed"),
            Err(e) => debug!(%user, error = %e, "transfer finished with error"),
        }

        self.pool.release(user).await;
        drop(permit);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{busy::BusyRefCounter, ports::RemoteConnector};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeConn;

    #[async_trait::async_trait]
    impl RemoteConnection for FakeConn {
        async fn close(&self) {}
    }

    #[derive(Default)]
    struct FakeConnector {
        connects: AtomicUsize,
        fail_connect: AtomicBool,
    }

    #[async_trait::async_trait]
    impl RemoteConnector for FakeConnector {
        async fn connect(&self, _user: UserId) -> Result<Arc<dyn RemoteConnection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(Error::ConnectionFailed("dc unreachable".to_string()));
            }
            Ok(Arc::new(FakeConn))
        }
    }

    fn rig(cfg: Config) -> (TransferCoordinator, Arc<BusyRefCounter>, Arc<FakeConnector>) {
        let busy = Arc::new(BusyRefCounter::new());
        let connector = Arc::new(FakeConnector::default());
        let admission = AdmissionController::new(&cfg, busy.clone());
        let pool = SessionPool::new(&cfg, busy.clone(), connector.clone());
        (
            TransferCoordinator::new(&cfg, admission, pool),
            busy,
            connector,
        )
    }

    #[tokio::test]
    async fn successful_transfer_releases_everything() {
        let (coord, busy, _) = rig(Config {
            free_cooldown: Duration::from_secs(0),
            ..Config::default()
        });
        let user = UserId(1);

        let out = coord
            .run(user, UserTier::Free, |ctx| async move {
                ctx.progress().tick().await;
                Ok::<_, Error>(42)
            })
            .await
            .unwrap();

        assert_eq!(out, 42);
        assert!(!busy.is_busy(user));
    }

    #[tokio::test]
    async fn user_is_busy_while_transfer_runs() {
        let (coord, busy, _) = rig(Config {
            free_cooldown: Duration::from_secs(0),
            ..Config::default()
        });
        let user = UserId(2);
        let busy_inside = busy.clone();

        coord
            .run(user, UserTier::Free, |_ctx| async move {
                assert!(busy_inside.is_busy(user));
                Ok::<_, Error>(())
            })
            .await
            .unwrap();
        assert!(!busy.is_busy(user));
    }

    #[tokio::test]
    async fn failed_transfer_still_releases_and_sets_cooldown() {
        let (coord, busy, _) = rig(Config {
            free_cooldown: Duration::from_secs(60),
            ..Config::default()
        });
        let user = UserId(3);

        let err = coord
            .run(user, UserTier::Free, |_ctx| async move {
                Err::<(), _>(Error::ConnectionFailed("mid-transfer drop".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(_)));
        assert!(!busy.is_busy(user));

        // Failure cooldown applies exactly like a success cooldown.
        let err = coord
            .run(user, UserTier::Free, |_ctx| async move { Ok::<_, Error>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CooldownActive { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_and_releases_the_slot() {
        let (coord, busy, _) = rig(Config {
            transfer_timeout: Duration::from_secs(10),
            free_cooldown: Duration::from_secs(0),
            max_concurrent_transfers: 1,
            ..Config::default()
        });
        let user = UserId(4);

        let err = coord
            .run(user, UserTier::Free, |_ctx| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, Error>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransferTimeout));
        assert!(!busy.is_busy(user));

        // The only slot is free again.
        coord
            .run(UserId(5), UserTier::Free, |_ctx| async move { Ok::<_, Error>(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_transfer_task_releases_via_permit_drop() {
        let (coord, busy, _) = rig(Config {
            free_cooldown: Duration::from_secs(0),
            max_concurrent_transfers: 1,
            ..Config::default()
        });
        let user = UserId(6);

        let started = Arc::new(tokio::sync::Notify::new());
        let started2 = started.clone();
        let coord2 = coord.clone();
        let task = tokio::spawn(async move {
            coord2
                .run(user, UserTier::Free, |_ctx| async move {
                    started2.notify_one();
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, Error>(())
                })
                .await
        });

        started.notified().await;
        task.abort();
        let _ = task.await;

        assert!(!busy.is_busy(user), "abort path dropped the permit");
        assert_eq!(coord.admission.active_count(), 0);
    }

    #[tokio::test]
    async fn pool_failure_surfaces_distinct_from_capacity() {
        let (coord, _, connector) = rig(Config {
            free_cooldown: Duration::from_secs(0),
            ..Config::default()
        });
        connector.fail_connect.store(true, Ordering::SeqCst);

        let err = coord
            .run(UserId(7), UserTier::Free, |_ctx| async move { Ok::<_, Error>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(_)));
        assert!(!err.is_busy_rejection());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_with_nested_subtransfers_stays_busy_until_last_release() {
        // Scenario D: an umbrella admission plus two sub-transfer admissions
        // for the same user; busy clears only with the final release.
        let (coord, busy, _) = rig(Config {
            free_cooldown: Duration::from_secs(0),
            max_concurrent_transfers: 8,
            ..Config::default()
        });
        let user = UserId(8);

        let batch = coord.admission.try_admit(user, UserTier::Free).unwrap();
        let sub1 = coord.admission.try_admit(user, UserTier::Free).unwrap();
        let sub2 = coord.admission.try_admit(user, UserTier::Free).unwrap();

        sub1.release();
        assert!(busy.is_busy(user));
        sub2.release();
        assert!(busy.is_busy(user));
        batch.release();
        assert!(!busy.is_busy(user));
    }
}
