use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{admission::AdmissionController, config::Config, pool::SessionPool};

/// Background maintenance: the idle-session reaper and the admission sweep.
///
/// Both are independent periodic loops, not tied to any individual transfer.
/// Each tick consults current busy state on its own; a session skipped while
/// busy is simply re-checked next time around.
pub struct Reaper {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Reaper {
    pub fn spawn(cfg: &Config, admission: AdmissionController, pool: SessionPool) -> Self {
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        {
            let pool = pool.clone();
            let token = cancel.clone();
            let mut tick = interval(cfg.reap_interval);
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => {
                            pool.reap_idle().await;
                        }
                    }
                }
            }));
        }

        {
            let token = cancel.clone();
            let mut tick = interval(cfg.sweep_interval);
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => {
                            admission.sweep();
                        }
                    }
                }
            }));
        }

        info!(
            reap_interval_secs = cfg.reap_interval.as_secs(),
            sweep_interval_secs = cfg.sweep_interval.as_secs(),
            "background reapers started"
        );
        Self { handles, cancel }
    }

    /// Stop both loops and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("background reapers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        busy::BusyRefCounter,
        domain::UserId,
        ports::{RemoteConnection, RemoteConnector},
        Result,
    };
    use std::{sync::Arc, time::Duration};

    struct FakeConn;

    #[async_trait::async_trait]
    impl RemoteConnection for FakeConn {
        async fn close(&self) {}
    }

    struct FakeConnector;

    #[async_trait::async_trait]
    impl RemoteConnector for FakeConnector {
        async fn connect(&self, _user: UserId) -> Result<Arc<dyn RemoteConnection>> {
            Ok(Arc::new(FakeConn))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_expires_idle_sessions_in_the_background() {
        let cfg = Config {
            idle_timeout: Duration::from_secs(120),
            reap_interval: Duration::from_secs(60),
            ..Config::default()
        };
        let busy = Arc::new(BusyRefCounter::new());
        let admission = AdmissionController::new(&cfg, busy.clone());
        let pool = SessionPool::new(&cfg, busy.clone(), Arc::new(FakeConnector));

        pool.acquire(UserId(1)).await.unwrap();
        pool.acquire(UserId(2)).await.unwrap();
        busy.acquire(UserId(2));

        let reaper = Reaper::spawn(&cfg, admission, pool.clone());

        // Several ticks past the idle timeout: user 1 goes, user 2 is busy.
        tokio::time::advance(Duration::from_secs(300)).await;
        tokio::task::yield_now().await;
        assert_eq!(pool.live_count().await, 1);

        // Transfer finishes; the next tick reclaims the last session.
        busy.release(UserId(2));
        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        assert_eq!(pool.live_count().await, 0);

        reaper.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loops() {
        let cfg = Config::default();
        let busy = Arc::new(BusyRefCounter::new());
        let admission = AdmissionController::new(&cfg, busy.clone());
        let pool = SessionPool::new(&cfg, busy, Arc::new(FakeConnector));

        let reaper = Reaper::spawn(&cfg, admission, pool);
        reaper.shutdown().await;
    }
}
