use std::{env, fs, path::Path, time::Duration};

use crate::{errors::Error, Result};

/// Typed configuration for the relay core, loaded from the environment.
///
/// Defaults follow the production deployment: tighter limits on constrained
/// hosts (Render/Replit), looser elsewhere.
#[derive(Clone, Debug)]
pub struct Config {
    /// Global ceiling on concurrently in-flight transfers. Over-limit requests
    /// are rejected immediately, never queued.
    pub max_concurrent_transfers: usize,
    /// Maximum simultaneous live sessions in the pool.
    pub session_pool_capacity: usize,
    /// Idle time after which a not-busy session is expired by the reaper.
    pub idle_timeout: Duration,

    /// Post-transfer cooldown per tier. Zero disables the cooldown.
    pub free_cooldown: Duration,
    pub premium_cooldown: Duration,

    /// Per-transfer deadline enforced by the coordinator.
    pub transfer_timeout: Duration,

    // Background maintenance cadence.
    pub reap_interval: Duration,
    pub sweep_interval: Duration,
    /// Busy references older than this are logged as possible leaks.
    pub stale_busy_warn: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let constrained = is_constrained_host();
        let max_concurrent_transfers = env_usize("MAX_CONCURRENT_TRANSFERS")
            .unwrap_or(if constrained { 10 } else { 20 });
        let session_pool_capacity =
            env_usize("SESSION_POOL_CAPACITY").unwrap_or(if constrained { 10 } else { 15 });

        if max_concurrent_transfers < 1 {
            return Err(Error::Config(
                "MAX_CONCURRENT_TRANSFERS must be at least 1".to_string(),
            ));
        }
        if session_pool_capacity < 1 {
            return Err(Error::Config(
                "SESSION_POOL_CAPACITY must be at least 1".to_string(),
            ));
        }

        let idle_timeout = Duration::from_secs(env_u64("IDLE_TIMEOUT_SECONDS").unwrap_or(120));
        let free_cooldown = Duration::from_secs(env_u64("FREE_COOLDOWN_SECONDS").unwrap_or(15));
        let premium_cooldown =
            Duration::from_secs(env_u64("PREMIUM_COOLDOWN_SECONDS").unwrap_or(5));
        let transfer_timeout =
            Duration::from_secs(env_u64("TRANSFER_TIMEOUT_SECONDS").unwrap_or(3600));

        let reap_interval = Duration::from_secs(env_u64("REAP_INTERVAL_SECONDS").unwrap_or(120));
        let sweep_interval = Duration::from_secs(env_u64("SWEEP_INTERVAL_SECONDS").unwrap_or(300));
        let stale_busy_warn =
            Duration::from_secs(env_u64("STALE_BUSY_WARN_SECONDS").unwrap_or(3600));

        Ok(Self {
            max_concurrent_transfers,
            session_pool_capacity,
            idle_timeout,
            free_cooldown,
            premium_cooldown,
            transfer_timeout,
            reap_interval,
            sweep_interval,
            stale_busy_warn,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 20,
            session_pool_capacity: 15,
            idle_timeout: Duration::from_secs(120),
            free_cooldown: Duration::from_secs(15),
            premium_cooldown: Duration::from_secs(5),
            transfer_timeout: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(300),
            stale_busy_warn: Duration::from_secs(3600),
        }
    }
}

/// Render/Replit style hosts get tighter defaults; each live session costs
/// tens of megabytes of connection context.
fn is_constrained_host() -> bool {
    ["RENDER", "RENDER_EXTERNAL_URL", "REPLIT_DEPLOYMENT", "REPL_ID"]
        .iter()
        .any(|k| env::var_os(k).is_some())
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert!(cfg.max_concurrent_transfers >= 1);
        assert!(cfg.session_pool_capacity >= 1);
        assert!(cfg.premium_cooldown <= cfg.free_cooldown);
    }
}
