//! Launch environment and runtime-configurable tuning parameters.
//!
//! The launcher identifies each process through `WORLD_SIZE`, `RANK`,
//! `LOCAL_RANK` and `LOCAL_SIZE`. Tuning values have sensible defaults and
//! can be overridden via environment variables prefixed `TIERCOMM_` or by
//! constructing a custom `TierCommConfig`.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TierCommError};
use crate::types::Rank;

/// Process identity supplied by the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchEnv {
    pub world_size: u32,
    pub rank: Rank,
    pub local_rank: u32,
    pub local_size: u32,
}

impl Default for LaunchEnv {
    /// Single-process configuration.
    fn default() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            local_rank: 0,
            local_size: 1,
        }
    }
}

impl LaunchEnv {
    /// Read `WORLD_SIZE`, `RANK`, `LOCAL_RANK` and `LOCAL_SIZE`.
    ///
    /// Absent variables fall back to the single-process defaults. A variable
    /// that is present but not an integer is an error.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            world_size: env_u32("WORLD_SIZE")?.unwrap_or(defaults.world_size),
            rank: env_u32("RANK")?.unwrap_or(defaults.rank),
            local_rank: env_u32("LOCAL_RANK")?.unwrap_or(defaults.local_rank),
            local_size: env_u32("LOCAL_SIZE")?.unwrap_or(defaults.local_size),
        })
    }

    /// Convenience constructor for a rank with `local_rank = rank % local_size`.
    pub fn for_rank(rank: Rank, world_size: u32, local_size: u32) -> Self {
        Self {
            world_size,
            rank,
            local_rank: if local_size == 0 { 0 } else { rank % local_size },
            local_size,
        }
    }
}

fn env_u32(name: &'static str) -> Result<Option<u32>> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| TierCommError::InvalidEnv { name, value: v }),
        Err(_) => Ok(None),
    }
}

/// Address of the TCP rendezvous server used by the `dist://` init method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterAddr {
    pub host: String,
    pub port: u16,
}

impl Default for MasterAddr {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 29500,
        }
    }
}

impl MasterAddr {
    /// Read `MASTER_ADDR` and `MASTER_PORT`, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut addr = Self::default();
        if let Ok(host) = std::env::var("MASTER_ADDR") {
            addr.host = host;
        }
        if let Ok(v) = std::env::var("MASTER_PORT") {
            addr.port = v.trim().parse::<u16>().map_err(|_| TierCommError::InvalidEnv {
                name: "MASTER_PORT",
                value: v,
            })?;
        }
        Ok(addr)
    }
}

/// Tuning parameters for bootstrap and rendezvous.
#[derive(Debug, Clone)]
pub struct TierCommConfig {
    /// How long the in-process transport waits for every rank of a group to
    /// join before reporting a formation failure.
    pub formation_timeout: Duration,

    /// Upper bound on a rendezvous `get`. `None` waits forever.
    pub store_timeout: Option<Duration>,

    /// How long a TCP store client keeps trying to reach the server.
    pub store_connect_timeout: Duration,

    /// Poll interval of the shared-file store.
    pub file_store_poll: Duration,

    /// Intra rank that represents its node in the inter-node communicator.
    pub inter_leader_offset: u32,

    /// Address of the autotune service, carried for the layers above.
    pub autotune_server_addr: Option<String>,
}

impl Default for TierCommConfig {
    fn default() -> Self {
        Self {
            formation_timeout: Duration::from_secs(60),
            store_timeout: None,
            store_connect_timeout: Duration::from_secs(300),
            file_store_poll: Duration::from_millis(10),
            inter_leader_offset: 0,
            autotune_server_addr: None,
        }
    }
}

impl TierCommConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `TIERCOMM_FORMATION_TIMEOUT_SECS`
    /// - `TIERCOMM_STORE_TIMEOUT_SECS`
    /// - `TIERCOMM_STORE_CONNECT_TIMEOUT_SECS`
    /// - `TIERCOMM_FILE_STORE_POLL_MS`
    /// - `TIERCOMM_INTER_LEADER_OFFSET`
    /// - `AUTO_TUNE_SERVER_ADDR`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(s) = env_setting::<u64>("TIERCOMM_FORMATION_TIMEOUT_SECS") {
            cfg.formation_timeout = Duration::from_secs(s);
        }
        if let Some(s) = env_setting::<u64>("TIERCOMM_STORE_TIMEOUT_SECS") {
            cfg.store_timeout = Some(Duration::from_secs(s));
        }
        if let Some(s) = env_setting::<u64>("TIERCOMM_STORE_CONNECT_TIMEOUT_SECS") {
            cfg.store_connect_timeout = Duration::from_secs(s);
        }
        if let Some(ms) = env_setting::<u64>("TIERCOMM_FILE_STORE_POLL_MS") {
            cfg.file_store_poll = Duration::from_millis(ms);
        }
        if let Some(n) = env_setting::<u32>("TIERCOMM_INTER_LEADER_OFFSET") {
            cfg.inter_leader_offset = n;
        }
        if let Ok(v) = std::env::var("AUTO_TUNE_SERVER_ADDR") {
            if !v.is_empty() {
                cfg.autotune_server_addr = Some(v);
            }
        }

        cfg
    }
}

fn env_setting<T: FromStr>(name: &'static str) -> Option<T> {
    std::env::var(name)
        .ok()
        .and_then(|raw| parse_setting(name, &raw))
}

/// Parse a tuning value; an unparsable value keeps the default.
fn parse_setting<T: FromStr>(name: &'static str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(name, value = raw, "ignoring unparsable setting, keeping default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_env_default_is_single_process() {
        let env = LaunchEnv::default();
        assert_eq!(
            (env.world_size, env.rank, env.local_rank, env.local_size),
            (1, 0, 0, 1)
        );
    }

    #[test]
    fn test_for_rank() {
        let env = LaunchEnv::for_rank(3, 4, 2);
        assert_eq!(env.local_rank, 1);
        assert_eq!(env.local_size, 2);
    }

    #[test]
    fn test_config_defaults() {
        let cfg = TierCommConfig::default();
        assert!(cfg.store_timeout.is_none());
        assert_eq!(cfg.inter_leader_offset, 0);
        assert_eq!(cfg.formation_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_master_addr_default() {
        let addr = MasterAddr::default();
        assert_eq!(addr.port, 29500);
        assert_eq!(addr.host, "127.0.0.1");
    }

    #[test]
    fn test_parse_setting() {
        assert_eq!(parse_setting::<u64>("TIERCOMM_STORE_TIMEOUT_SECS", " 30 "), Some(30));
        assert_eq!(parse_setting::<u64>("TIERCOMM_STORE_TIMEOUT_SECS", "30s"), None);
        assert_eq!(parse_setting::<u32>("TIERCOMM_INTER_LEADER_OFFSET", "-1"), None);
    }
}
