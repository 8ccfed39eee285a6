use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Service-level knobs shared by the directory services.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Notify the owner when fewer unused one-time pre-keys than this remain.
    pub replenish_threshold: u64,
    /// Largest one-time pre-key batch accepted in a single upload or rotation.
    pub max_one_time_keys_per_upload: usize,
    /// Signed pre-keys older than this are logged as stale when served.
    pub signed_prekey_max_age: Duration,
    /// Deadline given to every store call made on behalf of a request.
    pub request_timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            replenish_threshold: 20,
            max_one_time_keys_per_upload: 100,
            signed_prekey_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Command-line and environment configuration for the daemon.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "keywell-server",
    version,
    about = "End-to-end encryption key directory"
)]
pub struct ServerArgs {
    /// Address the HTTP listener binds to
    #[arg(long, env = "KEYWELL_LISTEN", default_value = "127.0.0.1:8087")]
    pub listen: SocketAddr,

    /// Address for scheduler-only routes; keep it off the public network
    #[arg(long, env = "KEYWELL_INTERNAL_LISTEN", default_value = "127.0.0.1:8088")]
    pub internal_listen: SocketAddr,

    /// Path to the database file (":memory:" for a throwaway store)
    #[arg(long, env = "KEYWELL_DB", default_value = "keywell/keys.db")]
    pub db: PathBuf,

    /// Number of pooled database connections
    #[arg(long, env = "KEYWELL_POOL_SIZE", default_value_t = 8)]
    pub pool_size: usize,

    /// Per-request deadline for store calls, in milliseconds
    #[arg(long, env = "KEYWELL_REQUEST_TIMEOUT_MS", default_value_t = 5_000)]
    pub request_timeout_ms: u64,

    /// Remaining one-time pre-keys below which a replenishment event is sent
    #[arg(long, env = "KEYWELL_REPLENISH_THRESHOLD", default_value_t = 20)]
    pub replenish_threshold: u64,

    /// Maximum one-time pre-keys accepted per upload
    #[arg(long, env = "KEYWELL_MAX_ONE_TIME_KEYS", default_value_t = 100)]
    pub max_one_time_keys: usize,

    /// Age in days after which a signed pre-key is reported stale
    #[arg(long, env = "KEYWELL_SIGNED_PREKEY_MAX_AGE_DAYS", default_value_t = 7)]
    pub signed_prekey_max_age_days: u64,

    /// Capacity of the replenishment event queue
    #[arg(long, env = "KEYWELL_NOTIFY_QUEUE", default_value_t = 1_024)]
    pub notify_queue: usize,
}

impl ServerArgs {
    pub fn directory_config(&self) -> DirectoryConfig {
        DirectoryConfig {
            replenish_threshold: self.replenish_threshold,
            max_one_time_keys_per_upload: self.max_one_time_keys,
            signed_prekey_max_age: Duration::from_secs(
                self.signed_prekey_max_age_days.saturating_mul(24 * 60 * 60),
            ),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_directory_defaults() {
        let args = ServerArgs::try_parse_from(["keywell-server"]).unwrap();
        let config = args.directory_config();
        let defaults = DirectoryConfig::default();

        assert_ne!(args.listen, args.internal_listen);
        assert!(args.internal_listen.ip().is_loopback());

        assert_eq!(config.replenish_threshold, defaults.replenish_threshold);
        assert_eq!(
            config.max_one_time_keys_per_upload,
            defaults.max_one_time_keys_per_upload
        );
        assert_eq!(config.signed_prekey_max_age, defaults.signed_prekey_max_age);
        assert_eq!(config.request_timeout, defaults.request_timeout);
    }

    #[test]
    fn flags_override_defaults() {
        let args = ServerArgs::try_parse_from([
            "keywell-server",
            "--replenish-threshold",
            "5",
            "--request-timeout-ms",
            "250",
            "--db",
            ":memory:",
        ])
        .unwrap();

        assert_eq!(args.db, PathBuf::from(":memory:"));
        let config = args.directory_config();
        assert_eq!(config.replenish_threshold, 5);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
    }
}
