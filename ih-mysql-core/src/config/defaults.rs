//! Default configuration values for ih-mysql
//!
//! This module centralizes all default values to make them easy to find and modify.

use std::time::Duration;

// Bootstrap defaults
pub const DEFAULT_BOOTSTRAP_MARKER: &str = "/var/lib/mysql/.bootstrapped";
pub const DEFAULT_LOCK_ACQUIRE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_LOCK_LEASE_SECS: u64 = 300;
pub const DEFAULT_LOCK_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_LOCK_KEY_NAME: &str = "pk";

// Replication defaults
pub const DEFAULT_REPLICATION_THRESHOLD_SECS: u64 = 30;
pub const DEFAULT_REPLICATION_TIMEOUT_SECS: u64 = 86400; // 24 hours
pub const DEFAULT_REPLICATION_POLL_INTERVAL_SECS: u64 = 30;
pub const REPLICATION_STATUS_TTL_MS: u64 = 1000;

// Remote command defaults
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_BACKUP_TIMEOUT_SECS: u64 = 28800; // 8 hours
pub const DEFAULT_SSM_POLL_INTERVAL_MS: u64 = 2000;

// Restore timeout estimation
/// Effective S3 download + gunzip + xbstream extraction throughput
pub const RESTORE_THROUGHPUT_BYTES_PER_SEC: u64 = 50 * 1024 * 1024;
/// `xtrabackup --prepare` roughly doubles the wall-clock time
pub const RESTORE_PREPARE_MULTIPLIER: u64 = 2;
pub const RESTORE_MIN_TIMEOUT_SECS: u64 = 3600;

// MySQL layout
pub const MYSQL_DATA_DIR: &str = "/var/lib/mysql";
pub const BACKUP_FILE_EXTENSION: &str = "xbstream.gz";

pub const fn duration_ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

pub const fn duration_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}
