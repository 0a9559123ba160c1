use std::time::Duration;

pub const DEFAULT_PORT: u16 = 7419;
pub const DEFAULT_BINDING: &str = "localhost:7419";
pub const DEFAULT_ENVIRONMENT: &str = "development";
pub const PRODUCTION_ENVIRONMENT: &str = "production";
pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const DEVELOPMENT_CONFIG_DIR: &str = "~/.faktory";
pub const DEVELOPMENT_STORAGE_DIR: &str = "~/.faktory/db";
pub const PRODUCTION_CONFIG_DIR: &str = "/etc/faktory";
pub const PRODUCTION_STORAGE_DIR: &str = "/var/lib/faktory/db";

pub const DEFAULT_QUEUE_MAX_SIZE: u64 = 100_000;
pub const DEFAULT_BACKUP_COUNT: usize = 24;
pub const DEFAULT_BACKUP_FREQUENCY: Duration = Duration::from_secs(60 * 60);
pub const MIN_BACKUP_FREQUENCY: Duration = Duration::from_secs(5 * 60);
pub const BACKUP_FREQUENCY_ENV: &str = "FAKTORY_BACKUP_FREQUENCY";
