use std::time::Duration;

pub const DB_FILENAME: &str = "faktory.db";
pub const BACKUP_DIRNAME: &str = "backups";
pub const BACKUP_FILE_PREFIX: &str = "faktory-";

pub const SCHEDULED_SET: &str = "scheduled";
pub const RETRIES_SET: &str = "retries";
pub const DEAD_SET: &str = "dead";
pub const WORKING_SET: &str = "working";

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_PRIORITY: i64 = 5;
pub const DEFAULT_RETRY: i64 = 25;
pub const DEFAULT_RESERVE_FOR_SECS: i64 = 1800;
pub const MIN_RESERVE_FOR_SECS: i64 = 60;
pub const MAX_RESERVE_FOR_SECS: i64 = 86_400;
pub const MIN_JID_LEN: usize = 8;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEAD_TTL_SECS: i64 = 180 * 24 * 60 * 60;
pub const HEARTBEAT_TTL_SECS: i64 = 60;
pub const MAX_BACKOFF_SECS: i64 = 10 * 365 * 24 * 60 * 60;

pub const MAX_ERRTYPE_LEN: usize = 100;
pub const MAX_MESSAGE_LEN: usize = 1000;
pub const MAX_BACKTRACE_LINES: usize = 50;

pub const RESERVATION_EXPIRED_ERRTYPE: &str = "ReservationExpired";
pub const RESERVATION_EXPIRED_MESSAGE: &str = "job reservation expired";

pub const SCHEDULED_TASK_PERIOD_SECS: u64 = 5;
pub const RETRIES_TASK_PERIOD_SECS: u64 = 5;
pub const DEAD_TASK_PERIOD_SECS: u64 = 60;
pub const REAPER_TASK_PERIOD_SECS: u64 = 15;
pub const HEARTBEAT_TASK_PERIOD_SECS: u64 = 15;
