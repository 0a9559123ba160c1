use serde::{Deserialize, Serialize};

use crate::defaults::{DEFAULT_BACKUP_COUNT, DEFAULT_QUEUE_MAX_SIZE};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ServerSection {
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct QueueSettings {
    pub max_size: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_QUEUE_MAX_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct BackupSettings {
    pub count: usize,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            count: DEFAULT_BACKUP_COUNT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct TlsSettings {
    pub certificate: Option<String>,
    pub private_key: Option<String>,
}

/// Contents of `config.toml` plus every `conf.d/*.toml` overlay.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct FaktorySettings {
    pub faktory: ServerSection,
    pub queues: QueueSettings,
    pub backups: BackupSettings,
    pub tls: TlsSettings,
}
