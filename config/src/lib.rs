pub mod config;
pub mod defaults;
pub mod options;
pub mod password;
pub mod settings;

pub use config::{CONF_D_DIRNAME, CONFIG_FILENAME, load_settings};
pub use defaults::*;
pub use options::{CliOverrides, ServerOptions, TlsFiles, backup_frequency, parse_duration};
pub use password::{PASSWORD_ENV, SKIP_PASSWORD_ENV, fetch_password};
pub use settings::{BackupSettings, FaktorySettings, QueueSettings, ServerSection, TlsSettings};
