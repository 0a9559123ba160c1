use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

use crate::config::load_settings;
use crate::defaults::*;
use crate::password::fetch_password;
use crate::settings::FaktorySettings;

/// Values supplied on the command line; anything left `None` falls back to
/// the environment-specific default.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub binding: Option<String>,
    pub environment: Option<String>,
    pub log_level: Option<String>,
    pub config_dir: Option<PathBuf>,
    pub storage_dir: Option<PathBuf>,
}

impl CliOverrides {
    pub fn environment(&self) -> &str {
        self.environment.as_deref().unwrap_or(DEFAULT_ENVIRONMENT)
    }

    pub fn is_production(&self) -> bool {
        self.environment() == PRODUCTION_ENVIRONMENT
    }

    /// Known before any config file is read, so logging can start first.
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

/// The settled options record the server boots from.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub binding: String,
    pub environment: String,
    pub log_level: String,
    pub config_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub password: Option<String>,
    pub queue_max_size: u64,
    pub backup_frequency: Duration,
    pub backup_count: usize,
    pub tls: Option<TlsFiles>,
}

impl ServerOptions {
    pub fn resolve(cli: CliOverrides) -> Result<Self> {
        let environment = cli.environment().to_string();
        let production = cli.is_production();
        let log_level = cli.log_level().to_string();
        let config_dir = cli.config_dir.unwrap_or_else(|| {
            expand_home(if production {
                PRODUCTION_CONFIG_DIR
            } else {
                DEVELOPMENT_CONFIG_DIR
            })
        });
        let storage_dir = cli.storage_dir.unwrap_or_else(|| {
            expand_home(if production {
                PRODUCTION_STORAGE_DIR
            } else {
                DEVELOPMENT_STORAGE_DIR
            })
        });

        let settings = load_settings(&config_dir)?;
        let password = fetch_password(&config_dir, &environment, &settings)?;
        let frequency = std::env::var(BACKUP_FREQUENCY_ENV).ok();

        Ok(Self::from_parts(
            cli.binding.unwrap_or_else(|| DEFAULT_BINDING.to_string()),
            environment,
            log_level,
            config_dir,
            storage_dir,
            password,
            settings,
            backup_frequency(frequency.as_deref()),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        binding: String,
        environment: String,
        log_level: String,
        config_dir: PathBuf,
        storage_dir: PathBuf,
        password: Option<String>,
        settings: FaktorySettings,
        backup_frequency: Duration,
    ) -> Self {
        let tls = match (settings.tls.certificate, settings.tls.private_key) {
            (Some(certificate), Some(private_key)) => Some(TlsFiles {
                certificate: resolve_relative(&config_dir, &certificate),
                private_key: resolve_relative(&config_dir, &private_key),
            }),
            _ => None,
        };
        Self {
            binding,
            environment,
            log_level,
            config_dir,
            storage_dir,
            password,
            queue_max_size: settings.queues.max_size,
            backup_frequency,
            backup_count: settings.backups.count,
            tls,
        }
    }

    /// Development options rooted at `storage_dir`, listening on an
    /// ephemeral local port.
    pub fn development(storage_dir: impl Into<PathBuf>) -> Self {
        let storage_dir = storage_dir.into();
        Self::from_parts(
            "127.0.0.1:0".to_string(),
            DEFAULT_ENVIRONMENT.to_string(),
            DEFAULT_LOG_LEVEL.to_string(),
            storage_dir.clone(),
            storage_dir,
            None,
            FaktorySettings::default(),
            DEFAULT_BACKUP_FREQUENCY,
        )
    }

    pub fn is_production(&self) -> bool {
        self.environment == PRODUCTION_ENVIRONMENT
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}

fn resolve_relative(base: &Path, value: &str) -> PathBuf {
    let path = expand_home(value);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Interprets `FAKTORY_BACKUP_FREQUENCY`: default one hour, never below
/// five minutes.
pub fn backup_frequency(raw: Option<&str>) -> Duration {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return DEFAULT_BACKUP_FREQUENCY;
    };
    match parse_duration(raw) {
        Some(frequency) if frequency < MIN_BACKUP_FREQUENCY => {
            tracing::warn!(value = raw, "backup frequency below minimum, clamping to 5m");
            MIN_BACKUP_FREQUENCY
        }
        Some(frequency) => frequency,
        None => {
            tracing::warn!(value = raw, "unparsable backup frequency, using 1h");
            DEFAULT_BACKUP_FREQUENCY
        }
    }
}

/// Parses durations such as `90s`, `30m`, `1h30m` or `1.5h`.
///
/// Units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`. A bare `0` is zero.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw == "0" {
        return Some(Duration::ZERO);
    }
    if raw.is_empty() {
        return None;
    }
    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut total = 0f64;
    let mut rest = raw;
    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if number_end == 0 {
            return None;
        }
        let value: f64 = rest[..number_end].parse().ok()?;
        rest = &rest[number_end..];
        let unit_end = rest.find(is_number).unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total += value * scale;
        rest = &rest[unit_end..];
    }
    Duration::try_from_secs_f64(total).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_fall_back_to_defaults() {
        let cli = CliOverrides::default();
        assert_eq!(cli.environment(), DEFAULT_ENVIRONMENT);
        assert_eq!(cli.log_level(), DEFAULT_LOG_LEVEL);
        assert!(!cli.is_production());

        let cli = CliOverrides {
            environment: Some(PRODUCTION_ENVIRONMENT.to_string()),
            log_level: Some("debug".to_string()),
            ..CliOverrides::default()
        };
        assert!(cli.is_production());
        assert_eq!(cli.log_level(), "debug");
    }

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("1.5h"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("5 minutes"), None);
        assert_eq!(parse_duration("h"), None);
    }

    #[test]
    fn backup_frequency_defaults_and_clamps() {
        assert_eq!(backup_frequency(None), DEFAULT_BACKUP_FREQUENCY);
        assert_eq!(backup_frequency(Some("  ")), DEFAULT_BACKUP_FREQUENCY);
        assert_eq!(backup_frequency(Some("garbage")), DEFAULT_BACKUP_FREQUENCY);
        assert_eq!(backup_frequency(Some("1m")), MIN_BACKUP_FREQUENCY);
        assert_eq!(backup_frequency(Some("2h")), Duration::from_secs(7200));
    }

    #[test]
    fn development_options_are_not_production() {
        let options = ServerOptions::development("/tmp/faktory-test");
        assert!(!options.is_production());
        assert_eq!(options.queue_max_size, DEFAULT_QUEUE_MAX_SIZE);
        assert_eq!(options.backup_count, DEFAULT_BACKUP_COUNT);
        assert!(options.tls.is_none());
        assert!(options.password.is_none());
    }

    #[test]
    fn resolve_reads_settings_from_config_dir() {
        let _lock = crate::config::tests::env_lock();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[queues]\nmax_size = 5\n[tls]\ncertificate = \"cert.pem\"\nprivate_key = \"/abs/key.pem\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("password"), "hunter2\n").unwrap();

        let options = ServerOptions::resolve(CliOverrides {
            config_dir: Some(dir.path().to_path_buf()),
            storage_dir: Some(dir.path().join("db")),
            ..CliOverrides::default()
        })
        .unwrap();

        assert_eq!(options.binding, DEFAULT_BINDING);
        assert_eq!(options.queue_max_size, 5);
        let tls = options.tls.unwrap();
        assert_eq!(tls.certificate, dir.path().join("cert.pem"));
        assert_eq!(tls.private_key, PathBuf::from("/abs/key.pem"));
        if std::env::var(crate::password::PASSWORD_ENV).is_err() {
            assert_eq!(options.password.as_deref(), Some("hunter2"));
        }
    }
}
