use std::path::Path;

use anyhow::{Context, Result};

use crate::defaults::PRODUCTION_ENVIRONMENT;
use crate::settings::FaktorySettings;

pub const PASSWORD_ENV: &str = "FAKTORY_PASSWORD";
pub const SKIP_PASSWORD_ENV: &str = "FAKTORY_SKIP_PASSWORD";
pub const PASSWORD_FILENAME: &str = "password";

/// Resolves the server password: `FAKTORY_PASSWORD`, then `<config_dir>/password`,
/// then `[faktory] password` from the settings. Empty values count as unset.
///
/// Production refuses to boot without a password unless
/// `FAKTORY_SKIP_PASSWORD` is `yes` or `true`.
pub fn fetch_password(
    config_dir: &Path,
    environment: &str,
    settings: &FaktorySettings,
) -> Result<Option<String>> {
    resolve_password(
        std::env::var(PASSWORD_ENV).ok(),
        std::env::var(SKIP_PASSWORD_ENV).ok(),
        config_dir,
        environment,
        settings,
    )
}

fn resolve_password(
    from_env: Option<String>,
    skip: Option<String>,
    config_dir: &Path,
    environment: &str,
    settings: &FaktorySettings,
) -> Result<Option<String>> {
    let password = match non_empty(from_env) {
        Some(password) => Some(password),
        None => match read_password_file(config_dir)? {
            Some(password) => Some(password),
            None => non_empty(settings.faktory.password.clone()),
        },
    };

    if password.is_none() && environment == PRODUCTION_ENVIRONMENT {
        let skip = skip
            .map(|value| matches!(value.to_ascii_lowercase().as_str(), "yes" | "true"))
            .unwrap_or(false);
        if !skip {
            return Err(anyhow::anyhow!(
                "faktory requires a password in production; set {PASSWORD_ENV}, \
                 write {}/{PASSWORD_FILENAME}, or set {SKIP_PASSWORD_ENV}=yes",
                config_dir.display()
            ));
        }
        tracing::warn!("running in production without a password");
    }
    Ok(password)
}

fn read_password_file(config_dir: &Path) -> Result<Option<String>> {
    let path = config_dir.join(PASSWORD_FILENAME);
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(non_empty(Some(contents.trim_end().to_string()))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read password file {}", path.display()))
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with(password: Option<&str>) -> FaktorySettings {
        let mut settings = FaktorySettings::default();
        settings.faktory.password = password.map(str::to_string);
        settings
    }

    #[test]
    fn env_beats_file_beats_settings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PASSWORD_FILENAME), "from-file\n  \n").unwrap();
        let settings = settings_with(Some("from-settings"));

        let password = resolve_password(
            Some("from-env".into()),
            None,
            dir.path(),
            "development",
            &settings,
        )
        .unwrap();
        assert_eq!(password.as_deref(), Some("from-env"));

        let password = resolve_password(None, None, dir.path(), "development", &settings).unwrap();
        assert_eq!(password.as_deref(), Some("from-file"));

        let empty = tempfile::tempdir().unwrap();
        let password =
            resolve_password(Some(String::new()), None, empty.path(), "development", &settings)
                .unwrap();
        assert_eq!(password.as_deref(), Some("from-settings"));
    }

    #[test]
    fn development_allows_no_password() {
        let dir = tempfile::tempdir().unwrap();
        let password =
            resolve_password(None, None, dir.path(), "development", &settings_with(None)).unwrap();
        assert!(password.is_none());
    }

    #[test]
    fn production_requires_password_unless_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_with(None);
        let err = resolve_password(None, None, dir.path(), "production", &settings).unwrap_err();
        assert!(err.to_string().contains(PASSWORD_ENV));

        let password =
            resolve_password(None, Some("YES".into()), dir.path(), "production", &settings)
                .unwrap();
        assert!(password.is_none());

        assert!(
            resolve_password(None, Some("no".into()), dir.path(), "production", &settings).is_err()
        );
    }
}
