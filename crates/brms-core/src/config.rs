use serde::Deserialize;
use std::{env, path::Path, path::PathBuf};
use thiserror::Error;

use crate::rules::MatchMode;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub port: u16,
    pub env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Allowed CORS origins. Empty or `["*"]` allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    pub database: PathBuf,
    /// Append-only copy of the log stream.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub export_traces: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    #[serde(default)]
    pub match_mode: MatchMode,
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid APP_PORT override: {0}")]
    InvalidPort(std::num::ParseIntError),
    #[error("invalid MATCH_MODE override: {0}")]
    InvalidMatchMode(String),
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides()?;
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = env::var("APP_PORT") {
            self.app.port = port.parse().map_err(ConfigError::InvalidPort)?;
        }

        if let Ok(otlp) = env::var("OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(otlp);
        }

        if let Ok(database) = env::var("DATABASE_PATH") {
            self.paths.database = PathBuf::from(database);
        }

        if let Ok(log_file) = env::var("LOG_FILE") {
            self.paths.log_file = (!log_file.is_empty()).then(|| PathBuf::from(log_file));
        }

        if let Ok(mode) = env::var("MATCH_MODE") {
            self.engine.match_mode = mode
                .parse()
                .map_err(|_| ConfigError::InvalidMatchMode(mode.clone()))?;
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        for origin in &mut self.app.cors_origins {
            apply_env_marker(origin)?;
        }
        apply_env_marker_path(&mut self.paths.database)?;
        if let Some(log_file) = &mut self.paths.log_file {
            apply_env_marker_path(log_file)?;
        }
        if let Some(endpoint) = &mut self.telemetry.otlp_endpoint {
            apply_env_marker(endpoint)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        expand_tilde(&mut self.paths.database);
        if let Some(log_file) = &mut self.paths.log_file {
            expand_tilde(log_file);
        }
    }
}

fn expand_tilde(path: &mut PathBuf) {
    let value = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&value);
    *path = PathBuf::from(expanded.as_ref());
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::{fs, sync::Mutex};
    use tempfile::TempDir;

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const OVERRIDE_VARS: [&str; 5] = [
        "APP_PORT",
        "OTLP_ENDPOINT",
        "DATABASE_PATH",
        "LOG_FILE",
        "MATCH_MODE",
    ];

    fn write_config(contents: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("write config");
        (dir, path)
    }

    fn with_env(vars: &[(&str, Option<&str>)], f: impl FnOnce()) {
        let _guard = ENV_LOCK.lock().expect("lock env");
        let mut all: Vec<(&str, Option<&str>)> = OVERRIDE_VARS
            .iter()
            .filter(|name| !vars.iter().any(|(key, _)| key == *name))
            .map(|name| (*name, None))
            .collect();
        all.extend_from_slice(vars);

        let saved: Vec<(String, Option<String>)> = all
            .iter()
            .map(|(k, _)| (k.to_string(), env::var(k).ok()))
            .collect();

        for (key, value) in &all {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        f();

        for (key, value) in saved {
            match value {
                Some(v) => unsafe { env::set_var(&key, v) },
                None => unsafe { env::remove_var(&key) },
            }
        }
    }

    fn config_body(database_path: &str, extra: &str) -> String {
        format!(
            r#"
[app]
service_name = "brms"
port = 8080
env = "dev"
{extra}

[paths]
database = "{database_path}"

[telemetry]
otlp_endpoint = "http://localhost:4318"
export_traces = false
"#
        )
    }

    #[test]
    fn load_config_expands_tilde_and_resolves_env_markers() {
        let body = config_body("env:DB_FILE", r#"cors_origins = ["env:UI_ORIGIN"]"#);
        let (dir, path) = write_config(&body);
        let home_dir = dir.path().join("home");
        fs::create_dir_all(&home_dir).expect("create home dir");

        let expected_db = home_dir.join("data/brms.db");
        with_env(
            &[
                ("HOME", Some(home_dir.to_str().unwrap())),
                ("DB_FILE", Some("~/data/brms.db")),
                ("UI_ORIGIN", Some("http://localhost:5173")),
            ],
            || {
                let cfg = Config::load(&path).expect("config loads");
                assert_eq!(cfg.app.service_name, "brms");
                assert_eq!(cfg.app.port, 8080);
                assert_eq!(cfg.app.request_timeout_secs, 30);
                assert_eq!(cfg.app.cors_origins, vec!["http://localhost:5173"]);
                assert_eq!(cfg.paths.database, expected_db);
                assert_eq!(cfg.engine.match_mode, MatchMode::Compatible);
            },
        );
    }

    #[test]
    fn log_file_is_optional_and_expands_tilde() {
        let (_dir, path) = write_config(&config_body("/tmp/brms.db", ""));
        with_env(&[], || {
            let cfg = Config::load(&path).expect("config loads");
            assert_eq!(cfg.paths.log_file, None);
        });

        let body = config_body("/tmp/brms.db", "").replace(
            "[paths]\n",
            "[paths]\nlog_file = \"~/logs/server.log\"\n",
        );
        let (dir, path) = write_config(&body);
        let home_dir = dir.path().join("home");
        with_env(&[("HOME", Some(home_dir.to_str().unwrap()))], || {
            let cfg = Config::load(&path).expect("config loads");
            assert_eq!(cfg.paths.log_file, Some(home_dir.join("logs/server.log")));
        });

        with_env(&[("LOG_FILE", Some(""))], || {
            let cfg = Config::load(&path).expect("config loads");
            assert_eq!(cfg.paths.log_file, None);
        });
    }

    #[test]
    fn engine_section_selects_strict_mode() {
        let mut body = config_body("/tmp/brms.db", "");
        body.push_str("\n[engine]\nmatch_mode = \"strict\"\n");
        let (_dir, path) = write_config(&body);

        with_env(&[], || {
            let cfg = Config::load(&path).expect("config loads");
            assert_eq!(cfg.engine.match_mode, MatchMode::Strict);
        });
    }

    #[test]
    fn env_overrides_take_precedence() {
        let (_dir, path) = write_config(&config_body("/tmp/brms.db", ""));

        with_env(
            &[
                ("APP_PORT", Some("19000")),
                ("OTLP_ENDPOINT", Some("http://override.local:4318")),
                ("DATABASE_PATH", Some("/var/lib/brms/rules.db")),
                ("MATCH_MODE", Some("strict")),
            ],
            || {
                let cfg = Config::load(&path).expect("config loads");
                assert_eq!(cfg.app.port, 19000);
                assert_eq!(
                    cfg.telemetry.otlp_endpoint.as_deref(),
                    Some("http://override.local:4318")
                );
                assert_eq!(cfg.paths.database, PathBuf::from("/var/lib/brms/rules.db"));
                assert_eq!(cfg.engine.match_mode, MatchMode::Strict);
            },
        );
    }

    #[test]
    fn env_marker_without_variable_errors() {
        let (_dir, path) = write_config(&config_body("env:BRMS_MISSING_DB", ""));

        with_env(&[("BRMS_MISSING_DB", None)], || {
            let err = Config::load(&path).expect_err("missing env var should error");
            match err {
                ConfigError::MissingEnvVar(name) => assert_eq!(name, "BRMS_MISSING_DB"),
                other => panic!("unexpected error: {other}"),
            }
        });
    }

    #[test]
    fn invalid_overrides_are_reported() {
        let (_dir, path) = write_config(&config_body("/tmp/brms.db", ""));

        with_env(&[("APP_PORT", Some("not-a-number"))], || {
            let err = Config::load(&path).expect_err("invalid port should error");
            assert!(matches!(err, ConfigError::InvalidPort(_)));
        });

        with_env(&[("MATCH_MODE", Some("lenient"))], || {
            let err = Config::load(&path).expect_err("invalid mode should error");
            assert!(matches!(err, ConfigError::InvalidMatchMode(mode) if mode == "lenient"));
        });
    }
}
