use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{KilnError, KilnResult};

/// epoll notification mode for one class of descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Re-notified while data remains.
    #[default]
    Level,
    /// Notified once per arrival; the handler must drain.
    Edge,
}

impl TriggerMode {
    pub fn is_edge(self) -> bool {
        self == TriggerMode::Edge
    }
}

/// Where socket I/O runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchModel {
    /// I/O on the event loop, request handling on workers.
    #[default]
    Proactor,
    /// I/O and request handling both on workers.
    Reactor,
}

impl DispatchModel {
    /// `0` is proactor, `1` is reactor.
    pub fn from_actor_model(model: u8) -> KilnResult<Self> {
        match model {
            0 => Ok(DispatchModel::Proactor),
            1 => Ok(DispatchModel::Reactor),
            other => Err(KilnError::Config(format!(
                "actor model must be 0 (proactor) or 1 (reactor), got {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "0" => Ok(LogFormat::Plain),
            "pretty" => Ok(LogFormat::Pretty),
            "json" | "1" => Ok(LogFormat::Json),
            other => Err(KilnError::Config(format!("unknown log format: {}", other))),
        }
    }
}

/// Server settings. Every field has a default, so a TOML file only needs
/// the keys it changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory files are served from.
    pub doc_root: PathBuf,
    pub listen_trigger: TriggerMode,
    pub conn_trigger: TriggerMode,
    /// Abortive close (`SO_LINGER` with a 1 second timeout) instead of a graceful one.
    pub opt_linger: bool,
    pub thread_num: usize,
    /// Work queue capacity.
    pub max_requests: usize,
    /// Connection slots; accepts past this get the busy reply.
    pub max_connections: usize,
    pub dispatch: DispatchModel,
    /// Seconds between idle sweeps. Connections idle for three slots are evicted.
    pub timeslot_secs: u64,
    /// Pin worker threads to cores.
    pub pin_workers: bool,
    pub store_pool_size: usize,
    /// Flat user file. `None` keeps credentials in memory only.
    pub users_file: Option<PathBuf>,
    pub close_log: bool,
    pub log_format: LogFormat,
    /// Append log lines to this file instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9006,
            doc_root: PathBuf::from("./root"),
            listen_trigger: TriggerMode::Level,
            conn_trigger: TriggerMode::Level,
            opt_linger: false,
            thread_num: num_cpus::get(),
            max_requests: 10_000,
            max_connections: 4096,
            dispatch: DispatchModel::Proactor,
            timeslot_secs: 5,
            pin_workers: false,
            store_pool_size: 8,
            users_file: None,
            close_log: false,
            log_format: LogFormat::Plain,
            log_file: None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> KilnResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| KilnError::Config(format!("invalid value for {}: {:?}", key, value)))
}

fn parse_flag(key: &str, value: &str) -> KilnResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(KilnError::Config(format!("invalid value for {}: {:?}", key, value))),
    }
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> KilnResult<Self> {
        toml::from_str(text).map_err(|e| KilnError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> KilnResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            KilnError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults overlaid with `KILN_*` environment variables (with .env support).
    pub fn from_env() -> KilnResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_vars(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values found through `var` (keyed by `KILN_*` names).
    pub fn apply_vars<F>(&mut self, var: F) -> KilnResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = var("KILN_HOST") {
            self.host = v;
        }
        if let Some(v) = var("KILN_PORT") {
            self.port = parse_var("KILN_PORT", &v)?;
        }
        if let Some(v) = var("KILN_ROOT") {
            self.doc_root = PathBuf::from(v);
        }
        if let Some(v) = var("KILN_TRIG_MODE") {
            self.set_trig_mode(parse_var("KILN_TRIG_MODE", &v)?)?;
        }
        if let Some(v) = var("KILN_OPT_LINGER") {
            self.opt_linger = parse_flag("KILN_OPT_LINGER", &v)?;
        }
        if let Some(v) = var("KILN_THREADS") {
            self.thread_num = parse_var("KILN_THREADS", &v)?;
        }
        if let Some(v) = var("KILN_MAX_REQUESTS") {
            self.max_requests = parse_var("KILN_MAX_REQUESTS", &v)?;
        }
        if let Some(v) = var("KILN_MAX_CONNECTIONS") {
            self.max_connections = parse_var("KILN_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = var("KILN_ACTOR_MODEL") {
            self.dispatch = DispatchModel::from_actor_model(parse_var("KILN_ACTOR_MODEL", &v)?)?;
        }
        if let Some(v) = var("KILN_TIMESLOT") {
            self.timeslot_secs = parse_var("KILN_TIMESLOT", &v)?;
        }
        if let Some(v) = var("KILN_PIN_WORKERS") {
            self.pin_workers = parse_flag("KILN_PIN_WORKERS", &v)?;
        }
        if let Some(v) = var("KILN_STORE_POOL_SIZE") {
            self.store_pool_size = parse_var("KILN_STORE_POOL_SIZE", &v)?;
        }
        if let Some(v) = var("KILN_USERS_FILE") {
            self.users_file = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = var("KILN_CLOSE_LOG") {
            self.close_log = parse_flag("KILN_CLOSE_LOG", &v)?;
        }
        if let Some(v) = var("KILN_LOG_FORMAT") {
            self.log_format = v.parse()?;
        }
        if let Some(v) = var("KILN_LOG_FILE") {
            self.log_file = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        Ok(())
    }

    /// Listener and connection trigger modes packed as one switch:
    /// 0 LT+LT, 1 LT+ET, 2 ET+LT, 3 ET+ET.
    pub fn set_trig_mode(&mut self, mode: u8) -> KilnResult<()> {
        let (listen, conn) = match mode {
            0 => (TriggerMode::Level, TriggerMode::Level),
            1 => (TriggerMode::Level, TriggerMode::Edge),
            2 => (TriggerMode::Edge, TriggerMode::Level),
            3 => (TriggerMode::Edge, TriggerMode::Edge),
            other => {
                return Err(KilnError::Config(format!(
                    "trigger mode must be 0..=3, got {}",
                    other
                )));
            }
        };
        self.listen_trigger = listen;
        self.conn_trigger = conn;
        Ok(())
    }

    /// A connection with no successful I/O for this long is evicted.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeslot_secs.saturating_mul(3))
    }

    pub fn validate(&self) -> KilnResult<()> {
        let positive = [
            ("thread_num", self.thread_num as u64),
            ("max_requests", self.max_requests as u64),
            ("max_connections", self.max_connections as u64),
            ("timeslot_secs", self.timeslot_secs),
            ("store_pool_size", self.store_pool_size as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(KilnError::Config(format!("{} must be at least 1", name)));
            }
        }
        if !self.doc_root.is_dir() {
            return Err(KilnError::Config(format!(
                "document root {} is not a directory",
                self.doc_root.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 9006);
        assert_eq!(config.dispatch, DispatchModel::Proactor);
        assert_eq!(config.idle_timeout(), Duration::from_secs(15));
        assert!(config.thread_num >= 1);
    }

    #[test]
    fn test_toml_overrides_only_given_keys() {
        let config = ServerConfig::from_toml_str(
            r#"
            port = 8080
            dispatch = "reactor"
            conn_trigger = "edge"
            users_file = "/var/lib/kiln/users"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.dispatch, DispatchModel::Reactor);
        assert_eq!(config.conn_trigger, TriggerMode::Edge);
        assert_eq!(config.listen_trigger, TriggerMode::Level);
        assert_eq!(config.users_file, Some(PathBuf::from("/var/lib/kiln/users")));
        assert_eq!(config.max_connections, 4096);

        assert!(ServerConfig::from_toml_str("bogus = 1").is_err());
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("KILN_PORT", "7000"),
            ("KILN_TRIG_MODE", "2"),
            ("KILN_ACTOR_MODEL", "1"),
            ("KILN_CLOSE_LOG", "true"),
            ("KILN_LOG_FORMAT", "json"),
            ("KILN_LOG_FILE", "/var/log/kiln/server.log"),
        ]
        .into_iter()
        .collect();

        let mut config = ServerConfig::default();
        config
            .apply_vars(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.listen_trigger, TriggerMode::Edge);
        assert_eq!(config.conn_trigger, TriggerMode::Level);
        assert_eq!(config.dispatch, DispatchModel::Reactor);
        assert!(config.close_log);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/kiln/server.log")));

        let mut config = ServerConfig::default();
        let err = config.apply_vars(|k| (k == "KILN_PORT").then(|| "high".to_string()));
        assert!(matches!(err, Err(KilnError::Config(_))));
    }

    #[test]
    fn test_trig_mode_table() {
        let mut config = ServerConfig::default();
        config.set_trig_mode(1).unwrap();
        assert_eq!(
            (config.listen_trigger, config.conn_trigger),
            (TriggerMode::Level, TriggerMode::Edge)
        );
        config.set_trig_mode(3).unwrap();
        assert!(config.listen_trigger.is_edge() && config.conn_trigger.is_edge());
        assert!(config.set_trig_mode(4).is_err());
    }

    #[test]
    fn test_validate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            doc_root: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        config.validate().unwrap();

        config.thread_num = 0;
        assert!(config.validate().is_err());

        config.thread_num = 2;
        config.doc_root = dir.path().join("missing");
        assert!(config.validate().is_err());
    }
}
