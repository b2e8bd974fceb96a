use std::{
    env, fmt, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;

pub const PROJECT_CONFIG_FILENAME: &str = "pgrr.toml";
const HOME_CONFIG_DIR: &str = ".pgrr";
const HOME_CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub capture: CaptureConfig,
    pub replay: ReplayConfig,
    pub logging: Option<LoggingConfig>,
    #[serde(skip)]
    source_path: Option<PathBuf>,
}

impl Config {
    /// Loads the config from `explicit` if given, otherwise from
    /// `./pgrr.toml`, then `~/.pgrr/config.toml`, then built-in defaults.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::from_path(path)
                .with_context(|| format!("load config from --config {}", path.display()));
        }

        let project = Path::new(PROJECT_CONFIG_FILENAME);
        if project.is_file() {
            return Self::from_path(project)
                .with_context(|| format!("load config from project ./{PROJECT_CONFIG_FILENAME}"));
        }

        if let Some(home) = home_config_path() {
            if home.is_file() {
                return Self::from_path(&home)
                    .with_context(|| format!("load config from home {}", home.display()));
            }
        }

        Ok(Self::default())
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let mut config = Self::from_toml_str(&toml)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.capture.chunk_size == 0 {
            bail!("`capture.chunk_size` must be greater than zero");
        }
        validate_speed(self.replay.speed)?;
        if self.replay.sync_timeout_ms == 0 {
            bail!("`replay.sync_timeout_ms` must be greater than zero");
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

fn home_config_path() -> Option<PathBuf> {
    let home = env::var_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(HOME_CONFIG_DIR)
            .join(HOME_CONFIG_FILENAME),
    )
}

/// Speed multipliers scale the captured timeline and must be finite and
/// strictly positive.
pub fn validate_speed(speed: f64) -> anyhow::Result<()> {
    if !speed.is_finite() || speed <= 0.0 {
        bail!("speed multiplier must be a finite number greater than zero, got {speed}");
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    pub listen: SocketAddr,
    pub backend: BackendAddr,
    pub log_path: PathBuf,
    pub chunk_size: usize,
    pub shutdown_grace_ms: u64,
    pub check_backend: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 5433)),
            backend: BackendAddr::new("127.0.0.1", 5432),
            log_path: PathBuf::from("queries.jsonl"),
            chunk_size: 4096,
            shutdown_grace_ms: 2000,
            check_backend: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayConfig {
    pub capture_log: PathBuf,
    pub replay_log_path: PathBuf,
    pub target_host: String,
    pub target_port: u16,
    pub speed: f64,
    pub peer_port: Option<u16>,
    /// How long a session waits for the server after a send before giving up.
    pub sync_timeout_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capture_log: PathBuf::from("queries.jsonl"),
            replay_log_path: PathBuf::from("replay.jsonl"),
            target_host: "127.0.0.1".to_owned(),
            target_port: 5432,
            speed: 1.0,
            peer_port: None,
            sync_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// `host:port` of the database the capture proxy forwards to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct BackendAddr {
    pub host: String,
    pub port: u16,
}

impl BackendAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for BackendAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((host, port)) = s.trim().rsplit_once(':') else {
            bail!("backend address `{s}` must be `host:port`");
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            bail!("backend address `{s}` is missing a host");
        }
        let port = port
            .parse::<u16>()
            .with_context(|| format!("backend address `{s}` has an invalid port"))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for BackendAddr {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
